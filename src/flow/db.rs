use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use flow_common::{
    Stage, StageCategory, StageCurrent, StageId, Transition, TransitionId, TransitionSource,
    WorkItem, WorkItemId, WorkItemType,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Async-safe handle to the flow database.
///
/// `FlowDb` lives behind `Arc<Mutex>`; every access is a closure executed on
/// tokio's blocking pool so SQLite I/O never stalls async workers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run `f` against the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FlowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Lock the database from synchronous code (CLI commands, tests).
    /// Never call this from an async request path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FlowDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A stage definition before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStage {
    pub name: String,
    pub order: i32,
    pub category: StageCategory,
    pub wip_limit: Option<u32>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
}

/// A transition about to be appended.
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub work_item_id: WorkItemId,
    pub from_stage_id: Option<StageId>,
    pub to_stage_id: StageId,
    pub timestamp: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub source: TransitionSource,
    pub timestamp_clamped: bool,
}

/// One row of the log as seen by metric folds.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub transition: Transition,
    /// Effective timestamp of the item's previous transition.
    pub previous_entered_at: Option<DateTime<Utc>>,
    pub item_created_at: DateTime<Utc>,
    /// True when this is the item's first arrival in a `done` stage.
    pub first_terminal_entry: bool,
}

pub struct FlowDb {
    conn: Connection,
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {} out of range", micros).into(),
        )
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = flow_common::ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Busy timeout applied when a file database is opened.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const STAGE_COLUMNS: &str = "id, name, stage_order, category, wip_limit, description";

fn stage_from_row(row: &Row<'_>) -> rusqlite::Result<Stage> {
    Ok(Stage {
        id: row.get(0)?,
        name: row.get(1)?,
        order: row.get(2)?,
        category: parse_column(row, 3)?,
        wip_limit: row.get(4)?,
        description: row.get(5)?,
    })
}

const TRANSITION_COLUMNS: &str = "t.id, t.work_item_id, t.from_stage_id, t.to_stage_id, \
     t.timestamp, t.observed_at, t.source, t.timestamp_clamped";

fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<Transition> {
    Ok(Transition {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        from_stage_id: row.get(2)?,
        to_stage_id: row.get(3)?,
        timestamp: from_micros(4, row.get(4)?)?,
        observed_at: from_micros(5, row.get(5)?)?,
        source: parse_column(row, 6)?,
        timestamp_clamped: row.get(7)?,
    })
}

const WORK_ITEM_COLUMNS: &str = "w.id, w.title, w.item_type, w.created_at, w.updated_at, \
     c.stage_id, c.entered_at";

fn work_item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        title: row.get(1)?,
        item_type: parse_column::<WorkItemType>(row, 2)?,
        created_at: from_micros(3, row.get(3)?)?,
        updated_at: from_micros(4, row.get(4)?)?,
        current_stage_id: row.get(5)?,
        stage_entered_at: from_micros(6, row.get(6)?)?,
    })
}

fn stage_current_from_row(row: &Row<'_>) -> rusqlite::Result<StageCurrent> {
    Ok(StageCurrent {
        work_item_id: row.get(0)?,
        stage_id: row.get(1)?,
        entered_at: from_micros(2, row.get(2)?)?,
        last_transition_id: row.get(3)?,
    })
}

impl FlowDb {
    /// Open (or create) the database file and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .busy_timeout(timeout)
            .context("Failed to set busy timeout")
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    stage_order INTEGER NOT NULL UNIQUE,
                    category TEXT NOT NULL CHECK (category IN ('wait', 'active', 'done')),
                    wip_limit INTEGER CHECK (wip_limit IS NULL OR wip_limit >= 0),
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS work_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    item_type TEXT NOT NULL CHECK (item_type IN ('feature', 'bug', 'task', 'epic')),
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS transitions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    work_item_id INTEGER NOT NULL REFERENCES work_items(id),
                    from_stage_id INTEGER REFERENCES stages(id),
                    to_stage_id INTEGER NOT NULL REFERENCES stages(id),
                    timestamp INTEGER NOT NULL,
                    observed_at INTEGER NOT NULL,
                    source TEXT NOT NULL CHECK (source IN ('api', 'webhook', 'sync')),
                    timestamp_clamped INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(work_item_id, timestamp)
                );

                CREATE TABLE IF NOT EXISTS stage_current (
                    work_item_id INTEGER PRIMARY KEY REFERENCES work_items(id),
                    stage_id INTEGER NOT NULL REFERENCES stages(id),
                    entered_at INTEGER NOT NULL,
                    last_transition_id INTEGER NOT NULL REFERENCES transitions(id)
                );

                CREATE TABLE IF NOT EXISTS card_bindings (
                    board_id TEXT NOT NULL,
                    card_id TEXT NOT NULL,
                    work_item_id INTEGER NOT NULL REFERENCES work_items(id),
                    PRIMARY KEY (board_id, card_id)
                );

                CREATE INDEX IF NOT EXISTS idx_transitions_timestamp ON transitions(timestamp);
                CREATE INDEX IF NOT EXISTS idx_transitions_to_stage ON transitions(to_stage_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_stage_current_stage ON stage_current(stage_id);
                ",
            )
            .context("Failed to run flow schema migration")?;
        Ok(())
    }

    /// Cheap round trip used by the readiness probe.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Database ping failed")?;
        Ok(())
    }

    /// Run `f` inside a transaction. An error from `f` rolls everything back.
    pub fn with_transaction<R>(&self, f: impl FnOnce(&FlowDb) -> Result<R>) -> Result<R> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let out = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    // ── Stages ────────────────────────────────────────────────────────

    pub fn list_stages(&self) -> Result<Vec<Stage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM stages ORDER BY stage_order",
                STAGE_COLUMNS
            ))
            .context("Failed to prepare list_stages")?;
        let rows = stmt
            .query_map([], stage_from_row)
            .context("Failed to query stages")?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("Failed to read stage row")?);
        }
        Ok(stages)
    }

    pub fn get_stage_by_name(&self, name: &str) -> Result<Option<Stage>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM stages WHERE name = ?1", STAGE_COLUMNS),
                params![name],
                stage_from_row,
            )
            .optional()
            .context("Failed to query stage by name")
    }

    pub fn insert_stage(&self, stage: &NewStage) -> Result<Stage> {
        self.conn
            .execute(
                "INSERT INTO stages (name, stage_order, category, wip_limit, description)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stage.name,
                    stage.order,
                    stage.category.as_str(),
                    stage.wip_limit,
                    stage.description
                ],
            )
            .with_context(|| format!("Failed to insert stage '{}'", stage.name))?;
        let id = self.conn.last_insert_rowid();
        Ok(Stage {
            id,
            name: stage.name.clone(),
            order: stage.order,
            category: stage.category,
            wip_limit: stage.wip_limit,
            description: stage.description.clone(),
        })
    }

    /// Insert a stage, or update the one with the same name when `update` is set.
    pub fn upsert_stage(&self, stage: &NewStage, update: bool) -> Result<UpsertOutcome> {
        match self.get_stage_by_name(&stage.name)? {
            None => {
                self.insert_stage(stage)?;
                Ok(UpsertOutcome::Created)
            }
            Some(_) if !update => Ok(UpsertOutcome::Skipped),
            Some(existing) => {
                self.conn
                    .execute(
                        "UPDATE stages SET stage_order = ?1, category = ?2, wip_limit = ?3,
                         description = ?4 WHERE id = ?5",
                        params![
                            stage.order,
                            stage.category.as_str(),
                            stage.wip_limit,
                            stage.description,
                            existing.id
                        ],
                    )
                    .with_context(|| format!("Failed to update stage '{}'", stage.name))?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    // ── Work items ────────────────────────────────────────────────────

    pub fn insert_work_item(
        &self,
        title: &str,
        item_type: WorkItemType,
        created_at: DateTime<Utc>,
    ) -> Result<WorkItemId> {
        self.conn
            .execute(
                "INSERT INTO work_items (title, item_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![title, item_type.as_str(), to_micros(created_at)],
            )
            .context("Failed to insert work item")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM work_items w
                     JOIN stage_current c ON c.work_item_id = w.id
                     WHERE w.id = ?1",
                    WORK_ITEM_COLUMNS
                ),
                params![id],
                work_item_from_row,
            )
            .optional()
            .context("Failed to query work item")
    }

    pub fn list_in_stage(&self, stage_id: StageId) -> Result<Vec<WorkItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM work_items w
                 JOIN stage_current c ON c.work_item_id = w.id
                 WHERE c.stage_id = ?1
                 ORDER BY c.entered_at, w.id",
                WORK_ITEM_COLUMNS
            ))
            .context("Failed to prepare list_in_stage")?;
        let rows = stmt
            .query_map(params![stage_id], work_item_from_row)
            .context("Failed to query work items in stage")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read work item row")?);
        }
        Ok(items)
    }

    pub fn count_in_stage(&self, stage_id: StageId) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stage_current WHERE stage_id = ?1",
                params![stage_id],
                |row| row.get(0),
            )
            .context("Failed to count work items in stage")
    }

    /// Current WIP of every stage that holds at least one item.
    pub fn stage_counts(&self) -> Result<HashMap<StageId, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT stage_id, COUNT(*) FROM stage_current GROUP BY stage_id")
            .context("Failed to prepare stage_counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, StageId>(0)?, row.get::<_, u64>(1)?)))
            .context("Failed to query stage counts")?;
        let mut counts = HashMap::new();
        for row in rows {
            let (stage_id, count) = row.context("Failed to read stage count row")?;
            counts.insert(stage_id, count);
        }
        Ok(counts)
    }

    pub fn count_work_items(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM work_items", [], |row| row.get(0))
            .context("Failed to count work items")
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Append a transition and move the projection with it.
    ///
    /// Rejects a timestamp that is not strictly after the item's latest one.
    /// Runs inside the caller's transaction when one is open, otherwise in
    /// its own.
    pub fn append_transition(&self, new: &NewTransition) -> Result<Transition> {
        if self.conn.is_autocommit() {
            return self.with_transaction(|db| db.append_transition(new));
        }

        if let Some(last) = self.last_transition(new.work_item_id)? {
            if new.timestamp <= last.timestamp {
                bail!(
                    "Non-monotonic timestamp for work item {}: {} is not after {}",
                    new.work_item_id,
                    new.timestamp,
                    last.timestamp
                );
            }
        }

        let ts = to_micros(new.timestamp);
        self.conn
            .execute(
                "INSERT INTO transitions
                 (work_item_id, from_stage_id, to_stage_id, timestamp, observed_at, source, timestamp_clamped)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.work_item_id,
                    new.from_stage_id,
                    new.to_stage_id,
                    ts,
                    to_micros(new.observed_at),
                    new.source.as_str(),
                    new.timestamp_clamped
                ],
            )
            .context("Failed to insert transition")?;
        let id = self.conn.last_insert_rowid();

        self.conn
            .execute(
                "INSERT INTO stage_current (work_item_id, stage_id, entered_at, last_transition_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(work_item_id) DO UPDATE SET
                    stage_id = excluded.stage_id,
                    entered_at = excluded.entered_at,
                    last_transition_id = excluded.last_transition_id",
                params![new.work_item_id, new.to_stage_id, ts, id],
            )
            .context("Failed to update stage projection")?;

        self.conn
            .execute(
                "UPDATE work_items SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
                params![ts, new.work_item_id],
            )
            .context("Failed to touch work item")?;

        Ok(Transition {
            id,
            work_item_id: new.work_item_id,
            from_stage_id: new.from_stage_id,
            to_stage_id: new.to_stage_id,
            timestamp: new.timestamp,
            observed_at: new.observed_at,
            source: new.source,
            timestamp_clamped: new.timestamp_clamped,
        })
    }

    pub fn last_transition(&self, work_item_id: WorkItemId) -> Result<Option<Transition>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM transitions t WHERE t.work_item_id = ?1
                     ORDER BY t.timestamp DESC LIMIT 1",
                    TRANSITION_COLUMNS
                ),
                params![work_item_id],
                transition_from_row,
            )
            .optional()
            .context("Failed to query last transition")
    }

    /// Full history of one item, oldest first.
    pub fn history(&self, work_item_id: WorkItemId) -> Result<Vec<Transition>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM transitions t WHERE t.work_item_id = ?1
                 ORDER BY t.timestamp, t.id",
                TRANSITION_COLUMNS
            ))
            .context("Failed to prepare history")?;
        let rows = stmt
            .query_map(params![work_item_id], transition_from_row)
            .context("Failed to query history")?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.context("Failed to read transition row")?);
        }
        Ok(history)
    }

    /// Stream every transition with `min_ts <= timestamp < until`, ordered by
    /// timestamp, to `visit`. Rows are read one at a time.
    pub fn for_each_since<F>(
        &self,
        min_ts: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(LogEntry) -> Result<()>,
    {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {},
                    (SELECT p.timestamp FROM transitions p
                      WHERE p.work_item_id = t.work_item_id AND p.timestamp < t.timestamp
                      ORDER BY p.timestamp DESC LIMIT 1),
                    w.created_at,
                    (s.category = 'done' AND NOT EXISTS (
                        SELECT 1 FROM transitions e JOIN stages es ON es.id = e.to_stage_id
                         WHERE e.work_item_id = t.work_item_id
                           AND e.timestamp < t.timestamp
                           AND es.category = 'done'))
                 FROM transitions t
                 JOIN work_items w ON w.id = t.work_item_id
                 JOIN stages s ON s.id = t.to_stage_id
                 WHERE t.timestamp >= ?1 AND t.timestamp < ?2
                 ORDER BY t.timestamp, t.id",
                TRANSITION_COLUMNS
            ))
            .context("Failed to prepare log scan")?;
        let until = until.map(to_micros).unwrap_or(i64::MAX);
        let mut rows = stmt
            .query(params![to_micros(min_ts), until])
            .context("Failed to scan transition log")?;
        while let Some(row) = rows.next().context("Failed to read log row")? {
            let previous: Option<i64> = row.get(8)?;
            let entry = LogEntry {
                transition: transition_from_row(row)?,
                previous_entered_at: previous.map(|p| from_micros(8, p)).transpose()?,
                item_created_at: from_micros(9, row.get(9)?)?,
                first_terminal_entry: row.get(10)?,
            };
            visit(entry)?;
        }
        Ok(())
    }

    /// Collecting form of [`FlowDb::for_each_since`].
    pub fn since(&self, min_ts: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        self.for_each_since(min_ts, None, |entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    /// Transitions into `stage_id` with `t0 <= timestamp < t1`.
    pub fn count_completed_between(
        &self,
        stage_id: StageId,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM transitions
                 WHERE to_stage_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![stage_id, to_micros(t0), to_micros(t1)],
                |row| row.get(0),
            )
            .context("Failed to count completed transitions")
    }

    pub fn max_transition_id(&self) -> Result<TransitionId> {
        self.conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM transitions", [], |row| {
                row.get(0)
            })
            .context("Failed to query latest transition id")
    }

    /// Whether the item has ever entered a `done` stage.
    pub fn has_entered_done(&self, work_item_id: WorkItemId) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM transitions t JOIN stages s ON s.id = t.to_stage_id
                     WHERE t.work_item_id = ?1 AND s.category = 'done')",
                params![work_item_id],
                |row| row.get(0),
            )
            .context("Failed to query terminal entries")
    }

    pub fn item_created_at(&self, work_item_id: WorkItemId) -> Result<Option<DateTime<Utc>>> {
        let micros: Option<i64> = self
            .conn
            .query_row(
                "SELECT created_at FROM work_items WHERE id = ?1",
                params![work_item_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query work item creation time")?;
        micros
            .map(|m| from_micros(0, m).context("Invalid creation timestamp"))
            .transpose()
    }

    /// Items whose latest transition before `t` put them in a non-`done` stage.
    pub fn open_items_before(&self, t: DateTime<Utc>) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM transitions t JOIN stages s ON s.id = t.to_stage_id
                 WHERE s.category != 'done'
                   AND t.timestamp = (SELECT MAX(x.timestamp) FROM transitions x
                                       WHERE x.work_item_id = t.work_item_id
                                         AND x.timestamp < ?1)",
                params![to_micros(t)],
                |row| row.get(0),
            )
            .context("Failed to count open items")
    }

    // ── Projection ────────────────────────────────────────────────────

    pub fn stage_current(&self, work_item_id: WorkItemId) -> Result<Option<StageCurrent>> {
        self.conn
            .query_row(
                "SELECT work_item_id, stage_id, entered_at, last_transition_id
                 FROM stage_current WHERE work_item_id = ?1",
                params![work_item_id],
                stage_current_from_row,
            )
            .optional()
            .context("Failed to query stage projection")
    }

    /// The stored projection, ordered by work item id.
    pub fn projection(&self) -> Result<Vec<StageCurrent>> {
        self.collect_projection(
            "SELECT work_item_id, stage_id, entered_at, last_transition_id
             FROM stage_current ORDER BY work_item_id",
        )
    }

    /// The projection recomputed from the log, ordered by work item id.
    pub fn rebuild_projection(&self) -> Result<Vec<StageCurrent>> {
        self.collect_projection(
            "SELECT t.work_item_id, t.to_stage_id, t.timestamp, t.id FROM transitions t
             WHERE t.timestamp = (SELECT MAX(x.timestamp) FROM transitions x
                                   WHERE x.work_item_id = t.work_item_id)
             ORDER BY t.work_item_id",
        )
    }

    fn collect_projection(&self, sql: &str) -> Result<Vec<StageCurrent>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare projection query")?;
        let rows = stmt
            .query_map([], stage_current_from_row)
            .context("Failed to query projection")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read projection row")?);
        }
        Ok(out)
    }

    /// Overwrite the stored projection with `rows`.
    pub fn replace_projection(&self, rows: &[StageCurrent]) -> Result<()> {
        self.with_transaction(|db| {
            db.conn
                .execute("DELETE FROM stage_current", [])
                .context("Failed to clear stage projection")?;
            let mut stmt = db
                .conn
                .prepare(
                    "INSERT INTO stage_current (work_item_id, stage_id, entered_at, last_transition_id)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("Failed to prepare projection insert")?;
            for row in rows {
                stmt.execute(params![
                    row.work_item_id,
                    row.stage_id,
                    to_micros(row.entered_at),
                    row.last_transition_id
                ])
                .context("Failed to insert projection row")?;
            }
            Ok(())
        })
    }

    // ── Card bindings ─────────────────────────────────────────────────

    pub fn bind_card(&self, board_id: &str, card_id: &str, work_item_id: WorkItemId) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO card_bindings (board_id, card_id, work_item_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(board_id, card_id) DO UPDATE SET work_item_id = excluded.work_item_id",
                params![board_id, card_id, work_item_id],
            )
            .context("Failed to bind card")?;
        Ok(())
    }

    pub fn resolve_card(&self, board_id: &str, card_id: &str) -> Result<Option<WorkItemId>> {
        self.conn
            .query_row(
                "SELECT work_item_id FROM card_bindings WHERE board_id = ?1 AND card_id = ?2",
                params![board_id, card_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to resolve card binding")
    }
}
