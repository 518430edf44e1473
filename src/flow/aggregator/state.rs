//! Pure aggregate state. Owned by the aggregator task; also folded directly
//! from the log by the query facade for windows outside retention.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use flow_common::{StageCategory, StageId, TransitionId, WorkItemId};
use serde::Serialize;

use crate::flow::db::LogEntry;

/// What the engine tells the aggregator after a committed append.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub transition_id: TransitionId,
    pub work_item_id: WorkItemId,
    pub from: Option<StageId>,
    pub to: StageId,
    pub timestamp: DateTime<Utc>,
    pub previous_entered_at: Option<DateTime<Utc>>,
    pub item_created_at: DateTime<Utc>,
    pub first_terminal_entry: bool,
}

impl From<&LogEntry> for TransitionEvent {
    fn from(entry: &LogEntry) -> Self {
        Self {
            transition_id: entry.transition.id,
            work_item_id: entry.transition.work_item_id,
            from: entry.transition.from_stage_id,
            to: entry.transition.to_stage_id,
            timestamp: entry.transition.timestamp,
            previous_entered_at: entry.previous_entered_at,
            item_created_at: entry.item_created_at,
            first_terminal_entry: entry.first_terminal_entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    at: DateTime<Utc>,
    seconds: f64,
}

/// Time-stamped samples, pruned by age.
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: VecDeque<Sample>,
}

impl SampleWindow {
    pub fn push(&mut self, at: DateTime<Utc>, seconds: f64) {
        let sample = Sample { at, seconds };
        // Cross-item commits may land slightly out of order.
        let pos = self.samples.partition_point(|s| s.at <= at);
        self.samples.insert(pos, sample);
    }

    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.seconds).collect()
    }

    /// Values captured in `[start, end)`.
    pub fn values_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|s| s.at >= start && s.at < end)
            .map(|s| s.seconds)
            .collect()
    }
}

/// Nearest-rank percentile over unsorted values; `q` in (0, 1].
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Step function of the number of items outside `done` stages.
///
/// Stored as a baseline level plus sorted deltas so late inserts stay correct.
#[derive(Debug, Clone, Default)]
pub struct WipTimeline {
    baseline: i64,
    deltas: VecDeque<(DateTime<Utc>, i64)>,
}

impl WipTimeline {
    pub fn with_baseline(baseline: i64) -> Self {
        Self {
            baseline,
            deltas: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, delta: i64) {
        if delta == 0 {
            return;
        }
        let pos = self.deltas.partition_point(|(t, _)| *t <= at);
        self.deltas.insert(pos, (at, delta));
    }

    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(t, d)) = self.deltas.front() {
            if t >= cutoff {
                break;
            }
            self.baseline += d;
            self.deltas.pop_front();
        }
    }

    pub fn level_at(&self, t: DateTime<Utc>) -> i64 {
        self.baseline
            + self
                .deltas
                .iter()
                .take_while(|(at, _)| *at <= t)
                .map(|(_, d)| d)
                .sum::<i64>()
    }

    pub fn current(&self) -> i64 {
        self.baseline + self.deltas.iter().map(|(_, d)| d).sum::<i64>()
    }

    /// Time-weighted mean level over `[start, end]`.
    pub fn average(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        if end <= start {
            return self.level_at(start) as f64;
        }
        let mut level = self.level_at(start);
        let mut cursor = start;
        let mut area = 0.0;
        for &(t, d) in self.deltas.iter().filter(|(t, _)| *t > start && *t < end) {
            area += level as f64 * seconds_between(cursor, t);
            cursor = t;
            level += d;
        }
        area += level as f64 * seconds_between(cursor, end);
        area / seconds_between(start, end)
    }
}

pub fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

/// Point answer for a metrics query.
///
/// With a stage, throughput and lead time count only entries into that
/// stage, so they are zero or empty for non-`done` stages. `avg_wip` is
/// always board-wide.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub stage: Option<String>,
    pub throughput: u64,
    pub avg_wip: f64,
    pub cycle_p50: Option<f64>,
    pub cycle_p85: Option<f64>,
    pub cycle_p95: Option<f64>,
    pub cycle_avg: Option<f64>,
    pub lead_avg: Option<f64>,
    pub throughput_by_day: BTreeMap<NaiveDate, u64>,
    /// `"aggregator"` or `"log"`.
    pub source: &'static str,
}

/// Everything the aggregator maintains.
#[derive(Debug, Clone)]
pub struct FlowState {
    window: Duration,
    pub(crate) wip: HashMap<StageId, i64>,
    /// Entries into `done` stages, ordered by time.
    done_entries: VecDeque<(DateTime<Utc>, StageId)>,
    pub(crate) cycle: HashMap<StageId, SampleWindow>,
    /// Lead samples keyed by the `done` stage first entered.
    pub(crate) lead: HashMap<StageId, SampleWindow>,
    pub(crate) timeline: WipTimeline,
    /// Transitions at or below this id are already covered by a rebuild.
    pub(crate) watermark: TransitionId,
}

impl FlowState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            wip: HashMap::new(),
            done_entries: VecDeque::new(),
            cycle: HashMap::new(),
            lead: HashMap::new(),
            timeline: WipTimeline::default(),
            watermark: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Fresh state replaying `events` (timestamp order) on top of a known
    /// open-item baseline. Per-stage WIP comes from the projection.
    pub fn rebuilt<F>(
        window: Duration,
        baseline_open: i64,
        events: &[TransitionEvent],
        wip: HashMap<StageId, u64>,
        watermark: TransitionId,
        category_of: F,
    ) -> Self
    where
        F: Fn(StageId) -> Option<StageCategory>,
    {
        let mut state = Self::new(window);
        state.timeline = WipTimeline::with_baseline(baseline_open);
        for event in events {
            state.fold(event, &category_of);
        }
        state.set_wip(wip);
        state.watermark = watermark;
        state
    }

    /// Retention cutoff relative to `now`. Never shorter than one day so the
    /// sliding throughput stays answerable. Saturates at the earliest
    /// representable time for windows that reach past it.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window.max(Duration::days(1)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Fold one live event unless a rebuild already covered it.
    pub fn apply<F>(&mut self, event: &TransitionEvent, category_of: F) -> bool
    where
        F: Fn(StageId) -> Option<StageCategory>,
    {
        if event.transition_id <= self.watermark {
            return false;
        }
        self.fold(event, category_of);
        true
    }

    /// Fold one event unconditionally. `category_of` resolves stage
    /// categories; unknown stages are treated as non-terminal.
    pub fn fold<F>(&mut self, event: &TransitionEvent, category_of: F)
    where
        F: Fn(StageId) -> Option<StageCategory>,
    {
        let is_done = |id: StageId| category_of(id).is_some_and(|c| c.is_terminal());

        if let Some(from) = event.from {
            if let Some(entered) = event.previous_entered_at {
                let seconds = seconds_between(entered, event.timestamp).max(0.0);
                self.cycle
                    .entry(from)
                    .or_default()
                    .push(event.timestamp, seconds);
            }
            let count = self.wip.entry(from).or_insert(0);
            *count = (*count - 1).max(0);
        }
        *self.wip.entry(event.to).or_insert(0) += 1;

        let was_open = event.from.map(|f| !is_done(f));
        let now_open = !is_done(event.to);
        let delta = match (was_open, now_open) {
            (None, true) => 1,
            (Some(true), false) => -1,
            (Some(false), true) => 1,
            _ => 0,
        };
        self.timeline.record(event.timestamp, delta);

        if !now_open {
            let pos = self
                .done_entries
                .partition_point(|(t, _)| *t <= event.timestamp);
            self.done_entries.insert(pos, (event.timestamp, event.to));
            if event.first_terminal_entry {
                let lead = seconds_between(event.item_created_at, event.timestamp).max(0.0);
                self.lead
                    .entry(event.to)
                    .or_default()
                    .push(event.timestamp, lead);
            }
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        while self.done_entries.front().is_some_and(|(t, _)| *t < cutoff) {
            self.done_entries.pop_front();
        }
        for window in self.cycle.values_mut() {
            window.prune(cutoff);
        }
        for window in self.lead.values_mut() {
            window.prune(cutoff);
        }
        self.timeline.prune(cutoff);
    }

    /// Replace per-stage WIP with authoritative counts.
    pub fn set_wip(&mut self, counts: HashMap<StageId, u64>) {
        self.wip = counts.into_iter().map(|(k, v)| (k, v as i64)).collect();
    }

    pub fn wip_of(&self, stage: StageId) -> i64 {
        self.wip.get(&stage).copied().unwrap_or(0)
    }

    /// Entries into `done` stages in `[start, end)`, optionally for one stage.
    pub fn completions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<StageId>,
    ) -> u64 {
        self.done_entries
            .iter()
            .filter(|(t, s)| *t >= start && *t < end && stage.is_none_or(|id| id == *s))
            .count() as u64
    }

    /// Sliding 24-hour throughput ending at `now`.
    pub fn throughput_per_day(&self, now: DateTime<Utc>, stage: Option<StageId>) -> u64 {
        self.completions_between(now - Duration::days(1), now + Duration::microseconds(1), stage)
    }

    fn throughput_by_day(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<StageId>,
    ) -> BTreeMap<NaiveDate, u64> {
        let mut days = BTreeMap::new();
        let entries = self
            .done_entries
            .iter()
            .filter(|(t, s)| *t >= start && *t < end && stage.is_none_or(|id| id == *s));
        for (t, _) in entries {
            *days.entry(t.date_naive()).or_insert(0) += 1;
        }
        days
    }

    fn lead_values(&self, start: DateTime<Utc>, end: DateTime<Utc>, stage: Option<StageId>) -> Vec<f64> {
        match stage {
            Some(id) => self
                .lead
                .get(&id)
                .map(|w| w.values_between(start, end))
                .unwrap_or_default(),
            None => self
                .lead
                .values()
                .flat_map(|w| w.values_between(start, end))
                .collect(),
        }
    }

    fn cycle_values(&self, start: DateTime<Utc>, end: DateTime<Utc>, stage: Option<StageId>) -> Vec<f64> {
        match stage {
            Some(id) => self
                .cycle
                .get(&id)
                .map(|w| w.values_between(start, end))
                .unwrap_or_default(),
            None => self
                .cycle
                .values()
                .flat_map(|w| w.values_between(start, end))
                .collect(),
        }
    }

    /// Answer a windowed query from the retained state.
    pub fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<(StageId, String)>,
        source: &'static str,
    ) -> FlowMetrics {
        let stage_id = stage.as_ref().map(|(id, _)| *id);
        let cycles = self.cycle_values(start, end, stage_id);
        let leads = self.lead_values(start, end, stage_id);
        FlowMetrics {
            window_start: start,
            window_end: end,
            stage: stage.map(|(_, name)| name),
            throughput: self.completions_between(start, end, stage_id),
            avg_wip: self.timeline.average(start, end),
            cycle_p50: percentile(&cycles, 0.50),
            cycle_p85: percentile(&cycles, 0.85),
            cycle_p95: percentile(&cycles, 0.95),
            cycle_avg: mean(&cycles),
            lead_avg: mean(&leads),
            throughput_by_day: self.throughput_by_day(start, end, stage_id),
            source,
        }
    }

    pub fn cycle_samples(&self, stage: StageId) -> Vec<f64> {
        self.cycle.get(&stage).map(|w| w.values()).unwrap_or_default()
    }

    pub fn lead_samples(&self) -> Vec<f64> {
        let mut samples: Vec<f64> = self.lead.values().flat_map(|w| w.values()).collect();
        samples.sort_by(f64::total_cmp);
        samples
    }
}
