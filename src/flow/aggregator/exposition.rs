//! Text exposition of the aggregate state for the scrape endpoint.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use flow_common::StageCategory;

use super::state::{FlowState, percentile};
use crate::flow::registry::StageSnapshot;

/// Sojourn buckets, 0.5 s through four weeks.
pub const CYCLE_BUCKETS_SECONDS: &[f64] = &[
    0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 14_400.0, 28_800.0, 86_400.0,
    172_800.0, 345_600.0, 604_800.0, 1_209_600.0, 2_419_200.0,
];

/// Lead time buckets, one hour through ninety days.
pub const LEAD_BUCKETS_SECONDS: &[f64] = &[
    3600.0, 14_400.0, 28_800.0, 86_400.0, 172_800.0, 345_600.0, 604_800.0, 1_209_600.0,
    2_419_200.0, 5_184_000.0, 7_776_000.0,
];

pub const QUANTILES: &[f64] = &[0.5, 0.85, 0.95];

/// Counters kept outside the aggregator task but rendered with it.
#[derive(Debug, Clone, Default)]
pub struct ExternalCounters {
    pub dropped_notifications: u64,
    /// `(outcome, count)` pairs.
    pub webhook_events: Vec<(&'static str, u64)>,
}

pub fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn labels(base: &str, extra: &str) -> String {
    match (base.is_empty(), extra.is_empty()) {
        (true, true) => String::new(),
        (true, false) => format!("{{{extra}}}"),
        (false, true) => format!("{{{base}}}"),
        (false, false) => format!("{{{base},{extra}}}"),
    }
}

fn push_histogram(body: &mut String, metric: &str, base_labels: &str, samples: &[f64], bounds: &[f64]) {
    let mut count_le = vec![0_u64; bounds.len()];
    let mut sum = 0.0_f64;
    for sample in samples {
        sum += sample;
        for (i, bound) in bounds.iter().enumerate() {
            if sample <= bound {
                count_le[i] += 1;
            }
        }
    }
    for (bound, count) in bounds.iter().zip(&count_le) {
        let _ = writeln!(
            body,
            "{metric}_bucket{} {count}",
            labels(base_labels, &format!("le=\"{bound}\""))
        );
    }
    let _ = writeln!(
        body,
        "{metric}_bucket{} {}",
        labels(base_labels, "le=\"+Inf\""),
        samples.len()
    );
    let _ = writeln!(body, "{metric}_sum{} {sum:.6}", labels(base_labels, ""));
    let _ = writeln!(body, "{metric}_count{} {}", labels(base_labels, ""), samples.len());
}

fn push_quantiles(body: &mut String, metric: &str, base_labels: &str, samples: &[f64]) {
    for &q in QUANTILES {
        let value = percentile(samples, q).unwrap_or(0.0);
        let _ = writeln!(
            body,
            "{metric}{} {value:.6}",
            labels(base_labels, &format!("quantile=\"{q}\""))
        );
    }
}

pub fn render(
    state: &FlowState,
    stages: &StageSnapshot,
    counters: &ExternalCounters,
    now: DateTime<Utc>,
) -> String {
    let mut body = String::new();

    body.push_str("# HELP flow_wip Work items currently in each stage.\n");
    body.push_str("# TYPE flow_wip gauge\n");
    for stage in stages.list() {
        let _ = writeln!(
            body,
            "flow_wip{{stage=\"{}\",category=\"{}\"}} {}",
            escape_label(&stage.name),
            stage.category,
            state.wip_of(stage.id)
        );
    }

    body.push_str("# HELP flow_throughput_per_day Entries into done stages over the last 24 hours.\n");
    body.push_str("# TYPE flow_throughput_per_day gauge\n");
    let _ = writeln!(
        body,
        "flow_throughput_per_day{{category=\"{}\"}} {}",
        StageCategory::Done,
        state.throughput_per_day(now, None)
    );

    body.push_str("# HELP flow_stage_completions_per_day Entries into each done stage over the last 24 hours.\n");
    body.push_str("# TYPE flow_stage_completions_per_day gauge\n");
    for stage in stages.list().iter().filter(|s| s.is_terminal()) {
        let _ = writeln!(
            body,
            "flow_stage_completions_per_day{{stage=\"{}\",category=\"{}\"}} {}",
            escape_label(&stage.name),
            stage.category,
            state.throughput_per_day(now, Some(stage.id))
        );
    }

    body.push_str("# HELP flow_stage_cycle_time_seconds Time spent in a stage per completed sojourn.\n");
    body.push_str("# TYPE flow_stage_cycle_time_seconds histogram\n");
    for stage in stages.list() {
        let stage_label = format!("stage=\"{}\"", escape_label(&stage.name));
        push_histogram(
            &mut body,
            "flow_stage_cycle_time_seconds",
            &stage_label,
            &state.cycle_samples(stage.id),
            CYCLE_BUCKETS_SECONDS,
        );
    }

    body.push_str("# HELP flow_stage_cycle_time_quantile_seconds Stage cycle time quantiles over the retention window.\n");
    body.push_str("# TYPE flow_stage_cycle_time_quantile_seconds gauge\n");
    for stage in stages.list() {
        let stage_label = format!("stage=\"{}\"", escape_label(&stage.name));
        push_quantiles(
            &mut body,
            "flow_stage_cycle_time_quantile_seconds",
            &stage_label,
            &state.cycle_samples(stage.id),
        );
    }

    let leads = state.lead_samples();
    body.push_str("# HELP flow_lead_time_histogram_seconds Creation to first done entry.\n");
    body.push_str("# TYPE flow_lead_time_histogram_seconds histogram\n");
    push_histogram(
        &mut body,
        "flow_lead_time_histogram_seconds",
        "",
        &leads,
        LEAD_BUCKETS_SECONDS,
    );

    body.push_str("# HELP flow_lead_time_seconds Creation to first done entry.\n");
    body.push_str("# TYPE flow_lead_time_seconds summary\n");
    push_quantiles(&mut body, "flow_lead_time_seconds", "", &leads);
    let _ = writeln!(body, "flow_lead_time_seconds_sum {:.6}", leads.iter().sum::<f64>());
    let _ = writeln!(body, "flow_lead_time_seconds_count {}", leads.len());

    body.push_str("# HELP flow_aggregator_dropped_notifications_total Notifications dropped on a full queue.\n");
    body.push_str("# TYPE flow_aggregator_dropped_notifications_total counter\n");
    let _ = writeln!(
        body,
        "flow_aggregator_dropped_notifications_total {}",
        counters.dropped_notifications
    );

    if !counters.webhook_events.is_empty() {
        body.push_str("# HELP flow_webhook_events_total Webhook deliveries by outcome.\n");
        body.push_str("# TYPE flow_webhook_events_total counter\n");
        for (outcome, count) in &counters.webhook_events {
            let _ = writeln!(body, "flow_webhook_events_total{{outcome=\"{outcome}\"}} {count}");
        }
    }

    body
}
