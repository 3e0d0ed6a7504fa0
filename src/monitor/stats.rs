//! Window aggregation of pings into a [`Stat`].

use chrono::{DateTime, Utc};

use crate::domain::monitoring::{Ping, PingOutcome, Stat};
use crate::domain::new_id;

/// Aggregate one window. Latency figures only consider successful samples;
/// a window without any success yields nothing.
pub fn aggregate(node_id: &str, pings: &[Ping], now: DateTime<Utc>) -> Option<Stat> {
    let ok: Vec<u64> = pings
        .iter()
        .filter(|p| p.outcome == PingOutcome::Ok)
        .map(|p| p.response_time_ms)
        .collect();
    if ok.is_empty() {
        return None;
    }

    let total = pings.len() as u64;
    let sum: u64 = ok.iter().sum();
    Some(Stat {
        id: new_id(),
        node_id: node_id.to_string(),
        avg_response_time_ms: sum as f64 / ok.len() as f64,
        min_response_time_ms: ok.iter().copied().min().unwrap_or_default(),
        max_response_time_ms: ok.iter().copied().max().unwrap_or_default(),
        ping_count: total,
        success_rate: ok.len() as f64 / total as f64,
        computed_at: now,
    })
}
