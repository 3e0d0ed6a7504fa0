//! Monitoring time series: pings, aggregated stats and accidents.

use async_graphql::{Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One liveness probe result.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Ping {
    pub id: String,
    pub node_id: String,
    pub response_time_ms: u64,
    pub outcome: PingOutcome,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum PingOutcome {
    Ok,
    Error,
}

/// Aggregate over one window of pings.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Stat {
    pub id: String,
    pub node_id: String,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    /// All samples in the window, successful or not.
    pub ping_count: u64,
    /// Successful samples / all samples, in `0.0..=1.0`.
    pub success_rate: f64,
    pub computed_at: DateTime<Utc>,
}

/// An anomalous monitoring event.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Accident {
    pub id: String,
    pub node_id: String,
    pub response_time_ms: u64,
    pub kind: AccidentKind,
    pub detail: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum AccidentKind {
    HighLatency,
    ConnectionFailure,
}

/// Filters for listing accidents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccidentQuery {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl AccidentQuery {
    pub const DEFAULT_PAGE_SIZE: usize = 10;

    /// 1-based page and page size, clamped to sane values.
    pub fn paging(&self) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1);
        let size = self
            .page_size
            .filter(|s| *s > 0)
            .unwrap_or(Self::DEFAULT_PAGE_SIZE);
        (page, size)
    }

    pub fn matches(&self, accident: &Accident) -> bool {
        if let Some(ref id) = self.node_id {
            if &accident.node_id != id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if accident.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if accident.created_at > until {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if accident.resolved != resolved {
                return false;
            }
        }
        true
    }
}

/// Items to skip before a 1-based page. Saturates, so an absurd page from a
/// query string lands past the end instead of overflowing.
pub fn page_offset(page: usize, page_size: usize) -> usize {
    page.saturating_sub(1).saturating_mul(page_size)
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
#[graphql(concrete(name = "AccidentPage", params(Accident)))]
pub struct Page<T: async_graphql::OutputType> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}
