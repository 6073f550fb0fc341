//! Bounded per-router ledger of scheduling transactions, for diagnostics.
//!
//! Two independent FIFO bounds apply: the number of tracked routers (evicting
//! the oldest-inserted router's entire history) and the number of records per
//! router (evicting its oldest record). Insertion order is tracked explicitly
//! with a queue of keys, not an ordered map's incidental iteration order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tabled::{Table, Tabled};
use tracing::debug;

use netfab_id::{RequestId, RouterId};

/// Kinds of recorded scheduling transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    RouterCreated,
    RouterDeleted,
    DeleteFailed,
    Scheduled,
    NoCandidate,
    NoCapacity,
    SchedulerMissing,
    Unscheduled,
    Backlogged,
    BacklogRemoved,
    DeviceDead,
}

impl TxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RouterCreated => "router-created",
            Self::RouterDeleted => "router-deleted",
            Self::DeleteFailed => "delete-failed",
            Self::Scheduled => "scheduled",
            Self::NoCandidate => "no-candidate",
            Self::NoCapacity => "no-capacity",
            Self::SchedulerMissing => "scheduler-missing",
            Self::Unscheduled => "unscheduled",
            Self::Backlogged => "backlogged",
            Self::BacklogRemoved => "backlog-removed",
            Self::DeviceDead => "device-dead",
        }
    }
}

impl std::fmt::Display for TxnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transaction.
#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub time: DateTime<Utc>,
    pub request_id: Option<RequestId>,
    pub kind: TxnKind,
    pub comment: Option<String>,
}

#[derive(Tabled)]
struct TxnRow {
    #[tabled(rename = "time")]
    time: String,
    #[tabled(rename = "request_id")]
    request_id: String,
    #[tabled(rename = "txn_type")]
    kind: String,
    #[tabled(rename = "comment")]
    comment: String,
}

impl From<&TxnRecord> for TxnRow {
    fn from(record: &TxnRecord) -> Self {
        Self {
            time: record.time.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            request_id: record
                .request_id
                .map(|r| r.to_string())
                .unwrap_or_default(),
            kind: record.kind.to_string(),
            comment: record.comment.clone().unwrap_or_default(),
        }
    }
}

struct LogInner {
    /// Router keys in insertion order; front is the eviction candidate.
    order: VecDeque<RouterId>,
    records: HashMap<RouterId, Vec<TxnRecord>>,
}

/// Bounded transaction ledger.
pub struct TransactionLog {
    enabled: bool,
    max_routers: usize,
    max_records_per_router: usize,
    inner: Mutex<LogInner>,
}

impl TransactionLog {
    pub fn new(enabled: bool, max_routers: usize, max_records_per_router: usize) -> Self {
        Self {
            enabled,
            max_routers,
            max_records_per_router,
            inner: Mutex::new(LogInner {
                order: VecDeque::new(),
                records: HashMap::new(),
            }),
        }
    }

    /// Appends a record for a router, enforcing both bounds.
    pub fn record(
        &self,
        router_id: &RouterId,
        kind: TxnKind,
        request_id: Option<RequestId>,
        comment: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.records.contains_key(router_id) {
            if inner.order.len() >= self.max_routers {
                if let Some(evicted) = inner.order.pop_front() {
                    let history = inner.records.remove(&evicted);
                    debug!(
                        router_id = %evicted,
                        records = history.map(|h| h.len()).unwrap_or(0),
                        "Evicted oldest router transaction history"
                    );
                }
            }
            inner.order.push_back(*router_id);
        }
        let records = inner.records.entry(*router_id).or_default();
        if records.len() >= self.max_records_per_router {
            records.remove(0);
        }
        records.push(TxnRecord {
            time: Utc::now(),
            request_id,
            kind,
            comment: comment.map(str::to_string),
        });
    }

    /// Number of routers currently tracked.
    pub fn tracked_routers(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    /// Total record count across all routers.
    pub fn total_records(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Records currently held for a router.
    pub fn records_for(&self, router_id: &RouterId) -> Vec<TxnRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .get(router_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Tabular view of one router's transactions.
    pub fn render(&self, router_id: &RouterId) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let records = inner.records.get(router_id)?;
        let rows: Vec<TxnRow> = records.iter().map(TxnRow::from).collect();
        Some(format!(
            "router_id:{router_id}\n{}",
            Table::new(rows)
        ))
    }

    /// Tabular view of every tracked router, in insertion order.
    pub fn render_all(&self) -> String {
        let ids: Vec<RouterId> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.order.iter().copied().collect()
        };
        let mut out = String::new();
        for id in ids {
            if let Some(section) = self.render(&id) {
                out.push('\n');
                out.push_str(&section);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_log_records_nothing() {
        let log = TransactionLog::new(false, 10, 10);
        log.record(&RouterId::new(), TxnKind::Scheduled, None, None);
        assert_eq!(log.tracked_routers(), 0);
    }

    #[test]
    fn test_child_records_evicted_fifo() {
        let log = TransactionLog::new(true, 10, 2);
        let router = RouterId::new();
        log.record(&router, TxnKind::RouterCreated, None, None);
        log.record(&router, TxnKind::Backlogged, None, None);
        log.record(&router, TxnKind::Scheduled, None, None);

        let records = log.records_for(&router);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, TxnKind::Backlogged);
        assert_eq!(records[1].kind, TxnKind::Scheduled);
    }

    #[test]
    fn test_parent_records_evicted_in_insertion_order() {
        let log = TransactionLog::new(true, 2, 10);
        let first = RouterId::new();
        let second = RouterId::new();
        let third = RouterId::new();
        log.record(&first, TxnKind::Scheduled, None, None);
        log.record(&second, TxnKind::Scheduled, None, None);
        log.record(&third, TxnKind::Scheduled, None, None);

        assert_eq!(log.tracked_routers(), 2);
        assert!(log.records_for(&first).is_empty());
        assert!(!log.records_for(&second).is_empty());
        assert!(!log.records_for(&third).is_empty());
    }

    #[test]
    fn test_bounds_hold_under_many_routers() {
        let log = TransactionLog::new(true, 2, 2);
        for _ in 0..101 {
            let router = RouterId::new();
            for kind in [TxnKind::RouterCreated, TxnKind::Backlogged, TxnKind::Scheduled] {
                log.record(&router, kind, None, None);
            }
        }
        assert_eq!(log.tracked_routers(), 2);
        assert!(log.total_records() <= 4);
    }

    #[test]
    fn test_render_contains_columns_and_comment() {
        let log = TransactionLog::new(true, 10, 10);
        let router = RouterId::new();
        log.record(
            &router,
            TxnKind::NoCapacity,
            Some(RequestId::new()),
            Some("capacity shortage on template"),
        );

        let text = log.render(&router).unwrap();
        assert!(text.starts_with(&format!("router_id:{router}")));
        assert!(text.contains("no-capacity"));
        assert!(text.contains("capacity shortage on template"));
        assert!(text.contains("request_id"));

        assert!(log.render(&RouterId::new()).is_none());
    }

    #[test]
    fn test_render_all_concatenates_sections() {
        let log = TransactionLog::new(true, 10, 10);
        let a = RouterId::new();
        let b = RouterId::new();
        log.record(&a, TxnKind::Scheduled, None, None);
        log.record(&b, TxnKind::Unscheduled, None, None);

        let text = log.render_all();
        assert!(text.contains(&format!("router_id:{a}")));
        assert!(text.contains(&format!("router_id:{b}")));
    }
}
