//! Process-wide mutual exclusion between scheduled syncs and user-triggered
//! flushes of the same resource.

use std::sync::atomic::{AtomicBool, Ordering};

/// Kinds of operations the gate arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Splits,
    Segments,
    Impressions,
    Events,
    Telemetry,
}

const KIND_COUNT: usize = 5;

impl OperationKind {
    fn index(self) -> usize {
        match self {
            OperationKind::Splits => 0,
            OperationKind::Segments => 1,
            OperationKind::Impressions => 2,
            OperationKind::Events => 3,
            OperationKind::Telemetry => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Splits => "splits",
            OperationKind::Segments => "segments",
            OperationKind::Impressions => "impressions",
            OperationKind::Events => "events",
            OperationKind::Telemetry => "telemetry",
        }
    }
}

/// Returned when a flush is requested while another operation of the same
/// kind is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("another operation is already running on {}", .0.name())]
pub struct OperationBusy(pub OperationKind);

/// Lock-free per-kind exclusivity flags.
#[derive(Debug, Default)]
pub struct OperationGate {
    flags: [AtomicBool; KIND_COUNT],
}

impl OperationGate {
    pub fn new() -> Self {
        OperationGate::default()
    }

    /// Non-blocking check: is an operation of this kind in flight?
    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.flags[kind.index()].load(Ordering::Acquire)
    }

    /// Try to take exclusive ownership of the kind. Never blocks.
    pub fn request(&self, kind: OperationKind) -> bool {
        self.flags[kind.index()]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self, kind: OperationKind) {
        self.flags[kind.index()].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_is_exclusive_per_kind() {
        let gate = OperationGate::new();
        assert!(gate.request(OperationKind::Impressions));
        assert!(gate.is_running(OperationKind::Impressions));
        assert!(!gate.request(OperationKind::Impressions));

        // Other kinds are unaffected.
        assert!(!gate.is_running(OperationKind::Events));
        assert!(gate.request(OperationKind::Events));

        gate.finish(OperationKind::Impressions);
        assert!(gate.request(OperationKind::Impressions));
    }

    #[test]
    fn only_one_of_many_concurrent_requests_wins() {
        let gate = Arc::new(OperationGate::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.request(OperationKind::Splits))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }
}
