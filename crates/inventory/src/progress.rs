use serde::{Deserialize, Serialize};

/// Fulfilment state of a multi-unit request, derived from per-unit outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfilmentStatus {
    /// Nothing transferred yet.
    Pending,
    /// Some units transferred, some failed.
    Partial,
    /// Every requested unit transferred.
    Complete,
}

/// Progress counters for one request.
///
/// There is no atomic rollback of a multi-unit allocation: once a unit has been
/// transferred the logical undo is a return, so cancellation is only allowed
/// while nothing has moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestProgress {
    pub requested: u64,
    pub transferred: u64,
    pub failed: u64,
}

impl RequestProgress {
    pub fn new(requested: u64) -> Self {
        Self {
            requested,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.transferred += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn status(&self) -> FulfilmentStatus {
        if self.transferred == 0 {
            FulfilmentStatus::Pending
        } else if self.transferred >= self.requested {
            FulfilmentStatus::Complete
        } else {
            FulfilmentStatus::Partial
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.transferred == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_closes_after_first_transfer() {
        let mut p = RequestProgress::new(3);
        assert!(p.can_cancel());
        assert_eq!(p.status(), FulfilmentStatus::Pending);

        p.record_failure();
        assert!(p.can_cancel());

        p.record_success();
        assert!(!p.can_cancel());
        assert_eq!(p.status(), FulfilmentStatus::Partial);

        p.record_success();
        p.record_success();
        assert_eq!(p.status(), FulfilmentStatus::Complete);
    }
}
