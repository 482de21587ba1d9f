use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use equiptrack_core::{TransferId, UnitId};
use equiptrack_events::Event;

use crate::master::AggregateCounts;
use crate::transfer::TransferRecord;
use crate::unit::ItemKey;

/// Facts published after ledger writes are acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransferRecorded {
        record: TransferRecord,
    },
    UnitPurged {
        unit_id: UnitId,
        key: ItemKey,
        transfer_id: TransferId,
        occurred_at: DateTime<Utc>,
    },
    DriftCorrected {
        key: ItemKey,
        stored: Option<AggregateCounts>,
        recomputed: Option<AggregateCounts>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::TransferRecorded { .. } => "ledger.transfer.recorded",
            LedgerEvent::UnitPurged { .. } => "ledger.unit.purged",
            LedgerEvent::DriftCorrected { .. } => "ledger.aggregate.drift_corrected",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::TransferRecorded { record } => record.occurred_at,
            LedgerEvent::UnitPurged { occurred_at, .. } => *occurred_at,
            LedgerEvent::DriftCorrected { occurred_at, .. } => *occurred_at,
        }
    }

    fn subject(&self) -> String {
        match self {
            LedgerEvent::TransferRecorded { record } => record.unit_id.to_string(),
            LedgerEvent::UnitPurged { unit_id, .. } => unit_id.to_string(),
            LedgerEvent::DriftCorrected { key, .. } => key.to_string(),
        }
    }
}
