use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::Money;

use crate::instrument::InstrumentId;
use crate::obligation::ObligationId;

/// Identifier of one applied allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// "What was applied to what": one slice of an instrument settling one obligation.
///
/// The same record is appended to both aggregates, so either side can rebuild the
/// audit trail on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: AllocationId,
    pub instrument_id: InstrumentId,
    pub obligation_id: ObligationId,
    pub amount: Money,
    pub applied_at: DateTime<Utc>,
    pub remark: String,
}

impl AllocationRecord {
    pub fn new(
        instrument_id: InstrumentId,
        obligation_id: ObligationId,
        amount: Money,
        applied_at: DateTime<Utc>,
        remark: impl Into<String>,
    ) -> Self {
        Self {
            id: AllocationId::new(),
            instrument_id,
            obligation_id,
            amount,
            applied_at,
            remark: remark.into(),
        }
    }
}
