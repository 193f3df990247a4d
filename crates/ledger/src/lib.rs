//! `tally-ledger`: obligations, settlement instruments and their reconciliation.
//!
//! Everything here is pure domain logic: aggregates mutate in memory and record
//! the events describing what changed. Persisting them (through a version-checked
//! write) and publishing the events is the caller's job.

pub mod allocation;
pub mod balance;
pub mod document;
pub mod events;
pub mod gateway;
pub mod instrument;
pub mod obligation;
pub mod reconciliation;
pub mod refund;
pub mod strategy;

pub use allocation::{AllocationId, AllocationRecord};
pub use balance::{BalanceAccount, BalanceAccountId, BalanceEvent};
pub use document::DocumentKind;
pub use events::LedgerEvent;
pub use gateway::{
    CallbackVerifier, ChannelId, GatewayEvent, GatewayPaymentStatus, PaymentNotification,
    RefundNotification, RefundStatus, VerificationError,
};
pub use instrument::{
    InstrumentEvent, InstrumentId, InstrumentKind, InstrumentStatus, PaymentMethod,
    RegisterInstrument, SettlementInstrument,
};
pub use obligation::{
    LedgerObligation, ObligationEvent, ObligationId, ObligationKind, ObligationStatus,
    OpenObligation, SourceType, net_outstanding,
};
pub use reconciliation::{ReconcileRequest, ReconciliationEngine, ReconciliationOutcome};
pub use refund::{RecordRefund, RefundEvent, RefundRecord, RefundRecordId};
pub use strategy::{
    AllocationCandidate, AllocationDirective, AllocationPlan, AllocationProposal, StrategyKind,
};
