//! Persistence boundary for the ledger aggregates.
//!
//! Every write is version-checked: callers hand over the aggregate they loaded
//! (or freshly constructed) and storage accepts it only if nobody else wrote in
//! between. The in-memory store is the reference implementation.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use r#trait::{
    BalanceAccountRepository, DocumentNumberGenerator, InstrumentRepository, ObligationRepository,
    ReconciliationStore, RefundRepository, RepositoryError,
};
