//! Infrastructure layer: repositories, configuration and the application services
//! that drive the ledger aggregates through them.

pub mod balance_payment;
pub mod callback;
pub mod config;
pub mod ingestion;
pub mod publishing;
pub mod repository;
pub mod settlement;


pub use balance_payment::{BalancePaymentError, BalancePaymentService, BalanceMovementResult};
pub use callback::{CallbackError, CallbackGateway, CallbackOutcome};
pub use config::FinanceSettings;
pub use ingestion::{EventIngestionGateway, IngestionError, IngestionOutcome, UpstreamEvent, UpstreamEventKind};
pub use repository::{InMemoryLedgerStore, RepositoryError};
pub use settlement::{SettlementError, SettlementService};
