//! Payment-channel callbacks.
//!
//! Channels deliver at least once and keep retrying until they get a positive
//! acknowledgement. Once an instrument is safely confirmed the callback succeeds,
//! even if the follow-up reconciliation or event publication fails.
//!
//! ```text
//! raw bytes + signature + channel
//!   -> verifier for channel        (GatewayNotRegistered)
//!   -> verify + decode             (VerificationFailed, nothing touched)
//!   -> dedup by transaction id     (repeat => already_processed)
//!   -> confirm instrument, save with version check
//!   -> optional FIFO reconciliation (logged on failure)
//!   -> publish completion event    (logged on failure)
//! ```
//!
//! Refund callbacks resolve their tenant through the instrument and upsert a
//! [`RefundRecord`] keyed by the channel's refund id before announcing completion.

pub mod dedup;
pub mod digest;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use tally_core::{AggregateRoot, DomainError};
use tally_events::EventPublisher;
use tally_ledger::{
    CallbackVerifier, ChannelId, GatewayEvent, InstrumentId, PaymentNotification, ReconcileRequest,
    RecordRefund, RefundNotification, RefundRecord, RefundRecordId, SettlementInstrument,
    VerificationError,
};
use tally_ledger::gateway::{GatewayPaymentCompleted, GatewayRefundCompleted};

use crate::config::FinanceSettings;
use crate::publishing::LedgerEnvelope;
use crate::repository::{InstrumentRepository, RefundRepository, RepositoryError};
use crate::settlement::{SettlementService, SettlementStore};

pub use dedup::CallbackDedup;
pub use digest::SharedSecretVerifier;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no verifier registered for channel {0}")]
    GatewayNotRegistered(ChannelId),

    #[error("callback verification failed for channel {channel}: {source}")]
    VerificationFailed {
        channel: ChannelId,
        #[source]
        source: VerificationError,
    },

    #[error("no instrument with payment reference {0}")]
    InstrumentNotFound(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a handled callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub success: bool,
    /// The key was seen before; nothing was done this time.
    pub already_processed: bool,
    /// Instrument the notification resolved to, when it resolved to one.
    pub instrument_id: Option<InstrumentId>,
    /// Bytes to return to the channel.
    pub acknowledgement: Vec<u8>,
}

pub struct CallbackGateway<S, P> {
    settlement: SettlementService<S, P>,
    verifiers: HashMap<ChannelId, Arc<dyn CallbackVerifier>>,
    dedup: CallbackDedup,
    auto_reconcile: bool,
}

impl<S, P> CallbackGateway<S, P>
where
    S: SettlementStore + RefundRepository,
    P: EventPublisher<LedgerEnvelope>,
{
    pub fn new(settlement: SettlementService<S, P>, settings: &FinanceSettings) -> Self {
        Self {
            settlement,
            verifiers: HashMap::new(),
            dedup: CallbackDedup::new(settings.callback_dedup_capacity),
            auto_reconcile: settings.callback_auto_reconcile,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CallbackVerifier>) -> Self {
        self.register_verifier(verifier);
        self
    }

    pub fn register_verifier(&mut self, verifier: Arc<dyn CallbackVerifier>) {
        let channel = verifier.channel();
        info!(channel = %channel, "callback verifier registered");
        self.verifiers.insert(channel, verifier);
    }

    pub fn settlement(&self) -> &SettlementService<S, P> {
        &self.settlement
    }

    /// Failure acknowledgement for `channel`, if it is registered.
    pub fn failure_acknowledgement(&self, channel: &ChannelId, error: &CallbackError) -> Option<Vec<u8>> {
        self.verifiers
            .get(channel)
            .map(|v| v.acknowledgement(false, &error.to_string()))
    }

    fn verifier(&self, channel: &ChannelId) -> Result<Arc<dyn CallbackVerifier>, CallbackError> {
        self.verifiers.get(channel).cloned().ok_or_else(|| {
            error!(channel = %channel, "callback for unregistered channel");
            CallbackError::GatewayNotRegistered(channel.clone())
        })
    }

    #[instrument(skip_all, fields(channel = %channel))]
    pub fn process_payment(
        &self,
        channel: &ChannelId,
        payload: &[u8],
        signature: &str,
    ) -> Result<CallbackOutcome, CallbackError> {
        let verifier = self.verifier(channel)?;
        let notification = verifier.verify_payment(payload, signature).map_err(|source| {
            warn!(error = %source, "payment callback verification failed");
            CallbackError::VerificationFailed {
                channel: channel.clone(),
                source,
            }
        })?;

        info!(
            order_ref = %notification.external_order_ref,
            transaction_id = %notification.external_transaction_id,
            status = ?notification.status,
            amount = %notification.amount,
            "payment callback received"
        );

        let key = format!("payment:{channel}:{}", notification.external_transaction_id);
        if !self.dedup.try_register(&key) {
            info!(key = %key, "payment callback already processed");
            return Ok(CallbackOutcome {
                success: true,
                already_processed: true,
                instrument_id: None,
                acknowledgement: verifier.acknowledgement(true, ""),
            });
        }

        match self.handle_payment(channel, &notification) {
            Ok(instrument_id) => Ok(CallbackOutcome {
                success: true,
                already_processed: false,
                instrument_id,
                acknowledgement: verifier.acknowledgement(true, ""),
            }),
            Err(e) => {
                self.dedup.remove(&key);
                error!(order_ref = %notification.external_order_ref, error = %e, "payment callback failed");
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(channel = %channel))]
    pub fn process_refund(
        &self,
        channel: &ChannelId,
        payload: &[u8],
        signature: &str,
    ) -> Result<CallbackOutcome, CallbackError> {
        let verifier = self.verifier(channel)?;
        let notification = verifier.verify_refund(payload, signature).map_err(|source| {
            warn!(error = %source, "refund callback verification failed");
            CallbackError::VerificationFailed {
                channel: channel.clone(),
                source,
            }
        })?;

        let key = format!("refund:{channel}:{}", notification.external_refund_id);
        if !self.dedup.try_register(&key) {
            info!(key = %key, "refund callback already processed");
            return Ok(CallbackOutcome {
                success: true,
                already_processed: true,
                instrument_id: None,
                acknowledgement: verifier.acknowledgement(true, ""),
            });
        }

        match self.handle_refund(channel, &notification) {
            Ok(instrument_id) => Ok(CallbackOutcome {
                success: true,
                already_processed: false,
                instrument_id,
                acknowledgement: verifier.acknowledgement(true, ""),
            }),
            Err(e) => {
                self.dedup.remove(&key);
                error!(refund_id = %notification.external_refund_id, error = %e, "refund callback failed");
                Err(e)
            }
        }
    }

    fn find_instrument(&self, reference: &str) -> Result<SettlementInstrument, CallbackError> {
        self.settlement
            .store()
            .find_by_external_reference(reference)?
            .ok_or_else(|| {
                warn!(order_ref = reference, "no instrument for callback reference");
                CallbackError::InstrumentNotFound(reference.to_owned())
            })
    }

    fn handle_payment(
        &self,
        channel: &ChannelId,
        notification: &PaymentNotification,
    ) -> Result<Option<InstrumentId>, CallbackError> {
        if !notification.status.is_success() {
            info!(status = ?notification.status, "skipping unsuccessful payment");
            return Ok(None);
        }

        let mut instrument = self.find_instrument(&notification.external_order_ref)?;
        let instrument_id = instrument.id_typed();
        if instrument.is_confirmed() {
            info!(number = instrument.number(), "instrument already confirmed");
            return Ok(Some(instrument_id));
        }
        if notification.amount != instrument.amount() {
            warn!(
                number = instrument.number(),
                expected = %instrument.amount(),
                notified = %notification.amount,
                "callback amount differs from instrument amount"
            );
        }

        let at = notification.paid_at.unwrap_or_else(Utc::now);
        instrument.confirm(None, Some(notification.external_transaction_id.clone()), at)?;
        InstrumentRepository::save_with_version_check(self.settlement.store(), &mut instrument)?;
        info!(
            number = instrument.number(),
            transaction_id = %notification.external_transaction_id,
            "instrument confirmed via callback"
        );
        if let Err(e) = self.settlement.publish(instrument.take_events()) {
            warn!(number = instrument.number(), error = %e, "failed to publish confirmation");
        }

        if self.auto_reconcile {
            match self
                .settlement
                .reconcile_loaded(&mut instrument, &ReconcileRequest::fifo(at))
            {
                Ok(outcome) => info!(
                    number = instrument.number(),
                    total_reconciled = %outcome.total_reconciled,
                    fully_reconciled = outcome.fully_reconciled,
                    "auto-reconciliation finished"
                ),
                Err(e) => warn!(number = instrument.number(), error = %e, "auto-reconciliation failed"),
            }
        }

        let completed = GatewayEvent::PaymentCompleted(GatewayPaymentCompleted {
            tenant_id: instrument.tenant_id(),
            instrument_id,
            channel: channel.clone(),
            external_order_ref: notification.external_order_ref.clone(),
            external_transaction_id: notification.external_transaction_id.clone(),
            amount: notification.amount,
            occurred_at: at,
        });
        if let Err(e) = self.settlement.publish([completed]) {
            warn!(number = instrument.number(), error = %e, "failed to publish payment completion");
        }

        Ok(Some(instrument_id))
    }

    fn handle_refund(
        &self,
        channel: &ChannelId,
        notification: &RefundNotification,
    ) -> Result<Option<InstrumentId>, CallbackError> {
        if !notification.status.is_success() {
            info!(status = ?notification.status, "skipping unsuccessful refund");
            return Ok(None);
        }

        let instrument = self.find_instrument(&notification.external_order_ref)?;
        let at = notification.refunded_at.unwrap_or_else(Utc::now);
        if !self.complete_refund_record(channel, &instrument, notification, at)? {
            return Ok(Some(instrument.id_typed()));
        }
        info!(
            number = instrument.number(),
            refund_id = %notification.external_refund_id,
            amount = %notification.amount,
            "refund completed"
        );

        let completed = GatewayEvent::RefundCompleted(GatewayRefundCompleted {
            tenant_id: instrument.tenant_id(),
            instrument_id: instrument.id_typed(),
            channel: channel.clone(),
            external_refund_id: notification.external_refund_id.clone(),
            amount: notification.amount,
            occurred_at: at,
        });
        if let Err(e) = self.settlement.publish([completed]) {
            warn!(number = instrument.number(), error = %e, "failed to publish refund completion");
        }

        Ok(Some(instrument.id_typed()))
    }

    /// Complete the stored refund record, creating it when the refund was not
    /// initiated through us. Returns `false` when it was already complete.
    fn complete_refund_record(
        &self,
        channel: &ChannelId,
        instrument: &SettlementInstrument,
        notification: &RefundNotification,
        at: DateTime<Utc>,
    ) -> Result<bool, CallbackError> {
        let store = self.settlement.store();
        let existing = store.find_by_external_refund_id(channel, &notification.external_refund_id)?;
        let mut record = match existing {
            Some(record) if record.instrument_id() != instrument.id_typed() => {
                return Err(DomainError::invariant(format!(
                    "refund {} belongs to another instrument",
                    notification.external_refund_id
                ))
                .into());
            }
            Some(record) if record.status().is_success() => {
                info!(refund_id = %notification.external_refund_id, "refund record already completed");
                return Ok(false);
            }
            Some(mut record) => {
                record.complete(notification.amount, at)?;
                RefundRepository::save_with_version_check(store, &mut record)?;
                record
            }
            None => {
                let mut record = RefundRecord::record(RecordRefund {
                    tenant_id: instrument.tenant_id(),
                    refund_id: RefundRecordId::new(),
                    instrument_id: instrument.id_typed(),
                    channel: channel.clone(),
                    external_refund_id: notification.external_refund_id.clone(),
                    external_order_ref: notification.external_order_ref.clone(),
                    amount: notification.amount,
                    occurred_at: at,
                })?;
                record.complete(notification.amount, at)?;
                RefundRepository::insert(store, &mut record)?;
                record
            }
        };
        info!(
            refund_id = %notification.external_refund_id,
            record_id = %record.id_typed(),
            version = record.version(),
            "refund record completed"
        );
        if let Err(e) = self.settlement.publish(record.take_events()) {
            warn!(
                refund_id = %notification.external_refund_id,
                error = %e,
                "failed to publish refund record events"
            );
        }
        Ok(true)
    }
}
