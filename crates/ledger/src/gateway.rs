//! Payment-channel callbacks, normalised.
//!
//! Each channel decodes and authenticates its own wire format through a
//! [`CallbackVerifier`]; the rest of the ledger only sees the notifications below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{AggregateId, Money, TenantId};
use tally_events::Event;

use crate::instrument::InstrumentId;

/// Name a payment channel is registered under (e.g. "wechat", "alipay").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Channel names are case-insensitive; they are stored lowercased.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
    PartialRefunded,
    Closed,
}

impl GatewayPaymentStatus {
    pub fn is_success(self) -> bool {
        self == GatewayPaymentStatus::Paid
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Success,
    Failed,
    Closed,
}

impl RefundStatus {
    pub fn is_success(self) -> bool {
        self == RefundStatus::Success
    }
}

/// Verified payment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNotification {
    /// Our reference, echoed back by the channel (the instrument's payment reference).
    pub external_order_ref: String,
    pub external_transaction_id: String,
    pub status: GatewayPaymentStatus,
    pub amount: Money,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

/// Verified refund notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundNotification {
    pub external_refund_id: String,
    /// Payment reference of the instrument the refund belongs to.
    pub external_order_ref: String,
    pub status: RefundStatus,
    pub amount: Money,
    #[serde(default)]
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("signature does not match payload")]
    InvalidSignature,

    #[error("malformed callback payload: {0}")]
    MalformedPayload(String),
}

/// Channel-specific authentication and decoding of callbacks.
pub trait CallbackVerifier: Send + Sync {
    fn channel(&self) -> ChannelId;

    fn verify_payment(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<PaymentNotification, VerificationError>;

    fn verify_refund(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<RefundNotification, VerificationError>;

    /// Body the channel expects in reply.
    fn acknowledgement(&self, success: bool, message: &str) -> Vec<u8>;
}

/// Event: GatewayPaymentCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPaymentCompleted {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub channel: ChannelId,
    pub external_order_ref: String,
    pub external_transaction_id: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GatewayRefundCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefundCompleted {
    pub tenant_id: TenantId,
    pub instrument_id: InstrumentId,
    pub channel: ChannelId,
    pub external_refund_id: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayEvent {
    PaymentCompleted(GatewayPaymentCompleted),
    RefundCompleted(GatewayRefundCompleted),
}

impl Event for GatewayEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GatewayEvent::PaymentCompleted(_) => "ledger.gateway.payment_completed",
            GatewayEvent::RefundCompleted(_) => "ledger.gateway.refund_completed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GatewayEvent::PaymentCompleted(e) => e.occurred_at,
            GatewayEvent::RefundCompleted(e) => e.occurred_at,
        }
    }

    fn tenant_id(&self) -> TenantId {
        match self {
            GatewayEvent::PaymentCompleted(e) => e.tenant_id,
            GatewayEvent::RefundCompleted(e) => e.tenant_id,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            GatewayEvent::PaymentCompleted(e) => e.instrument_id.0,
            GatewayEvent::RefundCompleted(e) => e.instrument_id.0,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        "ledger.instrument"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_normalised() {
        assert_eq!(ChannelId::new(" WeChat "), ChannelId::new("wechat"));
        assert_eq!(ChannelId::new("ALIPAY").as_str(), "alipay");
    }

    #[test]
    fn only_paid_and_success_count_as_success() {
        assert!(GatewayPaymentStatus::Paid.is_success());
        assert!(!GatewayPaymentStatus::PartialRefunded.is_success());
        assert!(RefundStatus::Success.is_success());
        assert!(!RefundStatus::Pending.is_success());
    }

    #[test]
    fn statuses_use_screaming_case_on_the_wire() {
        let json = serde_json::to_string(&GatewayPaymentStatus::PartialRefunded).unwrap();
        assert_eq!(json, "\"PARTIAL_REFUNDED\"");
    }
}
