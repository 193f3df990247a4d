//! Shared-secret callback channel.
//!
//! Payloads are JSON notifications; the signature is the lowercase hex
//! HMAC-SHA256 of the payload under the channel secret.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use tally_ledger::{
    CallbackVerifier, ChannelId, PaymentNotification, RefundNotification, VerificationError,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SharedSecretVerifier {
    channel: ChannelId,
    /// MAC state already keyed with the channel secret.
    keyed: HmacSha256,
}

impl SharedSecretVerifier {
    pub fn new(channel: ChannelId, secret: impl AsRef<[u8]>) -> Result<Self, InvalidLength> {
        Ok(Self {
            channel,
            keyed: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    /// Signature the channel is expected to send for `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.mac(payload).finalize().into_bytes())
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(payload);
        mac
    }

    fn check(&self, payload: &[u8], signature: &str) -> Result<(), VerificationError> {
        let presented =
            hex::decode(signature.trim()).map_err(|_| VerificationError::InvalidSignature)?;
        self.mac(payload)
            .verify_slice(&presented)
            .map_err(|_| VerificationError::InvalidSignature)
    }
}

impl core::fmt::Debug for SharedSecretVerifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedSecretVerifier")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct Acknowledgement<'a> {
    code: &'a str,
    message: &'a str,
}

impl CallbackVerifier for SharedSecretVerifier {
    fn channel(&self) -> ChannelId {
        self.channel.clone()
    }

    fn verify_payment(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<PaymentNotification, VerificationError> {
        self.check(payload, signature)?;
        serde_json::from_slice(payload).map_err(|e| VerificationError::MalformedPayload(e.to_string()))
    }

    fn verify_refund(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<RefundNotification, VerificationError> {
        self.check(payload, signature)?;
        serde_json::from_slice(payload).map_err(|e| VerificationError::MalformedPayload(e.to_string()))
    }

    fn acknowledgement(&self, success: bool, message: &str) -> Vec<u8> {
        let ack = Acknowledgement {
            code: if success { "SUCCESS" } else { "FAIL" },
            message,
        };
        serde_json::to_vec(&ack).unwrap_or_else(|_| ack.code.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Currency, Money};
    use tally_ledger::GatewayPaymentStatus;

    fn verifier() -> SharedSecretVerifier {
        SharedSecretVerifier::new(ChannelId::new("wechat"), "s3cret").unwrap()
    }

    fn payload() -> Vec<u8> {
        serde_json::to_vec(&PaymentNotification {
            external_order_ref: "ORDER-1".to_string(),
            external_transaction_id: "TX-1".to_string(),
            status: GatewayPaymentStatus::Paid,
            amount: Money::from_minor(30000, Currency::Cny),
            paid_at: None,
        })
        .unwrap()
    }

    #[test]
    fn signed_payload_verifies() {
        let v = verifier();
        let body = payload();
        let notification = v.verify_payment(&body, &v.sign(&body)).unwrap();
        assert_eq!(notification.external_transaction_id, "TX-1");
        assert!(notification.status.is_success());
    }

    #[test]
    fn tampered_payload_fails_closed() {
        let v = verifier();
        let body = payload();
        let signature = v.sign(&body);
        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");
        assert_eq!(
            v.verify_payment(&tampered, &signature),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn extended_payload_under_a_prefix_keyed_digest_is_rejected() {
        let v = verifier();
        let body = payload();
        let signature = v.sign(&body);

        // A prefix-keyed SHA-256 of the body is not a valid signature.
        let prefix_keyed =
            hex::encode(<Sha256 as sha2::Digest>::digest([b"s3cret".as_slice(), body.as_slice()].concat()));
        assert_ne!(signature, prefix_keyed);
        assert_eq!(
            v.verify_payment(&body, &prefix_keyed),
            Err(VerificationError::InvalidSignature)
        );

        let mut extended = body.clone();
        extended.extend_from_slice(b"\x80\x00\x00{\"amount\":\"1.00\"}");
        assert_eq!(
            v.verify_payment(&extended, &signature),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn signature_is_hmac_sha256_hex() {
        // RFC 4231 test case 2.
        let v = SharedSecretVerifier::new(ChannelId::new("wechat"), "Jefe").unwrap();
        assert_eq!(
            v.sign(b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn other_secret_or_garbage_signature_fails() {
        let body = payload();
        let other = SharedSecretVerifier::new(ChannelId::new("wechat"), "different").unwrap();
        assert!(verifier().verify_payment(&body, &other.sign(&body)).is_err());
        assert!(verifier().verify_payment(&body, "not-hex").is_err());
    }

    #[test]
    fn signed_garbage_is_malformed() {
        let v = verifier();
        let body = b"{\"nope\":true}";
        assert!(matches!(
            v.verify_payment(body, &v.sign(body)),
            Err(VerificationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn acknowledgement_is_json() {
        let ack: serde_json::Value = serde_json::from_slice(&verifier().acknowledgement(false, "boom")).unwrap();
        assert_eq!(ack["code"], "FAIL");
        assert_eq!(ack["message"], "boom");
    }
}
