//! Inbox handler and ingest decoding seams.
//!
//! The inbox apply worker calls an [`InboxHandler`] for every claimed
//! message, handing it the open transaction so the handler's own writes
//! (balance changes, follow-up outbox rows) commit or roll back together
//! with the message's `processed` flag.
//!
//! The ingest worker uses an [`IdExtractor`] to find the logical identity of
//! a broker record; that identity becomes the inbox primary key.

use crate::broker::DeliveredRecord;
use crate::message::{InboxMessage, MessageId};
use crate::store::StoreError;
use futures::future::BoxFuture;
use thiserror::Error;

/// Errors returned by inbox handlers.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The business rules refused the message (insufficient funds, unknown
    /// account, ...). The message stays unprocessed and is retried.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The payload could not be decoded.
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// A store operation inside the handler failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Business logic applied to inbox messages.
///
/// # Type Parameters
///
/// - `Tx`: The transaction handle of the store the inbox lives in
///
/// Handlers must be idempotent with respect to their own effects only in
/// the sense that a rolled-back attempt leaves no trace: every write goes
/// through `tx`.
pub trait InboxHandler<Tx>: Send + Sync {
    /// Apply one message inside the given transaction.
    ///
    /// # Errors
    ///
    /// Any error rolls back the whole apply tick.
    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        message: &'a InboxMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Errors decoding an ingested record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record carried no payload.
    #[error("Record has no payload")]
    MissingPayload,

    /// The record carried no usable key.
    #[error("Record has no UTF-8 key")]
    MissingKey,

    /// The payload was not valid JSON.
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// The payload lacked the identity field.
    #[error("Payload has no string field '{0}'")]
    MissingField(String),
}

/// Extracts the logical message identity from a broker record.
pub trait IdExtractor: Send + Sync {
    /// Return the inbox id for `record`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the record cannot be identified; the ingest
    /// worker then drops and acknowledges it.
    fn extract(&self, record: &DeliveredRecord) -> Result<MessageId, DecodeError>;
}

/// Uses the record key as the inbox id.
///
/// Matches records produced by the outbox harvester, which keys every record
/// by its outbox message id.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyId;

impl IdExtractor for KeyId {
    fn extract(&self, record: &DeliveredRecord) -> Result<MessageId, DecodeError> {
        if record.payload.is_none() {
            return Err(DecodeError::MissingPayload);
        }
        record
            .key_str()
            .filter(|k| !k.is_empty())
            .map(MessageId::from)
            .ok_or(DecodeError::MissingKey)
    }
}

/// Reads the inbox id from a top-level string field of a JSON payload.
///
/// Used when the natural identity of the event is a business key (for
/// example the `order_id` of a payment request) rather than the outbox id.
#[derive(Debug, Clone)]
pub struct JsonFieldId {
    field: String,
}

impl JsonFieldId {
    /// Extract ids from the named field.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl IdExtractor for JsonFieldId {
    fn extract(&self, record: &DeliveredRecord) -> Result<MessageId, DecodeError> {
        let payload = record.payload.as_deref().ok_or(DecodeError::MissingPayload)?;
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        value
            .get(&self.field)
            .and_then(serde_json::Value::as_str)
            .map(MessageId::from)
            .ok_or_else(|| DecodeError::MissingField(self.field.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(key: Option<&str>, payload: Option<&str>) -> DeliveredRecord {
        DeliveredRecord::new(
            "order.payments",
            0,
            0,
            key.map(|k| k.as_bytes().to_vec()),
            payload.map(|p| p.as_bytes().to_vec()),
            Box::new(|| {}),
        )
    }

    #[test]
    fn key_id_uses_the_record_key() {
        let id = KeyId.extract(&record(Some("A"), Some("{}"))).unwrap();
        assert_eq!(id, MessageId::new("A"));
    }

    #[test]
    fn key_id_rejects_missing_key_and_payload() {
        assert_eq!(KeyId.extract(&record(None, Some("{}"))), Err(DecodeError::MissingKey));
        assert_eq!(KeyId.extract(&record(Some(""), Some("{}"))), Err(DecodeError::MissingKey));
        assert_eq!(KeyId.extract(&record(Some("A"), None)), Err(DecodeError::MissingPayload));
    }

    #[test]
    fn json_field_id_reads_the_business_key() {
        let extractor = JsonFieldId::new("order_id");
        let id = extractor
            .extract(&record(None, Some(r#"{"order_id":"o-1","amount":5}"#)))
            .unwrap();
        assert_eq!(id.as_str(), "o-1");
    }

    #[test]
    fn json_field_id_reports_malformed_payloads() {
        let extractor = JsonFieldId::new("order_id");
        assert!(matches!(
            extractor.extract(&record(None, Some("not json"))),
            Err(DecodeError::InvalidJson(_))
        ));
        assert_eq!(
            extractor.extract(&record(None, Some(r#"{"order_id":5}"#))),
            Err(DecodeError::MissingField("order_id".to_string()))
        );
    }
}
