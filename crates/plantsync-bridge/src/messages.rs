//! Inbound message payloads and the records persisted in the retry queue
//!
//! Broker payloads are JSON with camelCase fields and millisecond Unix
//! timestamps. The ingest adapter decodes and validates them here, wraps them
//! with the asset identity taken from the topic, and enqueues the resulting
//! record. Drain workers decode the same records back out of the queue.

use chrono::{DateTime, Utc};
use plantsync_common::{AssetIdentity, MessageKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed input. Dropped and logged, never queued.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid field `{field}`: {reason}")]
    Field { field: &'static str, reason: String },

    #[error("incomplete asset identity: {0}")]
    Identity(AssetIdentity),
}

impl ValidationError {
    fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Field {
            field,
            reason: reason.into(),
        }
    }
}

/// Convert a wire timestamp into an absolute UTC timestamp.
pub fn timestamp_from_unix_ms(
    field: &'static str,
    unix_ms: i64,
) -> Result<DateTime<Utc>, ValidationError> {
    if unix_ms < 0 {
        return Err(ValidationError::field(field, format!("negative timestamp {unix_ms}")));
    }
    DateTime::<Utc>::from_timestamp_millis(unix_ms)
        .ok_or_else(|| ValidationError::field(field, format!("timestamp {unix_ms} out of range")))
}

fn require_non_blank(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::field(field, "must not be empty"));
    }
    Ok(())
}

/// Field-level rules applied after decoding
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

// ============================================================================
// Wire payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftAdd {
    pub start_time_unix_ms: i64,
    pub end_time_unix_ms: i64,
}

impl Validate for ShiftAdd {
    fn validate(&self) -> Result<(), ValidationError> {
        timestamp_from_unix_ms("startTimeUnixMs", self.start_time_unix_ms)?;
        timestamp_from_unix_ms("endTimeUnixMs", self.end_time_unix_ms)?;
        if self.end_time_unix_ms <= self.start_time_unix_ms {
            return Err(ValidationError::field("endTimeUnixMs", "must be after startTimeUnixMs"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftDelete {
    pub start_time_unix_ms: i64,
}

impl Validate for ShiftDelete {
    fn validate(&self) -> Result<(), ValidationError> {
        timestamp_from_unix_ms("startTimeUnixMs", self.start_time_unix_ms).map(|_| ())
    }
}

/// Work order lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WorkOrderStatus {
    Created = 0,
    Started = 1,
    Stopped = 2,
}

impl WorkOrderStatus {
    /// Column value in `work_orders.status`
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

impl TryFrom<u8> for WorkOrderStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WorkOrderStatus::Created),
            1 => Ok(WorkOrderStatus::Started),
            2 => Ok(WorkOrderStatus::Stopped),
            other => Err(format!("unknown work order status {other}")),
        }
    }
}

impl From<WorkOrderStatus> for u8 {
    fn from(status: WorkOrderStatus) -> Self {
        status as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRef {
    pub external_product_id: String,
    pub cycle_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderCreate {
    pub external_work_order_id: String,
    pub product: ProductRef,
    pub quantity: i32,
    pub status: WorkOrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_unix_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_unix_ms: Option<i64>,
}

impl Validate for WorkOrderCreate {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("externalWorkOrderId", &self.external_work_order_id)?;
        require_non_blank("product.externalProductId", &self.product.external_product_id)?;
        if self.product.cycle_time_ms < 0 {
            return Err(ValidationError::field("product.cycleTimeMs", "must not be negative"));
        }
        if self.quantity <= 0 {
            return Err(ValidationError::field("quantity", "must be greater than 0"));
        }
        if let Some(start) = self.start_time_unix_ms {
            timestamp_from_unix_ms("startTimeUnixMs", start)?;
        }
        if let Some(end) = self.end_time_unix_ms {
            timestamp_from_unix_ms("endTimeUnixMs", end)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderStart {
    pub external_work_order_id: String,
    pub start_time_unix_ms: i64,
}

impl Validate for WorkOrderStart {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("externalWorkOrderId", &self.external_work_order_id)?;
        timestamp_from_unix_ms("startTimeUnixMs", self.start_time_unix_ms).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderStop {
    pub external_work_order_id: String,
    pub end_time_unix_ms: i64,
}

impl Validate for WorkOrderStop {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("externalWorkOrderId", &self.external_work_order_id)?;
        timestamp_from_unix_ms("endTimeUnixMs", self.end_time_unix_ms).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapUniqueProduct {
    #[serde(rename = "UID", alias = "uid")]
    pub uid: String,
}

impl Validate for ScrapUniqueProduct {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("UID", &self.uid)
    }
}

/// A decoded and validated inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    ShiftAdd(ShiftAdd),
    ShiftDelete(ShiftDelete),
    WorkOrderCreate(WorkOrderCreate),
    WorkOrderStart(WorkOrderStart),
    WorkOrderStop(WorkOrderStop),
    ScrapUniqueProduct(ScrapUniqueProduct),
}

fn decode_valid<M>(kind: MessageKind, payload: &[u8]) -> Result<M, ValidationError>
where
    M: DeserializeOwned + Validate,
{
    let message: M =
        serde_json::from_slice(payload).map_err(|source| ValidationError::Decode { kind, source })?;
    message.validate()?;
    Ok(message)
}

impl InboundMessage {
    /// Decode a raw payload of the given kind and apply its field rules.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, ValidationError> {
        Ok(match kind {
            MessageKind::ShiftAdd => Self::ShiftAdd(decode_valid(kind, payload)?),
            MessageKind::ShiftDelete => Self::ShiftDelete(decode_valid(kind, payload)?),
            MessageKind::WorkOrderCreate => Self::WorkOrderCreate(decode_valid(kind, payload)?),
            MessageKind::WorkOrderStart => Self::WorkOrderStart(decode_valid(kind, payload)?),
            MessageKind::WorkOrderStop => Self::WorkOrderStop(decode_valid(kind, payload)?),
            MessageKind::ScrapUniqueProduct => {
                Self::ScrapUniqueProduct(decode_valid(kind, payload)?)
            }
        })
    }
}

/// A broker message as received, before decoding.
///
/// This is also the shape parked in the fallback queue when an identity cannot
/// be resolved before shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub kind: MessageKind,
    pub asset: AssetIdentity,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(kind: MessageKind, asset: AssetIdentity, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            asset,
            payload: payload.into(),
        }
    }
}

// ============================================================================
// Queued records
// ============================================================================

/// Record whose dimension keys are resolved by the sink writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRecord<M> {
    pub asset: AssetIdentity,
    pub message: M,
}

/// Record whose asset id was already resolved at ingest time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRecord<M> {
    pub asset_id: i32,
    pub asset: AssetIdentity,
    pub message: M,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_shift_add() {
        let msg = InboundMessage::decode(
            MessageKind::ShiftAdd,
            &bytes(json!({"startTimeUnixMs": 1000, "endTimeUnixMs": 5000})),
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::ShiftAdd(ShiftAdd {
                start_time_unix_ms: 1000,
                end_time_unix_ms: 5000
            })
        );
    }

    #[test]
    fn test_shift_add_rejects_inverted_range() {
        let err = InboundMessage::decode(
            MessageKind::ShiftAdd,
            &bytes(json!({"startTimeUnixMs": 5000, "endTimeUnixMs": 5000})),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "endTimeUnixMs", .. }));
    }

    #[test]
    fn test_decode_failure_is_validation_error() {
        let err = InboundMessage::decode(MessageKind::ShiftDelete, b"{not json").unwrap_err();
        assert!(matches!(err, ValidationError::Decode { kind: MessageKind::ShiftDelete, .. }));
    }

    #[test]
    fn test_work_order_create_status_codes() {
        let msg = InboundMessage::decode(
            MessageKind::WorkOrderCreate,
            &bytes(json!({
                "externalWorkOrderId": "WO-1",
                "product": {"externalProductId": "P-9", "cycleTimeMs": 1200},
                "quantity": 10,
                "status": 0
            })),
        )
        .unwrap();
        let InboundMessage::WorkOrderCreate(create) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(create.status, WorkOrderStatus::Created);
        assert_eq!(create.start_time_unix_ms, None);

        let err = InboundMessage::decode(
            MessageKind::WorkOrderCreate,
            &bytes(json!({
                "externalWorkOrderId": "WO-1",
                "product": {"externalProductId": "P-9", "cycleTimeMs": 1200},
                "quantity": 10,
                "status": 7
            })),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Decode { .. }));
    }

    #[test]
    fn test_work_order_create_rejects_zero_quantity() {
        let err = InboundMessage::decode(
            MessageKind::WorkOrderCreate,
            &bytes(json!({
                "externalWorkOrderId": "WO-1",
                "product": {"externalProductId": "P-9", "cycleTimeMs": 1200},
                "quantity": 0,
                "status": 0
            })),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "quantity", .. }));
    }

    #[test]
    fn test_work_order_start_rejects_blank_id() {
        let err = InboundMessage::decode(
            MessageKind::WorkOrderStart,
            &bytes(json!({"externalWorkOrderId": "  ", "startTimeUnixMs": 1000})),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "externalWorkOrderId", .. }));
    }

    #[test]
    fn test_scrap_accepts_upper_and_lower_uid() {
        for payload in [json!({"UID": "u-1"}), json!({"uid": "u-1"})] {
            let msg =
                InboundMessage::decode(MessageKind::ScrapUniqueProduct, &bytes(payload)).unwrap();
            assert_eq!(
                msg,
                InboundMessage::ScrapUniqueProduct(ScrapUniqueProduct {
                    uid: "u-1".to_string()
                })
            );
        }
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp_from_unix_ms("t", 1000).unwrap();
        assert_eq!(ts.timestamp_millis(), 1000);
        assert!(timestamp_from_unix_ms("t", -1).is_err());
        assert!(timestamp_from_unix_ms("t", i64::MAX).is_err());
    }
}
