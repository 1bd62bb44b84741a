//! Identity types shared across plantsync

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// Logical identity of a piece of equipment as it appears on the wire.
///
/// This is never a database id; the catalog maps it to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub customer: String,
    pub location: String,
    pub equipment: String,
}

impl AssetIdentity {
    pub fn new(
        customer: impl Into<String>,
        location: impl Into<String>,
        equipment: impl Into<String>,
    ) -> Self {
        Self {
            customer: customer.into(),
            location: location.into(),
            equipment: equipment.into(),
        }
    }

    /// True when every component is non-blank
    pub fn is_complete(&self) -> bool {
        !self.customer.trim().is_empty()
            && !self.location.trim().is_empty()
            && !self.equipment.trim().is_empty()
    }
}

impl std::fmt::Display for AssetIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.customer, self.location, self.equipment)
    }
}

/// Kind of manufacturing event carried by a broker message.
///
/// Each kind owns one drain worker and one durable queue namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ShiftAdd,
    ShiftDelete,
    WorkOrderCreate,
    WorkOrderStart,
    WorkOrderStop,
    ScrapUniqueProduct,
}

impl MessageKind {
    /// Every kind, in the order workers are spawned
    pub const ALL: [MessageKind; 6] = [
        MessageKind::ShiftAdd,
        MessageKind::ShiftDelete,
        MessageKind::WorkOrderCreate,
        MessageKind::WorkOrderStart,
        MessageKind::WorkOrderStop,
        MessageKind::ScrapUniqueProduct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ShiftAdd => "shift_add",
            MessageKind::ShiftDelete => "shift_delete",
            MessageKind::WorkOrderCreate => "work_order_create",
            MessageKind::WorkOrderStart => "work_order_start",
            MessageKind::WorkOrderStop => "work_order_stop",
            MessageKind::ScrapUniqueProduct => "scrap_unique_product",
        }
    }

    /// Durable queue namespace owned by this kind
    pub fn namespace(&self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for MessageKind {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // accept both snake_case and the dotted topic suffixes used by brokers
        match s.to_lowercase().replace(['.', '-'], "_").as_str() {
            "shift_add" => Ok(MessageKind::ShiftAdd),
            "shift_delete" => Ok(MessageKind::ShiftDelete),
            "work_order_create" => Ok(MessageKind::WorkOrderCreate),
            "work_order_start" => Ok(MessageKind::WorkOrderStart),
            "work_order_stop" => Ok(MessageKind::WorkOrderStop),
            "scrap_unique_product" => Ok(MessageKind::ScrapUniqueProduct),
            _ => Err(CommonError::UnknownKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
