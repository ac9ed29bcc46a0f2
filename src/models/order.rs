use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum OrderStatus {
    Received,
    InProgress,
    AwaitingParts,
    Ready,
    Delivered,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Received => write!(f, "Received"),
            OrderStatus::InProgress => write!(f, "In Progress"),
            OrderStatus::AwaitingParts => write!(f, "Awaiting Parts"),
            OrderStatus::Ready => write!(f, "Ready"),
            OrderStatus::Delivered => write!(f, "Delivered"),
            OrderStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl OrderStatus {
    /// Open orders still occupy a bay or the parts queue
    pub fn is_open(&self) -> bool {
        !matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// All statuses in board order, for pickers and breakdowns
    pub fn all() -> [OrderStatus; 6] {
        [
            OrderStatus::Received,
            OrderStatus::InProgress,
            OrderStatus::AwaitingParts,
            OrderStatus::Ready,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ]
    }
}

/// A work order on the shop board
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Order {
    pub id: i64,
    #[serde(rename = "customerId")]
    pub customer_id: i64,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: i64,
    pub title: String,
    pub status: OrderStatus,
    #[serde(rename = "totalCents")]
    pub total_cents: i64,
    #[serde(rename = "assignedTo")]
    pub assigned_to: Option<i64>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "promisedAt")]
    pub promised_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Promised pickup for list views: "Mar 02, 2:30 PM", or "-" when unset
    pub fn formatted_promise(&self) -> String {
        match self.promised_at {
            Some(at) => at.format("%b %d, %-I:%M %p").to_string(),
            None => "-".to_string(),
        }
    }
}

/// Wire shape of the count endpoints, e.g. `{"count": 12}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct CountResponse {
    pub count: i64,
}
