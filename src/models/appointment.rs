use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppointmentStatus::Scheduled => write!(f, "Scheduled"),
            AppointmentStatus::Confirmed => write!(f, "Confirmed"),
            AppointmentStatus::Completed => write!(f, "Completed"),
            AppointmentStatus::Cancelled => write!(f, "Cancelled"),
            AppointmentStatus::NoShow => write!(f, "No Show"),
        }
    }
}

/// A scheduled drop-off on the shop calendar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Appointment {
    pub id: i64,
    #[serde(rename = "customerId")]
    pub customer_id: i64,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: i64,
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: DateTime<Utc>,
    pub service: String,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

impl Appointment {
    /// Still expected to show up
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Scheduled | AppointmentStatus::Confirmed
        )
    }

    pub fn is_on(&self, date: NaiveDate) -> bool {
        self.scheduled_at.date_naive() == date
    }

    /// Compact slot for list views: "Mar 02 2:30p"
    pub fn formatted_slot(&self) -> String {
        let hour = self
            .scheduled_at
            .format("%I")
            .to_string()
            .trim_start_matches('0')
            .to_string();
        let minute = self.scheduled_at.format("%M").to_string();
        let ampm = self
            .scheduled_at
            .format("%p")
            .to_string()
            .to_lowercase()
            .chars()
            .next()
            .unwrap_or('a');
        if minute == "00" {
            format!("{} {}{}", self.scheduled_at.format("%b %d"), hour, ampm)
        } else {
            format!(
                "{} {}:{}{}",
                self.scheduled_at.format("%b %d"),
                hour,
                minute,
                ampm
            )
        }
    }
}
