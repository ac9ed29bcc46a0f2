use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Vehicle {
    pub id: i64,
    #[serde(rename = "customerId")]
    pub customer_id: i64,
    pub year: i32,
    pub make: String,
    pub model: String,
    #[serde(rename = "licensePlate")]
    pub license_plate: Option<String>,
    pub vin: Option<String>,
}

impl Vehicle {
    /// "2019 Toyota Camry"
    pub fn description(&self) -> String {
        format!("{} {} {}", self.year, self.make, self.model)
    }

    /// Description plus plate when on file: "2019 Toyota Camry (ABC-123)"
    pub fn label(&self) -> String {
        match self.license_plate.as_deref() {
            Some(plate) => format!("{} ({})", self.description(), plate),
            None => self.description(),
        }
    }
}
