//! Data records shared between the bus engine, the cache and the REST
//! surface.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::Value;

/// A live parameter value plus the metadata the API needs alongside it.
///
/// `index` is the stored index: wire index plus the address-space offset
/// (0 for the controller, 10000 for the panel), so two parameters can
/// share a name across spaces without colliding in the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub index: u32,
    pub name: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub type_code: u8,
    pub unit: u8,
    pub writable: bool,
    #[serde(rename = "min")]
    pub min_value: Option<f64>,
    #[serde(rename = "max")]
    pub max_value: Option<f64>,
}

/// One controller alarm slot. `to_date` stays `None` while the alarm is
/// active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub index: u16,
    pub code: u8,
    pub from_date: NaiveDateTime,
    pub to_date: Option<NaiveDateTime>,
}

// -----------------------------
// REST response bodies
// -----------------------------

#[derive(Clone, Debug, Serialize)]
pub struct ParametersResponse {
    pub timestamp: DateTime<Utc>,
    /// Keyed by stored index; BTreeMap keeps the JSON ordered by index.
    pub parameters: BTreeMap<u32, Parameter>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ParameterSetRequest {
    pub value: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct ParameterSetResponse {
    pub success: bool,
    pub name: String,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct AlarmsResponse {
    pub alarms: Vec<Alarm>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub controller_connected: bool,
    pub parameters_count: usize,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_serializes_with_api_field_names() {
        let param = Parameter {
            index: 103,
            name: "SetPoint".into(),
            value: Value::Int(45),
            type_code: 2,
            unit: 1,
            writable: true,
            min_value: Some(20.0),
            max_value: Some(80.0),
        };
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["type"], 2);
        assert_eq!(json["min"], 20.0);
        assert_eq!(json["max"], 80.0);
        assert_eq!(json["value"], 45);
    }

    #[test]
    fn set_request_accepts_plain_json_scalars() {
        let req: ParameterSetRequest = serde_json::from_str(r#"{"value": 65}"#).unwrap();
        assert_eq!(req.value, Value::Int(65));

        let req: ParameterSetRequest = serde_json::from_str(r#"{"value": 21.5}"#).unwrap();
        assert_eq!(req.value, Value::Float(21.5));

        let req: ParameterSetRequest = serde_json::from_str(r#"{"value": true}"#).unwrap();
        assert_eq!(req.value, Value::Bool(true));
    }

    #[test]
    fn health_status_is_lowercase_in_json() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, r#""degraded""#);
    }
}
