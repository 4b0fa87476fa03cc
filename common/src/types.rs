use serde::{Deserialize, Serialize};

/// Body of the relay toggle/read endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelayStatus {
    #[serde(rename = "isOn")]
    pub is_on: bool,
}

/// Body of the time status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TimeStatus {
    pub authority: &'static str,
    #[serde(rename = "hardwareHealthy")]
    pub hardware_healthy: bool,
    #[serde(rename = "networkHealthy")]
    pub network_healthy: bool,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: Option<i64>,
}
