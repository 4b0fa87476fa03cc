use serde::{Deserialize, Serialize};

use crate::schedule::{Schedule, TimeField};

pub const DEFAULT_AP_SSID: &str = "Lightwave";
pub const DEFAULT_AP_PASSWORD: &str = "therebelight";

/// Fixed offset applied to network time, matching the NTP client setup.
/// Timezone handling beyond this constant is out of scope.
pub const NTP_UTC_OFFSET_SECS: i32 = 19_800;

/// Wi-Fi association timeout before falling back to the access point.
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// The persisted key/value configuration document. Field names are the
/// original wire format; endpoint handlers rewrite it, the startup sequencer
/// reads it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "ssidAP", default = "default_ap_ssid")]
    pub ssid_ap: String,
    #[serde(rename = "passwordAP", default = "default_ap_password")]
    pub password_ap: String,
    #[serde(rename = "onTime", default, skip_serializing_if = "Option::is_none")]
    pub on_time: Option<TimeField>,
    #[serde(rename = "offTime", default, skip_serializing_if = "Option::is_none")]
    pub off_time: Option<TimeField>,
}

fn default_ap_ssid() -> String {
    DEFAULT_AP_SSID.to_string()
}

fn default_ap_password() -> String {
    DEFAULT_AP_PASSWORD.to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            ssid_ap: default_ap_ssid(),
            password_ap: default_ap_password(),
            on_time: None,
            off_time: None,
        }
    }
}

impl DeviceConfig {
    pub fn has_station_credentials(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    /// Derives the actionable schedule; missing or unparseable endpoints
    /// yield an invalid one.
    pub fn schedule(&self) -> Schedule {
        Schedule::from_fields(self.on_time.as_ref(), self.off_time.as_ref())
    }

    pub fn set_credentials(&mut self, ssid: String, password: String) {
        self.ssid = ssid;
        self.password = password;
    }

    pub fn set_schedule_fields(&mut self, on: TimeField, off: TimeField) {
        self.on_time = Some(on);
        self.off_time = Some(off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_fall_back_to_ap_defaults() {
        let config: DeviceConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.ssid, "");
        assert_eq!(config.ssid_ap, DEFAULT_AP_SSID);
        assert_eq!(config.password_ap, DEFAULT_AP_PASSWORD);
        assert!(!config.schedule().valid);
    }

    #[test]
    fn epoch_revision_document_round_trips() {
        let raw = r#"{"ssid":"home","password":"secret","onTime":28800,"offTime":64800}"#;
        let config: DeviceConfig = serde_json::from_str(raw).unwrap();

        assert!(config.has_station_credentials());
        let schedule = config.schedule();
        assert!(schedule.valid);
        assert_eq!(schedule.on.hour, 8);
        assert_eq!(schedule.off.hour, 18);

        let reparsed: DeviceConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn clock_string_revision_is_accepted() {
        let raw = r#"{"onTime":"08:00 AM","offTime":"06:30 PM"}"#;
        let config: DeviceConfig = serde_json::from_str(raw).unwrap();

        let schedule = config.schedule();
        assert!(schedule.valid);
        assert_eq!((schedule.on.hour, schedule.on.minute), (8, 0));
        assert_eq!((schedule.off.hour, schedule.off.minute), (18, 30));
    }

    #[test]
    fn zero_epoch_endpoint_leaves_schedule_invalid() {
        let raw = r#"{"onTime":0,"offTime":64800}"#;
        let config: DeviceConfig = serde_json::from_str(raw).unwrap();

        assert!(!config.schedule().valid);
    }
}
