pub mod config;
pub mod schedule;
pub mod timesource;
pub mod types;

pub use config::{
    DeviceConfig, DEFAULT_AP_PASSWORD, DEFAULT_AP_SSID, NTP_UTC_OFFSET_SECS,
    WIFI_CONNECT_TIMEOUT_MS,
};
pub use schedule::{Schedule, TimeField, TimeFieldError, TimeOfDay};
pub use timesource::{
    is_sentinel, sentinel, HardwareClock, SourceHealth, TimeAuthority, TimeKeeper, TimeSource,
    Timestamp,
};
pub use types::{RelayStatus, TimeStatus};
