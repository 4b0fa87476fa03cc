use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, FixedOffset, Utc};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use lightwave_common::{
    sentinel, DeviceConfig, RelayStatus, Schedule, TimeAuthority, TimeField, TimeKeeper,
    TimeSource, TimeStatus, Timestamp, NTP_UTC_OFFSET_SECS, WIFI_CONNECT_TIMEOUT_MS,
};

use crate::rtc::Ds3231Clock;

const NVS_NAMESPACE: &str = "lightwave";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_HTTP_BODY: usize = 4096;
const MDNS_HOSTNAME: &str = "lightwave";
const RELAY_PIN: i32 = 26;
const ERROR_LED_PIN: i32 = 2;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const SNTP_SYNC_TIMEOUT_MS: u64 = 10_000;
const SNTP_SYNC_POLL_MS: u64 = 100;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const CONTROL_LOOP_PERIOD_MS: u64 = 1_000;
const ERROR_BLINK_HALF_PERIOD_MS: u64 = 500;
const RESTART_DELAY_MS: u64 = 500;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

/// SNTP-backed network time. The probe starts the SNTP service and waits a
/// bounded interval for the first sync; once synced the ESP system clock
/// carries UTC and reads are shifted to local time.
struct SntpNetworkTime {
    sntp: Option<EspSntp<'static>>,
    synced: bool,
}

impl SntpNetworkTime {
    fn new() -> Self {
        Self {
            sntp: None,
            synced: false,
        }
    }
}

impl TimeSource for SntpNetworkTime {
    fn probe(&mut self) -> bool {
        if self.sntp.is_none() {
            match EspSntp::new_default() {
                Ok(sntp) => self.sntp = Some(sntp),
                Err(err) => {
                    warn!("failed to start SNTP service: {err:?}");
                    self.synced = false;
                    return false;
                }
            }
        }

        let deadline = Instant::now() + Duration::from_millis(SNTP_SYNC_TIMEOUT_MS);
        let sntp = self.sntp.as_ref().unwrap();
        while Instant::now() < deadline {
            if sntp.get_sync_status() == SyncStatus::Completed {
                self.synced = true;
                return true;
            }
            thread::sleep(Duration::from_millis(SNTP_SYNC_POLL_MS));
        }

        warn!("SNTP sync did not complete within {SNTP_SYNC_TIMEOUT_MS}ms");
        self.synced = false;
        false
    }

    fn read(&self) -> Timestamp {
        if !self.synced {
            return sentinel();
        }
        local_now()
    }
}

type EspTimeKeeper = TimeKeeper<Ds3231Clock, SntpNetworkTime>;

enum WifiStartup {
    Station(EspWifi<'static>),
    AccessPoint(EspWifi<'static>),
}

/// Relay coil driver. Runs disabled when the GPIO cannot be claimed so the
/// rest of the controller stays usable.
struct RelayOutput {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl RelayOutput {
    fn init(pin: i32) -> Self {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
        match driver {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self { pin: Some(driver) }
            }
            Err(err) => {
                warn!("relay output unavailable on GPIO{pin}: {err}");
                Self { pin: None }
            }
        }
    }

    fn apply(&mut self, on: bool) {
        let Some(pin) = self.pin.as_mut() else {
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive relay GPIO: {err}");
        }
    }
}

#[derive(Clone)]
struct SharedState {
    config: Arc<Mutex<DeviceConfig>>,
    schedule: Arc<Mutex<Schedule>>,
    relay_on: Arc<AtomicBool>,
    relay: Arc<Mutex<RelayOutput>>,
    timekeeper: Arc<Mutex<EspTimeKeeper>>,
    network_ready: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Deserialize)]
struct CredentialsUpdate {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleUpdate {
    #[serde(rename = "onTime", default)]
    on_time: Option<TimeField>,
    #[serde(rename = "offTime", default)]
    off_time: Option<TimeField>,
}

#[derive(Debug, Deserialize)]
struct TimeUpdate {
    #[serde(rename = "currentTime", default)]
    current_time: Option<i64>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load device config from NVS: {err:#}");
        DeviceConfig::default()
    });
    let schedule = config.schedule();
    if !schedule.valid {
        info!("no valid on/off schedule configured yet");
    }

    let Peripherals { modem, i2c0, pins, .. } = Peripherals::take()?;

    let rtc = match Ds3231Clock::new(i2c0, pins.gpio23, pins.gpio18) {
        Ok(rtc) => rtc,
        Err(err) => {
            warn!("failed to initialize DS3231 bus, running without RTC: {err:#}");
            Ds3231Clock::disabled()
        }
    };

    let (wifi, network_ready) =
        match connect_wifi(modem, sys_loop, nvs_partition, &config).context("wifi startup failed")? {
            WifiStartup::Station(wifi) => {
                info!("wifi station connected");
                (wifi, true)
            }
            WifiStartup::AccessPoint(wifi) => {
                warn!(
                    "wifi station unavailable; serving access point `{}`",
                    config.ssid_ap
                );
                (wifi, false)
            }
        };
    disable_wifi_power_save();

    let mut timekeeper = TimeKeeper::new(rtc, SntpNetworkTime::new());
    let authority = timekeeper.startup_sync(network_ready);
    info!(
        "time sources probed: authority={}, hardware={:?}, network={:?}",
        authority.as_str(),
        timekeeper.hardware_health(),
        timekeeper.network_health(),
    );

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mut mdns = EspMdns::take().context("failed to start mDNS responder")?;
    mdns.set_hostname(MDNS_HOSTNAME)?;
    info!("mDNS responder up as `{MDNS_HOSTNAME}.local`");

    let shared_state = SharedState {
        config: Arc::new(Mutex::new(config)),
        schedule: Arc::new(Mutex::new(schedule)),
        relay_on: Arc::new(AtomicBool::new(false)),
        relay: Arc::new(Mutex::new(RelayOutput::init(RELAY_PIN))),
        timekeeper: Arc::new(Mutex::new(timekeeper)),
        network_ready: Arc::new(AtomicBool::new(network_ready)),
    };

    let server = create_http_server(shared_state.clone(), nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _mdns = mdns;

    if authority == TimeAuthority::NoSource {
        // The web interface stays reachable, but normal operation halts:
        // with no trusted time source the schedule cannot be run.
        blink_error_forever();
    }

    spawn_control_loop(shared_state);

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &DeviceConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !config.has_station_credentials() {
        warn!("wifi credentials missing; starting access point");
        start_access_point(&mut wifi, config)?;
        return Ok(WifiStartup::AccessPoint(esp_wifi));
    }

    let auth_method = if config.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.ssid);

    let deadline = Instant::now() + Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS);
    loop {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => return Ok(WifiStartup::Station(esp_wifi)),
            Err(err) => {
                if Instant::now() >= deadline {
                    warn!("wifi connect timed out: {err:?}");
                    break;
                }
                warn!("wifi connect attempt failed, retrying: {err:?}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    let _ = wifi.disconnect();
    let _ = wifi.stop();
    start_access_point(&mut wifi, config)?;
    Ok(WifiStartup::AccessPoint(esp_wifi))
}

fn start_access_point(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    config: &DeviceConfig,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config
            .ssid_ap
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP SSID too long"))?,
        password: config
            .password_ap
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("access point started on `{}`", config.ssid_ap);
    Ok(())
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_ok_response()?.write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_ok_response()?.write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/connect", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: CredentialsUpdate =
                serde_json::from_slice(&body).context("invalid credentials payload")?;

            if update.ssid.is_empty() || update.password.is_empty() {
                return write_error(req, 400, "Missing SSID or Password");
            }

            let mut updated = { state.config.lock().unwrap().clone() };
            updated.set_credentials(update.ssid, update.password);

            if let Err(err) = nvs_store.save_config(&updated) {
                warn!("failed to persist wifi credentials: {err:#}");
                return write_error(req, 500, "Failed to save Wi-Fi credentials.");
            }

            {
                let mut config = state.config.lock().unwrap();
                *config = updated;
            }

            schedule_restart();
            write_text(
                req,
                "Wi-Fi credentials received and saved. Attempting to connect...",
            )
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/setup", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ScheduleUpdate =
                serde_json::from_slice(&body).context("invalid schedule payload")?;

            let (Some(on_field), Some(off_field)) = (update.on_time, update.off_time) else {
                return write_error(req, 400, "Missing onTime or offTime");
            };

            let on = match on_field.time_of_day() {
                Ok(on) => on,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            let off = match off_field.time_of_day() {
                Ok(off) => off,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };

            let mut updated = { state.config.lock().unwrap().clone() };
            updated.set_schedule_fields(on_field, off_field);

            if let Err(err) = nvs_store.save_config(&updated) {
                warn!("failed to persist time settings: {err:#}");
                return write_error(req, 500, "Failed to save time settings.");
            }

            {
                let mut config = state.config.lock().unwrap();
                *config = updated;
            }
            {
                let mut schedule = state.schedule.lock().unwrap();
                *schedule = Schedule {
                    on,
                    off,
                    valid: true,
                };
            }
            info!(
                "schedule updated: on {:02}:{:02}, off {:02}:{:02}",
                on.hour, on.minute, off.hour, off.minute
            );

            write_text(req, "Time settings received and saved successfully.")
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/setTime", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: TimeUpdate =
                serde_json::from_slice(&body).context("invalid time payload")?;

            let Some(epoch) = update.current_time.filter(|value| *value != 0) else {
                return write_error(req, 400, "Missing Current Time");
            };
            let Some(now) = DateTime::from_timestamp(epoch, 0) else {
                return write_error(req, 400, "Invalid Current Time");
            };

            {
                let mut timekeeper = state.timekeeper.lock().unwrap();
                timekeeper.set_manual(now.naive_utc());
            }
            info!("hardware clock set manually to epoch {epoch}");

            write_text(req, "Time settings received and saved successfully.")
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/toggle", Method::Get, move |req| {
            let is_on = !state.relay_on.fetch_xor(true, Ordering::Relaxed);
            state.relay.lock().unwrap().apply(is_on);
            info!("relay toggled {}", if is_on { "on" } else { "off" });
            write_json(req, &RelayStatus { is_on })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/toggleGet", Method::Get, move |req| {
            let payload = RelayStatus {
                is_on: state.relay_on.load(Ordering::Relaxed),
            };
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            let payload = {
                let timekeeper = state.timekeeper.lock().unwrap();
                build_time_status(&timekeeper)
            };
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/resync", Method::Post, move |req| {
            let network_ready = state.network_ready.load(Ordering::Relaxed);
            let payload = {
                let mut timekeeper = state.timekeeper.lock().unwrap();
                let synced = timekeeper.resync(network_ready);
                info!(
                    "network time resync {}: authority={}",
                    if synced { "succeeded" } else { "failed" },
                    timekeeper.authority().as_str()
                );
                build_time_status(&timekeeper)
            };
            write_json(req, &payload)
        })?;
    }

    Ok(server)
}

fn spawn_control_loop(state: SharedState) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();

                let now = {
                    let timekeeper = state.timekeeper.lock().unwrap();
                    timekeeper.current_time()
                };

                if let Some(now) = now {
                    let schedule = { *state.schedule.lock().unwrap() };
                    let previous = state.relay_on.load(Ordering::Relaxed);
                    let desired = schedule.evaluate(now, previous);

                    if desired != previous {
                        state.relay_on.store(desired, Ordering::Relaxed);
                        info!(
                            "relay {} at {}",
                            if desired { "on" } else { "off" },
                            now.format("%H:%M:%S")
                        );
                    }
                    state.relay.lock().unwrap().apply(desired);
                }

                thread::sleep(Duration::from_millis(CONTROL_LOOP_PERIOD_MS));
            }
        })
        .expect("failed to spawn control loop thread");
}

/// Terminal signal for dual time-source failure at boot. Deliberate
/// fail-stop: no schedule can be trusted, so the loop never exits.
fn blink_error_forever() -> ! {
    warn!("no usable time source; entering error-signal state");

    let driver = unsafe { PinDriver::output(AnyOutputPin::new(ERROR_LED_PIN)) };
    let mut led = match driver {
        Ok(led) => Some(led),
        Err(err) => {
            warn!("error LED unavailable on GPIO{ERROR_LED_PIN}: {err}");
            None
        }
    };

    let mut lit = false;
    loop {
        lit = !lit;
        if let Some(led) = led.as_mut() {
            let result = if lit { led.set_high() } else { led.set_low() };
            if let Err(err) = result {
                warn!("failed to drive error LED: {err}");
            }
        }
        thread::sleep(Duration::from_millis(ERROR_BLINK_HALF_PERIOD_MS));
    }
}

fn build_time_status(timekeeper: &EspTimeKeeper) -> TimeStatus {
    TimeStatus {
        authority: timekeeper.authority().as_str(),
        hardware_healthy: timekeeper.hardware_health().is_healthy(),
        network_healthy: timekeeper.network_health().is_healthy(),
        now_epoch: timekeeper
            .current_time()
            .map(|now| now.and_utc().timestamp()),
    }
}

fn schedule_restart() {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_text(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    message: &str,
) -> anyhow::Result<()> {
    req.into_ok_response()?.write_all(message.as_bytes())?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<DeviceConfig>(value)?),
            None => Ok(DeviceConfig::default()),
        }
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(config)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn local_now() -> Timestamp {
    let offset = FixedOffset::east_opt(NTP_UTC_OFFSET_SECS).unwrap();
    Utc::now().with_timezone(&offset).naive_local()
}
