use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use lightwave_common::{
    sentinel, DeviceConfig, HardwareClock, RelayStatus, Schedule, TimeAuthority, TimeField,
    TimeKeeper, TimeSource, TimeStatus, Timestamp, NTP_UTC_OFFSET_SECS,
};

const RESTART_DELAY_MS: u64 = 500;
const CONTROL_LOOP_PERIOD_MS: u64 = 1_000;
const ERROR_BLINK_HALF_PERIOD_MS: u64 = 500;

/// Simulated battery-backed RTC: keeps an offset against the system clock so
/// manual adjustments and the network seed behave like `rtc.adjust`.
/// `LIGHTWAVE_NO_RTC` makes the startup probe fail, for exercising the
/// fallback paths.
struct SimulatedRtc {
    running: bool,
    offset: chrono::Duration,
}

impl SimulatedRtc {
    fn new() -> Self {
        Self {
            running: false,
            offset: chrono::Duration::zero(),
        }
    }
}

impl TimeSource for SimulatedRtc {
    fn probe(&mut self) -> bool {
        self.running = std::env::var("LIGHTWAVE_NO_RTC").is_err();
        self.running
    }

    fn read(&self) -> Timestamp {
        if !self.running {
            return sentinel();
        }
        local_now() + self.offset
    }
}

impl HardwareClock for SimulatedRtc {
    fn adjust(&mut self, now: Timestamp) {
        self.offset = now - local_now();
    }
}

/// Stand-in for the NTP client: reads the system clock shifted by the fixed
/// offset. `LIGHTWAVE_OFFLINE` makes the probe fail, simulating an
/// unreachable time server.
struct SystemNetworkTime {
    synced: bool,
}

impl SystemNetworkTime {
    fn new() -> Self {
        Self { synced: false }
    }
}

impl TimeSource for SystemNetworkTime {
    fn probe(&mut self) -> bool {
        self.synced = std::env::var("LIGHTWAVE_OFFLINE").is_err();
        self.synced
    }

    fn read(&self) -> Timestamp {
        if !self.synced {
            return sentinel();
        }
        local_now()
    }
}

type HostTimeKeeper = TimeKeeper<SimulatedRtc, SystemNetworkTime>;

#[derive(Clone)]
struct AppState {
    config: Arc<Mutex<DeviceConfig>>,
    schedule: Arc<Mutex<Schedule>>,
    relay_on: Arc<AtomicBool>,
    timekeeper: Arc<Mutex<HostTimeKeeper>>,
    network_ready: Arc<AtomicBool>,
    store: AppStore,
    restart: Arc<Notify>,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
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

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load configuration from store: {err:#}");
        DeviceConfig::default()
    });
    let schedule = config.schedule();
    if !schedule.valid {
        info!("no valid on/off schedule configured yet");
    }

    let network_ready = provision_network(&config);

    let mut timekeeper = TimeKeeper::new(SimulatedRtc::new(), SystemNetworkTime::new());
    let authority = timekeeper.startup_sync(network_ready);
    info!(
        "time sources probed: authority={}, hardware={:?}, network={:?}",
        authority.as_str(),
        timekeeper.hardware_health(),
        timekeeper.network_health(),
    );

    let app_state = AppState {
        config: Arc::new(Mutex::new(config)),
        schedule: Arc::new(Mutex::new(schedule)),
        relay_on: Arc::new(AtomicBool::new(false)),
        timekeeper: Arc::new(Mutex::new(timekeeper)),
        network_ready: Arc::new(AtomicBool::new(network_ready)),
        store,
        restart: Arc::new(Notify::new()),
    };

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/connect", post(handle_connect))
        .route("/api/setup", post(handle_setup))
        .route("/api/setTime", post(handle_set_time))
        .route("/api/toggle", get(handle_toggle))
        .route("/toggleGet", get(handle_toggle_get))
        .route("/api/time", get(handle_get_time))
        .route("/api/resync", post(handle_resync))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state.clone());

    let port = std::env::var("LIGHTWAVE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;
    info!("controller listening on http://{addr}");

    if authority == TimeAuthority::NoSource {
        // The web interface stays reachable on its own tasks, but normal
        // operation halts here: with no trusted time source there is no
        // safe way to run the schedule.
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("http server error: {err:#}");
            }
        });
        blink_error_forever();
    }

    spawn_control_loop(app_state.clone());

    let restart = app_state.restart.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { restart.notified().await })
        .await?;

    info!("restart requested; shutting down for supervisor relaunch");
    Ok(())
}

/// Station association with AP fallback. The host backend has no radio, so
/// this reduces to the network-ready signal the time sync depends on;
/// `LIGHTWAVE_OFFLINE` simulates an unreachable network.
fn provision_network(config: &DeviceConfig) -> bool {
    if config.has_station_credentials() {
        info!("connecting to wifi ssid `{}`", config.ssid);
    } else {
        info!(
            "no station credentials; starting access point `{}`",
            config.ssid_ap
        );
    }

    let ready = std::env::var("LIGHTWAVE_OFFLINE").is_err();
    if !ready {
        warn!("network unavailable; continuing without network time");
    }
    ready
}

fn spawn_control_loop(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_LOOP_PERIOD_MS));

        loop {
            interval.tick().await;

            let now = {
                let timekeeper = state.timekeeper.lock().await;
                timekeeper.current_time()
            };
            let Some(now) = now else {
                continue;
            };

            let schedule = { *state.schedule.lock().await };
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
        }
    });
}

/// Terminal signal for dual time-source failure at boot. Deliberate
/// fail-stop: no schedule can be trusted, so the loop never exits.
fn blink_error_forever() -> ! {
    warn!("no usable time source; entering error-signal state");

    let mut lit = false;
    loop {
        lit = !lit;
        debug!("error indicator {}", if lit { "on" } else { "off" });
        std::thread::sleep(Duration::from_millis(ERROR_BLINK_HALF_PERIOD_MS));
    }
}

async fn handle_connect(
    State(state): State<AppState>,
    Json(update): Json<CredentialsUpdate>,
) -> Response {
    if update.ssid.is_empty() || update.password.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing SSID or Password");
    }

    let mut updated = { state.config.lock().await.clone() };
    updated.set_credentials(update.ssid, update.password);

    if let Err(err) = state.store.save_config(&updated).await {
        warn!("failed to persist wifi credentials: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save Wi-Fi credentials.",
        );
    }

    {
        let mut config = state.config.lock().await;
        *config = updated;
    }

    schedule_restart(&state);
    (
        StatusCode::OK,
        "Wi-Fi credentials received and saved. Attempting to connect...",
    )
        .into_response()
}

async fn handle_setup(
    State(state): State<AppState>,
    Json(update): Json<ScheduleUpdate>,
) -> Response {
    let (Some(on_field), Some(off_field)) = (update.on_time, update.off_time) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing onTime or offTime");
    };

    let on = match on_field.time_of_day() {
        Ok(on) => on,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let off = match off_field.time_of_day() {
        Ok(off) => off,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let mut updated = { state.config.lock().await.clone() };
    updated.set_schedule_fields(on_field, off_field);

    if let Err(err) = state.store.save_config(&updated).await {
        warn!("failed to persist time settings: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save time settings.",
        );
    }

    // Persisted successfully; swap the live schedule before responding so
    // the next control cycle sees the new endpoints.
    {
        let mut config = state.config.lock().await;
        *config = updated;
    }
    {
        let mut schedule = state.schedule.lock().await;
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

    (
        StatusCode::OK,
        "Time settings received and saved successfully.",
    )
        .into_response()
}

async fn handle_set_time(
    State(state): State<AppState>,
    Json(update): Json<TimeUpdate>,
) -> Response {
    let Some(epoch) = update.current_time.filter(|value| *value != 0) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing Current Time");
    };
    let Some(now) = DateTime::from_timestamp(epoch, 0) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid Current Time");
    };

    {
        let mut timekeeper = state.timekeeper.lock().await;
        timekeeper.set_manual(now.naive_utc());
    }
    info!("hardware clock set manually to epoch {epoch}");

    (
        StatusCode::OK,
        "Time settings received and saved successfully.",
    )
        .into_response()
}

async fn handle_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let is_on = !state.relay_on.fetch_xor(true, Ordering::Relaxed);
    info!("relay toggled {}", if is_on { "on" } else { "off" });
    Json(RelayStatus { is_on })
}

async fn handle_toggle_get(State(state): State<AppState>) -> impl IntoResponse {
    Json(RelayStatus {
        is_on: state.relay_on.load(Ordering::Relaxed),
    })
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timekeeper = state.timekeeper.lock().await;
    Json(build_time_status(&timekeeper))
}

async fn handle_resync(State(state): State<AppState>) -> impl IntoResponse {
    let network_ready = state.network_ready.load(Ordering::Relaxed);
    let mut timekeeper = state.timekeeper.lock().await;
    let synced = timekeeper.resync(network_ready);
    info!(
        "network time resync {}: authority={}",
        if synced { "succeeded" } else { "failed" },
        timekeeper.authority().as_str()
    );
    Json(build_time_status(&timekeeper))
}

fn build_time_status(timekeeper: &HostTimeKeeper) -> TimeStatus {
    TimeStatus {
        authority: timekeeper.authority().as_str(),
        hardware_healthy: timekeeper.hardware_health().is_healthy(),
        network_healthy: timekeeper.network_health().is_healthy(),
        now_epoch: timekeeper
            .current_time()
            .map(|now| now.and_utc().timestamp()),
    }
}

fn schedule_restart(state: &AppState) {
    let restart = state.restart.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
        restart.notify_one();
    });
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("LIGHTWAVE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.lightwave"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<DeviceConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn local_now() -> Timestamp {
    let offset = FixedOffset::east_opt(NTP_UTC_OFFSET_SECS).unwrap();
    Utc::now().with_timezone(&offset).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightwave_common::TimeField;

    fn store_at(dir: PathBuf) -> AppStore {
        AppStore {
            config_path: Arc::new(dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lightwave-{label}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn store_round_trips_configuration() {
        let dir = scratch_dir("roundtrip");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let store = store_at(dir.clone());

        let mut config = DeviceConfig::default();
        config.set_schedule_fields(TimeField::Epoch(28_800), TimeField::Epoch(64_800));
        store.save_config(&config).await.unwrap();

        let loaded = store.load_config().await.unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.schedule().valid);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_document_loads_defaults() {
        let dir = scratch_dir("missing");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let loaded = store_at(dir).load_config().await.unwrap();
        assert_eq!(loaded, DeviceConfig::default());
    }

    #[tokio::test]
    async fn save_failure_is_reported_and_leaves_prior_document() {
        let dir = scratch_dir("savefail");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let store = store_at(dir.clone());

        let mut original = DeviceConfig::default();
        original.set_schedule_fields(TimeField::Epoch(28_800), TimeField::Epoch(64_800));
        store.save_config(&original).await.unwrap();

        // A regular file where the store expects its directory forces the
        // write to fail.
        let blocked = AppStore {
            config_path: Arc::new(dir.join("config.json").join("nested.json")),
            lock: Arc::new(Mutex::new(())),
        };
        let mut changed = original.clone();
        changed.set_schedule_fields(TimeField::Epoch(1), TimeField::Epoch(2));
        assert!(blocked.save_config(&changed).await.is_err());

        // The previously persisted schedule is intact.
        let reloaded = store.load_config().await.unwrap();
        assert_eq!(reloaded, original);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
