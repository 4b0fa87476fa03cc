use chrono::{NaiveDate, NaiveDateTime};

/// Absolute wall-clock instant, whole-second resolution.
pub type Timestamp = NaiveDateTime;

/// Placeholder returned by sources that were never successfully probed.
/// It must never be treated as a real schedule trigger.
pub fn sentinel() -> Timestamp {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub fn is_sentinel(timestamp: Timestamp) -> bool {
    timestamp == sentinel()
}

/// A clock that can be probed once for availability and then read repeatedly.
///
/// `probe` is the one-time initialization/sync attempt; it is never retried
/// automatically. `read` is only meaningful after a successful probe and
/// returns the sentinel otherwise.
pub trait TimeSource {
    fn probe(&mut self) -> bool;
    fn read(&self) -> Timestamp;
}

/// A battery-backed clock that can additionally be set.
pub trait HardwareClock: TimeSource {
    fn adjust(&mut self, now: Timestamp);
}

/// Availability of a single time source across the session.
///
/// Set once by the startup probe, changed only by an explicit resync,
/// reset by a full restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHealth {
    Unprobed,
    Healthy,
    Failed,
}

impl SourceHealth {
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    fn from_probe(success: bool) -> Self {
        if success {
            Self::Healthy
        } else {
            Self::Failed
        }
    }
}

/// Which source the control loop trusts for "now".
///
/// Fixed at startup: network time is authoritative when reachable, the
/// hardware clock is the durable fallback, and `NoSource` is terminal for
/// normal operation (the caller must fail-stop, not evaluate schedules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAuthority {
    NetworkTrusted,
    HardwareTrusted,
    NoSource,
}

impl TimeAuthority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTrusted => "NETWORK",
            Self::HardwareTrusted => "HARDWARE",
            Self::NoSource => "NONE",
        }
    }
}

/// Owns both time sources and reconciles them.
///
/// Inter-source disagreement is resolved once at boot by letting the network
/// reading overwrite the hardware clock; it is not renegotiated per cycle.
#[derive(Debug)]
pub struct TimeKeeper<H, N> {
    hardware: H,
    network: N,
    hardware_health: SourceHealth,
    network_health: SourceHealth,
    authority: TimeAuthority,
}

impl<H: HardwareClock, N: TimeSource> TimeKeeper<H, N> {
    pub fn new(hardware: H, network: N) -> Self {
        Self {
            hardware,
            network,
            hardware_health: SourceHealth::Unprobed,
            network_health: SourceHealth::Unprobed,
            authority: TimeAuthority::NoSource,
        }
    }

    /// One-shot boot sequence: probe the hardware clock, probe the network
    /// source if provisioning reported the network ready, seed the hardware
    /// clock from the network reading, then fix the authority.
    pub fn startup_sync(&mut self, network_ready: bool) -> TimeAuthority {
        self.hardware_health = SourceHealth::from_probe(self.hardware.probe());
        self.network_health = if network_ready {
            SourceHealth::from_probe(self.network.probe())
        } else {
            SourceHealth::Failed
        };

        self.seed_hardware_from_network();
        self.authority = self.select_authority();
        self.authority
    }

    /// Explicit maintenance re-probe of the network source. Never invoked
    /// automatically by the control loop.
    pub fn resync(&mut self, network_ready: bool) -> bool {
        if !network_ready {
            return false;
        }

        self.network_health = SourceHealth::from_probe(self.network.probe());
        self.seed_hardware_from_network();
        self.authority = self.select_authority();
        self.network_health.is_healthy()
    }

    /// Direct hardware-clock adjustment, bypassing reconciliation. Used by
    /// the manual time-set endpoint; does not change the fixed authority.
    pub fn set_manual(&mut self, now: Timestamp) {
        self.hardware.adjust(now);
    }

    /// Live read of the trusted source. `None` in `NoSource`, and also when
    /// the trusted source hands back the sentinel; schedule evaluation must
    /// not run on either.
    pub fn current_time(&self) -> Option<Timestamp> {
        let now = match self.authority {
            TimeAuthority::NetworkTrusted => self.network.read(),
            TimeAuthority::HardwareTrusted => self.hardware.read(),
            TimeAuthority::NoSource => return None,
        };

        if is_sentinel(now) {
            return None;
        }
        Some(now)
    }

    pub fn authority(&self) -> TimeAuthority {
        self.authority
    }

    pub fn hardware_health(&self) -> SourceHealth {
        self.hardware_health
    }

    pub fn network_health(&self) -> SourceHealth {
        self.network_health
    }

    fn seed_hardware_from_network(&mut self) {
        if !self.network_health.is_healthy() || !self.hardware_health.is_healthy() {
            return;
        }

        let now = self.network.read();
        if !is_sentinel(now) {
            self.hardware.adjust(now);
        }
    }

    fn select_authority(&self) -> TimeAuthority {
        if self.network_health.is_healthy() {
            TimeAuthority::NetworkTrusted
        } else if self.hardware_health.is_healthy() {
            TimeAuthority::HardwareTrusted
        } else {
            TimeAuthority::NoSource
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FakeClock {
        available: bool,
        now: Timestamp,
        adjusted_to: Option<Timestamp>,
    }

    impl FakeClock {
        fn healthy(now: Timestamp) -> Self {
            Self {
                available: true,
                now,
                adjusted_to: None,
            }
        }

        fn broken() -> Self {
            Self {
                available: false,
                now: sentinel(),
                adjusted_to: None,
            }
        }
    }

    impl TimeSource for FakeClock {
        fn probe(&mut self) -> bool {
            self.available
        }

        fn read(&self) -> Timestamp {
            self.now
        }
    }

    impl HardwareClock for FakeClock {
        fn adjust(&mut self, now: Timestamp) {
            self.now = now;
            self.adjusted_to = Some(now);
        }
    }

    fn at(hour: u32, minute: u32, second: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    #[test]
    fn network_success_trusts_network_and_seeds_hardware() {
        let network_now = at(10, 30, 0);
        let hardware = FakeClock::healthy(at(10, 15, 0));
        let network = FakeClock::healthy(network_now);

        let mut keeper = TimeKeeper::new(hardware, network);
        let authority = keeper.startup_sync(true);

        assert_eq!(authority, TimeAuthority::NetworkTrusted);
        assert_eq!(keeper.current_time(), Some(network_now));
        assert_eq!(keeper.hardware.adjusted_to, Some(network_now));
    }

    #[test]
    fn network_failure_falls_back_to_hardware() {
        let hardware_now = at(7, 45, 12);
        let mut keeper = TimeKeeper::new(FakeClock::healthy(hardware_now), FakeClock::broken());

        let authority = keeper.startup_sync(true);

        assert_eq!(authority, TimeAuthority::HardwareTrusted);
        assert_eq!(keeper.current_time(), Some(hardware_now));
        assert_eq!(keeper.hardware.adjusted_to, None);
    }

    #[test]
    fn network_not_ready_skips_network_probe() {
        let hardware_now = at(7, 45, 12);
        let mut keeper = TimeKeeper::new(
            FakeClock::healthy(hardware_now),
            FakeClock::healthy(at(9, 0, 0)),
        );

        let authority = keeper.startup_sync(false);

        assert_eq!(authority, TimeAuthority::HardwareTrusted);
        assert_eq!(keeper.network_health(), SourceHealth::Failed);
        assert_eq!(keeper.current_time(), Some(hardware_now));
    }

    #[test]
    fn dual_failure_yields_no_source_and_no_time() {
        let mut keeper = TimeKeeper::new(FakeClock::broken(), FakeClock::broken());

        let authority = keeper.startup_sync(true);

        assert_eq!(authority, TimeAuthority::NoSource);
        assert_eq!(keeper.current_time(), None);
    }

    #[test]
    fn sentinel_reading_is_never_surfaced() {
        // A source can be marked healthy yet still hand back the sentinel
        // (e.g. an unset RTC); the keeper must hide it from the loop.
        let mut keeper = TimeKeeper::new(FakeClock::healthy(sentinel()), FakeClock::broken());
        keeper.startup_sync(true);

        assert_eq!(keeper.authority(), TimeAuthority::HardwareTrusted);
        assert_eq!(keeper.current_time(), None);
    }

    #[test]
    fn health_flags_untouched_between_explicit_syncs() {
        let mut keeper = TimeKeeper::new(FakeClock::healthy(at(6, 0, 0)), FakeClock::broken());
        keeper.startup_sync(true);

        // The network source coming back does not matter until a resync.
        keeper.network.available = true;
        keeper.network.now = at(6, 1, 0);

        assert_eq!(keeper.network_health(), SourceHealth::Failed);
        assert_eq!(keeper.authority(), TimeAuthority::HardwareTrusted);
    }

    #[test]
    fn resync_upgrades_authority_and_reseeds() {
        let mut keeper = TimeKeeper::new(FakeClock::healthy(at(6, 0, 0)), FakeClock::broken());
        keeper.startup_sync(true);
        assert_eq!(keeper.authority(), TimeAuthority::HardwareTrusted);

        let network_now = at(6, 2, 30);
        keeper.network.available = true;
        keeper.network.now = network_now;

        assert!(keeper.resync(true));
        assert_eq!(keeper.authority(), TimeAuthority::NetworkTrusted);
        assert_eq!(keeper.current_time(), Some(network_now));
        assert_eq!(keeper.hardware.adjusted_to, Some(network_now));
    }

    #[test]
    fn manual_set_adjusts_hardware_without_changing_authority() {
        let mut keeper = TimeKeeper::new(FakeClock::healthy(at(6, 0, 0)), FakeClock::broken());
        keeper.startup_sync(true);

        let corrected = at(18, 20, 0);
        keeper.set_manual(corrected);

        assert_eq!(keeper.authority(), TimeAuthority::HardwareTrusted);
        assert_eq!(keeper.current_time(), Some(corrected));
    }
}
