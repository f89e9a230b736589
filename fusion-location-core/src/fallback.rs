use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    providers::NetworkLocationProvider,
    readings::{LocationMethod, NetworkLocationResult},
    time::elapsed_ms,
};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    /// Governs the automatic trigger only, manual requests always go through.
    pub enabled: bool,
    pub gnss_timeout_ms: u32,
    pub lbs_interval_ms: u32,
    pub wifi_interval_ms: u32,
    pub prefer_wifi: bool,
    pub request_timeout_ms: u32,
    pub max_accuracy_m: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gnss_timeout_ms: 30_000,
            lbs_interval_ms: 60_000,
            wifi_interval_ms: 30_000,
            prefer_wifi: true,
            request_timeout_ms: 20_000,
            max_accuracy_m: 2_000.0,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started { request_id: u32 },
    InProgress,
    CoolingDown { remaining_ms: u64 },
    Unavailable,
    /// the provider declined to start; counts against the cooldown
    Refused,
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Started { request_id } => write!(f, "started (#{})", request_id),
            RequestOutcome::InProgress => write!(f, "already in progress"),
            RequestOutcome::CoolingDown { remaining_ms } => {
                write!(f, "cooling down, {} ms left", remaining_ms)
            }
            RequestOutcome::Unavailable => write!(f, "provider unavailable"),
            RequestOutcome::Refused => write!(f, "refused by provider"),
        }
    }
}

/// A network fix that passed the controller's checks.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AcceptedFix {
    pub method: LocationMethod,
    pub request_id: u32,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProviderState {
    last_request_ms: Option<u64>,
    in_progress: bool,
    request_id: u32,
    started_ms: u64,
}

impl ProviderState {
    fn cooldown_remaining(&self, now_ms: u64, interval_ms: u32) -> u64 {
        match self.last_request_ms {
            Some(t) => (interval_ms as u64).saturating_sub(elapsed_ms(now_ms, t)),
            None => 0,
        }
    }

    fn finish(&mut self, now_ms: u64) {
        self.in_progress = false;
        self.last_request_ms = Some(now_ms);
    }
}

/// Requests cell or Wi-Fi positioning once GNSS has been silent for too
/// long, with an independent cooldown per method.
///
/// Each method cycles `Idle -> Requested -> (Succeeded | Failed) -> Idle`.
#[derive(Debug, Clone)]
pub struct FallbackLocationController {
    config: FallbackConfig,
    lbs: ProviderState,
    wifi: ProviderState,
    next_request_id: u32,
    last_fix_ms: Option<u64>,
}

impl FallbackLocationController {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            lbs: ProviderState::default(),
            wifi: ProviderState::default(),
            next_request_id: 1,
            last_fix_ms: None,
        }
    }

    /// Runtime state (cooldowns, requests in flight) survives reconfiguration.
    pub fn configure(&mut self, config: FallbackConfig) {
        log_info!(
            "fallback location {}, gnss timeout {} ms",
            if config.enabled { "enabled" } else { "disabled" },
            config.gnss_timeout_ms
        );
        self.config = config;
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.lbs = ProviderState::default();
        self.wifi = ProviderState::default();
        self.last_fix_ms = None;
    }

    fn state(&self, method: LocationMethod) -> &ProviderState {
        match method {
            LocationMethod::Lbs => &self.lbs,
            LocationMethod::Wifi => &self.wifi,
        }
    }

    fn state_mut(&mut self, method: LocationMethod) -> &mut ProviderState {
        match method {
            LocationMethod::Lbs => &mut self.lbs,
            LocationMethod::Wifi => &mut self.wifi,
        }
    }

    fn interval_ms(&self, method: LocationMethod) -> u32 {
        match method {
            LocationMethod::Lbs => self.config.lbs_interval_ms,
            LocationMethod::Wifi => self.config.wifi_interval_ms,
        }
    }

    pub fn is_in_progress(&self, method: LocationMethod) -> bool {
        self.state(method).in_progress
    }

    pub fn any_in_progress(&self) -> bool {
        self.lbs.in_progress || self.wifi.in_progress
    }

    pub fn last_request_ms(&self, method: LocationMethod) -> Option<u64> {
        self.state(method).last_request_ms
    }

    pub fn cooldown_remaining_ms(&self, method: LocationMethod, now_ms: u64) -> u64 {
        self.state(method)
            .cooldown_remaining(now_ms, self.interval_ms(method))
    }

    /// Time of the last accepted network fix.
    pub fn last_fix_ms(&self) -> Option<u64> {
        self.last_fix_ms
    }

    pub fn is_gnss_lost(&self, now_ms: u64, last_gnss_fix_ms: u64) -> bool {
        elapsed_ms(now_ms, last_gnss_fix_ms) > self.config.gnss_timeout_ms as u64
    }

    /// Asks the provider for a fix unless one is already in flight or the
    /// method is cooling down.
    pub fn request<N: NetworkLocationProvider>(
        &mut self,
        method: LocationMethod,
        now_ms: u64,
        provider: &mut N,
    ) -> RequestOutcome {
        if !provider.is_available() {
            return RequestOutcome::Unavailable;
        }
        if self.state(method).in_progress {
            return RequestOutcome::InProgress;
        }
        let remaining_ms = self.cooldown_remaining_ms(method, now_ms);
        if remaining_ms > 0 {
            return RequestOutcome::CoolingDown { remaining_ms };
        }

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);

        let state = self.state_mut(method);
        state.last_request_ms = Some(now_ms);
        if provider.start_request(method, request_id) {
            state.in_progress = true;
            state.request_id = request_id;
            state.started_ms = now_ms;
            log_info!("{} location requested (#{})", method_name(method), request_id);
            RequestOutcome::Started { request_id }
        } else {
            log_warn!("{} location request refused", method_name(method));
            RequestOutcome::Refused
        }
    }

    /// Automatic trigger, called every tick. Returns what was attempted, if
    /// anything.
    pub fn update<N: NetworkLocationProvider>(
        &mut self,
        now_ms: u64,
        last_gnss_fix_ms: u64,
        provider: &mut N,
    ) -> Option<RequestOutcome> {
        if !self.config.enabled
            || !provider.is_available()
            || self.any_in_progress()
            || !self.is_gnss_lost(now_ms, last_gnss_fix_ms)
        {
            return None;
        }
        // a fresh network fix is as good as either provider gets
        let min_interval_ms = self.config.lbs_interval_ms.min(self.config.wifi_interval_ms) as u64;
        if self
            .last_fix_ms
            .is_some_and(|t| elapsed_ms(now_ms, t) < min_interval_ms)
        {
            return None;
        }

        let order = if self.config.prefer_wifi {
            [LocationMethod::Wifi, LocationMethod::Lbs]
        } else {
            [LocationMethod::Lbs, LocationMethod::Wifi]
        };
        for method in order {
            if self.cooldown_remaining_ms(method, now_ms) == 0 {
                return Some(self.request(method, now_ms, provider));
            }
        }
        None
    }

    /// Collects answers and expires requests nobody answered. Returns the
    /// newest acceptable fix.
    pub fn poll<N: NetworkLocationProvider>(
        &mut self,
        now_ms: u64,
        provider: &mut N,
    ) -> Option<AcceptedFix> {
        let mut accepted = None;
        while let Some(result) = provider.poll_result() {
            if let Some(fix) = self.handle_result(&result, now_ms) {
                accepted = Some(fix);
            }
        }

        let timeout_ms = self.config.request_timeout_ms as u64;
        for method in [LocationMethod::Lbs, LocationMethod::Wifi] {
            let state = self.state_mut(method);
            if state.in_progress && elapsed_ms(now_ms, state.started_ms) >= timeout_ms {
                state.finish(now_ms);
                log_warn!(
                    "{} location request #{} timed out",
                    method_name(method),
                    state.request_id
                );
            }
        }

        accepted
    }

    fn handle_result(&mut self, result: &NetworkLocationResult, now_ms: u64) -> Option<AcceptedFix> {
        let max_accuracy_m = self.config.max_accuracy_m;
        let state = self.state_mut(result.method);
        if !state.in_progress || state.request_id != result.request_id {
            log_debug!(
                "ignoring late {} result #{}",
                method_name(result.method),
                result.request_id
            );
            return None;
        }
        state.finish(now_ms);

        let plausible = result.valid
            && result.lat.is_finite()
            && result.lng.is_finite()
            && (-90.0..=90.0).contains(&result.lat)
            && (-180.0..=180.0).contains(&result.lng)
            && result.accuracy_m.is_finite()
            && result.accuracy_m <= max_accuracy_m;
        if !plausible {
            log_warn!(
                "{} location #{} failed or too coarse ({} m)",
                method_name(result.method),
                result.request_id,
                result.accuracy_m
            );
            return None;
        }

        self.last_fix_ms = Some(now_ms);
        Some(AcceptedFix {
            method: result.method,
            request_id: result.request_id,
            lat: result.lat,
            lng: result.lng,
            accuracy_m: result.accuracy_m,
        })
    }
}

pub(crate) fn method_name(method: LocationMethod) -> &'static str {
    match method {
        LocationMethod::Lbs => "LBS",
        LocationMethod::Wifi => "WiFi",
    }
}
