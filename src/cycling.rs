//! Compressor cycling telemetry.
//!
//! The heat pump's compressor status is one of the polled parameters;
//! watching its transitions after each poll cycle yields start counts,
//! run lengths and short-cycle warnings without any extra bus traffic.
//! Also home to the one-shot anti-cycling startup defaults: protective
//! minimum work/break timers written through the normal write path when
//! the controller has them disabled.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

use crate::cache::ParameterCache;
use crate::codec::Value;
use crate::error::WriteError;
use crate::handler::BusHandler;

/// Stored index of HPStatusComprStat (0 = off, 1 = on).
const COMPR_STAT_INDEX: u32 = 1363;
/// Protective timer parameters.
const MIN_WORK_TIME_INDEX: u32 = 498;
const MIN_BREAK_TIME_INDEX: u32 = 499;
const COUNTER_MIN_WORK_INDEX: u32 = 504;
const COUNTER_MIN_BREAK_INDEX: u32 = 505;
/// Temperature context read alongside the metrics.
const TEMP_OUTLET_INDEX: u32 = 75;
const TEMP_RETURN_INDEX: u32 = 74;
const TEMP_WEATHER_INDEX: u32 = 68;
const PRESET_TEMP_INDEX: u32 = 1351;

/// Runs shorter than this count as short cycles.
const SHORT_CYCLE_THRESHOLD_SECS: f64 = 300.0;
/// Hard cap on retained events.
const MAX_HISTORY: usize = 200;
const WINDOW_1H_SECS: f64 = 3600.0;
const WINDOW_24H_SECS: f64 = 86_400.0;

/// One compressor state transition. Times are seconds on the monitor's
/// own monotonic clock.
#[derive(Clone, Copy, Debug)]
struct CycleEvent {
    t: f64,
    turned_on: bool,
    /// How long the previous state lasted.
    duration_secs: f64,
}

#[derive(Default)]
struct MonitorState {
    compressor_on: Option<bool>,
    state_since_t: Option<f64>,
    events: Vec<CycleEvent>,
    last_run_secs: Option<f64>,
}

/// Watches the compressor status parameter in the cache after each poll.
pub struct CompressorMonitor {
    epoch: Instant,
    state: Mutex<MonitorState>,
}

impl Default for CompressorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressorMonitor {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn now_t(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Called after every successful poll cycle.
    pub fn update(&self, cache: &ParameterCache) {
        let Some(param) = cache.get(COMPR_STAT_INDEX) else {
            return;
        };
        let is_on = param.value.as_f64().map(|v| v != 0.0).unwrap_or(false);
        let now = self.now_t();

        let mut state = self.state.lock();

        let Some(previous) = state.compressor_on else {
            state.compressor_on = Some(is_on);
            state.state_since_t = Some(now);
            info!("compressor initial state: {}", on_off(is_on));
            return;
        };

        if is_on == previous {
            return;
        }

        let duration_secs = state.state_since_t.map(|since| now - since).unwrap_or(0.0);

        if !is_on {
            state.last_run_secs = Some(duration_secs);
        }

        state.events.push(CycleEvent {
            t: now,
            turned_on: is_on,
            duration_secs,
        });
        state.compressor_on = Some(is_on);
        state.state_since_t = Some(now);

        info!(
            "compressor {} (previous state lasted {duration_secs:.0}s)",
            on_off(is_on)
        );

        prune(&mut state, now);
    }

    /// Count of OFF->ON transitions within the window.
    fn starts_in_window(state: &MonitorState, now: f64, window_secs: f64) -> usize {
        state
            .events
            .iter()
            .filter(|e| e.turned_on && now - e.t <= window_secs)
            .count()
    }

    /// Completed run durations (ON->OFF transitions) within the window.
    fn runs_in_window(state: &MonitorState, now: f64, window_secs: f64) -> Vec<f64> {
        state
            .events
            .iter()
            .filter(|e| !e.turned_on && now - e.t <= window_secs)
            .map(|e| e.duration_secs)
            .collect()
    }

    /// Metrics snapshot for the REST surface.
    pub fn metrics(&self, cache: &ParameterCache) -> CyclingMetrics {
        let now = self.now_t();
        let mut state = self.state.lock();
        prune(&mut state, now);

        let runs_1h = Self::runs_in_window(&state, now, WINDOW_1H_SECS);
        let avg_run_1h =
            (!runs_1h.is_empty()).then(|| runs_1h.iter().sum::<f64>() / runs_1h.len() as f64);
        let short_cycles_1h = runs_1h
            .iter()
            .filter(|&&d| d < SHORT_CYCLE_THRESHOLD_SECS)
            .count();

        let current_state_secs = state.state_since_t.map(|since| now - since).unwrap_or(0.0);

        let value_at = |index: u32| cache.get(index).map(|p| p.value);

        CyclingMetrics {
            compressor_on: state.compressor_on,
            current_state_seconds: round1(current_state_secs),
            last_run_seconds: state.last_run_secs.map(round1),
            starts_last_hour: Self::starts_in_window(&state, now, WINDOW_1H_SECS),
            starts_last_24h: Self::starts_in_window(&state, now, WINDOW_24H_SECS),
            avg_run_seconds_1h: avg_run_1h.map(round1),
            short_cycle_count_1h: short_cycles_1h,
            min_work_time: value_at(MIN_WORK_TIME_INDEX),
            min_break_time: value_at(MIN_BREAK_TIME_INDEX),
            counter_min_work: value_at(COUNTER_MIN_WORK_INDEX),
            counter_min_break: value_at(COUNTER_MIN_BREAK_INDEX),
            temp_outlet: value_at(TEMP_OUTLET_INDEX),
            temp_return: value_at(TEMP_RETURN_INDEX),
            temp_weather: value_at(TEMP_WEATHER_INDEX),
            preset_temp: value_at(PRESET_TEMP_INDEX),
        }
    }

    #[cfg(test)]
    fn force_transition_age(&self, age_secs: f64) {
        // Backdate every event so window tests need no real waiting.
        let mut state = self.state.lock();
        for event in &mut state.events {
            event.t -= age_secs;
        }
        if let Some(since) = &mut state.state_since_t {
            *since -= age_secs;
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn prune(state: &mut MonitorState, now: f64) {
    state.events.retain(|e| now - e.t <= WINDOW_24H_SECS);
    if state.events.len() > MAX_HISTORY {
        let excess = state.events.len() - MAX_HISTORY;
        state.events.drain(..excess);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CyclingMetrics {
    pub compressor_on: Option<bool>,
    pub current_state_seconds: f64,
    pub last_run_seconds: Option<f64>,
    pub starts_last_hour: usize,
    pub starts_last_24h: usize,
    pub avg_run_seconds_1h: Option<f64>,
    pub short_cycle_count_1h: usize,
    pub min_work_time: Option<Value>,
    pub min_break_time: Option<Value>,
    pub counter_min_work: Option<Value>,
    pub counter_min_break: Option<Value>,
    pub temp_outlet: Option<Value>,
    pub temp_return: Option<Value>,
    pub temp_weather: Option<Value>,
    pub preset_temp: Option<Value>,
}

/// Protective timer defaults applied once after the first successful poll.
#[derive(Clone, Debug)]
pub struct AnticyclingDefaults {
    pub min_work_time: i64,
    pub min_break_time: i64,
}

/// Write the anti-cycling timers if the controller has them at zero
/// (disabled). Non-zero values are manual overrides and stay untouched.
pub async fn apply_anticycling_defaults(
    handler: &BusHandler,
    cache: &ParameterCache,
    defaults: &AnticyclingDefaults,
) {
    let targets = [
        ("minWorkTime", MIN_WORK_TIME_INDEX, defaults.min_work_time),
        ("minBreakTime", MIN_BREAK_TIME_INDEX, defaults.min_break_time),
    ];

    for (name, index, target) in targets {
        let Some(param) = cache.get(index) else {
            warn!("parameter {name} (index {index}) not in cache, skipping");
            continue;
        };

        let current = param.value.as_f64().unwrap_or(0.0);
        if current != 0.0 {
            info!("{name} = {current} (non-zero), respecting manual override");
            continue;
        }

        match handler.write_param(&param.name, Value::Int(target)).await {
            Ok(()) => info!("anti-cycling default applied: {name} = {target}"),
            Err(WriteError::NotAcknowledged) => {
                warn!("anti-cycling write of {name} not acknowledged")
            }
            Err(e) => warn!("failed to write {name}: {e}"),
        }
    }
}
