//! # Vitals Engine - Metric Recorders for Managed Resources
//!
//! A lock-free library of recorders that summarize the event streams produced
//! by managed resources (attribute reads and writes, operation invocations,
//! notifications, response times) into rates, gauges, timers and
//! queueing-theory availability figures. Every figure can be queried over a
//! fixed family of rolling windows, from one second up to one day.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             VITALS ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  INTERVALS → WINDOWED PRIMITIVES → RECORDERS → DECORATORS → REGISTRY        │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Lock-free**: every mutable field is an atomic cell updated by CAS loops
//! - **Windowed**: second, minute, 5m, 15m, hour, 12h and day windows
//! - **Composable**: rate decorators, range classification, M/M/1 arrivals
//! - **Snapshots**: independent point-in-time copies that never block writers
//!
//! Producers call `update`/`accept` once per observed event; reporting loops
//! read the interval-scoped getters or walk a [`MetricsRegistry`].

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::marker::PhantomData;
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::{ArcSwap, ArcSwapOption, Guard};
use crossbeam::utils::CachePadded;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ----------------------------------------------------------------------------
// String & Collections
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Async Runtime
// ----------------------------------------------------------------------------
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use quanta::Clock;

// ----------------------------------------------------------------------------
// Statistics & Randomness
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;
use rand::Rng;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vitals-engine";
pub const ENGINE_FULL_NAME: &str = "Vitals Metrics Engine";

// ----------------------------------------------------------------------------
// Windows & Sampling
// ----------------------------------------------------------------------------

/// Number of rolling windows every recorder tracks
pub const INTERVAL_COUNT: usize = 7;

/// Default number of samples kept by a reservoir
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 4096;

/// Largest reservoir a recorder may allocate
pub const MAX_RESERVOIR_CAPACITY: usize = 1 << 20;

/// Default EWMA tick (milliseconds)
pub const DEFAULT_EWMA_TICK_MS: u64 = 1000;

/// Largest EWMA tick accepted by the settings (milliseconds)
pub const MAX_EWMA_TICK_MS: u64 = 60_000;

/// Largest server count an arrivals recorder accepts
pub const MAX_CHANNELS: u32 = 1 << 16;

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Scale between the nanosecond representation of a `Duration` and the
/// floating-point unit (microseconds) fed into reservoirs and averages.
const NANOS_PER_SAMPLE_UNIT: f64 = 1_000.0;

/// Start timestamp of a recorder that has not observed anything yet
const NOT_STARTED: u64 = u64::MAX;

// ----------------------------------------------------------------------------
// Reporting & Operator Binary
// ----------------------------------------------------------------------------

/// Default period of the reporting loop (milliseconds)
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 5000;

/// Minimum allowed period of the reporting loop (milliseconds)
pub const MIN_REPORT_INTERVAL_MS: u64 = 100;

/// Default configuration file looked up by the binary
pub const DEFAULT_CONFIG_PATH: &str = "vitals.toml";

/// Prefix of environment variables overriding the configuration file
pub const ENV_PREFIX: &str = "VITALS_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The interval table and the clock every recorder reads its timestamps from.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metrics Intervals - The Fixed Window Table
// ----------------------------------------------------------------------------

/// One of the fixed rolling windows "last", "max in window" and "mean"
/// statistics are computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsInterval {
    Second,
    Minute,
    FiveMinutes,
    FifteenMinutes,
    Hour,
    TwelveHours,
    Day,
}

impl MetricsInterval {
    /// Every interval, shortest first.
    pub const ALL: [MetricsInterval; INTERVAL_COUNT] = [
        MetricsInterval::Second,
        MetricsInterval::Minute,
        MetricsInterval::FiveMinutes,
        MetricsInterval::FifteenMinutes,
        MetricsInterval::Hour,
        MetricsInterval::TwelveHours,
        MetricsInterval::Day,
    ];

    /// Position in [`MetricsInterval::ALL`].
    #[inline]
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// Time-to-live of a window, in whole seconds.
    #[inline]
    pub const fn ttl_secs(self) -> u64 {
        match self {
            MetricsInterval::Second => 1,
            MetricsInterval::Minute => 60,
            MetricsInterval::FiveMinutes => 300,
            MetricsInterval::FifteenMinutes => 900,
            MetricsInterval::Hour => 3_600,
            MetricsInterval::TwelveHours => 43_200,
            MetricsInterval::Day => 86_400,
        }
    }

    #[inline]
    pub const fn ttl(self) -> Duration {
        Duration::from_secs(self.ttl_secs())
    }

    #[inline]
    pub const fn ttl_nanos(self) -> u64 {
        self.ttl_secs() * NANOS_PER_SECOND
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.ttl_secs() as f64
    }

    pub const fn name(self) -> &'static str {
        match self {
            MetricsInterval::Second => "second",
            MetricsInterval::Minute => "minute",
            MetricsInterval::FiveMinutes => "five_minutes",
            MetricsInterval::FifteenMinutes => "fifteen_minutes",
            MetricsInterval::Hour => "hour",
            MetricsInterval::TwelveHours => "twelve_hours",
            MetricsInterval::Day => "day",
        }
    }

    /// Express a duration in units of this interval.
    #[inline]
    pub fn per(self, elapsed: Duration) -> f64 {
        elapsed.as_secs_f64() / self.as_secs_f64()
    }

    /// Decay factor `1 - exp(-tick / ttl)` of an average keyed to this interval.
    pub fn decay_factor(self, tick: Duration) -> f64 {
        1.0 - (-tick.as_secs_f64() / self.as_secs_f64()).exp()
    }

    // ---- Factories for per-window accumulators ----

    /// Counter that restarts from zero whenever this window expires.
    pub fn windowed_counter(self, now: u64) -> WindowedCounter {
        WindowedValue::new(self, 0, now)
    }

    /// Windowed cell restarting from `initial`.
    pub fn windowed_value<V: AtomicRepr>(self, initial: V, now: u64) -> WindowedValue<V> {
        WindowedValue::new(self, initial, now)
    }

    /// Max-in-window detector.
    pub fn peak_detector<V: AtomicRepr>(self, now: u64) -> WindowedValue<V> {
        WindowedValue::new(self, V::LOWEST, now)
    }

    /// Min-in-window detector.
    pub fn floor_detector<V: AtomicRepr>(self, now: u64) -> WindowedValue<V> {
        WindowedValue::new(self, V::HIGHEST, now)
    }

    /// Per-observation moving average keyed to this window.
    pub fn ewma(self, tick: Duration) -> Ewma {
        Ewma::new(self.decay_factor(tick))
    }

    /// Arrival-rate moving average keyed to this window.
    pub fn ewma_rate(self, tick: Duration, now: u64) -> EwmaRate {
        EwmaRate::new(self.decay_factor(tick), tick, now)
    }
}

impl Display for MetricsInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Interval Map - One Slot Per Window
// ----------------------------------------------------------------------------

/// Fixed-size table holding one `T` per [`MetricsInterval`], indexed by the
/// interval's ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMap<T>([T; INTERVAL_COUNT]);

impl<T> IntervalMap<T> {
    pub fn from_fn(mut init: impl FnMut(MetricsInterval) -> T) -> Self {
        Self(std::array::from_fn(|ordinal| init(MetricsInterval::ALL[ordinal])))
    }

    #[inline]
    pub fn get(&self, interval: MetricsInterval) -> &T {
        &self.0[interval.ordinal()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricsInterval, &T)> + '_ {
        MetricsInterval::ALL.into_iter().zip(self.0.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.0.iter()
    }

    pub fn map<U>(&self, mut f: impl FnMut(MetricsInterval, &T) -> U) -> IntervalMap<U> {
        IntervalMap::from_fn(|interval| f(interval, self.get(interval)))
    }
}

impl<T> Index<MetricsInterval> for IntervalMap<T> {
    type Output = T;

    #[inline]
    fn index(&self, interval: MetricsInterval) -> &T {
        self.get(interval)
    }
}

impl<T: Serialize> Serialize for IntervalMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(INTERVAL_COUNT))?;
        for (interval, value) in self.iter() {
            map.serialize_entry(interval.name(), value)?;
        }
        map.end()
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Clock - Monotonic Nanosecond Timestamps
// ----------------------------------------------------------------------------

/// Monotonic clock shared by a family of recorders.
///
/// Timestamps are nanoseconds elapsed since the clock was created, so a
/// recorder and every snapshot taken from it agree on the time base. Backed
/// by `quanta`; tests drive it through `quanta::Clock::mock()`.
#[derive(Debug, Clone)]
pub struct MetricClock {
    clock: Clock,
    epoch: quanta::Instant,
}

impl MetricClock {
    pub fn new() -> Self {
        Self::from_clock(Clock::new())
    }

    pub fn from_clock(clock: Clock) -> Self {
        let epoch = clock.now();
        Self { clock, epoch }
    }

    /// Nanoseconds since the clock's epoch.
    #[inline]
    pub fn now_nanos(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.epoch);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for MetricClock {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Clock> for MetricClock {
    fn from(clock: Clock) -> Self {
        Self::from_clock(clock)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Recorders only fail at construction time; everything after that is
// infallible arithmetic with guarded edge cases. Configuration and the
// operator binary layer their own errors on top.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Recorder Errors
// ----------------------------------------------------------------------------

/// Precondition violations raised while building recorders and registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("Invalid range for '{name}': lower bound {from} is greater than upper bound {to}")]
    InvalidRange { name: String, from: String, to: String },

    #[error("Invalid channel count for '{name}': {channels} (must be between 1 and 65536)")]
    InvalidChannels { name: String, channels: u32 },

    #[error("Invalid reservoir capacity {capacity} (must be between 1 and {max})")]
    InvalidCapacity { capacity: usize, max: usize },

    #[error("Invalid EWMA tick of {tick_ms}ms (must be between 1 and {max_ms}ms)")]
    InvalidTick { tick_ms: u64, max_ms: u64 },

    #[error("Metric '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("Metric '{name}' not found")]
    NotFound { name: String },
}

impl MetricError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MetricError::InvalidRange { .. } => "range",
            MetricError::InvalidChannels { .. } => "channels",
            MetricError::InvalidCapacity { .. } | MetricError::InvalidTick { .. } => "settings",
            MetricError::DuplicateName { .. } | MetricError::NotFound { .. } => "registry",
        }
    }
}

pub type MetricResult<T> = Result<T, MetricError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Engine Errors
// ----------------------------------------------------------------------------

/// Umbrella error of the operator binary.
#[derive(Error, Debug)]
pub enum VitalsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VitalsError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            VitalsError::Config(_) => "config",
            VitalsError::Metric(e) => e.category(),
            VitalsError::Io(_) => "io",
            VitalsError::Serialization(_) => "serialization",
            VitalsError::Internal(_) => "internal",
        }
    }
}

pub type VitalsResult<T> = Result<T, VitalsError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration of the operator binary and of the recorders it builds:
// - TOML file parsing
// - Environment variable overrides (VITALS_SECTION__FIELD)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the vitals engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Defaults applied to every recorder
    #[serde(default)]
    pub recorders: RecorderConfig,

    /// Reporting loop
    #[serde(default)]
    pub report: ReportConfig,

    /// Synthetic workload driven by `vitals simulate`
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let recorders = &self.recorders;
        if recorders.reservoir_capacity == 0 || recorders.reservoir_capacity > MAX_RESERVOIR_CAPACITY {
            return Err(ConfigError::invalid_value(
                "recorders.reservoir_capacity",
                format!("Reservoir capacity must be between 1 and {}", MAX_RESERVOIR_CAPACITY),
            ));
        }
        if recorders.ewma_tick_ms == 0 || recorders.ewma_tick_ms > MAX_EWMA_TICK_MS {
            return Err(ConfigError::invalid_value(
                "recorders.ewma_tick_ms",
                format!("EWMA tick must be between 1 and {}ms", MAX_EWMA_TICK_MS),
            ));
        }

        if self.report.interval_ms < MIN_REPORT_INTERVAL_MS {
            return Err(ConfigError::invalid_value(
                "report.interval_ms",
                format!("Report interval must be at least {}ms", MIN_REPORT_INTERVAL_MS),
            ));
        }

        let simulation = &self.simulation;
        if simulation.producers == 0 {
            return Err(ConfigError::invalid_value(
                "simulation.producers",
                "At least one producer is required",
            ));
        }
        if !(1..=MAX_CHANNELS).contains(&simulation.channels) {
            return Err(ConfigError::invalid_value(
                "simulation.channels",
                format!("Channel count must be between 1 and {}", MAX_CHANNELS),
            ));
        }
        if simulation.mean_response_ms == 0 {
            return Err(ConfigError::invalid_value(
                "simulation.mean_response_ms",
                "Mean response time must be positive",
            ));
        }
        if simulation.normative_from_ms > simulation.normative_to_ms {
            return Err(ConfigError::invalid_value(
                "simulation.normative_from_ms",
                format!(
                    "Lower bound {}ms exceeds upper bound {}ms",
                    simulation.normative_from_ms, simulation.normative_to_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&simulation.failure_ratio) {
            return Err(ConfigError::invalid_value(
                "simulation.failure_ratio",
                "Failure ratio must be within [0, 1]",
            ));
        }

        match self.logging.format.as_str() {
            "json" | "compact" | "pretty" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown log format '{}' (expected json, compact or pretty)", other),
            )),
        }
    }

    /// Create a default config file
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 5.2 Recorder Defaults
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Samples kept by each numeric gauge reservoir
    #[serde(default = "default_reservoir_capacity")]
    pub reservoir_capacity: usize,

    /// Tick length of the arrival-rate averages in milliseconds
    #[serde(default = "default_ewma_tick")]
    pub ewma_tick_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity: default_reservoir_capacity(),
            ewma_tick_ms: default_ewma_tick(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Report Configuration
// ----------------------------------------------------------------------------

/// Output encoding of periodic reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Report period in milliseconds
    #[serde(default = "default_report_interval")]
    pub interval_ms: u64,

    #[serde(default)]
    pub format: ReportFormat,

    /// Reset every recorder after each report
    #[serde(default)]
    pub reset_after_report: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_report_interval(),
            format: ReportFormat::default(),
            reset_after_report: false,
        }
    }
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ----------------------------------------------------------------------------
// 5.4 Simulation Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Concurrent producer tasks
    #[serde(default = "default_producers")]
    pub producers: usize,

    /// Run time in seconds (0 runs until Ctrl-C)
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Mean of the exponentially distributed response times
    #[serde(default = "default_mean_response")]
    pub mean_response_ms: u64,

    /// Channels of the simulated M/M/k service
    #[serde(default = "default_channels")]
    pub channels: u32,

    /// Normative response time range
    #[serde(default = "default_normative_from")]
    pub normative_from_ms: u64,

    #[serde(default = "default_normative_to")]
    pub normative_to_ms: u64,

    /// Share of requests reported as failed
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            duration_secs: default_duration_secs(),
            mean_response_ms: default_mean_response(),
            channels: default_channels(),
            normative_from_ms: default_normative_from(),
            normative_to_ms: default_normative_to(),
            failure_ratio: default_failure_ratio(),
        }
    }
}

impl SimulationConfig {
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

// ---- Default value functions ----

fn default_reservoir_capacity() -> usize {
    DEFAULT_RESERVOIR_CAPACITY
}
fn default_ewma_tick() -> u64 {
    DEFAULT_EWMA_TICK_MS
}
fn default_report_interval() -> u64 {
    DEFAULT_REPORT_INTERVAL_MS
}
fn default_producers() -> usize {
    4
}
fn default_duration_secs() -> u64 {
    30
}
fn default_mean_response() -> u64 {
    40
}
fn default_channels() -> u32 {
    8
}
fn default_normative_from() -> u64 {
    5
}
fn default_normative_to() -> u64 {
    100
}
fn default_failure_ratio() -> f64 {
    0.02
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.6 Recorder Settings - Validated Construction Parameters
// ----------------------------------------------------------------------------

/// Shared construction parameters of a family of recorders.
///
/// Recorders built from the same settings share one clock, so their windows
/// roll over on the same time base.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    clock: MetricClock,
    reservoir_capacity: usize,
    ewma_tick: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            clock: MetricClock::new(),
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
            ewma_tick: Duration::from_millis(DEFAULT_EWMA_TICK_MS),
        }
    }
}

impl RecorderSettings {
    pub fn new(reservoir_capacity: usize, ewma_tick: Duration) -> MetricResult<Self> {
        if reservoir_capacity == 0 || reservoir_capacity > MAX_RESERVOIR_CAPACITY {
            return Err(MetricError::InvalidCapacity {
                capacity: reservoir_capacity,
                max: MAX_RESERVOIR_CAPACITY,
            });
        }
        let tick_ms = u64::try_from(ewma_tick.as_millis()).unwrap_or(u64::MAX);
        if ewma_tick.is_zero() || tick_ms > MAX_EWMA_TICK_MS {
            return Err(MetricError::InvalidTick {
                tick_ms,
                max_ms: MAX_EWMA_TICK_MS,
            });
        }
        Ok(Self {
            clock: MetricClock::new(),
            reservoir_capacity,
            ewma_tick,
        })
    }

    pub fn from_config(config: &RecorderConfig) -> MetricResult<Self> {
        Self::new(config.reservoir_capacity, Duration::from_millis(config.ewma_tick_ms))
    }

    /// Replace the clock, typically with a mocked one.
    pub fn with_clock(mut self, clock: impl Into<MetricClock>) -> Self {
        self.clock = clock.into();
        self
    }

    pub fn clock(&self) -> &MetricClock {
        &self.clock
    }

    pub fn reservoir_capacity(&self) -> usize {
        self.reservoir_capacity
    }

    pub fn ewma_tick(&self) -> Duration {
        self.ewma_tick
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// The library only emits events; the binary installs the subscriber.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> VitalsResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
    };
    installed.map_err(|e| VitalsError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "vitals::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recorders.reservoir_capacity, DEFAULT_RESERVOIR_CAPACITY);
        assert_eq!(config.report.format, ReportFormat::Json);
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = EngineConfig::generate_default_config().unwrap();
        let parsed = EngineConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = EngineConfig::from_str(
            r#"
            [report]
            interval_ms = 250
            format = "text"

            [simulation]
            channels = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.report.interval(), Duration::from_millis(250));
        assert_eq!(config.report.format, ReportFormat::Text);
        assert_eq!(config.simulation.channels, 2);
        assert_eq!(config.simulation.producers, default_producers());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            ("[recorders]\nreservoir_capacity = 0", "recorders.reservoir_capacity"),
            ("[recorders]\newma_tick_ms = 0", "recorders.ewma_tick_ms"),
            ("[report]\ninterval_ms = 10", "report.interval_ms"),
            ("[simulation]\nchannels = 0", "simulation.channels"),
            ("[simulation]\nchannels = 70000", "simulation.channels"),
            (
                "[simulation]\nnormative_from_ms = 50\nnormative_to_ms = 10",
                "simulation.normative_from_ms",
            ),
            ("[simulation]\nfailure_ratio = 1.5", "simulation.failure_ratio"),
            ("[logging]\nformat = \"xml\"", "logging.format"),
        ];
        for (toml_str, expected) in cases {
            match EngineConfig::from_str(toml_str) {
                Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid {}, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            EngineConfig::from_str("[report"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/nonexistent/vitals.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_recorder_settings_validation() {
        assert_eq!(
            RecorderSettings::new(0, Duration::from_secs(1)).unwrap_err(),
            MetricError::InvalidCapacity {
                capacity: 0,
                max: MAX_RESERVOIR_CAPACITY
            }
        );
        assert!(matches!(
            RecorderSettings::new(16, Duration::ZERO),
            Err(MetricError::InvalidTick { tick_ms: 0, .. })
        ));
        let settings = RecorderSettings::from_config(&RecorderConfig::default()).unwrap();
        assert_eq!(settings.reservoir_capacity(), DEFAULT_RESERVOIR_CAPACITY);
        assert_eq!(settings.ewma_tick(), Duration::from_secs(1));
    }
}

// ============================================================================
// SECTION 7: ATOMIC CELLS
// ============================================================================
// Every mutable number in the engine lives in an AtomicU64. Values of other
// types are bit-cast in and out, and updated by CAS retry loops.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Atomic Float - Lock-free f64 Operations
// ----------------------------------------------------------------------------

/// An atomic f64 value using bit casting to AtomicU64.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub const fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }

    /// Swap and return the old value.
    #[inline]
    pub fn swap(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.swap(val.to_bits(), ordering))
    }

    /// Compare and exchange on the bit pattern, so NaN compares equal to itself.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: f64,
        new: f64,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<f64, f64> {
        self.bits
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(f64::from_bits)
            .map_err(f64::from_bits)
    }

    /// Add a value atomically (using CAS loop).
    #[inline]
    pub fn fetch_add(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        let mut current = self.load(AtomicOrdering::Relaxed);
        loop {
            match self.compare_exchange(current, current + val, ordering, AtomicOrdering::Relaxed) {
                Ok(v) => return v,
                Err(v) => current = v,
            }
        }
    }

    /// Replace the value with `f(current)` and return the new value.
    #[inline]
    pub fn update(&self, mut f: impl FnMut(f64) -> f64) -> f64 {
        let mut current = self.load(AtomicOrdering::Acquire);
        loop {
            let next = f(current);
            match self.compare_exchange(current, next, AtomicOrdering::AcqRel, AtomicOrdering::Acquire) {
                Ok(_) => return next,
                Err(v) => current = v,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.load(AtomicOrdering::Relaxed))
    }
}

// ----------------------------------------------------------------------------
// 7.2 Bit Representations
// ----------------------------------------------------------------------------

/// A value that round-trips through a `u64` bit pattern.
///
/// `LOWEST` and `HIGHEST` are the baselines of max- and min-accumulators.
pub trait AtomicRepr: Copy + PartialOrd + Send + Sync + Debug + 'static {
    const LOWEST: Self;
    const HIGHEST: Self;

    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl AtomicRepr for u64 {
    const LOWEST: Self = 0;
    const HIGHEST: Self = u64::MAX;

    #[inline]
    fn to_bits(self) -> u64 {
        self
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits
    }
}

impl AtomicRepr for i64 {
    const LOWEST: Self = i64::MIN;
    const HIGHEST: Self = i64::MAX;

    #[inline]
    fn to_bits(self) -> u64 {
        self as u64
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits as i64
    }
}

impl AtomicRepr for f64 {
    const LOWEST: Self = f64::NEG_INFINITY;
    const HIGHEST: Self = f64::INFINITY;

    #[inline]
    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

impl AtomicRepr for Duration {
    const LOWEST: Self = Duration::ZERO;
    const HIGHEST: Self = Duration::from_nanos(u64::MAX);

    #[inline]
    fn to_bits(self) -> u64 {
        u64::try_from(self.as_nanos()).unwrap_or(u64::MAX)
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        Duration::from_nanos(bits)
    }
}

// ----------------------------------------------------------------------------
// 7.3 Atomic Value - Typed Cell With Max/Min Accumulation
// ----------------------------------------------------------------------------

/// Lock-free cell holding any [`AtomicRepr`] value.
pub struct AtomicValue<V: AtomicRepr> {
    bits: AtomicU64,
    _marker: PhantomData<V>,
}

impl<V: AtomicRepr> AtomicValue<V> {
    pub fn new(value: V) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self) -> V {
        V::from_bits(self.bits.load(AtomicOrdering::Acquire))
    }

    #[inline]
    pub fn store(&self, value: V) {
        self.bits.store(value.to_bits(), AtomicOrdering::Release);
    }

    /// Replace the value with `f(current)` and return the new value.
    pub fn update(&self, mut f: impl FnMut(V) -> V) -> V {
        let mut current = self.bits.load(AtomicOrdering::Acquire);
        loop {
            let next = f(V::from_bits(current));
            match self.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Raise the value to `candidate` if it is greater. Returns the maximum.
    pub fn accumulate_max(&self, candidate: V) -> V {
        accumulate(&self.bits, candidate, |candidate, current| candidate > current)
    }

    /// Lower the value to `candidate` if it is smaller. Returns the minimum.
    pub fn accumulate_min(&self, candidate: V) -> V {
        accumulate(&self.bits, candidate, |candidate, current| candidate < current)
    }

    pub fn snapshot(&self) -> Self {
        Self::new(self.load())
    }
}

impl<V: AtomicRepr> Debug for AtomicValue<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicValue").field(&self.load()).finish()
    }
}

/// CAS loop installing `candidate` while `replaces(candidate, current)` holds.
/// Returns the value left in the cell.
#[inline]
fn accumulate<V: AtomicRepr>(bits: &AtomicU64, candidate: V, replaces: impl Fn(V, V) -> bool) -> V {
    let mut current = bits.load(AtomicOrdering::Acquire);
    loop {
        if !replaces(candidate, V::from_bits(current)) {
            return V::from_bits(current);
        }
        match bits.compare_exchange_weak(
            current,
            candidate.to_bits(),
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            Ok(_) => return candidate,
            Err(actual) => current = actual,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.4 Gauge Values - Numeric Types Recorded by Gauges
// ----------------------------------------------------------------------------

/// A numeric value a gauge can record.
///
/// Reservoirs and averages work in `f64`; durations travel through them as
/// microseconds and come back rounded to whole nanoseconds.
pub trait GaugeValue: AtomicRepr + Default {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;

    fn gauge_view<'a>(gauge: &'a (dyn Gauge<Self> + 'static)) -> GaugeView<'a>;
    fn from_gauge_view<'a>(view: GaugeView<'a>) -> Option<&'a (dyn Gauge<Self> + 'static)>;
    fn normative_view<'a>(normative: &'a (dyn Normative<Self> + 'static)) -> NormativeView<'a>;
    fn from_normative_view<'a>(view: NormativeView<'a>) -> Option<&'a (dyn Normative<Self> + 'static)>;
}

impl GaugeValue for i64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        // saturating cast, NaN maps to 0
        value.round() as i64
    }

    fn gauge_view<'a>(gauge: &'a (dyn Gauge<Self> + 'static)) -> GaugeView<'a> {
        GaugeView::Int(gauge)
    }

    fn from_gauge_view<'a>(view: GaugeView<'a>) -> Option<&'a (dyn Gauge<Self> + 'static)> {
        match view {
            GaugeView::Int(gauge) => Some(gauge),
            _ => None,
        }
    }

    fn normative_view<'a>(normative: &'a (dyn Normative<Self> + 'static)) -> NormativeView<'a> {
        NormativeView::Int(normative)
    }

    fn from_normative_view<'a>(view: NormativeView<'a>) -> Option<&'a (dyn Normative<Self> + 'static)> {
        match view {
            NormativeView::Int(normative) => Some(normative),
            _ => None,
        }
    }
}

impl GaugeValue for f64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    fn gauge_view<'a>(gauge: &'a (dyn Gauge<Self> + 'static)) -> GaugeView<'a> {
        GaugeView::Float(gauge)
    }

    fn from_gauge_view<'a>(view: GaugeView<'a>) -> Option<&'a (dyn Gauge<Self> + 'static)> {
        match view {
            GaugeView::Float(gauge) => Some(gauge),
            _ => None,
        }
    }

    fn normative_view<'a>(normative: &'a (dyn Normative<Self> + 'static)) -> NormativeView<'a> {
        NormativeView::Float(normative)
    }

    fn from_normative_view<'a>(view: NormativeView<'a>) -> Option<&'a (dyn Normative<Self> + 'static)> {
        match view {
            NormativeView::Float(normative) => Some(normative),
            _ => None,
        }
    }
}

impl GaugeValue for Duration {
    #[inline]
    fn to_f64(self) -> f64 {
        self.as_nanos() as f64 / NANOS_PER_SAMPLE_UNIT
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((value * NANOS_PER_SAMPLE_UNIT).round() as u64)
    }

    fn gauge_view<'a>(gauge: &'a (dyn Gauge<Self> + 'static)) -> GaugeView<'a> {
        GaugeView::Duration(gauge)
    }

    fn from_gauge_view<'a>(view: GaugeView<'a>) -> Option<&'a (dyn Gauge<Self> + 'static)> {
        match view {
            GaugeView::Duration(gauge) => Some(gauge),
            _ => None,
        }
    }

    fn normative_view<'a>(normative: &'a (dyn Normative<Self> + 'static)) -> NormativeView<'a> {
        NormativeView::Duration(normative)
    }

    fn from_normative_view<'a>(view: NormativeView<'a>) -> Option<&'a (dyn Normative<Self> + 'static)> {
        match view {
            NormativeView::Duration(normative) => Some(normative),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION 8: WINDOWED PRIMITIVES
// ============================================================================
// Tumbling windows, moving averages, sampling and correlation. Timestamps are
// passed in explicitly (nanoseconds from a MetricClock) so one update reads
// the clock once.
//
// Window policy: a write into an expired window swaps in a fresh window and
// then applies; a read of an expired window returns the baseline and leaves
// the cell untouched.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Windowed Value - Tumbling Counter / Peak / Floor Detector
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Window {
    started_at: u64,
    bits: AtomicU64,
    touched: AtomicBool,
}

impl Window {
    fn new(started_at: u64, bits: u64, touched: bool) -> Self {
        Self {
            started_at,
            bits: AtomicU64::new(bits),
            touched: AtomicBool::new(touched),
        }
    }
}

/// A value that restarts from its baseline whenever its interval elapses.
///
/// The window cell is swapped with a single compare-and-swap on rollover.
/// Updates racing a rollover land in either window but are never lost from
/// the window they landed in.
#[derive(Debug)]
pub struct WindowedValue<V: AtomicRepr> {
    window: ArcSwap<Window>,
    baseline: V,
    ttl: u64,
}

/// Windowed event counter.
pub type WindowedCounter = WindowedValue<u64>;

impl<V: AtomicRepr> WindowedValue<V> {
    pub fn new(interval: MetricsInterval, baseline: V, now: u64) -> Self {
        Self::with_ttl(interval.ttl_nanos(), baseline, now)
    }

    fn with_ttl(ttl: u64, baseline: V, now: u64) -> Self {
        Self {
            window: ArcSwap::from_pointee(Window::new(now, baseline.to_bits(), false)),
            baseline,
            ttl,
        }
    }

    #[inline]
    fn expired(&self, window: &Window, now: u64) -> bool {
        now.saturating_sub(window.started_at) > self.ttl
    }

    /// The window writes at `now` must land in, rolling over if needed.
    fn live(&self, now: u64) -> Guard<Arc<Window>> {
        loop {
            let current = self.window.load();
            if !self.expired(&current, now) {
                return current;
            }
            let fresh = Arc::new(Window::new(now, self.baseline.to_bits(), false));
            // whoever wins the swap, the next load sees a live window
            let _ = self.window.compare_and_swap(&current, fresh);
        }
    }

    /// Apply `f` to the in-window value and return the result.
    pub fn update(&self, now: u64, mut f: impl FnMut(V) -> V) -> V {
        let window = self.live(now);
        let mut current = window.bits.load(AtomicOrdering::Acquire);
        loop {
            let next = f(V::from_bits(current));
            match window.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => {
                    // publish only once a real value is in place
                    window.touched.store(true, AtomicOrdering::Release);
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Max-in-window accumulation. Returns the window's maximum.
    pub fn accumulate_max(&self, candidate: V, now: u64) -> V {
        let window = self.live(now);
        let extreme = accumulate(&window.bits, candidate, |candidate, current| candidate > current);
        window.touched.store(true, AtomicOrdering::Release);
        extreme
    }

    /// Min-in-window accumulation. Returns the window's minimum.
    pub fn accumulate_min(&self, candidate: V, now: u64) -> V {
        let window = self.live(now);
        let extreme = accumulate(&window.bits, candidate, |candidate, current| candidate < current);
        window.touched.store(true, AtomicOrdering::Release);
        extreme
    }

    pub fn set(&self, value: V, now: u64) {
        let window = self.live(now);
        window.bits.store(value.to_bits(), AtomicOrdering::Release);
        window.touched.store(true, AtomicOrdering::Release);
    }

    /// Value of the current window, or the baseline when it has expired.
    pub fn get(&self, now: u64) -> V {
        let window = self.window.load();
        if self.expired(&window, now) {
            self.baseline
        } else {
            V::from_bits(window.bits.load(AtomicOrdering::Acquire))
        }
    }

    /// Like [`get`](Self::get) but `None` when nothing was written to the
    /// current window.
    pub fn observed(&self, now: u64) -> Option<V> {
        let window = self.window.load();
        if self.expired(&window, now) || !window.touched.load(AtomicOrdering::Acquire) {
            None
        } else {
            Some(V::from_bits(window.bits.load(AtomicOrdering::Acquire)))
        }
    }

    pub fn baseline(&self) -> V {
        self.baseline
    }

    pub fn reset(&self, now: u64) {
        self.window
            .store(Arc::new(Window::new(now, self.baseline.to_bits(), false)));
    }

    pub fn snapshot(&self) -> Self {
        let window = self.window.load();
        Self {
            window: ArcSwap::from_pointee(Window::new(
                window.started_at,
                window.bits.load(AtomicOrdering::Acquire),
                window.touched.load(AtomicOrdering::Acquire),
            )),
            baseline: self.baseline,
            ttl: self.ttl,
        }
    }
}

impl WindowedValue<u64> {
    /// Add to the in-window count and return the new count.
    pub fn add(&self, delta: u64, now: u64) -> u64 {
        let window = self.live(now);
        let count = window
            .bits
            .fetch_add(delta, AtomicOrdering::AcqRel)
            .wrapping_add(delta);
        window.touched.store(true, AtomicOrdering::Release);
        count
    }
}

// ----------------------------------------------------------------------------
// 8.2 Windowed Text - Max/Min String In Window
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct TextWindow {
    started_at: u64,
    value: Option<Arc<String>>,
}

/// Windowed string box keeping the extreme value by natural ordering.
#[derive(Debug)]
pub struct WindowedText {
    window: ArcSwap<TextWindow>,
    ttl: u64,
}

impl WindowedText {
    pub fn new(interval: MetricsInterval, now: u64) -> Self {
        Self {
            window: ArcSwap::from_pointee(TextWindow {
                started_at: now,
                value: None,
            }),
            ttl: interval.ttl_nanos(),
        }
    }

    fn accumulate(&self, candidate: &str, now: u64, replaces: impl Fn(&str, &str) -> bool) {
        let shared = Arc::new(candidate.to_owned());
        self.window.rcu(|current| {
            if now.saturating_sub(current.started_at) > self.ttl {
                return Arc::new(TextWindow {
                    started_at: now,
                    value: Some(Arc::clone(&shared)),
                });
            }
            match &current.value {
                Some(existing) if !replaces(candidate, existing.as_str()) => Arc::clone(current),
                _ => Arc::new(TextWindow {
                    started_at: current.started_at,
                    value: Some(Arc::clone(&shared)),
                }),
            }
        });
    }

    pub fn accumulate_max(&self, candidate: &str, now: u64) {
        self.accumulate(candidate, now, |candidate, existing| candidate > existing)
    }

    pub fn accumulate_min(&self, candidate: &str, now: u64) {
        self.accumulate(candidate, now, |candidate, existing| candidate < existing)
    }

    pub fn get(&self, now: u64) -> Option<String> {
        let window = self.window.load();
        if now.saturating_sub(window.started_at) > self.ttl {
            return None;
        }
        window.value.as_deref().cloned()
    }

    pub fn reset(&self, now: u64) {
        self.window.store(Arc::new(TextWindow {
            started_at: now,
            value: None,
        }));
    }

    pub fn snapshot(&self) -> Self {
        let window = self.window.load();
        Self {
            window: ArcSwap::from_pointee(TextWindow {
                started_at: window.started_at,
                value: window
                    .value
                    .as_deref()
                    .map(|value| Arc::new(value.clone())),
            }),
            ttl: self.ttl,
        }
    }
}

// ----------------------------------------------------------------------------
// 8.3 Exponential Moving Averages
// ----------------------------------------------------------------------------

/// Per-observation EWMA: `avg += alpha * (x - avg)`. The first observation
/// primes the average.
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    /// NaN until primed
    average: AtomicF64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            average: AtomicF64::new(f64::NAN),
        }
    }

    pub fn accept(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let alpha = self.alpha;
        self.average.update(|average| {
            if average.is_nan() {
                value
            } else {
                average + alpha * (value - average)
            }
        });
    }

    pub fn value(&self) -> f64 {
        let average = self.average.load(AtomicOrdering::Acquire);
        if average.is_nan() {
            0.0
        } else {
            average
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&self) {
        self.average.store(f64::NAN, AtomicOrdering::Release);
    }

    pub fn snapshot(&self) -> Self {
        Self {
            alpha: self.alpha,
            average: self.average.clone(),
        }
    }
}

/// Arrival-rate EWMA.
///
/// Observations accumulate within a fixed tick. When a later access notices
/// that one or more tick boundaries have passed, the finished tick's
/// per-second rate is folded in and every idle tick after it decays the
/// average by `1 - alpha`.
#[derive(Debug)]
pub struct EwmaRate {
    alpha: f64,
    tick_nanos: u64,
    pending: AtomicF64,
    /// Events per second, NaN until the first tick completes
    rate: AtomicF64,
    last_tick: AtomicU64,
}

impl EwmaRate {
    pub fn new(alpha: f64, tick: Duration, now: u64) -> Self {
        let tick_nanos = u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX).max(1);
        Self {
            alpha,
            tick_nanos,
            pending: AtomicF64::new(0.0),
            rate: AtomicF64::new(f64::NAN),
            last_tick: AtomicU64::new(now / tick_nanos),
        }
    }

    pub fn accept(&self, value: f64, now: u64) {
        self.tick(now);
        self.pending.fetch_add(value, AtomicOrdering::AcqRel);
    }

    /// Smoothed events per second.
    pub fn rate(&self, now: u64) -> f64 {
        self.tick(now);
        let rate = self.rate.load(AtomicOrdering::Acquire);
        if rate.is_nan() {
            0.0
        } else {
            rate
        }
    }

    fn tick(&self, now: u64) {
        let current = now / self.tick_nanos;
        let mut last = self.last_tick.load(AtomicOrdering::Acquire);
        loop {
            if current <= last {
                return;
            }
            match self.last_tick.compare_exchange_weak(
                last,
                current,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => last = actual,
            }
        }

        let idle_ticks = (current - last - 1) as f64;
        let tick_secs = self.tick_nanos as f64 / NANOS_PER_SECOND as f64;
        let instant = self.pending.swap(0.0, AtomicOrdering::AcqRel) / tick_secs;
        let alpha = self.alpha;
        self.rate.update(|rate| {
            let folded = if rate.is_nan() {
                instant
            } else {
                rate + alpha * (instant - rate)
            };
            folded * (1.0 - alpha).powf(idle_ticks)
        });
    }

    pub fn reset(&self, now: u64) {
        self.pending.store(0.0, AtomicOrdering::Release);
        self.rate.store(f64::NAN, AtomicOrdering::Release);
        self.last_tick
            .store(now / self.tick_nanos, AtomicOrdering::Release);
    }

    pub fn snapshot(&self) -> Self {
        Self {
            alpha: self.alpha,
            tick_nanos: self.tick_nanos,
            pending: self.pending.clone(),
            rate: self.rate.clone(),
            last_tick: AtomicU64::new(self.last_tick.load(AtomicOrdering::Acquire)),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.4 Reservoir - Uniform Sample For Quantiles
// ----------------------------------------------------------------------------

/// Fixed-capacity uniform sample of a stream (Vitter's algorithm R).
///
/// Slots are claimed with one `fetch_add`; once full, the n-th observation
/// replaces a random slot with probability `capacity / n`. A slot reads as
/// empty until its sample is stored, so readers never see claimed but
/// unwritten slots. Under contention with `reset` a sample offered during
/// the reset may survive it.
pub struct Reservoir {
    slots: Box<[AtomicU64]>,
    seen: AtomicU64,
}

/// NaN is never accepted as a sample, so its bits mark an empty slot.
const EMPTY_SLOT: u64 = 0x7ff8_0000_0000_0000;

impl Reservoir {
    pub fn new(capacity: usize) -> MetricResult<Self> {
        if capacity == 0 || capacity > MAX_RESERVOIR_CAPACITY {
            return Err(MetricError::InvalidCapacity {
                capacity,
                max: MAX_RESERVOIR_CAPACITY,
            });
        }
        Ok(Self::allocate(capacity))
    }

    fn allocate(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| AtomicU64::new(EMPTY_SLOT)).collect(),
            seen: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let index = self.seen.fetch_add(1, AtomicOrdering::AcqRel);
        let capacity = self.slots.len() as u64;
        let slot = if index < capacity {
            index
        } else {
            rand::thread_rng().gen_range(0..=index)
        };
        if slot < capacity {
            self.slots[slot as usize].store(value.to_bits(), AtomicOrdering::Release);
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Observations offered since the last reset.
    pub fn seen(&self) -> u64 {
        self.seen.load(AtomicOrdering::Acquire)
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.filled().count()
    }

    pub fn is_empty(&self) -> bool {
        self.filled().next().is_none()
    }

    fn filled(&self) -> impl Iterator<Item = f64> + '_ {
        self.slots
            .iter()
            .map(|slot| slot.load(AtomicOrdering::Acquire))
            .filter(|&bits| bits != EMPTY_SLOT)
            .map(f64::from_bits)
    }

    pub fn values(&self) -> Vec<f64> {
        self.filled().collect()
    }

    /// Linearly interpolated quantile, `q` clamped to `[0, 1]`. Zero when empty.
    pub fn quantile(&self, q: f64) -> f64 {
        let mut values = self.values();
        if values.is_empty() {
            return 0.0;
        }
        let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };
        values.sort_unstable_by_key(|value| OrderedFloat(*value));

        let position = q * (values.len() - 1) as f64;
        let lower = position.floor() as usize;
        let upper = position.ceil() as usize;
        let weight = position - lower as f64;
        values[lower] + (values[upper] - values[lower]) * weight
    }

    pub fn mean(&self) -> f64 {
        let values = self.values();
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Population standard deviation. Zero when empty.
    pub fn stddev(&self) -> f64 {
        let values = self.values();
        if values.is_empty() {
            return 0.0;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    }

    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.store(EMPTY_SLOT, AtomicOrdering::Release);
        }
        self.seen.store(0, AtomicOrdering::Release);
    }

    pub fn snapshot(&self) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|slot| AtomicU64::new(slot.load(AtomicOrdering::Acquire)))
                .collect(),
            seen: AtomicU64::new(self.seen()),
        }
    }
}

impl Debug for Reservoir {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservoir")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("seen", &self.seen())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 8.5 Online Pearson Correlation
// ----------------------------------------------------------------------------

/// Spread at or below this fraction of the mean's magnitude counts as constant.
const RELATIVE_SPREAD_FLOOR: f64 = 1e-12;

/// Welford co-moments of `(x, y)` pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CoMoments {
    count: u64,
    mean_x: f64,
    mean_y: f64,
    m2_x: f64,
    m2_y: f64,
    c_xy: f64,
}

impl CoMoments {
    fn push(&self, x: f64, y: f64) -> Self {
        let count = self.count + 1;
        let n = count as f64;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        let mean_x = self.mean_x + dx / n;
        let mean_y = self.mean_y + dy / n;
        Self {
            count,
            mean_x,
            mean_y,
            m2_x: self.m2_x + dx * (x - mean_x),
            m2_y: self.m2_y + dy * (y - mean_y),
            c_xy: self.c_xy + dx * (y - mean_y),
        }
    }
}

fn is_flat(m2: f64, mean: f64, n: f64) -> bool {
    m2 / n <= (RELATIVE_SPREAD_FLOOR * mean).powi(2)
}

/// Streaming Pearson coefficient. Each pair swaps in a new set of
/// co-moments so readers always see a consistent state.
#[derive(Debug)]
pub struct OnlineCorrelation {
    moments: ArcSwap<CoMoments>,
}

impl Default for OnlineCorrelation {
    fn default() -> Self {
        Self {
            moments: ArcSwap::from_pointee(CoMoments::default()),
        }
    }
}

impl OnlineCorrelation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, x: f64, y: f64) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }
        self.moments.rcu(|current| current.push(x, y));
    }

    pub fn count(&self) -> u64 {
        self.moments.load().count
    }

    /// Pearson coefficient in `[-1, 1]`; 0 with fewer than two samples or
    /// when either series is constant.
    pub fn coefficient(&self) -> f64 {
        let moments = **self.moments.load();
        if moments.count < 2 {
            return 0.0;
        }
        let n = moments.count as f64;
        if is_flat(moments.m2_x, moments.mean_x, n) || is_flat(moments.m2_y, moments.mean_y, n) {
            return 0.0;
        }

        let r = moments.c_xy / (moments.m2_x * moments.m2_y).sqrt();
        if r.is_nan() {
            0.0
        } else {
            r.clamp(-1.0, 1.0)
        }
    }

    pub fn reset(&self) {
        self.moments.store(Arc::new(CoMoments::default()));
    }

    pub fn snapshot(&self) -> Self {
        Self {
            moments: ArcSwap::from_pointee(**self.moments.load()),
        }
    }
}

#[cfg(test)]
mod primitive_tests {
    use super::*;
    use rstest::rstest;

    const SECOND: u64 = NANOS_PER_SECOND;

    #[test]
    fn test_interval_table() {
        let ttls: Vec<u64> = MetricsInterval::ALL.iter().map(|i| i.ttl_secs()).collect();
        assert_eq!(ttls, vec![1, 60, 300, 900, 3_600, 43_200, 86_400]);
        for (ordinal, interval) in MetricsInterval::ALL.iter().enumerate() {
            assert_eq!(interval.ordinal(), ordinal);
        }
        assert_eq!(MetricsInterval::Minute.per(Duration::from_secs(90)), 1.5);
        assert_eq!(MetricsInterval::FiveMinutes.to_string(), "five_minutes");
    }

    #[test]
    fn test_interval_map_serializes_by_name() {
        let map = IntervalMap::from_fn(|interval| interval.ttl_secs());
        assert_eq!(map[MetricsInterval::Hour], 3_600);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["second"], 1);
        assert_eq!(json["twelve_hours"], 43_200);
    }

    #[rstest]
    #[case::second(MetricsInterval::Second)]
    #[case::minute(MetricsInterval::Minute)]
    #[case::hour(MetricsInterval::Hour)]
    #[case::day(MetricsInterval::Day)]
    fn test_windowed_counter_rolls_over(#[case] interval: MetricsInterval) {
        let counter = interval.windowed_counter(0);
        assert_eq!(counter.add(1, 0), 1);
        assert_eq!(counter.add(2, interval.ttl_nanos()), 3);

        let later = interval.ttl_nanos() + 1;
        // expired reads return the baseline without touching the cell
        assert_eq!(counter.get(later), 0);
        assert_eq!(counter.add(1, later), 1);
        assert_eq!(counter.get(later), 1);
    }

    #[test]
    fn test_peak_and_floor_detectors() {
        let peak = MetricsInterval::Second.peak_detector::<i64>(0);
        let floor = MetricsInterval::Second.floor_detector::<i64>(0);
        assert_eq!(peak.observed(0), None);
        for v in [4, -2, 9, 1] {
            peak.accumulate_max(v, 10);
            floor.accumulate_min(v, 10);
        }
        assert_eq!(peak.observed(20), Some(9));
        assert_eq!(floor.observed(20), Some(-2));
        assert_eq!(peak.observed(3 * SECOND), None);
        assert_eq!(floor.get(3 * SECOND), i64::MAX);
    }

    #[test]
    fn test_observed_peak_is_always_a_written_value() {
        let peak = MetricsInterval::Day.peak_detector::<i64>(0);
        let floor = MetricsInterval::Day.floor_detector::<i64>(0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for v in 0..20_000 {
                    peak.accumulate_max(v, 1);
                    floor.accumulate_min(-v, 1);
                }
            });
            scope.spawn(|| {
                for _ in 0..20_000 {
                    if let Some(max) = peak.observed(1) {
                        assert!(max >= 0, "baseline leaked as a maximum");
                    }
                    if let Some(min) = floor.observed(1) {
                        assert!(min <= 0, "baseline leaked as a minimum");
                    }
                }
            });
        });
        assert_eq!(peak.observed(1), Some(19_999));
        assert_eq!(floor.observed(1), Some(-19_999));
    }

    #[test]
    fn test_windowed_value_snapshot_is_independent() {
        let value = MetricsInterval::Minute.windowed_value(10_i64, 0);
        value.update(1, |v| v + 5);
        let snapshot = value.snapshot();
        value.set(100, 2);
        assert_eq!(snapshot.get(3), 15);
        assert_eq!(value.get(3), 100);
        value.reset(4);
        assert_eq!(value.get(5), 10);
    }

    #[test]
    fn test_windowed_text() {
        let max = WindowedText::new(MetricsInterval::Second, 0);
        let min = WindowedText::new(MetricsInterval::Second, 0);
        for s in ["pear", "apple", "zebra"] {
            max.accumulate_max(s, 1);
            min.accumulate_min(s, 1);
        }
        assert_eq!(max.get(2).as_deref(), Some("zebra"));
        assert_eq!(min.get(2).as_deref(), Some("apple"));
        assert_eq!(max.get(2 * SECOND), None);
        max.accumulate_max("banana", 2 * SECOND);
        assert_eq!(max.get(2 * SECOND).as_deref(), Some("banana"));
    }

    #[test]
    fn test_ewma_primes_then_decays() {
        let ewma = Ewma::new(0.5);
        assert_eq!(ewma.value(), 0.0);
        ewma.accept(10.0);
        assert_eq!(ewma.value(), 10.0);
        ewma.accept(20.0);
        assert_eq!(ewma.value(), 15.0);
        ewma.accept(f64::NAN);
        assert_eq!(ewma.value(), 15.0);
        ewma.reset();
        assert_eq!(ewma.value(), 0.0);
    }

    #[test]
    fn test_decay_factor() {
        let alpha = MetricsInterval::Second.decay_factor(Duration::from_secs(1));
        assert!((alpha - (1.0 - (-1.0_f64).exp())).abs() < 1e-12);
        assert!(MetricsInterval::Day.decay_factor(Duration::from_secs(1)) < 1e-4);
    }

    #[test]
    fn test_ewma_rate_ticks() {
        let rate = EwmaRate::new(0.5, Duration::from_secs(1), 0);
        for _ in 0..10 {
            rate.accept(1.0, SECOND / 2);
        }
        // tick still open
        assert_eq!(rate.rate(SECOND - 1), 0.0);
        // first completed tick primes the average
        assert_eq!(rate.rate(SECOND), 10.0);
        // one empty tick folds in a zero rate
        assert_eq!(rate.rate(2 * SECOND), 5.0);
        // two more idle ticks: one fold plus one decay
        assert_eq!(rate.rate(4 * SECOND), 1.25);

        let snapshot = rate.snapshot();
        rate.reset(4 * SECOND);
        assert_eq!(rate.rate(5 * SECOND), 0.0);
        assert_eq!(snapshot.rate(4 * SECOND), 1.25);
    }

    #[test]
    fn test_reservoir_quantiles() {
        assert!(Reservoir::new(0).is_err());
        assert!(Reservoir::new(MAX_RESERVOIR_CAPACITY + 1).is_err());

        let reservoir = Reservoir::new(16).unwrap();
        assert_eq!(reservoir.quantile(0.5), 0.0);
        assert_eq!(reservoir.stddev(), 0.0);
        for v in 1..=5 {
            reservoir.observe(v as f64);
        }
        assert_eq!(reservoir.len(), 5);
        assert_eq!(reservoir.quantile(0.0), 1.0);
        assert_eq!(reservoir.quantile(0.5), 3.0);
        assert_eq!(reservoir.quantile(0.875), 4.5);
        assert_eq!(reservoir.quantile(7.0), 5.0);
        assert_eq!(reservoir.quantile(-1.0), 1.0);
        assert!((reservoir.stddev() - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_reservoir_stays_bounded() {
        let reservoir = Reservoir::new(64).unwrap();
        for v in 0..10_000 {
            reservoir.observe(v as f64);
        }
        assert_eq!(reservoir.len(), 64);
        assert_eq!(reservoir.seen(), 10_000);
        assert!(reservoir.values().iter().all(|v| (0.0..10_000.0).contains(v)));

        let snapshot = reservoir.snapshot();
        reservoir.reset();
        assert!(reservoir.is_empty());
        assert_eq!(snapshot.len(), 64);
    }

    #[test]
    fn test_reservoir_reads_only_written_samples() {
        let reservoir = Reservoir::new(8).unwrap();
        for v in [100.0, 200.0, 300.0] {
            reservoir.observe(v);
        }
        reservoir.reset();
        assert!(reservoir.values().is_empty());

        reservoir.observe(1.0);
        assert_eq!(reservoir.values(), vec![1.0]);

        // a slot claimed by a writer that has not stored yet
        reservoir.seen.fetch_add(1, AtomicOrdering::AcqRel);
        assert_eq!(reservoir.len(), 1);
        assert_eq!(reservoir.values(), vec![1.0]);
        assert_eq!(reservoir.quantile(0.0), 1.0);
        assert_eq!(reservoir.stddev(), 0.0);
    }

    #[test]
    fn test_correlation() {
        let correlation = OnlineCorrelation::new();
        assert_eq!(correlation.coefficient(), 0.0);
        for i in 0..10 {
            correlation.accept(i as f64, 2.0 * i as f64 + 1.0);
        }
        assert!((correlation.coefficient() - 1.0).abs() < 1e-9);

        let inverse = OnlineCorrelation::new();
        for i in 0..10 {
            inverse.accept(i as f64, -(i as f64));
        }
        assert!((inverse.coefficient() + 1.0).abs() < 1e-9);

        let constant = OnlineCorrelation::new();
        for i in 0..10 {
            constant.accept(i as f64, 3.0);
        }
        assert_eq!(constant.coefficient(), 0.0);
    }

    #[test]
    fn test_correlation_keeps_small_spread() {
        // response times in seconds with microsecond jitter
        let correlation = OnlineCorrelation::new();
        for i in 0..100 {
            correlation.accept(1_000.0 + i as f64 * 1e-6, 0.25 + i as f64 * 1e-9);
        }
        assert!(correlation.coefficient() > 0.999);
        assert_eq!(correlation.count(), 100);

        let snapshot = correlation.snapshot();
        correlation.reset();
        assert_eq!(correlation.coefficient(), 0.0);
        assert!(snapshot.coefficient() > 0.999);
    }

    #[test]
    fn test_duration_sample_conversion() {
        let d = Duration::from_micros(1_234_567);
        assert_eq!(Duration::from_f64(d.to_f64()), d);
        assert_eq!(Duration::from_f64(-4.0), Duration::ZERO);
        assert_eq!(Duration::from_f64(f64::NAN), Duration::ZERO);
        assert_eq!(i64::from_f64(2.6), 3);
    }

    #[test]
    fn test_atomic_value_accumulators() {
        let max = AtomicValue::new(f64::LOWEST);
        let min = AtomicValue::new(f64::HIGHEST);
        for v in [1.5, -3.0, 7.25] {
            max.accumulate_max(v);
            min.accumulate_min(v);
        }
        assert_eq!(max.load(), 7.25);
        assert_eq!(min.load(), -3.0);
        assert_eq!(max.accumulate_max(f64::NAN), 7.25);
    }
}

// ============================================================================
// SECTION 9: METRIC CONTRACTS
// ============================================================================
// `Metric` is the object-safe face every recorder shows to a registry.
// Capability traits (`Rate`, `Gauge<V>`, `Timer`, ...) carry the getters;
// the `as_*` views let a registry filter by capability without downcasting.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Metric & Recorder
// ----------------------------------------------------------------------------

/// A named, resettable, snapshotable metric.
pub trait Metric: Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Clear accumulated state. The metric stays usable.
    fn reset(&self);

    /// Independent point-in-time copy sharing no mutable state with `self`.
    fn boxed_snapshot(&self) -> Box<dyn Metric>;

    fn as_any(&self) -> &dyn Any;

    fn as_rate(&self) -> Option<&(dyn Rate + 'static)> {
        None
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        None
    }

    fn as_string_gauge(&self) -> Option<&(dyn StringGauge + 'static)> {
        None
    }

    fn as_timer(&self) -> Option<&(dyn Timer + 'static)> {
        None
    }

    fn as_flag(&self) -> Option<&(dyn Flag + 'static)> {
        None
    }

    fn as_normative(&self) -> Option<NormativeView<'_>> {
        None
    }

    fn as_arrivals(&self) -> Option<&(dyn Arrivals + 'static)> {
        None
    }
}

/// A metric that accepts typed observations.
pub trait Recorder: Metric + Sized {
    type Input;

    fn record(&self, input: Self::Input);

    /// Typed variant of [`Metric::boxed_snapshot`].
    fn snapshot(&self) -> Self;
}

// ----------------------------------------------------------------------------
// 9.2 Capability Traits
// ----------------------------------------------------------------------------

/// Event rate over the fixed windows.
pub trait Rate: Metric {
    /// Events since start or the last reset.
    fn total_rate(&self) -> u64;

    /// Events in the current window of `interval`.
    fn last_rate(&self, interval: MetricsInterval) -> u64;

    /// Largest window count ever seen for `interval`.
    fn max_rate(&self, interval: MetricsInterval) -> u64;

    /// Smoothed events per `interval`.
    fn mean_rate(&self, interval: MetricsInterval) -> f64;

    /// Total events divided by the time since the first event, in units of
    /// `interval`. Elapsed time is at least one second.
    fn last_mean_rate(&self, interval: MetricsInterval) -> f64;

    /// Busiest one-second window observed inside the current `interval` window.
    fn last_max_rate_per_second(&self, interval: MetricsInterval) -> u64;

    /// Busiest one-minute window observed inside the current `interval` window.
    fn last_max_rate_per_minute(&self, interval: MetricsInterval) -> u64;
}

/// Numeric gauge. Averages, quantiles and deviation are expressed in the
/// sample unit of `V` (see [`GaugeValue::to_f64`]).
pub trait Gauge<V: GaugeValue>: Metric {
    fn last_value(&self) -> V;

    /// All-time maximum; `V::default()` before any observation.
    fn max_value(&self) -> V;

    /// All-time minimum; `V::default()` before any observation.
    fn min_value(&self) -> V;

    /// Maximum within the current window, `None` if the window is empty.
    fn last_max_value(&self, interval: MetricsInterval) -> Option<V>;

    /// Minimum within the current window, `None` if the window is empty.
    fn last_min_value(&self, interval: MetricsInterval) -> Option<V>;

    fn mean_value(&self, interval: MetricsInterval) -> f64;

    fn quantile(&self, q: f64) -> f64;

    fn deviation(&self) -> f64;
}

pub trait StringGauge: Metric {
    /// Empty before any observation, like the bounds below.
    fn last_value(&self) -> String;
    fn max_value(&self) -> String;
    fn min_value(&self) -> String;
    fn last_max_value(&self, interval: MetricsInterval) -> Option<String>;
    fn last_min_value(&self, interval: MetricsInterval) -> Option<String>;
}

/// Duration gauge with a running total and throughput estimates.
pub trait Timer: Gauge<Duration> {
    /// Sum of every recorded duration.
    fn summary_value(&self) -> Duration;

    fn mean_duration(&self, interval: MetricsInterval) -> Duration {
        Duration::from_f64(self.mean_value(interval))
    }

    fn quantile_duration(&self, q: f64) -> Duration {
        Duration::from_f64(self.quantile(q))
    }

    fn deviation_duration(&self) -> Duration {
        Duration::from_f64(self.deviation())
    }

    /// Tasks of mean duration that fit into `interval`.
    fn mean_number_of_completed_tasks(&self, interval: MetricsInterval) -> f64 {
        tasks_per_interval(interval, self.mean_duration(interval))
    }

    /// Tasks of the shortest recorded duration that fit into `interval`.
    fn max_number_of_completed_tasks(&self, interval: MetricsInterval) -> f64 {
        tasks_per_interval(interval, self.min_value())
    }

    /// Tasks of the longest recorded duration that fit into `interval`.
    fn min_number_of_completed_tasks(&self, interval: MetricsInterval) -> f64 {
        tasks_per_interval(interval, self.max_value())
    }
}

fn tasks_per_interval(interval: MetricsInterval, task: Duration) -> f64 {
    if task.is_zero() {
        0.0
    } else {
        interval.as_secs_f64() / task.as_secs_f64()
    }
}

/// Boolean recorder.
pub trait Flag: Metric {
    fn last_value(&self) -> bool;
    fn true_count(&self) -> u64;
    fn false_count(&self) -> u64;
    fn last_true_count(&self, interval: MetricsInterval) -> u64;
    fn last_false_count(&self, interval: MetricsInterval) -> u64;

    fn total_count(&self) -> u64 {
        self.true_count() + self.false_count()
    }

    /// Share of `true` observations, 0 when nothing was observed.
    fn ratio(&self) -> f64 {
        share(self.true_count(), self.total_count())
    }

    fn last_ratio(&self, interval: MetricsInterval) -> f64 {
        let trues = self.last_true_count(interval);
        share(trues, trues + self.last_false_count(interval))
    }
}

/// `part / whole`, or 0 for an empty whole.
#[inline]
fn share(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Classification of observations against a closed range `[from, to]`.
/// Percentages are fractions of 1 and are 0 when nothing was observed.
pub trait Normative<V: GaugeValue>: Metric {
    fn range(&self) -> (V, V);
    fn count(&self, hit: HitResult) -> u64;
    fn total_count(&self) -> u64;

    /// Counts of the current `interval` window indexed like [`HitResult::ALL`].
    /// The three buckets always cover the same window.
    fn last_counts(&self, interval: MetricsInterval) -> [u64; 3];

    fn last_count(&self, hit: HitResult, interval: MetricsInterval) -> u64 {
        self.last_counts(interval)[hit.ordinal()]
    }

    fn last_total_count(&self, interval: MetricsInterval) -> u64 {
        self.last_counts(interval).iter().sum()
    }

    fn percent(&self, hit: HitResult) -> f64 {
        share(self.count(hit), self.total_count())
    }

    fn last_percent(&self, hit: HitResult, interval: MetricsInterval) -> f64 {
        let counts = self.last_counts(interval);
        share(counts[hit.ordinal()], counts.iter().sum())
    }

    fn count_of_less_than_normative(&self) -> u64 {
        self.count(HitResult::LessThanRange)
    }

    fn count_of_normal_values(&self) -> u64 {
        self.count(HitResult::InRange)
    }

    fn count_of_greater_than_normative(&self) -> u64 {
        self.count(HitResult::GreaterThanRange)
    }
}

/// Request/response channel modelled as an M/M/k loss system.
pub trait Arrivals: Metric {
    fn channels(&self) -> u32;

    /// Availability from the current second's rate and the last response time.
    fn instant_availability(&self) -> f64;

    /// Availability from the smoothed rate and response time of `interval`.
    fn mean_availability(&self, interval: MetricsInterval) -> f64;

    /// Share of uptime spent serving requests, at most 1.
    fn efficiency(&self) -> f64;

    /// Pearson correlation between request rate and response time.
    fn correlation(&self) -> f64;

    fn request_rate(&self) -> &(dyn Rate + 'static);

    fn response_time(&self) -> &(dyn Timer + 'static);
}

// ----------------------------------------------------------------------------
// 9.3 Typed Views Over Generic Capabilities
// ----------------------------------------------------------------------------

/// A numeric gauge of one of the supported value types.
#[derive(Debug, Clone, Copy)]
pub enum GaugeView<'a> {
    Int(&'a (dyn Gauge<i64> + 'static)),
    Float(&'a (dyn Gauge<f64> + 'static)),
    Duration(&'a (dyn Gauge<Duration> + 'static)),
}

/// A classifying recorder of one of the supported value types.
#[derive(Debug, Clone, Copy)]
pub enum NormativeView<'a> {
    Int(&'a (dyn Normative<i64> + 'static)),
    Float(&'a (dyn Normative<f64> + 'static)),
    Duration(&'a (dyn Normative<Duration> + 'static)),
}

// ----------------------------------------------------------------------------
// 9.4 Delegation Helpers
// ----------------------------------------------------------------------------
// Composite recorders forward capability getters to an owned component.

macro_rules! delegate_rate {
    ($field:ident) => {
        fn total_rate(&self) -> u64 {
            Rate::total_rate(&self.$field)
        }

        fn last_rate(&self, interval: MetricsInterval) -> u64 {
            Rate::last_rate(&self.$field, interval)
        }

        fn max_rate(&self, interval: MetricsInterval) -> u64 {
            Rate::max_rate(&self.$field, interval)
        }

        fn mean_rate(&self, interval: MetricsInterval) -> f64 {
            Rate::mean_rate(&self.$field, interval)
        }

        fn last_mean_rate(&self, interval: MetricsInterval) -> f64 {
            Rate::last_mean_rate(&self.$field, interval)
        }

        fn last_max_rate_per_second(&self, interval: MetricsInterval) -> u64 {
            Rate::last_max_rate_per_second(&self.$field, interval)
        }

        fn last_max_rate_per_minute(&self, interval: MetricsInterval) -> u64 {
            Rate::last_max_rate_per_minute(&self.$field, interval)
        }
    };
}

macro_rules! delegate_gauge {
    ($value:ty, $field:ident) => {
        fn last_value(&self) -> $value {
            Gauge::<$value>::last_value(&self.$field)
        }

        fn max_value(&self) -> $value {
            Gauge::<$value>::max_value(&self.$field)
        }

        fn min_value(&self) -> $value {
            Gauge::<$value>::min_value(&self.$field)
        }

        fn last_max_value(&self, interval: MetricsInterval) -> Option<$value> {
            Gauge::<$value>::last_max_value(&self.$field, interval)
        }

        fn last_min_value(&self, interval: MetricsInterval) -> Option<$value> {
            Gauge::<$value>::last_min_value(&self.$field, interval)
        }

        fn mean_value(&self, interval: MetricsInterval) -> f64 {
            Gauge::<$value>::mean_value(&self.$field, interval)
        }

        fn quantile(&self, q: f64) -> f64 {
            Gauge::<$value>::quantile(&self.$field, q)
        }

        fn deviation(&self) -> f64 {
            Gauge::<$value>::deviation(&self.$field)
        }
    };
}

macro_rules! delegate_normative {
    ($value:ty, $field:ident) => {
        fn range(&self) -> ($value, $value) {
            Normative::<$value>::range(&self.$field)
        }

        fn count(&self, hit: HitResult) -> u64 {
            Normative::<$value>::count(&self.$field, hit)
        }

        fn last_counts(&self, interval: MetricsInterval) -> [u64; 3] {
            Normative::<$value>::last_counts(&self.$field, interval)
        }

        fn total_count(&self) -> u64 {
            Normative::<$value>::total_count(&self.$field)
        }
    };
}

// ============================================================================
// SECTION 10: SCALAR RECORDERS
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Rate Recorder
// ----------------------------------------------------------------------------

/// Counts events: total, per window, busiest window and smoothed rate.
#[derive(Debug)]
pub struct RateRecorder {
    name: CompactString,
    clock: MetricClock,
    started_at: AtomicU64,
    total: CachePadded<AtomicU64>,
    last: IntervalMap<WindowedCounter>,
    max: IntervalMap<AtomicU64>,
    peak_per_second: IntervalMap<WindowedValue<u64>>,
    peak_per_minute: IntervalMap<WindowedValue<u64>>,
    mean: IntervalMap<EwmaRate>,
}

impl RateRecorder {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_settings(name, &RecorderSettings::default())
    }

    pub fn with_settings(name: impl Into<CompactString>, settings: &RecorderSettings) -> Self {
        let clock = settings.clock().clone();
        let now = clock.now_nanos();
        let tick = settings.ewma_tick();
        Self {
            name: name.into(),
            clock,
            started_at: AtomicU64::new(NOT_STARTED),
            total: CachePadded::new(AtomicU64::new(0)),
            last: IntervalMap::from_fn(|interval| interval.windowed_counter(now)),
            max: IntervalMap::from_fn(|_| AtomicU64::new(0)),
            peak_per_second: IntervalMap::from_fn(|interval| interval.peak_detector(now)),
            peak_per_minute: IntervalMap::from_fn(|interval| interval.peak_detector(now)),
            mean: IntervalMap::from_fn(|interval| interval.ewma_rate(tick, now)),
        }
    }

    /// Mark one event.
    pub fn update(&self) {
        let now = self.clock.now_nanos();
        self.started_at.fetch_min(now, AtomicOrdering::AcqRel);
        self.total.fetch_add(1, AtomicOrdering::AcqRel);

        let mut per_second = 0;
        let mut per_minute = 0;
        for interval in MetricsInterval::ALL {
            let count = self.last[interval].add(1, now);
            self.max[interval].fetch_max(count, AtomicOrdering::AcqRel);
            self.mean[interval].accept(1.0, now);
            match interval {
                MetricsInterval::Second => per_second = count,
                MetricsInterval::Minute => per_minute = count,
                _ => {}
            }
        }
        for interval in MetricsInterval::ALL {
            self.peak_per_second[interval].accumulate_max(per_second, now);
            self.peak_per_minute[interval].accumulate_max(per_minute, now);
        }
    }

    /// Clock timestamp of the first event, if any.
    pub fn started_at(&self) -> Option<u64> {
        match self.started_at.load(AtomicOrdering::Acquire) {
            NOT_STARTED => None,
            started => Some(started),
        }
    }

    pub fn clock(&self) -> &MetricClock {
        &self.clock
    }
}

impl Metric for RateRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self) {
        let now = self.clock.now_nanos();
        self.started_at.store(NOT_STARTED, AtomicOrdering::Release);
        self.total.store(0, AtomicOrdering::Release);
        for interval in MetricsInterval::ALL {
            self.last[interval].reset(now);
            self.max[interval].store(0, AtomicOrdering::Release);
            self.peak_per_second[interval].reset(now);
            self.peak_per_minute[interval].reset(now);
            self.mean[interval].reset(now);
        }
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_rate(&self) -> Option<&(dyn Rate + 'static)> {
        Some(self)
    }
}

impl Recorder for RateRecorder {
    type Input = ();

    fn record(&self, _: ()) {
        self.update();
    }

    fn snapshot(&self) -> Self {
        Self {
            name: self.name.clone(),
            clock: self.clock.clone(),
            started_at: AtomicU64::new(self.started_at.load(AtomicOrdering::Acquire)),
            total: CachePadded::new(AtomicU64::new(self.total_rate())),
            last: self.last.map(|_, counter| counter.snapshot()),
            max: self
                .max
                .map(|_, max| AtomicU64::new(max.load(AtomicOrdering::Acquire))),
            peak_per_second: self.peak_per_second.map(|_, peak| peak.snapshot()),
            peak_per_minute: self.peak_per_minute.map(|_, peak| peak.snapshot()),
            mean: self.mean.map(|_, mean| mean.snapshot()),
        }
    }
}

impl Rate for RateRecorder {
    fn total_rate(&self) -> u64 {
        self.total.load(AtomicOrdering::Acquire)
    }

    fn last_rate(&self, interval: MetricsInterval) -> u64 {
        self.last[interval].get(self.clock.now_nanos())
    }

    fn max_rate(&self, interval: MetricsInterval) -> u64 {
        self.max[interval].load(AtomicOrdering::Acquire)
    }

    fn mean_rate(&self, interval: MetricsInterval) -> f64 {
        self.mean[interval].rate(self.clock.now_nanos()) * interval.as_secs_f64()
    }

    fn last_mean_rate(&self, interval: MetricsInterval) -> f64 {
        let total = self.total_rate();
        let Some(started_at) = self.started_at() else {
            return 0.0;
        };
        if total == 0 {
            return 0.0;
        }
        // the first second counts as a full second
        let elapsed = self
            .clock
            .now_nanos()
            .saturating_sub(started_at)
            .max(NANOS_PER_SECOND);
        total as f64 / (elapsed as f64 / interval.ttl_nanos() as f64)
    }

    fn last_max_rate_per_second(&self, interval: MetricsInterval) -> u64 {
        self.peak_per_second[interval].get(self.clock.now_nanos())
    }

    fn last_max_rate_per_minute(&self, interval: MetricsInterval) -> u64 {
        self.peak_per_minute[interval].get(self.clock.now_nanos())
    }
}

// ----------------------------------------------------------------------------
// 10.2 Numeric Gauge Recorder
// ----------------------------------------------------------------------------

/// Numeric gauge: last value, bounds, windowed bounds, averages and a
/// reservoir for quantiles.
#[derive(Debug)]
pub struct GaugeRecorder<V: GaugeValue> {
    name: CompactString,
    clock: MetricClock,
    last: AtomicValue<V>,
    max: AtomicValue<V>,
    min: AtomicValue<V>,
    observations: AtomicU64,
    window_max: IntervalMap<WindowedValue<V>>,
    window_min: IntervalMap<WindowedValue<V>>,
    mean: IntervalMap<Ewma>,
    reservoir: Reservoir,
}

pub type Gauge64Recorder = GaugeRecorder<i64>;
pub type GaugeFpRecorder = GaugeRecorder<f64>;

impl<V: GaugeValue> GaugeRecorder<V> {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_settings(name, &RecorderSettings::default())
    }

    pub fn with_settings(name: impl Into<CompactString>, settings: &RecorderSettings) -> Self {
        let clock = settings.clock().clone();
        let now = clock.now_nanos();
        let tick = settings.ewma_tick();
        Self {
            name: name.into(),
            clock,
            last: AtomicValue::new(V::default()),
            max: AtomicValue::new(V::LOWEST),
            min: AtomicValue::new(V::HIGHEST),
            observations: AtomicU64::new(0),
            window_max: IntervalMap::from_fn(|interval| interval.peak_detector(now)),
            window_min: IntervalMap::from_fn(|interval| interval.floor_detector(now)),
            mean: IntervalMap::from_fn(|interval| interval.ewma(tick)),
            reservoir: Reservoir::allocate(settings.reservoir_capacity()),
        }
    }

    pub fn accept(&self, value: V) {
        // NaN never enters the bounds or the sample
        if value.partial_cmp(&value).is_none() {
            return;
        }
        let now = self.clock.now_nanos();
        let sample = value.to_f64();
        self.reservoir.observe(sample);
        for ewma in self.mean.values() {
            ewma.accept(sample);
        }
        self.max.accumulate_max(value);
        self.min.accumulate_min(value);
        self.last.store(value);
        self.observations.fetch_add(1, AtomicOrdering::AcqRel);
        for interval in MetricsInterval::ALL {
            self.window_max[interval].accumulate_max(value, now);
            self.window_min[interval].accumulate_min(value, now);
        }
    }

    /// Values accepted since start or the last reset.
    pub fn observations(&self) -> u64 {
        self.observations.load(AtomicOrdering::Acquire)
    }

    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    fn clock(&self) -> &MetricClock {
        &self.clock
    }

    fn bound(&self, cell: &AtomicValue<V>) -> V {
        if self.observations() == 0 {
            V::default()
        } else {
            cell.load()
        }
    }
}

impl<V: GaugeValue> Metric for GaugeRecorder<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self) {
        let now = self.clock.now_nanos();
        self.observations.store(0, AtomicOrdering::Release);
        self.last.store(V::default());
        self.max.store(V::LOWEST);
        self.min.store(V::HIGHEST);
        for interval in MetricsInterval::ALL {
            self.window_max[interval].reset(now);
            self.window_min[interval].reset(now);
            self.mean[interval].reset();
        }
        self.reservoir.reset();
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        Some(V::gauge_view(self))
    }
}

impl<V: GaugeValue> Recorder for GaugeRecorder<V> {
    type Input = V;

    fn record(&self, value: V) {
        self.accept(value);
    }

    fn snapshot(&self) -> Self {
        Self {
            name: self.name.clone(),
            clock: self.clock.clone(),
            last: self.last.snapshot(),
            max: self.max.snapshot(),
            min: self.min.snapshot(),
            observations: AtomicU64::new(self.observations()),
            window_max: self.window_max.map(|_, window| window.snapshot()),
            window_min: self.window_min.map(|_, window| window.snapshot()),
            mean: self.mean.map(|_, ewma| ewma.snapshot()),
            reservoir: self.reservoir.snapshot(),
        }
    }
}

impl<V: GaugeValue> Gauge<V> for GaugeRecorder<V> {
    fn last_value(&self) -> V {
        self.last.load()
    }

    fn max_value(&self) -> V {
        self.bound(&self.max)
    }

    fn min_value(&self) -> V {
        self.bound(&self.min)
    }

    fn last_max_value(&self, interval: MetricsInterval) -> Option<V> {
        self.window_max[interval].observed(self.clock.now_nanos())
    }

    fn last_min_value(&self, interval: MetricsInterval) -> Option<V> {
        self.window_min[interval].observed(self.clock.now_nanos())
    }

    fn mean_value(&self, interval: MetricsInterval) -> f64 {
        self.mean[interval].value()
    }

    fn quantile(&self, q: f64) -> f64 {
        self.reservoir.quantile(q)
    }

    fn deviation(&self) -> f64 {
        self.reservoir.stddev()
    }
}

// ----------------------------------------------------------------------------
// 10.3 String Gauge Recorder
// ----------------------------------------------------------------------------

/// Last, greatest and least string by natural ordering.
#[derive(Debug)]
pub struct StringGaugeRecorder {
    name: CompactString,
    clock: MetricClock,
    last: ArcSwapOption<String>,
    max: ArcSwapOption<String>,
    min: ArcSwapOption<String>,
    window_max: IntervalMap<WindowedText>,
    window_min: IntervalMap<WindowedText>,
}

impl StringGaugeRecorder {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_settings(name, &RecorderSettings::default())
    }

    pub fn with_settings(name: impl Into<CompactString>, settings: &RecorderSettings) -> Self {
        let clock = settings.clock().clone();
        let now = clock.now_nanos();
        Self {
            name: name.into(),
            clock,
            last: ArcSwapOption::empty(),
            max: ArcSwapOption::empty(),
            min: ArcSwapOption::empty(),
            window_max: IntervalMap::from_fn(|interval| WindowedText::new(interval, now)),
            window_min: IntervalMap::from_fn(|interval| WindowedText::new(interval, now)),
        }
    }

    pub fn accept(&self, value: &str) {
        let now = self.clock.now_nanos();
        let shared = Arc::new(value.to_owned());
        self.last.store(Some(Arc::clone(&shared)));
        self.max.rcu(|current| match current {
            Some(existing) if existing.as_str() >= value => current.clone(),
            _ => Some(Arc::clone(&shared)),
        });
        self.min.rcu(|current| match current {
            Some(existing) if existing.as_str() <= value => current.clone(),
            _ => Some(Arc::clone(&shared)),
        });
        for interval in MetricsInterval::ALL {
            self.window_max[interval].accumulate_max(value, now);
            self.window_min[interval].accumulate_min(value, now);
        }
    }
}

fn load_text(cell: &ArcSwapOption<String>) -> String {
    cell.load_full()
        .map(|value| String::clone(&value))
        .unwrap_or_default()
}

fn copy_text(cell: &ArcSwapOption<String>) -> ArcSwapOption<String> {
    ArcSwapOption::new(cell.load_full().map(|value| Arc::new(String::clone(&value))))
}

impl Metric for StringGaugeRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self) {
        let now = self.clock.now_nanos();
        self.last.store(None);
        self.max.store(None);
        self.min.store(None);
        for interval in MetricsInterval::ALL {
            self.window_max[interval].reset(now);
            self.window_min[interval].reset(now);
        }
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_string_gauge(&self) -> Option<&(dyn StringGauge + 'static)> {
        Some(self)
    }
}

impl Recorder for StringGaugeRecorder {
    type Input = String;

    fn record(&self, value: String) {
        self.accept(&value);
    }

    fn snapshot(&self) -> Self {
        Self {
            name: self.name.clone(),
            clock: self.clock.clone(),
            last: copy_text(&self.last),
            max: copy_text(&self.max),
            min: copy_text(&self.min),
            window_max: self.window_max.map(|_, window| window.snapshot()),
            window_min: self.window_min.map(|_, window| window.snapshot()),
        }
    }
}

impl StringGauge for StringGaugeRecorder {
    fn last_value(&self) -> String {
        load_text(&self.last)
    }

    fn max_value(&self) -> String {
        load_text(&self.max)
    }

    fn min_value(&self) -> String {
        load_text(&self.min)
    }

    fn last_max_value(&self, interval: MetricsInterval) -> Option<String> {
        self.window_max[interval].get(self.clock.now_nanos())
    }

    fn last_min_value(&self, interval: MetricsInterval) -> Option<String> {
        self.window_min[interval].get(self.clock.now_nanos())
    }
}

// ----------------------------------------------------------------------------
// 10.4 Timer Recorder
// ----------------------------------------------------------------------------

/// Duration gauge plus the running sum of every recorded duration.
#[derive(Debug)]
pub struct TimerRecorder {
    gauge: GaugeRecorder<Duration>,
    summary: AtomicU64,
}

impl TimerRecorder {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_settings(name, &RecorderSettings::default())
    }

    pub fn with_settings(name: impl Into<CompactString>, settings: &RecorderSettings) -> Self {
        Self {
            gauge: GaugeRecorder::with_settings(name, settings),
            summary: AtomicU64::new(0),
        }
    }

    pub fn update(&self, elapsed: Duration) {
        self.gauge.accept(elapsed);
        self.summary
            .fetch_add(elapsed.to_bits(), AtomicOrdering::AcqRel);
    }

    /// Start timing; the scope records when stopped or dropped.
    pub fn start(&self) -> TimerScope<'_> {
        TimerScope {
            timer: self,
            started_at: self.gauge.clock().now_nanos(),
            armed: true,
        }
    }
}

impl Metric for TimerRecorder {
    fn name(&self) -> &str {
        self.gauge.name()
    }

    fn reset(&self) {
        self.gauge.reset();
        self.summary.store(0, AtomicOrdering::Release);
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        Some(GaugeView::Duration(self))
    }

    fn as_timer(&self) -> Option<&(dyn Timer + 'static)> {
        Some(self)
    }
}

impl Recorder for TimerRecorder {
    type Input = Duration;

    fn record(&self, elapsed: Duration) {
        self.update(elapsed);
    }

    fn snapshot(&self) -> Self {
        Self {
            gauge: self.gauge.snapshot(),
            summary: AtomicU64::new(self.summary.load(AtomicOrdering::Acquire)),
        }
    }
}

impl Gauge<Duration> for TimerRecorder {
    delegate_gauge!(Duration, gauge);
}

impl Timer for TimerRecorder {
    fn summary_value(&self) -> Duration {
        Duration::from_nanos(self.summary.load(AtomicOrdering::Acquire))
    }
}

/// Running measurement started by [`TimerRecorder::start`].
#[derive(Debug)]
pub struct TimerScope<'a> {
    timer: &'a TimerRecorder,
    started_at: u64,
    armed: bool,
}

impl TimerScope<'_> {
    fn elapsed(&self) -> Duration {
        let now = self.timer.gauge.clock().now_nanos();
        Duration::from_nanos(now.saturating_sub(self.started_at))
    }

    /// Record the elapsed time now and return it.
    pub fn stop(mut self) -> Duration {
        self.armed = false;
        let elapsed = self.elapsed();
        self.timer.update(elapsed);
        elapsed
    }

    /// Drop without recording.
    pub fn cancel(mut self) {
        self.armed = false;
    }
}

impl Drop for TimerScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.timer.update(self.elapsed());
        }
    }
}

// ----------------------------------------------------------------------------
// 10.5 Flag Recorder
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct FlagRecorder {
    name: CompactString,
    clock: MetricClock,
    last: AtomicBool,
    true_count: AtomicU64,
    false_count: AtomicU64,
    last_true: IntervalMap<WindowedCounter>,
    last_false: IntervalMap<WindowedCounter>,
}

impl FlagRecorder {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_settings(name, &RecorderSettings::default())
    }

    pub fn with_settings(name: impl Into<CompactString>, settings: &RecorderSettings) -> Self {
        let clock = settings.clock().clone();
        let now = clock.now_nanos();
        Self {
            name: name.into(),
            clock,
            last: AtomicBool::new(false),
            true_count: AtomicU64::new(0),
            false_count: AtomicU64::new(0),
            last_true: IntervalMap::from_fn(|interval| interval.windowed_counter(now)),
            last_false: IntervalMap::from_fn(|interval| interval.windowed_counter(now)),
        }
    }

    pub fn update(&self, value: bool) {
        let now = self.clock.now_nanos();
        self.last.store(value, AtomicOrdering::Release);
        let (total, windows) = if value {
            (&self.true_count, &self.last_true)
        } else {
            (&self.false_count, &self.last_false)
        };
        total.fetch_add(1, AtomicOrdering::AcqRel);
        for counter in windows.values() {
            counter.add(1, now);
        }
    }
}

impl Metric for FlagRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self) {
        let now = self.clock.now_nanos();
        self.last.store(false, AtomicOrdering::Release);
        self.true_count.store(0, AtomicOrdering::Release);
        self.false_count.store(0, AtomicOrdering::Release);
        for interval in MetricsInterval::ALL {
            self.last_true[interval].reset(now);
            self.last_false[interval].reset(now);
        }
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_flag(&self) -> Option<&(dyn Flag + 'static)> {
        Some(self)
    }
}

impl Recorder for FlagRecorder {
    type Input = bool;

    fn record(&self, value: bool) {
        self.update(value);
    }

    fn snapshot(&self) -> Self {
        Self {
            name: self.name.clone(),
            clock: self.clock.clone(),
            last: AtomicBool::new(self.last.load(AtomicOrdering::Acquire)),
            true_count: AtomicU64::new(self.true_count()),
            false_count: AtomicU64::new(self.false_count()),
            last_true: self.last_true.map(|_, counter| counter.snapshot()),
            last_false: self.last_false.map(|_, counter| counter.snapshot()),
        }
    }
}

impl Flag for FlagRecorder {
    fn last_value(&self) -> bool {
        self.last.load(AtomicOrdering::Acquire)
    }

    fn true_count(&self) -> u64 {
        self.true_count.load(AtomicOrdering::Acquire)
    }

    fn false_count(&self) -> u64 {
        self.false_count.load(AtomicOrdering::Acquire)
    }

    fn last_true_count(&self, interval: MetricsInterval) -> u64 {
        self.last_true[interval].get(self.clock.now_nanos())
    }

    fn last_false_count(&self, interval: MetricsInterval) -> u64 {
        self.last_false[interval].get(self.clock.now_nanos())
    }
}

// ============================================================================
// SECTION 11: CLASSIFYING RECORDERS
// ============================================================================
// Observations are bucketed against a closed reference range [from, to].
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Hit Classification
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitResult {
    LessThanRange,
    InRange,
    GreaterThanRange,
}

impl HitResult {
    pub const ALL: [HitResult; 3] = [
        HitResult::LessThanRange,
        HitResult::InRange,
        HitResult::GreaterThanRange,
    ];

    /// Bucket of `value` against `[from, to]`. A value that does not compare
    /// (NaN) is not `>= from` and lands below the range.
    pub fn classify<V: PartialOrd>(value: V, from: V, to: V) -> Self {
        if !(value >= from) {
            HitResult::LessThanRange
        } else if value > to {
            HitResult::GreaterThanRange
        } else {
            HitResult::InRange
        }
    }

    #[inline]
    const fn ordinal(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            HitResult::LessThanRange => "less_than_range",
            HitResult::InRange => "in_range",
            HitResult::GreaterThanRange => "greater_than_range",
        }
    }
}

impl Display for HitResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
struct BucketWindow {
    started_at: u64,
    counts: [AtomicU64; 3],
}

impl BucketWindow {
    fn new(started_at: u64, counts: [u64; 3]) -> Self {
        Self {
            started_at,
            counts: counts.map(AtomicU64::new),
        }
    }

    fn load(&self) -> [u64; 3] {
        std::array::from_fn(|ordinal| self.counts[ordinal].load(AtomicOrdering::Acquire))
    }
}

/// Per-bucket counts of one interval. All three buckets share a window and
/// roll over together, so their sum is the window's total.
#[derive(Debug)]
struct WindowedBuckets {
    window: ArcSwap<BucketWindow>,
    ttl: u64,
}

impl WindowedBuckets {
    fn new(interval: MetricsInterval, now: u64) -> Self {
        Self {
            window: ArcSwap::from_pointee(BucketWindow::new(now, [0; 3])),
            ttl: interval.ttl_nanos(),
        }
    }

    #[inline]
    fn expired(&self, window: &BucketWindow, now: u64) -> bool {
        now.saturating_sub(window.started_at) > self.ttl
    }

    fn hit(&self, hit: HitResult, now: u64) {
        loop {
            let current = self.window.load();
            if !self.expired(&current, now) {
                current.counts[hit.ordinal()].fetch_add(1, AtomicOrdering::AcqRel);
                return;
            }
            let fresh = Arc::new(BucketWindow::new(now, [0; 3]));
            let _ = self.window.compare_and_swap(&current, fresh);
        }
    }

    fn get(&self, now: u64) -> [u64; 3] {
        let window = self.window.load();
        if self.expired(&window, now) {
            [0; 3]
        } else {
            window.load()
        }
    }

    fn reset(&self, now: u64) {
        self.window.store(Arc::new(BucketWindow::new(now, [0; 3])));
    }

    fn snapshot(&self) -> Self {
        let window = self.window.load();
        Self {
            window: ArcSwap::from_pointee(BucketWindow::new(window.started_at, window.load())),
            ttl: self.ttl,
        }
    }
}

#[derive(Debug)]
struct HitCounts {
    totals: [AtomicU64; 3],
    last: IntervalMap<WindowedBuckets>,
}

impl HitCounts {
    fn new(now: u64) -> Self {
        Self {
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            last: IntervalMap::from_fn(|interval| WindowedBuckets::new(interval, now)),
        }
    }

    fn hit(&self, hit: HitResult, now: u64) {
        self.totals[hit.ordinal()].fetch_add(1, AtomicOrdering::AcqRel);
        for buckets in self.last.values() {
            buckets.hit(hit, now);
        }
    }

    fn total(&self, hit: HitResult) -> u64 {
        self.totals[hit.ordinal()].load(AtomicOrdering::Acquire)
    }

    fn reset(&self, now: u64) {
        for total in &self.totals {
            total.store(0, AtomicOrdering::Release);
        }
        for buckets in self.last.values() {
            buckets.reset(now);
        }
    }

    fn snapshot(&self) -> Self {
        Self {
            totals: std::array::from_fn(|ordinal| AtomicU64::new(self.totals[ordinal].load(AtomicOrdering::Acquire))),
            last: self.last.map(|_, buckets| buckets.snapshot()),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Normative Recorder
// ----------------------------------------------------------------------------

/// Counts observations below, inside and above a reference range.
#[derive(Debug)]
pub struct NormativeRecorder<V: GaugeValue> {
    from: V,
    to: V,
    hits: HitCounts,
    observations: RateRecorder,
    clock: MetricClock,
}

pub type Normative64Recorder = NormativeRecorder<i64>;
pub type NormativeFpRecorder = NormativeRecorder<f64>;
pub type NormativeTimerRecorder = NormativeRecorder<Duration>;

impl<V: GaugeValue> NormativeRecorder<V> {
    pub fn new(name: impl Into<CompactString>, from: V, to: V) -> MetricResult<Self> {
        Self::with_settings(name, from, to, &RecorderSettings::default())
    }

    pub fn with_settings(
        name: impl Into<CompactString>,
        from: V,
        to: V,
        settings: &RecorderSettings,
    ) -> MetricResult<Self> {
        let name = name.into();
        // also rejects NaN bounds
        if !(from <= to) {
            warn!(
                target: "vitals::recorders",
                metric = %name,
                from = ?from,
                to = ?to,
                "Rejected normative range"
            );
            return Err(MetricError::InvalidRange {
                name: name.to_string(),
                from: format!("{:?}", from),
                to: format!("{:?}", to),
            });
        }
        let clock = settings.clock().clone();
        let now = clock.now_nanos();
        Ok(Self {
            from,
            to,
            hits: HitCounts::new(now),
            observations: RateRecorder::with_settings(name, settings),
            clock,
        })
    }

    /// Classify and count `value`.
    pub fn accept(&self, value: V) -> HitResult {
        let hit = HitResult::classify(value, self.from, self.to);
        self.hits.hit(hit, self.clock.now_nanos());
        self.observations.update();
        hit
    }

    /// Rate of all classified observations.
    pub fn observations(&self) -> &RateRecorder {
        &self.observations
    }
}

impl<V: GaugeValue> Metric for NormativeRecorder<V> {
    fn name(&self) -> &str {
        self.observations.name()
    }

    fn reset(&self) {
        self.hits.reset(self.clock.now_nanos());
        self.observations.reset();
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_normative(&self) -> Option<NormativeView<'_>> {
        Some(V::normative_view(self))
    }
}

impl<V: GaugeValue> Recorder for NormativeRecorder<V> {
    type Input = V;

    fn record(&self, value: V) {
        self.accept(value);
    }

    fn snapshot(&self) -> Self {
        Self {
            from: self.from,
            to: self.to,
            hits: self.hits.snapshot(),
            observations: self.observations.snapshot(),
            clock: self.clock.clone(),
        }
    }
}

impl<V: GaugeValue> Normative<V> for NormativeRecorder<V> {
    fn range(&self) -> (V, V) {
        (self.from, self.to)
    }

    fn count(&self, hit: HitResult) -> u64 {
        self.hits.total(hit)
    }

    fn last_counts(&self, interval: MetricsInterval) -> [u64; 3] {
        self.hits.last[interval].get(self.clock.now_nanos())
    }

    fn total_count(&self) -> u64 {
        HitResult::ALL.iter().map(|&hit| self.hits.total(hit)).sum()
    }
}

// ----------------------------------------------------------------------------
// 11.3 Ranged Recorders - Gauge/Timer + Classification
// ----------------------------------------------------------------------------

/// Numeric gauge that also classifies every value against a range.
#[derive(Debug)]
pub struct RangedGaugeRecorder<V: GaugeValue> {
    gauge: GaugeRecorder<V>,
    normative: NormativeRecorder<V>,
}

pub type RangedGauge64Recorder = RangedGaugeRecorder<i64>;
pub type RangedGaugeFpRecorder = RangedGaugeRecorder<f64>;

impl<V: GaugeValue> RangedGaugeRecorder<V> {
    pub fn new(name: impl Into<CompactString>, from: V, to: V) -> MetricResult<Self> {
        Self::with_settings(name, from, to, &RecorderSettings::default())
    }

    pub fn with_settings(
        name: impl Into<CompactString>,
        from: V,
        to: V,
        settings: &RecorderSettings,
    ) -> MetricResult<Self> {
        let name = name.into();
        let normative = NormativeRecorder::with_settings(name.clone(), from, to, settings)?;
        Ok(Self {
            gauge: GaugeRecorder::with_settings(name, settings),
            normative,
        })
    }

    pub fn accept(&self, value: V) -> HitResult {
        self.gauge.accept(value);
        self.normative.accept(value)
    }
}

impl<V: GaugeValue> Metric for RangedGaugeRecorder<V> {
    fn name(&self) -> &str {
        self.gauge.name()
    }

    fn reset(&self) {
        self.gauge.reset();
        self.normative.reset();
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        Some(V::gauge_view(self))
    }

    fn as_normative(&self) -> Option<NormativeView<'_>> {
        Some(V::normative_view(self))
    }
}

impl<V: GaugeValue> Recorder for RangedGaugeRecorder<V> {
    type Input = V;

    fn record(&self, value: V) {
        self.accept(value);
    }

    fn snapshot(&self) -> Self {
        Self {
            gauge: self.gauge.snapshot(),
            normative: self.normative.snapshot(),
        }
    }
}

impl<V: GaugeValue> Gauge<V> for RangedGaugeRecorder<V> {
    delegate_gauge!(V, gauge);
}

impl<V: GaugeValue> Normative<V> for RangedGaugeRecorder<V> {
    delegate_normative!(V, normative);
}

/// Timer that also classifies every duration against a range.
#[derive(Debug)]
pub struct RangedTimerRecorder {
    timer: TimerRecorder,
    normative: NormativeTimerRecorder,
}

impl RangedTimerRecorder {
    pub fn new(name: impl Into<CompactString>, from: Duration, to: Duration) -> MetricResult<Self> {
        Self::with_settings(name, from, to, &RecorderSettings::default())
    }

    pub fn with_settings(
        name: impl Into<CompactString>,
        from: Duration,
        to: Duration,
        settings: &RecorderSettings,
    ) -> MetricResult<Self> {
        let name = name.into();
        let normative = NormativeRecorder::with_settings(name.clone(), from, to, settings)?;
        Ok(Self {
            timer: TimerRecorder::with_settings(name, settings),
            normative,
        })
    }

    pub fn update(&self, elapsed: Duration) -> HitResult {
        self.timer.update(elapsed);
        self.normative.accept(elapsed)
    }
}

impl Metric for RangedTimerRecorder {
    fn name(&self) -> &str {
        self.timer.name()
    }

    fn reset(&self) {
        self.timer.reset();
        self.normative.reset();
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        Some(GaugeView::Duration(self))
    }

    fn as_timer(&self) -> Option<&(dyn Timer + 'static)> {
        Some(self)
    }

    fn as_normative(&self) -> Option<NormativeView<'_>> {
        Some(NormativeView::Duration(self))
    }
}

impl Recorder for RangedTimerRecorder {
    type Input = Duration;

    fn record(&self, elapsed: Duration) {
        self.update(elapsed);
    }

    fn snapshot(&self) -> Self {
        Self {
            timer: self.timer.snapshot(),
            normative: self.normative.snapshot(),
        }
    }
}

impl Gauge<Duration> for RangedTimerRecorder {
    delegate_gauge!(Duration, timer);
}

impl Timer for RangedTimerRecorder {
    fn summary_value(&self) -> Duration {
        self.timer.summary_value()
    }
}

impl Normative<Duration> for RangedTimerRecorder {
    delegate_normative!(Duration, normative);
}

// ============================================================================
// SECTION 12: RATED DECORATORS
// ============================================================================

/// Adds an independent [`RateRecorder`] to any recorder. Every observation
/// marks the rate first and is then handed to the wrapped recorder.
#[derive(Debug)]
pub struct Rated<R: Recorder> {
    rate: RateRecorder,
    inner: R,
}

pub type RatedGauge64Recorder = Rated<Gauge64Recorder>;
pub type RatedGaugeFpRecorder = Rated<GaugeFpRecorder>;
pub type RatedStringGaugeRecorder = Rated<StringGaugeRecorder>;
pub type RatedFlagRecorder = Rated<FlagRecorder>;
pub type RatedTimerRecorder = Rated<TimerRecorder>;

impl<R: Recorder> Rated<R> {
    pub fn new(inner: R) -> Self {
        Self::with_settings(inner, &RecorderSettings::default())
    }

    pub fn with_settings(inner: R, settings: &RecorderSettings) -> Self {
        Self {
            rate: RateRecorder::with_settings(inner.name(), settings),
            inner,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn rate(&self) -> &RateRecorder {
        &self.rate
    }
}

impl<R: Recorder> Metric for Rated<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn reset(&self) {
        self.rate.reset();
        self.inner.reset();
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_rate(&self) -> Option<&(dyn Rate + 'static)> {
        Some(self)
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        self.inner.as_gauge()
    }

    fn as_string_gauge(&self) -> Option<&(dyn StringGauge + 'static)> {
        self.inner.as_string_gauge()
    }

    fn as_timer(&self) -> Option<&(dyn Timer + 'static)> {
        self.inner.as_timer()
    }

    fn as_flag(&self) -> Option<&(dyn Flag + 'static)> {
        self.inner.as_flag()
    }

    fn as_normative(&self) -> Option<NormativeView<'_>> {
        self.inner.as_normative()
    }
}

impl<R: Recorder> Recorder for Rated<R> {
    type Input = R::Input;

    fn record(&self, input: R::Input) {
        self.rate.update();
        self.inner.record(input);
    }

    fn snapshot(&self) -> Self {
        Self {
            rate: self.rate.snapshot(),
            inner: self.inner.snapshot(),
        }
    }
}

impl<R: Recorder> Rate for Rated<R> {
    delegate_rate!(rate);
}

impl<V: GaugeValue, R: Recorder + Gauge<V>> Gauge<V> for Rated<R> {
    delegate_gauge!(V, inner);
}

impl<R: Recorder + Timer> Timer for Rated<R> {
    fn summary_value(&self) -> Duration {
        self.inner.summary_value()
    }
}

impl<R: Recorder + StringGauge> StringGauge for Rated<R> {
    fn last_value(&self) -> String {
        StringGauge::last_value(&self.inner)
    }

    fn max_value(&self) -> String {
        StringGauge::max_value(&self.inner)
    }

    fn min_value(&self) -> String {
        StringGauge::min_value(&self.inner)
    }

    fn last_max_value(&self, interval: MetricsInterval) -> Option<String> {
        StringGauge::last_max_value(&self.inner, interval)
    }

    fn last_min_value(&self, interval: MetricsInterval) -> Option<String> {
        StringGauge::last_min_value(&self.inner, interval)
    }
}

impl<R: Recorder + Flag> Flag for Rated<R> {
    fn last_value(&self) -> bool {
        Flag::last_value(&self.inner)
    }

    fn true_count(&self) -> u64 {
        self.inner.true_count()
    }

    fn false_count(&self) -> u64 {
        self.inner.false_count()
    }

    fn last_true_count(&self, interval: MetricsInterval) -> u64 {
        self.inner.last_true_count(interval)
    }

    fn last_false_count(&self, interval: MetricsInterval) -> u64 {
        self.inner.last_false_count(interval)
    }
}

impl<V: GaugeValue, R: Recorder + Normative<V>> Normative<V> for Rated<R> {
    delegate_normative!(V, inner);
}

// ============================================================================
// SECTION 13: ARRIVALS - M/M/k LOSS SYSTEM
// ============================================================================

/// Availability of a loss system with `channels` servers (Erlang B).
///
/// With `rho = rps * response_time`, availability is
/// `1 - (rho^k / k!) / sum(rho^i / i!, i = 0..=k)`, computed through the
/// recurrence `B(i) = rho B(i-1) / (i + rho B(i-1))`. No channels means no
/// availability; no load means full availability.
pub fn availability(rps: f64, response_time_secs: f64, channels: u32) -> f64 {
    if channels == 0 {
        return 0.0;
    }
    if !(rps > 0.0) || !(response_time_secs > 0.0) {
        return 1.0;
    }
    let intensity = rps * response_time_secs;
    if !intensity.is_finite() {
        return 0.0;
    }
    let mut blocking = 1.0_f64;
    for channel in 1..=channels {
        let offered = intensity * blocking;
        blocking = offered / (f64::from(channel) + offered);
        // past rho the terms only shrink, and 1 - b already rounds to 1
        if f64::from(channel) > intensity && blocking < f64::EPSILON / 4.0 {
            return 1.0;
        }
    }
    (1.0 - blocking).clamp(0.0, 1.0)
}

/// Response-time recorder of a request channel with queueing-theory views.
#[derive(Debug)]
pub struct ArrivalsRecorder {
    response_time: RatedTimerRecorder,
    correlation: OnlineCorrelation,
    channels: AtomicU32,
    started_at: AtomicU64,
    clock: MetricClock,
}

impl ArrivalsRecorder {
    pub fn new(name: impl Into<CompactString>, channels: u32) -> MetricResult<Self> {
        Self::with_settings(name, channels, &RecorderSettings::default())
    }

    pub fn with_settings(
        name: impl Into<CompactString>,
        channels: u32,
        settings: &RecorderSettings,
    ) -> MetricResult<Self> {
        let name = name.into();
        validate_channels(&name, channels)?;
        Ok(Self {
            response_time: Rated::with_settings(TimerRecorder::with_settings(name, settings), settings),
            correlation: OnlineCorrelation::new(),
            channels: AtomicU32::new(channels),
            started_at: AtomicU64::new(NOT_STARTED),
            clock: settings.clock().clone(),
        })
    }

    /// Record one served request.
    pub fn update(&self, response_time: Duration) {
        let now = self.clock.now_nanos();
        self.started_at.fetch_min(now, AtomicOrdering::AcqRel);
        self.response_time.record(response_time);
        let rps = self.response_time.last_rate(MetricsInterval::Second) as f64;
        self.correlation.accept(rps, response_time.as_secs_f64());
    }

    pub fn set_channels(&self, channels: u32) -> MetricResult<()> {
        validate_channels(self.name(), channels)?;
        let previous = self.channels.swap(channels, AtomicOrdering::AcqRel);
        debug!(
            target: "vitals::recorders",
            metric = %self.name(),
            previous,
            channels,
            "Channel count changed"
        );
        Ok(())
    }
}

fn validate_channels(name: &str, channels: u32) -> MetricResult<()> {
    if !(1..=MAX_CHANNELS).contains(&channels) {
        warn!(target: "vitals::recorders", metric = %name, channels, "Rejected channel count");
        return Err(MetricError::InvalidChannels {
            name: name.to_string(),
            channels,
        });
    }
    Ok(())
}

impl Metric for ArrivalsRecorder {
    fn name(&self) -> &str {
        self.response_time.name()
    }

    fn reset(&self) {
        self.response_time.reset();
        self.correlation.reset();
        self.started_at.store(NOT_STARTED, AtomicOrdering::Release);
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        Box::new(self.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_rate(&self) -> Option<&(dyn Rate + 'static)> {
        Some(&self.response_time)
    }

    fn as_gauge(&self) -> Option<GaugeView<'_>> {
        Some(GaugeView::Duration(&self.response_time))
    }

    fn as_timer(&self) -> Option<&(dyn Timer + 'static)> {
        Some(&self.response_time)
    }

    fn as_arrivals(&self) -> Option<&(dyn Arrivals + 'static)> {
        Some(self)
    }
}

impl Recorder for ArrivalsRecorder {
    type Input = Duration;

    fn record(&self, response_time: Duration) {
        self.update(response_time);
    }

    fn snapshot(&self) -> Self {
        Self {
            response_time: self.response_time.snapshot(),
            correlation: self.correlation.snapshot(),
            channels: AtomicU32::new(self.channels()),
            started_at: AtomicU64::new(self.started_at.load(AtomicOrdering::Acquire)),
            clock: self.clock.clone(),
        }
    }
}

impl Arrivals for ArrivalsRecorder {
    fn channels(&self) -> u32 {
        self.channels.load(AtomicOrdering::Acquire)
    }

    fn instant_availability(&self) -> f64 {
        let rps = self.response_time.last_rate(MetricsInterval::Second) as f64;
        let response_time = Gauge::<Duration>::last_value(&self.response_time);
        availability(rps, response_time.as_secs_f64(), self.channels())
    }

    fn mean_availability(&self, interval: MetricsInterval) -> f64 {
        let rps = self.response_time.mean_rate(interval) / interval.as_secs_f64();
        let response_time = self.response_time.mean_duration(interval);
        availability(rps, response_time.as_secs_f64(), self.channels())
    }

    fn efficiency(&self) -> f64 {
        let started_at = self.started_at.load(AtomicOrdering::Acquire);
        if started_at == NOT_STARTED {
            return 0.0;
        }
        let uptime = self.clock.now_nanos().saturating_sub(started_at);
        if uptime == 0 {
            return 0.0;
        }
        let busy = self.response_time.summary_value().as_secs_f64();
        (busy / Duration::from_nanos(uptime).as_secs_f64()).min(1.0)
    }

    fn correlation(&self) -> f64 {
        self.correlation.coefficient()
    }

    fn request_rate(&self) -> &(dyn Rate + 'static) {
        &self.response_time
    }

    fn response_time(&self) -> &(dyn Timer + 'static) {
        &self.response_time
    }
}

// ============================================================================
// SECTION 14: METRICS REGISTRY & SUMMARY
// ============================================================================
// An immutable name -> metric collection built once at registration time,
// plus a synthetic rate that sums a live set of rates on every read.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Capability Views
// ----------------------------------------------------------------------------

/// A capability a registry can filter by.
pub trait MetricView: 'static {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self>;
}

impl MetricView for dyn Metric {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        Some(metric)
    }
}

impl MetricView for dyn Rate {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_rate()
    }
}

impl<V: GaugeValue> MetricView for dyn Gauge<V> {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_gauge().and_then(V::from_gauge_view)
    }
}

impl MetricView for dyn StringGauge {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_string_gauge()
    }
}

impl MetricView for dyn Timer {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_timer()
    }
}

impl MetricView for dyn Flag {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_flag()
    }
}

impl<V: GaugeValue> MetricView for dyn Normative<V> {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_normative().and_then(V::from_normative_view)
    }
}

impl MetricView for dyn Arrivals {
    fn view<'a>(metric: &'a (dyn Metric + 'static)) -> Option<&'a Self> {
        metric.as_arrivals()
    }
}

// ----------------------------------------------------------------------------
// 14.2 Registry
// ----------------------------------------------------------------------------

/// Immutable collection of uniquely named metrics, in registration order.
pub struct MetricsRegistry {
    metrics: Vec<Arc<dyn Metric>>,
    index: AHashMap<CompactString, usize>,
}

impl MetricsRegistry {
    pub fn new(metrics: impl IntoIterator<Item = Arc<dyn Metric>>) -> MetricResult<Self> {
        let metrics: Vec<Arc<dyn Metric>> = metrics.into_iter().collect();
        let mut index = AHashMap::with_capacity(metrics.len());
        for (position, metric) in metrics.iter().enumerate() {
            if index.insert(CompactString::from(metric.name()), position).is_some() {
                warn!(target: "vitals::registry", metric = %metric.name(), "Duplicate metric name");
                return Err(MetricError::DuplicateName {
                    name: metric.name().to_string(),
                });
            }
        }
        debug!(target: "vitals::registry", metrics = metrics.len(), "Registry built");
        Ok(Self { metrics, index })
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn get_metric(&self, name: &str) -> Option<&(dyn Metric + 'static)> {
        self.index.get(name).map(|&position| self.metrics[position].as_ref())
    }

    pub fn require(&self, name: &str) -> MetricResult<&(dyn Metric + 'static)> {
        self.get_metric(name).ok_or_else(|| MetricError::NotFound {
            name: name.to_string(),
        })
    }

    /// The metric called `name`, if it has capability `V`.
    pub fn get<V: MetricView + ?Sized>(&self, name: &str) -> Option<&V> {
        self.get_metric(name).and_then(V::view)
    }

    /// Every metric with capability `V`, in registration order.
    pub fn metrics<V: MetricView + ?Sized>(&self) -> impl Iterator<Item = &V> + '_ {
        self.metrics.iter().filter_map(|metric| V::view(metric.as_ref()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn Metric + 'static)> + '_ {
        self.metrics.iter().map(|metric| metric.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.metrics.iter().map(|metric| metric.name())
    }

    /// Reset every metric. Resets are independent of each other.
    pub fn reset_all(&self) {
        for metric in &self.metrics {
            metric.reset();
        }
        debug!(target: "vitals::registry", metrics = self.metrics.len(), "Reset all metrics");
    }

    /// Registry of independent copies of every metric.
    pub fn snapshot(&self) -> MetricsRegistry {
        let metrics: Vec<Arc<dyn Metric>> = self
            .metrics
            .iter()
            .map(|metric| Arc::from(metric.boxed_snapshot()))
            .collect();
        trace!(target: "vitals::registry", metrics = metrics.len(), "Registry snapshot taken");
        Self {
            metrics,
            index: self.index.clone(),
        }
    }

    pub fn report(&self) -> RegistryReport {
        RegistryReport::capture(self)
    }
}

impl Debug for MetricsRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("metrics", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects metrics before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    metrics: Vec<Arc<dyn Metric>>,
}

impl RegistryBuilder {
    /// Add a recorder and keep a typed handle for producers.
    pub fn register<M: Metric>(&mut self, metric: M) -> Arc<M> {
        let metric = Arc::new(metric);
        self.metrics.push(Arc::clone(&metric) as Arc<dyn Metric>);
        metric
    }

    pub fn register_shared(&mut self, metric: Arc<dyn Metric>) -> &mut Self {
        self.metrics.push(metric);
        self
    }

    pub fn build(self) -> MetricResult<MetricsRegistry> {
        MetricsRegistry::new(self.metrics)
    }
}

// ----------------------------------------------------------------------------
// 14.3 Rate Suppliers & Summary Rate
// ----------------------------------------------------------------------------

/// A live set of rates a [`SummaryRate`] sums over.
pub trait RateSupplier: Send + Sync + 'static {
    fn for_each_rate(&self, visit: &mut dyn FnMut(&dyn Rate));
}

impl RateSupplier for MetricsRegistry {
    fn for_each_rate(&self, visit: &mut dyn FnMut(&dyn Rate)) {
        for rate in self.metrics::<dyn Rate>() {
            visit(rate);
        }
    }
}

impl<S: RateSupplier + ?Sized> RateSupplier for Arc<S> {
    fn for_each_rate(&self, visit: &mut dyn FnMut(&dyn Rate)) {
        (**self).for_each_rate(visit);
    }
}

impl RateSupplier for Vec<Arc<dyn Rate>> {
    fn for_each_rate(&self, visit: &mut dyn FnMut(&dyn Rate)) {
        for rate in self {
            visit(rate.as_ref());
        }
    }
}

/// Frozen copies of the sources of a summary snapshot.
#[derive(Debug)]
struct FrozenRates(Vec<Box<dyn Metric>>);

impl RateSupplier for FrozenRates {
    fn for_each_rate(&self, visit: &mut dyn FnMut(&dyn Rate)) {
        for rate in self.0.iter().filter_map(|metric| metric.as_rate()) {
            visit(rate);
        }
    }
}

/// Synthetic rate recomputed from its sources on every read.
///
/// Counts, means and peaks are sums over the sources. A summary placed in
/// the registry it summarizes would count itself, so keep it outside.
pub struct SummaryRate<S: RateSupplier> {
    name: CompactString,
    source: S,
}

impl<S: RateSupplier> SummaryRate<S> {
    pub fn new(name: impl Into<CompactString>, source: S) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of rates currently summed.
    pub fn sources(&self) -> usize {
        let mut count = 0;
        self.source.for_each_rate(&mut |_: &dyn Rate| count += 1);
        count
    }

    fn sum_counts(&self, read: impl Fn(&dyn Rate) -> u64) -> u64 {
        let mut sum = 0_u64;
        self.source
            .for_each_rate(&mut |rate: &dyn Rate| sum = sum.saturating_add(read(rate)));
        sum
    }

    fn sum_rates(&self, read: impl Fn(&dyn Rate) -> f64) -> f64 {
        let mut sum = 0.0;
        self.source.for_each_rate(&mut |rate: &dyn Rate| sum += read(rate));
        sum
    }
}

impl<S: RateSupplier> Debug for SummaryRate<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryRate")
            .field("name", &self.name)
            .field("sources", &self.sources())
            .finish()
    }
}

impl<S: RateSupplier> Metric for SummaryRate<S> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Forwards to every source.
    fn reset(&self) {
        self.source.for_each_rate(&mut |rate: &dyn Rate| rate.reset());
    }

    fn boxed_snapshot(&self) -> Box<dyn Metric> {
        let mut frozen = Vec::new();
        self.source
            .for_each_rate(&mut |rate: &dyn Rate| frozen.push(rate.boxed_snapshot()));
        Box::new(SummaryRate {
            name: self.name.clone(),
            source: FrozenRates(frozen),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_rate(&self) -> Option<&(dyn Rate + 'static)> {
        Some(self)
    }
}

impl<S: RateSupplier> Rate for SummaryRate<S> {
    fn total_rate(&self) -> u64 {
        self.sum_counts(|rate| rate.total_rate())
    }

    fn last_rate(&self, interval: MetricsInterval) -> u64 {
        self.sum_counts(|rate| rate.last_rate(interval))
    }

    fn max_rate(&self, interval: MetricsInterval) -> u64 {
        self.sum_counts(|rate| rate.max_rate(interval))
    }

    fn mean_rate(&self, interval: MetricsInterval) -> f64 {
        self.sum_rates(|rate| rate.mean_rate(interval))
    }

    fn last_mean_rate(&self, interval: MetricsInterval) -> f64 {
        self.sum_rates(|rate| rate.last_mean_rate(interval))
    }

    fn last_max_rate_per_second(&self, interval: MetricsInterval) -> u64 {
        self.sum_counts(|rate| rate.last_max_rate_per_second(interval))
    }

    fn last_max_rate_per_minute(&self, interval: MetricsInterval) -> u64 {
        self.sum_counts(|rate| rate.last_max_rate_per_minute(interval))
    }
}

// ============================================================================
// SECTION 15: REPORTS
// ============================================================================
// Structured copies of the getters, built from capability views. Durations
// are reported in milliseconds.
// ============================================================================

const REPORTED_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

#[derive(Debug, Clone, Serialize)]
pub struct RegistryReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: Vec<MetricReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<RateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gauge: Option<GaugeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<FlagReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normative: Option<NormativeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrivals: Option<ArrivalsReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateReport {
    pub total: u64,
    pub last: IntervalMap<u64>,
    pub max: IntervalMap<u64>,
    pub mean: IntervalMap<f64>,
    pub last_mean: IntervalMap<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GaugeReport {
    pub last: f64,
    pub max: f64,
    pub min: f64,
    pub mean: IntervalMap<f64>,
    /// p50, p90, p99
    pub quantiles: [f64; 3],
    pub deviation: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextReport {
    pub last: String,
    pub max: String,
    pub min: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerReport {
    pub last_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
    pub summary_ms: f64,
    pub mean_ms: IntervalMap<f64>,
    /// p50, p90, p99
    pub quantiles_ms: [f64; 3],
    pub deviation_ms: f64,
    pub mean_completed_tasks: IntervalMap<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlagReport {
    pub last: bool,
    pub true_count: u64,
    pub false_count: u64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormativeReport {
    pub from: String,
    pub to: String,
    pub total: u64,
    pub less_than_range: u64,
    pub in_range: u64,
    pub greater_than_range: u64,
    pub percent_in_range: f64,
    pub last_percent_in_range: IntervalMap<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArrivalsReport {
    pub channels: u32,
    pub instant_availability: f64,
    pub mean_availability: IntervalMap<f64>,
    pub efficiency: f64,
    pub correlation: f64,
}

#[inline]
fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

impl RegistryReport {
    pub fn capture(registry: &MetricsRegistry) -> Self {
        Self {
            generated_at: Utc::now(),
            metrics: registry.iter().map(MetricReport::capture).collect(),
        }
    }

    pub fn to_json(&self) -> VitalsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl MetricReport {
    pub fn capture(metric: &(dyn Metric + 'static)) -> Self {
        Self {
            name: metric.name().to_string(),
            rate: metric.as_rate().map(RateReport::capture),
            gauge: metric.as_gauge().and_then(|view| match view {
                GaugeView::Int(gauge) => Some(GaugeReport::capture(gauge)),
                GaugeView::Float(gauge) => Some(GaugeReport::capture(gauge)),
                // reported by the timer section
                GaugeView::Duration(_) => None,
            }),
            text: metric.as_string_gauge().map(|gauge| TextReport {
                last: gauge.last_value(),
                max: gauge.max_value(),
                min: gauge.min_value(),
            }),
            timer: metric.as_timer().map(TimerReport::capture),
            flag: metric.as_flag().map(|flag| FlagReport {
                last: flag.last_value(),
                true_count: flag.true_count(),
                false_count: flag.false_count(),
                ratio: flag.ratio(),
            }),
            normative: metric.as_normative().map(|view| match view {
                NormativeView::Int(normative) => NormativeReport::capture(normative),
                NormativeView::Float(normative) => NormativeReport::capture(normative),
                NormativeView::Duration(normative) => NormativeReport::capture(normative),
            }),
            arrivals: metric.as_arrivals().map(|arrivals| ArrivalsReport {
                channels: arrivals.channels(),
                instant_availability: arrivals.instant_availability(),
                mean_availability: IntervalMap::from_fn(|i| arrivals.mean_availability(i)),
                efficiency: arrivals.efficiency(),
                correlation: arrivals.correlation(),
            }),
        }
    }
}

impl RateReport {
    fn capture(rate: &(dyn Rate + 'static)) -> Self {
        Self {
            total: rate.total_rate(),
            last: IntervalMap::from_fn(|i| rate.last_rate(i)),
            max: IntervalMap::from_fn(|i| rate.max_rate(i)),
            mean: IntervalMap::from_fn(|i| rate.mean_rate(i)),
            last_mean: IntervalMap::from_fn(|i| rate.last_mean_rate(i)),
        }
    }
}

impl GaugeReport {
    fn capture<V: GaugeValue>(gauge: &(dyn Gauge<V> + 'static)) -> Self {
        Self {
            last: gauge.last_value().to_f64(),
            max: gauge.max_value().to_f64(),
            min: gauge.min_value().to_f64(),
            mean: IntervalMap::from_fn(|i| gauge.mean_value(i)),
            quantiles: REPORTED_QUANTILES.map(|q| gauge.quantile(q)),
            deviation: gauge.deviation(),
        }
    }
}

impl TimerReport {
    fn capture(timer: &(dyn Timer + 'static)) -> Self {
        Self {
            last_ms: millis(timer.last_value()),
            max_ms: millis(timer.max_value()),
            min_ms: millis(timer.min_value()),
            summary_ms: millis(timer.summary_value()),
            mean_ms: IntervalMap::from_fn(|i| millis(timer.mean_duration(i))),
            quantiles_ms: REPORTED_QUANTILES.map(|q| millis(timer.quantile_duration(q))),
            deviation_ms: millis(timer.deviation_duration()),
            mean_completed_tasks: IntervalMap::from_fn(|i| timer.mean_number_of_completed_tasks(i)),
        }
    }
}

impl NormativeReport {
    fn capture<V: GaugeValue>(normative: &(dyn Normative<V> + 'static)) -> Self {
        let (from, to) = normative.range();
        Self {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
            total: normative.total_count(),
            less_than_range: normative.count_of_less_than_normative(),
            in_range: normative.count_of_normal_values(),
            greater_than_range: normative.count_of_greater_than_normative(),
            percent_in_range: normative.percent(HitResult::InRange),
            last_percent_in_range: IntervalMap::from_fn(|i| normative.last_percent(HitResult::InRange, i)),
        }
    }
}

/// Milliseconds rendered by humantime, truncated to microseconds.
fn human_millis(ms: f64) -> humantime::FormattedDuration {
    let micros = if ms.is_finite() && ms > 0.0 {
        (ms * 1_000.0).round() as u64
    } else {
        0
    };
    humantime::format_duration(Duration::from_micros(micros))
}

impl Display for RegistryReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "== {} report at {} ({} metrics) ==",
            ENGINE_NAME,
            self.generated_at.to_rfc3339(),
            self.metrics.len()
        )?;
        for metric in &self.metrics {
            write!(f, "{}", metric)?;
        }
        Ok(())
    }
}

impl Display for MetricReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        if let Some(rate) = &self.rate {
            writeln!(
                f,
                "  rate      total={} last/s={} last/min={} mean/min={:.2} max/s={}",
                rate.total,
                rate.last[MetricsInterval::Second],
                rate.last[MetricsInterval::Minute],
                rate.mean[MetricsInterval::Minute],
                rate.max[MetricsInterval::Second],
            )?;
        }
        if let Some(gauge) = &self.gauge {
            writeln!(
                f,
                "  gauge     last={} min={} max={} p50={:.2} p99={:.2} dev={:.2}",
                gauge.last, gauge.min, gauge.max, gauge.quantiles[0], gauge.quantiles[2], gauge.deviation,
            )?;
        }
        if let Some(text) = &self.text {
            writeln!(f, "  text      last={:?} min={:?} max={:?}", text.last, text.min, text.max)?;
        }
        if let Some(timer) = &self.timer {
            writeln!(
                f,
                "  timer     last={} min={} max={} p50={} p99={} total={}",
                human_millis(timer.last_ms),
                human_millis(timer.min_ms),
                human_millis(timer.max_ms),
                human_millis(timer.quantiles_ms[0]),
                human_millis(timer.quantiles_ms[2]),
                human_millis(timer.summary_ms),
            )?;
        }
        if let Some(flag) = &self.flag {
            writeln!(
                f,
                "  flag      last={} true={} false={} ratio={:.3}",
                flag.last, flag.true_count, flag.false_count, flag.ratio,
            )?;
        }
        if let Some(normative) = &self.normative {
            writeln!(
                f,
                "  normative [{}, {}] below={} within={} above={} in-range={:.1}%",
                normative.from,
                normative.to,
                normative.less_than_range,
                normative.in_range,
                normative.greater_than_range,
                normative.percent_in_range * 100.0,
            )?;
        }
        if let Some(arrivals) = &self.arrivals {
            writeln!(
                f,
                "  arrivals  channels={} availability={:.4} efficiency={:.4} correlation={:.3}",
                arrivals.channels, arrivals.instant_availability, arrivals.efficiency, arrivals.correlation,
            )?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod registry_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        registry: MetricsRegistry,
        requests: Arc<RateRecorder>,
        latency: Arc<RatedTimerRecorder>,
        arrivals: Arc<ArrivalsRecorder>,
        depth: Arc<Gauge64Recorder>,
    }

    fn fixture() -> Fixture {
        let mut builder = MetricsRegistry::builder();
        let requests = builder.register(RateRecorder::new("requests"));
        let latency = builder.register(Rated::new(TimerRecorder::new("latency")));
        let sla = builder.register(
            RangedTimerRecorder::new("sla", Duration::from_millis(1), Duration::from_millis(10)).unwrap(),
        );
        let arrivals = builder.register(ArrivalsRecorder::new("arrivals", 2).unwrap());
        let depth = builder.register(Gauge64Recorder::new("depth"));
        let load = builder.register(GaugeFpRecorder::new("load"));
        let healthy = builder.register(FlagRecorder::new("healthy"));
        let caller = builder.register(RatedStringGaugeRecorder::new(StringGaugeRecorder::new("caller")));
        let errors = builder.register(Normative64Recorder::new("errors", 0, 5).unwrap());

        sla.update(Duration::from_millis(4));
        load.accept(0.75);
        healthy.update(true);
        caller.record("svc-a".to_string());
        errors.accept(9);

        Fixture {
            registry: builder.build().unwrap(),
            requests,
            latency,
            arrivals,
            depth,
        }
    }

    fn names<'a>(iter: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        iter.collect()
    }

    #[test]
    fn test_lookup_by_name() {
        let Fixture { registry, .. } = fixture();
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.get_metric("depth").map(|m| m.name()), Some("depth"));
        assert!(registry.get_metric("missing").is_none());
        assert_eq!(
            registry.require("missing").unwrap_err(),
            MetricError::NotFound {
                name: "missing".into()
            }
        );
        assert!(registry.get::<dyn Rate>("latency").is_some());
        assert!(registry.get::<dyn Rate>("depth").is_none());
        assert!(registry.get::<dyn Gauge<i64>>("depth").is_some());
        assert!(registry.get::<dyn Gauge<f64>>("depth").is_none());
        assert!(registry.require("depth").unwrap().as_any().is::<Gauge64Recorder>());
    }

    #[test]
    fn test_filter_by_capability() {
        let Fixture { registry, .. } = fixture();
        assert_eq!(
            names(registry.metrics::<dyn Rate>().map(|m| m.name())),
            vec!["requests", "latency", "arrivals", "caller"]
        );
        assert_eq!(
            names(registry.metrics::<dyn Timer>().map(|m| m.name())),
            vec!["latency", "sla", "arrivals"]
        );
        assert_eq!(
            names(registry.metrics::<dyn Gauge<Duration>>().map(|m| m.name())),
            vec!["latency", "sla", "arrivals"]
        );
        assert_eq!(names(registry.metrics::<dyn Gauge<i64>>().map(|m| m.name())), vec!["depth"]);
        assert_eq!(names(registry.metrics::<dyn Gauge<f64>>().map(|m| m.name())), vec!["load"]);
        assert_eq!(names(registry.metrics::<dyn Flag>().map(|m| m.name())), vec!["healthy"]);
        assert_eq!(names(registry.metrics::<dyn StringGauge>().map(|m| m.name())), vec!["caller"]);
        assert_eq!(names(registry.metrics::<dyn Normative<i64>>().map(|m| m.name())), vec!["errors"]);
        assert_eq!(names(registry.metrics::<dyn Normative<Duration>>().map(|m| m.name())), vec!["sla"]);
        assert_eq!(names(registry.metrics::<dyn Arrivals>().map(|m| m.name())), vec!["arrivals"]);
        assert_eq!(registry.metrics::<dyn Metric>().count(), 9);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut builder = MetricsRegistry::builder();
        builder.register(RateRecorder::new("dup"));
        builder.register(FlagRecorder::new("dup"));
        assert_eq!(
            builder.build().unwrap_err(),
            MetricError::DuplicateName { name: "dup".into() }
        );
    }

    #[test]
    fn test_reset_all_and_snapshot() {
        let Fixture {
            registry,
            requests,
            latency,
            depth,
            ..
        } = fixture();
        requests.update();
        latency.record(Duration::from_millis(8));
        depth.accept(3);

        let snapshot = registry.snapshot();
        registry.reset_all();
        requests.update();

        assert_eq!(requests.total_rate(), 1);
        assert_eq!(latency.summary_value(), Duration::ZERO);
        assert_eq!(depth.max_value(), 0);

        let frozen_requests = snapshot.get::<dyn Rate>("requests").unwrap();
        assert_eq!(frozen_requests.total_rate(), 1);
        let frozen_latency = snapshot.get::<dyn Timer>("latency").unwrap();
        assert_eq!(frozen_latency.summary_value(), Duration::from_millis(8));
        assert_eq!(snapshot.get::<dyn Gauge<i64>>("depth").unwrap().max_value(), 3);
        assert_eq!(names(snapshot.names()), names(registry.names()));
    }

    #[test]
    fn test_summary_rate_is_a_live_sum() {
        let Fixture {
            registry,
            requests,
            latency,
            arrivals,
            ..
        } = fixture();
        let registry = Arc::new(registry);
        let summary = SummaryRate::new("all", Arc::clone(&registry));
        // the fixture already recorded one caller
        assert_eq!(summary.sources(), 4);
        assert_eq!(summary.total_rate(), 1);

        requests.update();
        requests.update();
        latency.record(Duration::from_millis(1));
        arrivals.update(Duration::from_millis(2));
        assert_eq!(summary.total_rate(), 5);
        assert_eq!(summary.last_rate(MetricsInterval::Minute), 5);
        assert_eq!(summary.max_rate(MetricsInterval::Second), 2 + 1 + 1 + 1);
        assert_eq!(summary.last_max_rate_per_second(MetricsInterval::Hour), 5);

        let frozen = summary.boxed_snapshot();
        summary.reset();
        assert_eq!(summary.total_rate(), 0);
        assert_eq!(requests.total_rate(), 0);
        assert_eq!(frozen.as_rate().unwrap().total_rate(), 5);
        requests.update();
        assert_eq!(frozen.as_rate().unwrap().total_rate(), 5);
    }

    #[test]
    fn test_summary_over_explicit_rates() {
        let a = Arc::new(RateRecorder::new("a"));
        let b = Arc::new(RateRecorder::new("b"));
        let sources: Vec<Arc<dyn Rate>> = vec![a.clone(), b.clone()];
        let summary = SummaryRate::new("a+b", sources);
        a.update();
        b.update();
        b.update();
        assert_eq!(summary.total_rate(), 3);
        assert!(summary.last_mean_rate(MetricsInterval::Second) > 0.0);
        assert_eq!(summary.name(), "a+b");
    }

    #[test]
    fn test_report_sections() {
        let Fixture {
            registry, latency, ..
        } = fixture();
        latency.record(Duration::from_millis(12));
        let report = registry.report();
        assert_eq!(report.metrics.len(), 9);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        let latency_json = &json["metrics"][1];
        assert_eq!(latency_json["name"], "latency");
        assert_eq!(latency_json["rate"]["total"], 1);
        assert_eq!(latency_json["timer"]["last_ms"], 12.0);
        assert!(latency_json.get("gauge").is_none());

        let sla = &json["metrics"][2];
        assert_eq!(sla["normative"]["in_range"], 1);
        let arrivals = &json["metrics"][3];
        assert_eq!(arrivals["arrivals"]["channels"], 2);
        assert_eq!(json["metrics"][5]["gauge"]["last"], 0.75);
        assert_eq!(json["metrics"][6]["flag"]["ratio"], 1.0);
        assert_eq!(json["metrics"][7]["text"]["last"], "svc-a");

        let text = report.to_string();
        assert!(text.contains("latency"));
        assert!(text.contains("timer     last=12ms"));
        assert!(text.contains("normative [1ms, 10ms]"));
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Vitals Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "vitals",
    version,
    about = "Lock-free metric recorders for managed resources",
    long_about = "Vitals records rates, gauges, timers and availability figures over \
                  rolling windows from one second to one day. The binary drives a \
                  synthetic request workload through the recorders and reports them \
                  periodically."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "VITALS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "VITALS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "VITALS_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the synthetic workload and report periodically (default)
    Simulate {
        /// Run time, e.g. "30s" or "2m" (overrides simulation.duration_secs)
        #[arg(short = 't', long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Number of producer tasks (overrides simulation.producers)
        #[arg(short, long)]
        producers: Option<usize>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> VitalsResult<()> {
    println!("🔍 Validating configuration: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Reservoir capacity: {}", config.recorders.reservoir_capacity);
            println!("  • EWMA tick: {}ms", config.recorders.ewma_tick_ms);
            println!(
                "  • Report every: {} ({:?})",
                humantime::format_duration(config.report.interval()),
                config.report.format
            );
            println!(
                "  • Workload: {} producers, {} channels, mean response {}ms",
                config.simulation.producers, config.simulation.channels, config.simulation.mean_response_ms
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(VitalsError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> VitalsResult<()> {
    let config_str = EngineConfig::generate_default_config()?;

    match output {
        Some(path) => {
            std::fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Windows: {}", MetricsInterval::ALL.map(|i| i.name()).join(", "));
}

// ============================================================================
// SECTION 17: SIMULATED WORKLOAD
// ============================================================================
// Producers play the role of a managed resource's request handlers; the
// report loop plays the exporter reading the registry.
// ============================================================================

/// Typed handles the producers record into.
#[derive(Debug, Clone)]
pub struct SimulationRecorders {
    pub requests: Arc<RateRecorder>,
    pub response_time: Arc<RatedTimerRecorder>,
    pub sla: Arc<RangedTimerRecorder>,
    pub succeeded: Arc<RatedFlagRecorder>,
    pub last_producer: Arc<StringGaugeRecorder>,
    pub concurrency: Arc<Gauge64Recorder>,
    pub arrivals: Arc<ArrivalsRecorder>,
}

impl SimulationRecorders {
    fn record(&self, producer: usize, response_time: Duration, succeeded: bool) {
        self.requests.update();
        self.response_time.record(response_time);
        self.sla.update(response_time);
        self.succeeded.record(succeeded);
        self.last_producer.accept(&format!("producer-{:02}", producer));
        self.arrivals.update(response_time);
    }
}

/// Registry plus workload parameters of one `vitals simulate` run.
#[derive(Debug)]
pub struct Simulation {
    workload: SimulationConfig,
    recorders: SimulationRecorders,
    registry: Arc<MetricsRegistry>,
    summary: SummaryRate<Arc<MetricsRegistry>>,
    active: Arc<AtomicU64>,
}

impl Simulation {
    pub fn new(config: &EngineConfig) -> VitalsResult<Self> {
        let settings = RecorderSettings::from_config(&config.recorders)?;
        let workload = config.simulation.clone();
        let normative = (
            Duration::from_millis(workload.normative_from_ms),
            Duration::from_millis(workload.normative_to_ms),
        );

        let mut builder = MetricsRegistry::builder();
        let recorders = SimulationRecorders {
            requests: builder.register(RateRecorder::with_settings("requests", &settings)),
            response_time: builder.register(Rated::with_settings(
                TimerRecorder::with_settings("response_time", &settings),
                &settings,
            )),
            sla: builder.register(RangedTimerRecorder::with_settings(
                "sla",
                normative.0,
                normative.1,
                &settings,
            )?),
            succeeded: builder.register(Rated::with_settings(
                FlagRecorder::with_settings("succeeded", &settings),
                &settings,
            )),
            last_producer: builder.register(StringGaugeRecorder::with_settings("last_producer", &settings)),
            concurrency: builder.register(Gauge64Recorder::with_settings("concurrency", &settings)),
            arrivals: builder.register(ArrivalsRecorder::with_settings(
                "arrivals",
                workload.channels,
                &settings,
            )?),
        };
        let registry = Arc::new(builder.build()?);
        let summary = SummaryRate::new("all_rates", Arc::clone(&registry));

        info!(
            target: "vitals::simulation",
            metrics = registry.len(),
            producers = workload.producers,
            channels = workload.channels,
            "Simulation prepared"
        );
        Ok(Self {
            workload,
            recorders,
            registry,
            summary,
            active: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn recorders(&self) -> &SimulationRecorders {
        &self.recorders
    }

    pub fn summary(&self) -> &SummaryRate<Arc<MetricsRegistry>> {
        &self.summary
    }

    /// Registry report with the summary rate appended.
    pub fn report(&self) -> RegistryReport {
        let mut report = self.registry.report();
        report.metrics.push(MetricReport::capture(&self.summary));
        report
    }

    fn emit(&self, config: &ReportConfig) -> VitalsResult<()> {
        let report = self.report();
        match config.format {
            ReportFormat::Json => println!("{}", report.to_json()?),
            ReportFormat::Text => print!("{}", report),
        }
        if config.reset_after_report {
            self.registry.reset_all();
        }
        Ok(())
    }

    /// Run producers until `duration` elapses or Ctrl-C, reporting every
    /// `report.interval_ms`. Returns the number of served requests.
    pub async fn run(&self, report: &ReportConfig, duration: Option<Duration>) -> VitalsResult<u64> {
        let cancel = CancellationToken::new();
        let mut producers = JoinSet::new();
        for producer in 0..self.workload.producers {
            producers.spawn(produce(
                producer,
                self.recorders.clone(),
                self.workload.clone(),
                Arc::clone(&self.active),
                cancel.clone(),
            ));
        }
        info!(target: "vitals::simulation", producers = self.workload.producers, "Producers started");

        let mut ticker = tokio::time::interval(report.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.emit(report)?,
                _ = &mut deadline => {
                    info!(target: "vitals::simulation", "Simulation finished");
                    break;
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!(target: "vitals::simulation", error = %e, "Failed to listen for Ctrl-C");
                    }
                    info!(target: "vitals::simulation", "Interrupted, shutting down");
                    break;
                }
            }
        }

        cancel.cancel();
        let mut served = 0;
        while let Some(joined) = producers.join_next().await {
            match joined {
                Ok(count) => served += count,
                Err(e) => error!(target: "vitals::simulation", error = %e, "Producer task failed"),
            }
        }

        self.emit(report)?;
        info!(target: "vitals::simulation", served, "Final report emitted");
        Ok(served)
    }
}

/// Exponentially distributed response time, capped at ten times the mean.
fn sample_response_time(rng: &mut impl Rng, mean: Duration) -> Duration {
    let uniform: f64 = rng.gen();
    let sample = -mean.as_secs_f64() * (1.0 - uniform).ln();
    Duration::from_secs_f64(sample.min(mean.as_secs_f64() * 10.0))
}

async fn produce(
    producer: usize,
    recorders: SimulationRecorders,
    workload: SimulationConfig,
    active: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> u64 {
    let mean = Duration::from_millis(workload.mean_response_ms);
    let mut served = 0;
    loop {
        let (response_time, failed) = {
            let mut rng = rand::thread_rng();
            (
                sample_response_time(&mut rng, mean),
                rng.gen_bool(workload.failure_ratio),
            )
        };

        let in_flight = active.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        recorders
            .concurrency
            .accept(i64::try_from(in_flight).unwrap_or(i64::MAX));
        let finished = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(response_time) => true,
        };
        active.fetch_sub(1, AtomicOrdering::AcqRel);
        if !finished {
            break;
        }

        recorders.record(producer, response_time, !failed);
        served += 1;
    }
    trace!(target: "vitals::simulation", producer, served, "Producer stopped");
    served
}

// ============================================================================
// SECTION 18: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the vitals binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    let (duration, producers) = match cli.command {
        Some(Commands::Simulate { duration, producers }) => (duration, producers),
        _ => (None, None),
    };
    if let Some(producers) = producers {
        config.simulation.producers = producers;
        config.validate().context("Invalid --producers override")?;
    }

    let simulation = Simulation::new(&config)?;
    let served = simulation
        .run(&config.report, duration.or_else(|| config.simulation.duration()))
        .await?;
    info!(served, "Simulation complete");

    Ok(())
}

#[cfg(test)]
mod simulation_tests {
    use super::*;

    fn quick_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.report.interval_ms = 100;
        config.report.format = ReportFormat::Text;
        config.simulation.producers = 3;
        config.simulation.mean_response_ms = 2;
        config.simulation.failure_ratio = 0.5;
        config
    }

    #[test]
    fn test_simulation_registry_layout() {
        let simulation = Simulation::new(&quick_config()).unwrap();
        let names: Vec<&str> = simulation.registry().names().collect();
        assert_eq!(
            names,
            vec![
                "requests",
                "response_time",
                "sla",
                "succeeded",
                "last_producer",
                "concurrency",
                "arrivals"
            ]
        );
        simulation.recorders().record(7, Duration::from_millis(3), true);
        assert_eq!(simulation.summary().total_rate(), 4);

        let report = simulation.report();
        assert_eq!(report.metrics.last().map(|m| m.name.as_str()), Some("all_rates"));
        assert_eq!(StringGauge::last_value(&*simulation.recorders().last_producer), "producer-07");
    }

    #[test]
    fn test_invalid_workload_is_rejected() {
        let mut config = quick_config();
        config.simulation.channels = 0;
        assert!(matches!(
            Simulation::new(&config),
            Err(VitalsError::Metric(MetricError::InvalidChannels { .. }))
        ));
    }

    #[test]
    fn test_sampled_response_times_are_bounded() {
        let mut rng = rand::thread_rng();
        let mean = Duration::from_millis(10);
        for _ in 0..1_000 {
            let sample = sample_response_time(&mut rng, mean);
            assert!(sample <= mean * 10);
        }
    }

    #[tokio::test]
    async fn test_short_run_serves_requests() {
        let config = quick_config();
        let simulation = Simulation::new(&config).unwrap();
        let served = simulation
            .run(&config.report, Some(Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(served > 0);
        assert_eq!(simulation.recorders().requests.total_rate(), served);
        let arrivals = simulation.registry().get::<dyn Arrivals>("arrivals").unwrap();
        assert_eq!(arrivals.request_rate().total_rate(), served);
        assert!(arrivals.efficiency() > 0.0);
    }
}
