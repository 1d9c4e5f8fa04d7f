//! # LeakScope Engine - Memory Leak Diagnostics
//!
//! Memory sampling, trend classification and leak diagnostics for long-running
//! session servers. The engine observes and reports; it never throttles traffic
//! and never tries to repair what it finds.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              LEAKSCOPE ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLER → RING BUFFER → TREND ANALYZER → REPORTS ← HEAP ANALYZER            │
//! │  REQUEST HOOKS → BASELINE MANAGER      SESSION HOOKS → CONNECTION TRACKER    │
//! │  ORCHESTRATOR owns every periodic task     LEAK SIMULATOR validates it all  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded**: every buffer has a fixed capacity and evicts its oldest entry
//! - **Safe recalibration**: the baseline never moves during an upward trend
//! - **Leak-free teardown**: every periodic task is independently cancellable
//! - **Self-validating**: synthetic leak scenarios exercise the same reports
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{SecondsFormat, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{Pid, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "leakscope-engine";
pub const ENGINE_FULL_NAME: &str = "LeakScope Diagnostics Engine";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LEAKSCOPE_";

pub const BYTES_PER_MB: u64 = 1024 * 1024;

// ----------------------------------------------------------------------------
// Buffer Sizes
// ----------------------------------------------------------------------------

/// Capacity of the sampler's ring buffer
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Capacity of the request-scoped measurement window
pub const DEFAULT_REQUEST_WINDOW_CAPACITY: usize = 10;

/// Number of samples included in a memory report
pub const REPORT_MEASUREMENT_COUNT: usize = 10;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MEDIA_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_REPORT_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_TREND_SUMMARY_INTERVAL: Duration = Duration::from_secs(300);

/// Inactivity window after which a session is stale
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(300_000);

/// Minimum time between two baseline recalibrations
pub const DEFAULT_RECALIBRATION_WINDOW: Duration = Duration::from_secs(3600);

/// Files older than this are counted as old by the media scan
pub const DEFAULT_MEDIA_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Minimum allowed sampling interval
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Trend Analysis
// ----------------------------------------------------------------------------

/// Samples needed before the trend can be classified
pub const TREND_MIN_SAMPLES: usize = 10;

/// Size of each averaging window compared by the trend heuristic
pub const TREND_WINDOW: usize = 5;

/// Percentage change beyond which the trend is no longer stable
pub const TREND_THRESHOLD_PERCENT: f64 = 10.0;

/// Samples inspected by the continuous-growth signal
pub const GROWTH_WINDOW: usize = 5;

/// Heap growth over baseline (percent) that triggers a sampler warning
pub const HEAP_INCREASE_WARN_PERCENT: f64 = 50.0;

/// Request measurements needed before recalibration is considered
pub const RECALIBRATION_MIN_MEASUREMENTS: usize = 5;

/// Size of each averaging window for the short recalibration trend
pub const RECALIBRATION_TREND_WINDOW: usize = 3;

// ----------------------------------------------------------------------------
// Request Thresholds
// ----------------------------------------------------------------------------

pub const DEFAULT_HIGH_MEMORY_THRESHOLD: u64 = 50 * BYTES_PER_MB;
pub const DEFAULT_REQUEST_INCREASE_THRESHOLD: u64 = 10 * BYTES_PER_MB;

// ----------------------------------------------------------------------------
// Heap Analysis
// ----------------------------------------------------------------------------

pub const DEFAULT_SNAPSHOT_DIR: &str = "heap-snapshots";
pub const DEFAULT_SNAPSHOT_NAME: &str = "leakscope";
pub const SNAPSHOT_EXTENSION: &str = "heapsnapshot";

pub const SUSPICIOUS_ABSOLUTE_INCREASE: u64 = 1000;
pub const SUSPICIOUS_RATIO: u64 = 10;
pub const HIGH_OBJECT_COUNT: u64 = 10_000;
pub const PROTECTED_OBJECT_THRESHOLD: u64 = 1000;

/// Well-known census categories checked by the named leak patterns
pub const PENDING_FUTURE_TYPE: &str = "PendingFuture";
pub const CLOSURE_TYPE: &str = "Closure";
pub const OBJECT_TYPE: &str = "Object";
pub const SESSION_TYPE: &str = "Session";
pub const BUFFER_TYPE: &str = "Buffer";
pub const TIMER_TYPE: &str = "Timer";

pub const PENDING_FUTURE_THRESHOLD: u64 = 5000;
pub const CLOSURE_THRESHOLD: u64 = 20_000;
pub const OBJECT_THRESHOLD: u64 = 50_000;

// ----------------------------------------------------------------------------
// Media Directory
// ----------------------------------------------------------------------------

pub const DEFAULT_MEDIA_DIR: &str = "media";
pub const MEDIA_PLACEHOLDER_FILE: &str = ".keep";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Milliseconds Since Epoch
// ----------------------------------------------------------------------------

/// Wall-clock time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Current system time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Milliseconds elapsed from `self` until `later`, clamped at zero.
    #[inline]
    pub fn millis_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0).max(0) as u64
    }

    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as i64))
    }

    /// RFC 3339 rendering with millisecond precision.
    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Clock - Injectable Time Source
// ----------------------------------------------------------------------------

/// Source of wall-clock time. Services take an `Arc<dyn Clock>` so staleness
/// and recalibration windows can be driven deterministically.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), AtomicOrdering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, AtomicOrdering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(AtomicOrdering::Acquire))
    }
}

// ----------------------------------------------------------------------------
// 3.3 Memory Readings
// ----------------------------------------------------------------------------

/// One reading of the process memory counters, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Live heap bytes
    pub heap_used: u64,
    /// Heap bytes reserved (allocator high-water mark)
    pub heap_total: u64,
    /// Resident set size
    pub rss: u64,
    /// Bytes held by registered out-of-band buffers
    pub external: u64,
}

impl MemoryUsage {
    #[inline]
    pub fn heap_used_mb(&self) -> i64 {
        bytes_to_mb(self.heap_used as i64)
    }
}

/// A timestamped memory reading. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub usage: MemoryUsage,
}

impl MemorySample {
    #[inline]
    pub fn new(timestamp: Timestamp, usage: MemoryUsage) -> Self {
        Self { timestamp, usage }
    }

    #[inline]
    pub fn heap_used(&self) -> u64 {
        self.usage.heap_used
    }
}

/// Request-scoped measurement kept for the recalibration trend check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapMeasurement {
    pub timestamp: Timestamp,
    pub heap_used: u64,
}

/// Rounded conversion from bytes to mebibytes, sign preserved.
#[inline]
pub fn bytes_to_mb(bytes: i64) -> i64 {
    (bytes as f64 / BYTES_PER_MB as f64).round() as i64
}

/// Signed difference `current - reference` of two byte counts.
#[inline]
pub fn signed_delta(current: u64, reference: u64) -> i64 {
    current as i64 - reference as i64
}

// ----------------------------------------------------------------------------
// 3.4 Trend Classification
// ----------------------------------------------------------------------------

/// Classification of recent memory behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
            Trend::InsufficientData => "insufficient_data",
        }
    }

    /// Whether a baseline may be moved while memory behaves like this.
    #[inline]
    pub fn permits_recalibration(&self) -> bool {
        matches!(self, Trend::Stable | Trend::Decreasing)
    }
}

impl Display for Trend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Fixed-Capacity Ring Buffer
// ----------------------------------------------------------------------------

/// A fixed-capacity circular buffer. Pushing into a full buffer overwrites the
/// oldest entry; storage never grows past the capacity given at construction.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    /// Index of the oldest entry
    head: usize,
    len: usize,
    total_written: u64,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Vec<Option<T>> = (0..capacity).map(|_| None).collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    /// Append an entry, returning the evicted oldest entry if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let capacity = self.slots.len();
        self.total_written += 1;

        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(value);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(value);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    /// The newest entry.
    pub fn latest(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.slots.len();
        self.slots[(self.head + self.len - 1) % capacity].as_ref()
    }

    /// The newest `n` entries in chronological order (oldest first).
    pub fn latest_n(&self, n: usize) -> Vec<&T> {
        let skip = self.len.saturating_sub(n);
        self.iter().skip(skip).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries ever pushed, including the evicted ones.
    #[inline]
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy of all entries, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

// ----------------------------------------------------------------------------
// 3.6 Tracking Global Allocator
// ----------------------------------------------------------------------------

static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);
static PEAK_ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// A global allocator that forwards to the system allocator and keeps a running
/// count of live heap bytes. Installed when the `tracking-allocator` feature is
/// enabled; its counters are what the engine reports as `heapUsed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// Whether this allocator is installed as the global allocator.
    #[inline]
    pub const fn is_active() -> bool {
        cfg!(feature = "tracking-allocator")
    }

    /// Live heap bytes.
    #[inline]
    pub fn allocated() -> u64 {
        ALLOCATED_BYTES.load(AtomicOrdering::Relaxed) as u64
    }

    /// Highest value `allocated()` has reached.
    #[inline]
    pub fn peak() -> u64 {
        PEAK_ALLOCATED_BYTES.load(AtomicOrdering::Relaxed) as u64
    }

    #[inline]
    fn record_alloc(size: usize) {
        let total = ALLOCATED_BYTES.fetch_add(size, AtomicOrdering::Relaxed) + size;
        PEAK_ALLOCATED_BYTES.fetch_max(total, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn record_dealloc(size: usize) {
        ALLOCATED_BYTES.fetch_sub(size, AtomicOrdering::Relaxed);
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        Self::record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            Self::record_dealloc(layout.size());
            Self::record_alloc(new_size);
        }
        new_ptr
    }
}

#[cfg(feature = "tracking-allocator")]
#[global_allocator]
static GLOBAL_ALLOCATOR: TrackingAllocator = TrackingAllocator;

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine. Subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum LeakScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Heap analysis error: {0}")]
    Heap(#[from] HeapError),

    #[error("Leak simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LeakScopeError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            LeakScopeError::Config(_) => false,
            LeakScopeError::Monitor(e) => e.is_recoverable(),
            LeakScopeError::Heap(_) => true,
            LeakScopeError::Simulation(_) => true,
            LeakScopeError::Io(_) => true,
            LeakScopeError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            LeakScopeError::Config(_) => "config",
            LeakScopeError::Monitor(_) => "monitor",
            LeakScopeError::Heap(_) => "heap",
            LeakScopeError::Simulation(_) => "simulation",
            LeakScopeError::Io(_) => "io",
            LeakScopeError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

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
// 4.3 Monitor Errors
// ----------------------------------------------------------------------------

/// Errors from the periodic monitors and their tasks
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Periodic task '{task}' panicked")]
    TaskPanicked { task: String },

    #[error("Periodic task '{task}' failed to join: {message}")]
    TaskJoinFailed { task: String, message: String },

    #[error("Scan of '{path}' failed: {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MonitorError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MonitorError::ScanFailed { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.4 Heap Analysis Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Failed to write heap snapshot to '{path}': {source}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid heap snapshot name '{name}': must be a single file name without separators")]
    InvalidSnapshotName { name: String },

    #[error("Failed to encode heap snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Heap snapshot task failed: {0}")]
    TaskFailed(String),
}

// ----------------------------------------------------------------------------
// 4.5 Simulation Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Unknown leak scenario '{name}' (available: {available})")]
    UnknownScenario { name: String, available: String },

    #[error("Scenario '{scenario}' exceeded its retention budget: {retained} > {budget} bytes")]
    BudgetExceeded {
        scenario: LeakScenario,
        retained: u64,
        budget: u64,
    },
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type LeakScopeResult<T> = Result<T, LeakScopeError>;
pub type MonitorResult<T> = Result<T, MonitorError>;
pub type HeapResult<T> = Result<T, HeapError>;
pub type SimulationResult<T> = Result<T, SimulationError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Periodic monitor settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Baseline recalibration policy
    #[serde(default)]
    pub baseline: BaselineConfig,

    /// Request instrumentation thresholds
    #[serde(default)]
    pub requests: RequestConfig,

    /// Heap analyzer thresholds and snapshot output
    #[serde(default)]
    pub heap: HeapConfig,

    /// Leak simulator parameters
    #[serde(default)]
    pub simulator: LeakSimulatorConfig,

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

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("monitoring.sample_interval", self.monitoring.sample_interval),
            ("monitoring.media_scan_interval", self.monitoring.media_scan_interval),
            ("monitoring.connection_report_interval", self.monitoring.connection_report_interval),
            ("monitoring.trend_summary_interval", self.monitoring.trend_summary_interval),
        ];
        for (field, value) in intervals {
            if value < MIN_SAMPLE_INTERVAL {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("interval must be at least {}", humantime::format_duration(MIN_SAMPLE_INTERVAL)),
                ));
            }
        }

        if self.monitoring.sample_capacity < TREND_MIN_SAMPLES {
            return Err(ConfigError::invalid_value(
                "monitoring.sample_capacity",
                format!("capacity must hold at least {} samples", TREND_MIN_SAMPLES),
            ));
        }

        if self.baseline.window_capacity < self.baseline.min_measurements {
            return Err(ConfigError::invalid_value(
                "baseline.window_capacity",
                "window must be able to hold min_measurements entries",
            ));
        }

        if !is_plain_file_stem(&self.heap.default_snapshot_name) {
            return Err(ConfigError::invalid_value(
                "heap.default_snapshot_name",
                "must be a single file name without separators",
            ));
        }

        if self.heap.suspicious_ratio == 0 {
            return Err(ConfigError::invalid_value("heap.suspicious_ratio", "ratio must be positive"));
        }

        self.simulator.validate()
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Monitoring Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(with = "humantime_serde", default = "default_sample_interval")]
    pub sample_interval: Duration,

    /// Ring buffer capacity for memory samples
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,

    #[serde(with = "humantime_serde", default = "default_media_scan_interval")]
    pub media_scan_interval: Duration,

    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    #[serde(with = "humantime_serde", default = "default_media_max_age")]
    pub media_max_age: Duration,

    #[serde(with = "humantime_serde", default = "default_connection_report_interval")]
    pub connection_report_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_trend_summary_interval")]
    pub trend_summary_interval: Duration,

    /// Inactivity after which a session is reported stale
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            sample_capacity: default_sample_capacity(),
            media_scan_interval: default_media_scan_interval(),
            media_dir: default_media_dir(),
            media_max_age: default_media_max_age(),
            connection_report_interval: default_connection_report_interval(),
            trend_summary_interval: default_trend_summary_interval(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_sample_interval() -> Duration {
    DEFAULT_SAMPLE_INTERVAL
}

fn default_sample_capacity() -> usize {
    DEFAULT_SAMPLE_CAPACITY
}

fn default_media_scan_interval() -> Duration {
    DEFAULT_MEDIA_SCAN_INTERVAL
}

fn default_media_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MEDIA_DIR)
}

fn default_media_max_age() -> Duration {
    DEFAULT_MEDIA_MAX_AGE
}

fn default_connection_report_interval() -> Duration {
    DEFAULT_CONNECTION_REPORT_INTERVAL
}

fn default_trend_summary_interval() -> Duration {
    DEFAULT_TREND_SUMMARY_INTERVAL
}

fn default_stale_after() -> Duration {
    DEFAULT_STALE_AFTER
}

// ----------------------------------------------------------------------------
// 5.3 Baseline Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Minimum time between recalibrations
    #[serde(with = "humantime_serde", default = "default_recalibration_window")]
    pub recalibration_window: Duration,

    /// Request measurements required before recalibrating
    #[serde(default = "default_min_measurements")]
    pub min_measurements: usize,

    /// Capacity of the request measurement window
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            recalibration_window: default_recalibration_window(),
            min_measurements: default_min_measurements(),
            window_capacity: default_window_capacity(),
        }
    }
}

fn default_recalibration_window() -> Duration {
    DEFAULT_RECALIBRATION_WINDOW
}

fn default_min_measurements() -> usize {
    RECALIBRATION_MIN_MEASUREMENTS
}

fn default_window_capacity() -> usize {
    DEFAULT_REQUEST_WINDOW_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.4 Request Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Distance from the baseline that triggers a high-memory warning
    #[serde(default = "default_high_memory_threshold")]
    pub high_memory_threshold_bytes: u64,

    /// Per-request heap growth that triggers a warning
    #[serde(default = "default_request_increase_threshold")]
    pub request_increase_threshold_bytes: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            high_memory_threshold_bytes: default_high_memory_threshold(),
            request_increase_threshold_bytes: default_request_increase_threshold(),
        }
    }
}

fn default_high_memory_threshold() -> u64 {
    DEFAULT_HIGH_MEMORY_THRESHOLD
}

fn default_request_increase_threshold() -> u64 {
    DEFAULT_REQUEST_INCREASE_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.5 Heap Analysis Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapConfig {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    #[serde(default = "default_snapshot_name")]
    pub default_snapshot_name: String,

    #[serde(default = "default_suspicious_absolute")]
    pub suspicious_absolute_increase: u64,

    #[serde(default = "default_suspicious_ratio")]
    pub suspicious_ratio: u64,

    #[serde(default = "default_high_object_count")]
    pub high_object_count: u64,

    #[serde(default = "default_protected_threshold")]
    pub protected_object_threshold: u64,

    #[serde(default = "default_pending_future_threshold")]
    pub pending_future_threshold: u64,

    #[serde(default = "default_closure_threshold")]
    pub closure_threshold: u64,

    #[serde(default = "default_object_threshold")]
    pub object_threshold: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            default_snapshot_name: default_snapshot_name(),
            suspicious_absolute_increase: default_suspicious_absolute(),
            suspicious_ratio: default_suspicious_ratio(),
            high_object_count: default_high_object_count(),
            protected_object_threshold: default_protected_threshold(),
            pending_future_threshold: default_pending_future_threshold(),
            closure_threshold: default_closure_threshold(),
            object_threshold: default_object_threshold(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_DIR)
}

fn default_snapshot_name() -> String {
    DEFAULT_SNAPSHOT_NAME.into()
}

fn default_suspicious_absolute() -> u64 {
    SUSPICIOUS_ABSOLUTE_INCREASE
}

fn default_suspicious_ratio() -> u64 {
    SUSPICIOUS_RATIO
}

fn default_high_object_count() -> u64 {
    HIGH_OBJECT_COUNT
}

fn default_protected_threshold() -> u64 {
    PROTECTED_OBJECT_THRESHOLD
}

fn default_pending_future_threshold() -> u64 {
    PENDING_FUTURE_THRESHOLD
}

fn default_closure_threshold() -> u64 {
    CLOSURE_THRESHOLD
}

fn default_object_threshold() -> u64 {
    OBJECT_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.6 Leak Simulator Configuration
// ----------------------------------------------------------------------------

/// Parameters of the synthetic leak scenarios. Each `*_every` value is the
/// cleanup ratio: the scenario cleans up only when `i % every == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakSimulatorConfig {
    #[serde(default = "default_connection_iterations")]
    pub connection_iterations: usize,
    #[serde(default = "default_connection_cleanup_every")]
    pub connection_cleanup_every: usize,
    #[serde(with = "humantime_serde", default = "default_connection_activity_delay")]
    pub connection_activity_delay: Duration,

    #[serde(default = "default_timer_count")]
    pub timer_count: usize,
    #[serde(default = "default_timer_clear_every")]
    pub timer_clear_every: usize,
    #[serde(with = "humantime_serde", default = "default_timer_period")]
    pub timer_period: Duration,
    #[serde(default = "default_timer_allocation_len")]
    pub timer_allocation_len: usize,

    #[serde(default = "default_closure_count")]
    pub closure_count: usize,
    #[serde(default = "default_closure_release_every")]
    pub closure_release_every: usize,
    #[serde(default = "default_closure_payload_len")]
    pub closure_payload_len: usize,

    #[serde(default = "default_buffer_iterations")]
    pub buffer_iterations: usize,
    #[serde(default = "default_buffer_release_every")]
    pub buffer_release_every: usize,
    #[serde(default = "default_primary_buffer_bytes")]
    pub primary_buffer_bytes: usize,
    #[serde(default = "default_secondary_buffer_bytes")]
    pub secondary_buffer_bytes: usize,

    #[serde(default = "default_payload_count")]
    pub payload_count: usize,
    #[serde(default = "default_payload_drain_every")]
    pub payload_drain_every: usize,
    #[serde(default = "default_payload_media_bytes")]
    pub payload_media_bytes: usize,
    #[serde(default = "default_payload_thumbnail_bytes")]
    pub payload_thumbnail_bytes: usize,
    #[serde(default = "default_payload_metadata_len")]
    pub payload_metadata_len: usize,

    /// Pause after all scenarios so the sampler can observe their effect
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Upper bound on bytes a single scenario may retain
    #[serde(default = "default_max_retained_bytes")]
    pub max_retained_bytes: u64,
}

impl Default for LeakSimulatorConfig {
    fn default() -> Self {
        Self {
            connection_iterations: default_connection_iterations(),
            connection_cleanup_every: default_connection_cleanup_every(),
            connection_activity_delay: default_connection_activity_delay(),
            timer_count: default_timer_count(),
            timer_clear_every: default_timer_clear_every(),
            timer_period: default_timer_period(),
            timer_allocation_len: default_timer_allocation_len(),
            closure_count: default_closure_count(),
            closure_release_every: default_closure_release_every(),
            closure_payload_len: default_closure_payload_len(),
            buffer_iterations: default_buffer_iterations(),
            buffer_release_every: default_buffer_release_every(),
            primary_buffer_bytes: default_primary_buffer_bytes(),
            secondary_buffer_bytes: default_secondary_buffer_bytes(),
            payload_count: default_payload_count(),
            payload_drain_every: default_payload_drain_every(),
            payload_media_bytes: default_payload_media_bytes(),
            payload_thumbnail_bytes: default_payload_thumbnail_bytes(),
            payload_metadata_len: default_payload_metadata_len(),
            settle_delay: default_settle_delay(),
            max_retained_bytes: default_max_retained_bytes(),
        }
    }
}

impl LeakSimulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratios = [
            ("simulator.connection_cleanup_every", self.connection_cleanup_every),
            ("simulator.timer_clear_every", self.timer_clear_every),
            ("simulator.closure_release_every", self.closure_release_every),
            ("simulator.buffer_release_every", self.buffer_release_every),
            ("simulator.payload_drain_every", self.payload_drain_every),
        ];
        for (field, every) in ratios {
            if every == 0 {
                return Err(ConfigError::invalid_value(field, "cleanup ratio must be at least 1"));
            }
        }
        if self.timer_period.is_zero() {
            return Err(ConfigError::invalid_value("simulator.timer_period", "period must be non-zero"));
        }
        Ok(())
    }
}

fn default_connection_iterations() -> usize {
    50
}

fn default_connection_cleanup_every() -> usize {
    3
}

fn default_connection_activity_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_timer_count() -> usize {
    20
}

fn default_timer_clear_every() -> usize {
    4
}

fn default_timer_period() -> Duration {
    Duration::from_millis(100)
}

fn default_timer_allocation_len() -> usize {
    1000
}

fn default_closure_count() -> usize {
    30
}

fn default_closure_release_every() -> usize {
    5
}

fn default_closure_payload_len() -> usize {
    10_000
}

fn default_buffer_iterations() -> usize {
    20
}

fn default_buffer_release_every() -> usize {
    6
}

fn default_primary_buffer_bytes() -> usize {
    1024 * 1024
}

fn default_secondary_buffer_bytes() -> usize {
    512 * 1024
}

fn default_payload_count() -> usize {
    15
}

fn default_payload_drain_every() -> usize {
    4
}

fn default_payload_media_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_payload_thumbnail_bytes() -> usize {
    100 * 1024
}

fn default_payload_metadata_len() -> usize {
    1000
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retained_bytes() -> u64 {
    256 * BYTES_PER_MB
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
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

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Log levels for the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, falling back to `Info`
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> LeakScopeResult<()> {
    let level = LogLevel::parse_lossy(&config.level).to_tracing_level();
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from_level(level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(tracing_fmt::layer().compact().with_ansi(config.colors).with_target(true)),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    result.map_err(|e| LeakScopeError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "leakscope::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: MEMORY PROBES & RUNTIME CAPABILITIES
// ============================================================================
// Everything the engine reads about the host process goes through a trait so
// the analysis code never depends on where the numbers come from.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Object Census
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CensusCounter {
    live: AtomicU64,
    bytes: AtomicU64,
}

/// Live instance counts per named allocation category.
///
/// Instances register through [`ObjectCensus::track`] and stay counted for as
/// long as the returned [`CensusGuard`] lives. Protected categories model
/// objects pinned by the runtime itself, such as scheduled timers.
#[derive(Debug, Default)]
pub struct ObjectCensus {
    types: DashMap<CompactString, CensusCounter>,
    protected: DashMap<CompactString, CensusCounter>,
}

impl ObjectCensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one live instance of `type_name`.
    pub fn track(self: &Arc<Self>, type_name: &str) -> CensusGuard {
        self.register(type_name, 0, false)
    }

    /// Register one live instance that owns `bytes` of out-of-band storage.
    pub fn track_bytes(self: &Arc<Self>, type_name: &str, bytes: u64) -> CensusGuard {
        self.register(type_name, bytes, false)
    }

    /// Register one live runtime-pinned instance of `type_name`.
    pub fn track_protected(self: &Arc<Self>, type_name: &str) -> CensusGuard {
        self.register(type_name, 0, true)
    }

    fn register(self: &Arc<Self>, type_name: &str, bytes: u64, protected: bool) -> CensusGuard {
        let map = if protected { &self.protected } else { &self.types };
        let counter = map.entry(CompactString::from(type_name)).or_default();
        counter.live.fetch_add(1, AtomicOrdering::Relaxed);
        counter.bytes.fetch_add(bytes, AtomicOrdering::Relaxed);
        drop(counter);

        CensusGuard {
            census: Arc::clone(self),
            type_name: CompactString::from(type_name),
            bytes,
            protected,
        }
    }

    fn release(&self, type_name: &str, bytes: u64, protected: bool) {
        let map = if protected { &self.protected } else { &self.types };
        if let Some(counter) = map.get(type_name) {
            counter.live.fetch_sub(1, AtomicOrdering::Relaxed);
            counter.bytes.fetch_sub(bytes, AtomicOrdering::Relaxed);
        }
    }

    /// Live count for one category.
    pub fn count(&self, type_name: &str) -> u64 {
        self.types
            .get(type_name)
            .map(|c| c.live.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    /// Live count for one protected category.
    pub fn protected_count(&self, type_name: &str) -> u64 {
        self.protected
            .get(type_name)
            .map(|c| c.live.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    /// Live counts of all categories, zero entries omitted.
    pub fn type_counts(&self) -> BTreeMap<String, u64> {
        Self::collect_counts(&self.types)
    }

    pub fn protected_type_counts(&self) -> BTreeMap<String, u64> {
        Self::collect_counts(&self.protected)
    }

    /// Bytes owned by all live registered instances.
    pub fn tracked_bytes(&self) -> u64 {
        self.types
            .iter()
            .chain(self.protected.iter())
            .map(|e| e.value().bytes.load(AtomicOrdering::Relaxed))
            .sum()
    }

    fn collect_counts(map: &DashMap<CompactString, CensusCounter>) -> BTreeMap<String, u64> {
        map.iter()
            .filter_map(|e| {
                let live = e.value().live.load(AtomicOrdering::Relaxed);
                (live > 0).then(|| (e.key().to_string(), live))
            })
            .collect()
    }
}

/// Keeps one census registration alive; dropping it releases the count.
#[derive(Debug)]
pub struct CensusGuard {
    census: Arc<ObjectCensus>,
    type_name: CompactString,
    bytes: u64,
    protected: bool,
}

impl Drop for CensusGuard {
    fn drop(&mut self) {
        self.census.release(&self.type_name, self.bytes, self.protected);
    }
}

// ----------------------------------------------------------------------------
// 7.2 Memory Probe
// ----------------------------------------------------------------------------

/// Reads the current process memory counters.
pub trait MemoryProbe: Send + Sync + Debug {
    fn read(&self) -> MemoryUsage;
}

/// Memory probe for the running process.
///
/// Heap figures come from [`TrackingAllocator`] when it is installed and from
/// the OS otherwise; RSS always comes from `sysinfo`.
pub struct ProcessMemoryProbe {
    system: Mutex<SysInfoSystem>,
    pid: Option<Pid>,
    census: Option<Arc<ObjectCensus>>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(target: "leakscope::probe", error = %e, "Cannot resolve current pid"))
            .ok();
        Self {
            system: Mutex::new(SysInfoSystem::new()),
            pid,
            census: None,
        }
    }

    /// Report census-tracked bytes as external memory.
    pub fn with_census(mut self, census: Arc<ObjectCensus>) -> Self {
        self.census = Some(census);
        self
    }

    /// (rss, virtual) for this process, zeros when unavailable.
    fn process_memory(&self) -> (u64, u64) {
        let Some(pid) = self.pid else {
            return (0, 0);
        };
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return (0, 0);
        }
        system
            .process(pid)
            .map(|p| (p.memory(), p.virtual_memory()))
            .unwrap_or((0, 0))
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemoryProbe")
            .field("pid", &self.pid)
            .field("tracking_allocator", &TrackingAllocator::is_active())
            .finish()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn read(&self) -> MemoryUsage {
        let (rss, virtual_memory) = self.process_memory();
        let (heap_used, heap_total) = if TrackingAllocator::is_active() {
            let used = TrackingAllocator::allocated();
            (used, TrackingAllocator::peak().max(used))
        } else {
            (rss, virtual_memory)
        };

        MemoryUsage {
            heap_used,
            heap_total,
            rss,
            external: self.census.as_ref().map(|c| c.tracked_bytes()).unwrap_or(0),
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Heap Statistics Source
// ----------------------------------------------------------------------------

/// Runtime heap statistics. The engine reads this structure but never
/// interprets how the runtime produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapStatsSample {
    pub heap_size: u64,
    pub heap_capacity: u64,
    pub object_count: u64,
    pub protected_object_count: u64,
    pub object_type_counts: BTreeMap<String, u64>,
    pub protected_object_type_counts: BTreeMap<String, u64>,
}

pub trait HeapStatsSource: Send + Sync + Debug {
    fn capture(&self) -> HeapStatsSample;
}

/// Heap statistics assembled from the tracking allocator and an [`ObjectCensus`].
#[derive(Debug)]
pub struct CensusHeapStats {
    census: Arc<ObjectCensus>,
    probe: Arc<dyn MemoryProbe>,
}

impl CensusHeapStats {
    pub fn new(census: Arc<ObjectCensus>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self { census, probe }
    }
}

impl HeapStatsSource for CensusHeapStats {
    fn capture(&self) -> HeapStatsSample {
        let usage = self.probe.read();
        let object_type_counts = self.census.type_counts();
        let protected_object_type_counts = self.census.protected_type_counts();

        HeapStatsSample {
            heap_size: usage.heap_used,
            heap_capacity: usage.heap_total,
            object_count: object_type_counts.values().sum(),
            protected_object_count: protected_object_type_counts.values().sum(),
            object_type_counts,
            protected_object_type_counts,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.4 Manual Collection Capability
// ----------------------------------------------------------------------------

/// A host facility that can be asked to give freed memory back.
pub trait GarbageCollector: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Request a collection. Returns whether the host reported doing any work.
    fn collect(&self) -> bool;
}

/// Asks glibc to return free heap pages to the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocTrim;

impl GarbageCollector for MallocTrim {
    fn name(&self) -> &str {
        "malloc_trim"
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn collect(&self) -> bool {
        // SAFETY: malloc_trim has no preconditions and only touches allocator state.
        unsafe { libc::malloc_trim(0) == 1 }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn collect(&self) -> bool {
        false
    }
}

/// The manual collection capability of this host, if it has one.
pub fn host_garbage_collector() -> Option<Arc<dyn GarbageCollector>> {
    if cfg!(all(target_os = "linux", target_env = "gnu")) {
        Some(Arc::new(MallocTrim))
    } else {
        None
    }
}

// ============================================================================
// SECTION 8: PERIODIC TASK SCHEDULING
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Task Handles
// ----------------------------------------------------------------------------

/// Cancellation handle for a periodic task. Cheap to clone; cancelling any
/// clone stops the task at its next await point.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A spawned tokio task that runs a callback on a fixed period until cancelled.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: TaskHandle,
    join: TokioJoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`. With `immediate` the first tick fires right
    /// away, otherwise one full period passes first.
    pub fn spawn<F>(name: &'static str, period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }
            trace!(target: "leakscope::tasks", task = name, "Periodic task exited");
        });

        Self {
            handle: TaskHandle { name, token },
            join,
        }
    }

    /// Like [`PeriodicTask::spawn`] but the tick is a future, awaited before
    /// the next tick is scheduled.
    pub fn spawn_async<F, Fut>(name: &'static str, period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = child.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            trace!(target: "leakscope::tasks", task = name, "Periodic task exited");
        });

        Self {
            handle: TaskHandle { name, token },
            join,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &'static str {
        self.handle.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel without waiting for the task to exit.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Cancel and wait for the task to exit, surfacing a panic inside it.
    pub async fn shutdown(self) -> MonitorResult<()> {
        self.handle.cancel();
        match self.join.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => Err(MonitorError::TaskPanicked {
                task: self.handle.name.to_string(),
            }),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(MonitorError::TaskJoinFailed {
                task: self.handle.name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Monitor Trait
// ----------------------------------------------------------------------------

/// A component that owns one periodic task.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Returns the unique name of this monitor.
    fn name(&self) -> &str;

    /// Start the periodic task, or return the running task's handle.
    fn start(self: Arc<Self>, period: Duration) -> TaskHandle;

    /// Stop the periodic task. Safe to call when not running.
    async fn stop(&self) -> MonitorResult<()>;

    fn is_running(&self) -> bool;
}

// ============================================================================
// SECTION 9: SAMPLING, TREND ANALYSIS & BASELINE MANAGEMENT
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Trend Analyzer
// ----------------------------------------------------------------------------

/// Trend heuristics over heap readings ordered oldest first.
#[derive(Debug)]
pub struct TrendAnalyzer;

impl TrendAnalyzer {
    /// Classify the last ten readings: mean of the newest five against the mean
    /// of the five before them.
    pub fn classify(values: &[u64]) -> Trend {
        Self::classify_windows(values, TREND_WINDOW, TREND_WINDOW, TREND_MIN_SAMPLES)
    }

    /// Short-window classification used before moving a baseline. The older
    /// window may hold fewer than three readings.
    pub fn classify_short(values: &[u64]) -> Trend {
        Self::classify_windows(values, RECALIBRATION_TREND_WINDOW, RECALIBRATION_TREND_WINDOW, 1)
    }

    /// Compare the mean of the newest `recent_len` values with the mean of the
    /// up to `older_len` values preceding them.
    pub fn classify_windows(values: &[u64], recent_len: usize, older_len: usize, min_required: usize) -> Trend {
        match Self::change_percent(values, recent_len, older_len, min_required) {
            None => Trend::InsufficientData,
            Some(change) if change > TREND_THRESHOLD_PERCENT => Trend::Increasing,
            Some(change) if change < -TREND_THRESHOLD_PERCENT => Trend::Decreasing,
            Some(_) => Trend::Stable,
        }
    }

    /// Percentage change between the two windows, `None` when either window is
    /// empty, fewer than `min_required` values exist, or the older mean is zero.
    pub fn change_percent(values: &[u64], recent_len: usize, older_len: usize, min_required: usize) -> Option<f64> {
        if values.len() < min_required {
            return None;
        }

        let split = values.len().saturating_sub(recent_len);
        let recent = &values[split..];
        let older = &values[split.saturating_sub(older_len)..split];

        let recent_avg = mean(recent)?;
        let older_avg = mean(older)?;
        if older_avg == 0.0 {
            return None;
        }

        Some((recent_avg - older_avg) / older_avg * 100.0)
    }

    /// Growth in bytes across the newest five readings when they never
    /// decrease from one to the next.
    pub fn continuous_growth(values: &[u64]) -> Option<u64> {
        if values.len() < GROWTH_WINDOW {
            return None;
        }
        let window = &values[values.len() - GROWTH_WINDOW..];
        let non_decreasing = window.windows(2).all(|pair| pair[1] >= pair[0]);
        non_decreasing.then(|| window[GROWTH_WINDOW - 1] - window[0])
    }
}

fn mean(values: &[u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
}

// ----------------------------------------------------------------------------
// 9.2 Baseline Manager
// ----------------------------------------------------------------------------

/// Reference reading used to compute absolute increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub sample: MemorySample,
    pub last_update: Timestamp,
}

/// What a recalibration check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecalibrationOutcome {
    /// There was no baseline; the current reading became it
    Initialized,
    Recalibrated { previous_heap: u64, new_heap: u64 },
    WindowNotElapsed { elapsed_ms: u64 },
    InsufficientData { available: usize, required: usize },
    TrendBlocked { trend: Trend },
}

impl RecalibrationOutcome {
    pub fn updated(&self) -> bool {
        matches!(self, RecalibrationOutcome::Initialized | RecalibrationOutcome::Recalibrated { .. })
    }
}

/// Owns the memory baseline shared by the sampler and the request hooks.
///
/// The baseline is swapped atomically, so readers see either no baseline or
/// a complete one. Recalibration only happens once the window has elapsed,
/// enough request measurements exist, and the short-window trend is stable
/// or decreasing. Moving it during growth would hide a leak from every
/// absolute-threshold check.
#[derive(Debug)]
pub struct BaselineManager {
    current: ArcSwapOption<Baseline>,
    window: Duration,
    min_measurements: usize,
    update_lock: Mutex<()>,
}

impl BaselineManager {
    pub fn new(config: &BaselineConfig) -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
            window: config.recalibration_window,
            min_measurements: config.min_measurements,
            update_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<Baseline> {
        self.current.load_full().map(|b| *b)
    }

    pub fn is_set(&self) -> bool {
        self.current.load().is_some()
    }

    /// Replace the baseline unconditionally.
    pub fn initialize(&self, sample: MemorySample) -> Baseline {
        let _guard = self.update_lock.lock();
        self.store(sample)
    }

    /// Set the baseline only if none exists. Returns whether it was set.
    pub fn initialize_if_absent(&self, sample: MemorySample) -> bool {
        let _guard = self.update_lock.lock();
        if self.current.load().is_some() {
            return false;
        }
        self.store(sample);
        true
    }

    fn store(&self, sample: MemorySample) -> Baseline {
        let baseline = Baseline {
            sample,
            last_update: sample.timestamp,
        };
        self.current.store(Some(Arc::new(baseline)));
        baseline
    }

    /// Decide whether `current` should become the new baseline given the
    /// recent request measurements (oldest first).
    pub fn maybe_recalibrate(&self, current: MemorySample, recent: &[u64], now: Timestamp) -> RecalibrationOutcome {
        let _guard = self.update_lock.lock();

        let Some(existing) = self.current.load_full() else {
            self.store(current);
            return RecalibrationOutcome::Initialized;
        };

        let elapsed_ms = existing.last_update.millis_until(now);
        if elapsed_ms <= self.window.as_millis() as u64 {
            return RecalibrationOutcome::WindowNotElapsed { elapsed_ms };
        }

        if recent.len() < self.min_measurements {
            return RecalibrationOutcome::InsufficientData {
                available: recent.len(),
                required: self.min_measurements,
            };
        }

        let trend = TrendAnalyzer::classify_short(recent);
        if !trend.permits_recalibration() {
            return RecalibrationOutcome::TrendBlocked { trend };
        }

        let previous_heap = existing.sample.heap_used();
        self.store(MemorySample::new(now, current.usage));
        RecalibrationOutcome::Recalibrated {
            previous_heap,
            new_heap: current.heap_used(),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.3 Memory Sampler
// ----------------------------------------------------------------------------

/// Memory section of the reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub current: MemoryUsage,
    pub baseline: Option<Baseline>,
    pub measurements: Vec<MemorySample>,
    pub trend: Trend,
}

/// Periodically records memory samples into a bounded buffer.
pub struct MemorySampler {
    probe: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    baseline: Arc<BaselineManager>,
    samples: RwLock<RingBuffer<MemorySample>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl MemorySampler {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        clock: Arc<dyn Clock>,
        baseline: Arc<BaselineManager>,
        capacity: usize,
    ) -> Self {
        Self {
            probe,
            clock,
            baseline,
            samples: RwLock::new(RingBuffer::new(capacity)),
            task: Mutex::new(None),
        }
    }

    /// Read the probe without recording anything.
    pub fn current(&self) -> MemoryUsage {
        self.probe.read()
    }

    fn capture(&self) -> MemorySample {
        MemorySample::new(self.clock.now(), self.probe.read())
    }

    /// Capture one sample, record it, and run the trend heuristics.
    pub fn sample_now(&self) -> MemorySample {
        let sample = self.capture();
        let heap_values: Vec<u64> = {
            let mut samples = self.samples.write();
            samples.push(sample);
            samples.iter().map(MemorySample::heap_used).collect()
        };
        self.analyze(&sample, &heap_values);
        sample
    }

    fn analyze(&self, current: &MemorySample, heap_values: &[u64]) {
        if heap_values.len() < GROWTH_WINDOW {
            return;
        }

        if let Some(baseline) = self.baseline.get() {
            let base = baseline.sample.heap_used();
            if base > 0 {
                let increase = signed_delta(current.heap_used(), base);
                let percent = increase as f64 / base as f64 * 100.0;
                if percent > HEAP_INCREASE_WARN_PERCENT {
                    warn!(
                        target: "leakscope::sampler",
                        increase_mb = bytes_to_mb(increase),
                        increase_percent = percent.round() as i64,
                        "Significant heap increase detected"
                    );
                }
            }
        }

        if let Some(growth) = TrendAnalyzer::continuous_growth(heap_values) {
            let window = &heap_values[heap_values.len() - GROWTH_WINDOW..];
            warn!(
                target: "leakscope::sampler",
                growth_mb = bytes_to_mb(growth as i64),
                first = window[0],
                last = window[GROWTH_WINDOW - 1],
                "Continuous memory growth detected over last {} samples",
                GROWTH_WINDOW
            );
        }
    }

    /// All recorded samples, oldest first.
    pub fn samples(&self) -> Vec<MemorySample> {
        self.samples.read().to_vec()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.samples.read().capacity()
    }

    /// Trend over the recorded samples, recomputed on every call.
    pub fn trend(&self) -> Trend {
        let heap_values: Vec<u64> = self.samples.read().iter().map(MemorySample::heap_used).collect();
        TrendAnalyzer::classify(&heap_values)
    }

    pub fn report(&self) -> MemoryReport {
        let (measurements, heap_values) = {
            let samples = self.samples.read();
            let measurements: Vec<MemorySample> =
                samples.latest_n(REPORT_MEASUREMENT_COUNT).into_iter().copied().collect();
            let heap_values: Vec<u64> = samples.iter().map(MemorySample::heap_used).collect();
            (measurements, heap_values)
        };

        MemoryReport {
            current: self.probe.read(),
            baseline: self.baseline.get(),
            measurements,
            trend: TrendAnalyzer::classify(&heap_values),
        }
    }
}

impl Debug for MemorySampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySampler")
            .field("probe", &self.probe)
            .field("samples", &self.sample_count())
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl Monitor for MemorySampler {
    fn name(&self) -> &str {
        "memory-sampler"
    }

    fn start(self: Arc<Self>, period: Duration) -> TaskHandle {
        let mut task = self.task.lock();
        if let Some(running) = task.as_ref() {
            return running.handle();
        }

        let first = self.capture();
        if self.baseline.initialize_if_absent(first) {
            info!(
                target: "leakscope::sampler",
                heap_used = first.usage.heap_used,
                rss = first.usage.rss,
                "Memory baseline initialized"
            );
        }

        let weak = Arc::downgrade(&self);
        let spawned = PeriodicTask::spawn("memory-sampler", period, false, move || {
            if let Some(sampler) = weak.upgrade() {
                sampler.sample_now();
            }
        });
        let handle = spawned.handle();
        *task = Some(spawned);

        info!(
            target: "leakscope::sampler",
            interval = %humantime::format_duration(period),
            "Memory sampling started"
        );
        handle
    }

    async fn stop(&self) -> MonitorResult<()> {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                let result = task.shutdown().await;
                debug!(target: "leakscope::sampler", "Memory sampling stopped");
                result
            }
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

// ============================================================================
// SECTION 10: CONNECTION TRACKING
// ============================================================================

/// One tracked session.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub session_id: String,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub event_listener_count: Option<u32>,
    _census: Option<CensusGuard>,
}

/// Liveness of one session at report time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub session_id: String,
    pub lifetime_ms: u64,
    pub last_activity_ms: u64,
    pub is_stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_listener_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub total_connections: usize,
    pub stale_connections: usize,
    pub connections: Vec<ConnectionStatus>,
}

/// Registry of live sessions keyed by session id.
pub struct ConnectionTracker {
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    census: Option<Arc<ObjectCensus>>,
}

impl ConnectionTracker {
    pub fn new(clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            clock,
            stale_after,
            census: None,
        }
    }

    /// Count every tracked session in `census` under [`SESSION_TYPE`].
    pub fn with_census(mut self, census: Arc<ObjectCensus>) -> Self {
        self.census = Some(census);
        self
    }

    /// Start tracking a session, replacing any existing record for it.
    pub fn track(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        let now = self.clock.now();
        let record = ConnectionRecord {
            session_id: session_id.clone(),
            created_at: now,
            last_activity: now,
            event_listener_count: None,
            _census: self.census.as_ref().map(|c| c.track(SESSION_TYPE)),
        };

        let total = {
            let mut connections = self.connections.write();
            connections.insert(session_id.clone(), record);
            connections.len()
        };
        debug!(target: "leakscope::connections", session = %session_id, total, "Tracking connection");
    }

    /// Record activity on a session. Unknown ids are ignored.
    pub fn touch(&self, session_id: &str) {
        let now = self.clock.now();
        if let Some(record) = self.connections.write().get_mut(session_id) {
            record.last_activity = now;
        }
    }

    /// Attach the number of event listeners registered for a session.
    pub fn set_listener_count(&self, session_id: &str, count: u32) -> bool {
        match self.connections.write().get_mut(session_id) {
            Some(record) => {
                record.event_listener_count = Some(count);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a session, returning how long it lived.
    pub fn remove(&self, session_id: &str) -> Option<Duration> {
        let record = self.connections.write().remove(session_id)?;
        let lifetime_ms = record.created_at.millis_until(self.clock.now());
        debug!(
            target: "leakscope::connections",
            session = %session_id,
            lifetime_ms,
            "Connection removed"
        );
        Some(Duration::from_millis(lifetime_ms))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.connections.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Per-session liveness, sorted by session id. Staleness is computed here.
    pub fn report(&self) -> ConnectionReport {
        let now = self.clock.now();
        let stale_after_ms = self.stale_after.as_millis() as u64;

        let mut connections: Vec<ConnectionStatus> = self
            .connections
            .read()
            .values()
            .map(|record| {
                let last_activity_ms = record.last_activity.millis_until(now);
                ConnectionStatus {
                    session_id: record.session_id.clone(),
                    lifetime_ms: record.created_at.millis_until(now),
                    last_activity_ms,
                    is_stale: last_activity_ms > stale_after_ms,
                    event_listener_count: record.event_listener_count,
                }
            })
            .collect();
        connections.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        ConnectionReport {
            total_connections: connections.len(),
            stale_connections: connections.iter().filter(|c| c.is_stale).count(),
            connections,
        }
    }

    pub fn log_periodic_report(&self) {
        let report = self.report();
        info!(
            target: "leakscope::connections",
            active = report.total_connections,
            stale = report.stale_connections,
            "Connection report"
        );

        if report.stale_connections > 0 {
            let stale: Vec<&str> = report
                .connections
                .iter()
                .filter(|c| c.is_stale)
                .map(|c| c.session_id.as_str())
                .collect();
            warn!(
                target: "leakscope::connections",
                sessions = ?stale,
                "Stale connections detected - potential memory leak"
            );
        }
    }
}

impl Debug for ConnectionTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("connections", &self.len())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

// ============================================================================
// SECTION 11: REQUEST INSTRUMENTATION
// ============================================================================

/// Resource section of the memory report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub request_count: u64,
    pub active_requests: u64,
    pub memory_baseline: Option<MemoryUsage>,
    pub last_baseline_update: Option<Timestamp>,
    pub current_memory: MemoryUsage,
    /// `heapUsed` above the baseline, in bytes
    pub memory_increase: i64,
}

/// Result of one finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub duration: Duration,
    pub memory_delta: i64,
    /// The delta exceeded the per-request increase threshold and was logged
    pub exceeded_increase_threshold: bool,
}

/// Process-wide request counters and the measurement window that drives
/// baseline recalibration.
pub struct RequestMetrics {
    probe: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    baseline: Arc<BaselineManager>,
    config: RequestConfig,
    census: Option<Arc<ObjectCensus>>,
    request_count: AtomicU64,
    active_requests: AtomicU64,
    window: Mutex<RingBuffer<HeapMeasurement>>,
}

impl RequestMetrics {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        clock: Arc<dyn Clock>,
        baseline: Arc<BaselineManager>,
        config: RequestConfig,
        window_capacity: usize,
    ) -> Self {
        Self {
            probe,
            clock,
            baseline,
            config,
            census: None,
            request_count: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            window: Mutex::new(RingBuffer::new(window_capacity)),
        }
    }

    /// Count in-flight requests in `census` under [`PENDING_FUTURE_TYPE`].
    pub fn with_census(mut self, census: Arc<ObjectCensus>) -> Self {
        self.census = Some(census);
        self
    }

    /// Hook run when a request arrives. The returned guard finishes the
    /// request when ended or dropped.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        let usage = self.probe.read();
        let now = self.clock.now();
        let sample = MemorySample::new(now, usage);

        self.request_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.active_requests.fetch_add(1, AtomicOrdering::Relaxed);

        let recent: Vec<u64> = {
            let mut window = self.window.lock();
            window.push(HeapMeasurement {
                timestamp: now,
                heap_used: usage.heap_used,
            });
            window.iter().map(|m| m.heap_used).collect()
        };

        match self.baseline.maybe_recalibrate(sample, &recent, now) {
            RecalibrationOutcome::Initialized => {
                debug!(target: "leakscope::requests", heap_used = usage.heap_used, "Memory baseline initialized");
            }
            RecalibrationOutcome::Recalibrated { previous_heap, new_heap } => {
                info!(
                    target: "leakscope::requests",
                    previous_mb = bytes_to_mb(previous_heap as i64),
                    new_mb = bytes_to_mb(new_heap as i64),
                    "Memory baseline recalibrated"
                );
            }
            RecalibrationOutcome::TrendBlocked { trend } => {
                debug!(target: "leakscope::requests", %trend, "Baseline update skipped: memory trend not stable");
            }
            RecalibrationOutcome::InsufficientData { available, required } => {
                debug!(
                    target: "leakscope::requests",
                    available,
                    required,
                    "Baseline update skipped: not enough measurements"
                );
            }
            RecalibrationOutcome::WindowNotElapsed { .. } => {}
        }

        let baseline_deviation = self.baseline_deviation(usage.heap_used);
        if let Some(diff) = baseline_deviation {
            warn!(
                target: "leakscope::requests",
                diff_mb = bytes_to_mb(diff),
                "High memory usage detected relative to baseline"
            );
        }

        RequestGuard {
            metrics: Arc::clone(self),
            started: Instant::now(),
            start_heap: usage.heap_used,
            baseline_deviation,
            finished: false,
            _pending: self.census.as_ref().map(|c| c.track(PENDING_FUTURE_TYPE)),
        }
    }

    /// Signed distance of `heap_used` from the baseline when its magnitude
    /// exceeds the high-memory threshold.
    pub fn baseline_deviation(&self, heap_used: u64) -> Option<i64> {
        let baseline = self.baseline.get()?;
        let diff = signed_delta(heap_used, baseline.sample.heap_used());
        (diff.unsigned_abs() > self.config.high_memory_threshold_bytes).then_some(diff)
    }

    fn finish(&self, started: Instant, start_heap: u64) -> RequestOutcome {
        self.active_requests.fetch_sub(1, AtomicOrdering::Relaxed);

        let duration = started.elapsed();
        let memory_delta = signed_delta(self.probe.read().heap_used, start_heap);
        let exceeded_increase_threshold = memory_delta > self.config.request_increase_threshold_bytes as i64;
        if exceeded_increase_threshold {
            warn!(
                target: "leakscope::requests",
                increase_mb = bytes_to_mb(memory_delta),
                duration_ms = duration.as_millis() as u64,
                "Request caused memory increase"
            );
        }

        RequestOutcome {
            duration,
            memory_delta,
            exceeded_increase_threshold,
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(AtomicOrdering::Relaxed)
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(AtomicOrdering::Relaxed)
    }

    /// Request measurements currently in the window, oldest first.
    pub fn recent_measurements(&self) -> Vec<HeapMeasurement> {
        self.window.lock().to_vec()
    }

    pub fn snapshot(&self) -> ResourceMetrics {
        let current = self.probe.read();
        let baseline = self.baseline.get();

        ResourceMetrics {
            request_count: self.request_count(),
            active_requests: self.active_requests(),
            memory_baseline: baseline.map(|b| b.sample.usage),
            last_baseline_update: baseline.map(|b| b.last_update),
            current_memory: current,
            memory_increase: baseline
                .map(|b| signed_delta(current.heap_used, b.sample.heap_used()))
                .unwrap_or(0),
        }
    }
}

impl Debug for RequestMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMetrics")
            .field("request_count", &self.request_count())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

/// Completion handle for one request.
#[derive(Debug)]
pub struct RequestGuard {
    metrics: Arc<RequestMetrics>,
    started: Instant,
    start_heap: u64,
    baseline_deviation: Option<i64>,
    finished: bool,
    _pending: Option<CensusGuard>,
}

impl RequestGuard {
    /// Distance from the baseline at arrival, when it crossed the
    /// high-memory threshold.
    pub fn baseline_deviation(&self) -> Option<i64> {
        self.baseline_deviation
    }

    /// Finish the request and report its duration and heap delta.
    pub fn end(mut self) -> RequestOutcome {
        self.finished = true;
        self.metrics.finish(self.started, self.start_heap)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.metrics.finish(self.started, self.start_heap);
        }
    }
}

// ============================================================================
// SECTION 12: MEDIA DIRECTORY MONITOR
// ============================================================================

/// Aggregate view of the media directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaScanReport {
    pub file_count: usize,
    pub total_bytes: u64,
    pub old_files: usize,
    pub scanned_at: Timestamp,
}

/// Periodically measures the media directory's size and the age of its files.
pub struct MediaDirectoryMonitor {
    dir: PathBuf,
    max_age: Duration,
    last_report: RwLock<Option<MediaScanReport>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl MediaDirectoryMonitor {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            last_report: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_report(&self) -> Option<MediaScanReport> {
        *self.last_report.read()
    }

    /// Scan the directory once. Subdirectories and the placeholder file are
    /// not counted.
    pub async fn scan(&self) -> MonitorResult<MediaScanReport> {
        let scan_err = |source: io::Error| MonitorError::ScanFailed {
            path: self.dir.clone(),
            source,
        };

        let cutoff = SystemTime::now().checked_sub(self.max_age).unwrap_or(UNIX_EPOCH);
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(scan_err)?;

        let mut file_count = 0usize;
        let mut total_bytes = 0u64;
        let mut old_files = 0usize;

        while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
            if entry.file_name() == MEDIA_PLACEHOLDER_FILE {
                continue;
            }
            let metadata = entry.metadata().await.map_err(scan_err)?;
            if !metadata.is_file() {
                continue;
            }

            file_count += 1;
            total_bytes += metadata.len();
            if metadata.modified().map(|m| m < cutoff).unwrap_or(false) {
                old_files += 1;
            }
        }

        let report = MediaScanReport {
            file_count,
            total_bytes,
            old_files,
            scanned_at: Timestamp::now(),
        };
        *self.last_report.write() = Some(report);

        debug!(
            target: "leakscope::media",
            dir = %self.dir.display(),
            files = file_count,
            total_mb = bytes_to_mb(total_bytes as i64),
            old_files,
            "Media directory scanned"
        );
        Ok(report)
    }

    /// One scheduled scan. Failures are logged; the schedule continues.
    async fn scheduled_scan(&self) {
        if let Err(e) = self.scan().await {
            error!(target: "leakscope::media", error = %e, "Error monitoring media directory");
        }
    }
}

impl Debug for MediaDirectoryMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDirectoryMonitor")
            .field("dir", &self.dir)
            .field("max_age", &self.max_age)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl Monitor for MediaDirectoryMonitor {
    fn name(&self) -> &str {
        "media-directory"
    }

    fn start(self: Arc<Self>, period: Duration) -> TaskHandle {
        let mut task = self.task.lock();
        if let Some(running) = task.as_ref() {
            return running.handle();
        }

        let weak = Arc::downgrade(&self);
        let spawned = PeriodicTask::spawn_async("media-directory", period, true, move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.scheduled_scan().await;
                }
            }
        });
        let handle = spawned.handle();
        *task = Some(spawned);
        handle
    }

    async fn stop(&self) -> MonitorResult<()> {
        let task = self.task.lock().take();
        match task {
            Some(task) => task.shutdown().await,
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

// ============================================================================
// SECTION 13: HEAP ANALYSIS
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Analysis Results
// ----------------------------------------------------------------------------

/// Growth of one object type between the baseline and now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeGrowth {
    pub current: u64,
    pub baseline: u64,
    pub increase: i64,
}

/// Result of comparing the current heap statistics with the stored baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapComparison {
    pub heap_size_increase: i64,
    pub object_count_increase: i64,
    pub suspicious_object_types: BTreeMap<String, TypeGrowth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub type_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakPatterns {
    pub high_object_counts: Vec<TypeCount>,
    pub suspicious_patterns: Vec<String>,
    pub protected_object_issues: Vec<TypeCount>,
}

impl LeakPatterns {
    pub fn is_clean(&self) -> bool {
        self.high_object_counts.is_empty()
            && self.suspicious_patterns.is_empty()
            && self.protected_object_issues.is_empty()
    }
}

/// Human-oriented heap summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapMemorySummary {
    pub rss_mb: i64,
    pub heap_used_mb: i64,
    pub heap_total_mb: i64,
    pub external_mb: i64,
    pub object_count: u64,
    pub top_object_types: Vec<TypeCount>,
}

/// Location of an exported heap snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSnapshot {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument<'a> {
    engine: &'a str,
    name: &'a str,
    sequence: u64,
    created_at: Timestamp,
    memory: MemoryUsage,
    stats: &'a HeapStatsSample,
}

// ----------------------------------------------------------------------------
// 13.2 Heap Analyzer
// ----------------------------------------------------------------------------

/// Whether `name` is one normal path component with no separators of any
/// platform, so joining it onto a directory stays inside that directory.
pub fn is_plain_file_stem(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

/// Compares heap statistics against a stored baseline and flags object types
/// whose growth looks like a leak.
pub struct HeapAnalyzer {
    source: Arc<dyn HeapStatsSource>,
    probe: Arc<dyn MemoryProbe>,
    config: HeapConfig,
    baseline: ArcSwapOption<HeapStatsSample>,
    snapshot_counter: AtomicU64,
}

impl HeapAnalyzer {
    pub fn new(source: Arc<dyn HeapStatsSource>, probe: Arc<dyn MemoryProbe>, config: HeapConfig) -> Self {
        Self {
            source,
            probe,
            config,
            baseline: ArcSwapOption::const_empty(),
            snapshot_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn capture_stats(&self) -> HeapStatsSample {
        self.source.capture()
    }

    /// Store the current statistics as the comparison baseline.
    pub fn set_baseline(&self) -> HeapStatsSample {
        let stats = self.capture_stats();
        self.baseline.store(Some(Arc::new(stats.clone())));
        info!(
            target: "leakscope::heap",
            heap_size = stats.heap_size,
            objects = stats.object_count,
            "Heap baseline set"
        );
        stats
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.load().is_some()
    }

    /// Compare current statistics with the baseline; `None` before any
    /// [`HeapAnalyzer::set_baseline`].
    pub fn compare_with_baseline(&self) -> Option<HeapComparison> {
        let baseline = self.baseline.load_full()?;
        let current = self.capture_stats();
        Some(self.compare(&baseline, &current))
    }

    pub fn compare(&self, baseline: &HeapStatsSample, current: &HeapStatsSample) -> HeapComparison {
        let suspicious_object_types = current
            .object_type_counts
            .iter()
            .filter_map(|(type_name, &count)| {
                let base = baseline.object_type_counts.get(type_name).copied().unwrap_or(0);
                self.is_suspicious(base, count).then(|| {
                    (
                        type_name.clone(),
                        TypeGrowth {
                            current: count,
                            baseline: base,
                            increase: signed_delta(count, base),
                        },
                    )
                })
            })
            .collect();

        HeapComparison {
            heap_size_increase: signed_delta(current.heap_size, baseline.heap_size),
            object_count_increase: signed_delta(current.object_count, baseline.object_count),
            suspicious_object_types,
        }
    }

    /// A type is suspicious when it grew by more than the absolute threshold,
    /// or by more than `ratio` times a non-zero baseline.
    pub fn is_suspicious(&self, baseline: u64, current: u64) -> bool {
        let increase = signed_delta(current, baseline);
        if increase <= 0 {
            return false;
        }
        let increase = increase as u64;
        increase > self.config.suspicious_absolute_increase
            || (baseline > 0 && increase > self.config.suspicious_ratio.saturating_mul(baseline))
    }

    pub fn analyze_leak_patterns(&self) -> LeakPatterns {
        self.analyze_stats(&self.capture_stats())
    }

    pub fn analyze_stats(&self, stats: &HeapStatsSample) -> LeakPatterns {
        let cfg = &self.config;

        let high_object_counts = stats
            .object_type_counts
            .iter()
            .filter(|(_, &count)| count > cfg.high_object_count)
            .map(|(type_name, &count)| TypeCount {
                type_name: type_name.clone(),
                count,
            })
            .collect();

        let count_of = |name: &str| stats.object_type_counts.get(name).copied().unwrap_or(0);
        let mut suspicious_patterns = Vec::new();

        let pending = count_of(PENDING_FUTURE_TYPE);
        if pending > cfg.pending_future_threshold {
            suspicious_patterns.push(format!(
                "High number of pending futures ({pending}) - possible unresolved async work"
            ));
        }
        let closures = count_of(CLOSURE_TYPE);
        if closures > cfg.closure_threshold {
            suspicious_patterns.push(format!("High number of closures ({closures}) - possible closure leaks"));
        }
        let objects = count_of(OBJECT_TYPE);
        if objects > cfg.object_threshold {
            suspicious_patterns.push(format!(
                "High number of objects ({objects}) - possible object accumulation"
            ));
        }

        let protected_object_issues = stats
            .protected_object_type_counts
            .iter()
            .filter(|(_, &count)| count > cfg.protected_object_threshold)
            .map(|(type_name, &count)| TypeCount {
                type_name: type_name.clone(),
                count,
            })
            .collect();

        LeakPatterns {
            high_object_counts,
            suspicious_patterns,
            protected_object_issues,
        }
    }

    pub fn memory_usage(&self) -> HeapMemorySummary {
        let usage = self.probe.read();
        let stats = self.capture_stats();

        let mut top: Vec<TypeCount> = stats
            .object_type_counts
            .iter()
            .map(|(type_name, &count)| TypeCount {
                type_name: type_name.clone(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.type_name.cmp(&b.type_name)));
        top.truncate(10);

        HeapMemorySummary {
            rss_mb: bytes_to_mb(usage.rss as i64),
            heap_used_mb: bytes_to_mb(usage.heap_used as i64),
            heap_total_mb: bytes_to_mb(usage.heap_total as i64),
            external_mb: bytes_to_mb(usage.external as i64),
            object_count: stats.object_count,
            top_object_types: top,
        }
    }

    /// The snapshot name prefix to use: the caller's name, or the configured
    /// default when absent or blank. Names that could leave the snapshot
    /// directory are rejected.
    fn resolve_snapshot_base<'a>(&'a self, name: Option<&'a str>) -> HeapResult<&'a str> {
        let base = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n,
            _ => self.config.default_snapshot_name.as_str(),
        };
        if !is_plain_file_stem(base) {
            return Err(HeapError::InvalidSnapshotName { name: base.to_string() });
        }
        Ok(base)
    }

    /// Next snapshot filename. The counter never repeats for this analyzer.
    fn next_snapshot_name(&self, base: &str) -> (String, u64) {
        let sequence = self.snapshot_counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        (format!("{base}-{sequence}.{SNAPSHOT_EXTENSION}"), sequence)
    }

    /// Write a heap snapshot document to the snapshot directory. Blocking;
    /// never call this from a periodic task.
    pub fn create_snapshot(&self, name: Option<&str>) -> HeapResult<HeapSnapshot> {
        let base = self.resolve_snapshot_base(name)?;
        let (filename, sequence) = self.next_snapshot_name(base);
        let dir = &self.config.snapshot_dir;
        let path = dir.join(&filename);

        fs::create_dir_all(dir).map_err(|source| HeapError::SnapshotWrite {
            path: dir.clone(),
            source,
        })?;

        let stats = self.capture_stats();
        let document = SnapshotDocument {
            engine: ENGINE_FULL_NAME,
            name: base,
            sequence,
            created_at: Timestamp::now(),
            memory: self.probe.read(),
            stats: &stats,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        fs::write(&path, &bytes).map_err(|source| HeapError::SnapshotWrite {
            path: path.clone(),
            source,
        })?;

        info!(
            target: "leakscope::heap",
            path = %path.display(),
            size_bytes = bytes.len(),
            "Heap snapshot written"
        );

        Ok(HeapSnapshot {
            path,
            filename,
            size_bytes: bytes.len() as u64,
        })
    }

    /// [`HeapAnalyzer::create_snapshot`] on the blocking thread pool.
    pub async fn create_snapshot_async(self: &Arc<Self>, name: Option<String>) -> HeapResult<HeapSnapshot> {
        let analyzer = Arc::clone(self);
        tokio::task::spawn_blocking(move || analyzer.create_snapshot(name.as_deref()))
            .await
            .map_err(|e| HeapError::TaskFailed(e.to_string()))?
    }
}

impl Debug for HeapAnalyzer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAnalyzer")
            .field("source", &self.source)
            .field("has_baseline", &self.has_baseline())
            .field("snapshots", &self.snapshot_counter.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

// ============================================================================
// SECTION 14: LEAK SIMULATOR
// ============================================================================
// Synthetic workloads that under-clean on purpose. Each one leaves a known
// amount of state behind so the detection paths can be checked end to end.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Scenarios
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeakScenario {
    ConnectionChurn,
    TimerAccumulation,
    ClosureRetention,
    BufferAccumulation,
    PayloadRetention,
}

impl LeakScenario {
    /// All scenarios in execution order.
    pub const ALL: [LeakScenario; 5] = [
        LeakScenario::ConnectionChurn,
        LeakScenario::TimerAccumulation,
        LeakScenario::ClosureRetention,
        LeakScenario::BufferAccumulation,
        LeakScenario::PayloadRetention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeakScenario::ConnectionChurn => "connection-churn",
            LeakScenario::TimerAccumulation => "timer-accumulation",
            LeakScenario::ClosureRetention => "closure-retention",
            LeakScenario::BufferAccumulation => "buffer-accumulation",
            LeakScenario::PayloadRetention => "payload-retention",
        }
    }

    /// Older name accepted on input.
    pub fn alias(&self) -> &'static str {
        match self {
            LeakScenario::ConnectionChurn => "event-listeners",
            LeakScenario::TimerAccumulation => "timers",
            LeakScenario::ClosureRetention => "closures",
            LeakScenario::BufferAccumulation => "buffers",
            LeakScenario::PayloadRetention => "webhooks",
        }
    }
}

impl Display for LeakScenario {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeakScenario {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        LeakScenario::ALL
            .into_iter()
            .find(|sc| sc.as_str() == wanted || sc.alias() == wanted)
            .ok_or_else(|| SimulationError::UnknownScenario {
                name: s.to_string(),
                available: LeakScenario::ALL
                    .iter()
                    .map(LeakScenario::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

// ----------------------------------------------------------------------------
// 14.2 Results
// ----------------------------------------------------------------------------

/// What a scenario left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScenarioDetail {
    Connections {
        remaining: usize,
        #[serde(rename = "totalConnections")]
        total_connections: usize,
        #[serde(rename = "staleConnections")]
        stale_connections: usize,
    },
    Timers {
        active: usize,
    },
    Closures {
        retained: usize,
    },
    Buffers {
        retained: usize,
        #[serde(rename = "retainedBytes")]
        retained_bytes: u64,
    },
    Payloads {
        queued: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakScenarioResult {
    pub scenario: LeakScenario,
    /// `heapUsed` after the scenario minus before, in bytes
    pub memory_increase: i64,
    pub detail: ScenarioDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOutcome {
    pub scenario: LeakScenario,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<LeakScenarioResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakTestSummary {
    pub total_memory_increase: i64,
    pub memory_trend: Trend,
    pub current_heap_mb: i64,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakTestReport {
    pub results: Vec<ScenarioOutcome>,
    pub summary: LeakTestSummary,
    pub completed_at: Timestamp,
}

impl LeakTestReport {
    pub fn outcome(&self, scenario: LeakScenario) -> Option<&ScenarioOutcome> {
        self.results.iter().find(|o| o.scenario == scenario)
    }
}

// ----------------------------------------------------------------------------
// 14.3 Retained Artifacts
// ----------------------------------------------------------------------------

struct RetainedClosure {
    callback: Box<dyn Fn() -> usize + Send + Sync>,
    _census: Option<CensusGuard>,
}

struct RetainedBuffer {
    data: BytesMut,
    _census: Option<CensusGuard>,
}

struct RetryPayload {
    id: Uuid,
    media: BytesMut,
    thumbnail: BytesMut,
    metadata: Vec<String>,
    attempts: u32,
    _census: Option<CensusGuard>,
}

impl RetryPayload {
    fn size_bytes(&self) -> u64 {
        let metadata: usize = self.metadata.iter().map(String::len).sum();
        (self.media.len() + self.thumbnail.len() + metadata) as u64
    }
}

#[derive(Default)]
struct RetainedArtifacts {
    sessions: Vec<String>,
    closures: VecDeque<RetainedClosure>,
    buffers: VecDeque<RetainedBuffer>,
    payloads: VecDeque<RetryPayload>,
}

// ----------------------------------------------------------------------------
// 14.4 Simulator
// ----------------------------------------------------------------------------

/// Runs the synthetic leak scenarios against the live monitoring services.
///
/// Closures, buffers and retry payloads a scenario leaves behind live only
/// until the `run`/`run_scenario` call that produced them returns, so every
/// call starts from an empty state and the retention budget applies per call.
/// Timers are aborted by [`LeakSimulator::cleanup`] after every scenario.
/// Leaked sessions stay in the tracker until the simulator is dropped.
pub struct LeakSimulator {
    tracker: Arc<ConnectionTracker>,
    sampler: Arc<MemorySampler>,
    probe: Arc<dyn MemoryProbe>,
    census: Option<Arc<ObjectCensus>>,
    collector: Option<Arc<dyn GarbageCollector>>,
    config: LeakSimulatorConfig,
    timers: Mutex<Vec<TokioJoinHandle<()>>>,
    retained: Mutex<RetainedArtifacts>,
    run_lock: TokioMutex<()>,
    cleanup_runs: AtomicU64,
}

/// Runs [`LeakSimulator::cleanup`] when a scenario exits, however it exits.
struct CleanupGuard<'a> {
    simulator: &'a LeakSimulator,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.simulator.cleanup();
    }
}

/// Releases the artifacts retained during one run call when it ends.
struct RunScope<'a> {
    simulator: &'a LeakSimulator,
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        self.simulator.release_artifacts();
    }
}

impl LeakSimulator {
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        sampler: Arc<MemorySampler>,
        probe: Arc<dyn MemoryProbe>,
        config: LeakSimulatorConfig,
    ) -> Self {
        Self {
            tracker,
            sampler,
            probe,
            census: None,
            collector: None,
            config,
            timers: Mutex::new(Vec::new()),
            retained: Mutex::new(RetainedArtifacts::default()),
            run_lock: TokioMutex::new(()),
            cleanup_runs: AtomicU64::new(0),
        }
    }

    pub fn with_census(mut self, census: Arc<ObjectCensus>) -> Self {
        self.census = Some(census);
        self
    }

    pub fn with_collector(mut self, collector: Option<Arc<dyn GarbageCollector>>) -> Self {
        self.collector = collector;
        self
    }

    /// Timers spawned by the harness that are still running.
    pub fn active_timer_count(&self) -> usize {
        self.timers.lock().iter().filter(|t| !t.is_finished()).count()
    }

    pub fn cleanup_count(&self) -> u64 {
        self.cleanup_runs.load(AtomicOrdering::Relaxed)
    }

    /// Abort every harness timer and ask the host to collect, if it can.
    pub fn cleanup(&self) {
        let timers: Vec<TokioJoinHandle<()>> = std::mem::take(&mut *self.timers.lock());
        let aborted = timers.len();
        for timer in timers {
            timer.abort();
        }

        match &self.collector {
            Some(gc) => {
                let reclaimed = gc.collect();
                debug!(target: "leakscope::simulator", collector = gc.name(), reclaimed, "Manual collection requested");
            }
            None => {
                debug!(target: "leakscope::simulator", "No manual collection capability on this host");
            }
        }

        self.cleanup_runs.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(target: "leakscope::simulator", aborted_timers = aborted, "Leak test cleanup complete");
    }

    /// Drop the closures, buffers and payloads held by the current run.
    fn release_artifacts(&self) {
        let (closures, buffers, payloads) = {
            let mut retained = self.retained.lock();
            (
                std::mem::take(&mut retained.closures),
                std::mem::take(&mut retained.buffers),
                std::mem::take(&mut retained.payloads),
            )
        };
        debug!(
            target: "leakscope::simulator",
            closures = closures.len(),
            buffers = buffers.len(),
            payloads = payloads.len(),
            "Released leak test artifacts"
        );
    }

    /// Closures, buffers and payloads currently held. Zero outside a run.
    pub fn retained_artifact_count(&self) -> usize {
        let retained = self.retained.lock();
        retained.closures.len() + retained.buffers.len() + retained.payloads.len()
    }

    /// Run a single scenario. Cleanup runs afterwards even on failure.
    pub async fn run_scenario(&self, scenario: LeakScenario) -> SimulationResult<LeakScenarioResult> {
        let _running = self.run_lock.lock().await;
        let _scope = RunScope { simulator: self };
        self.run_guarded(scenario).await
    }

    /// Run all scenarios one after another.
    pub async fn run_all(&self) -> LeakTestReport {
        self.run(&LeakScenario::ALL).await
    }

    /// Run the given scenarios strictly in order. Each is measured against the
    /// heap state left by the previous one, so they never overlap.
    pub async fn run(&self, scenarios: &[LeakScenario]) -> LeakTestReport {
        let _running = self.run_lock.lock().await;
        let _scope = RunScope { simulator: self };
        info!(target: "leakscope::simulator", scenarios = scenarios.len(), "Starting leak tests");

        let mut results = Vec::with_capacity(scenarios.len());
        for &scenario in scenarios {
            let outcome = match self.run_guarded(scenario).await {
                Ok(result) => ScenarioOutcome {
                    scenario,
                    status: ScenarioStatus::Passed,
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    warn!(target: "leakscope::simulator", %scenario, error = %e, "Leak scenario failed");
                    ScenarioOutcome {
                        scenario,
                        status: ScenarioStatus::Failed,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(outcome);
        }

        sleep(self.config.settle_delay).await;
        let current = self.sampler.sample_now();

        let passed = results.iter().filter(|o| o.status == ScenarioStatus::Passed).count();
        let summary = LeakTestSummary {
            total_memory_increase: results
                .iter()
                .filter_map(|o| o.result.as_ref())
                .map(|r| r.memory_increase)
                .sum(),
            memory_trend: self.sampler.trend(),
            current_heap_mb: current.usage.heap_used_mb(),
            passed,
            failed: results.len() - passed,
        };

        info!(
            target: "leakscope::simulator",
            passed = summary.passed,
            failed = summary.failed,
            total_increase_mb = bytes_to_mb(summary.total_memory_increase),
            trend = %summary.memory_trend,
            "Leak tests completed"
        );

        LeakTestReport {
            results,
            summary,
            completed_at: Timestamp::now(),
        }
    }

    async fn run_guarded(&self, scenario: LeakScenario) -> SimulationResult<LeakScenarioResult> {
        let _cleanup = CleanupGuard { simulator: self };
        debug!(target: "leakscope::simulator", %scenario, "Running leak scenario");

        let before = self.probe.read().heap_used;
        let detail = match scenario {
            LeakScenario::ConnectionChurn => self.connection_churn().await?,
            LeakScenario::TimerAccumulation => self.timer_accumulation()?,
            LeakScenario::ClosureRetention => self.closure_retention()?,
            LeakScenario::BufferAccumulation => self.buffer_accumulation()?,
            LeakScenario::PayloadRetention => self.payload_retention()?,
        };
        let memory_increase = signed_delta(self.probe.read().heap_used, before);

        info!(
            target: "leakscope::simulator",
            %scenario,
            increase_mb = bytes_to_mb(memory_increase),
            "Leak scenario finished"
        );
        Ok(LeakScenarioResult {
            scenario,
            memory_increase,
            detail,
        })
    }

    fn check_budget(&self, scenario: LeakScenario, retained: u64) -> SimulationResult<()> {
        if retained > self.config.max_retained_bytes {
            return Err(SimulationError::BudgetExceeded {
                scenario,
                retained,
                budget: self.config.max_retained_bytes,
            });
        }
        Ok(())
    }

    async fn connection_churn(&self) -> SimulationResult<ScenarioDetail> {
        let cfg = &self.config;
        let mut leaked = Vec::new();

        for i in 0..cfg.connection_iterations {
            let session_id = format!("leak-test-{}", Uuid::new_v4());
            self.tracker.track(session_id.as_str());
            sleep(cfg.connection_activity_delay).await;
            self.tracker.touch(&session_id);

            if i % cfg.connection_cleanup_every == 0 {
                self.tracker.remove(&session_id);
            } else {
                leaked.push(session_id);
            }
        }

        let remaining = leaked.len();
        self.retained.lock().sessions.extend(leaked);
        let report = self.tracker.report();
        Ok(ScenarioDetail::Connections {
            remaining,
            total_connections: report.total_connections,
            stale_connections: report.stale_connections,
        })
    }

    fn timer_accumulation(&self) -> SimulationResult<ScenarioDetail> {
        let cfg = &self.config;
        let per_tick_bytes = (cfg.timer_allocation_len * std::mem::size_of::<String>()) as u64;

        for i in 0..cfg.timer_count {
            let period = cfg.timer_period;
            let len = cfg.timer_allocation_len;
            let pinned = self.census.as_ref().map(|c| c.track_protected(TIMER_TYPE));

            let timer = tokio::spawn(async move {
                let _pinned = pinned;
                let mut ticker = interval(period);
                let mut held: Vec<String> = Vec::with_capacity(len);
                loop {
                    ticker.tick().await;
                    held.clear();
                    held.extend((0..len).map(|j| format!("timer-{i}-{j}")));
                    trace!(target: "leakscope::simulator", timer = i, held = held.len(), "Timer tick");
                }
            });

            if i % cfg.timer_clear_every == 0 {
                timer.abort();
            } else {
                self.timers.lock().push(timer);
            }

            let active = self.timers.lock().len() as u64;
            self.check_budget(LeakScenario::TimerAccumulation, active * per_tick_bytes)?;
        }

        Ok(ScenarioDetail::Timers {
            active: self.active_timer_count(),
        })
    }

    fn closure_retention(&self) -> SimulationResult<ScenarioDetail> {
        let cfg = &self.config;
        let closure_bytes = (cfg.closure_payload_len * std::mem::size_of::<u64>()) as u64;
        let mut retained = self.retained.lock();

        for i in 0..cfg.closure_count {
            let captured: Vec<u64> = (0..cfg.closure_payload_len as u64).collect();
            retained.closures.push_back(RetainedClosure {
                callback: Box::new(move || captured.len()),
                _census: self.census.as_ref().map(|c| c.track(CLOSURE_TYPE)),
            });

            if i % cfg.closure_release_every == 0 {
                retained.closures.pop_front();
            }

            self.check_budget(
                LeakScenario::ClosureRetention,
                retained.closures.len() as u64 * closure_bytes,
            )?;
        }

        let held: usize = retained.closures.iter().map(|c| (c.callback)()).sum();
        trace!(target: "leakscope::simulator", captured_elements = held, "Closures retained");
        Ok(ScenarioDetail::Closures {
            retained: retained.closures.len(),
        })
    }

    fn buffer_accumulation(&self) -> SimulationResult<ScenarioDetail> {
        let cfg = &self.config;
        let mut retained = self.retained.lock();

        for i in 0..cfg.buffer_iterations {
            for size in [cfg.primary_buffer_bytes, cfg.secondary_buffer_bytes] {
                let mut data = BytesMut::with_capacity(size);
                data.resize(size, (i % 256) as u8);
                retained.buffers.push_back(RetainedBuffer {
                    _census: self.census.as_ref().map(|c| c.track_bytes(BUFFER_TYPE, size as u64)),
                    data,
                });
            }

            if i % cfg.buffer_release_every == 0 && retained.buffers.len() > 5 {
                retained.buffers.pop_front();
                retained.buffers.pop_front();
            }

            let bytes: u64 = retained.buffers.iter().map(|b| b.data.len() as u64).sum();
            self.check_budget(LeakScenario::BufferAccumulation, bytes)?;
        }

        Ok(ScenarioDetail::Buffers {
            retained: retained.buffers.len(),
            retained_bytes: retained.buffers.iter().map(|b| b.data.len() as u64).sum(),
        })
    }

    fn payload_retention(&self) -> SimulationResult<ScenarioDetail> {
        let cfg = &self.config;
        let mut retained = self.retained.lock();

        for i in 0..cfg.payload_count {
            let id = Uuid::new_v4();
            let mut media = BytesMut::with_capacity(cfg.payload_media_bytes);
            media.resize(cfg.payload_media_bytes, b'm');
            let mut thumbnail = BytesMut::with_capacity(cfg.payload_thumbnail_bytes);
            thumbnail.resize(cfg.payload_thumbnail_bytes, b't');
            let metadata = (0..cfg.payload_metadata_len)
                .map(|j| format!("{id}-meta-{j}"))
                .collect();

            retained.payloads.push_back(RetryPayload {
                id,
                media,
                thumbnail,
                metadata,
                attempts: (i % 3) as u32,
                _census: self.census.as_ref().map(|c| c.track(OBJECT_TYPE)),
            });

            if i % cfg.payload_drain_every == 0 && retained.payloads.len() > 2 {
                if let Some(dropped) = retained.payloads.pop_front() {
                    trace!(target: "leakscope::simulator", payload = %dropped.id, attempts = dropped.attempts, "Retry payload drained");
                }
            }

            let bytes: u64 = retained.payloads.iter().map(RetryPayload::size_bytes).sum();
            self.check_budget(LeakScenario::PayloadRetention, bytes)?;
        }

        Ok(ScenarioDetail::Payloads {
            queued: retained.payloads.len(),
        })
    }
}

impl Debug for LeakSimulator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let retained = self.retained.lock();
        f.debug_struct("LeakSimulator")
            .field("active_timers", &self.active_timer_count())
            .field("sessions", &retained.sessions.len())
            .field("closures", &retained.closures.len())
            .field("buffers", &retained.buffers.len())
            .field("payloads", &retained.payloads.len())
            .field("cleanups", &self.cleanup_count())
            .finish()
    }
}

impl Drop for LeakSimulator {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
        for session_id in self.retained.get_mut().sessions.drain(..) {
            self.tracker.remove(&session_id);
        }
    }
}

// ============================================================================
// SECTION 15: MONITORING CONTEXT & REPORTS
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Report Types
// ----------------------------------------------------------------------------

/// Merged memory, resource and connection view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringReport {
    pub memory: MemoryReport,
    pub resources: ResourceMetrics,
    pub connections: ConnectionReport,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
}

impl HealthStatus {
    /// Warning when memory is trending up or any session went stale.
    pub fn from_signals(trend: Trend, stale_connections: usize) -> Self {
        if trend == Trend::Increasing || stale_connections > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMemory {
    pub current: String,
    pub trend: Trend,
    pub increase: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthConnections {
    pub active: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthRequests {
    pub total: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub memory: HealthMemory,
    pub connections: HealthConnections,
    pub requests: HealthRequests,
    pub timestamp: String,
}

/// Heap statistics with the pattern analysis and summary attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapStatsReport {
    pub stats: HeapStatsSample,
    pub leak_patterns: LeakPatterns,
    pub memory_usage: HeapMemorySummary,
    pub timestamp: String,
}

fn format_mb(bytes: i64) -> String {
    format!("{} MB", bytes_to_mb(bytes))
}

// ----------------------------------------------------------------------------
// 15.2 Monitoring Context
// ----------------------------------------------------------------------------

/// Every monitoring service, constructed once and shared by `Arc`.
///
/// The request layer calls the hooks, the protocol client calls the session
/// hooks, and report queries read from here.
pub struct MonitoringContext {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    census: Arc<ObjectCensus>,
    probe: Arc<dyn MemoryProbe>,
    baseline: Arc<BaselineManager>,
    sampler: Arc<MemorySampler>,
    connections: Arc<ConnectionTracker>,
    requests: Arc<RequestMetrics>,
    heap: Arc<HeapAnalyzer>,
    media: Arc<MediaDirectoryMonitor>,
    simulator: LeakSimulator,
    created_at: Timestamp,
}

impl MonitoringContext {
    /// Services wired to the running process.
    pub fn new(config: EngineConfig) -> Self {
        let census = Arc::new(ObjectCensus::new());
        let probe: Arc<dyn MemoryProbe> = Arc::new(ProcessMemoryProbe::new().with_census(Arc::clone(&census)));
        Self::with_parts(config, Arc::new(SystemClock), probe, census, host_garbage_collector())
    }

    /// Services wired to the given clock, probe and census.
    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn MemoryProbe>,
        census: Arc<ObjectCensus>,
        collector: Option<Arc<dyn GarbageCollector>>,
    ) -> Self {
        let baseline = Arc::new(BaselineManager::new(&config.baseline));

        let sampler = Arc::new(MemorySampler::new(
            Arc::clone(&probe),
            Arc::clone(&clock),
            Arc::clone(&baseline),
            config.monitoring.sample_capacity,
        ));

        let connections = Arc::new(
            ConnectionTracker::new(Arc::clone(&clock), config.monitoring.stale_after).with_census(Arc::clone(&census)),
        );

        let requests = Arc::new(
            RequestMetrics::new(
                Arc::clone(&probe),
                Arc::clone(&clock),
                Arc::clone(&baseline),
                config.requests.clone(),
                config.baseline.window_capacity,
            )
            .with_census(Arc::clone(&census)),
        );

        let heap_source: Arc<dyn HeapStatsSource> =
            Arc::new(CensusHeapStats::new(Arc::clone(&census), Arc::clone(&probe)));
        let heap = Arc::new(HeapAnalyzer::new(heap_source, Arc::clone(&probe), config.heap.clone()));

        let media = Arc::new(MediaDirectoryMonitor::new(
            config.monitoring.media_dir.clone(),
            config.monitoring.media_max_age,
        ));

        let simulator = LeakSimulator::new(
            Arc::clone(&connections),
            Arc::clone(&sampler),
            Arc::clone(&probe),
            config.simulator.clone(),
        )
        .with_census(Arc::clone(&census))
        .with_collector(collector);

        let created_at = clock.now();
        Self {
            config,
            clock,
            census,
            probe,
            baseline,
            sampler,
            connections,
            requests,
            heap,
            media,
            simulator,
            created_at,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn census(&self) -> &Arc<ObjectCensus> {
        &self.census
    }

    pub fn baseline(&self) -> &Arc<BaselineManager> {
        &self.baseline
    }

    pub fn sampler(&self) -> &Arc<MemorySampler> {
        &self.sampler
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    pub fn requests(&self) -> &Arc<RequestMetrics> {
        &self.requests
    }

    pub fn heap(&self) -> &Arc<HeapAnalyzer> {
        &self.heap
    }

    pub fn media(&self) -> &Arc<MediaDirectoryMonitor> {
        &self.media
    }

    pub fn simulator(&self) -> &LeakSimulator {
        &self.simulator
    }

    pub fn uptime_ms(&self) -> u64 {
        self.created_at.millis_until(self.clock.now())
    }

    // ---- hooks ------------------------------------------------------------

    /// Called by the request layer when a request arrives.
    pub fn begin_request(&self) -> RequestGuard {
        self.requests.begin()
    }

    pub fn session_connected(&self, session_id: &str) {
        self.connections.track(session_id);
    }

    pub fn session_activity(&self, session_id: &str) {
        self.connections.touch(session_id);
    }

    pub fn session_disconnected(&self, session_id: &str) {
        self.connections.remove(session_id);
    }

    // ---- reports ----------------------------------------------------------

    pub fn memory_report(&self) -> MonitoringReport {
        MonitoringReport {
            memory: self.sampler.report(),
            resources: self.requests.snapshot(),
            connections: self.connections.report(),
            timestamp: self.clock.now().to_rfc3339(),
        }
    }

    pub fn health_report(&self) -> HealthReport {
        let trend = self.sampler.trend();
        let connections = self.connections.report();
        let resources = self.requests.snapshot();

        HealthReport {
            status: HealthStatus::from_signals(trend, connections.stale_connections),
            memory: HealthMemory {
                current: format_mb(resources.current_memory.heap_used as i64),
                trend,
                increase: format_mb(resources.memory_increase),
            },
            connections: HealthConnections {
                active: connections.total_connections,
                stale: connections.stale_connections,
            },
            requests: HealthRequests {
                total: resources.request_count,
                active: resources.active_requests,
            },
            timestamp: self.clock.now().to_rfc3339(),
        }
    }

    pub fn heap_stats(&self) -> HeapStatsReport {
        let stats = self.heap.capture_stats();
        HeapStatsReport {
            leak_patterns: self.heap.analyze_stats(&stats),
            memory_usage: self.heap.memory_usage(),
            stats,
            timestamp: self.clock.now().to_rfc3339(),
        }
    }

    pub fn set_heap_baseline(&self) -> HeapStatsSample {
        self.heap.set_baseline()
    }

    pub fn compare_heap_with_baseline(&self) -> Option<HeapComparison> {
        self.heap.compare_with_baseline()
    }

    /// Export a heap snapshot off the async workers.
    pub async fn create_heap_snapshot(&self, name: Option<String>) -> HeapResult<HeapSnapshot> {
        self.heap.create_snapshot_async(name).await
    }

    /// Run one scenario, or all of them when `scenario` is `None`.
    pub async fn run_leak_tests(&self, scenario: Option<LeakScenario>) -> LeakTestReport {
        match scenario {
            Some(scenario) => self.simulator.run(&[scenario]).await,
            None => self.simulator.run_all().await,
        }
    }
}

impl Debug for MonitoringContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringContext")
            .field("sampler", &self.sampler)
            .field("connections", &self.connections)
            .field("requests", &self.requests)
            .field("heap", &self.heap)
            .field("media", &self.media)
            .finish()
    }
}

// ============================================================================
// SECTION 16: MONITORING ORCHESTRATOR
// ============================================================================

/// Starts and stops every periodic monitoring task as one unit.
///
/// The sampler and the media scan own their tasks; the connection report and
/// the trend summary are owned here. Every task's [`TaskHandle`] is retained
/// so [`MonitoringOrchestrator::stop`] can cancel all of them even when a
/// sub-monitor fails to stop cleanly.
pub struct MonitoringOrchestrator {
    context: Arc<MonitoringContext>,
    started: AtomicBool,
    handles: Mutex<Vec<TaskHandle>>,
    owned: Mutex<Vec<PeriodicTask>>,
}

impl MonitoringOrchestrator {
    pub fn new(context: Arc<MonitoringContext>) -> Self {
        Self {
            context,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            owned: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<MonitoringContext> {
        &self.context
    }

    pub fn is_started(&self) -> bool {
        self.started.load(AtomicOrdering::Acquire)
    }

    /// Handles of every task started by the last [`MonitoringOrchestrator::start`].
    pub fn task_handles(&self) -> Vec<TaskHandle> {
        self.handles.lock().clone()
    }

    fn monitors(&self) -> [(Arc<dyn Monitor>, Duration); 2] {
        let monitoring = &self.context.config.monitoring;
        [
            (
                Arc::clone(&self.context.sampler) as Arc<dyn Monitor>,
                monitoring.sample_interval,
            ),
            (
                Arc::clone(&self.context.media) as Arc<dyn Monitor>,
                monitoring.media_scan_interval,
            ),
        ]
    }

    /// Start all periodic tasks. Returns `false` if already started.
    pub fn start(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            debug!(target: "leakscope::orchestrator", "Monitoring already started");
            return false;
        }

        let monitoring = &self.context.config.monitoring;
        let mut handles = Vec::with_capacity(4);

        for (monitor, period) in self.monitors() {
            handles.push(monitor.start(period));
        }

        let tracker = Arc::clone(&self.context.connections);
        let connection_report = PeriodicTask::spawn(
            "connection-report",
            monitoring.connection_report_interval,
            false,
            move || tracker.log_periodic_report(),
        );

        let sampler = Arc::clone(&self.context.sampler);
        let trend_summary = PeriodicTask::spawn(
            "trend-summary",
            monitoring.trend_summary_interval,
            false,
            move || {
                info!(
                    target: "leakscope::orchestrator",
                    trend = %sampler.trend(),
                    samples = sampler.sample_count(),
                    "Memory trend summary"
                );
            },
        );

        handles.push(connection_report.handle());
        handles.push(trend_summary.handle());
        *self.owned.lock() = vec![connection_report, trend_summary];

        info!(
            target: "leakscope::orchestrator",
            tasks = handles.len(),
            sample_interval = %humantime::format_duration(monitoring.sample_interval),
            "Monitoring started"
        );
        *self.handles.lock() = handles;
        true
    }

    /// Stop everything. Sub-monitor failures are logged and returned, and
    /// every retained task handle is cancelled regardless.
    pub async fn stop(&self) -> Vec<MonitorError> {
        if !self.is_started() {
            debug!(target: "leakscope::orchestrator", "Monitoring not running");
            return Vec::new();
        }

        let mut failures = Vec::new();

        for (monitor, _) in self.monitors() {
            if let Err(e) = monitor.stop().await {
                error!(target: "leakscope::orchestrator", monitor = monitor.name(), error = %e, "Failed to stop monitor");
                failures.push(e);
            }
        }

        let owned: Vec<PeriodicTask> = std::mem::take(&mut *self.owned.lock());
        let shutdowns = owned.into_iter().map(|task| async move {
            let name = task.name();
            (name, task.shutdown().await)
        });
        for (name, result) in join_all(shutdowns).await {
            if let Err(e) = result {
                error!(target: "leakscope::orchestrator", task = name, error = %e, "Failed to stop task");
                failures.push(e);
            }
        }

        let handles: Vec<TaskHandle> = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.cancel();
        }

        self.started.store(false, AtomicOrdering::Release);
        info!(
            target: "leakscope::orchestrator",
            cancelled = handles.len(),
            failures = failures.len(),
            "Monitoring stopped"
        );
        failures
    }
}

impl Debug for MonitoringOrchestrator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringOrchestrator")
            .field("started", &self.is_started())
            .field("tasks", &self.handles.lock().len())
            .finish()
    }
}

// ============================================================================
// SECTION 17: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// LeakScope CLI
#[derive(Parser, Debug)]
#[command(
    name = "leakscope",
    author = "AIOps Team",
    version,
    about = "Memory monitoring and leak diagnostics for long-running session servers",
    long_about = "LeakScope samples process memory, classifies its trend, tracks session \
                  liveness and heap object growth, and can run synthetic leak scenarios \
                  to verify that all of it actually fires."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "leakscope.toml", env = "LEAKSCOPE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "LEAKSCOPE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "LEAKSCOPE_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the monitors until interrupted
    Run,

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

    /// Show version and build info
    Version,

    /// Take one sample and print the memory and health reports
    Report,

    /// Write a heap snapshot
    Snapshot {
        /// Snapshot name prefix
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run synthetic leak scenarios
    LeakTest {
        /// Scenario to run (default: all)
        scenario: Option<String>,
    },
}

// ----------------------------------------------------------------------------
// 17.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> LeakScopeResult<()> {
    println!("Validating configuration file: {}", config_path.display());

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

            let monitoring = &config.monitoring;
            println!("\n📊 Configuration Summary:");
            println!("  • Sample interval: {}", humantime::format_duration(monitoring.sample_interval));
            println!("  • Sample capacity: {}", monitoring.sample_capacity);
            println!("  • Stale after: {}", humantime::format_duration(monitoring.stale_after));
            println!("  • Media directory: {}", monitoring.media_dir.display());
            println!("  • Snapshot directory: {}", config.heap.snapshot_dir.display());
            println!(
                "  • Recalibration window: {}",
                humantime::format_duration(config.baseline.recalibration_window)
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(LeakScopeError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> LeakScopeResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_version() {
    println!("🔍 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Tracking allocator: {}", TrackingAllocator::is_active());
    println!(
        "  • Manual collection: {}",
        host_garbage_collector().map(|gc| gc.name().to_string()).unwrap_or_else(|| "unavailable".into())
    );
}

fn print_json<T: Serialize>(value: &T) -> AnyhowResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_report(context: &MonitoringContext) -> AnyhowResult<()> {
    context.sampler().sample_now();
    print_json(&json!({
        "memory": context.memory_report(),
        "health": context.health_report(),
        "heap": context.heap_stats(),
    }))
}

async fn handle_snapshot(context: &MonitoringContext, name: Option<String>) -> AnyhowResult<()> {
    let snapshot = context
        .create_heap_snapshot(name)
        .await
        .context("Failed to create heap snapshot")?;
    print_json(&snapshot)
}

async fn handle_leak_test(context: &MonitoringContext, scenario: Option<String>) -> AnyhowResult<()> {
    let scenario = scenario.as_deref().map(LeakScenario::from_str).transpose()?;
    context.sampler().sample_now();
    let report = context.run_leak_tests(scenario).await;
    print_json(&report)
}

// ----------------------------------------------------------------------------
// 17.3 Run Loop
// ----------------------------------------------------------------------------

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!(target: "leakscope::engine", "Received SIGTERM"),
        _ = sigint.recv() => info!(target: "leakscope::engine", "Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> io::Result<()> {
    signal::ctrl_c().await?;
    info!(target: "leakscope::engine", "Received Ctrl-C");
    Ok(())
}

async fn run_until_signal(context: Arc<MonitoringContext>) -> AnyhowResult<()> {
    let orchestrator = MonitoringOrchestrator::new(context);
    orchestrator.start();

    let waited = wait_for_shutdown_signal().await;

    let started = Instant::now();
    let failures = orchestrator.stop().await;
    info!(
        target: "leakscope::engine",
        duration_ms = started.elapsed().as_millis() as u64,
        failures = failures.len(),
        "Shutdown complete"
    );

    waited.context("Failed to install signal handlers")
}

// ============================================================================
// SECTION 18: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

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

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        EngineConfig::default()
    } else {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("🔍 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let context = Arc::new(MonitoringContext::new(config));

    match cli.command {
        Some(Commands::Report) => handle_report(&context)?,
        Some(Commands::Snapshot { name }) => handle_snapshot(&context, name).await?,
        Some(Commands::LeakTest { scenario }) => handle_leak_test(&context, scenario).await?,
        Some(Commands::Run) | None => run_until_signal(context).await?,
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 19: TESTS
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;

    /// Probe returning a heap figure the test controls.
    #[derive(Debug, Default)]
    pub struct ScriptedProbe {
        heap: AtomicU64,
        reads: AtomicU64,
        panic_after: Option<u64>,
    }

    impl ScriptedProbe {
        pub fn new(heap: u64) -> Self {
            Self {
                heap: AtomicU64::new(heap),
                ..Default::default()
            }
        }

        /// Panics on every read after the first `reads`.
        pub fn panicking_after(heap: u64, reads: u64) -> Self {
            Self {
                heap: AtomicU64::new(heap),
                reads: AtomicU64::new(0),
                panic_after: Some(reads),
            }
        }

        pub fn set_heap(&self, heap: u64) {
            self.heap.store(heap, AtomicOrdering::SeqCst);
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn read(&self) -> MemoryUsage {
            let reads = self.reads.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if let Some(limit) = self.panic_after {
                if reads > limit {
                    panic!("probe failure");
                }
            }
            let heap = self.heap.load(AtomicOrdering::SeqCst);
            MemoryUsage {
                heap_used: heap,
                heap_total: heap * 2,
                rss: heap * 3,
                external: 0,
            }
        }
    }

    pub fn mb(n: u64) -> u64 {
        n * BYTES_PER_MB
    }

    pub fn at(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    pub fn sample(millis: i64, heap: u64) -> MemorySample {
        MemorySample::new(
            at(millis),
            MemoryUsage {
                heap_used: heap,
                ..Default::default()
            },
        )
    }

    /// Scenario sizes small enough for unit tests; ratios and counts untouched.
    pub fn small_simulator_config() -> LeakSimulatorConfig {
        LeakSimulatorConfig {
            connection_activity_delay: Duration::ZERO,
            timer_period: Duration::from_millis(10),
            timer_allocation_len: 10,
            closure_payload_len: 10,
            primary_buffer_bytes: 1024,
            secondary_buffer_bytes: 512,
            payload_media_bytes: 2048,
            payload_thumbnail_bytes: 100,
            payload_metadata_len: 10,
            settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn test_config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.monitoring.sample_interval = Duration::from_millis(10);
        config.monitoring.media_scan_interval = Duration::from_millis(10);
        config.monitoring.connection_report_interval = Duration::from_millis(10);
        config.monitoring.trend_summary_interval = Duration::from_millis(10);
        config.monitoring.media_dir = root.join("media");
        config.heap.snapshot_dir = root.join("snapshots");
        config.simulator = small_simulator_config();
        config
    }

    pub fn test_context(config: EngineConfig, probe: Arc<dyn MemoryProbe>, clock: Arc<ManualClock>) -> MonitoringContext {
        MonitoringContext::with_parts(config, clock, probe, Arc::new(ObjectCensus::new()), None)
    }
}

// ----------------------------------------------------------------------------
// 19.1 Core Types, Config & Errors
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 19.2 Probes, Census & Tasks
// ----------------------------------------------------------------------------

#[cfg(test)]
mod probe_tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_census_guard_releases_on_drop() {
        let census = Arc::new(ObjectCensus::new());
        let a = census.track("Widget");
        let b = census.track("Widget");
        let buf = census.track_bytes(BUFFER_TYPE, 4096);
        let timer = census.track_protected(TIMER_TYPE);

        assert_eq!(census.count("Widget"), 2);
        assert_eq!(census.tracked_bytes(), 4096);
        assert_eq!(census.protected_count(TIMER_TYPE), 1);

        drop(a);
        drop(buf);
        assert_eq!(census.count("Widget"), 1);
        assert_eq!(census.tracked_bytes(), 0);

        drop(b);
        drop(timer);
        assert!(census.type_counts().is_empty());
        assert!(census.protected_type_counts().is_empty());
    }

    #[test]
    fn test_census_heap_stats() {
        let census = Arc::new(ObjectCensus::new());
        let probe: Arc<dyn MemoryProbe> = Arc::new(ScriptedProbe::new(mb(64)));
        let _guards: Vec<CensusGuard> = (0..3).map(|_| census.track(CLOSURE_TYPE)).collect();
        let _timer = census.track_protected(TIMER_TYPE);

        let stats = CensusHeapStats::new(Arc::clone(&census), probe).capture();
        assert_eq!(stats.heap_size, mb(64));
        assert_eq!(stats.heap_capacity, mb(128));
        assert_eq!(stats.object_count, 3);
        assert_eq!(stats.protected_object_count, 1);
        assert_eq!(stats.object_type_counts.get(CLOSURE_TYPE), Some(&3));
    }

    #[test]
    fn test_process_probe_reads_something() {
        let census = Arc::new(ObjectCensus::new());
        let _buf = census.track_bytes(BUFFER_TYPE, 1234);
        let probe = ProcessMemoryProbe::new().with_census(Arc::clone(&census));
        let usage = probe.read();
        assert_eq!(usage.external, 1234);
        assert!(usage.heap_total >= usage.heap_used);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), true, move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(ticks.load(AtomicOrdering::SeqCst), 3);

        let handle = task.handle();
        task.shutdown().await.unwrap();
        assert!(handle.is_cancelled());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_periodic_task_reports_panic() {
        let task = PeriodicTask::spawn("doomed", Duration::from_millis(10), true, || panic!("boom"));
        sleep(Duration::from_millis(50)).await;
        assert!(task.is_finished());

        let err = task.shutdown().await.unwrap_err();
        assert!(matches!(err, MonitorError::TaskPanicked { ref task } if task == "doomed"));
    }
}

// ----------------------------------------------------------------------------
// 19.3 Sampling, Baseline, Connections, Requests & Media
// ----------------------------------------------------------------------------

#[cfg(test)]
mod monitor_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn sampler_with(probe: Arc<ScriptedProbe>, capacity: usize) -> (Arc<MemorySampler>, Arc<BaselineManager>) {
        let baseline = Arc::new(BaselineManager::new(&BaselineConfig::default()));
        let sampler = Arc::new(MemorySampler::new(
            probe,
            Arc::new(ManualClock::new(at(0))),
            Arc::clone(&baseline),
            capacity,
        ));
        (sampler, baseline)
    }

    #[test]
    fn test_trend_requires_ten_samples() {
        let values: Vec<u64> = (1..=9).map(|i| mb(i * 10)).collect();
        assert_eq!(TrendAnalyzer::classify(&values), Trend::InsufficientData);
    }

    #[test]
    fn test_trend_classification() {
        let increasing: Vec<u64> = (1..=10).map(|i| mb(i * 10)).collect();
        assert_eq!(TrendAnalyzer::classify(&increasing), Trend::Increasing);

        let decreasing: Vec<u64> = increasing.iter().rev().copied().collect();
        assert_eq!(TrendAnalyzer::classify(&decreasing), Trend::Decreasing);

        let flat = vec![mb(100); 10];
        assert_eq!(TrendAnalyzer::classify(&flat), Trend::Stable);

        // +5% stays inside the stable band
        let mut slight = vec![mb(100); 5];
        slight.extend(vec![mb(105); 5]);
        assert_eq!(TrendAnalyzer::classify(&slight), Trend::Stable);
    }

    #[test]
    fn test_trend_zero_older_mean_is_insufficient() {
        let mut values = vec![0; 5];
        values.extend(vec![mb(10); 5]);
        assert_eq!(TrendAnalyzer::classify(&values), Trend::InsufficientData);
    }

    #[test]
    fn test_trend_uses_only_last_ten() {
        let mut values: Vec<u64> = (1..=10).map(|i| mb(i * 10)).collect();
        values.extend(vec![mb(500); 10]);
        assert_eq!(TrendAnalyzer::classify(&values), Trend::Stable);
    }

    #[test]
    fn test_continuous_growth() {
        assert_eq!(TrendAnalyzer::continuous_growth(&[1, 2, 2, 3, 4]), Some(3));
        assert_eq!(TrendAnalyzer::continuous_growth(&[9, 1, 2, 2, 3, 4]), Some(3));
        assert_eq!(TrendAnalyzer::continuous_growth(&[1, 3, 2, 4, 5]), None);
        assert_eq!(TrendAnalyzer::continuous_growth(&[1, 2, 3]), None);
    }

    #[test]
    fn test_baseline_initialize_once() {
        let manager = BaselineManager::new(&BaselineConfig::default());
        assert!(manager.get().is_none());
        assert!(manager.initialize_if_absent(sample(0, 100)));
        assert!(!manager.initialize_if_absent(sample(10, 200)));
        assert_eq!(manager.get().unwrap().sample.heap_used(), 100);

        manager.initialize(sample(20, 300));
        assert_eq!(manager.get().unwrap().last_update, at(20));
    }

    #[test]
    fn test_recalibration_rules() {
        let manager = BaselineManager::new(&BaselineConfig::default());
        let hour_ms = 3_600_000;

        assert_eq!(
            manager.maybe_recalibrate(sample(0, mb(100)), &[mb(100)], at(0)),
            RecalibrationOutcome::Initialized
        );

        let stable = vec![mb(100); 5];
        assert!(matches!(
            manager.maybe_recalibrate(sample(hour_ms, mb(120)), &stable, at(hour_ms)),
            RecalibrationOutcome::WindowNotElapsed { elapsed_ms } if elapsed_ms == hour_ms as u64
        ));

        let later = hour_ms + 1;
        assert_eq!(
            manager.maybe_recalibrate(sample(later, mb(120)), &stable[..4], at(later)),
            RecalibrationOutcome::InsufficientData { available: 4, required: 5 }
        );

        let rising = vec![mb(100), mb(100), mb(100), mb(200), mb(200), mb(200)];
        assert_eq!(
            manager.maybe_recalibrate(sample(later, mb(200)), &rising, at(later)),
            RecalibrationOutcome::TrendBlocked { trend: Trend::Increasing }
        );
        assert_eq!(manager.get().unwrap().sample.heap_used(), mb(100));

        let outcome = manager.maybe_recalibrate(sample(later, mb(120)), &stable, at(later));
        assert_eq!(
            outcome,
            RecalibrationOutcome::Recalibrated {
                previous_heap: mb(100),
                new_heap: mb(120)
            }
        );
        assert!(outcome.updated());
        let baseline = manager.get().unwrap();
        assert_eq!(baseline.last_update, at(later));
        assert_eq!(baseline.sample.heap_used(), mb(120));
    }

    #[test]
    fn test_sampler_records_and_classifies() {
        let probe = Arc::new(ScriptedProbe::new(mb(10)));
        let (sampler, _) = sampler_with(Arc::clone(&probe), 12);

        for i in 1..=9 {
            probe.set_heap(mb(i * 10));
            sampler.sample_now();
        }
        assert_eq!(sampler.trend(), Trend::InsufficientData);

        probe.set_heap(mb(100));
        sampler.sample_now();
        assert_eq!(sampler.trend(), Trend::Increasing);

        for _ in 0..5 {
            sampler.sample_now();
        }
        assert_eq!(sampler.sample_count(), 12);
        assert_eq!(sampler.capacity(), 12);

        let report = sampler.report();
        assert_eq!(report.measurements.len(), REPORT_MEASUREMENT_COUNT);
        assert_eq!(report.current.heap_used, mb(100));
        assert!(report.baseline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_start_is_idempotent_and_stoppable() {
        let probe = Arc::new(ScriptedProbe::new(mb(50)));
        let (sampler, baseline) = sampler_with(probe, 100);

        let first = Arc::clone(&sampler).start(Duration::from_secs(30));
        let second = Arc::clone(&sampler).start(Duration::from_secs(30));
        assert!(sampler.is_running());
        assert_eq!(baseline.get().unwrap().sample.heap_used(), mb(50));

        sleep(Duration::from_secs(95)).await;
        assert_eq!(sampler.sample_count(), 3);

        sampler.stop().await.unwrap();
        assert!(!sampler.is_running());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        sampler.stop().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(sampler.sample_count(), 3);
    }

    #[test]
    fn test_connection_staleness_boundaries() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let tracker = ConnectionTracker::new(clock.clone(), DEFAULT_STALE_AFTER);

        tracker.track("s1");
        clock.set(at(1000));
        tracker.touch("s1");

        clock.set(at(290_000));
        let report = tracker.report();
        assert_eq!(report.total_connections, 1);
        assert_eq!(report.stale_connections, 0);
        assert_eq!(
            report.connections[0],
            ConnectionStatus {
                session_id: "s1".into(),
                lifetime_ms: 290_000,
                last_activity_ms: 289_000,
                is_stale: false,
                event_listener_count: None,
            }
        );

        clock.set(at(310_000));
        let report = tracker.report();
        assert_eq!(report.stale_connections, 1);
        assert!(report.connections[0].is_stale);
        assert_eq!(report.connections[0].last_activity_ms, 309_000);
    }

    #[test]
    fn test_connection_tracker_edge_cases() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let census = Arc::new(ObjectCensus::new());
        let tracker = ConnectionTracker::new(clock.clone(), DEFAULT_STALE_AFTER).with_census(Arc::clone(&census));

        tracker.touch("ghost");
        assert!(tracker.is_empty());
        assert_eq!(tracker.remove("ghost"), None);
        assert!(!tracker.set_listener_count("ghost", 3));

        tracker.track("a");
        tracker.track("b");
        assert!(tracker.set_listener_count("a", 4));
        assert_eq!(census.count(SESSION_TYPE), 2);

        clock.advance(Duration::from_secs(10));
        tracker.track("a");
        assert_eq!(tracker.len(), 2);
        assert_eq!(census.count(SESSION_TYPE), 2);
        assert_eq!(tracker.report().connections[0].lifetime_ms, 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(tracker.remove("b"), Some(Duration::from_secs(15)));
        assert!(!tracker.contains("b"));
        assert_eq!(census.count(SESSION_TYPE), 1);
    }

    proptest! {
        #[test]
        fn connection_total_matches_tracked_minus_removed(
            ops in proptest::collection::vec((0u8..3, 0u8..6), 0..64),
        ) {
            let clock = Arc::new(ManualClock::new(at(0)));
            let tracker = ConnectionTracker::new(clock.clone(), DEFAULT_STALE_AFTER);
            let mut model = std::collections::HashSet::new();

            for (op, id) in ops {
                let id = format!("s{id}");
                clock.advance(Duration::from_millis(7));
                match op {
                    0 => { tracker.track(id.as_str()); model.insert(id); }
                    1 => tracker.touch(&id),
                    _ => { tracker.remove(&id); model.remove(&id); }
                }
            }
            prop_assert_eq!(tracker.report().total_connections, model.len());
        }
    }

    fn request_metrics(probe: Arc<ScriptedProbe>, clock: Arc<ManualClock>) -> (Arc<RequestMetrics>, Arc<BaselineManager>) {
        let baseline = Arc::new(BaselineManager::new(&BaselineConfig::default()));
        let metrics = RequestMetrics::new(
            probe,
            clock,
            Arc::clone(&baseline),
            RequestConfig::default(),
            DEFAULT_REQUEST_WINDOW_CAPACITY,
        );
        (Arc::new(metrics), baseline)
    }

    #[test]
    fn test_request_guard_counts() {
        let probe = Arc::new(ScriptedProbe::new(mb(40)));
        let (metrics, baseline) = request_metrics(Arc::clone(&probe), Arc::new(ManualClock::new(at(0))));

        let first = metrics.begin();
        let second = metrics.begin();
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.active_requests(), 2);
        assert!(baseline.is_set());

        probe.set_heap(mb(55));
        let outcome = first.end();
        assert_eq!(outcome.memory_delta, signed_delta(mb(55), mb(40)));
        assert_eq!(metrics.active_requests(), 1);

        drop(second);
        assert_eq!(metrics.active_requests(), 0);
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.recent_measurements().len(), 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_increase, signed_delta(mb(55), mb(40)));
        assert_eq!(snapshot.memory_baseline.unwrap().heap_used, mb(40));
    }

    #[test]
    fn test_request_thresholds() {
        let probe = Arc::new(ScriptedProbe::new(mb(100)));
        let (metrics, _) = request_metrics(Arc::clone(&probe), Arc::new(ManualClock::new(at(0))));

        let first = metrics.begin();
        assert_eq!(first.baseline_deviation(), None);
        probe.set_heap(mb(109));
        let small = first.end();
        assert!(!small.exceeded_increase_threshold);

        probe.set_heap(mb(150));
        assert_eq!(metrics.begin().baseline_deviation(), None);

        probe.set_heap(mb(151));
        let high = metrics.begin();
        assert_eq!(high.baseline_deviation(), Some(signed_delta(mb(151), mb(100))));

        probe.set_heap(mb(40));
        let low = metrics.begin();
        assert_eq!(low.baseline_deviation(), Some(signed_delta(mb(40), mb(100))));
        drop(low);

        probe.set_heap(mb(162));
        let grown = high.end();
        assert!(grown.exceeded_increase_threshold);
        assert_eq!(grown.memory_delta, signed_delta(mb(162), mb(151)));
    }

    #[test]
    fn test_request_tracks_pending_futures() {
        let census = Arc::new(ObjectCensus::new());
        let baseline = Arc::new(BaselineManager::new(&BaselineConfig::default()));
        let metrics = Arc::new(
            RequestMetrics::new(
                Arc::new(ScriptedProbe::new(mb(1))),
                Arc::new(ManualClock::new(at(0))),
                baseline,
                RequestConfig::default(),
                10,
            )
            .with_census(Arc::clone(&census)),
        );

        let guard = metrics.begin();
        assert_eq!(census.count(PENDING_FUTURE_TYPE), 1);
        guard.end();
        assert_eq!(census.count(PENDING_FUTURE_TYPE), 0);
    }

    #[test]
    fn test_requests_recalibrate_after_window() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let (metrics, baseline) = request_metrics(Arc::new(ScriptedProbe::new(mb(80))), clock.clone());

        drop(metrics.begin());
        assert_eq!(baseline.get().unwrap().last_update, at(0));

        clock.advance(Duration::from_secs(2 * 3600));
        for _ in 0..3 {
            drop(metrics.begin());
        }
        assert_eq!(baseline.get().unwrap().last_update, at(0));

        drop(metrics.begin());
        assert_eq!(baseline.get().unwrap().last_update, at(2 * 3_600_000));
    }

    #[test_case(Trend::Increasing, 0, HealthStatus::Warning ; "rising memory")]
    #[test_case(Trend::Stable, 0, HealthStatus::Ok ; "quiet")]
    #[test_case(Trend::Stable, 1, HealthStatus::Warning ; "stale session")]
    #[test_case(Trend::InsufficientData, 0, HealthStatus::Ok ; "warming up")]
    #[test_case(Trend::Decreasing, 3, HealthStatus::Warning ; "falling memory with stale sessions")]
    fn test_health_status(trend: Trend, stale: usize, expected: HealthStatus) {
        assert_eq!(HealthStatus::from_signals(trend, stale), expected);
    }

    fn age_file(path: &Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_media_scan_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("b.mp4"), vec![0u8; 20]).unwrap();
        fs::write(dir.path().join(MEDIA_PLACEHOLDER_FILE), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        age_file(&dir.path().join("b.mp4"), Duration::from_secs(48 * 3600));

        let monitor = MediaDirectoryMonitor::new(dir.path(), DEFAULT_MEDIA_MAX_AGE);
        let report = monitor.scan().await.unwrap();

        assert_eq!(report.file_count, 2);
        assert_eq!(report.total_bytes, 30);
        assert_eq!(report.old_files, 1);
        assert_eq!(monitor.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_media_scan_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = MediaDirectoryMonitor::new(dir.path().join("absent"), DEFAULT_MEDIA_MAX_AGE);
        let err = monitor.scan().await.unwrap_err();
        assert!(matches!(err, MonitorError::ScanFailed { .. }));
        assert!(monitor.last_report().is_none());
    }

    #[tokio::test]
    async fn test_media_monitor_scans_immediately_and_survives_errors() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");
        let monitor = Arc::new(MediaDirectoryMonitor::new(&media_dir, DEFAULT_MEDIA_MAX_AGE));

        Arc::clone(&monitor).start(Duration::from_millis(20));
        sleep(Duration::from_millis(50)).await;
        assert!(monitor.last_report().is_none());

        fs::create_dir(&media_dir).unwrap();
        fs::write(media_dir.join("clip.webm"), vec![1u8; 8]).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.last_report().map(|r| r.file_count), Some(1));

        monitor.stop().await.unwrap();
        assert!(!monitor.is_running());
    }
}

// ----------------------------------------------------------------------------
// 19.4 Heap Analysis
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 19.5 Leak Simulator
// ----------------------------------------------------------------------------

#[cfg(test)]
mod simulator_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct CountingCollector {
        calls: AtomicU64,
    }

    impl GarbageCollector for CountingCollector {
        fn name(&self) -> &str {
            "counting"
        }

        fn collect(&self) -> bool {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            true
        }
    }

    fn simulator(config: LeakSimulatorConfig) -> (Arc<ConnectionTracker>, Arc<ObjectCensus>, LeakSimulator) {
        let probe: Arc<dyn MemoryProbe> = Arc::new(ScriptedProbe::new(mb(100)));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(0)));
        let census = Arc::new(ObjectCensus::new());
        let baseline = Arc::new(BaselineManager::new(&BaselineConfig::default()));
        let tracker = Arc::new(ConnectionTracker::new(Arc::clone(&clock), DEFAULT_STALE_AFTER));
        let sampler = Arc::new(MemorySampler::new(Arc::clone(&probe), clock, baseline, 100));
        let simulator =
            LeakSimulator::new(Arc::clone(&tracker), sampler, probe, config).with_census(Arc::clone(&census));
        (tracker, census, simulator)
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!("timers".parse::<LeakScenario>().unwrap(), LeakScenario::TimerAccumulation);
        assert_eq!("webhooks".parse::<LeakScenario>().unwrap(), LeakScenario::PayloadRetention);
        assert_eq!(
            " Connection-Churn ".parse::<LeakScenario>().unwrap(),
            LeakScenario::ConnectionChurn
        );
        assert_eq!(LeakScenario::BufferAccumulation.to_string(), "buffer-accumulation");

        let err = "gremlins".parse::<LeakScenario>().unwrap_err();
        assert!(err.to_string().contains("closure-retention"));
    }

    #[tokio::test]
    async fn test_run_all_reports_retained_state_then_releases_it() {
        let (tracker, census, simulator) = simulator(small_simulator_config());
        let report = simulator.run_all().await;

        assert_eq!(report.summary.passed, 5);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.results.len(), 5);
        let order: Vec<LeakScenario> = report.results.iter().map(|o| o.scenario).collect();
        assert_eq!(order, LeakScenario::ALL.to_vec());

        let detail = |scenario| report.outcome(scenario).and_then(|o| o.result).map(|r| r.detail);
        assert_eq!(
            detail(LeakScenario::ConnectionChurn),
            Some(ScenarioDetail::Connections {
                remaining: 33,
                total_connections: 33,
                stale_connections: 0
            })
        );
        assert_eq!(detail(LeakScenario::TimerAccumulation), Some(ScenarioDetail::Timers { active: 15 }));
        assert_eq!(detail(LeakScenario::ClosureRetention), Some(ScenarioDetail::Closures { retained: 24 }));
        assert_eq!(
            detail(LeakScenario::BufferAccumulation),
            Some(ScenarioDetail::Buffers {
                retained: 34,
                retained_bytes: 17 * 1536
            })
        );
        assert_eq!(detail(LeakScenario::PayloadRetention), Some(ScenarioDetail::Payloads { queued: 12 }));

        assert_eq!(tracker.len(), 33);
        assert_eq!(census.count(CLOSURE_TYPE), 0);
        assert_eq!(census.count(BUFFER_TYPE), 0);
        assert_eq!(census.count(OBJECT_TYPE), 0);
        assert_eq!(simulator.retained_artifact_count(), 0);

        assert_eq!(simulator.active_timer_count(), 0);
        assert_eq!(simulator.cleanup_count(), 5);
        assert_eq!(report.summary.total_memory_increase, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["result"]["detail"]["totalConnections"], 33);
        assert_eq!(json["results"][3]["result"]["detail"]["kind"], "buffers");
        assert_eq!(json["results"][3]["result"]["detail"]["retainedBytes"], 17 * 1536);
        assert_eq!(json["summary"]["memoryTrend"], "insufficient_data");
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_run_and_timers_are_cleared() {
        let config = LeakSimulatorConfig {
            max_retained_bytes: 1000,
            ..small_simulator_config()
        };
        let (_tracker, _census, simulator) = simulator(config);
        let report = simulator.run_all().await;

        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 4);
        assert_eq!(report.results.len(), 5);

        let timers = report.outcome(LeakScenario::TimerAccumulation).unwrap();
        assert_eq!(timers.status, ScenarioStatus::Failed);
        assert!(timers.error.as_deref().unwrap().contains("retention budget"));

        assert_eq!(simulator.active_timer_count(), 0);
        assert_eq!(simulator.cleanup_count(), 5);
    }

    #[tokio::test]
    async fn test_single_scenario_runs_cleanup_and_collection() {
        let collector = Arc::new(CountingCollector::default());
        let (_tracker, _census, simulator) = simulator(small_simulator_config());
        let simulator = simulator.with_collector(Some(collector.clone() as Arc<dyn GarbageCollector>));

        let result = simulator.run_scenario(LeakScenario::TimerAccumulation).await.unwrap();
        assert_eq!(result.detail, ScenarioDetail::Timers { active: 15 });
        assert_eq!(simulator.active_timer_count(), 0);
        assert_eq!(collector.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(simulator.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_simulator_releases_sessions() {
        let (tracker, census, simulator) = simulator(small_simulator_config());
        simulator.run_scenario(LeakScenario::ConnectionChurn).await.unwrap();
        simulator.run_scenario(LeakScenario::BufferAccumulation).await.unwrap();
        assert_eq!(tracker.len(), 33);
        assert_eq!(census.count(BUFFER_TYPE), 0);

        drop(simulator);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_runs_are_reproducible() {
        let config = LeakSimulatorConfig {
            max_retained_bytes: 60_000,
            ..small_simulator_config()
        };
        let (_tracker, census, simulator) = simulator(config);

        let mut details = Vec::new();
        for _ in 0..4 {
            let result = simulator.run_scenario(LeakScenario::BufferAccumulation).await.unwrap();
            details.push(result.detail);
            assert_eq!(census.count(BUFFER_TYPE), 0);
        }
        let expected = ScenarioDetail::Buffers {
            retained: 34,
            retained_bytes: 17 * 1536,
        };
        assert!(details.iter().all(|d| *d == expected), "{details:?}");

        for _ in 0..3 {
            let report = simulator.run(&[LeakScenario::ClosureRetention, LeakScenario::PayloadRetention]).await;
            assert_eq!(report.summary.failed, 0);
            assert_eq!(
                report.outcome(LeakScenario::ClosureRetention).and_then(|o| o.result).map(|r| r.detail),
                Some(ScenarioDetail::Closures { retained: 24 })
            );
            assert_eq!(simulator.retained_artifact_count(), 0);
        }
    }
}

// ----------------------------------------------------------------------------
// 19.6 Context & Orchestrator
// ----------------------------------------------------------------------------

#[cfg(test)]
mod orchestrator_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    const START_MS: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let context = Arc::new(test_context(test_config(dir.path()), Arc::new(ScriptedProbe::new(mb(10))), clock));
        let orchestrator = MonitoringOrchestrator::new(Arc::clone(&context));

        assert!(orchestrator.stop().await.is_empty());

        assert!(orchestrator.start());
        assert!(!orchestrator.start());
        assert!(orchestrator.is_started());

        let handles = orchestrator.task_handles();
        let names: Vec<&str> = handles.iter().map(TaskHandle::name).collect();
        assert_eq!(names, vec!["memory-sampler", "media-directory", "connection-report", "trend-summary"]);

        sleep(Duration::from_millis(50)).await;
        assert!(context.sampler().sample_count() > 0);

        assert!(orchestrator.stop().await.is_empty());
        assert!(!orchestrator.is_started());
        assert!(handles.iter().all(TaskHandle::is_cancelled));
        assert!(orchestrator.task_handles().is_empty());
        assert!(orchestrator.stop().await.is_empty());

        assert!(orchestrator.start());
        assert_eq!(orchestrator.task_handles().len(), 4);
        assert!(orchestrator.stop().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_everything_when_a_monitor_fails() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let probe = Arc::new(ScriptedProbe::panicking_after(mb(10), 1));
        let context = Arc::new(test_context(test_config(dir.path()), probe, clock));
        let orchestrator = MonitoringOrchestrator::new(context);

        assert!(orchestrator.start());
        let handles = orchestrator.task_handles();
        sleep(Duration::from_millis(100)).await;

        let failures = orchestrator.stop().await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], MonitorError::TaskPanicked { task } if task == "memory-sampler"));
        assert!(handles.iter().all(TaskHandle::is_cancelled));
        assert!(!orchestrator.is_started());
    }

    #[test]
    fn test_health_report_follows_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let context = test_context(test_config(dir.path()), Arc::new(ScriptedProbe::new(mb(100))), clock.clone());

        context.session_connected("s1");
        let health = context.health_report();
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.memory.current, "100 MB");
        assert_eq!(health.memory.trend, Trend::InsufficientData);
        assert_eq!(health.connections.active, 1);

        clock.advance(Duration::from_secs(310));
        let health = context.health_report();
        assert_eq!(health.status, HealthStatus::Warning);
        assert_eq!(health.connections.stale, 1);

        context.session_activity("s1");
        assert_eq!(context.health_report().status, HealthStatus::Ok);

        context.session_disconnected("s1");
        let health = context.health_report();
        assert_eq!(health.connections.active, 0);
        assert_eq!(serde_json::to_value(&health).unwrap()["status"], "ok");
    }

    #[test]
    fn test_memory_report_shape() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let probe = Arc::new(ScriptedProbe::new(mb(64)));
        let context = test_context(test_config(dir.path()), probe.clone(), clock);

        let request = context.begin_request();
        probe.set_heap(mb(70));
        context.sampler().sample_now();

        let report = serde_json::to_value(context.memory_report()).unwrap();
        assert_eq!(report["timestamp"], "2023-11-14T22:13:20.000Z");
        assert_eq!(report["resources"]["requestCount"], 1);
        assert_eq!(report["resources"]["activeRequests"], 1);
        assert_eq!(report["resources"]["memoryIncrease"], mb(6));
        assert_eq!(report["memory"]["trend"], "insufficient_data");
        assert_eq!(report["memory"]["measurements"].as_array().unwrap().len(), 1);
        assert_eq!(report["connections"]["totalConnections"], 0);

        request.end();
        assert_eq!(context.health_report().requests.active, 0);
        assert_eq!(context.health_report().memory.increase, "6 MB");
    }

    #[tokio::test]
    async fn test_heap_operations_through_context() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let context = test_context(test_config(dir.path()), Arc::new(ScriptedProbe::new(mb(8))), clock);

        assert!(context.compare_heap_with_baseline().is_none());
        context.set_heap_baseline();
        assert_eq!(context.compare_heap_with_baseline().unwrap().heap_size_increase, 0);

        let stats = context.heap_stats();
        assert!(stats.leak_patterns.is_clean());
        assert_eq!(stats.memory_usage.heap_used_mb, 8);

        let snapshot = context.create_heap_snapshot(Some("ctx".into())).await.unwrap();
        assert_eq!(snapshot.filename, "ctx-1.heapsnapshot");
        assert!(dir.path().join("snapshots").join("ctx-1.heapsnapshot").exists());
    }

    #[tokio::test]
    async fn test_run_single_leak_test_through_context() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(START_MS)));
        let context = test_context(test_config(dir.path()), Arc::new(ScriptedProbe::new(mb(8))), clock);

        let report = context.run_leak_tests(Some(LeakScenario::ClosureRetention)).await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(context.census().count(CLOSURE_TYPE), 0);
        assert_eq!(context.simulator().cleanup_count(), 1);

        let again = context.run_leak_tests(Some(LeakScenario::ClosureRetention)).await;
        assert_eq!(
            again.results[0].result.map(|r| r.detail),
            Some(ScenarioDetail::Closures { retained: 24 })
        );
    }
}
