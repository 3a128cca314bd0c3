//! Coordinator configuration: rate windows, throttle and adaptive policy, queue bounds, circuit
//! schedule, refresh gate, and history retention.
//!
//! Every struct deserializes with `#[serde(default)]`, so partial documents only override what
//! they name. Durations are written as whole milliseconds.

// self
use crate::{_prelude::*, error::ConfigError};

/// Highest priority accepted by the coordinator; `0` is the lowest.
pub const MAX_PRIORITY: u8 = 10;

/// Aggregated coordinator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
	/// Overlapping rate windows evaluated on every admission.
	pub windows: Vec<WindowConfig>,
	/// Admission thresholds.
	pub throttle: ThrottleConfig,
	/// Capacity-factor policy.
	pub adaptive: AdaptiveConfig,
	/// Queue bounds.
	pub queue: QueueConfig,
	/// Circuit breaker schedule.
	pub circuit: CircuitConfig,
	/// Credential refresh gate.
	pub refresh: RefreshConfig,
	/// Request history retention.
	pub history: HistoryConfig,
}
impl CoordinatorConfig {
	/// Parses a JSON document, reporting the failing field path on error.
	pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
		let mut de = serde_json::Deserializer::from_str(json);
		let config: Self = serde_path_to_error::deserialize(&mut de).map_err(|err| {
			let path = err.path().to_string();

			ConfigError::Parse { path, source: err.into_inner() }
		})?;

		config.validate()?;

		Ok(config)
	}

	/// Replaces the window set.
	pub fn with_windows(mut self, windows: impl IntoIterator<Item = WindowConfig>) -> Self {
		self.windows = windows.into_iter().collect();

		self
	}

	/// Overrides the throttle section.
	pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
		self.throttle = throttle;

		self
	}

	/// Overrides the adaptive section.
	pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
		self.adaptive = adaptive;

		self
	}

	/// Overrides the queue section.
	pub fn with_queue(mut self, queue: QueueConfig) -> Self {
		self.queue = queue;

		self
	}

	/// Overrides the circuit section.
	pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
		self.circuit = circuit;

		self
	}

	/// Overrides the refresh section.
	pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
		self.refresh = refresh;

		self
	}

	/// Overrides the history section.
	pub fn with_history(mut self, history: HistoryConfig) -> Self {
		self.history = history;

		self
	}

	/// Longest configured window, used as the history retention horizon.
	pub fn longest_window(&self) -> Duration {
		self.windows.iter().map(|w| w.size).max().unwrap_or(Duration::ZERO)
	}

	/// Checks every section for values the coordinator cannot honor.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.windows.is_empty() {
			return Err(ConfigError::NoWindows);
		}

		for (idx, window) in self.windows.iter().enumerate() {
			if !window.size.is_positive() || window.max_requests == 0 {
				return Err(ConfigError::EmptyWindow { name: window.name.clone() });
			}
			if self.windows[..idx].iter().any(|other| other.name == window.name) {
				return Err(ConfigError::DuplicateWindow { name: window.name.clone() });
			}
		}

		self.throttle.validate()?;
		self.adaptive.validate()?;
		self.queue.validate()?;
		self.circuit.validate()?;
		self.refresh.validate()?;

		if self.history.max_records == 0 {
			return Err(ConfigError::ZeroCount { field: "history.max_records" });
		}

		Ok(())
	}
}
impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			windows: vec![
				WindowConfig::new("burst", Duration::seconds(10), 20),
				WindowConfig::new("primary", Duration::seconds(60), 100),
				WindowConfig::new("pattern", Duration::seconds(300), 400),
				WindowConfig::new("history", Duration::seconds(900), 1_000),
			],
			throttle: Default::default(),
			adaptive: Default::default(),
			queue: Default::default(),
			circuit: Default::default(),
			refresh: Default::default(),
			history: Default::default(),
		}
	}
}

/// One trailing rate window: at most `max_requests` attempts per `size`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
	/// Stable label used in decisions, status, and metrics.
	pub name: String,
	/// Window length.
	#[serde(with = "duration_ms")]
	pub size: Duration,
	/// Attempts permitted per window at capacity factor 1.0.
	pub max_requests: u32,
}
impl WindowConfig {
	/// Creates a window definition.
	pub fn new(name: impl Into<String>, size: Duration, max_requests: u32) -> Self {
		Self { name: name.into(), size, max_requests }
	}
}

/// Admission thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
	/// Utilization at or above which admissions are denied.
	pub safety_margin: f64,
	/// Multiplier on the safety margin for high-priority callers (capped at 1.0 overall).
	pub burst_allowance: f64,
	/// Lowest priority that benefits from the burst allowance.
	pub burst_priority: u8,
}
impl ThrottleConfig {
	/// Overrides the safety margin.
	pub fn with_safety_margin(mut self, margin: f64) -> Self {
		self.safety_margin = margin;

		self
	}

	/// Overrides the burst allowance ratio.
	pub fn with_burst_allowance(mut self, ratio: f64) -> Self {
		self.burst_allowance = ratio;

		self
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if !(self.safety_margin > 0. && self.safety_margin <= 1.) {
			return Err(ConfigError::OutOfRange {
				field: "throttle.safety_margin",
				value: self.safety_margin,
				range: "(0, 1]",
			});
		}
		if self.burst_allowance.is_nan() || self.burst_allowance < 1. {
			return Err(ConfigError::OutOfRange {
				field: "throttle.burst_allowance",
				value: self.burst_allowance,
				range: "[1, inf)",
			});
		}
		if self.burst_priority > MAX_PRIORITY {
			return Err(ConfigError::InvalidPriority {
				priority: self.burst_priority,
				max: MAX_PRIORITY,
			});
		}

		Ok(())
	}
}
impl Default for ThrottleConfig {
	fn default() -> Self {
		Self { safety_margin: 0.95, burst_allowance: 1., burst_priority: 8 }
	}
}

/// Capacity-factor bounds and step sizes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
	/// Lower bound of the capacity factor.
	pub min_factor: f64,
	/// Upper bound of the capacity factor.
	pub max_factor: f64,
	/// Starting capacity factor.
	pub initial_factor: f64,
	/// Multiplier applied on a downstream rate-limit signal.
	pub decrease: f64,
	/// Multiplier applied on a downstream success.
	pub growth: f64,
}
impl AdaptiveConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		if !(self.min_factor > 0. && self.min_factor <= self.max_factor) {
			return Err(ConfigError::OutOfRange {
				field: "adaptive.min_factor",
				value: self.min_factor,
				range: "(0, max_factor]",
			});
		}
		if !(self.min_factor..=self.max_factor).contains(&self.initial_factor) {
			return Err(ConfigError::OutOfRange {
				field: "adaptive.initial_factor",
				value: self.initial_factor,
				range: "[min_factor, max_factor]",
			});
		}
		if !(self.decrease > 0. && self.decrease < 1.) {
			return Err(ConfigError::OutOfRange {
				field: "adaptive.decrease",
				value: self.decrease,
				range: "(0, 1)",
			});
		}
		if self.growth.is_nan() || self.growth < 1. {
			return Err(ConfigError::OutOfRange {
				field: "adaptive.growth",
				value: self.growth,
				range: "[1, inf)",
			});
		}

		Ok(())
	}
}
impl Default for AdaptiveConfig {
	fn default() -> Self {
		Self { min_factor: 0.3, max_factor: 1.2, initial_factor: 1., decrease: 0.7, growth: 1.02 }
	}
}

/// Queue bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	/// Longest a call may wait in the queue.
	#[serde(with = "duration_ms")]
	pub max_wait: Duration,
	/// Admission attempts allowed before a queued call times out.
	pub max_retries: u32,
	/// Maximum number of queued calls.
	pub capacity: usize,
	/// Upper bound between drain passes while calls are queued.
	#[serde(with = "duration_ms")]
	pub drain_tick: Duration,
}
impl QueueConfig {
	/// Overrides the max wait.
	pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
		self.max_wait = max_wait;

		self
	}

	/// Overrides the retry budget.
	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;

		self
	}

	/// Overrides the queue capacity.
	pub fn with_capacity(mut self, capacity: usize) -> Self {
		self.capacity = capacity;

		self
	}

	/// Overrides the drain tick.
	pub fn with_drain_tick(mut self, tick: Duration) -> Self {
		self.drain_tick = tick;

		self
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if !self.max_wait.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "queue.max_wait" });
		}
		if !self.drain_tick.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "queue.drain_tick" });
		}
		if self.max_retries == 0 {
			return Err(ConfigError::ZeroCount { field: "queue.max_retries" });
		}
		if self.capacity == 0 {
			return Err(ConfigError::ZeroCount { field: "queue.capacity" });
		}

		Ok(())
	}
}
impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_wait: Duration::seconds(120),
			max_retries: 8,
			capacity: 1_024,
			drain_tick: Duration::milliseconds(250),
		}
	}
}

/// Circuit breaker threshold and cooldown schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
	/// Failures within `failure_window` that open the circuit.
	pub failure_threshold: u32,
	/// Rolling window over which failures are counted.
	#[serde(with = "duration_ms")]
	pub failure_window: Duration,
	/// First cooldown after opening.
	#[serde(with = "duration_ms")]
	pub cooldown: Duration,
	/// Multiplier applied to the cooldown each time a half-open trial fails.
	pub cooldown_multiplier: f64,
	/// Longest cooldown the schedule may reach.
	#[serde(with = "duration_ms")]
	pub max_cooldown: Duration,
}
impl CircuitConfig {
	/// Overrides the failure threshold and window.
	pub fn with_threshold(mut self, failures: u32, window: Duration) -> Self {
		self.failure_threshold = failures;
		self.failure_window = window;

		self
	}

	/// Overrides the cooldown schedule.
	pub fn with_cooldown(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
		self.cooldown = initial;
		self.cooldown_multiplier = multiplier;
		self.max_cooldown = max;

		self
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.failure_threshold == 0 {
			return Err(ConfigError::ZeroCount { field: "circuit.failure_threshold" });
		}
		if !self.failure_window.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "circuit.failure_window" });
		}
		if !self.cooldown.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "circuit.cooldown" });
		}
		if self.max_cooldown < self.cooldown {
			return Err(ConfigError::BoundBelowFloor {
				field: "circuit.max_cooldown",
				floor: "circuit.cooldown",
			});
		}
		if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1. {
			return Err(ConfigError::OutOfRange {
				field: "circuit.cooldown_multiplier",
				value: self.cooldown_multiplier,
				range: "[1, inf)",
			});
		}

		Ok(())
	}
}
impl Default for CircuitConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			failure_window: Duration::seconds(60),
			cooldown: Duration::seconds(30),
			cooldown_multiplier: 2.,
			max_cooldown: Duration::seconds(300),
		}
	}
}

/// Credential refresh gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
	/// Minimum time between a successful refresh completing and the next refresh starting.
	#[serde(with = "duration_ms")]
	pub min_interval: Duration,
	/// Trailing window for the refresh quota.
	#[serde(with = "duration_ms")]
	pub quota_window: Duration,
	/// Refresh attempts allowed per quota window.
	pub quota: u32,
	/// Lease lifetime; covers the refresh round-trip plus margin.
	#[serde(with = "duration_ms")]
	pub lease_ttl: Duration,
	/// Shared-store key namespace.
	pub namespace: String,
}
impl RefreshConfig {
	/// Overrides the minimum interval.
	pub fn with_min_interval(mut self, interval: Duration) -> Self {
		self.min_interval = interval;

		self
	}

	/// Overrides the quota.
	pub fn with_quota(mut self, quota: u32, window: Duration) -> Self {
		self.quota = quota;
		self.quota_window = window;

		self
	}

	/// Overrides the lease TTL.
	pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
		self.lease_ttl = ttl;

		self
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.min_interval.is_negative() {
			return Err(ConfigError::NonPositiveDuration { field: "refresh.min_interval" });
		}
		if !self.quota_window.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "refresh.quota_window" });
		}
		if !self.lease_ttl.is_positive() {
			return Err(ConfigError::NonPositiveDuration { field: "refresh.lease_ttl" });
		}
		if self.quota == 0 {
			return Err(ConfigError::ZeroCount { field: "refresh.quota" });
		}

		Ok(())
	}
}
impl Default for RefreshConfig {
	fn default() -> Self {
		Self {
			min_interval: Duration::seconds(180),
			quota_window: Duration::seconds(600),
			quota: 10,
			lease_ttl: Duration::seconds(30),
			namespace: "quota-broker".into(),
		}
	}
}

/// Request history retention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
	/// Hard cap on stored records; the oldest are dropped first.
	pub max_records: usize,
}
impl Default for HistoryConfig {
	fn default() -> Self {
		Self { max_records: 10_000 }
	}
}

mod duration_ms {
	// crates.io
	use serde::{Deserialize, Deserializer, Serializer};
	use time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let millis = i64::try_from(duration.whole_milliseconds()).unwrap_or(i64::MAX);

		serializer.serialize_i64(millis)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		i64::deserialize(deserializer).map(Duration::milliseconds)
	}
}
