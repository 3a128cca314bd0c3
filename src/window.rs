//! Multi-window utilization estimates derived from the request history.
//!
//! Short windows catch bursts while long windows catch sustained overuse; the most constrained
//! window decides both admission and how long a denied caller should wait.

// self
use crate::{_prelude::*, config::WindowConfig, history::RequestHistory};

// Absorbs float noise such as `0.95 * 100.0 = 95.00000000000001`.
const SLOT_EPSILON: f64 = 1e-9;

/// Utilization of one window at a given instant. Derived on demand, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
	/// Window label.
	pub name: String,
	/// Window length.
	pub size: Duration,
	/// Configured attempts per window at capacity factor 1.0.
	pub max_requests: u32,
	/// Effective budget after applying the capacity factor.
	pub limit: f64,
	/// Attempts currently inside the window.
	pub current: usize,
	/// `current / limit`.
	pub utilization: f64,
}
impl RateWindow {
	/// Number of attempts the window tolerates before denying at `threshold` utilization.
	///
	/// An admission is allowed only while `current / limit < threshold` and the admitted
	/// attempt itself still fits inside `limit`. At least one slot is always available so tiny
	/// budgets do not stall forever.
	pub fn slots(&self, threshold: f64) -> usize {
		let by_threshold = (threshold * self.limit - SLOT_EPSILON).ceil();
		let by_limit = (self.limit + SLOT_EPSILON).floor();
		let slots = by_threshold.min(by_limit).max(1.);

		slots as usize
	}

	/// Returns `true` when one more attempt may be admitted at `threshold`.
	pub fn admits(&self, threshold: f64) -> bool {
		self.current < self.slots(threshold)
	}
}

/// Holds the window definitions and evaluates them against a [`RequestHistory`].
#[derive(Clone, Debug)]
pub struct MultiWindowRateEstimator {
	windows: Vec<WindowConfig>,
}
impl MultiWindowRateEstimator {
	/// Creates an estimator over the provided windows.
	pub fn new(windows: Vec<WindowConfig>) -> Self {
		Self { windows }
	}

	/// Configured window definitions.
	pub fn windows(&self) -> &[WindowConfig] {
		&self.windows
	}

	/// Computes the utilization of one window.
	pub fn utilization(
		&self,
		history: &RequestHistory,
		now: OffsetDateTime,
		window: &WindowConfig,
		capacity_factor: f64,
	) -> RateWindow {
		let current = history.count_since(now, window.size, None);
		let limit = f64::from(window.max_requests) * capacity_factor;
		let utilization = if limit > 0. { current as f64 / limit } else { f64::INFINITY };

		RateWindow {
			name: window.name.clone(),
			size: window.size,
			max_requests: window.max_requests,
			limit,
			current,
			utilization,
		}
	}

	/// Computes the utilization of every window, in configuration order.
	pub fn snapshot(
		&self,
		history: &RequestHistory,
		now: OffsetDateTime,
		capacity_factor: f64,
	) -> Vec<RateWindow> {
		self.windows.iter().map(|w| self.utilization(history, now, w, capacity_factor)).collect()
	}

	/// Returns the window with the highest utilization.
	pub fn most_constrained_window(
		&self,
		history: &RequestHistory,
		now: OffsetDateTime,
		capacity_factor: f64,
	) -> Option<RateWindow> {
		self.snapshot(history, now, capacity_factor)
			.into_iter()
			.max_by(|a, b| a.utilization.total_cmp(&b.utilization))
	}

	/// Time until enough attempts leave `window` for it to admit again at `threshold`.
	pub fn time_until_window_frees(
		&self,
		history: &RequestHistory,
		now: OffsetDateTime,
		window: &RateWindow,
		threshold: f64,
	) -> Duration {
		let slots = window.slots(threshold);

		if window.current < slots {
			return Duration::ZERO;
		}

		// The attempt at this index must expire before the count drops below `slots`.
		let expiring = window.current - slots;

		match history.nth_in_window(now, window.size, expiring) {
			Some(timestamp) => (timestamp + window.size - now).max(Duration::ZERO),
			None => window.size,
		}
	}
}
