//! Point-in-time view of coordinator state for observability tooling.

// self
use crate::{
	_prelude::*, circuit::CircuitBreakerState, refresh::RefreshLedger, window::RateWindow,
};

/// Serializable snapshot returned by [`Coordinator::status`](super::Coordinator::status).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
	/// Instant the snapshot was taken.
	pub at: OffsetDateTime,
	/// Queued calls.
	pub queue_len: usize,
	/// Queued calls broken down by priority.
	pub queue_by_priority: BTreeMap<u8, usize>,
	/// Utilization of every configured window.
	pub windows: Vec<RateWindow>,
	/// Circuit breaker state.
	pub circuit: CircuitBreakerState,
	/// Current capacity factor.
	pub capacity_factor: f64,
	/// Instant the capacity factor last moved.
	pub last_adjustment_at: Option<OffsetDateTime>,
	/// Denied admissions inside the longest window.
	pub throttled_recent: usize,
	/// Earliest instant a credential refresh could be granted, when a refresh gate is attached.
	pub next_allowed_refresh_at: Option<OffsetDateTime>,
	/// Shared refresh ledger, when a refresh gate is attached.
	pub refresh: Option<RefreshLedger>,
}
impl StatusSnapshot {
	/// Window with the highest utilization.
	pub fn most_constrained_window(&self) -> Option<&RateWindow> {
		self.windows.iter().max_by(|a, b| a.utilization.total_cmp(&b.utilization))
	}
}
