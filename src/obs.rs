//! Observability helpers for coordinator calls and state changes.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `quota_broker.call` with the `op` and
//!   `stage` fields, plus log events for every [`CoordinatorEvent`].
//! - Enable `metrics` to increment `quota_broker_call_total` (labeled by `op` + `outcome`) and
//!   `quota_broker_event_total` (labeled by `event`), and to publish the
//!   `quota_broker_capacity_factor` gauge.
//!
//! Events are also published on a broadcast channel so monitoring collaborators can subscribe;
//! nothing in the coordinator depends on a subscriber being present.

mod events;
mod metrics;
mod tracing;

pub use events::*;
pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Operation kinds observed by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
	/// General downstream call routed through admission control.
	Call,
	/// Credential refresh routed through the refresh gate.
	Refresh,
}
impl OpKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpKind::Call => "call",
			OpKind::Refresh => "refresh",
		}
	}
}
impl Display for OpKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpOutcome {
	/// Entry to a coordinator helper.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
	/// Denied locally without touching the downstream service.
	Denied,
}
impl OpOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpOutcome::Attempt => "attempt",
			OpOutcome::Success => "success",
			OpOutcome::Failure => "failure",
			OpOutcome::Denied => "denied",
		}
	}
}
impl Display for OpOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
