// crates.io
use tokio::sync::broadcast;
// self
use crate::{_prelude::*, obs};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// State changes and denials published by the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum CoordinatorEvent {
	/// A call was denied admission and queued or rejected.
	Throttled {
		/// Stable reason label.
		reason: String,
		/// Suggested wait.
		wait: Duration,
		/// Caller priority.
		priority: u8,
	},
	/// The downstream service answered with a quota rejection.
	RateLimitHit {
		/// Capacity factor after the decrease.
		capacity_factor: f64,
		/// Retry hint from the downstream, if any.
		retry_after: Option<Duration>,
	},
	/// The circuit breaker opened.
	CircuitOpened {
		/// Instant at which a trial call becomes possible.
		retry_at: OffsetDateTime,
		/// Failures observed when the circuit opened.
		failures: u32,
	},
	/// The cooldown elapsed and a trial call was let through.
	CircuitHalfOpened,
	/// A trial call succeeded and the circuit closed.
	CircuitClosed,
	/// A queued call exceeded its wait or retry bound.
	QueueTimeout {
		/// Time spent queued.
		waited: Duration,
		/// Admission attempts made while queued.
		attempts: u32,
	},
	/// A credential refresh was denied by the refresh gate.
	RefreshDenied {
		/// Stable reason label.
		reason: String,
		/// Suggested wait.
		retry_after: Duration,
	},
	/// A granted credential refresh finished.
	RefreshCompleted {
		/// Whether the provider produced a new token.
		succeeded: bool,
	},
}
impl CoordinatorEvent {
	/// Returns a stable label suitable for log or metric fields.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Throttled { .. } => "throttled",
			Self::RateLimitHit { .. } => "rate_limit_hit",
			Self::CircuitOpened { .. } => "circuit_opened",
			Self::CircuitHalfOpened => "circuit_half_opened",
			Self::CircuitClosed => "circuit_closed",
			Self::QueueTimeout { .. } => "queue_timeout",
			Self::RefreshDenied { .. } => "refresh_denied",
			Self::RefreshCompleted { .. } => "refresh_completed",
		}
	}
}

/// Broadcast channel carrying [`CoordinatorEvent`]s to any number of subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
	sender: broadcast::Sender<CoordinatorEvent>,
}
impl EventBus {
	/// Creates a bus that buffers up to `capacity` events per lagging subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));

		Self { sender }
	}

	/// Subscribes to future events.
	pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
		self.sender.subscribe()
	}

	/// Logs, counts, and broadcasts an event. Having no subscribers is not an error.
	pub fn publish(&self, event: CoordinatorEvent) {
		obs::log_event(&event);
		obs::record_event_metric(&event);

		let _ = self.sender.send(event);
	}
}
impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_EVENT_CAPACITY)
	}
}
