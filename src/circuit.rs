//! Three-state circuit breaker isolating callers from a degraded downstream service.
//!
//! ```text
//! CLOSED    -> OPEN      failures within the rolling window reach the threshold
//! OPEN      -> HALF_OPEN the cooldown elapsed; exactly one trial call is let through
//! HALF_OPEN -> CLOSED    the trial succeeded; failures reset, cooldown resets
//! HALF_OPEN -> OPEN      the trial failed; cooldown grows by the multiplier up to the cap
//! ```

// std
use std::collections::VecDeque;
// self
use crate::{
	_prelude::*,
	config::CircuitConfig,
	obs::{CoordinatorEvent, EventBus},
};

/// Breaker state labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
	/// Calls pass through; failures are counted.
	Closed,
	/// Calls fail fast until `next_retry_at`.
	Open,
	/// One trial call decides between closing and reopening.
	HalfOpen,
}
impl CircuitState {
	/// Returns a stable label suitable for status output.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Closed => "closed",
			Self::Open => "open",
			Self::HalfOpen => "half_open",
		}
	}
}
impl Display for CircuitState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Observable breaker state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
	/// Current state label.
	pub state: CircuitState,
	/// Failures inside the rolling window (closed) or since opening (open/half-open).
	pub failure_count: u32,
	/// Instant the circuit last opened.
	pub opened_at: Option<OffsetDateTime>,
	/// Instant at which a trial call becomes possible.
	pub next_retry_at: Option<OffsetDateTime>,
}

/// Proof that the breaker let a call through; hand it back with the call's outcome.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct CircuitPermit {
	trial: bool,
}
impl CircuitPermit {
	/// Returns `true` when this permit is the half-open trial.
	pub fn is_trial(&self) -> bool {
		self.trial
	}
}

#[derive(Debug)]
struct BreakerInner {
	state: CircuitBreakerState,
	failures: VecDeque<OffsetDateTime>,
	cooldown: Duration,
	trial_in_flight: bool,
}

/// Failure isolator shared by every caller of one downstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
	config: CircuitConfig,
	inner: Mutex<BreakerInner>,
	events: EventBus,
}
impl CircuitBreaker {
	/// Creates a closed breaker.
	pub fn new(config: CircuitConfig, events: EventBus) -> Self {
		let inner = BreakerInner {
			state: CircuitBreakerState {
				state: CircuitState::Closed,
				failure_count: 0,
				opened_at: None,
				next_retry_at: None,
			},
			failures: VecDeque::new(),
			cooldown: config.cooldown,
			trial_in_flight: false,
		};

		Self { config, inner: Mutex::new(inner), events }
	}

	/// Returns the breaker state as of `now`, pruning expired failures.
	///
	/// An open circuit whose cooldown has elapsed reports [`CircuitState::HalfOpen`]: the next
	/// call becomes the trial. The stored state only moves when that call arrives.
	pub fn state_at(&self, now: OffsetDateTime) -> CircuitBreakerState {
		let mut inner = self.inner.lock();

		self.prune(&mut inner, now);

		let mut state = inner.state.clone();

		if state.state == CircuitState::Open && state.next_retry_at.is_some_and(|at| now >= at) {
			state.state = CircuitState::HalfOpen;
		}

		state
	}

	/// Asks to let a call through at `now`.
	///
	/// Returns the instant the next trial becomes possible when the call must fail fast.
	pub fn try_acquire_at(&self, now: OffsetDateTime) -> Result<CircuitPermit, OffsetDateTime> {
		let mut inner = self.inner.lock();

		match inner.state.state {
			CircuitState::Closed => Ok(CircuitPermit { trial: false }),
			CircuitState::Open => {
				let retry_at = inner.state.next_retry_at.unwrap_or(now);

				if now < retry_at {
					return Err(retry_at);
				}

				inner.state.state = CircuitState::HalfOpen;
				inner.trial_in_flight = true;

				self.events.publish(CoordinatorEvent::CircuitHalfOpened);

				Ok(CircuitPermit { trial: true })
			},
			CircuitState::HalfOpen =>
				if inner.trial_in_flight {
					Err(inner.state.next_retry_at.unwrap_or(now).max(now))
				} else {
					inner.trial_in_flight = true;

					Ok(CircuitPermit { trial: true })
				},
		}
	}

	/// Returns a permit whose call never reached the downstream service.
	pub fn release(&self, permit: CircuitPermit) {
		if permit.trial {
			self.inner.lock().trial_in_flight = false;
		}
	}

	/// Reports a successful call.
	pub fn on_success_at(&self, now: OffsetDateTime, permit: CircuitPermit) {
		let mut inner = self.inner.lock();

		if !permit.trial || inner.state.state != CircuitState::HalfOpen {
			// Late results from calls admitted before the circuit opened carry no signal.
			return;
		}

		inner.trial_in_flight = false;
		inner.failures.clear();
		inner.cooldown = self.config.cooldown;
		inner.state = CircuitBreakerState {
			state: CircuitState::Closed,
			failure_count: 0,
			opened_at: None,
			next_retry_at: None,
		};

		self.prune(&mut inner, now);
		self.events.publish(CoordinatorEvent::CircuitClosed);
	}

	/// Reports a failed call.
	pub fn on_failure_at(&self, now: OffsetDateTime, permit: CircuitPermit) {
		let mut inner = self.inner.lock();

		match inner.state.state {
			CircuitState::Closed if !permit.trial => {
				inner.failures.push_back(now);
				self.prune(&mut inner, now);

				if inner.state.failure_count >= self.config.failure_threshold {
					let cooldown = self.config.cooldown;

					self.open(&mut inner, now, cooldown);
				}
			},
			CircuitState::HalfOpen if permit.trial => {
				inner.trial_in_flight = false;
				inner.state.failure_count = inner.state.failure_count.saturating_add(1);

				let cooldown = self.next_cooldown(inner.cooldown);

				self.open(&mut inner, now, cooldown);
			},
			_ => {},
		}
	}

	/// Opens the circuit immediately with the base cooldown.
	pub fn force_open_at(&self, now: OffsetDateTime) {
		let mut inner = self.inner.lock();
		let cooldown = self.config.cooldown;

		inner.trial_in_flight = false;

		self.open(&mut inner, now, cooldown);
	}

	/// Closes the circuit and forgets every recorded failure.
	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		let was_closed = inner.state.state == CircuitState::Closed;

		inner.failures.clear();
		inner.cooldown = self.config.cooldown;
		inner.trial_in_flight = false;
		inner.state = CircuitBreakerState {
			state: CircuitState::Closed,
			failure_count: 0,
			opened_at: None,
			next_retry_at: None,
		};

		if !was_closed {
			self.events.publish(CoordinatorEvent::CircuitClosed);
		}
	}

	fn open(&self, inner: &mut BreakerInner, now: OffsetDateTime, cooldown: Duration) {
		let retry_at = now + cooldown;

		inner.cooldown = cooldown;
		inner.state.state = CircuitState::Open;
		inner.state.opened_at = Some(now);
		inner.state.next_retry_at = Some(retry_at);

		self.events.publish(CoordinatorEvent::CircuitOpened {
			retry_at,
			failures: inner.state.failure_count,
		});
	}

	fn next_cooldown(&self, current: Duration) -> Duration {
		let cap = self.config.max_cooldown;
		let grown = current.as_seconds_f64() * self.config.cooldown_multiplier;

		Duration::checked_seconds_f64(grown).map_or(cap, |grown| grown.min(cap))
	}

	fn prune(&self, inner: &mut BreakerInner, now: OffsetDateTime) {
		if inner.state.state != CircuitState::Closed {
			return;
		}

		let cutoff = now - self.config.failure_window;

		while inner.failures.front().is_some_and(|ts| *ts <= cutoff) {
			inner.failures.pop_front();
		}

		inner.state.failure_count = u32::try_from(inner.failures.len()).unwrap_or(u32::MAX);
	}
}
