//! Admission decisions combining window utilization, the adaptive capacity factor, downstream
//! retry hints, and circuit state.
//!
//! An admitted call is recorded before it runs, so window accounting includes in-flight load.
//! Denied calls are counted separately and never consume window budget. Admitted calls carry an
//! [`AdmissionTicket`] that must be completed with the downstream outcome; dropping an unfinished
//! ticket keeps its record counted and hands any half-open trial back to the breaker.

// self
use crate::{
	_prelude::*,
	circuit::{CircuitBreaker, CircuitPermit},
	clock::Clock,
	config::{AdaptiveConfig, CoordinatorConfig, ThrottleConfig},
	history::{RecordId, RecordOutcome, RequestHistory},
	ident::OperationTag,
	obs::{self, CoordinatorEvent, EventBus},
	window::{MultiWindowRateEstimator, RateWindow},
};

/// Why an admission was granted or denied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleReason {
	/// Capacity was available.
	Admitted,
	/// The circuit breaker is open or its trial slot is taken.
	CircuitOpen,
	/// The downstream asked for a pause via a retry hint.
	RetryAfter,
	/// The named window is at its safety threshold.
	Window(String),
}
impl Display for ThrottleReason {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Admitted => f.write_str("admitted"),
			Self::CircuitOpen => f.write_str("circuit-open"),
			Self::RetryAfter => f.write_str("retry-after"),
			Self::Window(name) => write!(f, "window:{name}"),
		}
	}
}

/// Result of one admission attempt.
#[derive(Debug)]
pub struct ThrottleDecision {
	/// Whether the call may proceed now.
	pub admit: bool,
	/// How long a denied caller should wait before trying again.
	pub wait: Duration,
	/// Why the decision was made.
	pub reason: ThrottleReason,
	ticket: Option<AdmissionTicket>,
}
impl ThrottleDecision {
	/// Takes the ticket of an admitted call.
	pub fn into_ticket(self) -> Option<AdmissionTicket> {
		self.ticket
	}

	fn denied(wait: Duration, reason: ThrottleReason) -> Self {
		Self { admit: false, wait: wait.max(Duration::ZERO), reason, ticket: None }
	}
}

/// Downstream outcome reported back through an [`AdmissionTicket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
	/// The call succeeded.
	Success,
	/// The call failed for a reason other than quota.
	Failure,
	/// The remote service rejected the call for quota reasons.
	RateLimited {
		/// Retry hint supplied by the remote service.
		retry_after: Option<Duration>,
	},
}

/// Capacity factor and the instant it last moved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveRateState {
	/// Multiplier applied to every window's budget.
	pub capacity_factor: f64,
	/// Instant of the latest adjustment.
	pub last_adjustment_at: Option<OffsetDateTime>,
}
impl AdaptiveRateState {
	/// Creates the starting state for a policy.
	pub fn new(config: &AdaptiveConfig) -> Self {
		Self { capacity_factor: config.initial_factor, last_adjustment_at: None }
	}

	/// Shrinks the factor after a downstream quota rejection.
	pub fn on_rate_limited(&mut self, config: &AdaptiveConfig, now: OffsetDateTime) {
		self.capacity_factor = (self.capacity_factor * config.decrease).max(config.min_factor);
		self.last_adjustment_at = Some(now);
	}

	/// Grows the factor after a downstream success.
	pub fn on_success(&mut self, config: &AdaptiveConfig, now: OffsetDateTime) {
		self.capacity_factor = (self.capacity_factor * config.growth).min(config.max_factor);
		self.last_adjustment_at = Some(now);
	}
}

#[derive(Debug)]
struct ThrottleState {
	history: RequestHistory,
	rate: AdaptiveRateState,
	paused_until: Option<OffsetDateTime>,
}

/// Decides admit, delay, or reject for every outbound call.
pub struct AdaptiveThrottleController {
	estimator: MultiWindowRateEstimator,
	throttle: ThrottleConfig,
	adaptive: AdaptiveConfig,
	state: Mutex<ThrottleState>,
	circuit: CircuitBreaker,
	clock: Arc<dyn Clock>,
	events: EventBus,
}
impl AdaptiveThrottleController {
	/// Builds a controller from a validated configuration.
	pub fn new(config: &CoordinatorConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
		let history = RequestHistory::new(config.longest_window(), config.history.max_records);

		Self {
			estimator: MultiWindowRateEstimator::new(config.windows.clone()),
			throttle: config.throttle.clone(),
			adaptive: config.adaptive.clone(),
			state: Mutex::new(ThrottleState {
				history,
				rate: AdaptiveRateState::new(&config.adaptive),
				paused_until: None,
			}),
			circuit: CircuitBreaker::new(config.circuit.clone(), events.clone()),
			clock,
			events,
		}
	}

	/// Circuit breaker guarding the downstream service.
	pub fn circuit(&self) -> &CircuitBreaker {
		&self.circuit
	}

	/// Clock shared with the rest of the coordinator.
	pub fn clock(&self) -> &Arc<dyn Clock> {
		&self.clock
	}

	/// Current capacity factor state.
	pub fn adaptive_state(&self) -> AdaptiveRateState {
		self.state.lock().rate.clone()
	}

	/// Per-window utilization at `now`.
	pub fn windows_at(&self, now: OffsetDateTime) -> Vec<RateWindow> {
		let state = self.state.lock();

		self.estimator.snapshot(&state.history, now, state.rate.capacity_factor)
	}

	/// Throttled admissions inside the longest window.
	pub fn throttled_at(&self, now: OffsetDateTime) -> usize {
		let state = self.state.lock();
		let horizon =
			self.estimator.windows().iter().map(|w| w.size).max().unwrap_or(Duration::ZERO);

		state.history.throttled_since(now, horizon)
	}

	/// Runs `f` against the request history under the controller's lock.
	pub fn with_history<R>(&self, f: impl FnOnce(&RequestHistory) -> R) -> R {
		f(&self.state.lock().history)
	}

	/// Admission using the controller's clock.
	pub fn admit(self: &Arc<Self>, priority: u8, operation: OperationTag) -> ThrottleDecision {
		self.admit_at(self.clock.now(), priority, operation)
	}

	/// Decides whether a call of `priority` may proceed at `now`, recording the attempt.
	pub fn admit_at(
		self: &Arc<Self>,
		now: OffsetDateTime,
		priority: u8,
		operation: OperationTag,
	) -> ThrottleDecision {
		let mut state = self.state.lock();
		let permit = match self.circuit.try_acquire_at(now) {
			Ok(permit) => permit,
			Err(retry_at) => {
				state.history.record_throttled(now);

				return ThrottleDecision::denied(retry_at - now, ThrottleReason::CircuitOpen);
			},
		};

		if let Some(until) = state.paused_until.filter(|until| now < *until) {
			state.history.record_throttled(now);
			self.circuit.release(permit);

			return ThrottleDecision::denied(until - now, ThrottleReason::RetryAfter);
		}

		let threshold = self.threshold_for(priority);
		let windows = self.estimator.snapshot(&state.history, now, state.rate.capacity_factor);
		let blocking = windows
			.iter()
			.filter(|w| !w.admits(threshold))
			.map(|w| (w, self.estimator.time_until_window_frees(&state.history, now, w, threshold)))
			.max_by(|(a, wait_a), (b, wait_b)| {
				wait_a.cmp(wait_b).then(a.utilization.total_cmp(&b.utilization))
			})
			.map(|(w, wait)| (w.name.clone(), wait));

		if let Some((name, wait)) = blocking {
			state.history.record_throttled(now);
			self.circuit.release(permit);

			return ThrottleDecision::denied(wait, ThrottleReason::Window(name));
		}

		let record = state.history.record_attempt(now, operation);

		ThrottleDecision {
			admit: true,
			wait: Duration::ZERO,
			reason: ThrottleReason::Admitted,
			ticket: Some(AdmissionTicket {
				controller: self.clone(),
				record,
				permit: Some(permit),
				admitted_at: now,
			}),
		}
	}

	/// Publishes a throttle event for a denied caller.
	pub fn report_throttled(&self, decision: &ThrottleDecision, priority: u8) {
		self.events.publish(CoordinatorEvent::Throttled {
			reason: decision.reason.to_string(),
			wait: decision.wait,
			priority,
		});
	}

	fn threshold_for(&self, priority: u8) -> f64 {
		if priority >= self.throttle.burst_priority {
			(self.throttle.safety_margin * self.throttle.burst_allowance).min(1.)
		} else {
			self.throttle.safety_margin
		}
	}

	fn complete(
		&self,
		record: RecordId,
		permit: CircuitPermit,
		now: OffsetDateTime,
		outcome: CallOutcome,
	) {
		let mut state = self.state.lock();

		match outcome {
			CallOutcome::Success => {
				state.history.resolve(record, RecordOutcome::Success, now);
				state.rate.on_success(&self.adaptive, now);
				self.circuit.on_success_at(now, permit);
			},
			CallOutcome::Failure => {
				state.history.resolve(record, RecordOutcome::Failure, now);
				self.circuit.on_failure_at(now, permit);
			},
			CallOutcome::RateLimited { retry_after } => {
				state.history.resolve(record, RecordOutcome::RateLimited, now);
				state.rate.on_rate_limited(&self.adaptive, now);

				if let Some(pause) = retry_after.filter(|d| d.is_positive()) {
					let until = now + pause;

					state.paused_until =
						Some(state.paused_until.map_or(until, |current| current.max(until)));
				}

				// A quota rejection says nothing about health, except for the half-open trial.
				if permit.is_trial() {
					self.circuit.on_failure_at(now, permit);
				} else {
					self.circuit.release(permit);
				}

				self.events.publish(CoordinatorEvent::RateLimitHit {
					capacity_factor: state.rate.capacity_factor,
					retry_after,
				});
			},
		}

		obs::record_capacity_factor(state.rate.capacity_factor);
	}
}
impl Debug for AdaptiveThrottleController {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AdaptiveThrottleController")
			.field("windows", &self.estimator.windows())
			.field("throttle", &self.throttle)
			.field("adaptive", &self.adaptive)
			.field("circuit", &self.circuit)
			.finish()
	}
}

/// Handle for an admitted call; complete it with the downstream outcome.
pub struct AdmissionTicket {
	controller: Arc<AdaptiveThrottleController>,
	record: RecordId,
	permit: Option<CircuitPermit>,
	admitted_at: OffsetDateTime,
}
impl AdmissionTicket {
	/// History record written for this admission.
	pub fn record(&self) -> RecordId {
		self.record
	}

	/// Instant the call was admitted.
	pub fn admitted_at(&self) -> OffsetDateTime {
		self.admitted_at
	}

	/// Reports the outcome using the controller's clock.
	pub fn complete(self, outcome: CallOutcome) {
		let now = self.controller.clock.now();

		self.complete_at(now, outcome);
	}

	/// Reports the outcome observed at `now`.
	pub fn complete_at(mut self, now: OffsetDateTime, outcome: CallOutcome) {
		if let Some(permit) = self.permit.take() {
			self.controller.complete(self.record, permit, now, outcome);
		}
	}
}
impl Drop for AdmissionTicket {
	fn drop(&mut self) {
		if let Some(permit) = self.permit.take() {
			self.controller.circuit.release(permit);
		}
	}
}
impl Debug for AdmissionTicket {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AdmissionTicket")
			.field("record", &self.record)
			.field("trial", &self.permit.as_ref().map(CircuitPermit::is_trial))
			.field("admitted_at", &self.admitted_at)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use rand::{Rng, SeedableRng, rngs::StdRng};
	// self
	use super::*;
	use crate::{
		circuit::CircuitState,
		clock::ManualClock,
		config::{CircuitConfig, WindowConfig},
	};

	const T0: OffsetDateTime = time::macros::datetime!(2025-11-10 12:00 UTC);

	fn controller(config: CoordinatorConfig) -> Arc<AdaptiveThrottleController> {
		let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));

		Arc::new(AdaptiveThrottleController::new(&config, clock, EventBus::default()))
	}

	fn single_window(max: u32) -> CoordinatorConfig {
		CoordinatorConfig::default()
			.with_windows([WindowConfig::new("primary", Duration::seconds(60), max)])
	}

	#[test]
	fn twenty_simultaneous_calls_admit_exactly_ten() {
		let controller = controller(single_window(10));
		let mut tickets = Vec::new();
		let mut waits = Vec::new();

		for _ in 0..20 {
			let decision = controller.admit_at(T0, 5, OperationTag::unlabeled());

			if decision.admit {
				tickets.push(decision.into_ticket().expect("Admitted decisions carry a ticket."));
			} else {
				assert_eq!(decision.reason, ThrottleReason::Window("primary".into()));
				waits.push(decision.wait);
			}
		}

		assert_eq!(tickets.len(), 10);
		assert_eq!(waits.len(), 10);
		assert!(
			waits.iter().all(|wait| *wait == Duration::seconds(60)),
			"No denied call may run before the window frees."
		);
		assert!(!controller.admit_at(T0 + Duration::seconds(59), 5, OperationTag::unlabeled()).admit);
		assert!(controller.admit_at(T0 + Duration::seconds(60), 5, OperationTag::unlabeled()).admit);
		assert_eq!(controller.throttled_at(T0 + Duration::seconds(59)), 11);
	}

	#[test]
	fn rate_limit_shrinks_and_success_regrows_within_bounds() {
		let controller = controller(single_window(1_000));
		let ticket = controller
			.admit_at(T0, 5, OperationTag::unlabeled())
			.into_ticket()
			.expect("Empty window should admit.");

		ticket.complete_at(T0, CallOutcome::RateLimited { retry_after: None });

		assert!((controller.adaptive_state().capacity_factor - 0.7).abs() < 1e-9);

		let mut previous = 0.7;

		for i in 0..10 {
			let now = T0 + Duration::seconds(i);
			let ticket = controller
				.admit_at(now, 5, OperationTag::unlabeled())
				.into_ticket()
				.expect("Window has room.");

			ticket.complete_at(now, CallOutcome::Success);

			let factor = controller.adaptive_state().capacity_factor;

			assert!((factor - previous * 1.02).abs() < 1e-9);

			previous = factor;
		}

		for i in 0..200 {
			let now = T0 + Duration::seconds(10 + i / 10);
			let ticket = controller
				.admit_at(now, 5, OperationTag::unlabeled())
				.into_ticket()
				.expect("Window has room.");

			ticket.complete_at(now, CallOutcome::Success);
		}

		assert_eq!(controller.adaptive_state().capacity_factor, 1.2);
	}

	#[test]
	fn capacity_factor_never_drops_below_floor() {
		let mut state = AdaptiveRateState::new(&AdaptiveConfig::default());

		for _ in 0..20 {
			state.on_rate_limited(&AdaptiveConfig::default(), T0);
		}

		assert_eq!(state.capacity_factor, 0.3);
	}

	#[test]
	fn retry_after_hint_pauses_admission() {
		let controller = controller(single_window(100));
		let ticket = controller
			.admit_at(T0, 5, OperationTag::unlabeled())
			.into_ticket()
			.expect("Empty window should admit.");

		ticket
			.complete_at(T0, CallOutcome::RateLimited { retry_after: Some(Duration::seconds(10)) });

		let paused = controller.admit_at(T0 + Duration::seconds(4), 5, OperationTag::unlabeled());

		assert!(!paused.admit);
		assert_eq!(paused.reason, ThrottleReason::RetryAfter);
		assert_eq!(paused.wait, Duration::seconds(6));
		assert!(controller.admit_at(T0 + Duration::seconds(10), 5, OperationTag::unlabeled()).admit);
	}

	#[test]
	fn open_circuit_rejects_without_recording_attempts() {
		let config = single_window(100)
			.with_circuit(CircuitConfig::default().with_threshold(5, Duration::seconds(60)));
		let controller = controller(config);

		for i in 0..5 {
			let now = T0 + Duration::seconds(i);
			let ticket = controller
				.admit_at(now, 5, OperationTag::unlabeled())
				.into_ticket()
				.expect("Closed circuit should admit.");

			ticket.complete_at(now, CallOutcome::Failure);
		}

		let now = T0 + Duration::seconds(10);

		assert_eq!(controller.circuit().state_at(now).state, CircuitState::Open);

		let decision = controller.admit_at(now, 10, OperationTag::unlabeled());

		assert!(!decision.admit);
		assert_eq!(decision.reason, ThrottleReason::CircuitOpen);
		assert_eq!(decision.wait, Duration::seconds(24));
		assert_eq!(controller.with_history(|h| h.count_since(now, Duration::seconds(60), None)), 5);
	}

	#[test]
	fn burst_allowance_lets_high_priority_use_the_margin() {
		let config =
			single_window(100).with_throttle(ThrottleConfig::default().with_burst_allowance(1.05));
		let controller = controller(config);

		for _ in 0..95 {
			assert!(controller.admit_at(T0, 1, OperationTag::unlabeled()).admit);
		}

		assert!(!controller.admit_at(T0, 1, OperationTag::unlabeled()).admit);
		assert!(controller.admit_at(T0, 9, OperationTag::unlabeled()).admit);
	}

	#[test]
	fn dropped_trial_ticket_frees_the_half_open_slot() {
		let controller = controller(single_window(100));

		controller.circuit().force_open_at(T0);

		let at = T0 + Duration::seconds(30);
		let trial = controller.admit_at(at, 5, OperationTag::unlabeled());

		assert!(trial.admit);
		assert!(!controller.admit_at(at, 5, OperationTag::unlabeled()).admit);

		drop(trial);

		assert!(controller.admit_at(at, 5, OperationTag::unlabeled()).admit);
	}

	#[test]
	fn window_counts_never_exceed_scaled_budget() {
		let windows = [
			WindowConfig::new("burst", Duration::seconds(10), 7),
			WindowConfig::new("primary", Duration::seconds(60), 25),
		];
		let controller = controller(CoordinatorConfig::default().with_windows(windows.clone()));
		let mut rng = StdRng::seed_from_u64(7);
		let mut now = T0;

		for _ in 0..2_000 {
			now += Duration::milliseconds(rng.random_range(0..800));

			let factor = controller.adaptive_state().capacity_factor;
			let decision =
				controller.admit_at(now, rng.random_range(0..=10), OperationTag::unlabeled());
			let Some(ticket) = decision.into_ticket() else {
				continue;
			};

			for window in &windows {
				let count = controller.with_history(|h| h.count_since(now, window.size, None));
				let budget = (f64::from(window.max_requests) * factor + 1e-9).floor().max(1.);

				assert!(
					count as f64 <= budget,
					"{} holds {count} attempts against a budget of {budget}",
					window.name
				);
			}

			let outcome = match rng.random_range(0..20) {
				0 => CallOutcome::RateLimited { retry_after: None },
				_ => CallOutcome::Success,
			};

			ticket.complete_at(now, outcome);
		}
	}
}
