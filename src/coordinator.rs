//! Entry point that routes every outbound call through admission, queueing, and circuit checks.
//!
//! A call is admitted directly only when no queued call of equal or higher priority is waiting;
//! otherwise it joins the queue. Queued callers drive the drain themselves: each waiter wakes on
//! the drain tick (or when the head becomes ready), takes the queue lock, and lets the drain
//! retry admission for the head entry only. Completed calls also drain, so freed capacity is
//! handed out without waiting for the next tick.

mod status;

pub use status::StatusSnapshot;

// std
use std::future;
// crates.io
use tokio::sync::{broadcast, oneshot};
// self
use crate::{
	_prelude::*,
	circuit::CircuitBreaker,
	clock::{self, Clock, SystemClock},
	config::{CoordinatorConfig, MAX_PRIORITY},
	credential::AccessToken,
	error::{ConfigError, DownstreamError, DownstreamFailure},
	ident::OperationTag,
	obs::{self, CoordinatorEvent, CoordinatorSpan, EventBus, OpKind, OpOutcome},
	queue::{CancelHandle, PriorityRequestQueue, QueueEntry, QueueHandle},
	refresh::TokenRefreshCoordinator,
	throttle::{
		AdaptiveThrottleController, AdmissionTicket, CallOutcome, ThrottleDecision, ThrottleReason,
	},
};

const QUEUE_FULL: &str = "queue-full";

/// Per-call settings for [`Coordinator::execute_with`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
	/// Caller priority, `0..=10`; higher runs first.
	pub priority: u8,
	/// Label recorded with the call's history entry.
	pub operation: OperationTag,
	/// Longest time the call may sit in the queue before failing with a queue timeout.
	pub deadline: Option<Duration>,
	/// Caller-side cancellation for a queued call.
	pub cancel: Option<CancelHandle>,
}
impl CallOptions {
	/// Options for an unlabeled call at `priority`.
	pub fn new(priority: u8) -> Self {
		Self { priority, ..Default::default() }
	}

	/// Labels the call.
	pub fn with_operation(mut self, operation: OperationTag) -> Self {
		self.operation = operation;

		self
	}

	/// Bounds the time spent queued.
	pub fn with_deadline(mut self, deadline: Duration) -> Self {
		self.deadline = Some(deadline);

		self
	}

	/// Attaches a cancellation handle.
	pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
		self.cancel = Some(cancel);

		self
	}
}

enum Dispatch {
	Admitted(AdmissionTicket),
	Failed(Error),
}

struct Waiter {
	operation: OperationTag,
	sender: oneshot::Sender<Dispatch>,
}

struct CoordinatorInner {
	config: CoordinatorConfig,
	clock: Arc<dyn Clock>,
	throttle: Arc<AdaptiveThrottleController>,
	queue: Mutex<PriorityRequestQueue<Waiter>>,
	events: EventBus,
	refresh: Option<TokenRefreshCoordinator>,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
	config: CoordinatorConfig,
	clock: Option<Arc<dyn Clock>>,
	events: Option<EventBus>,
	refresh: Option<TokenRefreshCoordinator>,
}
impl CoordinatorBuilder {
	/// Uses `clock` instead of the system clock.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);

		self
	}

	/// Publishes events on `events` instead of a private bus.
	pub fn events(mut self, events: EventBus) -> Self {
		self.events = Some(events);

		self
	}

	/// Attaches the credential refresh gate.
	pub fn refresh(mut self, refresh: TokenRefreshCoordinator) -> Self {
		self.refresh = Some(refresh);

		self
	}

	/// Validates the configuration and builds the coordinator.
	pub fn build(self) -> Result<Coordinator> {
		self.config.validate()?;

		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let events = self.events.unwrap_or_default();
		let throttle =
			Arc::new(AdaptiveThrottleController::new(&self.config, clock.clone(), events.clone()));
		let queue = Mutex::new(PriorityRequestQueue::new(self.config.queue.capacity));
		let refresh = self.refresh.map(|refresh| refresh.with_events(events.clone()));

		Ok(Coordinator {
			inner: Arc::new(CoordinatorInner {
				config: self.config,
				clock,
				throttle,
				queue,
				events,
				refresh,
			}),
		})
	}
}

/// Shared admission-control handle; clones share all state.
#[derive(Clone)]
pub struct Coordinator {
	inner: Arc<CoordinatorInner>,
}
impl Coordinator {
	/// Starts building a coordinator over `config`.
	pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
		CoordinatorBuilder { config, clock: None, events: None, refresh: None }
	}

	/// Builds a coordinator on the system clock.
	pub fn new(config: CoordinatorConfig) -> Result<Self> {
		Self::builder(config).build()
	}

	/// Builds a coordinator on the provided clock.
	pub fn with_clock(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
		Self::builder(config).clock(clock).build()
	}

	/// Active configuration.
	pub fn config(&self) -> &CoordinatorConfig {
		&self.inner.config
	}

	/// Admission controller shared by every call.
	pub fn controller(&self) -> &Arc<AdaptiveThrottleController> {
		&self.inner.throttle
	}

	/// Circuit breaker guarding the downstream service.
	pub fn circuit(&self) -> &CircuitBreaker {
		self.inner.throttle.circuit()
	}

	/// Credential refresh gate, when one is attached.
	pub fn refresh_gate(&self) -> Option<&TokenRefreshCoordinator> {
		self.inner.refresh.as_ref()
	}

	/// Subscribes to coordinator events.
	pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
		self.inner.events.subscribe()
	}

	/// Makes one admission decision without queueing.
	///
	/// An admitted decision carries a ticket that must be completed with the call's outcome.
	pub fn admit(&self, priority: u8, operation: OperationTag) -> Result<ThrottleDecision> {
		validate_priority(priority)?;

		let decision = self.inner.throttle.admit(priority, operation);

		if !decision.admit {
			self.inner.throttle.report_throttled(&decision, priority);
		}

		Ok(decision)
	}

	/// Runs `operation` once admission allows it.
	pub async fn execute<F, Fut, T, E>(&self, priority: u8, operation: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: 'static + DownstreamFailure,
	{
		self.execute_with(CallOptions::new(priority), operation).await
	}

	/// Runs `operation` once admission allows it, honoring per-call options.
	///
	/// Downstream failures update the capacity factor and the circuit breaker before they are
	/// returned as [`Error::Downstream`].
	pub async fn execute_with<F, Fut, T, E>(&self, options: CallOptions, operation: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: 'static + DownstreamFailure,
	{
		const KIND: OpKind = OpKind::Call;

		let span = CoordinatorSpan::new(KIND, "execute");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span
			.instrument(async {
				let ticket = self.admission(&options).await?;
				let result = match operation().await {
					Ok(value) => {
						ticket.complete(CallOutcome::Success);

						Ok(value)
					},
					Err(err) => {
						let err = DownstreamError::classify(err);
						let outcome = if err.rate_limited {
							CallOutcome::RateLimited { retry_after: err.retry_after }
						} else {
							CallOutcome::Failure
						};

						ticket.complete(outcome);

						Err(Error::Downstream(err))
					},
				};

				self.drain();

				result
			})
			.await;

		match &result {
			Ok(_) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Err(
				Error::Throttled { .. }
				| Error::CircuitOpen { .. }
				| Error::QueueTimeout { .. }
				| Error::Cancelled,
			) => obs::record_op_outcome(KIND, OpOutcome::Denied),
			Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	/// Refreshes the credential through the refresh gate, reusing the current token on denial.
	pub async fn refresh_credential(&self) -> Result<AccessToken> {
		let gate = self.inner.refresh.as_ref().ok_or(ConfigError::MissingRefreshGate)?;

		gate.refresh_or_current().await
	}

	/// Opens the circuit immediately.
	pub fn force_open_circuit(&self) {
		self.circuit().force_open_at(self.inner.clock.now());
	}

	/// Closes the circuit and lets queued calls retry.
	pub fn reset_circuit(&self) {
		self.circuit().reset();
		self.drain();
	}

	/// Retries admission for ready queued calls.
	pub fn drain(&self) {
		let mut queue = self.inner.queue.lock();

		self.drain_locked(&mut queue, self.inner.clock.now());
	}

	/// Number of queued calls.
	pub fn queue_len(&self) -> usize {
		self.inner.queue.lock().len()
	}

	/// Captures queue, window, circuit, capacity, and refresh state.
	pub async fn status(&self) -> Result<StatusSnapshot> {
		let now = self.inner.clock.now();
		let (queue_len, queue_by_priority) = {
			let queue = self.inner.queue.lock();

			(queue.len(), queue.len_by_priority())
		};
		let throttle = &self.inner.throttle;
		let adaptive = throttle.adaptive_state();
		let (next_allowed_refresh_at, refresh) = match &self.inner.refresh {
			Some(gate) => (Some(gate.next_allowed_refresh_at().await?), Some(gate.ledger().await?)),
			None => (None, None),
		};

		Ok(StatusSnapshot {
			at: now,
			queue_len,
			queue_by_priority,
			windows: throttle.windows_at(now),
			circuit: throttle.circuit().state_at(now),
			capacity_factor: adaptive.capacity_factor,
			last_adjustment_at: adaptive.last_adjustment_at,
			throttled_recent: throttle.throttled_at(now),
			next_allowed_refresh_at,
			refresh,
		})
	}

	async fn admission(&self, options: &CallOptions) -> Result<AdmissionTicket> {
		let priority = options.priority;

		validate_priority(priority)?;

		if options.cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
			return Err(Error::Cancelled);
		}

		let (handle, mut receiver) = {
			let mut queue = self.inner.queue.lock();
			let now = self.inner.clock.now();

			self.drain_locked(&mut queue, now);

			// Waiting calls of equal or higher priority go first.
			let wait = if queue.highest_priority().is_none_or(|head| priority > head) {
				let decision = self.inner.throttle.admit_at(now, priority, options.operation.clone());

				if !decision.admit {
					self.inner.throttle.report_throttled(&decision, priority);
				}

				let (wait, reason) = (decision.wait, decision.reason.clone());

				if let Some(ticket) = decision.into_ticket() {
					return Ok(ticket);
				}
				if reason == ThrottleReason::CircuitOpen {
					return Err(Error::CircuitOpen { retry_at: now + wait });
				}

				wait
			} else {
				Duration::ZERO
			};
			let (sender, receiver) = oneshot::channel();
			let waiter = Waiter { operation: options.operation.clone(), sender };
			let ready_at = self.next_ready_at(now, now, wait);
			let handle = queue.enqueue(priority, now, ready_at, waiter).map_err(|_| {
				let retry_after = wait.max(self.inner.config.queue.drain_tick);

				self.inner.events.publish(CoordinatorEvent::Throttled {
					reason: QUEUE_FULL.into(),
					wait: retry_after,
					priority,
				});

				Error::Throttled { retry_after, reason: QUEUE_FULL.into() }
			})?;

			(handle, receiver)
		};
		let mut pending = PendingCall { coordinator: self, handle, settled: false };
		let started = tokio::time::Instant::now();
		// Every waiter bounds its own wait, wherever it sits in the queue.
		let max_wait = started + clock::to_std(self.inner.config.queue.max_wait);
		let deadline = options
			.deadline
			.map_or(max_wait, |deadline| (started + clock::to_std(deadline)).min(max_wait));

		loop {
			let pause = self.next_drain_in();

			tokio::select! {
				biased;

				dispatch = &mut receiver => {
					pending.settled = true;

					return match dispatch {
						Ok(Dispatch::Admitted(ticket)) => Ok(ticket),
						Ok(Dispatch::Failed(err)) => Err(err),
						Err(_) => Err(Error::Cancelled),
					};
				},
				_ = cancelled(options.cancel.as_ref()) => {
					pending.settled = true;
					// A ticket dispatched in the meantime is dropped unused; its attempt stays counted.
					self.withdraw(handle);

					return Err(Error::Cancelled);
				},
				_ = tokio::time::sleep_until(deadline) => {
					pending.settled = true;

					return match self.withdraw(handle) {
						Some(entry) => Err(self.time_out(&entry, self.inner.clock.now(), entry.retry_count)),
						None => match receiver.try_recv() {
							Ok(Dispatch::Admitted(ticket)) => Ok(ticket),
							Ok(Dispatch::Failed(err)) => Err(err),
							Err(_) => Err(Error::Cancelled),
						},
					};
				},
				_ = tokio::time::sleep(pause) => self.drain(),
			}
		}
	}

	fn drain_locked(&self, queue: &mut PriorityRequestQueue<Waiter>, now: OffsetDateTime) {
		let limits = &self.inner.config.queue;

		for entry in queue.drain_expired(now - limits.max_wait) {
			if !entry.payload.sender.is_closed() {
				let err = self.time_out(&entry, now, entry.retry_count);
				let _ = entry.payload.sender.send(Dispatch::Failed(err));
			}
		}

		loop {
			let Some(head) = queue.peek() else {
				break;
			};
			let closed = head.payload.sender.is_closed();
			let (priority, operation) = (head.priority, head.payload.operation.clone());
			let (enqueued_at, ready_at, attempts) = (head.enqueued_at, head.ready_at, head.retry_count);

			if closed {
				queue.pop();

				continue;
			}
			if ready_at > now {
				break;
			}

			let decision = self.inner.throttle.admit_at(now, priority, operation);

			if !decision.admit {
				self.inner.throttle.report_throttled(&decision, priority);
			}

			let (wait, reason) = (decision.wait, decision.reason.clone());

			if let Some(ticket) = decision.into_ticket() {
				if let Some(entry) = queue.pop() {
					// A caller that just gave up drops the ticket; its attempt stays counted.
					let _ = entry.payload.sender.send(Dispatch::Admitted(ticket));
				}

				continue;
			}
			if reason == ThrottleReason::CircuitOpen {
				if let Some(entry) = queue.pop() {
					let err = Error::CircuitOpen { retry_at: now + wait };
					let _ = entry.payload.sender.send(Dispatch::Failed(err));
				}

				continue;
			}
			// `attempts` already includes the first try, so it equals the retries made so far.
			if attempts >= limits.max_retries {
				self.fail_head(queue, now, attempts + 1);

				continue;
			}

			queue.defer_head(self.next_ready_at(now, enqueued_at, wait));

			break;
		}
	}

	fn fail_head(
		&self,
		queue: &mut PriorityRequestQueue<Waiter>,
		now: OffsetDateTime,
		attempts: u32,
	) {
		if let Some(entry) = queue.pop() {
			let err = self.time_out(&entry, now, attempts);
			let _ = entry.payload.sender.send(Dispatch::Failed(err));
		}
	}

	fn time_out(&self, entry: &QueueEntry<Waiter>, now: OffsetDateTime, attempts: u32) -> Error {
		let waited = now - entry.enqueued_at;

		self.inner.events.publish(CoordinatorEvent::QueueTimeout { waited, attempts });

		Error::QueueTimeout { waited, attempts }
	}

	fn next_ready_at(
		&self,
		now: OffsetDateTime,
		enqueued_at: OffsetDateTime,
		wait: Duration,
	) -> OffsetDateTime {
		// Never schedule past the wait bound, so the timeout fires on time.
		(now + wait.max(Duration::MILLISECOND)).min(enqueued_at + self.inner.config.queue.max_wait)
	}

	fn next_drain_in(&self) -> std::time::Duration {
		let tick = self.inner.config.queue.drain_tick;
		let queue = self.inner.queue.lock();
		let now = self.inner.clock.now();
		let until_head = queue.peek().map_or(tick, |head| head.ready_at - now);

		clock::to_std(until_head.min(tick).max(Duration::MILLISECOND))
	}

	fn withdraw(&self, handle: QueueHandle) -> Option<QueueEntry<Waiter>> {
		let mut queue = self.inner.queue.lock();
		let entry = queue.cancel(handle);

		self.drain_locked(&mut queue, self.inner.clock.now());

		entry
	}
}
impl Debug for Coordinator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Coordinator")
			.field("config", &self.inner.config)
			.field("queue_len", &self.queue_len())
			.field("refresh", &self.inner.refresh)
			.finish()
	}
}

// Removes the queued entry when the waiting future is dropped early.
struct PendingCall<'a> {
	coordinator: &'a Coordinator,
	handle: QueueHandle,
	settled: bool,
}
impl Drop for PendingCall<'_> {
	fn drop(&mut self) {
		if !self.settled {
			self.coordinator.withdraw(self.handle);
		}
	}
}

fn validate_priority(priority: u8) -> Result<()> {
	if priority > MAX_PRIORITY {
		return Err(ConfigError::InvalidPriority { priority, max: MAX_PRIORITY }.into());
	}

	Ok(())
}

async fn cancelled(cancel: Option<&CancelHandle>) {
	match cancel {
		Some(cancel) => cancel.cancelled().await,
		None => future::pending().await,
	}
}
