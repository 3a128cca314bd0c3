// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use tokio::task::JoinSet;
// self
use quota_broker::{
	_preludet::*,
	circuit::CircuitState,
	clock::{Clock, TokioClock},
	config::{CoordinatorConfig, QueueConfig, WindowConfig},
	coordinator::{CallOptions, Coordinator},
	error::DownstreamFailure,
	ident::OperationTag,
	obs::CoordinatorEvent,
	queue::CancelHandle,
	throttle::ThrottleReason,
};

#[derive(Debug, thiserror::Error)]
#[error("429 Too Many Requests")]
struct TooManyRequests(Option<Duration>);
impl DownstreamFailure for TooManyRequests {
	fn is_rate_limited(&self) -> bool {
		true
	}

	fn retry_after(&self) -> Option<Duration> {
		self.0
	}
}

fn single_window(max: u32) -> CoordinatorConfig {
	CoordinatorConfig::default()
		.with_windows([WindowConfig::new("primary", Duration::seconds(60), max)])
}

fn paused_coordinator(config: CoordinatorConfig) -> (Arc<TokioClock>, Coordinator) {
	let clock = Arc::new(TokioClock::new(TEST_EPOCH));
	let coordinator = Coordinator::with_clock(config, clock.clone())
		.expect("Coordinator fixture config should pass validation.");

	(clock, coordinator)
}

async fn succeed(coordinator: &Coordinator) {
	coordinator
		.execute(5, || async { Ok::<_, std::io::Error>(()) })
		.await
		.expect("Call with free capacity should succeed.");
}

async fn fail(coordinator: &Coordinator) -> Error {
	coordinator
		.execute(5, || async { Err::<(), _>(std::io::Error::other("upstream 503")) })
		.await
		.expect_err("Failing downstream call should surface an error.")
}

#[tokio::test(start_paused = true)]
async fn twenty_simultaneous_calls_admit_ten_and_queue_the_rest_for_the_window() {
	let (clock, coordinator) = paused_coordinator(single_window(10));
	let mut calls = JoinSet::new();

	for _ in 0..20 {
		let coordinator = coordinator.clone();
		let clock = clock.clone();

		calls.spawn(async move {
			coordinator.execute(5, move || async move { Ok::<_, std::io::Error>(clock.now()) }).await
		});
	}

	let mut ran_at = Vec::new();

	while let Some(joined) = calls.join_next().await {
		ran_at.push(
			joined
				.expect("Call task should not panic.")
				.expect("Queued calls should eventually be admitted."),
		);
	}

	ran_at.sort();

	assert_eq!(ran_at.iter().filter(|at| **at == TEST_EPOCH).count(), 10);
	assert!(
		ran_at[10..].iter().all(|at| *at >= TEST_EPOCH + Duration::seconds(60)),
		"No queued call may run before the first admissions leave the window: {ran_at:?}."
	);
}

#[tokio::test(start_paused = true)]
async fn queued_calls_run_in_priority_order_then_fifo() {
	let config =
		single_window(1).with_queue(QueueConfig::default().with_max_wait(Duration::minutes(10)));
	let (_, coordinator) = paused_coordinator(config);
	let order = Arc::new(Mutex::new(Vec::new()));
	let mut calls = JoinSet::new();

	succeed(&coordinator).await;

	for (priority, name) in [(1, "p1"), (5, "p5-first"), (9, "p9"), (5, "p5-second")] {
		let coordinator = coordinator.clone();
		let order = order.clone();

		calls.spawn(async move {
			coordinator
				.execute(priority, move || async move {
					order.lock().push(name);

					Ok::<_, std::io::Error>(())
				})
				.await
		});
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}

	while let Some(joined) = calls.join_next().await {
		joined.expect("Call task should not panic.").expect("Queued call should be admitted.");
	}

	assert_eq!(*order.lock(), ["p9", "p5-first", "p5-second", "p1"]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_calls_leave_the_queue_without_running() {
	let (_, coordinator) = paused_coordinator(single_window(1));
	let cancel = CancelHandle::new();
	let invoked = Arc::new(AtomicBool::new(false));

	succeed(&coordinator).await;

	let queued = {
		let coordinator = coordinator.clone();
		let cancel = cancel.clone();
		let invoked = invoked.clone();

		tokio::spawn(async move {
			coordinator
				.execute_with(CallOptions::new(5).with_cancel(cancel), move || async move {
					invoked.store(true, Ordering::SeqCst);

					Ok::<_, std::io::Error>(())
				})
				.await
		})
	};

	tokio::time::sleep(std::time::Duration::from_secs(1)).await;

	assert_eq!(coordinator.queue_len(), 1);

	cancel.cancel();

	let result = queued.await.expect("Call task should not panic.");

	assert!(matches!(result, Err(Error::Cancelled)));
	assert!(!invoked.load(Ordering::SeqCst));
	assert_eq!(coordinator.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_deadlines_resolve_as_queue_timeouts() {
	let (_, coordinator) = paused_coordinator(single_window(1));
	let mut events = coordinator.subscribe();

	succeed(&coordinator).await;

	let err = coordinator
		.execute_with(CallOptions::new(5).with_deadline(Duration::seconds(5)), || async {
			Ok::<_, std::io::Error>(())
		})
		.await
		.expect_err("Call should not be admitted before its deadline.");

	match err {
		Error::QueueTimeout { waited, attempts } => {
			assert!(waited >= Duration::seconds(5) && waited < Duration::seconds(6));
			assert_eq!(attempts, 1);
		},
		other => panic!("Expected a queue timeout, got {other:?}."),
	}

	let published = std::iter::from_fn(|| events.try_recv().ok())
		.any(|event| matches!(event, CoordinatorEvent::QueueTimeout { .. }));

	assert!(published, "Queue timeouts should be published.");
	assert_eq!(coordinator.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_with_a_throttle() {
	let config = single_window(1).with_queue(QueueConfig::default().with_capacity(1));
	let (_, coordinator) = paused_coordinator(config);

	succeed(&coordinator).await;

	let parked = {
		let coordinator = coordinator.clone();

		tokio::spawn(async move { succeed(&coordinator).await })
	};

	tokio::time::sleep(std::time::Duration::from_millis(10)).await;

	let err = coordinator
		.execute(5, || async { Ok::<_, std::io::Error>(()) })
		.await
		.expect_err("Full queue should reject the call.");

	assert!(matches!(&err, Error::Throttled { reason, .. } if reason == "queue-full"));
	assert!(err.retry_after().is_some());

	parked.abort();
}

#[tokio::test]
async fn five_failures_open_the_circuit_and_later_calls_fail_fast() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());

	for _ in 0..5 {
		assert!(matches!(fail(&coordinator).await, Error::Downstream(_)));
	}

	let invoked = &AtomicBool::new(false);
	let err = coordinator
		.execute(5, move || async move {
			invoked.store(true, Ordering::SeqCst);

			Ok::<_, std::io::Error>(())
		})
		.await
		.expect_err("Open circuit should reject the call.");

	assert!(
		matches!(err, Error::CircuitOpen { retry_at } if retry_at == TEST_EPOCH + Duration::seconds(30))
	);
	assert!(!invoked.load(Ordering::SeqCst), "Open circuit must not reach the downstream.");
	assert_eq!(coordinator.circuit().state_at(clock.now()).state, CircuitState::Open);
}

#[tokio::test]
async fn successful_trial_closes_the_circuit() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());
	let mut events = coordinator.subscribe();

	for _ in 0..5 {
		fail(&coordinator).await;
	}

	clock.advance(Duration::seconds(30));
	succeed(&coordinator).await;

	let state = coordinator.circuit().state_at(clock.now());

	assert_eq!(state.state, CircuitState::Closed);
	assert_eq!(state.failure_count, 0);

	let names = std::iter::from_fn(|| events.try_recv().ok())
		.map(|event| event.name())
		.filter(|name| name.starts_with("circuit"))
		.collect::<Vec<_>>();

	assert_eq!(names, ["circuit_opened", "circuit_half_opened", "circuit_closed"]);
}

#[tokio::test]
async fn failed_trial_reopens_with_a_longer_cooldown() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());

	for _ in 0..5 {
		fail(&coordinator).await;
	}

	clock.advance(Duration::seconds(30));
	fail(&coordinator).await;

	let state = coordinator.circuit().state_at(clock.now());

	assert_eq!(state.state, CircuitState::Open);
	assert_eq!(state.next_retry_at, Some(clock.now() + Duration::seconds(60)));
}

#[tokio::test]
async fn rate_limits_shrink_capacity_and_successes_regrow_it() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());
	let err = coordinator
		.execute(5, || async { Err::<(), _>(TooManyRequests(None)) })
		.await
		.expect_err("Rate-limited call should surface an error.");

	match &err {
		Error::Downstream(downstream) => {
			assert!(downstream.rate_limited);
			assert!(downstream.source.downcast_ref::<TooManyRequests>().is_some());
		},
		other => panic!("Expected a downstream error, got {other:?}."),
	}

	let status = coordinator.status().await.expect("Status should be available.");

	assert!((status.capacity_factor - 0.7).abs() < 1e-9);
	// A quota rejection is not a health signal.
	assert_eq!(status.circuit.state, CircuitState::Closed);

	for _ in 0..10 {
		clock.advance(Duration::seconds(1));
		succeed(&coordinator).await;
	}

	let factor = coordinator.status().await.expect("Status should be available.").capacity_factor;

	assert!((factor - 0.7 * 1.02_f64.powi(10)).abs() < 1e-9);
	assert!(factor <= 1.2);
}

#[tokio::test]
async fn retry_hints_pause_admission() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());

	coordinator
		.execute(5, || async { Err::<(), _>(TooManyRequests(Some(Duration::seconds(5)))) })
		.await
		.expect_err("Rate-limited call should surface an error.");

	let decision = coordinator.admit(10, OperationTag::unlabeled()).expect("Priority is valid.");

	assert!(!decision.admit);
	assert_eq!(decision.reason, ThrottleReason::RetryAfter);
	assert_eq!(decision.wait, Duration::seconds(5));

	clock.advance(Duration::seconds(5));

	assert!(coordinator.admit(10, OperationTag::unlabeled()).expect("Priority is valid.").admit);
}

#[tokio::test]
async fn status_snapshot_reports_every_surface() {
	let clock = test_clock();
	let coordinator = build_test_coordinator(CoordinatorConfig::default(), clock.clone());

	succeed(&coordinator).await;

	let status = coordinator.status().await.expect("Status should be available.");

	assert_eq!(status.at, TEST_EPOCH);
	assert_eq!(status.queue_len, 0);
	assert_eq!(status.windows.len(), 4);
	assert!(status.windows.iter().all(|window| window.current == 1));
	assert_eq!(
		status.most_constrained_window().map(|window| window.name.as_str()),
		Some("burst")
	);
	assert_eq!(status.next_allowed_refresh_at, None);

	let json = serde_json::to_value(&status).expect("Status should serialize to JSON.");

	assert_eq!(json["circuit"]["state"], "Closed");
	assert_eq!(json["windows"][1]["name"], "primary");
}
