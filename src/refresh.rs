//! Credential refresh gate shared by every coordinator instance.
//!
//! A refresh may start only when no instance holds the refresh lease, the last successful
//! refresh completed at least `min_interval` ago, and the trailing quota window still has room.
//! The lease and the refresh ledger live in the shared [`LeaseStore`](crate::store::LeaseStore)
//! under keys derived from the credential fingerprint. Local callers are singleflighted so one
//! process never races itself for the lease.
//!
//! The holder renews the lease every half TTL while the provider runs. A success counts only if
//! its grant is still the latest one in the ledger, so a holder that stalled past its lease and
//! was overtaken by another instance never records a second refresh inside the interval.

mod metrics;

pub use metrics::RefreshMetrics;

// std
use std::time::Duration as StdDuration;
// self
use crate::{
	_prelude::*,
	clock::{self, Clock},
	config::RefreshConfig,
	credential::{AccessToken, CredentialFuture, CredentialProvider},
	error::BoxError,
	ident::{CredentialId, InstanceId},
	instance::{InstanceCoordinator, Lease, LeaseAttempt},
	obs::{self, CoordinatorEvent, CoordinatorSpan, EventBus, OpKind, OpOutcome},
};

/// Why the refresh gate refused a refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshDenialReason {
	/// Another refresh is in flight.
	LeaseHeld {
		/// Instance holding the refresh lease.
		holder: InstanceId,
	},
	/// The last successful refresh completed too recently.
	MinInterval,
	/// The trailing quota window is full.
	QuotaExhausted,
	/// The lease lapsed mid-refresh and a later grant replaced it, so the result was not counted.
	Superseded,
}
impl RefreshDenialReason {
	/// Returns a stable label suitable for log or metric fields.
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::LeaseHeld { .. } => "lease-held",
			Self::MinInterval => "min-interval",
			Self::QuotaExhausted => "quota-exhausted",
			Self::Superseded => "superseded",
		}
	}
}
impl Display for RefreshDenialReason {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Shared refresh history, stored next to the lease.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshLedger {
	/// Completion instant of the latest successful refresh.
	pub last_success_at: Option<OffsetDateTime>,
	/// Start instant of the latest granted refresh.
	pub last_started_at: Option<OffsetDateTime>,
	/// Lease token of the latest granted refresh.
	pub last_grant: Option<String>,
	/// Start instants of granted refreshes inside the quota window, oldest first.
	pub attempts: Vec<OffsetDateTime>,
	/// Successful refreshes over the ledger's lifetime.
	pub successes: u64,
}
impl RefreshLedger {
	/// Returns the denial that applies at `now`, if any, with the wait until it lifts.
	pub fn denial_at(
		&self,
		config: &RefreshConfig,
		now: OffsetDateTime,
	) -> Option<(RefreshDenialReason, Duration)> {
		if let Some(done) = self.last_success_at {
			let allowed_at = done + config.min_interval;

			if now < allowed_at {
				return Some((RefreshDenialReason::MinInterval, allowed_at - now));
			}
		}

		let recent = self.attempts_in_window(config, now);

		if recent.len() >= config.quota as usize {
			// The oldest in-window attempt leaving the window frees one slot.
			let oldest = recent[recent.len() - config.quota as usize];

			return Some((RefreshDenialReason::QuotaExhausted, oldest + config.quota_window - now));
		}

		None
	}

	/// Earliest instant at which the ledger allows another refresh.
	pub fn next_allowed_at(&self, config: &RefreshConfig, now: OffsetDateTime) -> OffsetDateTime {
		let mut at = now;

		// Each lifted denial may expose the next one, so walk forward until none applies.
		while let Some((_, wait)) = self.denial_at(config, at) {
			at += wait.max(Duration::MILLISECOND);
		}

		at
	}

	fn attempts_in_window(&self, config: &RefreshConfig, now: OffsetDateTime) -> &[OffsetDateTime] {
		let cutoff = now - config.quota_window;
		let start = self.attempts.partition_point(|at| *at <= cutoff);

		&self.attempts[start..]
	}

	fn prune(&mut self, config: &RefreshConfig, now: OffsetDateTime) {
		let cutoff = now - config.quota_window;

		self.attempts.retain(|at| *at > cutoff);
	}
}

/// Held refresh lease; pass it back to [`TokenRefreshCoordinator::release`].
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRefreshLease {
	lease: Lease,
}
impl TokenRefreshLease {
	/// Instance holding the lease.
	pub fn holder(&self) -> &InstanceId {
		&self.lease.holder
	}

	/// Instant the lease was acquired.
	pub fn acquired_at(&self) -> OffsetDateTime {
		self.lease.acquired_at
	}

	/// Instant the lease lapses unless renewed.
	pub fn expires_at(&self) -> OffsetDateTime {
		self.lease.expires_at
	}
}

/// Result of asking the gate for permission to refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshGate {
	/// The caller holds the lease and may refresh.
	Granted(TokenRefreshLease),
	/// The refresh must wait.
	Denied {
		/// Why the refresh was refused.
		reason: RefreshDenialReason,
		/// Suggested wait before asking again.
		retry_after: Duration,
	},
}

/// Strict gate in front of [`CredentialProvider::refresh`].
pub struct TokenRefreshCoordinator {
	config: RefreshConfig,
	credential: CredentialId,
	lease_key: String,
	ledger_key: String,
	instances: InstanceCoordinator,
	provider: Arc<dyn CredentialProvider>,
	clock: Arc<dyn Clock>,
	events: EventBus,
	metrics: RefreshMetrics,
	singleflight: AsyncMutex<()>,
}
impl TokenRefreshCoordinator {
	/// Builds a gate for `credential`, coordinated through `instances`.
	pub fn new(
		config: RefreshConfig,
		credential: CredentialId,
		instances: InstanceCoordinator,
		provider: Arc<dyn CredentialProvider>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let prefix = format!("{}:refresh:{}", config.namespace, credential.fingerprint());

		Self {
			lease_key: format!("{prefix}:lease"),
			ledger_key: format!("{prefix}:ledger"),
			config,
			credential,
			instances,
			provider,
			clock,
			events: EventBus::default(),
			metrics: RefreshMetrics::default(),
			singleflight: AsyncMutex::new(()),
		}
	}

	/// Publishes refresh events on `events` instead of a private bus.
	pub fn with_events(mut self, events: EventBus) -> Self {
		self.events = events;

		self
	}

	/// Credential this gate protects.
	pub fn credential(&self) -> &CredentialId {
		&self.credential
	}

	/// Refresh counters.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Shared-store key holding the refresh lease.
	pub fn lease_key(&self) -> &str {
		&self.lease_key
	}

	/// Reads the shared refresh ledger.
	pub async fn ledger(&self) -> Result<RefreshLedger> {
		Ok(self.instances.read(&self.ledger_key).await?.unwrap_or_default())
	}

	/// Earliest instant at which a refresh could be granted.
	pub async fn next_allowed_refresh_at(&self) -> Result<OffsetDateTime> {
		let now = self.clock.now();
		let ledger_at = self.ledger().await?.next_allowed_at(&self.config, now);
		let lease_at = self
			.instances
			.current(&self.lease_key)
			.await?
			.filter(|lease| lease.is_live_at(now))
			.map(|lease| lease.expires_at);

		Ok(lease_at.map_or(ledger_at, |at| at.max(ledger_at)))
	}

	/// Asks the gate for permission to refresh.
	///
	/// A granted lease must be handed back through [`TokenRefreshCoordinator::release`]; if the
	/// holder disappears instead, the lease TTL reclaims it.
	pub async fn try_acquire_refresh(&self) -> Result<RefreshGate> {
		let now = self.clock.now();

		if let Some(lease) =
			self.instances.current(&self.lease_key).await?.filter(|lease| lease.is_live_at(now))
		{
			return Ok(self.deny(
				RefreshDenialReason::LeaseHeld { holder: lease.holder.clone() },
				lease.remaining_at(now),
			));
		}
		if let Some((reason, retry_after)) = self.ledger().await?.denial_at(&self.config, now) {
			return Ok(self.deny(reason, retry_after));
		}

		let lease = match self.instances.acquire(&self.lease_key, self.config.lease_ttl).await? {
			LeaseAttempt::Acquired(lease) => lease,
			LeaseAttempt::Held(lease) =>
				return Ok(self.deny(
					RefreshDenialReason::LeaseHeld { holder: lease.holder.clone() },
					lease.remaining_at(self.clock.now()),
				)),
		};
		// Another instance may have finished a refresh between the precheck and the acquisition,
		// so the ledger is evaluated again while holding the lease.
		let started_at = self.clock.now();
		let mut denial = None;
		let recorded = self
			.instances
			.update(&self.ledger_key, |mut ledger: RefreshLedger| {
				ledger.prune(&self.config, started_at);
				denial = ledger.denial_at(&self.config, started_at);

				if denial.is_none() {
					ledger.attempts.push(started_at);
					ledger.last_started_at = Some(started_at);
					ledger.last_grant = Some(lease.token.clone());
				}

				ledger
			})
			.await;

		if let Err(e) = recorded {
			self.release_quietly(lease).await;

			return Err(e.into());
		}
		if let Some((reason, retry_after)) = denial {
			self.release_quietly(lease).await;

			return Ok(self.deny(reason, retry_after));
		}

		Ok(RefreshGate::Granted(TokenRefreshLease { lease }))
	}

	/// Extends an in-flight refresh lease by the configured TTL.
	///
	/// Returns `None` when the lease already lapsed.
	pub async fn renew(&self, lease: &TokenRefreshLease) -> Result<Option<TokenRefreshLease>> {
		let renewed = self.instances.renew(&lease.lease, self.config.lease_ttl).await?;

		Ok(renewed.map(|lease| TokenRefreshLease { lease }))
	}

	/// Hands the lease back, recording a successful refresh in the shared ledger first.
	///
	/// Returns `false` when a success could not be recorded because a later grant superseded
	/// this lease.
	pub async fn release(&self, lease: TokenRefreshLease, succeeded: bool) -> Result<bool> {
		let mut counted = !succeeded;
		let recorded = if succeeded {
			let done = self.clock.now();
			let token = lease.lease.token.as_str();

			self.instances
				.update(&self.ledger_key, |mut ledger: RefreshLedger| {
					counted = ledger.last_grant.as_deref() == Some(token);

					if counted {
						ledger.last_success_at = Some(done);
						ledger.successes += 1;
					}

					ledger
				})
				.await
				.map(|_| ())
		} else {
			Ok(())
		};
		let released = self.instances.release(lease.lease).await;

		recorded?;

		if !released? {
			obs::log_recovered(
				"refresh.release",
				&std::io::Error::other("refresh lease lapsed before it was released"),
			);
		}

		Ok(counted)
	}

	/// Refreshes the credential through the gate.
	///
	/// Concurrent local callers wait for each other; whoever comes second usually sees the
	/// first caller's success and is denied with [`RefreshDenialReason::MinInterval`].
	pub async fn refresh(&self) -> Result<AccessToken> {
		const KIND: OpKind = OpKind::Refresh;

		let span = CoordinatorSpan::new(KIND, "refresh");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);
		self.metrics.record_attempt();

		let result = span
			.instrument(async {
				let _singleflight = self.singleflight.lock().await;
				let lease = match self.try_acquire_refresh().await? {
					RefreshGate::Granted(lease) => lease,
					RefreshGate::Denied { reason, retry_after } =>
						return Err(Error::RefreshDenied { reason, retry_after }),
				};

				let (refreshed, lease) = self.hold_lease(lease, self.provider.refresh()).await;

				match refreshed {
					Ok(token) => {
						if self.release(lease, true).await? {
							self.metrics.record_success();
							self.events
								.publish(CoordinatorEvent::RefreshCompleted { succeeded: true });

							return Ok(token);
						}

						self.metrics.record_failure();
						self.events.publish(CoordinatorEvent::RefreshCompleted { succeeded: false });

						let retry_after = self
							.ledger()
							.await?
							.denial_at(&self.config, self.clock.now())
							.map_or(Duration::ZERO, |(_, wait)| wait);

						Err(Error::RefreshDenied {
							reason: RefreshDenialReason::Superseded,
							retry_after,
						})
					},
					Err(source) => {
						if let Err(e) = self.release(lease, false).await {
							obs::log_recovered("refresh.release", &e);
						}

						self.metrics.record_failure();
						self.events.publish(CoordinatorEvent::RefreshCompleted { succeeded: false });

						Err(Error::Credential { source })
					},
				}
			})
			.await;

		match &result {
			Ok(_) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Err(Error::RefreshDenied { .. }) => obs::record_op_outcome(KIND, OpOutcome::Denied),
			Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	/// Refreshes when the gate allows it, otherwise falls back to the current token.
	///
	/// The denial is returned only when the provider has no current token to reuse.
	pub async fn refresh_or_current(&self) -> Result<AccessToken> {
		match self.refresh().await {
			Err(Error::RefreshDenied { reason, retry_after }) => self
				.provider
				.current_token()
				.await
				.map_err(|source| Error::Credential { source })?
				.ok_or(Error::RefreshDenied { reason, retry_after }),
			result => result,
		}
	}

	// Drives `work` while renewing the lease every half TTL. A lapsed lease is left to the
	// ledger check in `release`.
	async fn hold_lease<T>(
		&self,
		mut lease: TokenRefreshLease,
		mut work: CredentialFuture<'_, T>,
	) -> (Result<T, BoxError>, TokenRefreshLease) {
		let period = clock::to_std(self.config.lease_ttl / 2).max(StdDuration::from_millis(1));
		let mut held = true;

		loop {
			tokio::select! {
				result = &mut work => return (result, lease),
				_ = tokio::time::sleep(period), if held => match self.renew(&lease).await {
					Ok(Some(renewed)) => lease = renewed,
					Ok(None) => {
						let lapsed = std::io::Error::other("refresh lease lapsed mid-refresh");

						held = false;

						obs::log_recovered("refresh.renew", &lapsed);
					},
					Err(e) => obs::log_recovered("refresh.renew", &e),
				},
			}
		}
	}

	fn deny(&self, reason: RefreshDenialReason, retry_after: Duration) -> RefreshGate {
		let retry_after = retry_after.max(Duration::ZERO);

		self.metrics.record_denied();
		self.events.publish(CoordinatorEvent::RefreshDenied {
			reason: reason.to_string(),
			retry_after,
		});

		RefreshGate::Denied { reason, retry_after }
	}

	async fn release_quietly(&self, lease: Lease) {
		if let Err(e) = self.instances.release(lease).await {
			obs::log_recovered("refresh.release", &e);
		}
	}
}
impl Debug for TokenRefreshCoordinator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenRefreshCoordinator")
			.field("config", &self.config)
			.field("credential", &self.credential)
			.field("instances", &self.instances)
			.field("metrics", &self.metrics)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	const T0: OffsetDateTime = time::macros::datetime!(2025-11-10 12:00 UTC);

	fn config() -> RefreshConfig {
		RefreshConfig::default()
			.with_min_interval(Duration::seconds(180))
			.with_quota(3, Duration::seconds(600))
	}

	#[test]
	fn min_interval_counts_from_the_last_success() {
		let ledger = RefreshLedger {
			last_success_at: Some(T0),
			last_started_at: Some(T0),
			last_grant: Some("grant".into()),
			attempts: vec![T0],
			successes: 1,
		};

		assert_eq!(
			ledger.denial_at(&config(), T0 + Duration::seconds(30)),
			Some((RefreshDenialReason::MinInterval, Duration::seconds(150)))
		);
		assert_eq!(ledger.denial_at(&config(), T0 + Duration::seconds(180)), None);
	}

	#[test]
	fn quota_waits_for_the_oldest_attempt_to_leave_the_window() {
		let ledger = RefreshLedger {
			attempts: vec![T0, T0 + Duration::seconds(100), T0 + Duration::seconds(200)],
			..Default::default()
		};
		let now = T0 + Duration::seconds(300);

		assert_eq!(
			ledger.denial_at(&config(), now),
			Some((RefreshDenialReason::QuotaExhausted, Duration::seconds(300)))
		);
		assert_eq!(ledger.denial_at(&config(), T0 + Duration::seconds(600)), None);
		assert_eq!(ledger.next_allowed_at(&config(), now), T0 + Duration::seconds(600));
	}

	#[test]
	fn next_allowed_chains_denials() {
		// Quota frees at T0+600 but the success at T0+500 holds the gate until T0+680.
		let ledger = RefreshLedger {
			last_success_at: Some(T0 + Duration::seconds(500)),
			attempts: vec![T0, T0 + Duration::seconds(100), T0 + Duration::seconds(500)],
			..Default::default()
		};

		assert_eq!(
			ledger.next_allowed_at(&config(), T0 + Duration::seconds(510)),
			T0 + Duration::seconds(680)
		);
	}

	#[test]
	fn denial_reasons_have_stable_labels() {
		let holder = InstanceId::new("instance-a").expect("Instance fixture should be valid.");

		assert_eq!(RefreshDenialReason::LeaseHeld { holder }.to_string(), "lease-held");
		assert_eq!(RefreshDenialReason::MinInterval.to_string(), "min-interval");
		assert_eq!(RefreshDenialReason::QuotaExhausted.to_string(), "quota-exhausted");
		assert_eq!(RefreshDenialReason::Superseded.to_string(), "superseded");
	}
}
