//! Admission control for quota-bound remote services: multi-window throttling, adaptive
//! capacity, circuit breaking, priority queueing, and lease-guarded credential refreshes.

#![deny(clippy::all, missing_docs)]
#![cfg_attr(not(test), deny(unused_crate_dependencies))]

pub mod circuit;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod credential;
pub mod error;
pub mod history;
pub mod ident;
pub mod instance;
pub mod obs;
pub mod queue;
pub mod refresh;
pub mod store;
pub mod throttle;
pub mod window;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::{
		collections::VecDeque,
		sync::atomic::{AtomicUsize, Ordering},
	};
	// self
	use crate::{
		clock::{Clock, ManualClock},
		config::CoordinatorConfig,
		coordinator::Coordinator,
		credential::{AccessToken, CredentialFuture, CredentialProvider},
		error::BoxError,
		ident::{CredentialId, InstanceId},
		instance::InstanceCoordinator,
		refresh::TokenRefreshCoordinator,
		store::{LeaseStore, MemoryLeaseStore},
	};

	/// Fixed instant every manual clock fixture starts from.
	pub const TEST_EPOCH: OffsetDateTime = time::macros::datetime!(2025-11-10 12:00 UTC);

	/// Creates a manual clock pinned at [`TEST_EPOCH`].
	pub fn test_clock() -> Arc<ManualClock> {
		Arc::new(ManualClock::new(TEST_EPOCH))
	}

	/// Builds a coordinator over the provided config and manual clock.
	pub fn build_test_coordinator(
		config: CoordinatorConfig,
		clock: Arc<ManualClock>,
	) -> Coordinator {
		let clock: Arc<dyn Clock> = clock;

		Coordinator::with_clock(config, clock)
			.expect("Coordinator fixture config should pass validation.")
	}

	/// Credential provider that hands out `token-N` values and can be scripted to fail.
	#[derive(Debug, Default)]
	pub struct ScriptedCredentialProvider {
		refreshes: AtomicUsize,
		failures: Mutex<VecDeque<String>>,
		current: Mutex<Option<AccessToken>>,
	}
	impl ScriptedCredentialProvider {
		/// Creates a provider whose current token is `token-0`.
		pub fn new() -> Self {
			Self { current: Mutex::new(Some(AccessToken::new("token-0"))), ..Default::default() }
		}

		/// Queues a failure message for the next refresh call.
		pub fn fail_next(&self, message: impl Into<String>) {
			self.failures.lock().push_back(message.into());
		}

		/// Returns how many times `refresh` reached the provider.
		pub fn refresh_calls(&self) -> usize {
			self.refreshes.load(Ordering::SeqCst)
		}
	}
	impl CredentialProvider for ScriptedCredentialProvider {
		fn current_token(&self) -> CredentialFuture<'_, Option<AccessToken>> {
			let token = self.current.lock().clone();

			Box::pin(async move { Ok(token) })
		}

		fn refresh(&self) -> CredentialFuture<'_, AccessToken> {
			let call = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
			let failure = self.failures.lock().pop_front();
			let result: Result<AccessToken, BoxError> = match failure {
				Some(message) => Err(std::io::Error::other(message).into()),
				None => {
					let token = AccessToken::new(format!("token-{call}"));

					*self.current.lock() = Some(token.clone());

					Ok(token)
				},
			};

			Box::pin(async move { result })
		}
	}

	/// Builds a refresh coordinator bound to a shared lease store, as one instance of a cluster.
	pub fn build_test_refresh_coordinator(
		config: CoordinatorConfig,
		clock: Arc<ManualClock>,
		store: Arc<MemoryLeaseStore>,
		provider: Arc<ScriptedCredentialProvider>,
		instance: &str,
	) -> TokenRefreshCoordinator {
		let clock: Arc<dyn Clock> = clock;
		let store: Arc<dyn LeaseStore> = store;
		let instance = InstanceId::new(instance).expect("Instance fixture should be valid.");
		let credential =
			CredentialId::new("tenant-credential").expect("Credential fixture should be valid.");
		let instances = InstanceCoordinator::new(store, instance, clock.clone());

		TokenRefreshCoordinator::new(config.refresh, credential, instances, provider, clock)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};

	pub use crate::error::{Error, Result};
}

