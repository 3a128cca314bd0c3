//! Demonstrates three instances sharing one lease store: only one refresh reaches the provider
//! and the rest reuse its token until the minimum interval elapses.

// std
use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};
// crates.io
use color_eyre::Result;
use parking_lot::Mutex;
// self
use quota_broker::{
	clock::{Clock, SystemClock},
	config::CoordinatorConfig,
	coordinator::Coordinator,
	credential::{AccessToken, CredentialFuture, CredentialProvider},
	ident::{CredentialId, InstanceId},
	instance::InstanceCoordinator,
	refresh::TokenRefreshCoordinator,
	store::{LeaseStore, MemoryLeaseStore},
};

#[derive(Debug, Default)]
struct DemoAuthority {
	issued: AtomicUsize,
	current: Mutex<Option<AccessToken>>,
}
impl CredentialProvider for DemoAuthority {
	fn current_token(&self) -> CredentialFuture<'_, Option<AccessToken>> {
		let token = self.current.lock().clone();

		Box::pin(async move { Ok(token) })
	}

	fn refresh(&self) -> CredentialFuture<'_, AccessToken> {
		Box::pin(async move {
			let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
			let token = AccessToken::new(format!("demo-access-{serial}"));

			*self.current.lock() = Some(token.clone());

			Ok(token)
		})
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let clock: Arc<dyn Clock> = Arc::new(SystemClock);
	let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::with_clock(clock.clone()));
	let authority = Arc::new(DemoAuthority::default());
	let credential = CredentialId::new("demo-service-account")?;
	let mut coordinators = Vec::new();

	for _ in 0..3 {
		let config = CoordinatorConfig::default();
		let instances = InstanceCoordinator::new(store.clone(), InstanceId::generate(), clock.clone());
		let gate = TokenRefreshCoordinator::new(
			config.refresh.clone(),
			credential.clone(),
			instances,
			authority.clone(),
			clock.clone(),
		);

		coordinators.push(
			Coordinator::builder(config).clock(clock.clone()).refresh(gate).build()?,
		);
	}

	for coordinator in &coordinators {
		let token = coordinator.refresh_credential().await?;
		let status = coordinator.status().await?;

		println!(
			"Instance holds a token ({} issued so far); next refresh allowed at {:?}.",
			authority.issued.load(Ordering::SeqCst),
			status.next_allowed_refresh_at,
		);
		println!("Token: {token}.");
	}

	Ok(())
}
