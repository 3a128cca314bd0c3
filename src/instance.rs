//! Cross-instance leases and shared records over any [`LeaseStore`].
//!
//! A lease is a JSON document stored under its key with the store's TTL; the store's expiry is
//! what reclaims a lease whose holder crashed. Shared records are JSON documents updated through
//! optimistic compare-and-set loops, so every instance sees a single consistent history.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	ident::InstanceId,
	store::{LeaseStore, StoreError},
};

const MAX_CAS_RETRIES: u32 = 100;
const LEASE_TOKEN_BYTES: usize = 16;

/// Time-bounded exclusive claim on a shared key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	/// Store key the lease occupies.
	pub key: String,
	/// Instance holding the lease.
	pub holder: InstanceId,
	/// Random token distinguishing this acquisition from earlier ones by the same holder.
	pub token: String,
	/// Instant the lease was acquired.
	pub acquired_at: OffsetDateTime,
	/// Instant the lease lapses unless renewed.
	pub expires_at: OffsetDateTime,
}
impl Lease {
	/// Returns `true` while the lease has not lapsed.
	pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
		now < self.expires_at
	}

	/// Remaining lifetime at `now`, clamped at zero.
	pub fn remaining_at(&self, now: OffsetDateTime) -> Duration {
		(self.expires_at - now).max(Duration::ZERO)
	}
}

/// Result of a lease acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAttempt {
	/// The caller now holds the lease.
	Acquired(Lease),
	/// Another holder's live lease occupies the key.
	Held(Lease),
}

/// Gives one process a consistent view of leases and records shared with other processes.
#[derive(Clone)]
pub struct InstanceCoordinator {
	store: Arc<dyn LeaseStore>,
	instance: InstanceId,
	clock: Arc<dyn Clock>,
}
impl InstanceCoordinator {
	/// Binds this process, identified by `instance`, to a shared store.
	pub fn new(store: Arc<dyn LeaseStore>, instance: InstanceId, clock: Arc<dyn Clock>) -> Self {
		Self { store, instance, clock }
	}

	/// Identifier of this process.
	pub fn instance_id(&self) -> &InstanceId {
		&self.instance
	}

	/// Clock used to stamp leases.
	pub fn clock(&self) -> &Arc<dyn Clock> {
		&self.clock
	}

	/// Returns the live lease stored under `key`, if any.
	pub async fn current(&self, key: &str) -> Result<Option<Lease>, StoreError> {
		Ok(self.read_raw::<Lease>(key).await?.map(|(lease, _)| lease))
	}

	/// Attempts to take the lease on `key` for `ttl`.
	pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LeaseAttempt, StoreError> {
		for _ in 0..MAX_CAS_RETRIES {
			let existing = self.read_raw::<Lease>(key).await?;
			let now = self.clock.now();
			let expected = match &existing {
				Some((lease, _)) if lease.is_live_at(now) =>
					return Ok(LeaseAttempt::Held(lease.clone())),
				Some((_, raw)) => Some(raw.as_str()),
				None => None,
			};
			let lease = Lease {
				key: key.to_owned(),
				holder: self.instance.clone(),
				token: lease_token(),
				acquired_at: now,
				expires_at: now + ttl,
			};
			let payload = serde_json::to_string(&lease)?;

			if self
				.store
				.compare_and_set_with_ttl(key, expected, Some(payload), Some(ttl))
				.await?
				.is_updated()
			{
				return Ok(LeaseAttempt::Acquired(lease));
			}
		}

		Err(StoreError::Contended { key: key.to_owned(), attempts: MAX_CAS_RETRIES })
	}

	/// Extends a held lease to `now + ttl`.
	///
	/// Returns `None` when the lease lapsed or was taken over; the caller no longer holds it.
	pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, StoreError> {
		let Some((current, raw)) = self.read_raw::<Lease>(&lease.key).await? else {
			return Ok(None);
		};

		if current != *lease {
			return Ok(None);
		}

		let now = self.clock.now();
		let renewed = Lease { expires_at: now + ttl, ..current };
		let payload = serde_json::to_string(&renewed)?;
		let outcome = self
			.store
			.compare_and_set_with_ttl(&lease.key, Some(&raw), Some(payload), Some(ttl))
			.await?;

		Ok(outcome.is_updated().then_some(renewed))
	}

	/// Releases a held lease. Returns `false` when it had already lapsed or been taken over.
	pub async fn release(&self, lease: Lease) -> Result<bool, StoreError> {
		let Some((current, raw)) = self.read_raw::<Lease>(&lease.key).await? else {
			return Ok(false);
		};

		if current != lease {
			return Ok(false);
		}

		Ok(self.store.compare_and_set_with_ttl(&lease.key, Some(&raw), None, None).await?.is_updated())
	}

	/// Reads the shared record stored under `key`.
	pub async fn read<T>(&self, key: &str) -> Result<Option<T>, StoreError>
	where
		T: DeserializeOwned,
	{
		Ok(self.read_raw(key).await?.map(|(record, _)| record))
	}

	/// Applies `f` to the shared record under `key` until the write wins its compare-and-set.
	///
	/// `f` may run several times under contention and must be free of side effects.
	pub async fn update<T, F>(&self, key: &str, mut f: F) -> Result<T, StoreError>
	where
		T: Default + Serialize + DeserializeOwned,
		F: FnMut(T) -> T,
	{
		for _ in 0..MAX_CAS_RETRIES {
			let existing = self.read_raw::<T>(key).await?;
			let (record, expected) = match existing {
				Some((record, raw)) => (record, Some(raw)),
				None => (T::default(), None),
			};
			let updated = f(record);
			let payload = serde_json::to_string(&updated)?;

			if self
				.store
				.compare_and_set_with_ttl(key, expected.as_deref(), Some(payload), None)
				.await?
				.is_updated()
			{
				return Ok(updated);
			}
		}

		Err(StoreError::Contended { key: key.to_owned(), attempts: MAX_CAS_RETRIES })
	}

	async fn read_raw<T>(&self, key: &str) -> Result<Option<(T, String)>, StoreError>
	where
		T: DeserializeOwned,
	{
		match self.store.get(key).await? {
			Some(raw) => Ok(Some((serde_json::from_str(&raw)?, raw))),
			None => Ok(None),
		}
	}
}
impl Debug for InstanceCoordinator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("InstanceCoordinator").field("instance", &self.instance).finish()
	}
}

fn lease_token() -> String {
	let mut bytes = [0_u8; LEASE_TOKEN_BYTES];

	rand::rng().fill_bytes(&mut bytes);

	URL_SAFE_NO_PAD.encode(bytes)
}
