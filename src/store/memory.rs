//! Thread-safe in-memory [`LeaseStore`] for single-instance deployments and tests.

// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	store::{CompareAndSetOutcome, LeaseStore, StoreFuture},
};

#[derive(Clone, Debug)]
struct StoredValue {
	value: String,
	expires_at: Option<OffsetDateTime>,
}
impl StoredValue {
	fn is_live(&self, now: OffsetDateTime) -> bool {
		self.expires_at.is_none_or(|at| now < at)
	}
}

type StoreMap = Arc<RwLock<HashMap<String, StoredValue>>>;

/// In-process store with the same compare-and-set and expiry semantics as a shared backend.
///
/// Clones share the same map, so handing a clone to each simulated instance models a cluster.
#[derive(Clone)]
pub struct MemoryLeaseStore {
	map: StoreMap,
	clock: Arc<dyn Clock>,
}
impl MemoryLeaseStore {
	/// Creates an empty store whose expiries follow `clock`.
	pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
		Self { map: Default::default(), clock }
	}

	/// Drops every expired key and returns how many were removed.
	pub fn purge_expired(&self) -> usize {
		let now = self.clock.now();
		let mut guard = self.map.write();
		let before = guard.len();

		guard.retain(|_, stored| stored.is_live(now));

		before - guard.len()
	}

	fn get_now(map: &StoreMap, key: &str, now: OffsetDateTime) -> Option<String> {
		map.read().get(key).filter(|stored| stored.is_live(now)).map(|stored| stored.value.clone())
	}

	fn cas_now(
		map: &StoreMap,
		key: &str,
		expected: Option<&str>,
		value: Option<String>,
		ttl: Option<Duration>,
		now: OffsetDateTime,
	) -> CompareAndSetOutcome {
		let mut guard = map.write();
		let current =
			guard.get(key).filter(|stored| stored.is_live(now)).map(|stored| stored.value.as_str());

		if current != expected {
			return CompareAndSetOutcome::Mismatch;
		}

		match value {
			Some(value) => {
				guard.insert(key.to_owned(), StoredValue { value, expires_at: ttl.map(|ttl| now + ttl) });
			},
			None => {
				guard.remove(key);
			},
		}

		CompareAndSetOutcome::Updated
	}
}
impl Default for MemoryLeaseStore {
	fn default() -> Self {
		Self::with_clock(Arc::new(SystemClock))
	}
}
impl Debug for MemoryLeaseStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("MemoryLeaseStore").field("keys", &self.map.read().len()).finish()
	}
}
impl LeaseStore for MemoryLeaseStore {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		let now = self.clock.now();

		Box::pin(async move { Ok(Self::get_now(&self.map, key, now)) })
	}

	fn compare_and_set_with_ttl<'a>(
		&'a self,
		key: &'a str,
		expected: Option<&'a str>,
		value: Option<String>,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSetOutcome> {
		let now = self.clock.now();

		Box::pin(async move { Ok(Self::cas_now(&self.map, key, expected, value, ttl, now)) })
	}
}
