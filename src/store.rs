//! Compare-and-set store contract shared by coordinator instances, plus the in-process backend.

pub mod memory;

pub use memory::MemoryLeaseStore;

// self
use crate::_prelude::*;

/// Boxed future returned by [`LeaseStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Key-value store with atomic compare-and-set and per-key expiry.
///
/// Expired keys must read as absent, both through [`LeaseStore::get`] and as the
/// `expected` side of a compare-and-set.
pub trait LeaseStore
where
	Self: Send + Sync,
{
	/// Reads the live value stored under `key`.
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

	/// Replaces the value under `key` when the live value equals `expected`.
	///
	/// `expected = None` requires the key to be absent or expired. `value = None` deletes the key.
	/// `ttl = None` stores the value without expiry.
	fn compare_and_set_with_ttl<'a>(
		&'a self,
		key: &'a str,
		expected: Option<&'a str>,
		value: Option<String>,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSetOutcome>;
}

/// Result of a compare-and-set attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareAndSetOutcome {
	/// The expected value matched and the write was applied.
	Updated,
	/// Another writer changed the key first; nothing was written.
	Mismatch,
}
impl CompareAndSetOutcome {
	/// Returns `true` when the write was applied.
	pub fn is_updated(self) -> bool {
		matches!(self, Self::Updated)
	}
}

/// Error type produced by [`LeaseStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Stored payload could not be encoded or decoded.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// Optimistic updates kept losing races against other writers.
	#[error("Compare-and-set on `{key}` did not converge after {attempts} attempts.")]
	Contended {
		/// Contended key.
		key: String,
		/// Attempts made before giving up.
		attempts: u32,
	},
}
impl From<serde_json::Error> for StoreError {
	fn from(err: serde_json::Error) -> Self {
		Self::Serialization { message: err.to_string() }
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::error::Error as StdError;
	// self
	use super::*;

	#[test]
	fn store_error_converts_into_coordinator_error_with_source() {
		let store_error = StoreError::Backend { message: "redis unreachable".into() };
		let error: Error = store_error.clone().into();

		assert!(matches!(error, Error::Storage(_)));
		assert!(error.to_string().contains("redis unreachable"));
		assert!(error.is_retryable());

		let source = StdError::source(&error)
			.expect("Coordinator error should expose the original store error as its source.");

		assert_eq!(source.to_string(), store_error.to_string());
	}

	#[test]
	fn json_failures_map_to_serialization_errors() {
		let err = serde_json::from_str::<u32>("not-json")
			.expect_err("Invalid JSON fixture should fail to parse.");

		assert!(matches!(StoreError::from(err), StoreError::Serialization { .. }));
	}
}
