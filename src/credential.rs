//! Credential provider contract and the redacted token wrapper it returns.

// self
use crate::{_prelude::*, error::BoxError};

/// Boxed future returned by [`CredentialProvider`] methods.
pub type CredentialFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + 'a + Send>>;

/// Source of access tokens; the refresh mechanics behind it are opaque to the coordinator.
pub trait CredentialProvider
where
	Self: Send + Sync,
{
	/// Returns the token currently in use, if any.
	fn current_token(&self) -> CredentialFuture<'_, Option<AccessToken>>;

	/// Obtains a new token from the remote authority.
	///
	/// Only called through the refresh gate.
	fn refresh(&self) -> CredentialFuture<'_, AccessToken>;
}

/// Access token wrapper that keeps the secret out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken(String);
impl AccessToken {
	/// Wraps a token value.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the raw token. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for AccessToken {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for AccessToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("AccessToken").field(&"<redacted>").finish()
	}
}
impl Display for AccessToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}
