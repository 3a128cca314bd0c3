//! Coordinator-level error types shared across admission, queueing, and refresh gates.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error used wherever a collaborator's concrete error type is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical coordinator error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Shared lease store failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Downstream call failed; adaptive state has already been updated.
	#[error(transparent)]
	Downstream(#[from] DownstreamError),

	/// Admission denied locally; wait the indicated duration and retry.
	#[error("Call throttled ({reason}); retry after {retry_after}.")]
	Throttled {
		/// Suggested wait before the next attempt.
		retry_after: Duration,
		/// Stable reason label (for example `window:primary` or `queue-full`).
		reason: String,
	},
	/// Downstream presumed unhealthy; calls fail fast until the cooldown elapses.
	#[error("Circuit is open; next trial allowed at {retry_at}.")]
	CircuitOpen {
		/// Instant at which a half-open trial becomes possible.
		retry_at: OffsetDateTime,
	},
	/// Credential refresh denied by the refresh gate.
	#[error("Credential refresh denied ({reason}); retry after {retry_after}.")]
	RefreshDenied {
		/// Why the gate refused the refresh.
		reason: crate::refresh::RefreshDenialReason,
		/// Suggested wait before the next refresh attempt.
		retry_after: Duration,
	},
	/// Queued call waited past its bound or exhausted its retries.
	#[error("Queued call timed out after {waited} and {attempts} admission attempts.")]
	QueueTimeout {
		/// Total time spent queued.
		waited: Duration,
		/// Number of admission attempts made while queued.
		attempts: u32,
	},
	/// Queued call was cancelled before it ran.
	#[error("Queued call was cancelled.")]
	Cancelled,
	/// Credential provider failed to produce a token.
	#[error("Credential provider failed.")]
	Credential {
		/// Provider-specific failure.
		#[source]
		source: BoxError,
	},
}
impl Error {
	/// Returns the wait hint carried by the error, when one applies.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Throttled { retry_after, .. } | Self::RefreshDenied { retry_after, .. } =>
				Some(*retry_after),
			Self::Downstream(err) => err.retry_after,
			_ => None,
		}
	}

	/// Returns `true` when a later retry of the same call may succeed.
	///
	/// Queue timeouts, cancellations, and configuration errors are terminal for the call.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Throttled { .. }
			| Self::CircuitOpen { .. }
			| Self::RefreshDenied { .. }
			| Self::Storage(_)
			| Self::Credential { .. } => true,
			Self::Downstream(err) => err.rate_limited,
			Self::Config(_) | Self::QueueTimeout { .. } | Self::Cancelled => false,
		}
	}
}

/// Failure reported by the downstream invoker, annotated for capacity feedback.
#[derive(Debug, ThisError)]
#[error("Downstream call failed (rate_limited = {rate_limited}).")]
pub struct DownstreamError {
	/// Whether the failure was shaped like a quota rejection.
	pub rate_limited: bool,
	/// Retry hint supplied by the remote service, if any.
	pub retry_after: Option<Duration>,
	/// Invoker-specific failure; callers may downcast it.
	#[source]
	pub source: BoxError,
}
impl DownstreamError {
	/// Wraps an invoker failure, copying its classification.
	pub fn classify<E>(err: E) -> Self
	where
		E: 'static + DownstreamFailure,
	{
		Self {
			rate_limited: err.is_rate_limited(),
			retry_after: err.retry_after(),
			source: Box::new(err),
		}
	}
}

/// Classification contract for errors returned by the downstream invoker.
///
/// The defaults treat every error as a plain failure without a retry hint.
pub trait DownstreamFailure
where
	Self: StdError + Send + Sync,
{
	/// Returns `true` when the remote service rejected the call for quota reasons.
	fn is_rate_limited(&self) -> bool {
		false
	}

	/// Retry hint (for example a `Retry-After` header) supplied by the remote service.
	fn retry_after(&self) -> Option<Duration> {
		None
	}
}
impl DownstreamFailure for std::io::Error {}

/// Configuration and validation failures raised by the coordinator.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Configuration document could not be parsed.
	#[error("Configuration is malformed at `{path}`.")]
	Parse {
		/// Field path where parsing failed.
		path: String,
		/// Underlying parser failure.
		#[source]
		source: serde_json::Error,
	},
	/// No rate windows were configured.
	#[error("At least one rate window must be configured.")]
	NoWindows,
	/// A rate window has a zero size or zero budget.
	#[error("Rate window `{name}` must have a positive size and max count.")]
	EmptyWindow {
		/// Window name.
		name: String,
	},
	/// Two rate windows share a name.
	#[error("Rate window `{name}` is configured more than once.")]
	DuplicateWindow {
		/// Window name.
		name: String,
	},
	/// A ratio fell outside its permitted range.
	#[error("The {field} value {value} is outside {range}.")]
	OutOfRange {
		/// Configuration field label.
		field: &'static str,
		/// Offending value.
		value: f64,
		/// Human-readable permitted range.
		range: &'static str,
	},
	/// A duration that must be positive was zero or negative.
	#[error("The {field} duration must be positive.")]
	NonPositiveDuration {
		/// Configuration field label.
		field: &'static str,
	},
	/// An upper bound was configured below the value it caps.
	#[error("The {field} duration must not be shorter than {floor}.")]
	BoundBelowFloor {
		/// Configuration field label of the upper bound.
		field: &'static str,
		/// Configuration field label of the value it caps.
		floor: &'static str,
	},
	/// A count that must be positive was zero.
	#[error("The {field} count must be positive.")]
	ZeroCount {
		/// Configuration field label.
		field: &'static str,
	},
	/// A credential refresh was requested from a coordinator built without a refresh gate.
	#[error("No credential refresh gate is configured.")]
	MissingRefreshGate,
	/// Priority outside the supported range.
	#[error("Priority {priority} exceeds the maximum of {max}.")]
	InvalidPriority {
		/// Supplied priority.
		priority: u8,
		/// Maximum supported priority.
		max: u8,
	},
}
