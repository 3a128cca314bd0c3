//! Time sources injected into every time-dependent component.

// self
use crate::_prelude::*;

/// Source of "now" for admission, circuit, queue, and lease decisions.
pub trait Clock
where
	Self: Send + Sync,
{
	/// Returns the current UTC instant.
	fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> OffsetDateTime {
		OffsetDateTime::now_utc()
	}
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock(Mutex<OffsetDateTime>);
impl ManualClock {
	/// Creates a clock pinned at `start`.
	pub fn new(start: OffsetDateTime) -> Self {
		Self(Mutex::new(start))
	}

	/// Moves the clock forward by `delta`.
	pub fn advance(&self, delta: Duration) {
		let mut now = self.0.lock();

		*now += delta;
	}

	/// Pins the clock at `instant`.
	pub fn set(&self, instant: OffsetDateTime) {
		*self.0.lock() = instant;
	}
}
impl Clock for ManualClock {
	fn now(&self) -> OffsetDateTime {
		*self.0.lock()
	}
}

/// Clock driven by the tokio timer, so paused-time runtimes advance it together with sleeps.
#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
	base_wall: OffsetDateTime,
	base: tokio::time::Instant,
}
impl TokioClock {
	/// Anchors `start` at the timer's current instant.
	pub fn new(start: OffsetDateTime) -> Self {
		Self { base_wall: start, base: tokio::time::Instant::now() }
	}
}
impl Default for TokioClock {
	fn default() -> Self {
		Self::new(OffsetDateTime::now_utc())
	}
}
impl Clock for TokioClock {
	fn now(&self) -> OffsetDateTime {
		let elapsed = Duration::try_from(self.base.elapsed()).unwrap_or(Duration::MAX);

		self.base_wall.saturating_add(elapsed)
	}
}

/// Converts a signed `time` duration into a std duration, clamping negatives to zero.
pub(crate) fn to_std(duration: Duration) -> std::time::Duration {
	std::time::Duration::try_from(duration).unwrap_or_default()
}
