//! Append-only, time-pruned log of call attempts and their outcomes.
//!
//! Attempts that reached (or are about to reach) the downstream service live in one deque
//! ordered by timestamp, so trailing-window counts are a binary search. Locally throttled
//! admissions are kept in a separate deque because they never consume downstream quota.

// std
use std::collections::VecDeque;
// self
use crate::{_prelude::*, ident::OperationTag};

/// Sequential identifier of a stored [`RequestRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

/// Outcome of a recorded attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordOutcome {
	/// Admitted; the downstream call has not resolved yet.
	Pending,
	/// Downstream call succeeded.
	Success,
	/// Downstream call failed for a reason other than quota.
	Failure,
	/// Downstream rejected the call for quota reasons.
	RateLimited,
}
impl RecordOutcome {
	/// Returns a stable label suitable for status output.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Success => "success",
			Self::Failure => "failure",
			Self::RateLimited => "rate_limited",
		}
	}
}
impl Display for RecordOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// One admitted call attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
	/// Record identifier used to resolve the outcome later.
	pub id: RecordId,
	/// Admission instant.
	pub timestamp: OffsetDateTime,
	/// Endpoint or operation label.
	pub operation: OperationTag,
	/// Time from admission to resolution; `None` while pending.
	pub duration: Option<Duration>,
	/// Current outcome.
	pub outcome: RecordOutcome,
}

/// Soft-state history of attempts, bounded by age and by a hard record cap.
#[derive(Clone, Debug)]
pub struct RequestHistory {
	records: VecDeque<RequestRecord>,
	throttled: VecDeque<OffsetDateTime>,
	next_id: u64,
	retention: Duration,
	max_records: usize,
}
impl RequestHistory {
	/// Creates a history that keeps records for `retention` and at most `max_records` of them.
	pub fn new(retention: Duration, max_records: usize) -> Self {
		Self {
			records: VecDeque::new(),
			throttled: VecDeque::new(),
			next_id: 0,
			retention,
			max_records: max_records.max(1),
		}
	}

	/// Appends a pending attempt and returns its identifier.
	pub fn record_attempt(&mut self, now: OffsetDateTime, operation: OperationTag) -> RecordId {
		let timestamp = self.monotonic(now);
		let id = RecordId(self.next_id);

		self.next_id += 1;
		self.records.push_back(RequestRecord {
			id,
			timestamp,
			operation,
			duration: None,
			outcome: RecordOutcome::Pending,
		});
		self.prune(now);

		id
	}

	/// Logs a locally throttled admission.
	pub fn record_throttled(&mut self, now: OffsetDateTime) {
		let timestamp = self.throttled.back().map_or(now, |last| now.max(*last));

		self.throttled.push_back(timestamp);
		self.prune(now);
	}

	/// Resolves a pending record. Returns `false` when the record was already pruned.
	pub fn resolve(&mut self, id: RecordId, outcome: RecordOutcome, now: OffsetDateTime) -> bool {
		let Some(record) = self.get_mut(id) else {
			return false;
		};

		record.outcome = outcome;
		record.duration = Some((now - record.timestamp).max(Duration::ZERO));

		true
	}

	/// Returns the record with the provided identifier, if still stored.
	pub fn get(&self, id: RecordId) -> Option<&RequestRecord> {
		let front = self.records.front()?.id.0;
		let idx = usize::try_from(id.0.checked_sub(front)?).ok()?;

		self.records.get(idx)
	}

	/// Counts attempts within `(now - window, now]`, optionally restricted to one outcome.
	pub fn count_since(
		&self,
		now: OffsetDateTime,
		window: Duration,
		outcome: Option<RecordOutcome>,
	) -> usize {
		let start = self.window_start(now, window);

		match outcome {
			None => self.records.len() - start,
			Some(outcome) => self.records.range(start..).filter(|r| r.outcome == outcome).count(),
		}
	}

	/// Counts attempts within the window that carry the provided operation tag.
	pub fn count_for_tag(&self, now: OffsetDateTime, window: Duration, tag: &OperationTag) -> usize {
		let start = self.window_start(now, window);

		self.records.range(start..).filter(|r| &r.operation == tag).count()
	}

	/// Timestamp of the `nth` oldest attempt (zero-based) inside the window.
	pub fn nth_in_window(
		&self,
		now: OffsetDateTime,
		window: Duration,
		nth: usize,
	) -> Option<OffsetDateTime> {
		let start = self.window_start(now, window);

		self.records.get(start + nth).map(|r| r.timestamp)
	}

	/// Counts throttled admissions within the window.
	pub fn throttled_since(&self, now: OffsetDateTime, window: Duration) -> usize {
		let cutoff = now - window;

		self.throttled.len() - self.throttled.partition_point(|ts| *ts <= cutoff)
	}

	/// Number of stored attempts.
	pub fn len(&self) -> usize {
		self.records.len()
	}

	/// Returns `true` when no attempts are stored.
	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	fn window_start(&self, now: OffsetDateTime, window: Duration) -> usize {
		let cutoff = now - window;

		self.records.partition_point(|r| r.timestamp <= cutoff)
	}

	fn get_mut(&mut self, id: RecordId) -> Option<&mut RequestRecord> {
		let front = self.records.front()?.id.0;
		let idx = usize::try_from(id.0.checked_sub(front)?).ok()?;

		self.records.get_mut(idx)
	}

	// Wall clocks can step backwards; keep the deque sorted so window lookups stay valid.
	fn monotonic(&self, now: OffsetDateTime) -> OffsetDateTime {
		self.records.back().map_or(now, |last| now.max(last.timestamp))
	}

	fn prune(&mut self, now: OffsetDateTime) {
		let cutoff = now - self.retention;

		while self.records.front().is_some_and(|r| r.timestamp <= cutoff) {
			self.records.pop_front();
		}
		while self.records.len() > self.max_records {
			self.records.pop_front();
		}
		while self.throttled.front().is_some_and(|ts| *ts <= cutoff) {
			self.throttled.pop_front();
		}
		while self.throttled.len() > self.max_records {
			self.throttled.pop_front();
		}
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros::datetime;
	// self
	use super::*;

	const T0: OffsetDateTime = datetime!(2025-11-10 12:00 UTC);

	fn tag(value: &str) -> OperationTag {
		OperationTag::new(value).expect("Operation tag fixture should be valid.")
	}

	#[test]
	fn counts_respect_half_open_window() {
		let mut history = RequestHistory::new(Duration::seconds(900), 100);

		history.record_attempt(T0, tag("a"));
		history.record_attempt(T0 + Duration::seconds(30), tag("a"));

		assert_eq!(history.count_since(T0 + Duration::seconds(30), Duration::seconds(60), None), 2);
		// The first attempt leaves the window exactly one window length later.
		assert_eq!(history.count_since(T0 + Duration::seconds(60), Duration::seconds(60), None), 1);
		assert_eq!(
			history.nth_in_window(T0 + Duration::seconds(60), Duration::seconds(60), 0),
			Some(T0 + Duration::seconds(30))
		);
	}

	#[test]
	fn resolve_updates_outcome_and_duration() {
		let mut history = RequestHistory::new(Duration::seconds(60), 100);
		let id = history.record_attempt(T0, tag("a"));

		assert!(history.resolve(id, RecordOutcome::RateLimited, T0 + Duration::seconds(2)));

		let record = history.get(id).expect("Resolved record should still be stored.");

		assert_eq!(record.outcome, RecordOutcome::RateLimited);
		assert_eq!(record.duration, Some(Duration::seconds(2)));
		assert_eq!(
			history.count_since(T0, Duration::seconds(60), Some(RecordOutcome::RateLimited)),
			1
		);
		assert_eq!(history.count_since(T0, Duration::seconds(60), Some(RecordOutcome::Success)), 0);
	}

	#[test]
	fn prunes_by_age_and_cap() {
		let mut history = RequestHistory::new(Duration::seconds(60), 3);
		let first = history.record_attempt(T0, tag("a"));

		history.record_attempt(T0 + Duration::seconds(61), tag("a"));

		assert_eq!(history.len(), 1, "Records older than the retention horizon are dropped on write.");
		assert!(!history.resolve(first, RecordOutcome::Success, T0 + Duration::seconds(61)));

		for offset in 62..66 {
			history.record_attempt(T0 + Duration::seconds(offset), tag("a"));
		}

		assert_eq!(history.len(), 3);
		assert_eq!(
			history.nth_in_window(T0 + Duration::seconds(66), Duration::seconds(60), 0),
			Some(T0 + Duration::seconds(63))
		);
	}

	#[test]
	fn throttled_admissions_are_counted_separately() {
		let mut history = RequestHistory::new(Duration::seconds(60), 100);

		history.record_throttled(T0);
		history.record_throttled(T0);
		history.record_attempt(T0, tag("a"));

		assert_eq!(history.count_since(T0, Duration::seconds(60), None), 1);
		assert_eq!(history.throttled_since(T0, Duration::seconds(60)), 2);
	}

	#[test]
	fn backwards_clock_steps_keep_order() {
		let mut history = RequestHistory::new(Duration::seconds(60), 100);

		history.record_attempt(T0 + Duration::seconds(5), tag("a"));
		history.record_attempt(T0, tag("b"));

		assert_eq!(history.count_since(T0 + Duration::seconds(5), Duration::seconds(1), None), 2);
		assert_eq!(history.count_for_tag(T0 + Duration::seconds(5), Duration::seconds(60), &tag("b")), 1);
	}
}
