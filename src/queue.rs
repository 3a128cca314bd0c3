//! Priority queue for calls that were not admitted immediately.
//!
//! Ordering is strict priority descending, FIFO within equal priority. Only the head entry is
//! ever attempted, so lower priorities never overtake a waiting higher priority. Deferring the
//! head keeps its original sequence number, which preserves FIFO order across retries.

// std
use std::{
	cmp::Reverse,
	sync::atomic::{AtomicBool, Ordering},
};
// crates.io
use tokio::sync::Notify;
// self
use crate::_prelude::*;

/// Identifier of a queued entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle(u64);

/// Returned when the queue already holds its configured capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
#[error("Request queue is full ({capacity} entries).")]
pub struct QueueFull {
	/// Configured capacity.
	pub capacity: usize,
}

/// One deferred call.
#[derive(Debug)]
pub struct QueueEntry<T> {
	/// Entry handle.
	pub handle: QueueHandle,
	/// Caller priority, `0..=10`.
	pub priority: u8,
	/// Instant the entry joined the queue.
	pub enqueued_at: OffsetDateTime,
	/// Admission attempts made so far, including the one that queued it.
	pub retry_count: u32,
	/// Earliest instant the next admission attempt is worthwhile.
	pub ready_at: OffsetDateTime,
	/// The deferred operation, or whatever wakes it.
	pub payload: T,
}

type EntryKey = (Reverse<u8>, u64);

/// Ordered queue of deferred calls.
#[derive(Debug)]
pub struct PriorityRequestQueue<T> {
	entries: BTreeMap<EntryKey, QueueEntry<T>>,
	priorities: HashMap<QueueHandle, u8>,
	next_seq: u64,
	capacity: usize,
}
impl<T> PriorityRequestQueue<T> {
	/// Creates an empty queue bounded to `capacity` entries.
	pub fn new(capacity: usize) -> Self {
		Self { entries: BTreeMap::new(), priorities: HashMap::new(), next_seq: 0, capacity }
	}

	/// Adds a deferred call whose first admission attempt already failed.
	pub fn enqueue(
		&mut self,
		priority: u8,
		now: OffsetDateTime,
		ready_at: OffsetDateTime,
		payload: T,
	) -> Result<QueueHandle, QueueFull> {
		if self.entries.len() >= self.capacity {
			return Err(QueueFull { capacity: self.capacity });
		}

		let seq = self.next_seq;
		let handle = QueueHandle(seq);

		self.next_seq += 1;
		self.entries.insert(
			(Reverse(priority), seq),
			QueueEntry { handle, priority, enqueued_at: now, retry_count: 1, ready_at, payload },
		);
		self.priorities.insert(handle, priority);

		Ok(handle)
	}

	/// Removes an entry before it runs. Remaining entries keep their order.
	pub fn cancel(&mut self, handle: QueueHandle) -> Option<QueueEntry<T>> {
		let priority = self.priorities.remove(&handle)?;

		self.entries.remove(&(Reverse(priority), handle.0))
	}

	/// Highest-priority, earliest-enqueued entry.
	pub fn peek(&self) -> Option<&QueueEntry<T>> {
		self.entries.first_key_value().map(|(_, entry)| entry)
	}

	/// Removes and returns the head entry.
	pub fn pop(&mut self) -> Option<QueueEntry<T>> {
		let (_, entry) = self.entries.pop_first()?;

		self.priorities.remove(&entry.handle);

		Some(entry)
	}

	/// Records a failed attempt on the head entry and pushes its next attempt to `ready_at`.
	///
	/// Returns the head's updated retry count.
	pub fn defer_head(&mut self, ready_at: OffsetDateTime) -> Option<u32> {
		let mut head = self.entries.first_entry()?;
		let entry = head.get_mut();

		entry.retry_count = entry.retry_count.saturating_add(1);
		entry.ready_at = ready_at;

		Some(entry.retry_count)
	}

	/// Removes every entry enqueued at or before `cutoff`, in queue order.
	///
	/// Expiry is not limited to the head: a long-waiting low priority entry stuck behind fresh
	/// higher priorities still leaves once its wait bound passes.
	pub fn drain_expired(&mut self, cutoff: OffsetDateTime) -> Vec<QueueEntry<T>> {
		let keys = self
			.entries
			.iter()
			.filter(|(_, entry)| entry.enqueued_at <= cutoff)
			.map(|(key, _)| *key)
			.collect::<Vec<_>>();

		keys.into_iter()
			.filter_map(|key| {
				let entry = self.entries.remove(&key)?;

				self.priorities.remove(&entry.handle);

				Some(entry)
			})
			.collect()
	}

	/// Priority of the head entry.
	pub fn highest_priority(&self) -> Option<u8> {
		self.peek().map(|entry| entry.priority)
	}

	/// Returns `true` when `handle` is still queued.
	pub fn contains(&self, handle: QueueHandle) -> bool {
		self.priorities.contains_key(&handle)
	}

	/// Queue length broken down by priority.
	pub fn len_by_priority(&self) -> BTreeMap<u8, usize> {
		let mut counts = BTreeMap::new();

		for priority in self.priorities.values() {
			*counts.entry(*priority).or_insert(0) += 1;
		}

		counts
	}

	/// Number of queued entries.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Returns `true` when nothing is queued.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[derive(Debug, Default)]
struct CancelState {
	cancelled: AtomicBool,
	notify: Notify,
}

/// Caller-side cancellation for a call that may sit in the queue.
///
/// Cancelling removes a queued call without running it; a call that already started is
/// unaffected.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<CancelState>);
impl CancelHandle {
	/// Creates an untriggered handle.
	pub fn new() -> Self {
		Self::default()
	}

	/// Requests cancellation.
	pub fn cancel(&self) {
		self.0.cancelled.store(true, Ordering::SeqCst);
		self.0.notify.notify_waiters();
	}

	/// Returns `true` once [`CancelHandle::cancel`] was called.
	pub fn is_cancelled(&self) -> bool {
		self.0.cancelled.load(Ordering::SeqCst)
	}

	/// Resolves once the handle is cancelled.
	pub async fn cancelled(&self) {
		loop {
			let notified = self.0.notify.notified();

			if self.is_cancelled() {
				return;
			}

			notified.await;
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

	fn drain_order(queue: &mut PriorityRequestQueue<&'static str>) -> Vec<&'static str> {
		std::iter::from_fn(|| queue.pop().map(|entry| entry.payload)).collect()
	}

	#[test]
	fn strict_priority_then_fifo() {
		let mut queue = PriorityRequestQueue::new(16);

		for (priority, name) in [(3, "a"), (7, "b"), (3, "c"), (10, "d"), (7, "e"), (0, "f")] {
			queue.enqueue(priority, T0, T0, name).expect("Queue has room.");
		}

		assert_eq!(queue.highest_priority(), Some(10));
		assert_eq!(drain_order(&mut queue), ["d", "b", "e", "a", "c", "f"]);
	}

	#[test]
	fn cancel_removes_without_disturbing_order() {
		let mut queue = PriorityRequestQueue::new(16);
		let _a = queue.enqueue(5, T0, T0, "a").expect("Queue has room.");
		let b = queue.enqueue(5, T0, T0, "b").expect("Queue has room.");
		let _c = queue.enqueue(5, T0, T0, "c").expect("Queue has room.");

		assert_eq!(queue.cancel(b).map(|entry| entry.payload), Some("b"));
		assert!(queue.cancel(b).is_none(), "Cancelling twice is a no-op.");
		assert!(!queue.contains(b));
		assert_eq!(drain_order(&mut queue), ["a", "c"]);
	}

	#[test]
	fn deferring_the_head_keeps_its_place() {
		let mut queue = PriorityRequestQueue::new(16);

		queue.enqueue(5, T0, T0, "a").expect("Queue has room.");
		queue.enqueue(5, T0, T0, "b").expect("Queue has room.");

		assert_eq!(queue.defer_head(T0 + Duration::seconds(5)), Some(2));

		let head = queue.peek().expect("Queue is not empty.");

		assert_eq!(head.payload, "a");
		assert_eq!(head.ready_at, T0 + Duration::seconds(5));
	}

	#[test]
	fn expired_entries_leave_from_anywhere_in_the_queue() {
		let mut queue = PriorityRequestQueue::new(16);
		let cutoff = T0 + Duration::seconds(50);

		queue.enqueue(9, T0 + Duration::seconds(100), T0, "fresh-high").expect("Queue has room.");
		queue.enqueue(1, T0, T0, "stale-low").expect("Queue has room.");
		queue.enqueue(5, cutoff, T0, "boundary").expect("Queue has room.");
		queue.enqueue(1, T0 + Duration::seconds(60), T0, "fresh-low").expect("Queue has room.");

		let expired = queue.drain_expired(cutoff);

		assert_eq!(
			expired.iter().map(|entry| entry.payload).collect::<Vec<_>>(),
			["boundary", "stale-low"]
		);
		assert!(expired.iter().all(|entry| !queue.contains(entry.handle)));
		assert_eq!(queue.len_by_priority(), BTreeMap::from([(1, 1), (9, 1)]));
		assert_eq!(drain_order(&mut queue), ["fresh-high", "fresh-low"]);
		assert!(queue.drain_expired(cutoff).is_empty());
	}

	#[test]
	fn capacity_is_enforced_and_counts_are_grouped() {
		let mut queue = PriorityRequestQueue::new(3);

		queue.enqueue(1, T0, T0, "a").expect("Queue has room.");
		queue.enqueue(1, T0, T0, "b").expect("Queue has room.");
		queue.enqueue(9, T0, T0, "c").expect("Queue has room.");

		assert_eq!(queue.enqueue(9, T0, T0, "d"), Err(QueueFull { capacity: 3 }));
		assert_eq!(queue.len_by_priority(), BTreeMap::from([(1, 2), (9, 1)]));
		assert_eq!(queue.len(), 3);
	}

	#[tokio::test]
	async fn cancel_handle_wakes_waiters() {
		let handle = CancelHandle::new();
		let waiter = handle.clone();
		let task = tokio::spawn(async move { waiter.cancelled().await });

		tokio::task::yield_now().await;
		handle.cancel();
		task.await.expect("Waiter task should finish once cancelled.");

		assert!(handle.is_cancelled());
	}
}
