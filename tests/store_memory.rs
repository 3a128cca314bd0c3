// self
use quota_broker::{
	_preludet::*,
	store::{CompareAndSetOutcome, LeaseStore, MemoryLeaseStore},
};

fn build_store() -> (Arc<quota_broker::clock::ManualClock>, MemoryLeaseStore) {
	let clock = test_clock();
	let store = MemoryLeaseStore::with_clock(clock.clone());

	(clock, store)
}

#[tokio::test]
async fn compare_and_set_creates_then_guards_values() {
	let (_, store) = build_store();

	assert_eq!(
		store
			.compare_and_set_with_ttl("k", None, Some("v1".into()), None)
			.await
			.expect("Initial insert should reach the store."),
		CompareAndSetOutcome::Updated
	);
	assert_eq!(
		store
			.compare_and_set_with_ttl("k", None, Some("v2".into()), None)
			.await
			.expect("Conflicting insert should reach the store."),
		CompareAndSetOutcome::Mismatch
	);
	assert_eq!(
		store
			.compare_and_set_with_ttl("k", Some("stale"), Some("v2".into()), None)
			.await
			.expect("Stale swap should reach the store."),
		CompareAndSetOutcome::Mismatch
	);
	assert!(
		store
			.compare_and_set_with_ttl("k", Some("v1"), Some("v2".into()), None)
			.await
			.expect("Matching swap should reach the store.")
			.is_updated()
	);
	assert_eq!(
		store.get("k").await.expect("Read should reach the store.").as_deref(),
		Some("v2")
	);
}

#[tokio::test]
async fn compare_and_set_without_a_value_deletes() {
	let (_, store) = build_store();

	store
		.compare_and_set_with_ttl("k", None, Some("v1".into()), None)
		.await
		.expect("Initial insert should reach the store.");

	assert!(
		store
			.compare_and_set_with_ttl("k", Some("v1"), None, None)
			.await
			.expect("Delete should reach the store.")
			.is_updated()
	);
	assert_eq!(store.get("k").await.expect("Read should reach the store."), None);
}

#[tokio::test]
async fn expired_values_read_as_absent() {
	let (clock, store) = build_store();

	store
		.compare_and_set_with_ttl("lease", None, Some("held".into()), Some(Duration::seconds(30)))
		.await
		.expect("Insert with TTL should reach the store.");
	clock.advance(Duration::seconds(29));

	assert!(store.get("lease").await.expect("Read should reach the store.").is_some());

	clock.advance(Duration::seconds(1));

	assert_eq!(store.get("lease").await.expect("Read should reach the store."), None);
	// A lapsed value cannot be matched, only replaced as if absent.
	assert_eq!(
		store
			.compare_and_set_with_ttl("lease", Some("held"), Some("mine".into()), None)
			.await
			.expect("Swap against lapsed value should reach the store."),
		CompareAndSetOutcome::Mismatch
	);
	assert!(
		store
			.compare_and_set_with_ttl("lease", None, Some("mine".into()), None)
			.await
			.expect("Reclaim should reach the store.")
			.is_updated()
	);
}

#[tokio::test]
async fn purge_drops_only_expired_keys() {
	let (clock, store) = build_store();

	for (key, ttl) in [("short", Some(Duration::seconds(5))), ("long", Some(Duration::minutes(5)))] {
		store
			.compare_and_set_with_ttl(key, None, Some("v".into()), ttl)
			.await
			.expect("Insert should reach the store.");
	}
	store
		.compare_and_set_with_ttl("forever", None, Some("v".into()), None)
		.await
		.expect("Insert should reach the store.");
	clock.advance(Duration::seconds(10));

	assert_eq!(store.purge_expired(), 1);
	assert_eq!(store.purge_expired(), 0);
	assert!(store.get("long").await.expect("Read should reach the store.").is_some());
	assert!(store.get("forever").await.expect("Read should reach the store.").is_some());
}

#[tokio::test]
async fn clones_share_one_map() {
	let (_, store) = build_store();
	let other_instance = store.clone();

	store
		.compare_and_set_with_ttl("shared", None, Some("v".into()), None)
		.await
		.expect("Insert should reach the store.");

	assert_eq!(
		other_instance.get("shared").await.expect("Read should reach the store.").as_deref(),
		Some("v")
	);
}
