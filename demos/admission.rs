//! Demonstrates queued admission against a tight request window: high-priority calls jump ahead
//! of background work, and the status snapshot shows where the capacity went.

// std
use std::time::Duration as StdDuration;
// crates.io
use color_eyre::Result;
use time::Duration;
use tokio::task::JoinSet;
// self
use quota_broker::{
	config::{CoordinatorConfig, QueueConfig, WindowConfig},
	coordinator::{CallOptions, Coordinator},
	ident::OperationTag,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let config = CoordinatorConfig::default()
		.with_windows([WindowConfig::new("demo", Duration::seconds(2), 4)])
		.with_queue(QueueConfig::default().with_max_wait(Duration::seconds(30)));
	let coordinator = Coordinator::new(config)?;
	let mut events = coordinator.subscribe();
	let mut calls = JoinSet::new();

	for (index, priority) in [1, 1, 1, 1, 5, 5, 9, 9].into_iter().enumerate() {
		let coordinator = coordinator.clone();
		let options = CallOptions::new(priority)
			.with_operation(OperationTag::new(format!("call-{index}"))?);

		calls.spawn(async move {
			coordinator
				.execute_with(options, || async move {
					tokio::time::sleep(StdDuration::from_millis(50)).await;

					Ok::<_, std::io::Error>((index, priority))
				})
				.await
		});
	}

	while let Some(joined) = calls.join_next().await {
		let (index, priority) = joined??;

		println!("Finished call-{index} at priority {priority}.");
	}

	while let Ok(event) = events.try_recv() {
		println!("Event: {}.", event.name());
	}

	println!("Status: {}.", serde_json::to_string_pretty(&coordinator.status().await?)?);

	Ok(())
}
