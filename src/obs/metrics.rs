// self
use crate::obs::{CoordinatorEvent, OpKind, OpOutcome};

/// Records an operation outcome via the global metrics recorder (when enabled).
pub fn record_op_outcome(kind: OpKind, outcome: OpOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"quota_broker_call_total",
			"op" => kind.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

/// Counts a published coordinator event.
pub fn record_event_metric(event: &CoordinatorEvent) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!("quota_broker_event_total", "event" => event.name()).increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = event;
	}
}

/// Publishes the current capacity factor gauge.
pub fn record_capacity_factor(factor: f64) {
	#[cfg(feature = "metrics")]
	{
		metrics::gauge!("quota_broker_capacity_factor").set(factor);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = factor;
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn recorders_noop_without_metrics() {
		record_op_outcome(OpKind::Call, OpOutcome::Denied);
		record_event_metric(&CoordinatorEvent::CircuitClosed);
		record_capacity_factor(0.7);
	}
}
