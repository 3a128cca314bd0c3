// self
use crate::{
	_prelude::*,
	obs::{CoordinatorEvent, OpKind},
};

/// Type alias that resolves to an instrumented future when tracing is enabled.
#[cfg(feature = "tracing")]
pub type InstrumentedOp<F> = tracing::instrument::Instrumented<F>;
/// Passthrough future type when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub type InstrumentedOp<F> = F;

/// A span builder used by coordinator entry points.
#[derive(Clone, Debug)]
pub struct CoordinatorSpan {
	#[cfg(feature = "tracing")]
	span: tracing::Span,
}
impl CoordinatorSpan {
	/// Creates a new span tagged with the provided operation kind + stage.
	pub fn new(kind: OpKind, stage: &'static str) -> Self {
		#[cfg(feature = "tracing")]
		{
			let span = tracing::info_span!("quota_broker.call", op = kind.as_str(), stage);

			Self { span }
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = (kind, stage);

			Self {}
		}
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedOp<Fut>
	where
		Fut: Future,
	{
		#[cfg(feature = "tracing")]
		{
			use tracing::Instrument;

			fut.instrument(self.span.clone())
		}
		#[cfg(not(feature = "tracing"))]
		{
			fut
		}
	}
}

/// Logs a coordinator event at a level matching its severity.
pub fn log_event(event: &CoordinatorEvent) {
	#[cfg(feature = "tracing")]
	{
		match event {
			CoordinatorEvent::CircuitOpened { .. }
			| CoordinatorEvent::QueueTimeout { .. }
			| CoordinatorEvent::RateLimitHit { .. } =>
				tracing::warn!(event = event.name(), detail = ?event, "coordinator state changed"),
			CoordinatorEvent::CircuitHalfOpened
			| CoordinatorEvent::CircuitClosed
			| CoordinatorEvent::RefreshCompleted { .. } =>
				tracing::info!(event = event.name(), detail = ?event, "coordinator state changed"),
			CoordinatorEvent::Throttled { .. } | CoordinatorEvent::RefreshDenied { .. } =>
				tracing::debug!(event = event.name(), detail = ?event, "coordinator denied a call"),
		}
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = event;
	}
}

/// Logs a non-fatal problem the coordinator recovered from.
pub fn log_recovered(stage: &'static str, err: &dyn StdError) {
	#[cfg(feature = "tracing")]
	{
		tracing::warn!(stage, error = %err, "coordinator recovered from an error");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (stage, err);
	}
}
