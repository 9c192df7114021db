//! Metrics / logging sink
//!
//! Fire-and-forget: a sink must never fail the pipeline.

use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &str, attributes: Value);
}

/// Default sink: structured `tracing` events under the `import_metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &str, attributes: Value) {
        info!(target: "import_metrics", event, %attributes);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: String,
    pub attributes: Value,
}

/// Keeps every event in memory; handy when embedding the pipeline in tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Attributes of every event with the given name, in emission order
    pub fn named(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == event)
            .map(|e| e.attributes.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }
}

impl MetricsSink for RecordingSink {
    fn record(&self, event: &str, attributes: Value) {
        self.events.lock().push(RecordedEvent {
            event: event.to_string(),
            attributes,
        });
    }
}

/// Counts events per name and stage in a Prometheus registry
#[cfg(feature = "metrics")]
pub struct PrometheusSink {
    events: prometheus::IntCounterVec,
}

#[cfg(feature = "metrics")]
impl PrometheusSink {
    pub fn new(registry: &prometheus::Registry) -> crate::error::Result<Self> {
        let events = prometheus::IntCounterVec::new(
            prometheus::Opts::new(
                "import_pipeline_events_total",
                "Import pipeline events by name and stage",
            ),
            &["event", "stage"],
        )
        .map_err(crate::error::PipelineError::config)?;
        registry
            .register(Box::new(events.clone()))
            .map_err(crate::error::PipelineError::config)?;
        Ok(Self { events })
    }
}

#[cfg(feature = "metrics")]
impl MetricsSink for PrometheusSink {
    fn record(&self, event: &str, attributes: Value) {
        let stage = attributes
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or("none");
        self.events.with_label_values(&[event, stage]).inc();
    }
}
