use crate::identifier::TraceIdentifier;
use crate::request::RequestCompleteEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::UNIX_EPOCH;

const SPAN_NAME: &str = "browser.request";
const SPAN_TYPE: &str = "http";
const DEFAULT_SERVICE: &str = "browser";

/// Static tags supplied once at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub env: Option<String>,
    pub service: Option<String>,
    pub version: Option<String>,
}

impl ServiceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// A delivery-ready client span for one outbound call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub trace_id: TraceIdentifier,
    pub span_id: TraceIdentifier,
    pub parent_id: TraceIdentifier,
    pub name: String,
    pub resource: String,
    pub service: String,
    #[serde(rename = "type")]
    pub span_type: String,
    /// Start, nanoseconds since the Unix epoch
    pub start: u64,
    /// Duration in nanoseconds
    pub duration: u64,
    /// 1 when the call failed at the network level or with a 5xx status
    pub error: u8,
    pub meta: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

/// Turns complete events into [`SpanRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct SpanBuilder {
    metadata: ServiceMetadata,
}

impl SpanBuilder {
    pub fn new(metadata: ServiceMetadata) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> &ServiceMetadata {
        &self.metadata
    }

    /// Returns `None` for calls that carry no trace.
    pub fn build(&self, event: &RequestCompleteEvent) -> Option<SpanRecord> {
        let trace = event.trace?;

        let mut meta = BTreeMap::new();
        meta.insert("http.method".to_string(), event.method.clone());
        meta.insert("http.url".to_string(), event.url.clone());
        meta.insert("http.status_code".to_string(), event.status.to_string());
        meta.insert("span.kind".to_string(), "client".to_string());
        if let Some(env) = &self.metadata.env {
            meta.insert("env".to_string(), env.clone());
        }
        if let Some(service) = &self.metadata.service {
            meta.insert("service".to_string(), service.clone());
        }
        if let Some(version) = &self.metadata.version {
            meta.insert("version".to_string(), version.clone());
        }

        // Always keep: this pipeline does no sampling of its own.
        let metrics = BTreeMap::from([
            ("_dd.agent_psr".to_string(), 1.0),
            ("_sample_rate".to_string(), 1.0),
            ("_sampling_priority_v1".to_string(), 1.0),
            ("_top_level".to_string(), 1.0),
        ]);

        let start = event
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Some(SpanRecord {
            trace_id: trace.trace_id,
            span_id: trace.span_id,
            parent_id: trace.parent_id.unwrap_or_else(TraceIdentifier::zero),
            name: SPAN_NAME.to_string(),
            resource: event.url.clone(),
            service: self
                .metadata
                .service
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
            span_type: SPAN_TYPE.to_string(),
            start,
            duration: event.duration.as_nanos() as u64,
            error: u8::from(event.status == 0 || event.status >= 500),
            meta,
            metrics,
        })
    }
}
