//! Request instrumentation handle.
//!
//! [`Instrumentation`] owns everything the wrapped call surfaces share: the
//! request-id counter, the start/complete observables, the upstream tracer
//! binding and the trace-header injection policy. Wrappers are created from
//! an `Arc<Instrumentation>` via [`Instrumentation::wrap_fetch`] and
//! [`Instrumentation::wrap_callback`].
//!
//! A process normally holds one handle, installed through
//! [`InstrumentationSlot`]; tests build their own slots so installation is
//! deterministic.

use crate::callback::{CallbackSurface, InstrumentedCallbackSurface};
use crate::fetch::{FetchSurface, InstrumentedFetch};
use crate::identifier::{IdentifierGenerator, OsRandomGenerator, TraceContext, TraceIdentifier};
use crate::observable::RequestObservables;
use crate::origin::{PageOrigin, ResolvingNormalizer, UrlNormalizer};
use crate::request::{
    ErrorChainFormatter, FailureFormatter, RequestCompleteEvent, RequestKind, RequestStartEvent,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};
use tracing::{debug, warn};

pub const TRACE_ID_HEADER: &str = "x-datadog-trace-id";
pub const PARENT_ID_HEADER: &str = "x-datadog-parent-id";
pub const ORIGIN_HEADER: &str = "x-datadog-origin";
pub const SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
pub const SAMPLED_HEADER: &str = "x-datadog-sampled";

const ORIGIN_TAG: &str = "rum";
const KEEP: &str = "1";
const FALLBACK_FAILURE_TEXT: &str = "network error";

/// Runs a consumed collaborator, keeping its panics out of the wrapped call.
fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(collaborator = what, "instrumentation collaborator panicked; using fallback");
            None
        }
    }
}

/// The active scope of a cooperating upstream tracer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveScope {
    pub trace_id: TraceIdentifier,
    pub span_id: TraceIdentifier,
}

/// Capability interface for an upstream tracer that may already own the trace.
pub trait ActiveTraceProvider: Send + Sync {
    fn active_scope(&self) -> Option<ActiveScope>;
}

/// Binding used when no upstream tracer is present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveTrace;

impl ActiveTraceProvider for NoActiveTrace {
    fn active_scope(&self) -> Option<ActiveScope> {
        None
    }
}

/// Configuration for request instrumentation
#[derive(Clone)]
pub struct InstrumentationConfig {
    /// Origin used to decide which calls receive trace headers
    pub origin: PageOrigin,
    /// Upstream tracer; `None` binds [`NoActiveTrace`]
    pub trace_provider: Option<Arc<dyn ActiveTraceProvider>>,
    pub generator: Arc<dyn IdentifierGenerator>,
    pub normalizer: Arc<dyn UrlNormalizer>,
    pub failure_formatter: Arc<dyn FailureFormatter>,
    /// Response bodies longer than this many bytes are truncated
    pub max_body_len: Option<usize>,
}

impl InstrumentationConfig {
    pub fn new(origin: PageOrigin) -> Self {
        Self {
            origin,
            trace_provider: None,
            generator: Arc::new(OsRandomGenerator),
            normalizer: Arc::new(ResolvingNormalizer),
            failure_formatter: Arc::new(ErrorChainFormatter),
            max_body_len: None,
        }
    }

    pub fn with_trace_provider(mut self, provider: Arc<dyn ActiveTraceProvider>) -> Self {
        self.trace_provider = Some(provider);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn UrlNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_failure_formatter(mut self, formatter: Arc<dyn FailureFormatter>) -> Self {
        self.failure_formatter = formatter;
        self
    }

    pub fn with_max_body_len(mut self, len: usize) -> Self {
        self.max_body_len = Some(len);
        self
    }
}

/// Shared state behind every instrumented call surface.
pub struct Instrumentation {
    next_request_id: AtomicU64,
    observables: RequestObservables,
    trace_provider: Arc<dyn ActiveTraceProvider>,
    generator: Arc<dyn IdentifierGenerator>,
    normalizer: Arc<dyn UrlNormalizer>,
    failure_formatter: Arc<dyn FailureFormatter>,
    origin: PageOrigin,
    max_body_len: Option<usize>,
}

impl Instrumentation {
    pub fn new(config: InstrumentationConfig) -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            observables: RequestObservables::new(),
            trace_provider: config
                .trace_provider
                .unwrap_or_else(|| Arc::new(NoActiveTrace)),
            generator: config.generator,
            normalizer: config.normalizer,
            failure_formatter: config.failure_formatter,
            origin: config.origin,
            max_body_len: config.max_body_len,
        }
    }

    /// Returns the start/complete channel pair. Every call returns handles to
    /// the same channels.
    pub fn start(&self) -> RequestObservables {
        self.observables.clone()
    }

    pub fn origin(&self) -> &PageOrigin {
        &self.origin
    }

    /// Wraps a promise-style call surface.
    pub fn wrap_fetch<F: FetchSurface>(self: &Arc<Self>, inner: F) -> InstrumentedFetch<F> {
        InstrumentedFetch::new(inner, Arc::clone(self))
    }

    /// Wraps a callback-style call surface.
    pub fn wrap_callback<C: CallbackSurface>(
        self: &Arc<Self>,
        inner: C,
    ) -> InstrumentedCallbackSurface<C> {
        InstrumentedCallbackSurface::new(inner, Arc::clone(self))
    }

    /// Decides the trace for an outbound call.
    ///
    /// An active upstream scope is adopted as-is and no headers are added;
    /// the upstream tracer propagates its own context. Otherwise a trace id
    /// and span id are minted and, for same-origin targets only, the five
    /// propagation headers are appended to `headers`. Returns `None` when
    /// identifier generation fails or a tracing collaborator panics; in both
    /// cases `headers` is left untouched.
    pub fn trace_and_inject(
        &self,
        url: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Option<TraceContext> {
        let (trace, injected) = guarded("trace resolution", || self.resolve_trace(url))??;
        headers.extend(injected);
        Some(trace)
    }

    fn resolve_trace(&self, url: &str) -> Option<(TraceContext, Vec<(String, String)>)> {
        if let Some(scope) = self.trace_provider.active_scope() {
            let trace = TraceContext {
                trace_id: scope.trace_id,
                span_id: self.generator.generate().ok()?,
                parent_id: Some(scope.span_id),
            };
            return Some((trace, Vec::new()));
        }

        let minted = self
            .generator
            .generate()
            .and_then(|trace_id| Ok((trace_id, self.generator.generate()?)));
        let (trace_id, span_id) = match minted {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, url, "trace identifier generation failed; call proceeds untraced");
                return None;
            }
        };

        let injected = if self.origin.is_same_origin(url) {
            vec![
                (TRACE_ID_HEADER.to_string(), trace_id.to_radix_string(10)),
                (PARENT_ID_HEADER.to_string(), span_id.to_radix_string(10)),
                (ORIGIN_HEADER.to_string(), ORIGIN_TAG.to_string()),
                (SAMPLING_PRIORITY_HEADER.to_string(), KEEP.to_string()),
                (SAMPLED_HEADER.to_string(), KEEP.to_string()),
            ]
        } else {
            debug!(url, "cross-origin call; trace headers not injected");
            Vec::new()
        };

        let trace = TraceContext {
            trace_id,
            span_id,
            parent_id: None,
        };
        Some((trace, injected))
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Falls back to the raw target if the normalizer panics.
    pub(crate) fn normalize(&self, url: &str) -> String {
        guarded("url normalization", || self.normalizer.normalize(url, &self.origin))
            .unwrap_or_else(|| url.to_string())
    }

    pub(crate) fn format_failure(&self, error: &(dyn std::error::Error + 'static)) -> String {
        guarded("failure formatting", || self.failure_formatter.format(error))
            .unwrap_or_else(|| FALLBACK_FAILURE_TEXT.to_string())
    }

    /// Applies the configured body cap, cutting on a char boundary.
    pub(crate) fn truncate_body(&self, text: &str) -> String {
        match self.max_body_len {
            Some(max) if text.len() > max => {
                let mut end = max;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text[..end].to_string()
            }
            _ => text.to_string(),
        }
    }

    pub(crate) fn publish_start(&self, event: &RequestStartEvent) {
        self.observables.start.notify(event);
    }

    pub(crate) fn publish_complete(&self, event: &RequestCompleteEvent) {
        self.observables.complete.notify(event);
    }
}

/// Per-call state captured when a call is dispatched.
pub(crate) struct InFlight {
    pub(crate) request_id: u64,
    pub(crate) kind: RequestKind,
    pub(crate) method: String,
    pub(crate) url: String,
    pub(crate) start_time: SystemTime,
    pub(crate) started: Instant,
    pub(crate) trace: Option<TraceContext>,
}

impl InFlight {
    /// Assigns a request id, resolves the trace (injecting headers) and
    /// publishes the start event.
    pub(crate) fn begin(
        instrumentation: &Instrumentation,
        kind: RequestKind,
        method: &str,
        raw_url: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Self {
        let request_id = instrumentation.next_request_id();
        let start_time = SystemTime::now();
        let started = Instant::now();
        let trace = instrumentation.trace_and_inject(raw_url, headers);
        let url = instrumentation.normalize(raw_url);

        instrumentation.publish_start(&RequestStartEvent {
            request_id,
            kind,
            method: method.to_string(),
            url: url.clone(),
            start_time,
        });

        Self {
            request_id,
            kind,
            method: method.to_string(),
            url,
            start_time,
            started,
            trace,
        }
    }

    pub(crate) fn complete(&self, status: u16, response_body: Option<String>) -> RequestCompleteEvent {
        RequestCompleteEvent {
            request_id: self.request_id,
            kind: self.kind,
            method: self.method.clone(),
            url: self.url.clone(),
            start_time: self.start_time,
            duration: self.started.elapsed(),
            status,
            response_body,
            trace: self.trace,
        }
    }
}

/// Two-input, single-output gate: the first completion signal wins, later
/// signals are no-ops.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    closed: AtomicBool,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once.
    pub fn try_complete(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_complete(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Guarded single-installation cell for the instrumentation handle.
pub struct InstrumentationSlot {
    handle: Mutex<Option<Arc<Instrumentation>>>,
    installs: AtomicUsize,
}

impl Default for InstrumentationSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentationSlot {
    pub const fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            installs: AtomicUsize::new(0),
        }
    }

    /// Installs a handle built from `config`, or returns the existing one.
    /// A second call's `config` is ignored.
    pub fn install(&self, config: InstrumentationConfig) -> Arc<Instrumentation> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = handle.as_ref() {
            debug!("instrumentation already installed; reusing handle");
            return Arc::clone(existing);
        }
        let installed = Arc::new(Instrumentation::new(config));
        self.installs.fetch_add(1, Ordering::Relaxed);
        *handle = Some(Arc::clone(&installed));
        installed
    }

    /// Clears the slot. Wrappers created from the old handle keep working.
    pub fn uninstall(&self) -> Option<Arc<Instrumentation>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn get(&self) -> Option<Arc<Instrumentation>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of handles this slot has built
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::Relaxed)
    }
}

static GLOBAL: InstrumentationSlot = InstrumentationSlot::new();

/// Installs the process-wide instrumentation handle once and returns it.
pub fn start(config: InstrumentationConfig) -> Arc<Instrumentation> {
    GLOBAL.install(config)
}

/// The process-wide handle, if [`start`] has run.
pub fn installed() -> Option<Arc<Instrumentation>> {
    GLOBAL.get()
}
