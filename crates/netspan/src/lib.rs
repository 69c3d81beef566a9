//! Outbound HTTP instrumentation and span delivery
//!
//! Wraps two call surfaces, a promise-style [`FetchSurface`] and a
//! callback-style [`CallbackSurface`], so every call gets a request id, a
//! start event and exactly one complete event. Calls are correlated with a
//! 63-bit [`TraceIdentifier`], minted locally or adopted from an upstream
//! tracer, and same-origin calls carry the trace in `x-datadog-*` headers.
//!
//! Complete events flow into a [`DeliveryPipeline`], which turns them into
//! [`SpanRecord`]s, batches them under count and byte ceilings, and hands
//! batches to a fire-and-forget [`Transport`] on a timer, at the ceilings,
//! and on teardown.
//!
//! ```rust,ignore
//! let instrumentation = netspan::start(InstrumentationConfig::new(origin));
//! let fetch = instrumentation.wrap_fetch(ReqwestFetch::default());
//!
//! let transport = Arc::new(HttpTransport::new(
//!     TransportConfig::new("https://intake.example.com/v1/spans"),
//!     Arc::new(ReqwestPoster::default()),
//! )?);
//! let pipeline = DeliveryPipeline::new(BatchConfig::default(), transport, metadata, None)?;
//! pipeline.attach(&instrumentation.start());
//! ```

pub mod batch_buffer;
pub mod callback;
pub mod fetch;
pub mod identifier;
pub mod instrumentation;
pub mod observable;
pub mod origin;
pub mod pipeline;
pub mod request;
pub mod span;
pub mod transport;

// Re-export main types
pub use batch_buffer::{Batch, BatchBuffer, BatchConfig, BatchError, BatchMetrics, ContextProvider};
pub use callback::{
    CallEvent, CallListener, CallbackCall, CallbackSurface, InstrumentedCall,
    InstrumentedCallbackSurface, ReadyState,
};
pub use fetch::{FetchSurface, FetchSurfaceBoxed, InstrumentedFetch, ReqwestFetch};
pub use identifier::{
    IdentifierError, IdentifierGenerator, OsRandomGenerator, TraceContext, TraceIdentifier,
};
pub use instrumentation::{
    installed, start, ActiveScope, ActiveTraceProvider, CompletionLatch, Instrumentation,
    InstrumentationConfig, InstrumentationSlot, NoActiveTrace,
};
pub use observable::{Observable, RequestObservables, Subscription};
pub use origin::{PageOrigin, ResolvingNormalizer, UrlNormalizer};
pub use pipeline::{DeliveryPipeline, LifecycleEvent, PipelineError};
pub use request::{
    BodyError, ErrorChainFormatter, FailureFormatter, HttpRequest, HttpResponse, NetworkError,
    RequestCompleteEvent, RequestKind, RequestStartEvent,
};
pub use span::{ServiceMetadata, SpanBuilder, SpanRecord};
pub use transport::{
    BeaconQueue, HttpPoster, HttpPosterBoxed, HttpTransport, NullTransport, ReqwestPoster,
    StdoutPoster, Transport, TransportConfig, TransportError, TransportMetrics,
};
