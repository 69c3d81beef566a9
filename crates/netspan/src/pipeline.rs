//! Delivery pipeline: complete events → spans → batch buffer → transport.
//!
//! The buffer is shared by three writers (event subscribers on arbitrary
//! threads, the flush timer, lifecycle notifications), so it lives behind a
//! `Mutex`. Every `add`/`flush` runs entirely under the lock and never awaits,
//! which makes each one atomic with respect to the others.

use crate::batch_buffer::{BatchBuffer, BatchConfig, BatchMetrics, ContextProvider};
use crate::observable::{RequestObservables, Subscription};
use crate::request::RequestCompleteEvent;
use crate::span::{ServiceMetadata, SpanBuilder};
use crate::transport::Transport;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error types for pipeline construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The flush timer needs a tokio runtime to run on
    #[error("no tokio runtime available for the flush timer")]
    NoRuntime,
}

/// Host lifecycle transitions that may precede teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The process or page is about to go away
    PageHide,
    /// The host moved to the background
    VisibilityHidden,
    /// The host returned to the foreground
    VisibilityVisible,
}

impl LifecycleEvent {
    fn is_teardown(self) -> bool {
        matches!(self, Self::PageHide | Self::VisibilityHidden)
    }
}

type BeforeFlushCallback = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    buffer: Mutex<BatchBuffer>,
    builder: SpanBuilder,
    transport: Arc<dyn Transport>,
    before_flush: Mutex<Vec<BeforeFlushCallback>>,
}

impl Shared {
    /// Runs `f` on the locked buffer. A panicking transport costs the batch
    /// being handed off; the buffer stays usable and the caller keeps running.
    fn with_buffer<R>(&self, f: impl FnOnce(&mut BatchBuffer, &dyn Transport) -> R) -> Option<R> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let transport = self.transport.as_ref();
        match catch_unwind(AssertUnwindSafe(|| f(&mut buffer, transport))) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("transport panicked during hand-off; batch lost");
                None
            }
        }
    }

    fn record(&self, event: &RequestCompleteEvent) {
        let Some(span) = self.builder.build(event) else {
            debug!(request_id = event.request_id, "untraced request; no span emitted");
            return;
        };
        if let Some(Err(e)) = self.with_buffer(|buffer, transport| buffer.add(&span, transport)) {
            warn!(error = %e, request_id = event.request_id, "dropping span");
        }
    }

    fn flush(&self) {
        self.with_buffer(|buffer, transport| buffer.flush(transport));
    }

    fn run_before_flush(&self) {
        let callbacks: Vec<BeforeFlushCallback> = self
            .before_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!("before-flush callback panicked");
            }
        }
    }
}

/// Owns the shared batch buffer, its flush timer and the event subscription.
pub struct DeliveryPipeline {
    shared: Arc<Shared>,
    timer_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DeliveryPipeline {
    /// Creates the pipeline and starts its flush timer on the current tokio
    /// runtime.
    pub fn new(
        config: BatchConfig,
        transport: Arc<dyn Transport>,
        metadata: ServiceMetadata,
        context: Option<ContextProvider>,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let flush_interval = config.flush_interval;
        let mut buffer = BatchBuffer::new(config);
        if let Some(context) = context {
            buffer = buffer.with_context(context);
        }

        let shared = Arc::new(Shared {
            buffer: Mutex::new(buffer),
            builder: SpanBuilder::new(metadata),
            transport,
            before_flush: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let timer_shared = Arc::clone(&shared);
        // Re-armed after each flush rather than ticking at a fixed rate.
        let timer_task = runtime.spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(flush_interval) => {
                        timer_shared.flush();
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            shared,
            timer_task: Some(timer_task),
            shutdown_tx: Some(shutdown_tx),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to the complete channel of `observables`.
    pub fn attach(&self, observables: &RequestObservables) {
        let shared = Arc::clone(&self.shared);
        let subscription = observables
            .complete
            .subscribe(move |event: &RequestCompleteEvent| shared.record(event));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    /// Builds a span for `event` and buffers it.
    pub fn record(&self, event: &RequestCompleteEvent) {
        self.shared.record(event);
    }

    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Registers a callback that runs just before each teardown flush.
    pub fn on_before_flush<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .before_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Flushes on `PageHide` and `VisibilityHidden`.
    pub fn notify_lifecycle(&self, event: LifecycleEvent) {
        if event.is_teardown() {
            debug!(?event, "teardown signal; flushing");
            self.shared.run_before_flush();
            self.shared.flush();
        }
    }

    /// Number of records currently buffered
    pub fn buffered(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn metrics(&self) -> BatchMetrics {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics()
            .clone()
    }

    /// Final flush, then stops the timer and drains the transport.
    pub async fn shutdown(mut self) {
        for subscription in self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            subscription.unsubscribe();
        }

        self.notify_lifecycle(LifecycleEvent::PageHide);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.timer_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "flush timer terminated abnormally");
            }
        }

        self.shared.transport.close().await;
        info!("delivery pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{TraceContext, TraceIdentifier};
    use crate::request::RequestKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        closed: AtomicUsize,
    }

    impl Transport for RecordingTransport {
        fn send(&self, payload: String, _bytes: usize) {
            self.sent.lock().unwrap().push(payload);
        }

        fn close(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn complete(request_id: u64, traced: bool) -> RequestCompleteEvent {
        RequestCompleteEvent {
            request_id,
            kind: RequestKind::Fetch,
            method: "GET".into(),
            url: format!("https://app.example.com/{}", request_id),
            start_time: SystemTime::now(),
            duration: Duration::from_millis(3),
            status: 200,
            response_body: None,
            trace: traced.then(|| TraceContext {
                trace_id: TraceIdentifier::from_u64(request_id),
                span_id: TraceIdentifier::from_u64(request_id + 1000),
                parent_id: None,
            }),
        }
    }

    fn pipeline(config: BatchConfig) -> (DeliveryPipeline, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let pipeline =
            DeliveryPipeline::new(config, transport.clone(), ServiceMetadata::default(), None)
                .unwrap();
        (pipeline, transport)
    }

    #[tokio::test]
    async fn test_attached_events_become_buffered_spans() {
        let (pipeline, transport) = pipeline(BatchConfig::default());
        let observables = RequestObservables::new();
        pipeline.attach(&observables);

        observables.complete.notify(&complete(1, true));
        observables.complete.notify(&complete(2, false));
        assert_eq!(pipeline.buffered(), 1);

        pipeline.flush();
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("https://app.example.com/1"));
        assert!(!sent[0].contains("https://app.example.com/2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_and_rearms() {
        let (pipeline, transport) =
            pipeline(BatchConfig::default().with_flush_interval(Duration::from_secs(30)));

        pipeline.record(&complete(1, true));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        pipeline.record(&complete(2, true));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 2);

        // Empty buffer: the timer keeps running but sends nothing.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_visibility_hidden_runs_callbacks_then_flushes() {
        let (pipeline, transport) = pipeline(BatchConfig::default());
        let pipeline = Arc::new(pipeline);

        let late = Arc::clone(&pipeline);
        pipeline.on_before_flush(move || late.record(&complete(9, true)));

        pipeline.notify_lifecycle(LifecycleEvent::VisibilityVisible);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(pipeline.buffered(), 0);

        pipeline.notify_lifecycle(LifecycleEvent::VisibilityHidden);
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("https://app.example.com/9"));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes_transport() {
        let (pipeline, transport) = pipeline(BatchConfig::default());
        let observables = RequestObservables::new();
        pipeline.attach(&observables);

        pipeline.record(&complete(1, true));
        pipeline.record(&complete(2, true));
        pipeline.shutdown().await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].lines().count(), 2);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(observables.complete.subscriber_count(), 0);
    }

    /// Panics on its first hand-off, then records normally.
    #[derive(Default)]
    struct FlakyTransport {
        calls: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl Transport for FlakyTransport {
        fn send(&self, payload: String, _bytes: usize) {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("transport fault");
            }
            self.sent.lock().unwrap().push(payload);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_survives_panicking_transport() {
        let transport = Arc::new(FlakyTransport::default());
        let pipeline = DeliveryPipeline::new(
            BatchConfig::default().with_flush_interval(Duration::from_secs(30)),
            transport.clone(),
            ServiceMetadata::default(),
            None,
        )
        .unwrap();

        pipeline.record(&complete(1, true));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.buffered(), 0);

        pipeline.record(&complete(2, true));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.buffered(), 0);
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("https://app.example.com/2"));
    }

    #[tokio::test]
    async fn test_panicking_transport_on_ceiling_flush_keeps_recording() {
        let transport = Arc::new(FlakyTransport::default());
        let pipeline = DeliveryPipeline::new(
            BatchConfig::default().with_max_count(1),
            transport.clone(),
            ServiceMetadata::default(),
            None,
        )
        .unwrap();

        pipeline.record(&complete(1, true));
        pipeline.record(&complete(2, true));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(pipeline.buffered(), 0);
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let result = DeliveryPipeline::new(
            BatchConfig::default(),
            Arc::new(RecordingTransport::default()),
            ServiceMetadata::default(),
            None,
        );
        assert_eq!(result.err(), Some(PipelineError::NoRuntime));
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_block_flush() {
        let (pipeline, transport) = pipeline(BatchConfig::default());
        pipeline.on_before_flush(|| panic!("callback fault"));
        pipeline.record(&complete(1, true));

        pipeline.notify_lifecycle(LifecycleEvent::PageHide);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }
}
