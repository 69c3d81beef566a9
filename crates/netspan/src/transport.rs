use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error types for payload delivery
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Network or HTTP-level failure
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// The collection endpoint answered with a non-success status
    #[error("endpoint rejected payload with status {0}")]
    Rejected(u16),
    /// No tokio runtime to run deliveries on
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Fire-and-forget delivery of one batch.
///
/// `send` must not block and never reports failure to the caller.
pub trait Transport: Send + Sync {
    fn send(&self, payload: String, bytes: usize);

    /// Waits for deliveries that must survive teardown. Defaults to a no-op.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Performs one POST of a payload body.
///
/// Uses native async fn in traits; use [`HttpPosterBoxed`] for dynamic dispatch.
pub trait HttpPoster: Send + Sync {
    fn post(&self, endpoint: &str, body: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn name(&self) -> &str;
}

/// Object-safe version of [`HttpPoster`].
pub trait HttpPosterBoxed: Send + Sync {
    fn post_boxed<'a>(
        &'a self,
        endpoint: &'a str,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any HttpPoster can be used as HttpPosterBoxed
impl<T: HttpPoster> HttpPosterBoxed for T {
    fn post_boxed<'a>(
        &'a self,
        endpoint: &'a str,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(self.post(endpoint, body))
    }

    fn name(&self) -> &str {
        HttpPoster::name(self)
    }
}

/// Posts with reqwest. The body is sent untyped: no `Content-Type` header,
/// so cross-origin intakes accept it without a preflight.
#[derive(Debug, Clone, Default)]
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpPoster for ReqwestPoster {
    async fn post(&self, endpoint: &str, body: String) -> Result<(), TransportError> {
        let response = self
            .client
            .post(endpoint)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected(status.as_u16()))
        }
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}

/// Prints payloads instead of posting them, for local debugging
pub struct StdoutPoster {
    verbose: bool,
}

impl StdoutPoster {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl HttpPoster for StdoutPoster {
    async fn post(&self, endpoint: &str, body: String) -> Result<(), TransportError> {
        if self.verbose {
            println!("=== POST {} ({} bytes) ===", endpoint, body.len());
            for line in body.lines() {
                println!("{}", line);
            }
            println!("=== end of batch ===\n");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Thread-safe delivery counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// Payloads accepted by the beacon queue
    pub beacons_queued: AtomicU64,
    /// Payloads sent through a spawned POST
    pub posts_spawned: AtomicU64,
    /// Deliveries that failed (lost telemetry)
    pub delivery_failures: AtomicU64,
}

// Relaxed ordering throughout: these are statistics, nothing synchronizes on them.
impl TransportMetrics {
    pub fn beacons_queued(&self) -> u64 {
        self.beacons_queued.load(Ordering::Relaxed)
    }

    pub fn posts_spawned(&self) -> u64 {
        self.posts_spawned.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    fn record_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Configuration for HTTP delivery
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Collection endpoint URL
    pub endpoint: String,
    /// Use the unload-safe beacon queue for small payloads
    pub use_beacon: bool,
    /// Payloads at or above this size bypass the beacon queue
    pub beacon_limit: usize,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            use_beacon: true,
            beacon_limit: 64 * 1024,
        }
    }

    pub fn with_beacon(mut self, use_beacon: bool) -> Self {
        self.use_beacon = use_beacon;
        self
    }

    pub fn with_beacon_limit(mut self, limit: usize) -> Self {
        self.beacon_limit = limit;
        self
    }
}

/// Unload-safe, fire-and-forget queue.
///
/// A dedicated worker posts queued payloads one at a time. [`BeaconQueue::close`]
/// stops intake and waits until everything already queued has been attempted.
pub struct BeaconQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    limit: usize,
}

impl BeaconQueue {
    pub fn spawn(
        runtime: &Handle,
        endpoint: String,
        poster: Arc<dyn HttpPosterBoxed>,
        limit: usize,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let worker = runtime.spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = poster.post_boxed(&endpoint, payload).await {
                    debug!(error = %e, poster = poster.name(), "beacon delivery failed");
                    metrics.record_failure();
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            limit,
        }
    }

    /// Queues `payload`, handing it back when it is too large or the queue
    /// is closed.
    pub fn try_send(&self, payload: String, bytes: usize) -> Result<(), String> {
        if bytes >= self.limit {
            return Err(payload);
        }
        match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(payload).map_err(|e| e.0),
            None => Err(payload),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Stops intake and drains the queue.
    pub async fn close(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "beacon worker terminated abnormally");
            }
        }
    }
}

/// Delivers through the beacon queue when possible, otherwise through a
/// spawned POST whose outcome nobody awaits. Failures are counted and
/// logged; nothing is retried.
pub struct HttpTransport {
    endpoint: String,
    poster: Arc<dyn HttpPosterBoxed>,
    beacon: Option<BeaconQueue>,
    runtime: Handle,
    metrics: Arc<TransportMetrics>,
}

impl HttpTransport {
    /// Must be called from within a tokio runtime.
    pub fn new(config: TransportConfig, poster: Arc<dyn HttpPosterBoxed>) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let metrics = Arc::new(TransportMetrics::default());
        let beacon = config.use_beacon.then(|| {
            BeaconQueue::spawn(
                &runtime,
                config.endpoint.clone(),
                Arc::clone(&poster),
                config.beacon_limit,
                Arc::clone(&metrics),
            )
        });

        Ok(Self {
            endpoint: config.endpoint,
            poster,
            beacon,
            runtime,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }
}

impl Transport for HttpTransport {
    fn send(&self, payload: String, bytes: usize) {
        let payload = match &self.beacon {
            Some(beacon) => match beacon.try_send(payload, bytes) {
                Ok(()) => {
                    self.metrics.beacons_queued.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(payload) => payload,
            },
            None => payload,
        };

        self.metrics.posts_spawned.fetch_add(1, Ordering::Relaxed);
        let poster = Arc::clone(&self.poster);
        let endpoint = self.endpoint.clone();
        let metrics = Arc::clone(&self.metrics);
        self.runtime.spawn(async move {
            if let Err(e) = poster.post_boxed(&endpoint, payload).await {
                debug!(error = %e, poster = poster.name(), "batch delivery failed");
                metrics.record_failure();
            }
        });
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some(beacon) = &self.beacon {
                beacon.close().await;
            }
        })
    }
}

/// Discards every payload (for benchmarking)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _payload: String, _bytes: usize) {}
}
