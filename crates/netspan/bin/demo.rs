//! # Outbound Request Instrumentation Demo
//!
//! Drives both call surfaces through the instrumentation layer and ships the
//! resulting spans through the delivery pipeline.
//!
//! ## What it shows
//!
//! - Same-origin fetches carrying `x-datadog-*` trace headers, cross-origin
//!   fetches without them
//! - A rejected fetch completing with status 0 and an error chain as its body
//! - A callback-style call whose completion signals race, completing once
//! - Count-triggered flushes plus the final teardown flush
//!
//! Spans are printed by a stdout poster instead of being sent to an intake.
//!
//! ## Running
//!
//! ```bash
//! cargo run -p netspan --bin demo
//!
//! # Print every delivered batch, with tracing at debug level
//! RUST_LOG=netspan=debug cargo run -p netspan --bin demo -- --verbose
//!
//! # Fewer requests
//! cargo run -p netspan --bin demo -- --quick
//! ```

use netspan::{
    BatchConfig, CallEvent, CallListener, CallbackCall, CallbackSurface, DeliveryPipeline,
    FetchSurface, HttpRequest, HttpResponse, HttpTransport, InstrumentationConfig,
    LifecycleEvent, NetworkError, PageOrigin, ReadyState, RequestCompleteEvent,
    ReqwestFetch, RequestStartEvent, ServiceMetadata, StdoutPoster, TransportConfig,
};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Fetch backend with simulated latency, status codes and network failures.
struct SimulatedBackend {
    failure_rate: f64,
}

impl FetchSurface for SimulatedBackend {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let (latency, roll, status) = {
            let mut rng = rand::thread_rng();
            let status = if rng.gen_bool(0.1) { 503 } else { 200 };
            (rng.gen_range(1..20), rng.gen::<f64>(), status)
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if roll < self.failure_rate {
            return Err(NetworkError::Failed(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("connection reset while fetching {}", request.url),
            ))));
        }
        Ok(HttpResponse::new(status, format!("{{\"path\":\"{}\"}}", request.url)))
    }
}

/// Callback backend that fires both completion signals from a worker thread.
struct SimulatedCallbackBackend;

struct SimulatedCall {
    listeners: Arc<Mutex<Vec<CallListener>>>,
}

impl CallbackSurface for SimulatedCallbackBackend {
    type Call = SimulatedCall;

    fn open(&self, _method: &str, _url: &str) -> SimulatedCall {
        SimulatedCall {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CallbackCall for SimulatedCall {
    fn set_request_header(&mut self, _name: &str, _value: &str) {}

    fn add_listener(&mut self, listener: CallListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    fn send(&mut self, _body: Option<String>) {
        let listeners = Arc::clone(&self.listeners);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            let events = [
                CallEvent::ReadyStateChange {
                    state: ReadyState::Done,
                    status: 201,
                    response_text: Some("created".into()),
                },
                CallEvent::LoadEnd {
                    status: 201,
                    response_text: Some("created".into()),
                },
            ];
            if let Ok(listeners) = listeners.lock() {
                for event in &events {
                    for listener in listeners.iter() {
                        listener(event);
                    }
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.contains(&"--verbose".to_string());
    let quick = args.contains(&"--quick".to_string());
    let requests = if quick { 12 } else { 60 };

    println!("Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Requests per surface: {}", requests);
    println!();

    // Phase 1: install instrumentation
    println!("Phase 1: Installing instrumentation\n");
    let origin = PageOrigin::parse("https://shop.example.com/checkout")?;
    let instrumentation = netspan::start(InstrumentationConfig::new(origin).with_max_body_len(256));
    let observables = instrumentation.start();

    let completes = Arc::new(Mutex::new(Vec::<RequestCompleteEvent>::new()));
    let sink = Arc::clone(&completes);
    let _complete_log = observables.complete.subscribe(move |event: &RequestCompleteEvent| {
        if let Ok(mut events) = sink.lock() {
            events.push(event.clone());
        }
    });
    let _start_log = observables.start.subscribe(move |event: &RequestStartEvent| {
        tracing::debug!(request_id = event.request_id, url = %event.url, "request started");
    });
    println!("   Origin: {}", instrumentation.origin().base());

    // Phase 2: delivery pipeline
    println!("\nPhase 2: Building delivery pipeline\n");
    let transport = Arc::new(HttpTransport::new(
        TransportConfig::new("https://intake.example.com/api/v2/spans"),
        Arc::new(StdoutPoster::new(verbose)),
    )?);
    let batch_config = BatchConfig::default().with_max_count(16);
    println!("   Batch ceiling: {} records / {} bytes", batch_config.max_count, batch_config.bytes_limit);
    println!("   Flush interval: {:?}", batch_config.flush_interval);

    let pipeline = DeliveryPipeline::new(
        batch_config,
        transport.clone(),
        ServiceMetadata::new()
            .with_service("shop-frontend")
            .with_env("demo")
            .with_version(env!("CARGO_PKG_VERSION")),
        Some(Arc::new(|| {
            let mut context = serde_json::Map::new();
            context.insert("session_id".into(), serde_json::Value::from("demo-session"));
            context
        })),
    )?;
    pipeline.attach(&observables);
    pipeline.on_before_flush(|| tracing::info!("teardown: flushing remaining spans"));

    // Phase 3: traffic
    println!("\nPhase 3: Issuing {} fetches and {} callback calls\n", requests, requests);
    let fetch = Arc::new(instrumentation.wrap_fetch(SimulatedBackend { failure_rate: 0.05 }));
    let mut tasks = Vec::new();
    for i in 0..requests {
        let fetch = Arc::clone(&fetch);
        tasks.push(tokio::spawn(async move {
            let url = if i % 4 == 0 {
                format!("https://cdn.partner.example.net/assets/{}", i)
            } else {
                format!("/api/cart/items/{}", i)
            };
            fetch.fetch(HttpRequest::get(url)).await
        }));
    }

    let callbacks = instrumentation.wrap_callback(SimulatedCallbackBackend);
    let mut calls = Vec::new();
    for i in 0..requests {
        let mut call = callbacks.open("POST", &format!("/api/events/{}", i));
        call.send(Some("{}".into()));
        calls.push(call);
    }

    // A real client against a closed local port: completes with status 0.
    let client = instrumentation.wrap_fetch(ReqwestFetch::default());
    if let Err(e) = client.fetch(HttpRequest::get("http://127.0.0.1:9/health")).await {
        println!("   Local health check failed as expected: {}", e);
    }

    let mut rejected = 0;
    for task in tasks {
        if task.await?.is_err() {
            rejected += 1;
        }
    }
    // Callback completions land on worker threads.
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("   Fetches rejected: {}", rejected);

    // Phase 4: teardown
    println!("\nPhase 4: Teardown\n");
    pipeline.notify_lifecycle(LifecycleEvent::VisibilityHidden);
    let batch_metrics = pipeline.metrics();
    pipeline.shutdown().await;

    // Phase 5: results
    let completes = completes.lock().map(|c| c.clone()).unwrap_or_default();
    let errors = completes.iter().filter(|e| e.status == 0 || e.status >= 500).count();
    let metrics = transport.metrics();
    println!("\nPhase 5: Results\n");
    println!("   Completed requests:  {}", completes.len());
    println!("   Error responses:     {}", errors);
    println!("   Records buffered:    {}", batch_metrics.records_added);
    println!("   Batches flushed:     {}", batch_metrics.batches_flushed);
    println!("   Beacons queued:      {}", metrics.beacons_queued());
    println!("   Posts spawned:       {}", metrics.posts_spawned());
    println!("   Delivery failures:   {}", metrics.delivery_failures());

    Ok(())
}
