//! Callback-style call surface.
//!
//! A call is opened, configured, then sent; progress is reported to
//! registered listeners as [`CallEvent`]s. Two events can mark completion:
//! a `ReadyStateChange` to [`ReadyState::Done`] and the terminal `LoadEnd`.
//! Implementations may emit either, both, or (for aborted calls) neither.
//! The instrumented wrapper registers one listener per signal and routes
//! both through a [`CompletionLatch`] so exactly one complete event is
//! published.

use crate::instrumentation::{CompletionLatch, InFlight, Instrumentation};
use crate::request::RequestKind;
use std::sync::Arc;

/// Lifecycle states of a callback-style call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// Progress notification delivered to call listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    ReadyStateChange {
        state: ReadyState,
        status: u16,
        response_text: Option<String>,
    },
    /// Fired once after success, error, abort or timeout
    LoadEnd {
        status: u16,
        response_text: Option<String>,
    },
}

pub type CallListener = Box<dyn Fn(&CallEvent) + Send + Sync>;

/// A single in-progress call on a [`CallbackSurface`].
pub trait CallbackCall: Send {
    fn set_request_header(&mut self, name: &str, value: &str);

    fn add_listener(&mut self, listener: CallListener);

    /// Dispatches the call. Listeners may fire before this returns.
    fn send(&mut self, body: Option<String>);
}

/// An HTTP client that reports completion through callbacks.
pub trait CallbackSurface: Send + Sync {
    type Call: CallbackCall;

    fn open(&self, method: &str, url: &str) -> Self::Call;
}

/// A [`CallbackSurface`] that reports every sent call to an [`Instrumentation`].
pub struct InstrumentedCallbackSurface<C> {
    inner: C,
    instrumentation: Arc<Instrumentation>,
}

impl<C: CallbackSurface> InstrumentedCallbackSurface<C> {
    pub fn new(inner: C, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: CallbackSurface> CallbackSurface for InstrumentedCallbackSurface<C> {
    type Call = InstrumentedCall<C::Call>;

    fn open(&self, method: &str, url: &str) -> Self::Call {
        InstrumentedCall {
            inner: self.inner.open(method, url),
            method: method.to_string(),
            url: url.to_string(),
            instrumentation: Arc::clone(&self.instrumentation),
        }
    }
}

/// A call opened through [`InstrumentedCallbackSurface`].
pub struct InstrumentedCall<T> {
    inner: T,
    method: String,
    url: String,
    instrumentation: Arc<Instrumentation>,
}

impl<T> InstrumentedCall<T> {
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: CallbackCall> CallbackCall for InstrumentedCall<T> {
    fn set_request_header(&mut self, name: &str, value: &str) {
        self.inner.set_request_header(name, value);
    }

    fn add_listener(&mut self, listener: CallListener) {
        self.inner.add_listener(listener);
    }

    fn send(&mut self, body: Option<String>) {
        let mut headers = Vec::new();
        let in_flight = InFlight::begin(
            &self.instrumentation,
            RequestKind::Callback,
            &self.method,
            &self.url,
            &mut headers,
        );
        for (name, value) in &headers {
            self.inner.set_request_header(name, value);
        }

        let pending = Arc::new(PendingCompletion {
            in_flight,
            latch: CompletionLatch::new(),
            instrumentation: Arc::clone(&self.instrumentation),
        });

        let on_ready_state = Arc::clone(&pending);
        self.inner.add_listener(Box::new(move |event| {
            if let CallEvent::ReadyStateChange {
                state: ReadyState::Done,
                status,
                response_text,
            } = event
            {
                on_ready_state.complete(*status, response_text.as_deref());
            }
        }));

        let on_load_end = pending;
        self.inner.add_listener(Box::new(move |event| {
            if let CallEvent::LoadEnd {
                status,
                response_text,
            } = event
            {
                on_load_end.complete(*status, response_text.as_deref());
            }
        }));

        self.inner.send(body);
    }
}

/// Completion state shared by the two completion listeners of one call.
struct PendingCompletion {
    in_flight: InFlight,
    latch: CompletionLatch,
    instrumentation: Arc<Instrumentation>,
}

impl PendingCompletion {
    fn complete(&self, status: u16, response_text: Option<&str>) {
        if !self.latch.try_complete() {
            return;
        }
        let body = response_text.map(|text| self.instrumentation.truncate_body(text));
        self.instrumentation
            .publish_complete(&self.in_flight.complete(status, body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::{InstrumentationConfig, ORIGIN_HEADER, TRACE_ID_HEADER};
    use crate::origin::PageOrigin;
    use crate::request::{RequestCompleteEvent, RequestStartEvent};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Script {
        /// Ready-state Done, then LoadEnd
        Both,
        ReadyStateOnly,
        LoadEndOnly,
        /// LoadEnd first, then ready-state Done
        Reversed,
        /// No completion signal at all
        Abort,
    }

    struct ScriptedSurface {
        script: Script,
        status: u16,
        sent_headers: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    }

    impl ScriptedSurface {
        fn new(script: Script, status: u16) -> Self {
            Self {
                script,
                status,
                sent_headers: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct ScriptedCall {
        script: Script,
        status: u16,
        headers: Vec<(String, String)>,
        listeners: Vec<CallListener>,
        sent_headers: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    }

    impl CallbackSurface for ScriptedSurface {
        type Call = ScriptedCall;

        fn open(&self, _method: &str, _url: &str) -> ScriptedCall {
            ScriptedCall {
                script: self.script,
                status: self.status,
                headers: Vec::new(),
                listeners: Vec::new(),
                sent_headers: Arc::clone(&self.sent_headers),
            }
        }
    }

    impl ScriptedCall {
        fn emit(&self, event: &CallEvent) {
            for listener in &self.listeners {
                listener(event);
            }
        }
    }

    impl CallbackCall for ScriptedCall {
        fn set_request_header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }

        fn add_listener(&mut self, listener: CallListener) {
            self.listeners.push(listener);
        }

        fn send(&mut self, _body: Option<String>) {
            self.sent_headers.lock().unwrap().push(self.headers.clone());
            let done = CallEvent::ReadyStateChange {
                state: ReadyState::Done,
                status: self.status,
                response_text: Some("payload".into()),
            };
            let load_end = CallEvent::LoadEnd {
                status: self.status,
                response_text: Some("payload".into()),
            };
            self.emit(&CallEvent::ReadyStateChange {
                state: ReadyState::Loading,
                status: self.status,
                response_text: None,
            });
            match self.script {
                Script::Both => {
                    self.emit(&done);
                    self.emit(&load_end);
                }
                Script::ReadyStateOnly => self.emit(&done),
                Script::LoadEndOnly => self.emit(&load_end),
                Script::Reversed => {
                    self.emit(&load_end);
                    self.emit(&done);
                }
                Script::Abort => {}
            }
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn instrument() -> (Arc<Instrumentation>, Log, Arc<Mutex<Vec<RequestCompleteEvent>>>) {
        let instrumentation = Arc::new(Instrumentation::new(InstrumentationConfig::new(
            PageOrigin::parse("https://app.example.com/").unwrap(),
        )));
        let observables = instrumentation.start();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&log);
        let _ = observables.start.subscribe(move |e: &RequestStartEvent| {
            sink.lock().unwrap().push(format!("start:{}", e.request_id));
        });
        let sink = Arc::clone(&log);
        let events = Arc::clone(&completes);
        let _ = observables.complete.subscribe(move |e: &RequestCompleteEvent| {
            sink.lock().unwrap().push(format!("complete:{}", e.request_id));
            events.lock().unwrap().push(e.clone());
        });

        (instrumentation, log, completes)
    }

    fn run(script: Script) -> (Vec<String>, Vec<RequestCompleteEvent>) {
        let (instrumentation, log, completes) = instrument();
        let surface = instrumentation.wrap_callback(ScriptedSurface::new(script, 200));
        let mut call = surface.open("GET", "/api/items");
        call.send(None);
        let log = log.lock().unwrap().clone();
        let completes = completes.lock().unwrap().clone();
        (log, completes)
    }

    #[test]
    fn test_both_signals_publish_once() {
        for script in [Script::Both, Script::Reversed] {
            let (log, completes) = run(script);
            assert_eq!(log.len(), 2);
            assert!(log[0].starts_with("start:"));
            assert!(log[1].starts_with("complete:"));
            assert_eq!(completes.len(), 1);
        }
    }

    #[test]
    fn test_either_signal_alone_completes() {
        for script in [Script::ReadyStateOnly, Script::LoadEndOnly] {
            let (_, completes) = run(script);
            assert_eq!(completes.len(), 1);
            assert_eq!(completes[0].status, 200);
            assert_eq!(completes[0].response_body.as_deref(), Some("payload"));
            assert_eq!(completes[0].method, "GET");
            assert_eq!(completes[0].kind, RequestKind::Callback);
        }
    }

    #[test]
    fn test_aborted_call_publishes_no_completion() {
        let (log, completes) = run(Script::Abort);
        assert_eq!(log.len(), 1);
        assert!(completes.is_empty());
    }

    #[test]
    fn test_headers_injected_for_same_origin_only() {
        let (instrumentation, _, _) = instrument();
        let surface = instrumentation.wrap_callback(ScriptedSurface::new(Script::Both, 200));

        surface.open("GET", "/api").send(None);
        surface.open("GET", "https://other.example.net/api").send(None);

        let sent = surface.inner().sent_headers.lock().unwrap();
        assert_eq!(sent[0].len(), 5);
        assert!(sent[0].iter().any(|(k, _)| k == TRACE_ID_HEADER));
        assert!(sent[0].iter().any(|(k, v)| k == ORIGIN_HEADER && v == "rum"));
        assert!(sent[1].is_empty());
    }

    #[test]
    fn test_user_listeners_still_receive_events() {
        let (instrumentation, _, _) = instrument();
        let surface = instrumentation.wrap_callback(ScriptedSurface::new(Script::Both, 404));
        let seen = Arc::new(Mutex::new(0usize));

        let mut call = surface.open("GET", "/missing");
        let counter = Arc::clone(&seen);
        call.add_listener(Box::new(move |_| *counter.lock().unwrap() += 1));
        call.send(None);

        // Loading, Done, LoadEnd
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[test]
    fn test_status_zero_is_a_valid_completion() {
        let (instrumentation, _, completes) = instrument();
        let surface = instrumentation.wrap_callback(ScriptedSurface::new(Script::LoadEndOnly, 0));
        surface.open("POST", "/upload").send(Some("data".into()));

        let completes = completes.lock().unwrap();
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].status, 0);
    }
}
