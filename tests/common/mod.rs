//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay::http::{
    CancellationToken, HttpClientBuilder, HttpClientConfig, HttpClientError, Request, Response,
    Result, StatusCode, Transport,
};

pub const BASE_URL: &str = "https://api.relay.test";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Messages of the events seen by a [`capture_events`] subscriber.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, message: &str) -> bool {
        self.0.lock().iter().any(|seen| seen == message)
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventLog {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        struct Message(Option<String>);

        impl tracing::field::Visit for Message {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = Some(format!("{value:?}"));
                }
            }
        }

        let mut message = Message(None);
        event.record(&mut message);
        if let Some(message) = message.0 {
            self.0.lock().push(message);
        }
    }
}

/// Record every event on this thread until the guard is dropped.
///
/// Use with a current-thread runtime so the call runs on the test thread.
pub fn capture_events() -> (EventLog, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::layer::SubscriberExt;

    let log = EventLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());
    (log, tracing::subscriber::set_default(subscriber))
}

/// `200 OK` with a `text/plain` body.
pub fn text(body: &str) -> Response {
    Response::new(StatusCode::OK)
        .with_header("content-type", "text/plain")
        .with_body(body.to_string())
}

enum Scripted {
    Respond(Response),
    Fail(HttpClientError),
}

/// Transport answering from a script, recording every request it sees.
///
/// Once the script runs out the fallback response is returned.
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Response,
    requests: Mutex<Vec<Request>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Response::new(StatusCode::OK),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn respond(self, response: Response) -> Self {
        self.script.lock().push_back(Scripted::Respond(response));
        self
    }

    pub fn respond_status(self, status: StatusCode) -> Self {
        self.respond(Response::new(status))
    }

    pub fn respond_text(self, body: &str) -> Self {
        self.respond(text(body))
    }

    pub fn fail(self, error: HttpClientError) -> Self {
        self.script.lock().push_back(Scripted::Fail(error));
        self
    }

    pub fn fallback(mut self, response: Response) -> Self {
        self.fallback = response;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request, cancellation: &CancellationToken) -> Result<Response> {
        self.requests.lock().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(HttpClientError::OperationCanceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Respond(response)) => Ok(response.with_url(request.url().clone())),
            Some(Scripted::Fail(error)) => Err(error),
            None => Ok(self.fallback.clone().with_url(request.url().clone())),
        }
    }
}

/// Client builder wired to `transport` with the given configuration.
pub fn client_with(transport: &Arc<MockTransport>, config: HttpClientConfig) -> HttpClientBuilder {
    init_tracing();
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    relay::HttpClient::builder(config).shared_transport(transport)
}

/// Client builder with the base URL set and no retries.
pub fn client(transport: &Arc<MockTransport>) -> HttpClientBuilder {
    client_with(
        transport,
        HttpClientConfig::builder().base_url(BASE_URL).build(),
    )
}
