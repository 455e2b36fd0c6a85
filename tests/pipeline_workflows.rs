//! Integration tests for the handler pipeline.
//!
//! These drive complete calls through a scripted transport and check the
//! observable behaviour of stages, priorities and the built-in handlers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use async_trait::async_trait;
use relay::http::{
    AuthHandler, CACHE_HIT, CacheHandler, CancellationToken, CircuitBreakerConfig, ErrorContext,
    ExceptionContext, Handler, HttpClient, HttpClientConfig, HttpClientError, Method, Priority,
    RETRY_COUNT, Response, ResultContext, RetryConfig, SendingContext, SentContext, StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use common::{BASE_URL, MockTransport, capture_events, client, client_with, text};

// =============================================================================
// Ordering
// =============================================================================

const SEQUENTIAL: [Priority; 5] = [
    Priority::First,
    Priority::High,
    Priority::Default,
    Priority::Low,
    Priority::Last,
];

proptest! {
    #[test]
    fn handlers_fire_by_priority_then_registration(picks in proptest::collection::vec(0usize..5, 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let fired = runtime.block_on(async {
            let transport = MockTransport::new().shared();
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut builder = client(&transport);
            for (index, pick) in picks.iter().copied().enumerate() {
                let log = Arc::clone(&log);
                builder = builder.on_fn(SEQUENTIAL[pick], move |_: &mut SendingContext| {
                    log.lock().push((pick, index));
                    Ok(())
                });
            }

            builder.build().unwrap().get("/ordered").send().await.unwrap();
            let fired = log.lock().clone();
            fired
        });

        let mut expected: Vec<(usize, usize)> = picks
            .iter()
            .copied()
            .enumerate()
            .map(|(index, pick)| (pick, index))
            .collect();
        expected.sort();
        prop_assert_eq!(fired, expected);
    }
}

#[tokio::test]
async fn test_parallel_group_runs_after_last() {
    let transport = MockTransport::new().shared();
    let client = client(&transport)
        .on_fn(Priority::Parallel, |context: &mut SentContext<String>| {
            context.result_mut().write("parallel".to_string());
            Ok(())
        })
        .on_fn(Priority::Last, |context: &mut SentContext<String>| {
            context.result_mut().write("last".to_string());
            Ok(())
        })
        .build()
        .unwrap();

    let value = client.get("/p").result_type::<String>().send().await.unwrap();
    assert_eq!(value, "parallel");
}

#[tokio::test]
async fn test_sequential_writers_observe_previous_value() {
    let transport = MockTransport::new().respond_text("decoded").shared();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut builder = client(&transport);
    for (priority, word) in [
        (Priority::Low, "buckle my shoe"),
        (Priority::First, "one"),
        (Priority::Default, "two"),
    ] {
        let seen = Arc::clone(&seen);
        builder = builder.on_fn(priority, move |context: &mut ResultContext<String>| {
            seen.lock().push(context.result().value().cloned().unwrap_or_default());
            context.result_mut().write(word.to_string());
            Ok(())
        });
    }
    let client = builder.build().unwrap();

    let value = client.get("/rhyme").result_type::<String>().send().await.unwrap();
    assert_eq!(value, "buckle my shoe");
    assert_eq!(*seen.lock(), vec!["decoded", "one", "two"]);
}

// =============================================================================
// Short-circuits
// =============================================================================

#[tokio::test]
async fn test_sending_result_skips_transport() {
    let transport = MockTransport::new().shared();
    let client = client(&transport).build().unwrap();

    let value = client
        .get("/short")
        .result_type::<String>()
        .on_fn(Priority::Default, |context: &mut SendingContext<String, ()>| {
            context.result_mut().write("from handler".to_string());
            Ok(())
        })
        .send()
        .await
        .unwrap();

    assert_eq!(value, "from handler");
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_sending_edits_reach_the_transport() {
    let transport = MockTransport::new().shared();
    let client = client(&transport)
        .on::<SendingContext, _>(Priority::Default, AuthHandler::api_key("x-api-key", "secret"))
        .build()
        .unwrap();

    client
        .post("/items")
        .content(json!({"name": "widget"}))
        .query("dry_run", "true")
        .send()
        .await
        .unwrap();

    let sent = transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(*sent[0].method(), Method::POST);
    assert_eq!(sent[0].url().as_str(), format!("{BASE_URL}/items?dry_run=true"));
    assert_eq!(sent[0].header("x-api-key"), Some("secret"));
    assert_eq!(sent[0].header("content-type"), Some("application/json"));
    assert_eq!(sent[0].body().map(|body| body.as_ref()), Some(&b"{\"name\":\"widget\"}"[..]));
}

// =============================================================================
// Type resolution
// =============================================================================

#[tokio::test]
async fn test_dynamic_handlers_run_for_every_call_shape() {
    let transport = MockTransport::new()
        .respond_text("plain")
        .respond(
            Response::new(StatusCode::OK)
                .with_json(&json!({"id": 7}))
                .unwrap(),
        )
        .shared();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let client = client(&transport)
        .on_fn(Priority::Default, move |context: &mut ResultContext| {
            let name = context.result().value().map(|value| value.type_name());
            log.lock().push(name.unwrap_or("none"));
            Ok(())
        })
        .build()
        .unwrap();

    let plain = client.get("/a").result_type::<String>().send().await.unwrap();
    let value = client
        .get("/b")
        .result_type::<serde_json::Value>()
        .send()
        .await
        .unwrap();

    assert_eq!(plain, "plain");
    assert_eq!(value["id"], 7);
    assert_eq!(
        *seen.lock(),
        vec![
            std::any::type_name::<String>(),
            std::any::type_name::<serde_json::Value>()
        ]
    );
}

#[tokio::test]
async fn test_unrelated_handler_fails_call_unless_suppressed() {
    let transport = MockTransport::new().fallback(text("hello")).shared();
    let client = client(&transport)
        .on_fn(Priority::Default, |context: &mut ResultContext<u64>| {
            context.result_mut().write(42);
            Ok(())
        })
        .build()
        .unwrap();

    let err = client
        .get("/m")
        .result_type::<String>()
        .send()
        .await
        .unwrap_err();
    assert!(err.is_type_mismatch(), "unexpected error: {err}");

    let value = client
        .get("/m")
        .result_type::<String>()
        .suppress_type_mismatch(true)
        .send()
        .await
        .unwrap();
    assert_eq!(value, "hello");
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Dog {
    name: String,
    breed: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Animal {
    name: String,
}

impl From<Dog> for Animal {
    fn from(dog: Dog) -> Self {
        Animal { name: dog.name }
    }
}

fn dog_response() -> Response {
    Response::new(StatusCode::OK)
        .with_json(&json!({"name": "Rex", "breed": "collie"}))
        .unwrap()
}

#[tokio::test]
async fn test_related_types_narrow_to_the_base() {
    let transport = MockTransport::new().fallback(dog_response()).shared();
    let names = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&names);
    let client = client(&transport)
        .relate::<Dog, Animal>()
        .on_fn(Priority::Default, move |context: &mut ResultContext<Animal>| {
            if let Some(animal) = context.result().value() {
                log.lock().push(animal.name.clone());
            }
            Ok(())
        })
        .build()
        .unwrap();

    let dog = client.get("/dogs/1").result_type::<Dog>().send().await.unwrap();
    assert_eq!(
        dog,
        Dog {
            name: "Rex".into(),
            breed: "collie".into()
        }
    );
    assert_eq!(*names.lock(), vec!["Rex".to_string()]);
}

#[tokio::test]
async fn test_unrelated_types_without_relation_mismatch() {
    let transport = MockTransport::new().fallback(dog_response()).shared();
    let client = client(&transport)
        .on_fn(Priority::Default, |_: &mut ResultContext<Animal>| Ok(()))
        .build()
        .unwrap();

    let err = client
        .get("/dogs/1")
        .result_type::<Dog>()
        .send()
        .await
        .unwrap_err();
    assert!(err.is_type_mismatch());
}

// =============================================================================
// Errors and exceptions
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Problem {
    code: String,
}

fn problem_response() -> Response {
    Response::new(StatusCode::BAD_REQUEST)
        .with_json(&json!({"code": "invalid"}))
        .unwrap()
}

#[tokio::test]
async fn test_error_handlers_run_only_on_validation_failure() {
    let transport = MockTransport::new()
        .respond(problem_response())
        .respond_text("fine")
        .shared();
    let codes = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&codes);
    let client = client(&transport)
        .on_fn(Priority::Default, move |context: &mut ErrorContext<Problem>| {
            log.lock().push(context.error().code.clone());
            context.mark_handled();
            Ok(())
        })
        .build()
        .unwrap();

    let handled = client
        .get("/bad")
        .result_type::<String>()
        .error_type::<Problem>()
        .default_result(|| "defaulted".to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(handled, "defaulted");

    let fine = client
        .get("/good")
        .result_type::<String>()
        .error_type::<Problem>()
        .send()
        .await
        .unwrap();
    assert_eq!(fine, "fine");
    assert_eq!(*codes.lock(), vec!["invalid".to_string()]);
}

#[tokio::test]
async fn test_unhandled_error_carries_typed_payload() {
    let transport = MockTransport::new().respond(problem_response()).shared();
    let client = client(&transport).build().unwrap();

    let err = client
        .get("/bad")
        .error_type::<Problem>()
        .send()
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(400));
    assert_eq!(
        err.error_payload::<Problem>(),
        Some(Problem {
            code: "invalid".into()
        })
    );
}

#[tokio::test]
async fn test_exception_handler_recovers_transport_fault() {
    let transport = MockTransport::new()
        .fail(HttpClientError::Connection("refused".into()))
        .shared();
    let client = client(&transport)
        .on_fn(Priority::Default, |context: &mut ExceptionContext| {
            if context.error().is_connection() {
                context.recover_with("offline".to_string());
            }
            Ok(())
        })
        .build()
        .unwrap();

    let value = client.get("/down").result_type::<String>().send().await.unwrap();
    assert_eq!(value, "offline");
}

#[tokio::test]
async fn test_failing_exception_handler_replaces_the_fault() {
    let transport = MockTransport::new()
        .fail(HttpClientError::Transport("boom".into()))
        .shared();
    let client = client(&transport)
        .on_fn(Priority::Default, |_: &mut ExceptionContext| {
            Err(HttpClientError::handler("exception handler failed"))
        })
        .build()
        .unwrap();

    let err = client.get("/down").send().await.unwrap_err();
    assert!(matches!(err, HttpClientError::Handler(_)));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_transport() {
    let transport = MockTransport::new().delay(Duration::from_secs(30)).shared();
    let client = client(&transport).build().unwrap();
    let token = CancellationToken::new();
    let canceller = token.clone();

    let (result, _) = tokio::join!(
        client
            .get("/slow")
            .result_type::<String>()
            .cancellation(token)
            .send(),
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        }
    );

    assert!(result.unwrap_err().is_canceled());
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_cancellation_yields_default() {
    let transport = MockTransport::new().delay(Duration::from_secs(30)).shared();
    let client = client(&transport).build().unwrap();
    let token = CancellationToken::new();
    let canceller = token.clone();

    let (result, _) = tokio::join!(
        client
            .get("/slow")
            .result_type::<String>()
            .cancellation(token)
            .suppress_cancellation(true)
            .default_result(|| "fallback".to_string())
            .send(),
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        }
    );

    assert_eq!(result.unwrap(), "fallback");
}

#[tokio::test]
async fn test_cancelled_before_send_never_reaches_transport() {
    let transport = MockTransport::new().shared();
    let client = client(&transport).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let err = client.get("/never").cancellation(token).send().await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(transport.calls(), 0);
}

// =============================================================================
// Built-in handlers
// =============================================================================

fn retry_config(retry: RetryConfig) -> HttpClientConfig {
    HttpClientConfig::builder()
        .base_url(BASE_URL)
        .retry(retry)
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_retries_share_the_item_bag() {
    let transport = MockTransport::new()
        .respond_status(StatusCode::SERVICE_UNAVAILABLE)
        .respond_status(StatusCode::SERVICE_UNAVAILABLE)
        .respond_text("recovered")
        .shared();
    let counts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&counts);
    let client = client_with(
        &transport,
        retry_config(RetryConfig::constant(3, Duration::from_millis(5))),
    )
    .on_fn(Priority::Last, move |context: &mut SentContext| {
        log.lock().push(context.items().get::<u32>(RETRY_COUNT).unwrap_or(0));
        Ok(())
    })
    .build()
    .unwrap();

    let value = client.get("/flaky").result_type::<String>().send().await.unwrap();

    assert_eq!(value, "recovered");
    assert_eq!(transport.calls(), 3);
    // Innermost attempt first; every level sees both increments.
    assert_eq!(*counts.lock(), vec![2, 2, 2]);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let transport = MockTransport::new()
        .fallback(Response::new(StatusCode::SERVICE_UNAVAILABLE))
        .shared();
    let client = client_with(&transport, retry_config(RetryConfig::immediate(2)))
        .build()
        .unwrap();

    let err = client.get("/down").send().await.unwrap_err();

    assert_eq!(err.status_code(), Some(503));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_see_other_redirect_is_followed_with_get() {
    let transport = MockTransport::new()
        .respond(Response::new(StatusCode::SEE_OTHER).with_header("location", "/orders/7"))
        .respond(
            Response::new(StatusCode::OK)
                .with_json(&json!({"id": 7}))
                .unwrap(),
        )
        .shared();
    let client = client(&transport).build().unwrap();

    let order = client
        .post("/orders")
        .content(json!({"item": "widget"}))
        .result_type::<serde_json::Value>()
        .send()
        .await
        .unwrap();

    assert_eq!(order["id"], 7);
    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(*sent[1].method(), Method::GET);
    assert_eq!(sent[1].url().as_str(), format!("{BASE_URL}/orders/7"));
    assert!(sent[1].body().is_none());
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let transport = MockTransport::new()
        .fallback(Response::new(StatusCode::FOUND).with_header("location", "/loop"))
        .shared();
    let config = HttpClientConfig::builder()
        .base_url(BASE_URL)
        .max_redirects(2)
        .build();
    let client = client_with(&transport, config).build().unwrap();

    let err = client.get("/loop").send().await.unwrap_err();

    assert!(matches!(err, HttpClientError::TooManyRedirects(2)));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_retry_after_redirect_replays_the_redirect_target() {
    let transport = MockTransport::new()
        .respond(Response::new(StatusCode::FOUND).with_header("location", "/b"))
        .respond_status(StatusCode::SERVICE_UNAVAILABLE)
        .respond_text("moved")
        .shared();
    let client = client_with(&transport, retry_config(RetryConfig::immediate(3)))
        .build()
        .unwrap();

    let value = client
        .post("/a")
        .content(json!({"item": "widget"}))
        .result_type::<String>()
        .send()
        .await
        .unwrap();

    assert_eq!(value, "moved");
    let sent = transport.requests();
    let paths: Vec<&str> = sent.iter().map(|request| request.url().path()).collect();
    assert_eq!(paths, ["/a", "/b", "/b"]);
    // The retry repeats the redirected GET, not the original POST.
    assert_eq!(*sent[2].method(), Method::GET);
    assert!(sent[2].body().is_none());
}

#[tokio::test]
async fn test_first_attempt_transport_fault_is_not_retried() {
    let transport = MockTransport::new()
        .fail(HttpClientError::Connection("connection reset".into()))
        .respond_text("never reached")
        .shared();
    let client = client_with(&transport, retry_config(RetryConfig::immediate(3)))
        .build()
        .unwrap();

    let err = client.get("/reset").send().await.unwrap_err();

    assert!(err.is_connection());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_transport_fault_inside_retry_is_retried() {
    let transport = MockTransport::new()
        .respond_status(StatusCode::SERVICE_UNAVAILABLE)
        .fail(HttpClientError::Connection("connection reset".into()))
        .respond_text("recovered")
        .shared();
    let client = client_with(&transport, retry_config(RetryConfig::immediate(3)))
        .build()
        .unwrap();

    let value = client.get("/flaky").result_type::<String>().send().await.unwrap();

    assert_eq!(value, "recovered");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_connection_retries_can_be_disabled() {
    let transport = MockTransport::new()
        .respond_status(StatusCode::SERVICE_UNAVAILABLE)
        .fail(HttpClientError::Connection("connection reset".into()))
        .respond_text("never reached")
        .shared();
    let client = client_with(
        &transport,
        retry_config(RetryConfig::immediate(3).no_retry_on_connection()),
    )
    .build()
    .unwrap();

    let err = client.get("/flaky").send().await.unwrap_err();

    assert!(err.is_connection());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_circuit_opens_after_server_errors() {
    let transport = MockTransport::new()
        .fallback(Response::new(StatusCode::INTERNAL_SERVER_ERROR))
        .shared();
    let config = HttpClientConfig::builder()
        .base_url(BASE_URL)
        .circuit_breaker(CircuitBreakerConfig::new(2, Duration::from_secs(60)))
        .build();
    let client = client_with(&transport, config).build().unwrap();

    for _ in 0..2 {
        let err = client.get("/unstable").send().await.unwrap_err();
        assert_eq!(err.status_code(), Some(500));
    }
    let err = client.get("/unstable").send().await.unwrap_err();

    assert!(matches!(err, HttpClientError::CircuitOpen));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_cache_serves_repeated_gets() {
    let transport = MockTransport::new()
        .respond_text("first")
        .respond_text("second")
        .shared();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&hits);
    let client = client(&transport)
        .with_registry(|registry| {
            CacheHandler::in_memory(Duration::from_secs(60)).install(registry);
        })
        .on_fn(Priority::Last, move |context: &mut SendingContext| {
            log.lock().push(context.items().get::<bool>(CACHE_HIT));
            Ok(())
        })
        .build()
        .unwrap();

    let first = client.get("/cached").result_type::<String>().send().await.unwrap();
    let second = client.get("/cached").result_type::<String>().send().await.unwrap();

    assert_eq!(first, "first");
    assert_eq!(second, "first");
    assert_eq!(transport.calls(), 1);
    assert_eq!(*hits.lock(), vec![Some(false), Some(true)]);
}

// =============================================================================
// Recursion
// =============================================================================

/// Re-enters the call on every Sent pass.
struct AlwaysRecurse;

#[async_trait]
impl Handler<SentContext> for AlwaysRecurse {
    async fn handle(&self, context: &mut SentContext) -> relay::http::Result<()> {
        context.recursive_result().await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_recursion_depth_is_bounded() {
    let transport = MockTransport::new().fallback(text("again")).shared();
    let config = HttpClientConfig::builder()
        .base_url(BASE_URL)
        .max_recursion_depth(3)
        .build();
    let client = client_with(&transport, config)
        .on::<SentContext, _>(Priority::Default, AlwaysRecurse)
        .build()
        .unwrap();

    let err = client.get("/deep").send().await.unwrap_err();

    assert!(matches!(err, HttpClientError::RecursionLimit(3)));
    assert_eq!(transport.calls(), 4);
}

/// Retries once and turns a failed retry into a fallback value.
struct FallbackOnFailedRetry;

#[async_trait]
impl Handler<SentContext<String>> for FallbackOnFailedRetry {
    async fn handle(&self, context: &mut SentContext<String>) -> relay::http::Result<()> {
        if context.items().update::<u32, _>("Passes", |passes| *passes += 1) > 1 {
            return Ok(());
        }
        if let Err(error) = context.recursive_result().await {
            let status = error.status_code().unwrap_or(0);
            context.result_mut().write(format!("fallback after {status}"));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_sent_handler_handles_nested_failure_locally() {
    let (events, _guard) = capture_events();
    let transport = MockTransport::new()
        .respond_text("stale")
        .respond_status(StatusCode::INTERNAL_SERVER_ERROR)
        .shared();
    let client = client(&transport).build().unwrap();

    let value = client
        .get("/report")
        .result_type::<String>()
        .on::<SentContext<String>, _>(Priority::Default, FallbackOnFailedRetry)
        .send()
        .await
        .unwrap();

    assert_eq!(value, "fallback after 500");
    assert_eq!(transport.calls(), 2);
    // The outer response was never decoded once the handler wrote the slot.
    assert!(
        events.contains("releasing unused response"),
        "events: {:?}",
        events.messages()
    );
}

#[tokio::test(flavor = "current_thread")]
async fn test_sent_write_releases_the_response() {
    let (events, _guard) = capture_events();
    let transport = MockTransport::new().respond_text("from the wire").shared();
    let client = client(&transport).build().unwrap();

    let value = client
        .get("/override")
        .result_type::<String>()
        .on_fn(Priority::Default, |context: &mut SentContext<String>| {
            context.result_mut().write("from the handler".to_string());
            Ok(())
        })
        .send()
        .await
        .unwrap();

    assert_eq!(value, "from the handler");
    assert_eq!(transport.calls(), 1);
    assert!(events.contains("releasing unused response"));
}

// =============================================================================
// Real transport
// =============================================================================

#[tokio::test]
async fn test_reqwest_transport_end_to_end() {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .and(header("authorization", "Bearer t0k3n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada", "breed": "human"})))
        .mount(&server)
        .await;

    let config = HttpClientConfig::builder().base_url(server.uri()).build();
    let client = HttpClient::builder(config)
        .on::<SendingContext, _>(Priority::Default, AuthHandler::bearer("t0k3n"))
        .build()
        .unwrap();

    let user = client.get("/users/1").result_type::<Dog>().send().await.unwrap();
    assert_eq!(user.name, "Ada");
}
