//! Engine fan-out behavior driven through mock data-source clients:
//! resolution fatality, per-source failure isolation, parameter plumbing and
//! merge semantics, without touching a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::sleep;

use fragment_enricher::engine::RESULT_KEY;
use fragment_enricher::{
    DataSourceClient, DeclaredSource, EndpointResult, EnrichmentEngine, FailureCause, Fragment,
    RequestContext, ResponseCache, SourceDefinition, Transition,
};

/// Serves a canned outcome; records hits and the params it was called with.
struct MockClient {
    outcome: Result<(u16, String), FailureCause>,
    delay: Duration,
    hits: Arc<AtomicUsize>,
    seen_params: Arc<Mutex<Option<Map<String, Value>>>>,
}

impl MockClient {
    fn json(body: Value) -> Self {
        Self::with_status(200, body)
    }

    fn with_status(status: u16, body: Value) -> Self {
        Self {
            outcome: Ok((status, body.to_string())),
            delay: Duration::ZERO,
            hits: Arc::new(AtomicUsize::new(0)),
            seen_params: Arc::new(Mutex::new(None)),
        }
    }

    fn failing(cause: FailureCause) -> Self {
        Self {
            outcome: Err(cause),
            delay: Duration::ZERO,
            hits: Arc::new(AtomicUsize::new(0)),
            seen_params: Arc::new(Mutex::new(None)),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl DataSourceClient for MockClient {
    async fn call(
        &self,
        params: &Map<String, Value>,
        _ctx: &RequestContext,
        _payload: &Value,
    ) -> Result<EndpointResult, FailureCause> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        *self.seen_params.lock().expect("poisoned params lock") = Some(params.clone());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        match &self.outcome {
            Ok((status_code, body)) => Ok(EndpointResult {
                status_code: *status_code,
                headers: Vec::new(),
                body: body.clone(),
                timed_out: false,
            }),
            Err(cause) => Err(cause.clone()),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn definition(pattern: &str, adapter: &str, params: Map<String, Value>) -> SourceDefinition {
    SourceDefinition {
        name_pattern: pattern.to_string(),
        adapter: adapter.to_string(),
        cache_key: String::new(),
        params,
    }
}

fn engine(
    definitions: Vec<SourceDefinition>,
    clients: Vec<(&str, MockClient)>,
) -> EnrichmentEngine {
    let cache = Arc::new(ResponseCache::new(100, Duration::from_secs(60)));
    let mut adapters: HashMap<String, Arc<dyn DataSourceClient>> = HashMap::new();
    for (name, client) in clients {
        adapters.insert(name.to_string(), Arc::new(client));
    }
    EnrichmentEngine::with_clients(&definitions, adapters, cache).expect("engine wiring")
}

#[tokio::test]
async fn unresolvable_source_aborts_fragment_before_any_fetch() {
    let client = MockClient::json(json!({"ok": true}));
    let hits = Arc::clone(&client.hits);
    let engine = engine(
        vec![definition("known", "a", Map::new())],
        vec![("a", client)],
    );

    let fragment = Fragment::new()
        .with_source(DeclaredSource::new("known"))
        .with_source(DeclaredSource::new("unknown"));
    let err = engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.name, "unknown");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "no fetch may start");
}

#[tokio::test]
async fn one_failing_source_does_not_abort_siblings() {
    let ok = MockClient::json(json!({"ok": true}));
    let ok_hits = Arc::clone(&ok.hits);
    let bad = MockClient::failing(FailureCause::Transport {
        detail: "connection refused".into(),
    });
    let engine = engine(
        vec![
            definition("good", "a", Map::new()),
            definition("bad", "b", Map::new()),
        ],
        vec![("a", ok), ("b", bad)],
    );

    let fragment = Fragment::new()
        .with_source(DeclaredSource::new("good").namespaced("good"))
        .with_source(DeclaredSource::new("bad").namespaced("bad"))
        .with_fallback();
    let outcome = engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .expect("resolution");

    assert_eq!(outcome.transition, Transition::Success);
    assert_eq!(ok_hits.load(Ordering::SeqCst), 1);
    let payload = outcome.payload.expect("payload");
    assert_eq!(payload["good"][RESULT_KEY], json!({"ok": true}));
    assert!(payload.get("bad").is_none());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].source, "bad");
}

#[tokio::test]
async fn failure_without_fallback_is_fatal_and_drops_payload() {
    let ok = MockClient::json(json!({"ok": true}));
    let bad = MockClient::failing(FailureCause::Transport {
        detail: "connection refused".into(),
    });
    let engine = engine(
        vec![
            definition("good", "a", Map::new()),
            definition("bad", "b", Map::new()),
        ],
        vec![("a", ok), ("b", bad)],
    );

    let fragment = Fragment::new()
        .with_source(DeclaredSource::new("good"))
        .with_source(DeclaredSource::new("bad"));
    let outcome = engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .expect("resolution");

    assert_eq!(outcome.transition, Transition::Error);
    assert!(outcome.payload.is_none());
    assert_eq!(outcome.failures.len(), 1);
}

#[tokio::test]
async fn merged_params_reach_the_client() {
    let mut defaults = Map::new();
    defaults.insert("limit".to_string(), json!(10));
    defaults.insert("lang".to_string(), json!("en"));
    let client = MockClient::json(json!({"ok": true}));
    let seen = Arc::clone(&client.seen_params);
    let engine = engine(vec![definition("list", "a", defaults)], vec![("a", client)]);

    let fragment =
        Fragment::new().with_source(DeclaredSource::new("list").param("limit", json!(50)));
    engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .expect("resolution");

    let params = seen
        .lock()
        .expect("poisoned params lock")
        .clone()
        .expect("client called");
    assert_eq!(params.get("limit"), Some(&json!(50)));
    assert_eq!(params.get("lang"), Some(&json!("en")));
}

#[tokio::test]
async fn existing_payload_keys_survive_enrichment() {
    let client = MockClient::json(json!({"fresh": true}));
    let engine = engine(vec![definition("svc", "a", Map::new())], vec![("a", client)]);

    let fragment = Fragment::new()
        .with_payload(json!({"existing": 1}))
        .with_source(DeclaredSource::new("svc"));
    let outcome = engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .expect("resolution");

    let payload = outcome.payload.expect("payload");
    assert_eq!(payload["existing"], json!(1));
    assert_eq!(payload[RESULT_KEY], json!({"fresh": true}));
}

#[tokio::test]
async fn unnamespaced_collision_goes_to_the_later_completion() {
    // Both sources merge at top level; the slow one completes last and wins.
    let fast = MockClient::json(json!({"winner": "fast"}));
    let slow = MockClient::json(json!({"winner": "slow"})).delayed(Duration::from_millis(100));
    let engine = engine(
        vec![
            definition("fast", "a", Map::new()),
            definition("slow", "b", Map::new()),
        ],
        vec![("a", fast), ("b", slow)],
    );

    let fragment = Fragment::new()
        .with_source(DeclaredSource::new("fast"))
        .with_source(DeclaredSource::new("slow"));
    let outcome = engine
        .enrich(&fragment, &RequestContext::new())
        .await
        .expect("resolution");

    let payload = outcome.payload.expect("payload");
    assert_eq!(payload[RESULT_KEY], json!({"winner": "slow"}));
}
