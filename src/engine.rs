// src/engine.rs
//! # Enrichment Engine
//! Fans out one fragment's resolved sources concurrently, applies the
//! cache-or-fetch orchestration per source, folds the JSON results into the
//! fragment payload and decides the final transition.
//!
//! Fan-out is an explicit task group: one spawned task per resolved source,
//! collected in completion order. There is no ordering guarantee across
//! sources; colliding top-level keys from un-namespaced sources are
//! last-writer-wins. Namespacing is the way to avoid collisions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cache::ResponseCache;
use crate::config::{EnricherConfig, SourceDefinition};
use crate::endpoint::{DataSourceClient, EndpointClient, EndpointResult};
use crate::failure::{FailureCause, ResolutionError};
use crate::fragment::{FailureEntry, Fragment, RequestContext};
use crate::resolver::{SourceRequest, SourceResolver};

/// Key the raw JSON body is stored under in a per-source result object.
pub const RESULT_KEY: &str = "_result";
/// Key the response metadata is stored under in a per-source result object.
pub const RESPONSE_KEY: &str = "_response";

/// Terminal signal handed back to the host pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transition {
    Success,
    Error,
    Timeout,
}

/// What one `enrich` call produced for a fragment.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub transition: Transition,
    /// `None` on a fatal outcome: the fragment carries no enriched payload.
    pub payload: Option<Value>,
    pub failures: Vec<FailureEntry>,
}

/// One-time metrics registration (so series show up wherever the host exports).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "enricher_cache_fresh_hits_total",
            "Source results served from cache without any remote call."
        );
        describe_counter!(
            "enricher_cache_stale_hits_total",
            "Stale source results served while a background refresh runs."
        );
        describe_counter!(
            "enricher_cache_misses_total",
            "Source results fetched synchronously on cache miss."
        );
        describe_counter!(
            "enricher_cache_refresh_failures_total",
            "Background cache refreshes that failed (logged, never surfaced)."
        );
        describe_counter!(
            "enricher_source_failures_total",
            "Per-source failures recorded in fragment failure logs."
        );
    });
}

pub struct EnrichmentEngine {
    resolver: SourceResolver,
    adapters: HashMap<String, Arc<dyn DataSourceClient>>,
    cache: Arc<ResponseCache>,
}

impl EnrichmentEngine {
    /// Builds the whole static wiring up front: compiled source definitions,
    /// one endpoint client per `adapter` ref, the shared response cache.
    /// A definition referring to an unknown adapter is a startup error, not a
    /// runtime lookup failure.
    pub fn from_config(config: &EnricherConfig) -> Result<Self> {
        let mut adapters: HashMap<String, Arc<dyn DataSourceClient>> = HashMap::new();
        for options in &config.endpoints {
            let adapter = options.adapter.clone();
            let client = EndpointClient::from_options(options.clone())
                .with_context(|| format!("building endpoint client {adapter:?}"))?;
            adapters.insert(adapter, Arc::new(client));
        }
        for definition in &config.definitions {
            if !adapters.contains_key(&definition.adapter) {
                bail!(
                    "definition {:?} refers to unknown adapter {:?}",
                    definition.name_pattern,
                    definition.adapter
                );
            }
        }
        let cache = Arc::new(ResponseCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_seconds),
        ));
        Self::with_clients(&config.definitions, adapters, cache)
    }

    /// Wiring seam for hosts (and tests) providing their own clients.
    pub fn with_clients(
        definitions: &[SourceDefinition],
        adapters: HashMap<String, Arc<dyn DataSourceClient>>,
        cache: Arc<ResponseCache>,
    ) -> Result<Self> {
        Ok(Self {
            resolver: SourceResolver::from_definitions(definitions)?,
            adapters,
            cache,
        })
    }

    /// Enrich one fragment against the per-request client context.
    ///
    /// A `ResolutionError` aborts the whole fragment before any fetch starts.
    /// Per-source failures are isolated and recorded; whether they are fatal
    /// depends on the fragment's fallback flag.
    pub async fn enrich(
        &self,
        fragment: &Fragment,
        ctx: &RequestContext,
    ) -> Result<EnrichmentOutcome, ResolutionError> {
        ensure_metrics_described();

        let mut requests = Vec::with_capacity(fragment.sources.len());
        for declared in &fragment.sources {
            requests.push(self.resolver.resolve(declared)?);
        }

        let mut failures: Vec<FailureEntry> = Vec::new();
        let mut tasks: JoinSet<(SourceRequest, Result<Value, FailureCause>)> = JoinSet::new();
        for request in requests {
            let Some(client) = self.adapters.get(&request.adapter) else {
                // Unreachable when built via from_config; custom wiring can
                // miss an adapter and that must not kill sibling sources.
                error!(adapter = %request.adapter, source = %request.name, "no client for adapter");
                failures.push(FailureEntry::new(
                    request.name,
                    FailureCause::Transport {
                        detail: format!("no client wired for adapter {:?}", request.adapter),
                    },
                ));
                continue;
            };
            let client = Arc::clone(client);
            let cache = Arc::clone(&self.cache);
            let ctx = ctx.clone();
            let payload = fragment.payload.clone();
            tasks.spawn(async move {
                let outcome = fetch_with_cache(client, cache, &request, &ctx, &payload).await;
                (request, outcome)
            });
        }

        // Fold in completion order.
        let mut merged = match &fragment.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((request, Ok(result))) => {
                    debug!(source = %request.name, "merging source result");
                    merge_result(&mut merged, &request, result);
                }
                Ok((request, Err(cause))) => {
                    error!(source = %request.name, %cause, "data source failed");
                    counter!("enricher_source_failures_total").increment(1);
                    failures.push(FailureEntry::new(request.name, cause));
                }
                Err(join_error) => {
                    // A panicking fetch task is a bug; keep sibling sources alive.
                    error!(error = %join_error, "source fetch task failed to join");
                }
            }
        }

        let transition = decide_transition(&failures, fragment.has_fallback);
        let payload = match transition {
            Transition::Success => Some(Value::Object(merged)),
            Transition::Error | Transition::Timeout => None,
        };
        Ok(EnrichmentOutcome {
            transition,
            payload,
            failures,
        })
    }
}

/// Cache-or-fetch for one source: fresh hit answers without a network call,
/// stale hit answers immediately and refreshes in the background, miss
/// fetches synchronously.
async fn fetch_with_cache(
    client: Arc<dyn DataSourceClient>,
    cache: Arc<ResponseCache>,
    request: &SourceRequest,
    ctx: &RequestContext,
    payload: &Value,
) -> Result<Value, FailureCause> {
    match cache.get(&request.cache_key) {
        Some(entry) if !entry.is_expired() => {
            debug!(key = %request.cache_key, "fresh cache hit");
            counter!("enricher_cache_fresh_hits_total").increment(1);
            Ok(entry.value)
        }
        Some(entry) => {
            debug!(key = %request.cache_key, "stale cache hit, scheduling refresh");
            counter!("enricher_cache_stale_hits_total").increment(1);
            spawn_background_refresh(client, cache, request.clone(), ctx.clone(), payload.clone());
            Ok(entry.value)
        }
        None => {
            counter!("enricher_cache_misses_total").increment(1);
            fetch_and_store(client.as_ref(), &cache, request, ctx, payload).await
        }
    }
}

/// Fire-and-forget: the triggering caller already holds the stale value and
/// never waits for (or learns about) the refresh.
fn spawn_background_refresh(
    client: Arc<dyn DataSourceClient>,
    cache: Arc<ResponseCache>,
    request: SourceRequest,
    ctx: RequestContext,
    payload: Value,
) {
    tokio::spawn(async move {
        match fetch_and_store(client.as_ref(), &cache, &request, &ctx, &payload).await {
            Ok(_) => debug!(key = %request.cache_key, "cache refreshed with new value"),
            Err(cause) => {
                counter!("enricher_cache_refresh_failures_total").increment(1);
                warn!(key = %request.cache_key, %cause, "background cache refresh failed");
            }
        }
    });
}

/// One remote call mapped into a result object. Only mergeable successes
/// reach the cache; timeouts, server errors and undecodable bodies do not.
async fn fetch_and_store(
    client: &dyn DataSourceClient,
    cache: &ResponseCache,
    request: &SourceRequest,
    ctx: &RequestContext,
    payload: &Value,
) -> Result<Value, FailureCause> {
    let result = client.call(&request.params, ctx, payload).await?;
    let object = into_result_object(result)?;
    cache.put(&request.cache_key, object.clone());
    Ok(object)
}

/// Maps a raw endpoint result to
/// `{"_result": <body>, "_response": {"statusCode": "<code>"}}`.
///
/// Status policy: the server-error class (>= 500) fails the source;
/// everything below, 4xx included, is valid data the caller may inspect via
/// `_response.statusCode` (kept as a string on the wire).
fn into_result_object(result: EndpointResult) -> Result<Value, FailureCause> {
    if result.timed_out {
        return Err(FailureCause::Timeout);
    }
    if result.status_code >= 500 {
        return Err(FailureCause::RemoteServerError {
            status: result.status_code,
        });
    }

    let trimmed = result.body.trim();
    if trimmed.is_empty() {
        return Err(FailureCause::Decode {
            detail: "empty response body".into(),
        });
    }
    let parsed: Value = serde_json::from_str(trimmed).map_err(|e| FailureCause::Decode {
        detail: e.to_string(),
    })?;
    if !parsed.is_object() && !parsed.is_array() {
        return Err(FailureCause::Decode {
            detail: format!(
                "neither JSON object nor array: [{}]",
                trimmed.chars().take(15).collect::<String>()
            ),
        });
    }

    let mut response_meta = Map::new();
    response_meta.insert(
        "statusCode".to_string(),
        Value::String(result.status_code.to_string()),
    );
    let mut object = Map::new();
    object.insert(RESULT_KEY.to_string(), parsed);
    object.insert(RESPONSE_KEY.to_string(), Value::Object(response_meta));
    Ok(Value::Object(object))
}

/// Namespaced results nest under the namespace key; un-namespaced results
/// shallow-merge at top level, last writer wins per key.
fn merge_result(target: &mut Map<String, Value>, request: &SourceRequest, result: Value) {
    match request.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => {
            target.insert(namespace.to_string(), result);
        }
        _ => {
            if let Value::Object(fields) = result {
                for (key, value) in fields {
                    target.insert(key, value);
                }
            }
        }
    }
}

/// Fallback content tolerates failures (degraded success); without it any
/// failure is fatal. `Timeout` is surfaced only when timeouts are all that
/// went wrong.
fn decide_transition(failures: &[FailureEntry], has_fallback: bool) -> Transition {
    if failures.is_empty() || has_fallback {
        return Transition::Success;
    }
    if failures.iter().all(|entry| entry.cause.is_timeout()) {
        Transition::Timeout
    } else {
        Transition::Error
    }
}

/// Reads the status code back out of a per-source result object, for hosts
/// inspecting merged payloads.
pub fn result_status_code(result: &Value) -> Option<u16> {
    result
        .get(RESPONSE_KEY)?
        .get("statusCode")?
        .as_str()?
        .parse()
        .ok()
}
