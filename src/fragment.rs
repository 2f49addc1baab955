// src/fragment.rs
//! Inbound interface types: the fragment being enriched and the per-request
//! context carrying the original client request for placeholder substitution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::EnrichmentOutcome;
use crate::failure::FailureCause;

/// One data-source dependency declared by a fragment: `{name, namespace, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredSource {
    pub name: String,
    /// Groups this source's result under a sub-key of the payload.
    /// `None` (or empty) merges at top level.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Fragment-declared params; override the definition defaults on collision.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl DeclaredSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            params: Map::new(),
        }
    }

    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// One entry of the fragment failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub source: String,
    pub cause: FailureCause,
    pub at: DateTime<Utc>,
}

impl FailureEntry {
    pub fn new(source: impl Into<String>, cause: FailureCause) -> Self {
        Self {
            source: source.into(),
            cause,
            at: Utc::now(),
        }
    }
}

/// A unit of page content with data-source dependencies and a JSON payload.
///
/// The engine never mutates the fragment; it returns a fresh merged payload in
/// the outcome and the host applies it (see [`Fragment::apply`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub sources: Vec<DeclaredSource>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
    /// When fallback content exists, per-source failures degrade the fragment
    /// instead of failing it.
    #[serde(default)]
    pub has_fallback: bool,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: DeclaredSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.has_fallback = true;
        self
    }

    /// Replace the payload with the outcome's merged payload (when one was
    /// produced) and append the recorded failures to the fragment log.
    pub fn apply(&mut self, outcome: EnrichmentOutcome) -> crate::engine::Transition {
        if let Some(payload) = outcome.payload {
            self.payload = payload;
        }
        self.failures.extend(outcome.failures);
        outcome.transition
    }
}

/// Read-only view of the original client request, used for request-path
/// placeholder substitution and header forwarding.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Multi-valued; preserved in arrival order.
    pub headers: Vec<(String, String)>,
    pub query: HashMap<String, String>,
    pub path: String,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}
