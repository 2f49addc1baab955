// src/endpoint.rs
//! Outbound side of a data-source call: builds the request path and header
//! set, enforces the per-endpoint timeout and classifies the response.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::config::EndpointOptions;
use crate::failure::FailureCause;
use crate::fragment::RequestContext;
use crate::placeholders::resolve_path;

/// Synthetic status for calls the remote never answered.
pub const REQUEST_TIMEOUT: u16 = 408;

/// Raw outcome of one endpoint call. Ephemeral: consumed immediately into
/// either a cached value or a failure cause.
#[derive(Debug, Clone)]
pub struct EndpointResult {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Set only on the synthetic timeout result, so a genuine remote 408
    /// stays distinguishable from "remote never answered".
    pub timed_out: bool,
}

impl EndpointResult {
    fn request_timeout() -> Self {
        Self {
            status_code: REQUEST_TIMEOUT,
            headers: Vec::new(),
            body: String::new(),
            timed_out: true,
        }
    }
}

/// The fetch seam the engine works against; lets tests drive the engine
/// without a socket.
#[async_trait]
pub trait DataSourceClient: Send + Sync {
    async fn call(
        &self,
        params: &Map<String, Value>,
        ctx: &RequestContext,
        payload: &Value,
    ) -> Result<EndpointResult, FailureCause>;

    /// Adapter identifier for diagnostics.
    fn name(&self) -> &str;
}

/// Strict response validators attachable per endpoint, looked up by the name
/// used in configuration. A failing predicate is an error outcome for that
/// call, not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePredicate {
    /// Requires an `application/json` content type.
    Json,
    /// Requires a success-class (2xx) status.
    ScSuccess,
}

impl ResponsePredicate {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "JSON" => Ok(Self::Json),
            "SC_SUCCESS" => Ok(Self::ScSuccess),
            other => bail!("unknown response predicate: {other}"),
        }
    }

    fn check(&self, status_code: u16, headers: &[(String, String)]) -> Result<(), FailureCause> {
        let satisfied = match self {
            Self::Json => headers.iter().any(|(key, value)| {
                key.eq_ignore_ascii_case("content-type") && value.starts_with("application/json")
            }),
            Self::ScSuccess => (200..300).contains(&status_code),
        };
        if satisfied {
            Ok(())
        } else {
            Err(FailureCause::Predicate {
                name: format!("{self:?}"),
            })
        }
    }
}

/// One configured remote JSON endpoint; issues GET requests only.
pub struct EndpointClient {
    http: reqwest::Client,
    options: EndpointOptions,
    allowed_headers: Vec<Regex>,
    predicates: Vec<ResponsePredicate>,
}

impl EndpointClient {
    pub fn from_options(options: EndpointOptions) -> Result<Self> {
        let mut allowed_headers = Vec::with_capacity(options.allowed_request_headers.len());
        for pattern in &options.allowed_request_headers {
            let re = RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid allowed header pattern {pattern:?}"))?;
            allowed_headers.push(re);
        }

        let mut predicates = Vec::with_capacity(options.predicates.len());
        for name in &options.predicates {
            predicates.push(ResponsePredicate::from_name(name)?);
        }

        let http = reqwest::Client::builder()
            .user_agent("fragment-enricher/0.1")
            .build()
            .context("building http client")?;

        Ok(Self {
            http,
            options,
            allowed_headers,
            predicates,
        })
    }

    /// Source params may carry a `path` overriding the endpoint template.
    fn path_template<'a>(&'a self, params: &'a Map<String, Value>) -> &'a str {
        params
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(&self.options.path)
    }

    /// Forwards only client headers matching the allow-patterns; configured
    /// additional headers are added afterwards and win on name collision.
    fn request_headers(&self, ctx: &RequestContext) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = ctx
            .headers
            .iter()
            .filter(|(name, _)| self.allowed_headers.iter().any(|re| re.is_match(name)))
            .cloned()
            .collect();
        for (name, value) in &self.options.additional_headers {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }
        headers
    }
}

#[async_trait]
impl DataSourceClient for EndpointClient {
    async fn call(
        &self,
        params: &Map<String, Value>,
        ctx: &RequestContext,
        payload: &Value,
    ) -> Result<EndpointResult, FailureCause> {
        let path = resolve_path(self.path_template(params), ctx, payload);
        let url = format!("http://{}:{}{}", self.options.domain, self.options.port, path);

        let mut request = self.http.get(&url);
        for (name, value) in self.request_headers(ctx) {
            request = request.header(name, value);
        }

        debug!(%url, adapter = %self.options.adapter, "requesting data from endpoint");

        let send = request.send();
        let response = if self.options.request_timeout_ms > 0 {
            let window = Duration::from_millis(self.options.request_timeout_ms);
            match tokio::time::timeout(window, send).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!(%url, timeout_ms = self.options.request_timeout_ms,
                        "endpoint did not answer within the configured window");
                    return Ok(EndpointResult::request_timeout());
                }
            }
        } else {
            send.await
        };

        let response = response.map_err(|e| {
            error!(%url, error = %e, "endpoint call failed");
            FailureCause::Transport {
                detail: e.to_string(),
            }
        })?;

        let status_code = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        for predicate in &self.predicates {
            predicate.check(status_code, &headers)?;
        }

        let body = response.text().await.map_err(|e| FailureCause::Transport {
            detail: e.to_string(),
        })?;

        Ok(EndpointResult {
            status_code,
            headers,
            body,
            timed_out: false,
        })
    }

    fn name(&self) -> &str {
        &self.options.adapter
    }
}
