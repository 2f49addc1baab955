// src/failure.rs
//! Failure taxonomy: per-source causes recorded in the fragment failure log,
//! plus the one fragment-fatal error (missing source configuration).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single data-source call failed for the current fragment.
///
/// Per-source failures are isolated: they are appended to the fragment's
/// failure log and never abort sibling sources. Whether they make the whole
/// fragment fail depends on the fallback flag, decided by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FailureCause {
    /// The remote answered with a server-error status (>= 500). Client-error
    /// statuses (4xx) are not failures; their data is passed through.
    #[error("remote responded with server error {status}")]
    RemoteServerError { status: u16 },

    /// The call itself succeeded but the body is not a JSON object or array.
    #[error("response body is not valid JSON: {detail}")]
    Decode { detail: String },

    /// The remote never answered within the configured window. The only cause
    /// that can turn into a `Timeout` transition.
    #[error("no response from remote endpoint within the configured window")]
    Timeout,

    /// A configured response predicate rejected the call.
    #[error("response predicate {name} not satisfied")]
    Predicate { name: String },

    /// Connection-level failure (refused, DNS, broken stream).
    #[error("transport error: {detail}")]
    Transport { detail: String },
}

impl FailureCause {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A fragment declared a source that matches no configured definition.
/// Fatal for the whole fragment: no enriched payload is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no configuration for source: {name}")]
pub struct ResolutionError {
    pub name: String,
}
