// src/config.rs
//! Static configuration: source definitions, endpoint options and cache
//! options. Loaded once at startup from TOML, with an env override for the
//! file path. Immutable afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const ENV_CONFIG_PATH: &str = "ENRICHER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/enricher.toml";

const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Matches a fragment-declared source name to the endpoint that serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDefinition {
    /// Regex matched against the declared name with full-match semantics.
    pub name_pattern: String,
    /// Which endpoint configuration handles this source.
    pub adapter: String,
    /// Verbatim cache key shared across fragments requesting logically the
    /// same resource. Empty = derive from name + params.
    #[serde(default)]
    pub cache_key: String,
    /// Defaults; fragment-declared params win on collision.
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// One remote JSON endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointOptions {
    /// Identifier source definitions refer to via `adapter`.
    pub adapter: String,
    pub domain: String,
    pub port: u16,
    /// Request path template; `{header.*}`, `{param.*}`, `{uri.path}` and
    /// `{payload.*}` placeholders are substituted per call. A `path` entry in
    /// the source params overrides this template.
    #[serde(default)]
    pub path: String,
    /// Only client headers matching one of these patterns are forwarded.
    #[serde(default)]
    pub allowed_request_headers: Vec<String>,
    /// Added after filtering; win over same-named forwarded headers.
    #[serde(default)]
    pub additional_headers: BTreeMap<String, String>,
    /// Zero disables the timeout.
    #[serde(default)]
    pub request_timeout_ms: u64,
    /// Strict response validators by name: "JSON", "SC_SUCCESS".
    #[serde(default)]
    pub predicates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// `0` is a valid setting: every entry is stale on the next read, so reads
    /// always answer from cache and refresh in the background.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ttl_seconds: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnricherConfig {
    #[serde(default)]
    pub definitions: Vec<SourceDefinition>,
    #[serde(default)]
    pub endpoints: Vec<EndpointOptions>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl EnricherConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading enricher config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing enricher config from {}", path.display()))
    }

    /// Load using env var + fallback:
    /// 1) $ENRICHER_CONFIG_PATH
    /// 2) config/enricher.toml
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::from_path(&pb);
            }
            return Err(anyhow!("ENRICHER_CONFIG_PATH points to non-existent path"));
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::from_path(&fallback);
        }
        Err(anyhow!("no enricher configuration file found"))
    }

    pub fn endpoint(&self, adapter: &str) -> Option<&EndpointOptions> {
        self.endpoints.iter().find(|e| e.adapter == adapter)
    }
}
