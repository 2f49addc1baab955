// src/resolver.rs
//! Source resolution: matches a declared source name against the configured
//! definitions, merges default and declared params, and derives the cache key.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::SourceDefinition;
use crate::failure::ResolutionError;
use crate::fragment::DeclaredSource;

/// A declared source resolved against exactly one matching definition.
/// Everything the engine needs to fetch and merge one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub name: String,
    pub namespace: Option<String>,
    pub params: Map<String, Value>,
    pub adapter: String,
    pub cache_key: String,
}

struct CompiledDefinition {
    pattern: Regex,
    adapter: String,
    cache_key: String,
    params: Map<String, Value>,
}

pub struct SourceResolver {
    definitions: Vec<CompiledDefinition>,
}

impl SourceResolver {
    /// Compiles every `name_pattern` up front, anchored so matching follows
    /// full-match semantics.
    pub fn from_definitions(definitions: &[SourceDefinition]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(definitions.len());
        for def in definitions {
            let pattern = Regex::new(&format!("^(?:{})$", def.name_pattern))
                .with_context(|| format!("invalid name_pattern {:?}", def.name_pattern))?;
            compiled.push(CompiledDefinition {
                pattern,
                adapter: def.adapter.clone(),
                cache_key: def.cache_key.clone(),
                params: def.params.clone(),
            });
        }
        Ok(Self {
            definitions: compiled,
        })
    }

    /// First matching definition wins. No match is fatal for the whole
    /// fragment: the fragment declared a dependency it cannot satisfy.
    pub fn resolve(&self, declared: &DeclaredSource) -> Result<SourceRequest, ResolutionError> {
        let definition = self
            .definitions
            .iter()
            .find(|def| def.pattern.is_match(&declared.name))
            .ok_or_else(|| {
                tracing::error!(source = %declared.name, "missing source configuration");
                ResolutionError {
                    name: declared.name.clone(),
                }
            })?;

        let params = merge_params(&definition.params, &declared.params);
        let cache_key = if definition.cache_key.is_empty() {
            derived_cache_key(&declared.name, &params)
        } else {
            definition.cache_key.clone()
        };

        Ok(SourceRequest {
            name: declared.name.clone(),
            namespace: declared.namespace.clone(),
            params,
            adapter: definition.adapter.clone(),
            cache_key,
        })
    }
}

/// Fresh map; keys present in `declared` override `defaults`. Neither input
/// is touched.
pub fn merge_params(
    defaults: &Map<String, Value>,
    declared: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in declared {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// `name|canonical(params)` so identical requests collide and differing
/// requests do not, regardless of param declaration order.
fn derived_cache_key(name: &str, params: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(params.clone()), &mut canonical);
    format!("{name}|{canonical}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definitions() -> Vec<SourceDefinition> {
        vec![
            SourceDefinition {
                name_pattern: "products.*".into(),
                adapter: "catalog".into(),
                cache_key: String::new(),
                params: as_map(json!({"limit": 10, "lang": "en"})),
            },
            SourceDefinition {
                name_pattern: "products-promoted".into(),
                adapter: "promo".into(),
                cache_key: String::new(),
                params: Map::new(),
            },
            SourceDefinition {
                name_pattern: "menu".into(),
                adapter: "catalog".into(),
                cache_key: "shared-menu".into(),
                params: Map::new(),
            },
        ]
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn no_match_is_a_resolution_error() {
        let resolver = SourceResolver::from_definitions(&definitions()).unwrap();
        let err = resolver
            .resolve(&DeclaredSource::new("unknown-source"))
            .unwrap_err();
        assert_eq!(err.name, "unknown-source");
    }

    #[test]
    fn pattern_match_is_full_not_partial() {
        let resolver = SourceResolver::from_definitions(&[SourceDefinition {
            name_pattern: "menu".into(),
            adapter: "catalog".into(),
            cache_key: String::new(),
            params: Map::new(),
        }])
        .unwrap();
        assert!(resolver.resolve(&DeclaredSource::new("menu")).is_ok());
        assert!(resolver.resolve(&DeclaredSource::new("menu-extras")).is_err());
        assert!(resolver.resolve(&DeclaredSource::new("main-menu")).is_err());
    }

    #[test]
    fn first_matching_definition_wins() {
        let resolver = SourceResolver::from_definitions(&definitions()).unwrap();
        // "products-promoted" also matches "products.*", declared earlier.
        let request = resolver
            .resolve(&DeclaredSource::new("products-promoted"))
            .unwrap();
        assert_eq!(request.adapter, "catalog");
    }

    #[test]
    fn declared_params_override_defaults_and_inputs_stay_intact() {
        let defaults = as_map(json!({"limit": 10, "lang": "en"}));
        let declared = as_map(json!({"limit": 50, "offset": 5}));

        let merged = merge_params(&defaults, &declared);

        assert_eq!(merged.get("limit"), Some(&json!(50)));
        assert_eq!(merged.get("lang"), Some(&json!("en")));
        assert_eq!(merged.get("offset"), Some(&json!(5)));
        // No mutation of either side.
        assert_eq!(defaults.get("limit"), Some(&json!(10)));
        assert!(declared.get("lang").is_none());
    }

    #[test]
    fn cache_key_template_is_used_verbatim() {
        let resolver = SourceResolver::from_definitions(&definitions()).unwrap();
        let request = resolver
            .resolve(&DeclaredSource::new("menu").param("variant", "compact"))
            .unwrap();
        assert_eq!(request.cache_key, "shared-menu");
    }

    #[test]
    fn derived_cache_key_is_order_insensitive_but_value_sensitive() {
        let a = derived_cache_key("svc", &as_map(json!({"a": 1, "b": {"y": 2, "x": 1}})));
        let b = derived_cache_key("svc", &as_map(json!({"b": {"x": 1, "y": 2}, "a": 1})));
        let c = derived_cache_key("svc", &as_map(json!({"a": 1, "b": {"x": 1, "y": 3}})));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("svc|"));
    }
}
