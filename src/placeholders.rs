// src/placeholders.rs
//! Request path placeholder substitution. Pure: `{header.*}`, `{param.*}`,
//! `{uri.path}` and `{payload.*}` are replaced from the client request and the
//! fragment payload; the first matching substitution source wins and
//! unresolved placeholders become empty strings.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::fragment::RequestContext;

pub fn resolve_path(template: &str, ctx: &RequestContext, payload: &Value) -> String {
    static RE_PLACEHOLDER: OnceCell<Regex> = OnceCell::new();
    let re = RE_PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]+)\}").unwrap());

    re.replace_all(template, |caps: &regex::Captures<'_>| {
        substitute(&caps[1], ctx, payload).unwrap_or_default()
    })
    .into_owned()
}

fn substitute(token: &str, ctx: &RequestContext, payload: &Value) -> Option<String> {
    if let Some(name) = token.strip_prefix("header.") {
        return ctx
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone());
    }
    if let Some(name) = token.strip_prefix("param.") {
        return ctx.query.get(name).cloned();
    }
    if token == "uri.path" {
        return Some(ctx.path.clone());
    }
    if let Some(pointer) = token.strip_prefix("payload.") {
        return payload_value(pointer, payload);
    }
    None
}

/// Walks the payload by dotted keys; only scalar leaves substitute.
fn payload_value(pointer: &str, payload: &Value) -> Option<String> {
    let mut current = payload;
    for key in pointer.split('.') {
        current = current.get(key)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new()
            .header("X-Site", "en-store")
            .query("id", "42")
            .path("/shop/category")
    }

    #[test]
    fn substitutes_header_param_and_uri() {
        let path = resolve_path("/api/{param.id}?site={header.x-site}&from={uri.path}", &ctx(), &Value::Null);
        assert_eq!(path, "/api/42?site=en-store&from=/shop/category");
    }

    #[test]
    fn substitutes_payload_scalars_by_dotted_key() {
        let payload = json!({"user": {"id": 7, "active": true}});
        assert_eq!(
            resolve_path("/users/{payload.user.id}/{payload.user.active}", &ctx(), &payload),
            "/users/7/true"
        );
    }

    #[test]
    fn unresolved_placeholders_become_empty() {
        assert_eq!(
            resolve_path("/api/{param.missing}/{unknown.token}", &ctx(), &Value::Null),
            "/api//"
        );
    }

    #[test]
    fn non_scalar_payload_values_do_not_substitute() {
        let payload = json!({"user": {"tags": ["a", "b"]}});
        assert_eq!(resolve_path("/t/{payload.user.tags}", &ctx(), &payload), "/t/");
    }

    #[test]
    fn template_without_placeholders_is_untouched() {
        assert_eq!(resolve_path("/plain/path", &ctx(), &Value::Null), "/plain/path");
    }
}
