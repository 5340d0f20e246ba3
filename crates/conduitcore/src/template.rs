//! `{{a.b.c}}` interpolation against a run scope.
//!
//! Paths are dot-separated; numeric segments index into arrays. A path
//! that does not resolve renders as the empty string.

use serde_json::Value;

/// Look up a dot path inside `scope`.
pub fn resolve_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a value the way it appears inside an interpolated string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{path}}` in `template`.
pub fn interpolate(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let path = &after_open[..end];
                if let Some(value) = resolve_path(scope, path) {
                    out.push_str(&value_to_string(value));
                }
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated, keep the text as written
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The path of a string that is exactly one `{{path}}` placeholder.
fn sole_placeholder(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Interpolate every string inside a JSON value, leaving structure intact.
///
/// A string that is a single placeholder takes the resolved value as is,
/// so `"{{trigger.count}}"` stays a number. Unresolved, it renders `""`.
pub fn render_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => {
            match sole_placeholder(s).and_then(|path| resolve_path(scope, path)) {
                Some(resolved) => resolved.clone(),
                None => Value::String(interpolate(s, scope)),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Strip optional `{{ }}` around a bare path, e.g. a foreach `itemsPath`.
pub fn bare_path(path: &str) -> &str {
    let trimmed = path.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|p| p.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_trigger_field() {
        let scope = json!({ "trigger": { "userId": "42" } });
        assert_eq!(interpolate("{{trigger.userId}}", &scope), "42");
    }

    #[test]
    fn missing_path_renders_empty() {
        let scope = json!({ "trigger": {} });
        assert_eq!(interpolate("id={{trigger.nope.deeper}}!", &scope), "id=!");
    }

    #[test]
    fn renders_variables_numbers_and_indices() {
        let scope = json!({
            "trigger": { "course": { "id": 7 } },
            "users": [{ "email": "a@example.edu" }]
        });
        assert_eq!(
            interpolate("/courses/{{ trigger.course.id }}/users/{{users.0.email}}", &scope),
            "/courses/7/users/a@example.edu"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let scope = json!({});
        assert_eq!(interpolate("a {{b", &scope), "a {{b");
    }

    #[test]
    fn render_value_walks_structures() {
        let scope = json!({ "trigger": { "name": "Ada" } });
        let body = json!({
            "user": { "name": "{{trigger.name}}", "tags": ["{{trigger.name}}", 1] }
        });
        assert_eq!(
            render_value(&body, &scope),
            json!({ "user": { "name": "Ada", "tags": ["Ada", 1] } })
        );
    }

    #[test]
    fn sole_placeholder_keeps_json_type() {
        let scope = json!({ "trigger": { "count": 3, "user": { "id": 9 }, "name": "Ada" } });
        let args = json!([
            "{{trigger.count}}",
            "{{ trigger.user }}",
            "n={{trigger.count}}",
            "{{missing}}"
        ]);
        assert_eq!(render_value(&args, &scope), json!([3, { "id": 9 }, "n=3", ""]));
        assert_eq!(render_value(&json!("{{trigger.name}}"), &scope), json!("Ada"));
        let pair = json!({ "a": 1, "b": 2 });
        assert_eq!(render_value(&json!("{{a}} {{b}}"), &pair), json!("1 2"));
    }

    #[test]
    fn bare_path_strips_braces() {
        assert_eq!(bare_path("{{ trigger.items }}"), "trigger.items");
        assert_eq!(bare_path("users"), "users");
    }
}
