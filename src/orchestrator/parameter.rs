use std::collections::HashMap;

use serde_json::Value;

use crate::orchestrator::error::OrchestratorError;

/// Resolves `${node_id.path}` and `${env:NAME[:-default]}` references
/// inside workflow node parameters against a map of already-completed
/// node results.
pub struct ParameterResolver;

impl ParameterResolver {
    /// Resolves every reference reachable from `value`. `node_id` is
    /// only used to attribute `unresolved_reference` errors to the
    /// node that requested the substitution.
    pub fn resolve(
        value: &Value,
        results: &HashMap<String, Value>,
        node_id: &str,
    ) -> Result<Value, OrchestratorError> {
        match value {
            Value::String(s) => Self::resolve_string(s, results, node_id),
            Value::Array(items) => {
                let resolved = items
                    .iter()
                    .map(|v| Self::resolve(v, results, node_id))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), Self::resolve(v, results, node_id)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(
        s: &str,
        results: &HashMap<String, Value>,
        node_id: &str,
    ) -> Result<Value, OrchestratorError> {
        if let Some(token) = whole_reference(s) {
            return Self::resolve_token(token, results, node_id);
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| OrchestratorError::UnresolvedReference {
                node_id: node_id.to_string(),
                token: s.to_string(),
            })?;
            let token = &after[..end];
            let resolved = Self::resolve_token(token, results, node_id)?;
            out.push_str(&value_to_embedded_string(&resolved));
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn resolve_token(
        token: &str,
        results: &HashMap<String, Value>,
        node_id: &str,
    ) -> Result<Value, OrchestratorError> {
        if let Some(env_expr) = token.strip_prefix("env:") {
            return Ok(Value::String(resolve_env(env_expr)));
        }

        let mut parts = token.splitn(2, '.');
        let referenced_node = parts.next().unwrap_or("");
        let path = parts.next();

        let root = results.get(referenced_node).ok_or_else(|| OrchestratorError::UnresolvedReference {
            node_id: node_id.to_string(),
            token: token.to_string(),
        })?;

        match path {
            None => Ok(root.clone()),
            Some(p) => drill(root, p).ok_or_else(|| OrchestratorError::UnresolvedReference {
                node_id: node_id.to_string(),
                token: token.to_string(),
            }),
        }
    }
}

/// If the entire string is a single `${...}` reference (no surrounding
/// text), returns the inner token so the caller can substitute the
/// typed value rather than a string splice.
fn whole_reference(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1 {
        Some(&s[2..s.len() - 1])
    } else {
        None
    }
}

fn drill<'a>(value: &'a Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn resolve_env(expr: &str) -> String {
    if let Some((name, default)) = expr.split_once(":-") {
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Embedded references (inside a larger string) are JSON-serialized
/// with a 2-space indent so they remain readable when spliced into an
/// agent prompt. Plain strings are spliced without surrounding quotes.
fn value_to_embedded_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_reference_preserves_type() {
        let mut results = HashMap::new();
        results.insert("scan".to_string(), serde_json::json!({"open_ports": [22, 80]}));
        let resolved = ParameterResolver::resolve(&Value::String("${scan}".to_string()), &results, "analyze").unwrap();
        assert_eq!(resolved, serde_json::json!({"open_ports": [22, 80]}));
    }

    #[test]
    fn embedded_reference_serializes_as_pretty_json() {
        let mut results = HashMap::new();
        results.insert("scan".to_string(), serde_json::json!({"open_ports": [22, 80]}));
        let resolved = ParameterResolver::resolve(
            &Value::String("Summary: ${scan}".to_string()),
            &results,
            "analyze",
        )
        .unwrap();
        assert_eq!(
            resolved,
            Value::String("Summary: {\n  \"open_ports\": [\n    22,\n    80\n  ]\n}".to_string())
        );
    }

    #[test]
    fn dotted_path_drills_into_object() {
        let mut results = HashMap::new();
        results.insert("scan".to_string(), serde_json::json!({"host": {"ip": "10.0.0.1"}}));
        let resolved =
            ParameterResolver::resolve(&Value::String("${scan.host.ip}".to_string()), &results, "n").unwrap();
        assert_eq!(resolved, Value::String("10.0.0.1".to_string()));
    }

    #[test]
    fn unresolved_reference_is_reported_with_node_and_token() {
        let results = HashMap::new();
        let err = ParameterResolver::resolve(&Value::String("${missing}".to_string()), &results, "n1").unwrap_err();
        match err {
            OrchestratorError::UnresolvedReference { node_id, token } => {
                assert_eq!(node_id, "n1");
                assert_eq!(token, "${missing}");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn env_reference_with_default() {
        std::env::remove_var("ORCH_TEST_VAR_XYZ");
        let results = HashMap::new();
        let resolved =
            ParameterResolver::resolve(&Value::String("${env:ORCH_TEST_VAR_XYZ:-fallback}".to_string()), &results, "n")
                .unwrap();
        assert_eq!(resolved, Value::String("fallback".to_string()));
    }

    #[test]
    fn non_string_values_pass_through() {
        let results = HashMap::new();
        let resolved = ParameterResolver::resolve(&serde_json::json!(42), &results, "n").unwrap();
        assert_eq!(resolved, serde_json::json!(42));
    }
}
