use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::expr::{ClaimSource, ExprError};

/// The authenticated identity's claims.
///
/// Scopes come from the `scope` claim, a space-separated string (a list of
/// strings is accepted too). Claims are attached to the request context
/// once and are read-only from then on.
///
/// # Examples
///
/// ```
/// use service_core::Claims;
///
/// let claims = Claims::default()
///     .with_scopes(["orders:read", "orders:write"])
///     .with_claim("sub", "user-1");
///
/// assert_eq!(claims.subject(), Some("user-1"));
/// assert_eq!(claims.scopes(), ["orders:read", "orders:write"]);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims {
    values: Map<String, Value>,
}

impl Claims {
    /// Wraps a decoded claim map.
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Sets the `scope` claim.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let joined = scopes
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>()
            .join(" ");
        self.values.insert("scope".to_string(), Value::String(joined));
        self
    }

    /// Sets an arbitrary claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// The `sub` claim.
    pub fn subject(&self) -> Option<&str> {
        self.values.get("sub").and_then(Value::as_str)
    }

    /// The `iss` claim.
    pub fn issuer(&self) -> Option<&str> {
        self.values.get("iss").and_then(Value::as_str)
    }

    /// Any claim by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Every claim.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Granted scopes; empty when the `scope` claim is missing or unusable.
    pub fn scopes(&self) -> Vec<&str> {
        match self.values.get("scope") {
            Some(Value::String(s)) => s.split_whitespace().collect(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

impl ClaimSource for Claims {
    fn has_scope(&self, scope: &str) -> Result<bool, ExprError> {
        match self.values.get("scope") {
            None | Some(Value::Null) => Ok(false),
            Some(Value::String(s)) => Ok(s.split_whitespace().any(|granted| granted == scope)),
            Some(Value::Array(items)) => Ok(items.iter().any(|item| item.as_str() == Some(scope))),
            Some(other) => Err(ExprError::Evaluation(format!(
                "claim 'scope' has unusable value {}",
                other
            ))),
        }
    }

    fn claim_equals(&self, key: &str, expected: &str) -> Result<bool, ExprError> {
        let scalar = |value: &Value| match value {
            Value::String(s) => Some(s.as_str() == expected),
            Value::Number(n) => Some(n.to_string() == expected),
            Value::Bool(b) => Some(b.to_string() == expected),
            _ => None,
        };
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Array(items)) => Ok(items.iter().any(|item| scalar(item) == Some(true))),
            Some(value) => scalar(value).ok_or_else(|| {
                ExprError::Evaluation(format!("claim '{}' is not comparable", key))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn scope_string_is_space_separated() {
        let c = claims(json!({"scope": "a  b\tc"}));
        assert_eq!(c.has_scope("b"), Ok(true));
        assert_eq!(c.has_scope("d"), Ok(false));
        assert_eq!(c.scopes(), ["a", "b", "c"]);
    }

    #[test]
    fn scope_list_is_accepted() {
        let c = claims(json!({"scope": ["a", "b"]}));
        assert_eq!(c.has_scope("a"), Ok(true));
    }

    #[test]
    fn unusable_scope_is_an_evaluation_error() {
        let c = claims(json!({"scope": {"a": true}}));
        assert!(c.has_scope("a").is_err());
        assert!(c.scopes().is_empty());
    }

    #[test]
    fn claim_comparison() {
        let c = claims(json!({"tenant": "acme", "level": 3, "groups": ["x", "y"], "meta": {}}));
        assert_eq!(c.claim_equals("tenant", "acme"), Ok(true));
        assert_eq!(c.claim_equals("level", "3"), Ok(true));
        assert_eq!(c.claim_equals("groups", "y"), Ok(true));
        assert_eq!(c.claim_equals("missing", "y"), Ok(false));
        assert!(c.claim_equals("meta", "x").is_err());
    }
}
