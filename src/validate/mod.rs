//! Constraint validation for decoded requests and encoded responses.
//!
//! Payloads are validated as [`serde_json::Value`] trees against a
//! [`RuleSet`]. Validation runs top-down and collects every violated field;
//! the caller gets one [`ValidationErrors`] report, never just the first
//! failure.
//!
//! A field that is absent or null violates only `required`. When it is not
//! required, every other constraint on it is skipped.
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use service_core::validate::{RuleSet, Validator};
//!
//! let validator = Validator::builder()
//!     .register("even", |value, _| value.as_i64().is_some_and(|n| n % 2 == 0))
//!     .unwrap()
//!     .build();
//!
//! let rules = RuleSet::new()
//!     .field("count", "required,min=0,even")
//!     .and_then(|r| r.field("label", "max=8"))
//!     .unwrap();
//!
//! assert!(validator.validate(&json!({"count": 4}), &rules).is_ok());
//!
//! let report = validator
//!     .validate(&json!({"count": -3, "label": "far too long"}), &rules)
//!     .unwrap_err();
//! assert_eq!(report.len(), 3);
//! ```

mod pattern;
mod rule;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use pattern::Pattern;
pub use rule::{Constraint, ElementRules, FieldRule, RuleSet};

use rule::BUILTIN_KINDS;

/// Signature of a registered constraint kind: the field value and the raw
/// parameter text. Returns `true` when the value satisfies the constraint.
pub type CustomCheck = Arc<dyn Fn(&Value, Option<&str>) -> bool + Send + Sync>;

/// Errors in rule definitions or validator construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// A constraint kind needs `=param`.
    #[error("constraint '{0}' requires a parameter")]
    MissingParameter(String),
    /// A parameter could not be parsed.
    #[error("constraint '{constraint}' has invalid parameter '{param}': {message}")]
    BadParameter {
        /// Constraint kind.
        constraint: String,
        /// Raw parameter text.
        param: String,
        /// Parse failure.
        message: String,
    },
    /// A single quote was never closed.
    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),
    /// A `regexp` pattern does not compile.
    #[error("invalid pattern '{pattern}': {message}")]
    Pattern {
        /// Pattern source.
        pattern: String,
        /// Compiler message.
        message: String,
    },
    /// A custom kind reuses a built-in name.
    #[error("constraint kind '{0}' is built in")]
    Reserved(String),
    /// A custom kind was registered twice.
    #[error("constraint kind '{0}' is already registered")]
    Duplicate(String),
    /// A rule names a kind that was never registered.
    #[error("unknown constraint kind '{0}'")]
    UnknownKind(String),
    /// Registration was attempted after the validator validated a payload.
    #[error("cannot register '{0}': validator is frozen after first use")]
    Frozen(String),
}

/// One violated constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    /// Path of the field, e.g. `items[2].sku`.
    pub field: String,
    /// Constraint kind, e.g. `min`.
    pub constraint: String,
    /// Constraint parameter, if any.
    pub param: Option<String>,
    /// What was wrong with the value.
    pub message: String,
    fatal: bool,
}

impl FieldViolation {
    fn new(field: &str, constraint: &Constraint, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            field: field.to_string(),
            constraint: constraint.tag().to_string(),
            param: constraint.param(),
            message: message.into(),
            fatal,
        }
    }

    /// Whether the owning rule treats this violation as fatal.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(
                f,
                "'{}' failed '{}={}': {}",
                self.field, self.constraint, param, self.message
            ),
            None => write!(
                f,
                "'{}' failed '{}': {}",
                self.field, self.constraint, self.message
            ),
        }
    }
}

/// Every violation found in one payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors {
    violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    /// Wraps a list of violations.
    pub fn new(violations: Vec<FieldViolation>) -> Self {
        Self { violations }
    }

    /// A report for a payload that could not be decoded at all.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(vec![FieldViolation {
            field: "$".to_string(),
            constraint: "decode".to_string(),
            param: None,
            message: message.into(),
            fatal: true,
        }])
    }

    /// The violations in the order they were found.
    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// Returns `true` when nothing was violated.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Returns `true` when `field` violated `constraint`.
    pub fn has(&self, field: &str, constraint: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.field == field && v.constraint == constraint)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Outcome of response-side validation.
#[derive(Debug, Default)]
pub struct ResponseReport {
    /// Violations of rules that are fatal.
    pub fatal: Vec<FieldViolation>,
    /// Violations of ignorable rules. The response passes through.
    pub ignored: Vec<FieldViolation>,
}

/// Collects custom constraint kinds, then freezes them into a [`Validator`].
#[derive(Default)]
pub struct ValidatorBuilder {
    custom: HashMap<String, CustomCheck>,
}

impl ValidatorBuilder {
    /// A builder with no custom kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom kind.
    ///
    /// # Errors
    ///
    /// [`RuleError::Reserved`] for built-in names, [`RuleError::Duplicate`]
    /// for a second registration of the same name.
    pub fn register<F>(mut self, name: impl Into<String>, check: F) -> Result<Self, RuleError>
    where
        F: Fn(&Value, Option<&str>) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        insert_kind(&mut self.custom, name, Arc::new(check))?;
        Ok(self)
    }

    /// Finalizes the validator.
    pub fn build(self) -> Validator {
        Validator {
            custom: self.custom,
            used: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ValidatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorBuilder")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn insert_kind(
    custom: &mut HashMap<String, CustomCheck>,
    name: String,
    check: CustomCheck,
) -> Result<(), RuleError> {
    if BUILTIN_KINDS.contains(&name.as_str()) {
        return Err(RuleError::Reserved(name));
    }
    if custom.contains_key(&name) {
        return Err(RuleError::Duplicate(name));
    }
    custom.insert(name, check);
    Ok(())
}

/// The validation engine of one service contract.
///
/// Each [`ServiceContract`](crate::ServiceContract) owns its own validator;
/// there is no process-wide registry.
pub struct Validator {
    custom: HashMap<String, CustomCheck>,
    used: AtomicBool,
}

impl Default for Validator {
    fn default() -> Self {
        ValidatorBuilder::new().build()
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("used", &self.used.load(Ordering::Relaxed))
            .finish()
    }
}

impl Validator {
    /// Starts a [`ValidatorBuilder`].
    pub fn builder() -> ValidatorBuilder {
        ValidatorBuilder::new()
    }

    /// Registers a custom kind on a validator that has not validated anything yet.
    ///
    /// # Errors
    ///
    /// [`RuleError::Frozen`] once [`validate`](Self::validate) or
    /// [`validate_response`](Self::validate_response) has run, plus the
    /// errors of [`ValidatorBuilder::register`].
    pub fn register<F>(&mut self, name: impl Into<String>, check: F) -> Result<(), RuleError>
    where
        F: Fn(&Value, Option<&str>) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        if self.used.load(Ordering::Acquire) {
            return Err(RuleError::Frozen(name));
        }
        insert_kind(&mut self.custom, name, Arc::new(check))
    }

    /// Checks that every custom kind used by `rules` is registered.
    ///
    /// # Errors
    ///
    /// [`RuleError::UnknownKind`] naming the first unknown kind.
    pub fn check(&self, rules: &RuleSet) -> Result<(), RuleError> {
        match rules
            .custom_kinds()
            .into_iter()
            .find(|kind| !self.custom.contains_key(*kind))
        {
            Some(kind) => Err(RuleError::UnknownKind(kind.to_string())),
            None => Ok(()),
        }
    }

    /// Validates a request payload. Every violation is an error.
    ///
    /// # Errors
    ///
    /// A [`ValidationErrors`] listing every violated field.
    pub fn validate(&self, value: &Value, rules: &RuleSet) -> Result<(), ValidationErrors> {
        let violations = self.run(value, rules);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors::new(violations))
        }
    }

    /// Validates a response payload, splitting fatal from ignorable violations.
    pub fn validate_response(&self, value: &Value, rules: &RuleSet) -> ResponseReport {
        let (fatal, ignored): (Vec<_>, Vec<_>) =
            self.run(value, rules).into_iter().partition(|v| v.fatal);
        ResponseReport { fatal, ignored }
    }

    fn run(&self, value: &Value, rules: &RuleSet) -> Vec<FieldViolation> {
        self.used.store(true, Ordering::Release);
        let mut out = Vec::new();
        self.walk(value, rules, "", &mut out);
        out
    }

    fn walk(&self, value: &Value, rules: &RuleSet, path: &str, out: &mut Vec<FieldViolation>) {
        for rule in rules.fields() {
            let field_path = if path.is_empty() {
                rule.name().to_string()
            } else {
                format!("{}.{}", path, rule.name())
            };
            let field = value.get(rule.name());
            let fatal = !rule.is_ignorable();

            let Some(field) = field.filter(|v| !v.is_null()) else {
                if rule.is_required() {
                    out.push(FieldViolation::new(
                        &field_path,
                        &Constraint::Required,
                        "is required",
                        fatal,
                    ));
                }
                continue;
            };

            self.apply(field, rule.constraints(), &field_path, fatal, out);

            if let Some(nested) = rule.nested_rules() {
                self.walk(field, nested, &field_path, out);
            }

            if let Some(elements) = rule.elements() {
                let Value::Array(items) = field else {
                    out.push(FieldViolation {
                        field: field_path,
                        constraint: "dive".to_string(),
                        param: None,
                        message: "is not a list".to_string(),
                        fatal,
                    });
                    continue;
                };
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", field_path, i);
                    if item.is_null() {
                        if elements
                            .constraints()
                            .iter()
                            .any(|c| matches!(c, Constraint::Required))
                        {
                            out.push(FieldViolation::new(
                                &item_path,
                                &Constraint::Required,
                                "is required",
                                fatal,
                            ));
                        }
                        continue;
                    }
                    self.apply(item, elements.constraints(), &item_path, fatal, out);
                    if let Some(fields) = elements.fields() {
                        self.walk(item, fields, &item_path, out);
                    }
                }
            }
        }
    }

    fn apply(
        &self,
        value: &Value,
        constraints: &[Constraint],
        path: &str,
        fatal: bool,
        out: &mut Vec<FieldViolation>,
    ) {
        for constraint in constraints {
            if let Err(message) = self.satisfies(value, constraint) {
                out.push(FieldViolation::new(path, constraint, message, fatal));
            }
        }
    }

    fn satisfies(&self, value: &Value, constraint: &Constraint) -> Result<(), String> {
        match constraint {
            Constraint::Required => Ok(()),
            Constraint::Min(bound) => {
                compare(value, |n| n >= *bound, || format!("must be at least {}", bound))
            }
            Constraint::Max(bound) => {
                compare(value, |n| n <= *bound, || format!("must be at most {}", bound))
            }
            Constraint::Gt(bound) => compare(
                value,
                |n| n > *bound,
                || format!("must be greater than {}", bound),
            ),
            Constraint::Lt(bound) => {
                compare(value, |n| n < *bound, || format!("must be less than {}", bound))
            }
            Constraint::Len(expected) => match length(value) {
                Some(n) if n == *expected => Ok(()),
                Some(n) => Err(format!("has length {}, expected {}", n, expected)),
                None => Err("has no length".to_string()),
            },
            Constraint::Pattern(pattern) => {
                let text = value.as_str().ok_or("is not a string")?;
                match pattern.is_match(text)? {
                    true => Ok(()),
                    false => Err(format!("does not match '{}'", pattern.as_str())),
                }
            }
            Constraint::OneOf(allowed) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return Err("is not a scalar".to_string()),
                };
                if allowed.iter().any(|a| *a == text) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of [{}]", text, allowed.join(", ")))
                }
            }
            Constraint::Timeout { min, max } => {
                let text = value.as_str().ok_or("is not a duration string")?;
                let duration = humantime::parse_duration(text).map_err(|err| err.to_string())?;
                if min.is_some_and(|min| duration < min) {
                    return Err(format!("'{}' is below the minimum", text));
                }
                if max.is_some_and(|max| duration >= max) {
                    return Err(format!("'{}' is not below the maximum", text));
                }
                Ok(())
            }
            Constraint::Custom { name, param } => match self.custom.get(name) {
                Some(check) if check(value, param.as_deref()) => Ok(()),
                Some(_) => Err("is invalid".to_string()),
                None => Err(format!("unknown constraint kind '{}'", name)),
            },
        }
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn compare(
    value: &Value,
    holds: impl Fn(f64) -> bool,
    message: impl Fn() -> String,
) -> Result<(), String> {
    let measured = match value {
        Value::Number(n) => n.as_f64(),
        other => length(other).map(|n| n as f64),
    };
    match measured {
        Some(n) if holds(n) => Ok(()),
        Some(_) => Err(message()),
        None => Err("is not comparable".to_string()),
    }
}
