use std::time::Duration;

use super::{Pattern, RuleError};

/// One constraint applied to a field value.
///
/// `Min`/`Max`/`Gt`/`Lt` compare numbers by value and strings, lists and
/// objects by length, so the same kinds express numeric ranges and string
/// length bounds.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// The field must be present and not null. Tag `required` or `nonnil`.
    Required,
    /// Inclusive lower bound. Tag `min=` or `gte=`.
    Min(f64),
    /// Inclusive upper bound. Tag `max=` or `lte=`.
    Max(f64),
    /// Exclusive lower bound. Tag `gt=`, or the legacy `exclusiveMin=`.
    Gt(f64),
    /// Exclusive upper bound. Tag `lt=`, or the legacy `exclusiveMax=`.
    Lt(f64),
    /// Exact length. Tag `len=`.
    Len(usize),
    /// Regular expression match on strings. Tag `regexp=`.
    Pattern(Pattern),
    /// Exact, case-sensitive membership. Tag `oneof=`; values are separated
    /// by spaces and may be single-quoted to contain spaces.
    OneOf(Vec<String>),
    /// Duration string with `min <= value < max`. Tag `timeout=MAX`,
    /// `timeout=MIN:MAX` or `timeout=MIN:`.
    Timeout {
        /// Inclusive lower bound.
        min: Option<Duration>,
        /// Exclusive upper bound.
        max: Option<Duration>,
    },
    /// A kind registered on the [`ValidatorBuilder`](super::ValidatorBuilder).
    Custom {
        /// Registered kind name.
        name: String,
        /// Raw parameter text after `=`.
        param: Option<String>,
    },
}

impl Constraint {
    /// Name reported in violations.
    pub fn tag(&self) -> &str {
        match self {
            Self::Required => "required",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::Gt(_) => "gt",
            Self::Lt(_) => "lt",
            Self::Len(_) => "len",
            Self::Pattern(_) => "regexp",
            Self::OneOf(_) => "oneof",
            Self::Timeout { .. } => "timeout",
            Self::Custom { name, .. } => name,
        }
    }

    /// Parameter reported in violations.
    pub fn param(&self) -> Option<String> {
        match self {
            Self::Required => None,
            Self::Min(n) | Self::Max(n) | Self::Gt(n) | Self::Lt(n) => Some(n.to_string()),
            Self::Len(n) => Some(n.to_string()),
            Self::Pattern(p) => Some(p.as_str().to_string()),
            Self::OneOf(values) => Some(values.join(" ")),
            Self::Timeout { min, max } => {
                let show = |d: &Option<Duration>| {
                    d.map(|d| humantime::format_duration(d).to_string())
                        .unwrap_or_default()
                };
                Some(format!("{}:{}", show(min), show(max)))
            }
            Self::Custom { param, .. } => param.clone(),
        }
    }

    /// Parses one `name` or `name=param` tag.
    fn parse(tag: &str) -> Result<Self, RuleError> {
        let (name, param) = match tag.split_once('=') {
            Some((name, param)) => (name.trim(), Some(param.trim())),
            None => (tag.trim(), None),
        };
        let need = || param.ok_or_else(|| RuleError::MissingParameter(name.to_string()));

        Ok(match name {
            "required" | "nonnil" => Self::Required,
            "min" | "gte" => Self::Min(number(name, need()?)?),
            "max" | "lte" => Self::Max(number(name, need()?)?),
            "gt" | "exclusiveMin" => Self::Gt(number(name, need()?)?),
            "lt" | "exclusiveMax" => Self::Lt(number(name, need()?)?),
            "len" => {
                let raw = need()?;
                Self::Len(raw.parse().map_err(|_| bad(name, raw, "not a length"))?)
            }
            "regexp" => Self::Pattern(Pattern::new(unquote(need()?))?),
            "oneof" => Self::OneOf(one_of(need()?)?),
            "timeout" => timeout(need()?)?,
            _ => Self::Custom {
                name: name.to_string(),
                param: param.map(str::to_string),
            },
        })
    }
}

/// Built-in kind names, including aliases. Custom kinds may not reuse them.
pub(crate) const BUILTIN_KINDS: &[&str] = &[
    "required",
    "nonnil",
    "min",
    "gte",
    "max",
    "lte",
    "gt",
    "exclusiveMin",
    "lt",
    "exclusiveMax",
    "len",
    "regexp",
    "oneof",
    "timeout",
    "dive",
];

fn number(name: &str, raw: &str) -> Result<f64, RuleError> {
    raw.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| bad(name, raw, "not a number"))
}

fn bad(name: &str, raw: &str, message: &str) -> RuleError {
    RuleError::BadParameter {
        constraint: name.to_string(),
        param: raw.to_string(),
        message: message.to_string(),
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw)
}

fn one_of(raw: &str) -> Result<Vec<String>, RuleError> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for ch in raw.chars() {
        match ch {
            '\'' if quoted => {
                quoted = false;
                values.push(std::mem::take(&mut current));
                pending = false;
            }
            '\'' => {
                quoted = true;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    values.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if quoted {
        return Err(RuleError::UnterminatedQuote(raw.to_string()));
    }
    if pending {
        values.push(current);
    }
    if values.is_empty() {
        return Err(bad("oneof", raw, "no values"));
    }
    Ok(values)
}

fn timeout(raw: &str) -> Result<Constraint, RuleError> {
    let parse = |part: &str| -> Result<Option<Duration>, RuleError> {
        if part.is_empty() {
            return Ok(None);
        }
        humantime::parse_duration(part)
            .map(Some)
            .map_err(|err| bad("timeout", raw, &err.to_string()))
    };

    let (min, max) = match raw.split_once(':') {
        Some((min, max)) => (parse(min.trim())?, parse(max.trim())?),
        None => (None, parse(raw.trim())?),
    };
    if min.is_none() && max.is_none() {
        return Err(bad("timeout", raw, "no bounds"));
    }
    Ok(Constraint::Timeout { min, max })
}

/// Splits a tag string on commas that sit outside single quotes.
fn split_tags(tags: &str) -> Result<Vec<&str>, RuleError> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;

    for (i, ch) in tags.char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&tags[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(RuleError::UnterminatedQuote(tags.to_string()));
    }
    parts.push(&tags[start..]);
    Ok(parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect())
}

/// Rules applied to every element of a list field.
#[derive(Debug, Clone, Default)]
pub struct ElementRules {
    constraints: Vec<Constraint>,
    fields: Option<RuleSet>,
}

impl ElementRules {
    /// Constraints on each element value.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Field rules on each element, for lists of objects.
    pub fn fields(&self) -> Option<&RuleSet> {
        self.fields.as_ref()
    }
}

/// The constraints on one named field.
///
/// # Examples
///
/// ```
/// use service_core::validate::{FieldRule, RuleSet};
///
/// let item = RuleSet::new().field("sku", "required,regexp='^[A-Z]{3}-[0-9]+$'").unwrap();
/// let rule = FieldRule::new("items")
///     .tags("required,dive,required")
///     .unwrap()
///     .each(item);
/// assert_eq!(rule.name(), "items");
/// ```
#[derive(Debug, Clone)]
pub struct FieldRule {
    name: String,
    constraints: Vec<Constraint>,
    elements: Option<ElementRules>,
    nested: Option<RuleSet>,
    ignorable: bool,
}

impl FieldRule {
    /// Creates a rule with no constraints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: Vec::new(),
            elements: None,
            nested: None,
            ignorable: false,
        }
    }

    /// Appends the constraints in a tag string. Tags after `dive` apply to
    /// each list element instead of the field.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for malformed tags or parameters.
    pub fn tags(mut self, tags: &str) -> Result<Self, RuleError> {
        let mut diving = false;
        for tag in split_tags(tags)? {
            if tag == "dive" {
                diving = true;
                self.elements.get_or_insert_with(ElementRules::default);
                continue;
            }
            let constraint = Constraint::parse(tag)?;
            match (&mut self.elements, diving) {
                (Some(elements), true) => elements.constraints.push(constraint),
                _ => self.constraints.push(constraint),
            }
        }
        Ok(self)
    }

    /// Appends one constraint.
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Applies `fields` to every element of this list field.
    pub fn each(mut self, fields: RuleSet) -> Self {
        self.elements.get_or_insert_with(ElementRules::default).fields = Some(fields);
        self
    }

    /// Applies `fields` to this field's object value.
    pub fn nested(mut self, fields: RuleSet) -> Self {
        self.nested = Some(fields);
        self
    }

    /// Marks violations of this rule as ignorable. Only meaningful for
    /// response-side rules: ignorable violations pass the response through.
    pub fn ignorable(mut self) -> Self {
        self.ignorable = true;
        self
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field-level constraints.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Element rules, when the field dives.
    pub fn elements(&self) -> Option<&ElementRules> {
        self.elements.as_ref()
    }

    /// Nested object rules.
    pub fn nested_rules(&self) -> Option<&RuleSet> {
        self.nested.as_ref()
    }

    /// Whether violations are ignorable.
    pub fn is_ignorable(&self) -> bool {
        self.ignorable
    }

    pub(crate) fn is_required(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, Constraint::Required))
    }
}

/// An ordered list of field rules for one payload shape.
///
/// ```
/// use service_core::validate::RuleSet;
///
/// let rules = RuleSet::new()
///     .field("identifier", "min=0,max=20")
///     .and_then(|r| r.field("name", "required,max=64"))
///     .unwrap();
/// assert_eq!(rules.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    fields: Vec<FieldRule>,
}

impl RuleSet {
    /// An empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `name` from a tag string.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for malformed tags.
    pub fn field(self, name: &str, tags: &str) -> Result<Self, RuleError> {
        Ok(self.rule(FieldRule::new(name).tags(tags)?))
    }

    /// Adds a prepared rule.
    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    /// Marks every top-level rule ignorable.
    pub fn ignorable(mut self) -> Self {
        for rule in &mut self.fields {
            rule.ignorable = true;
        }
        self
    }

    /// Rules in declaration order.
    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    /// Number of top-level rules.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` when there are no rules.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Names of every custom kind used anywhere in the set, nested rules included.
    pub fn custom_kinds(&self) -> Vec<&str> {
        let mut kinds = Vec::new();
        self.collect_custom(&mut kinds);
        kinds
    }

    fn collect_custom<'a>(&'a self, out: &mut Vec<&'a str>) {
        let push = |constraints: &'a [Constraint], out: &mut Vec<&'a str>| {
            for c in constraints {
                if let Constraint::Custom { name, .. } = c {
                    out.push(name);
                }
            }
        };
        for rule in &self.fields {
            push(&rule.constraints, out);
            if let Some(nested) = &rule.nested {
                nested.collect_custom(out);
            }
            if let Some(elements) = &rule.elements {
                push(&elements.constraints, out);
                if let Some(fields) = &elements.fields {
                    fields.collect_custom(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &str) -> FieldRule {
        FieldRule::new("f").tags(raw).unwrap()
    }

    #[test]
    fn parses_aliases_and_legacy_spellings() {
        let rule = tags("nonnil,gte=1,lte=9,exclusiveMin=0,exclusiveMax=10");
        let names: Vec<_> = rule.constraints().iter().map(Constraint::tag).collect();
        assert_eq!(names, ["required", "min", "max", "gt", "lt"]);
        assert!(rule.is_required());
    }

    #[test]
    fn dive_splits_element_constraints() {
        let rule = tags("required,min=1,dive,max=5");
        assert_eq!(rule.constraints().len(), 2);
        let elements = rule.elements().unwrap();
        assert_eq!(elements.constraints().len(), 1);
        assert_eq!(elements.constraints()[0].tag(), "max");
    }

    #[test]
    fn quoted_pattern_may_contain_commas() {
        let rule = tags("regexp='^a{1,3}$',max=3");
        assert_eq!(rule.constraints().len(), 2);
        assert_eq!(rule.constraints()[0].param().as_deref(), Some("^a{1,3}$"));
    }

    #[test]
    fn one_of_keeps_quoted_whitespace() {
        let rule = tags("oneof='red car' blue ''");
        match &rule.constraints()[0] {
            Constraint::OneOf(values) => assert_eq!(values, &["red car", "blue", ""]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timeout_forms() {
        match Constraint::parse("timeout=10ms").unwrap() {
            Constraint::Timeout { min, max } => {
                assert_eq!(min, None);
                assert_eq!(max, Some(Duration::from_millis(10)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match Constraint::parse("timeout=1s:").unwrap() {
            Constraint::Timeout { min, max } => {
                assert_eq!(min, Some(Duration::from_secs(1)));
                assert_eq!(max, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Constraint::parse("timeout=:").is_err());
        assert!(Constraint::parse("timeout=soon").is_err());
    }

    #[test]
    fn malformed_tags_are_rejected() {
        assert_eq!(
            Constraint::parse("min").unwrap_err(),
            RuleError::MissingParameter("min".into())
        );
        assert!(matches!(
            Constraint::parse("max=lots"),
            Err(RuleError::BadParameter { .. })
        ));
        assert!(matches!(
            FieldRule::new("f").tags("regexp='abc"),
            Err(RuleError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn unknown_names_become_custom() {
        let rules = RuleSet::new()
            .field("a", "even")
            .unwrap()
            .rule(FieldRule::new("b").each(RuleSet::new().field("c", "prime=7").unwrap()));
        assert_eq!(rules.custom_kinds(), ["even", "prime"]);
    }
}
