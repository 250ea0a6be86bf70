use std::fmt;

use super::RuleError;

/// A compiled `regexp` constraint.
///
/// Patterns the linear-time engine accepts stay on it; patterns that need
/// look-around or backreferences (for example `^(?!admin).*$`) fall back to
/// the backtracking engine.
#[derive(Clone)]
pub enum Pattern {
    /// Compiled by `regex`.
    Plain(regex::Regex),
    /// Compiled by `fancy_regex`.
    Extended(fancy_regex::Regex),
}

impl Pattern {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Pattern`] when neither engine accepts the pattern.
    pub fn new(source: &str) -> Result<Self, RuleError> {
        if let Ok(re) = regex::Regex::new(source) {
            return Ok(Self::Plain(re));
        }
        fancy_regex::Regex::new(source)
            .map(Self::Extended)
            .map_err(|err| RuleError::Pattern {
                pattern: source.to_string(),
                message: err.to_string(),
            })
    }

    /// Tests `text` against the pattern.
    ///
    /// The backtracking engine can give up on pathological input; that is
    /// reported as an error message rather than a match result.
    pub fn is_match(&self, text: &str) -> Result<bool, String> {
        match self {
            Self::Plain(re) => Ok(re.is_match(text)),
            Self::Extended(re) => re.is_match(text).map_err(|err| err.to_string()),
        }
    }

    /// The pattern source.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plain(re) => re.as_str(),
            Self::Extended(re) => re.as_str(),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_patterns_use_linear_engine() {
        let pattern = Pattern::new("^[a-z]+$").unwrap();
        assert!(matches!(pattern, Pattern::Plain(_)));
        assert_eq!(pattern.is_match("abc"), Ok(true));
        assert_eq!(pattern.is_match("ab1"), Ok(false));
    }

    #[test]
    fn negative_lookahead_falls_back() {
        let pattern = Pattern::new("^(?!admin).*$").unwrap();
        assert!(matches!(pattern, Pattern::Extended(_)));
        assert_eq!(pattern.is_match("alice"), Ok(true));
        assert_eq!(pattern.is_match("admin"), Ok(false));
    }

    #[test]
    fn broken_pattern_is_rejected() {
        let err = Pattern::new("([a-z").unwrap_err();
        assert!(matches!(err, RuleError::Pattern { .. }));
    }
}
