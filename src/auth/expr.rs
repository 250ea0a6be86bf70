use std::fmt;

use thiserror::Error;

/// Failure to compile or evaluate an authorization rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// The text is not well formed.
    #[error("auth expression error: expression parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset of the offending token.
        offset: usize,
        /// What was expected.
        message: String,
    },
    /// The text parses but uses an unknown function or wrong arity.
    #[error("auth expression error: expression is invalid: {0}")]
    Invalid(String),
    /// A predicate could not be evaluated against the claims.
    #[error("auth expression error: evaluation failed: {0}")]
    Evaluation(String),
}

/// What an [`Expr`] needs from the authenticated identity.
pub trait ClaimSource {
    /// Whether the identity was granted `scope`.
    ///
    /// # Errors
    ///
    /// [`ExprError::Evaluation`] when the scope claim has an unusable shape.
    fn has_scope(&self, scope: &str) -> Result<bool, ExprError>;

    /// Whether claim `key` equals (or, for list claims, contains) `expected`.
    ///
    /// # Errors
    ///
    /// [`ExprError::Evaluation`] when the claim is not a scalar or list.
    fn claim_equals(&self, key: &str, expected: &str) -> Result<bool, ExprError>;
}

/// A compiled authorization rule.
///
/// Grammar:
///
/// ```text
/// expr  := all(expr, ...) | any(expr, ...) | not(expr)
///        | jwtHasScope("scope") | jwtHasClaim("key", "value")
/// ```
///
/// String literals take single or double quotes and argument lists accept a
/// trailing comma. `Display` prints the canonical form.
///
/// # Examples
///
/// ```
/// use service_core::auth::Expr;
///
/// let expr = Expr::compile("all( any(jwtHasScope('fizz'), jwtHasScope(\"buzz\"),), not(jwtHasScope('test')) )").unwrap();
/// assert_eq!(
///     expr.to_string(),
///     r#"all(any(jwtHasScope("fizz"),jwtHasScope("buzz")),not(jwtHasScope("test")))"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// True when every operand is true.
    All(Vec<Expr>),
    /// True when at least one operand is true.
    Any(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Scope membership.
    HasScope(String),
    /// Claim equality.
    HasClaim(String, String),
}

impl Expr {
    /// Compiles rule text.
    ///
    /// # Errors
    ///
    /// [`ExprError::Parse`] or [`ExprError::Invalid`].
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: source.len(),
        };
        let node = parser.node()?;
        if let Some((offset, token)) = parser.peek() {
            return Err(ExprError::Parse {
                offset,
                message: format!("unexpected {} after expression", token),
            });
        }
        node.into_expr()
    }

    /// Evaluates against `claims`. `All` and `Any` short-circuit.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ExprError::Evaluation`] raised by a predicate.
    pub fn evaluate(&self, claims: &dyn ClaimSource) -> Result<bool, ExprError> {
        match self {
            Self::All(items) => {
                for item in items {
                    if !item.evaluate(claims)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(items) => {
                for item in items {
                    if item.evaluate(claims)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(inner) => Ok(!inner.evaluate(claims)?),
            Self::HasScope(scope) => claims.has_scope(scope),
            Self::HasClaim(key, value) => claims.claim_equals(key, value),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All(items) => write_list(f, "all", items),
            Self::Any(items) => write_list(f, "any", items),
            Self::Not(inner) => write!(f, "not({})", inner),
            Self::HasScope(scope) => write!(f, "jwtHasScope({})", Quoted(scope)),
            Self::HasClaim(key, value) => {
                write!(f, "jwtHasClaim({},{})", Quoted(key), Quoted(value))
            }
        }
    }
}

/// A double-quoted literal escaping only `"` and `\`, the two escapes the
/// lexer reads back verbatim.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for ch in self.0.chars() {
            if matches!(ch, '"' | '\\') {
                f.write_str("\\")?;
            }
            write!(f, "{}", ch)?;
        }
        f.write_str("\"")
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, items: &[Expr]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(")")
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Open,
    Close,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Open => f.write_str("'('"),
            Token::Close => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn lex(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '(' => tokens.push((offset, Token::Open)),
            ')' => tokens.push((offset, Token::Close)),
            ',' => tokens.push((offset, Token::Comma)),
            '"' | '\'' => {
                let quote = ch;
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, escaped)) => text.push(escaped),
                            None => break,
                        },
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(ExprError::Parse {
                        offset,
                        message: "unterminated string".to_string(),
                    });
                }
                tokens.push((offset, Token::Str(text)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Ident(name)));
            }
            other => {
                return Err(ExprError::Parse {
                    offset,
                    message: format!("unexpected character {:?}", other),
                })
            }
        }
    }
    Ok(tokens)
}

/// Untyped parse tree; arity and names are checked in `into_expr`.
enum Node {
    Call(String, Vec<Node>),
    Str(String),
}

impl Node {
    fn into_expr(self) -> Result<Expr, ExprError> {
        let (name, args) = match self {
            Node::Call(name, args) => (name, args),
            Node::Str(s) => {
                return Err(ExprError::Invalid(format!(
                    "string {:?} is not an expression",
                    s
                )))
            }
        };
        match name.as_str() {
            "all" | "any" => {
                if args.is_empty() {
                    return Err(ExprError::Invalid(format!("{}() needs an operand", name)));
                }
                let items = args
                    .into_iter()
                    .map(Node::into_expr)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if name == "all" {
                    Expr::All(items)
                } else {
                    Expr::Any(items)
                })
            }
            "not" => {
                let mut args = args;
                if args.len() != 1 {
                    return Err(ExprError::Invalid(format!(
                        "not() takes exactly one operand, got {}",
                        args.len()
                    )));
                }
                let inner = args.remove(0).into_expr()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            "jwtHasScope" => match strings(&name, args)?.as_slice() {
                [scope] => Ok(Expr::HasScope(scope.clone())),
                other => Err(arity(&name, 1, other.len())),
            },
            "jwtHasClaim" => match strings(&name, args)?.as_slice() {
                [key, value] => Ok(Expr::HasClaim(key.clone(), value.clone())),
                other => Err(arity(&name, 2, other.len())),
            },
            _ => Err(ExprError::Invalid(format!("unknown function '{}'", name))),
        }
    }
}

fn strings(name: &str, args: Vec<Node>) -> Result<Vec<String>, ExprError> {
    args.into_iter()
        .map(|arg| match arg {
            Node::Str(s) => Ok(s),
            Node::Call(inner, _) => Err(ExprError::Invalid(format!(
                "{}() takes string literals, got {}()",
                name, inner
            ))),
        })
        .collect()
}

fn arity(name: &str, expected: usize, got: usize) -> ExprError {
    ExprError::Invalid(format!(
        "{}() takes {} string argument(s), got {}",
        name, expected, got
    ))
}

struct Parser<'t> {
    tokens: &'t [(usize, Token)],
    pos: usize,
    end: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<(usize, &'t Token)> {
        self.tokens.get(self.pos).map(|(offset, token)| (*offset, token))
    }

    fn next(&mut self, expected: &str) -> Result<(usize, &'t Token), ExprError> {
        let found = self.peek().ok_or_else(|| ExprError::Parse {
            offset: self.end,
            message: format!("expected {}, found end of input", expected),
        })?;
        self.pos += 1;
        Ok(found)
    }

    fn node(&mut self) -> Result<Node, ExprError> {
        match self.next("expression")? {
            (_, Token::Str(s)) => Ok(Node::Str(s.clone())),
            (_, Token::Ident(name)) => {
                match self.next("'('")? {
                    (_, Token::Open) => {}
                    (offset, token) => {
                        return Err(ExprError::Parse {
                            offset,
                            message: format!("expected '(', found {}", token),
                        })
                    }
                }
                let mut args = Vec::new();
                loop {
                    if let Some((_, Token::Close)) = self.peek() {
                        self.pos += 1;
                        break;
                    }
                    args.push(self.node()?);
                    match self.next("',' or ')'")? {
                        (_, Token::Comma) => {}
                        (_, Token::Close) => break,
                        (offset, token) => {
                            return Err(ExprError::Parse {
                                offset,
                                message: format!("expected ',' or ')', found {}", token),
                            })
                        }
                    }
                }
                Ok(Node::Call(name.clone(), args))
            }
            (offset, token) => Err(ExprError::Parse {
                offset,
                message: format!("expected expression, found {}", token),
            }),
        }
    }
}
