//! Recipient filter expressions.
//!
//! A filter is a boolean expression over the flat field namespace of
//! [`AgentInfo`]: `name`, `role`, and any metadata key. Values may carry
//! `*` wildcards which are compiled to anchored regular expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := and ( '||' and )*
//! and     := unary ( '&&' unary )*
//! unary   := '!' unary | '(' expr ')' | atom
//! atom    := key ( '=' | '!=' ) value
//! ```
//!
//! Keys and values are bare words or quoted strings. An absent agent field
//! compares as null: `=` is false against null, `!=` is true.

use std::str::FromStr;

use regex::Regex;

use crate::{Error, message::AgentInfo};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Text(String),
}

/// Characters that terminate a bare word.
fn is_delimiter(value: char) -> bool {
    value.is_whitespace() || matches!(value, '(' | ')' | '!' | '&' | '|' | '=' | '\'' | '"')
}

fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::with_capacity(16);
    let mut chars = source.chars().peekable();

    while let Some(&item) = chars.peek() {
        match item {
            _ if item.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(item) {
                    return Err(Error::DanglingOperator(item));
                }

                tokens.push(if item == '&' { Token::And } else { Token::Or });
            }
            '\'' | '"' => {
                chars.next();

                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == item => break,
                        Some(c) => text.push(c),
                        None => return Err(Error::UnterminatedQuote),
                    }
                }

                tokens.push(Token::Text(text));
            }
            _ => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if is_delimiter(c) {
                        break;
                    }

                    text.push(c);
                    chars.next();
                }

                tokens.push(Token::Text(text));
            }
        }
    }

    Ok(tokens)
}

/// Exact comparison, or an anchored regex when the value carries `*`.
#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Glob(Regex),
}

impl Matcher {
    fn new(pattern: &str) -> Result<Self, Error> {
        if !pattern.contains('*') {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let source = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        Ok(Self::Glob(Regex::new(&format!("^{}$", source))?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::Glob(pattern) => pattern.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Cmp {
        key: String,
        negated: bool,
        matcher: Matcher,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, agent: &AgentInfo) -> bool {
        match self {
            Self::Cmp {
                key,
                negated,
                matcher,
            } => match agent.field(key) {
                Some(value) => *negated != matcher.matches(value),
                None => *negated,
            },
            Self::Not(inner) => !inner.eval(agent),
            Self::And(left, right) => left.eval(agent) && right.eval(agent),
            Self::Or(left, right) => left.eval(agent) || right.eval(agent),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }

        token
    }

    fn expr(&mut self) -> Result<Expr, Error> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }

        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, Error> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, Error> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(Error::UnexpectedToken(format!("{:?}", token))),
                    None => Err(Error::UnexpectedEnd),
                }
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, Error> {
        let key = match self.next() {
            Some(Token::Text(key)) => key,
            Some(token) => return Err(Error::UnexpectedToken(format!("{:?}", token))),
            None => return Err(Error::UnexpectedEnd),
        };

        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            Some(token) => return Err(Error::UnexpectedToken(format!("{:?}", token))),
            None => return Err(Error::UnexpectedEnd),
        };

        let value = match self.next() {
            Some(Token::Text(value)) => value,
            Some(token) => return Err(Error::UnexpectedToken(format!("{:?}", token))),
            None => return Err(Error::UnexpectedEnd),
        };

        Ok(Expr::Cmp {
            key,
            negated,
            matcher: Matcher::new(&value)?,
        })
    }
}

/// A parsed, evaluable recipient filter.
///
/// # Test
///
/// ```
/// use courier_server_codec::{Filter, message::AgentInfo};
///
/// let mut agent = AgentInfo::default();
/// agent.agent_name = "bob".to_string();
/// agent.role = "client".to_string();
/// agent.metadata.insert("tags".to_string(), "premium,beta".to_string());
///
/// assert!("role=client".parse::<Filter>().unwrap().matches(&agent));
/// assert!("role!=bot".parse::<Filter>().unwrap().matches(&agent));
/// assert!("tags=*premium*".parse::<Filter>().unwrap().matches(&agent));
/// assert!(!"plan=pro".parse::<Filter>().unwrap().matches(&agent));
/// assert!("plan!=pro".parse::<Filter>().unwrap().matches(&agent));
///
/// let composite = "(role=client || role=bot) && name=b*"
///     .parse::<Filter>()
///     .unwrap();
/// assert!(composite.matches(&agent));
/// ```
#[derive(Debug, Clone)]
pub struct Filter(Expr);

impl Filter {
    pub fn matches(&self, agent: &AgentInfo) -> bool {
        self.0.eval(agent)
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            cursor: 0,
        };

        if parser.tokens.is_empty() {
            return Err(Error::UnexpectedEnd);
        }

        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(Error::TrailingInput(format!("{:?}", token)));
        }

        Ok(Self(expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, role: &str, metadata: &[(&str, &str)]) -> AgentInfo {
        let mut info = AgentInfo {
            agent_name: name.to_string(),
            role: role.to_string(),
            ..Default::default()
        };

        for (key, value) in metadata {
            info.metadata.insert(key.to_string(), value.to_string());
        }

        info
    }

    fn matches(filter: &str, info: &AgentInfo) -> bool {
        filter.parse::<Filter>().unwrap().matches(info)
    }

    #[test]
    fn exact_and_negated_atoms() {
        let bot = agent("probe", "bot", &[]);

        assert!(matches("role=bot", &bot));
        assert!(!matches("role=client", &bot));
        assert!(!matches("role!=bot", &bot));
        assert!(matches("name!=other", &bot));
    }

    #[test]
    fn absent_keys_compare_as_null() {
        let plain = agent("a", "client", &[]);

        assert!(!matches("plan=pro", &plain));
        assert!(matches("plan!=pro", &plain));
        assert!(matches("!plan=pro", &plain));
    }

    #[test]
    fn wildcards_anywhere() {
        let info = agent("render-worker-7", "client", &[("zone", "eu-west-1")]);

        assert!(matches("name=render-*", &info));
        assert!(matches("name=*-7", &info));
        assert!(matches("name=*worker*", &info));
        assert!(matches("zone=eu-*-1", &info));
        assert!(!matches("name=render", &info));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        let info = agent("a.b", "client", &[]);

        assert!(matches("name=a.b", &info));
        assert!(!matches("name=a?b", &info));
        assert!(matches("name=a*", &info));
        // The dot must be literal, not "any char".
        assert!(!matches("name=*x.b", &agent("axzb", "client", &[])));
    }

    #[test]
    fn tag_membership_convention() {
        let premium = agent("a", "client", &[("tags", "premium,beta")]);
        let free = agent("b", "client", &[("tags", "free")]);

        assert!(matches("tags=*premium*", &premium));
        assert!(!matches("tags=*premium*", &free));
    }

    #[test]
    fn precedence_and_parentheses() {
        let bot = agent("scanner", "bot", &[]);

        // && binds tighter than ||.
        assert!(matches("role=bot || role=client && name=nope", &bot));
        assert!(!matches("(role=bot || role=client) && name=nope", &bot));
        assert!(matches("!(role=client)", &bot));
        assert!(matches("!role=client", &bot));
    }

    #[test]
    fn quoted_values_may_hold_delimiters() {
        let info = agent("a b", "client", &[]);

        assert!(matches("name='a b'", &info));
        assert!(matches("name=\"a b\"", &info));
    }

    #[test]
    fn malformed_expressions() {
        for source in [
            "",
            "role",
            "role=",
            "role==client",
            "role=client &&",
            "role=client )",
            "(role=client",
            "role=client & name=a",
            "name='unterminated",
        ] {
            assert!(source.parse::<Filter>().is_err(), "accepted: {source:?}");
        }
    }
}
