//! Target filters: a small LDAP-style predicate language matched against
//! provider property maps.
//!
//! References may constrain their matching providers with a filter such as
//! `(&(transport=tcp)(!(region=eu)))`. The filter is parsed once at metadata
//! validation time into a closed AST; matching is a pure function over a
//! [`PropertyMap`](crate::registry::PropertyMap).

use std::fmt;

use thiserror::Error;

use crate::registry::{PropertyMap, PropertyValue};

/// Parsed target filter.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetFilter {
    /// Matches every provider of the reference's capability.
    Always,
    /// `(key=*)` — the property must be present.
    Present(String),
    /// `(key=value)` — the property must equal `value` (string form; list
    /// properties match if any element equals).
    Equals(String, String),
    /// `(&(..)(..))`
    All(Vec<TargetFilter>),
    /// `(|(..)(..))`
    Any(Vec<TargetFilter>),
    /// `(!(..))`
    Not(Box<TargetFilter>),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,
    #[error("unbalanced parentheses in filter at offset {0}")]
    Unbalanced(usize),
    #[error("expected '(' at offset {0}")]
    ExpectedGroup(usize),
    #[error("missing '=' in comparison at offset {0}")]
    MissingComparator(usize),
    #[error("trailing input after filter at offset {0}")]
    TrailingInput(usize),
    #[error("operator '{op}' requires at least one operand at offset {at}")]
    EmptyOperator { op: char, at: usize },
}

impl TargetFilter {
    /// Parse an LDAP-style filter string.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let bytes = input.trim();
        if bytes.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser {
            src: bytes,
            pos: 0,
        };
        let filter = parser.group()?;
        parser.skip_ws();
        if parser.pos != parser.src.len() {
            return Err(FilterError::TrailingInput(parser.pos));
        }
        Ok(filter)
    }

    /// Evaluate the filter against a property map.
    pub fn matches(&self, props: &PropertyMap) -> bool {
        match self {
            TargetFilter::Always => true,
            TargetFilter::Present(key) => props.contains_key(key),
            TargetFilter::Equals(key, want) => props
                .get(key)
                .map(|v| v.matches_text(want))
                .unwrap_or(false),
            TargetFilter::All(parts) => parts.iter().all(|f| f.matches(props)),
            TargetFilter::Any(parts) => parts.iter().any(|f| f.matches(props)),
            TargetFilter::Not(inner) => !inner.matches(props),
        }
    }
}

impl fmt::Display for TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFilter::Always => write!(f, "(*)"),
            TargetFilter::Present(key) => write!(f, "({key}=*)"),
            TargetFilter::Equals(key, value) => write!(f, "({key}={value})"),
            TargetFilter::All(parts) => {
                write!(f, "(&")?;
                for p in parts {
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
            TargetFilter::Any(parts) => {
                write!(f, "(|")?;
                for p in parts {
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
            TargetFilter::Not(inner) => write!(f, "(!{inner})"),
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.src[self.pos..].starts_with(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Parse one parenthesized group: `(&...)`, `(|...)`, `(!...)` or a
    /// comparison `(key=value)`.
    fn group(&mut self) -> Result<TargetFilter, FilterError> {
        self.skip_ws();
        let start = self.pos;
        if self.bump() != Some('(') {
            return Err(FilterError::ExpectedGroup(start));
        }
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.bump();
                TargetFilter::All(self.operands('&', start)?)
            }
            Some('|') => {
                self.bump();
                TargetFilter::Any(self.operands('|', start)?)
            }
            Some('!') => {
                self.bump();
                let inner = self.group()?;
                TargetFilter::Not(Box::new(inner))
            }
            Some('*') => {
                // `(*)` wildcard: matches anything
                self.bump();
                TargetFilter::Always
            }
            _ => self.comparison()?,
        };
        self.skip_ws();
        if self.bump() != Some(')') {
            return Err(FilterError::Unbalanced(start));
        }
        Ok(filter)
    }

    fn operands(&mut self, op: char, at: usize) -> Result<Vec<TargetFilter>, FilterError> {
        let mut parts = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('(') => parts.push(self.group()?),
                _ => break,
            }
        }
        if parts.is_empty() {
            return Err(FilterError::EmptyOperator { op, at });
        }
        Ok(parts)
    }

    fn comparison(&mut self) -> Result<TargetFilter, FilterError> {
        let start = self.pos;
        let rest = &self.src[self.pos..];
        let close = rest
            .find(')')
            .ok_or(FilterError::Unbalanced(start))?;
        let body = &rest[..close];
        let eq = body
            .find('=')
            .ok_or(FilterError::MissingComparator(start))?;
        let key = body[..eq].trim().to_string();
        let value = body[eq + 1..].trim().to_string();
        self.pos += close;
        if key.is_empty() {
            return Err(FilterError::MissingComparator(start));
        }
        if value == "*" {
            Ok(TargetFilter::Present(key))
        } else {
            Ok(TargetFilter::Equals(key, value))
        }
    }
}
