//! Field-wise glob matching of policy rules against mutations.
//!
//! A pattern is a case-sensitive glob where `*` matches zero or more
//! characters. The empty pattern matches everything, so a rule only
//! constrains the fields it names. Patterns are compiled once when a rule is
//! built; matching is a pure function over immutable rules and may be called
//! concurrently without synchronization.

use crate::event::{Operation, Subject, UnknownOperation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Patterns longer than a DNS subdomain name are never meaningful here.
const MAX_PATTERN_LEN: usize = 253;

#[derive(Clone, Debug)]
pub struct Pattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Clone, Debug)]
enum Matcher {
    Any,
    Exact,
    Glob(Regex),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidPattern {
    #[error("pattern exceeds {} characters", MAX_PATTERN_LEN)]
    TooLong,

    #[error("pattern {0:?} contains whitespace or control characters")]
    IllegalChar(String),

    #[error("invalid operation pattern: {0}")]
    Operation(#[from] UnknownOperation),

    #[error("failed to compile pattern {0:?}: {1}")]
    Compile(String, String),
}

/// A conjunction of patterns over a mutation's identity fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct PatternRule {
    pub namespace: Pattern,
    pub name: Pattern,
    pub kind: Pattern,

    /// Only evaluated in [`Scope::Block`] and [`Scope::Alert`].
    pub operation: Pattern,
}

/// Identifies the rule list being evaluated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Ignore,
    Block,
    Alert,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    operation: String,
}

/// Returns true iff any rule matches the subject. An empty rule list never
/// matches.
pub fn matches<S>(rules: &[PatternRule], subject: &S, scope: Scope) -> bool
where
    S: Subject + ?Sized,
{
    first_match(rules, subject, scope).is_some()
}

/// Returns the first rule that matches the subject.
pub fn first_match<'r, S>(
    rules: &'r [PatternRule],
    subject: &S,
    scope: Scope,
) -> Option<&'r PatternRule>
where
    S: Subject + ?Sized,
{
    rules.iter().find(|rule| rule.matches(subject, scope))
}

// === impl Pattern ===

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidPattern> {
        let raw = raw.into();
        if raw.len() > MAX_PATTERN_LEN {
            return Err(InvalidPattern::TooLong);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidPattern::IllegalChar(raw));
        }

        let matcher = if raw.chars().all(|c| c == '*') {
            Matcher::Any
        } else if !raw.contains('*') {
            Matcher::Exact
        } else {
            let body = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("^(?s:{body})$"))
                .map_err(|error| InvalidPattern::Compile(raw.clone(), error.to_string()))?;
            Matcher::Glob(regex)
        };

        Ok(Self { raw, matcher })
    }

    /// A pattern that must either be a wildcard glob or name an operation
    /// exactly.
    pub fn operation(raw: impl Into<String>) -> Result<Self, InvalidPattern> {
        let pattern = Self::new(raw)?;
        if let Matcher::Exact = pattern.matcher {
            pattern.raw.parse::<Operation>()?;
        }
        Ok(pattern)
    }

    pub fn any() -> Self {
        Self {
            raw: String::new(),
            matcher: Matcher::Any,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Exact => self.raw == value,
            Matcher::Glob(re) => re.is_match(value),
        }
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

// === impl PatternRule ===

impl PatternRule {
    pub fn new(
        namespace: &str,
        name: &str,
        kind: &str,
        operation: &str,
    ) -> Result<Self, InvalidPattern> {
        Ok(Self {
            namespace: Pattern::new(namespace)?,
            name: Pattern::new(name)?,
            kind: Pattern::new(kind)?,
            operation: Pattern::operation(operation)?,
        })
    }

    pub fn matches<S>(&self, subject: &S, scope: Scope) -> bool
    where
        S: Subject + ?Sized,
    {
        self.namespace.matches(subject.namespace())
            && self.name.matches(subject.name())
            && self.kind.matches(subject.kind())
            && (!scope.checks_operation() || self.operation.matches(subject.operation().as_str()))
    }
}

impl fmt::Display for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("namespace", &self.namespace),
            ("name", &self.name),
            ("kind", &self.kind),
            ("operation", &self.operation),
        ];

        f.write_str("[")?;
        let mut first = true;
        for (field, pattern) in fields.into_iter().filter(|(_, p)| !p.is_empty()) {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{field}={pattern}")?;
            first = false;
        }
        if first {
            f.write_str("*")?;
        }
        f.write_str("]")
    }
}

impl TryFrom<RawRule> for PatternRule {
    type Error = InvalidPattern;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        Self::new(&raw.namespace, &raw.name, &raw.kind, &raw.operation)
    }
}

impl From<PatternRule> for RawRule {
    fn from(rule: PatternRule) -> Self {
        Self {
            namespace: rule.namespace.raw,
            name: rule.name.raw,
            kind: rule.kind.raw,
            operation: rule.operation.raw,
        }
    }
}

// === impl Scope ===

impl Scope {
    pub fn checks_operation(&self) -> bool {
        match self {
            Self::Ignore => false,
            Self::Block | Self::Alert => true,
        }
    }
}
