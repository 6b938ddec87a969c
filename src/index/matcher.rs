//! Label matchers
//!
//! A matcher is a predicate over the value of one label. An absent label is
//! treated as the empty string, so `job=""` selects series without `job`.
//!
//! Regex matchers are fully anchored: `job=~"api|web"` is compiled as
//! `^(?:api|web)$`.

use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::error::{IndexError, Result};

/// Default longest regex a matcher accepts
pub const DEFAULT_MAX_REGEX_LEN: usize = 4096;

/// Compiled regex size limit (1MB)
const REGEX_SIZE_LIMIT: usize = 1024 * 1024;

/// Kind of comparison a matcher performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `name="value"`
    Equal,
    /// `name!="value"`
    NotEqual,
    /// `name=~"regex"`
    Regex,
    /// `name!~"regex"`
    NotRegex,
}

impl MatchType {
    /// The negated match type
    pub fn inverse(self) -> Self {
        match self {
            MatchType::Equal => MatchType::NotEqual,
            MatchType::NotEqual => MatchType::Equal,
            MatchType::Regex => MatchType::NotRegex,
            MatchType::NotRegex => MatchType::Regex,
        }
    }

    /// Check if this is a negative match type
    pub fn is_negative(self) -> bool {
        matches!(self, MatchType::NotEqual | MatchType::NotRegex)
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        };
        f.write_str(op)
    }
}

/// Predicate over one label's value
#[derive(Debug, Clone)]
pub struct Matcher {
    match_type: MatchType,
    name: String,
    value: String,
    /// Anchored regex, for the regex match types
    re: Option<Regex>,
}

impl Matcher {
    /// Build a matcher, compiling the regex for regex match types
    ///
    /// # Errors
    ///
    /// `IndexError::InvalidMatcher` if the pattern is longer than
    /// [`DEFAULT_MAX_REGEX_LEN`] or does not compile.
    pub fn new(
        match_type: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        Self::with_max_regex_len(match_type, name, value, DEFAULT_MAX_REGEX_LEN)
    }

    /// Like [`Matcher::new`] with an explicit pattern length limit
    pub fn with_max_regex_len(
        match_type: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
        max_regex_len: usize,
    ) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        let re = match match_type {
            MatchType::Equal | MatchType::NotEqual => None,
            MatchType::Regex | MatchType::NotRegex => Some(compile(&value, max_regex_len)?),
        };

        Ok(Self {
            match_type,
            name,
            value,
            re,
        })
    }

    /// `name="value"`
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Equal,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    /// `name!="value"`
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::NotEqual,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    /// `name=~"pattern"`
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::Regex, name, pattern)
    }

    /// `name!~"pattern"`
    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::NotRegex, name, pattern)
    }

    /// Match type
    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Label name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value or (unanchored) pattern
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The anchored pattern the regex was compiled from
    pub fn anchored_pattern(&self) -> Option<&str> {
        self.re.as_ref().map(Regex::as_str)
    }

    /// Check if `value` satisfies the matcher
    pub fn matches(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Equal => self.value == value,
            MatchType::NotEqual => self.value != value,
            MatchType::Regex => self.re.as_ref().is_some_and(|re| re.is_match(value)),
            MatchType::NotRegex => !self.re.as_ref().is_some_and(|re| re.is_match(value)),
        }
    }

    /// The matcher accepting exactly the values this one rejects
    pub fn inverse(&self) -> Self {
        Self {
            match_type: self.match_type.inverse(),
            name: self.name.clone(),
            value: self.value.clone(),
            re: self.re.clone(),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.match_type == other.match_type && self.name == other.name && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}

fn compile(pattern: &str, max_len: usize) -> Result<Regex> {
    if pattern.len() > max_len {
        return Err(IndexError::InvalidMatcher(format!(
            "Regex pattern too long: {} chars (max: {})",
            pattern.len(),
            max_len
        ))
        .into());
    }

    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| {
            // keep error messages short for huge patterns
            let shown: String = pattern.chars().take(50).collect();
            IndexError::InvalidMatcher(format!("Invalid regex '{}': {}", shown, e)).into()
        })
}
