//! Matcher resolution over postings
//!
//! Turns a conjunction of label matchers into one bitmap of series IDs using
//! only per-`(name, value)` postings lookups.
//!
//! # Algorithm
//!
//! A label name "must be set" if any matcher on it rejects the empty string.
//! Then, per matcher:
//!
//! | label must be set | matcher                 | action                               |
//! |-------------------|-------------------------|--------------------------------------|
//! | yes               | `l="a"`, `l=~"a\|b"`    | AND postings of matching values      |
//! | yes               | `l!="a"` (accepts "")   | exclude postings of `l="a"`          |
//! | yes               | `l!=""` (rejects "")    | AND postings of every value accepted |
//! | no                | `l=""`, `l!~"a.*"`      | exclude postings of rejected values  |
//!
//! If nothing was ANDed but something is excluded, the accumulator starts
//! from all-postings. The sentinel ID is forced into both sides before the
//! final `accumulator - exclude`, so it never shows up in a result no matter
//! which branches ran.

use std::time::Instant;

use roaring::RoaringTreemap;
use tracing::trace;

use super::{IndexReader, Matcher, MatchType, SENTINEL_ID};
use crate::error::Result;

/// Characters with special meaning in a regex
const REGEX_META_CHARACTERS: &str = ".+*?()|[]{}^$";

fn is_regex_meta_character(c: char) -> bool {
    REGEX_META_CHARACTERS.contains(c)
}

/// Resolve `matchers` into the IDs of the series satisfying all of them
///
/// An empty matcher list selects nothing.
pub fn postings_for_matchers<R>(ix: &R, matchers: &[Matcher]) -> Result<RoaringTreemap>
where
    R: IndexReader + ?Sized,
{
    let start = Instant::now();

    let must_be_set = |name: &str| {
        matchers
            .iter()
            .any(|m| m.name() == name && !m.matches(""))
    };

    let mut acc: Option<RoaringTreemap> = None;
    let mut exclude: Option<RoaringTreemap> = None;

    let mut intersect = |postings: RoaringTreemap| match acc.as_mut() {
        Some(acc) => *acc &= &postings,
        None => acc = Some(postings),
    };
    let mut subtract = |postings: RoaringTreemap| match exclude.as_mut() {
        Some(exclude) => *exclude |= &postings,
        None => exclude = Some(postings),
    };

    for m in matchers {
        if must_be_set(m.name()) {
            let matches_empty = m.matches("");
            let is_not = m.match_type().is_negative();
            if is_not && matches_empty {
                // l!="a": drop series with l="a"
                subtract(postings_for_matcher(ix, &m.inverse())?);
            } else if is_not && !matches_empty {
                // l!="": every series carrying an accepted value
                intersect(inverse_postings_for_matcher(ix, &m.inverse())?);
            } else {
                intersect(postings_for_matcher(ix, m)?);
            }
        } else {
            // l="": drop series whose value is rejected
            subtract(inverse_postings_for_matcher(ix, m)?);
        }
    }

    if acc.is_none() && exclude.is_some() {
        acc = Some(ix.all_postings()?);
    }

    let mut acc = acc.unwrap_or_default();
    let mut exclude = exclude.unwrap_or_default();
    acc.insert(SENTINEL_ID);
    exclude.insert(SENTINEL_ID);
    acc -= &exclude;

    trace!(
        matchers = matchers.len(),
        series = acc.len(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "resolved postings"
    );
    Ok(acc)
}

/// Postings of every value `m` accepts
fn postings_for_matcher<R>(ix: &R, m: &Matcher) -> Result<RoaringTreemap>
where
    R: IndexReader + ?Sized,
{
    if m.match_type() == MatchType::Equal {
        return ix.postings(m.name(), &[m.value()]);
    }

    if m.match_type() == MatchType::Regex {
        if let Some(set) = m.anchored_pattern().and_then(find_set_matches) {
            let values: Vec<&str> = set.iter().map(String::as_str).collect();
            return ix.postings(m.name(), &values);
        }
    }

    let all = ix.label_values(m.name())?;
    let values: Vec<&str> = all
        .iter()
        .map(String::as_str)
        .filter(|v| m.matches(v))
        .collect();
    ix.postings(m.name(), &values)
}

/// Postings of every value `m` rejects
fn inverse_postings_for_matcher<R>(ix: &R, m: &Matcher) -> Result<RoaringTreemap>
where
    R: IndexReader + ?Sized,
{
    let all = ix.label_values(m.name())?;
    let values: Vec<&str> = all
        .iter()
        .map(String::as_str)
        .filter(|v| !m.matches(v))
        .collect();
    ix.postings(m.name(), &values)
}

/// Literal alternatives of an anchored `^(?:a|b|...)$` pattern
///
/// Returns `None` when the pattern is not a plain alternation of literals,
/// i.e. it holds an unescaped metacharacter other than `|` or an escape of
/// anything but a metacharacter or backslash. Empty alternatives are dropped.
///
/// ```rust
/// use kuba_profstore::index::find_set_matches;
///
/// assert_eq!(
///     find_set_matches(r"^(?:foo|bar\.baz)$"),
///     Some(vec!["foo".to_string(), "bar.baz".to_string()])
/// );
/// assert_eq!(find_set_matches("^(?:fo+)$"), None);
/// ```
pub fn find_set_matches(pattern: &str) -> Option<Vec<String>> {
    let body = pattern.strip_prefix("^(?:")?.strip_suffix(")$")?;

    let mut sets = vec![String::new()];
    let mut escaped = false;
    for c in body.chars() {
        let current = sets.last_mut()?;
        if escaped {
            if is_regex_meta_character(c) || c == '\\' {
                current.push(c);
            } else {
                return None;
            }
            escaped = false;
        } else if c == '|' {
            sets.push(String::new());
        } else if is_regex_meta_character(c) {
            return None;
        } else if c == '\\' {
            escaped = true;
        } else {
            current.push(c);
        }
    }
    if escaped {
        return None;
    }

    Some(sets.into_iter().filter(|s| !s.is_empty()).collect())
}

/// Sorted values of `name` on series selected by `matchers`
pub fn label_values_with_matchers<R>(
    ix: &R,
    name: &str,
    matchers: &[Matcher],
) -> Result<Vec<String>>
where
    R: IndexReader + ?Sized,
{
    let values = ix.label_values(name)?;
    if matchers.is_empty() {
        return Ok(values);
    }

    let mut with_label = matchers.to_vec();
    with_label.push(Matcher::not_equal(name, ""));
    let selected = postings_for_matchers(ix, &with_label)?;

    let mut out = Vec::new();
    for value in values {
        let postings = ix.postings(name, &[value.as_str()])?;
        if !postings.is_disjoint(&selected) {
            out.push(value);
        }
    }
    Ok(out)
}

/// Sorted label names present on series selected by `matchers`
pub fn label_names_with_matchers<R>(ix: &R, matchers: &[Matcher]) -> Result<Vec<String>>
where
    R: IndexReader + ?Sized,
{
    let names = ix.label_names()?;
    if matchers.is_empty() {
        return Ok(names);
    }

    let selected = postings_for_matchers(ix, matchers)?;
    let mut out = Vec::new();
    for name in names {
        let values = ix.label_values(&name)?;
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        if !ix.postings(&name, &values)?.is_disjoint(&selected) {
            out.push(name);
        }
    }
    Ok(out)
}
