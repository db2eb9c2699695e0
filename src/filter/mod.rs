//! Filter expressions over series metadata
//!
//! A [`FilterExpression`] is a tree of predicates over a [`Series`] combined
//! with `and`, `or` and `not`. It is built by a [`FilterGrammar`] from raw
//! query tokens and travels inside a [`RangeFilter`] to every shard.
//!
//! # Canonical form
//!
//! `Display` renders a stable textual form that is used as part of cache
//! fingerprints. Two filters that differ only in child order or redundant
//! nesting render identically once passed through
//! [`FilterExpression::optimize`].
//!
//! ```rust
//! use kuba_metadata::filter::FilterExpression;
//!
//! let a = FilterExpression::and(vec![
//!     FilterExpression::match_tag("host", "a"),
//!     FilterExpression::has_tag("role"),
//! ]);
//! let b = FilterExpression::and(vec![
//!     FilterExpression::AlwaysTrue,
//!     FilterExpression::has_tag("role"),
//!     FilterExpression::match_tag("host", "a"),
//! ]);
//!
//! assert_eq!(a.optimize().to_string(), b.optimize().to_string());
//! assert_eq!(a.optimize().to_string(), "(+role and host = \"a\")");
//! ```

pub mod parser;
pub mod range;

pub use parser::{FilterGrammar, QueryGrammar};
pub use range::RangeFilter;

use crate::types::Series;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Filter tree over series metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterExpression {
    /// Matches every series
    AlwaysTrue,

    /// Matches no series
    AlwaysFalse,

    /// Series has tag `key` with exactly `value`
    MatchTag {
        /// Tag key
        key: String,
        /// Required tag value
        value: String,
    },

    /// Series has tag `key` with any value
    HasTag {
        /// Tag key
        key: String,
    },

    /// Series key equals `name`
    MatchSeriesName {
        /// Required series key
        name: String,
    },

    /// Every child matches
    And {
        /// Conjuncts
        children: Vec<FilterExpression>,
    },

    /// At least one child matches
    Or {
        /// Disjuncts
        children: Vec<FilterExpression>,
    },

    /// Child does not match
    Not {
        /// Negated filter
        child: Box<FilterExpression>,
    },
}

impl Default for FilterExpression {
    /// The empty query matches everything
    fn default() -> Self {
        FilterExpression::AlwaysTrue
    }
}

impl FilterExpression {
    /// Tag equality predicate
    pub fn match_tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpression::MatchTag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Tag presence predicate
    pub fn has_tag(key: impl Into<String>) -> Self {
        FilterExpression::HasTag { key: key.into() }
    }

    /// Series key predicate
    pub fn match_series_name(name: impl Into<String>) -> Self {
        FilterExpression::MatchSeriesName { name: name.into() }
    }

    /// Conjunction
    pub fn and(children: Vec<FilterExpression>) -> Self {
        FilterExpression::And { children }
    }

    /// Disjunction
    pub fn or(children: Vec<FilterExpression>) -> Self {
        FilterExpression::Or { children }
    }

    /// Negation
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: FilterExpression) -> Self {
        FilterExpression::Not {
            child: Box::new(child),
        }
    }

    /// Evaluate the filter against a series
    pub fn matches(&self, series: &Series) -> bool {
        match self {
            FilterExpression::AlwaysTrue => true,
            FilterExpression::AlwaysFalse => false,
            FilterExpression::MatchTag { key, value } => series.tag(key) == Some(value.as_str()),
            FilterExpression::HasTag { key } => series.tags.contains_key(key),
            FilterExpression::MatchSeriesName { name } => series.key == *name,
            FilterExpression::And { children } => children.iter().all(|c| c.matches(series)),
            FilterExpression::Or { children } => children.iter().any(|c| c.matches(series)),
            FilterExpression::Not { child } => !child.matches(series),
        }
    }

    /// True if this is the always-true filter
    pub fn is_always_true(&self) -> bool {
        matches!(self, FilterExpression::AlwaysTrue)
    }

    /// Rewrite into normal form without changing which series match
    ///
    /// - nested `and`/`or` are flattened into their parent
    /// - identity elements are dropped, absorbing elements short-circuit
    /// - single-child combinators collapse to the child
    /// - double negation is removed, `!true` becomes `false` and vice versa
    /// - children are sorted and deduplicated by canonical form
    pub fn optimize(&self) -> FilterExpression {
        match self {
            FilterExpression::And { children } => optimize_combinator(children, true),
            FilterExpression::Or { children } => optimize_combinator(children, false),
            FilterExpression::Not { child } => match child.optimize() {
                FilterExpression::AlwaysTrue => FilterExpression::AlwaysFalse,
                FilterExpression::AlwaysFalse => FilterExpression::AlwaysTrue,
                FilterExpression::Not { child } => *child,
                other => FilterExpression::not(other),
            },
            leaf => leaf.clone(),
        }
    }
}

/// Shared normalisation for `and` (`conjunction = true`) and `or`
fn optimize_combinator(children: &[FilterExpression], conjunction: bool) -> FilterExpression {
    let (identity, absorbing) = if conjunction {
        (FilterExpression::AlwaysTrue, FilterExpression::AlwaysFalse)
    } else {
        (FilterExpression::AlwaysFalse, FilterExpression::AlwaysTrue)
    };

    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match child.optimize() {
            c if c == identity => {}
            c if c == absorbing => return absorbing,
            FilterExpression::And { children } if conjunction => flat.extend(children),
            FilterExpression::Or { children } if !conjunction => flat.extend(children),
            c => flat.push(c),
        }
    }

    let mut keyed: Vec<(String, FilterExpression)> =
        flat.into_iter().map(|c| (c.to_string(), c)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    let mut children: Vec<FilterExpression> = keyed.into_iter().map(|(_, c)| c).collect();
    match children.len() {
        0 => identity,
        1 => children.remove(0),
        _ if conjunction => FilterExpression::And { children },
        _ => FilterExpression::Or { children },
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpression::AlwaysTrue => write!(f, "true"),
            FilterExpression::AlwaysFalse => write!(f, "false"),
            FilterExpression::MatchTag { key, value } => write!(f, "{} = {:?}", key, value),
            FilterExpression::HasTag { key } => write!(f, "+{}", key),
            FilterExpression::MatchSeriesName { name } => write!(f, "$key = {:?}", name),
            FilterExpression::And { children } => write_joined(f, children, " and "),
            FilterExpression::Or { children } => write_joined(f, children, " or "),
            FilterExpression::Not { child } => write!(f, "!{}", child),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[FilterExpression], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", child)?;
    }
    write!(f, ")")
}
