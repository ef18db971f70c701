//! Recursive scope-set semantics used to gate user-token Helix calls.

use serde::{Deserialize, Serialize};

/// An authorisation predicate over a token's granted scopes.
///
/// `Single` is satisfied iff the scope literally appears in the token's
/// scope list. `Any` is satisfied iff at least one child is. `All` is
/// satisfied iff every child is (vacuously true for an empty list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeSet {
    Single(String),
    Any { any: Vec<ScopeSet> },
    All { all: Vec<ScopeSet> },
}

impl ScopeSet {
    pub fn single(scope: impl Into<String>) -> Self {
        ScopeSet::Single(scope.into())
    }

    pub fn any(children: impl IntoIterator<Item = ScopeSet>) -> Self {
        ScopeSet::Any {
            any: children.into_iter().collect(),
        }
    }

    pub fn all(children: impl IntoIterator<Item = ScopeSet>) -> Self {
        ScopeSet::All {
            all: children.into_iter().collect(),
        }
    }

    /// Whether `granted` satisfies this scope set.
    pub fn is_satisfied_by(&self, granted: &[String]) -> bool {
        match self {
            ScopeSet::Single(scope) => granted.iter().any(|g| g == scope),
            ScopeSet::Any { any } => any.iter().any(|c| c.is_satisfied_by(granted)),
            ScopeSet::All { all } => all.iter().all(|c| c.is_satisfied_by(granted)),
        }
    }
}

impl From<&str> for ScopeSet {
    fn from(scope: &str) -> Self {
        ScopeSet::single(scope)
    }
}
