//! Typed label selectors.
//!
//! Core logic describes which objects it wants with equality/inequality terms;
//! the selector only becomes a Kubernetes label-selector string (`k=v,k2!=v2`)
//! at the store boundary. This keeps the query tokens in one place and makes
//! malformed selectors unrepresentable.

use std::fmt;

/// A single selector term.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Eq(String, String),
    NotEq(String, String),
    /// Bare key existence, e.g. `autofail`.
    Has(String),
}

/// A conjunctive label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    terms: Vec<Term>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.terms.push(Term::Eq(key.to_string(), value.to_string()));
        self
    }

    /// Require `key!=value`.
    pub fn ne(mut self, key: &str, value: &str) -> Self {
        self.terms
            .push(Term::NotEq(key.to_string(), value.to_string()));
        self
    }

    /// Require the label key to be present, regardless of value.
    pub fn has(mut self, key: &str) -> Self {
        self.terms.push(Term::Has(key.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate the selector against a concrete label map. Used by the
    /// in-memory store; the Kubernetes store compiles to a string instead.
    pub fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|term| match term {
            Term::Eq(k, v) => labels.get(k).is_some_and(|actual| actual == v),
            Term::NotEq(k, v) => labels.get(k).map_or(true, |actual| actual != v),
            Term::Has(k) => labels.contains_key(k),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match term {
                Term::Eq(k, v) => write!(f, "{}={}", k, v)?,
                Term::NotEq(k, v) => write!(f, "{}!={}", k, v)?,
                Term::Has(k) => write!(f, "{}", k)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::labels;

    fn labels_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn compiles_to_label_selector_string() {
        let selector = Selector::new()
            .eq(labels::SERVICE_NAME, "mycluster")
            .ne(labels::BACKREST_JOB, "true");
        assert_eq!(
            selector.to_string(),
            "service-name=mycluster,pgo-backrest-job!=true"
        );
    }

    #[test]
    fn bare_key_term() {
        let selector = Selector::new().has(labels::AUTOFAIL);
        assert_eq!(selector.to_string(), "autofail");
    }

    #[test]
    fn matches_equality_and_inequality() {
        let selector = Selector::new()
            .eq(labels::PG_CLUSTER, "pg1")
            .ne(labels::BACKREST_RESTORE, "true");

        assert!(selector.matches(&labels_of(&[("pg-cluster", "pg1")])));
        assert!(selector.matches(&labels_of(&[
            ("pg-cluster", "pg1"),
            ("pgo-backrest-restore", "false"),
        ])));
        assert!(!selector.matches(&labels_of(&[
            ("pg-cluster", "pg1"),
            ("pgo-backrest-restore", "true"),
        ])));
        assert!(!selector.matches(&labels_of(&[("pg-cluster", "other")])));
    }

    #[test]
    fn absent_key_fails_equality_but_passes_inequality() {
        let eq = Selector::new().eq(labels::TARGET, "dep");
        let ne = Selector::new().ne(labels::TARGET, "dep");
        let empty = labels_of(&[]);
        assert!(!eq.matches(&empty));
        assert!(ne.matches(&empty));
    }
}
