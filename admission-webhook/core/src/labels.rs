use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::LazyLock};
use thiserror::Error;

pub type Map = BTreeMap<String, String>;

/// A set of required key/value constraints, such as a node selector or a set
/// of annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Labels(Map);

/// Two label sets require different values for the same key.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("key {key:?} has conflicting values {left:?} and {right:?}")]
pub struct Conflict {
    pub key: String,
    pub left: String,
    pub right: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid selector term {0:?}, expected key=value")]
    Term(String),

    #[error("invalid label key {key:?}: {reason}")]
    Key { key: String, reason: &'static str },

    #[error("invalid label value {value:?} for key {key:?}: {reason}")]
    Value {
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("key {0:?} is set more than once with different values")]
    Duplicate(String),
}

const NAME_MAX_LEN: usize = 63;
const PREFIX_MAX_LEN: usize = 253;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("should compile")
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("should compile")
});

// === Labels ===

impl Labels {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the first key, in key order, that both sets require with
    /// different values.
    pub fn conflict(&self, other: &Labels) -> Option<Conflict> {
        self.0.iter().find_map(|(key, left)| match other.0.get(key) {
            Some(right) if right != left => Some(Conflict {
                key: key.clone(),
                left: left.clone(),
                right: right.clone(),
            }),
            _ => None,
        })
    }

    #[inline]
    pub fn conflicts(&self, other: &Labels) -> bool {
        self.conflict(other).is_some()
    }

    /// Returns the key-wise union of both sets.
    ///
    /// Sets that conflict have no union; the first conflict is returned instead.
    pub fn merge(&self, other: &Labels) -> Result<Labels, Conflict> {
        if let Some(conflict) = self.conflict(other) {
            return Err(conflict);
        }

        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Self(merged))
    }

    /// Returns true if any key/value pair occurs in both sets.
    pub fn intersects(&self, other: &Labels) -> bool {
        self.0.iter().any(|(k, v)| other.0.get(k) == Some(v))
    }

    pub fn into_inner(self) -> Map {
        self.0
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(labels)
    }
}

impl From<Labels> for Map {
    #[inline]
    fn from(Labels(labels): Labels) -> Self {
        labels
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        &self.0
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Parses a selector expression of the form `k1=v1,k2=v2`.
impl FromStr for Labels {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = Map::new();
        if s.trim().is_empty() {
            return Ok(Self(labels));
        }

        for term in s.split(',') {
            let (key, value) = match term.split('=').collect::<Vec<_>>()[..] {
                [key, value] => (key.trim(), value.trim()),
                _ => return Err(ParseError::Term(term.to_string())),
            };
            validate_key(key)?;
            validate_value(key, value)?;

            // Unlike a last-wins map, a key repeated with a different value is
            // rejected so that a selector never drops a constraint.
            match labels.get(key) {
                Some(existing) if existing != value => {
                    return Err(ParseError::Duplicate(key.to_string()))
                }
                Some(_) => {}
                None => {
                    labels.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self(labels))
    }
}

/// Validates a qualified name: an optional DNS subdomain prefix followed by
/// `/` and a name segment.
fn validate_key(key: &str) -> Result<(), ParseError> {
    let invalid = |reason| ParseError::Key {
        key: key.to_string(),
        reason,
    };

    let name = match key.split('/').collect::<Vec<_>>()[..] {
        [name] => name,
        [prefix, name] => {
            if prefix.is_empty() {
                return Err(invalid("prefix part must be non-empty"));
            }
            if prefix.len() > PREFIX_MAX_LEN {
                return Err(invalid("prefix part must be no more than 253 characters"));
            }
            if !DNS_SUBDOMAIN.is_match(prefix) {
                return Err(invalid("prefix part must be a lowercase DNS subdomain"));
            }
            name
        }
        _ => return Err(invalid("must contain at most one '/'")),
    };

    if name.is_empty() {
        return Err(invalid("name part must be non-empty"));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(invalid("name part must be no more than 63 characters"));
    }
    if !NAME.is_match(name) {
        return Err(invalid(
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), ParseError> {
    let invalid = |reason| ParseError::Value {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Ok(());
    }
    if value.len() > NAME_MAX_LEN {
        return Err(invalid("must be no more than 63 characters"));
    }
    if !NAME.is_match(value) {
        return Err(invalid(
            "must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&'static str, &'static str)]) -> Labels {
        Labels::from_iter(pairs.iter().copied())
    }

    #[test]
    fn test_conflicts() {
        for (a, b, conflicts, msg) in &[
            (labels(&[]), labels(&[]), false, "empty sets"),
            (labels(&[("a", "1")]), labels(&[]), false, "one empty set"),
            (labels(&[("a", "1")]), labels(&[("a", "1")]), false, "same value"),
            (labels(&[("a", "1")]), labels(&[("b", "2")]), false, "disjoint keys"),
            (labels(&[("a", "1")]), labels(&[("a", "2")]), true, "different value"),
            (
                labels(&[("a", "1"), ("b", "2")]),
                labels(&[("b", "2"), ("c", "3"), ("a", "9")]),
                true,
                "one of several shared keys differs",
            ),
        ] {
            assert_eq!(a.conflicts(b), *conflicts, "{}", msg);
            assert_eq!(b.conflicts(a), *conflicts, "{} (reversed)", msg);
        }
    }

    #[test]
    fn never_conflicts_with_itself() {
        let set = labels(&[("team", "app"), ("zone", "a")]);
        assert!(!set.conflicts(&set));
    }

    #[test]
    fn conflict_names_first_key() {
        let a = labels(&[("a", "1"), ("b", "1")]);
        let b = labels(&[("a", "2"), ("b", "2")]);
        assert_eq!(
            a.conflict(&b),
            Some(Conflict {
                key: "a".to_string(),
                left: "1".to_string(),
                right: "2".to_string(),
            })
        );
        assert_eq!(b.conflict(&a).map(|c| c.key), Some("a".to_string()));
    }

    #[test]
    fn merge_is_union() {
        let a = labels(&[("a", "1"), ("b", "2")]);
        let b = labels(&[("b", "2"), ("c", "3")]);
        let merged = a.merge(&b).expect("sets must merge");
        assert_eq!(merged, labels(&[("a", "1"), ("b", "2"), ("c", "3")]));
        assert_eq!(b.merge(&a).expect("sets must merge"), merged);
        for (k, v) in a.iter().chain(b.iter()) {
            assert_eq!(merged.get(k), Some(v));
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let a = labels(&[("a", "1"), ("b", "2")]);
        assert_eq!(a.merge(&a), Ok(a.clone()));
    }

    #[test]
    fn merge_fails_on_conflict() {
        let a = labels(&[("a", "1")]);
        let b = labels(&[("a", "2")]);
        let err = a.merge(&b).unwrap_err();
        assert_eq!(err.key, "a");
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn intersects_requires_matching_pair() {
        let ignored = labels(&[("skip", "true")]);
        assert!(labels(&[("skip", "true"), ("app", "web")]).intersects(&ignored));
        assert!(!labels(&[("skip", "false")]).intersects(&ignored));
        assert!(!labels(&[("app", "web")]).intersects(&ignored));
        assert!(!Labels::default().intersects(&ignored));
    }

    #[test]
    fn parse_selector_expression() {
        for (input, expected) in [
            ("", labels(&[])),
            ("   ", labels(&[])),
            ("team=app", labels(&[("team", "app")])),
            (
                " team = app , zone=us-east-1a",
                labels(&[("team", "app"), ("zone", "us-east-1a")]),
            ),
            (
                "node.example.com/pool=batch",
                labels(&[("node.example.com/pool", "batch")]),
            ),
            ("empty=", labels(&[("empty", "")])),
            ("a=1,a=1", labels(&[("a", "1")])),
        ] {
            assert_eq!(input.parse::<Labels>(), Ok(expected), "{input:?}");
        }
    }

    #[test]
    fn parse_rejects_malformed_terms() {
        assert_eq!(
            "team".parse::<Labels>(),
            Err(ParseError::Term("team".to_string()))
        );
        assert_eq!(
            "a=b=c".parse::<Labels>(),
            Err(ParseError::Term("a=b=c".to_string()))
        );
        assert_eq!(
            "a=1,".parse::<Labels>(),
            Err(ParseError::Term("".to_string()))
        );
        assert_eq!(
            "a=1,a=2".parse::<Labels>(),
            Err(ParseError::Duplicate("a".to_string()))
        );
    }

    #[test]
    fn parse_rejects_invalid_keys_and_values() {
        for input in [
            "=value",
            "-team=app",
            "team-=app",
            "Example.com/team=app",
            "/team=app",
            "a/b/c=app",
            "team!=app",
        ] {
            assert!(
                matches!(input.parse::<Labels>(), Err(ParseError::Key { .. })),
                "{input:?} must be rejected"
            );
        }

        let long = format!("team={}", "x".repeat(64));
        assert!(matches!(
            long.parse::<Labels>(),
            Err(ParseError::Value { .. })
        ));
        assert!(matches!(
            "team=-app".parse::<Labels>(),
            Err(ParseError::Value { .. })
        ));
    }

    #[test]
    fn display_is_selector_expression() {
        let set = labels(&[("zone", "a"), ("team", "app")]);
        assert_eq!(set.to_string(), "team=app,zone=a");
    }
}
