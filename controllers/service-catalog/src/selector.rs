//! Label-selector predicates for catalog restrictions.
//!
//! A broker may restrict which classes and plans it publishes with
//! selector strings evaluated against a small property set of each entry
//! (`name`, `spec.externalName`, `spec.externalID` and, for plans,
//! `spec.serviceClass.name`). Supported forms:
//!
//! - `key`, `!key`
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a, b)`, `key notin (a, b)`
//!
//! Multiple requirements, in one string or across the list, are ANDed.

use crate::error::ControllerError;
use std::collections::{BTreeMap, BTreeSet};

/// Property of every catalog entry holding its store name
pub const PROPERTY_NAME: &str = "name";
pub const PROPERTY_EXTERNAL_NAME: &str = "spec.externalName";
pub const PROPERTY_EXTERNAL_ID: &str = "spec.externalID";
/// Store name of the class a plan belongs to
pub const PROPERTY_SERVICE_CLASS_NAME: &str = "spec.serviceClass.name";

/// Values a predicate is evaluated against
pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operator {
    Exists,
    DoesNotExist,
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
}

impl Requirement {
    fn matches(&self, properties: &Properties) -> bool {
        let value = properties.get(&self.key);
        match &self.operator {
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Equals(v) => value == Some(v),
            Operator::NotEquals(v) => value != Some(v),
            Operator::In(set) => value.is_some_and(|v| set.contains(v)),
            Operator::NotIn(set) => value.is_none_or(|v| !set.contains(v)),
        }
    }
}

/// Conjunction of parsed requirements; empty admits everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    requirements: Vec<Requirement>,
}

impl Predicate {
    /// Parse one selector string
    pub fn parse(input: &str) -> Result<Self, ControllerError> {
        let mut requirements = Vec::new();
        for term in split_terms(input)? {
            requirements.push(parse_requirement(&term).map_err(|reason| invalid(input, &reason))?);
        }
        Ok(Self { requirements })
    }

    /// Parse and AND together a restriction list
    pub fn from_restrictions(restrictions: &[String]) -> Result<Self, ControllerError> {
        let mut predicate = Self::default();
        for restriction in restrictions {
            predicate.requirements.extend(Self::parse(restriction)?.requirements);
        }
        Ok(predicate)
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn accepts(&self, properties: &Properties) -> bool {
        self.requirements.iter().all(|r| r.matches(properties))
    }
}

fn invalid(input: &str, reason: &str) -> ControllerError {
    ControllerError::InvalidConfig(format!("invalid catalog restriction {input:?}: {reason}"))
}

/// Split on commas outside parentheses
fn split_terms(input: &str) -> Result<Vec<String>, ControllerError> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| invalid(input, "unbalanced parenthesis"))?;
                current.push(c);
            }
            ',' if depth == 0 => terms.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(invalid(input, "unbalanced parenthesis"));
    }
    terms.push(current);

    let terms: Vec<String> = terms.into_iter().map(|t| t.trim().to_string()).collect();
    if terms.len() == 1 && terms[0].is_empty() {
        return Ok(Vec::new());
    }
    if terms.iter().any(String::is_empty) {
        return Err(invalid(input, "empty requirement"));
    }
    Ok(terms)
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 253
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
}

fn valid_value(value: &str) -> bool {
    value.len() <= 63 && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn checked_key(key: &str) -> Result<String, String> {
    let key = key.trim();
    if valid_key(key) {
        Ok(key.to_string())
    } else {
        Err(format!("invalid key {key:?}"))
    }
}

fn checked_value(value: &str) -> Result<String, String> {
    let value = value.trim();
    if valid_value(value) {
        Ok(value.to_string())
    } else {
        Err(format!("invalid value {value:?}"))
    }
}

fn parse_set(rest: &str) -> Result<BTreeSet<String>, String> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| "set must be enclosed in parentheses".to_string())?;
    let values = inner
        .split(',')
        .map(checked_value)
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(values)
}

fn parse_requirement(term: &str) -> Result<Requirement, String> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::DoesNotExist,
        });
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::NotEquals(checked_value(value)?),
        });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::Equals(checked_value(value)?),
        });
    }

    let mut words = term.splitn(2, char::is_whitespace);
    let key = words.next().unwrap_or_default();
    let rest = words.next().unwrap_or_default().trim_start();
    if rest.is_empty() {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::Exists,
        });
    }
    if let Some(set) = rest.strip_prefix("notin") {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::NotIn(parse_set(set)?),
        });
    }
    if let Some(set) = rest.strip_prefix("in") {
        return Ok(Requirement {
            key: checked_key(key)?,
            operator: Operator::In(parse_set(set)?),
        });
    }
    Err(format!("unknown operator in {term:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_equality_requirements() {
        let mysql = props(&[(PROPERTY_EXTERNAL_NAME, "mysql"), (PROPERTY_NAME, "abc")]);
        let redis = props(&[(PROPERTY_EXTERNAL_NAME, "redis"), (PROPERTY_NAME, "def")]);

        let p = Predicate::parse("spec.externalName=mysql").unwrap();
        assert!(p.accepts(&mysql));
        assert!(!p.accepts(&redis));

        let p = Predicate::parse("spec.externalName!=mysql").unwrap();
        assert!(!p.accepts(&mysql));
        assert!(p.accepts(&redis));

        let p = Predicate::parse("spec.externalName==redis, name=def").unwrap();
        assert!(p.accepts(&redis));
    }

    #[test]
    fn test_set_requirements() {
        let small = props(&[(PROPERTY_EXTERNAL_NAME, "small")]);
        let large = props(&[(PROPERTY_EXTERNAL_NAME, "large")]);

        let p = Predicate::parse("spec.externalName in (small, medium)").unwrap();
        assert!(p.accepts(&small));
        assert!(!p.accepts(&large));

        let p = Predicate::parse("spec.externalName notin (small,medium)").unwrap();
        assert!(!p.accepts(&small));
        assert!(p.accepts(&large));
    }

    #[test]
    fn test_existence_requirements() {
        let plan = props(&[(PROPERTY_SERVICE_CLASS_NAME, "c1")]);
        assert!(Predicate::parse("spec.serviceClass.name").unwrap().accepts(&plan));
        assert!(!Predicate::parse("!spec.serviceClass.name").unwrap().accepts(&plan));
    }

    #[test]
    fn test_restriction_list_is_anded() {
        let p = Predicate::from_restrictions(&[
            "spec.externalName in (a,b)".to_string(),
            "name!=skip".to_string(),
        ])
        .unwrap();
        assert!(p.accepts(&props(&[(PROPERTY_EXTERNAL_NAME, "a"), (PROPERTY_NAME, "keep")])));
        assert!(!p.accepts(&props(&[(PROPERTY_EXTERNAL_NAME, "a"), (PROPERTY_NAME, "skip")])));
    }

    #[test]
    fn test_empty_selector_admits_everything() {
        let p = Predicate::parse("").unwrap();
        assert!(p.is_empty());
        assert!(p.accepts(&Properties::new()));
        assert!(Predicate::from_restrictions(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_selectors_are_rejected() {
        for input in [
            "spec.externalName in small",
            "spec.externalName in (a",
            "a=b,,c=d",
            "name=has space",
            "spec.externalName matches (a)",
            "=value",
        ] {
            assert!(
                matches!(Predicate::parse(input), Err(ControllerError::InvalidConfig(_))),
                "{input:?} should be rejected"
            );
        }
    }
}
