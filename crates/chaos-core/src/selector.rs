use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::{ChaosError, ChaosResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            Self::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Self::Exists(k) => labels.contains_key(k),
            Self::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(k, v) => write!(f, "{k}={v}"),
            Self::In(k, vs) => write!(f, "{k} in ({})", vs.join(",")),
            Self::NotIn(k, vs) => write!(f, "{k} notin ({})", vs.join(",")),
            Self::Exists(k) => write!(f, "{k}"),
            Self::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// A validated label selector. All requirements must hold; no requirements
/// selects everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelQuery {
    requirements: Vec<Requirement>,
}

impl LabelQuery {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_selector(selector: &LabelSelector) -> ChaosResult<Self> {
        let mut requirements = Vec::new();

        for (k, v) in selector.match_labels.iter().flatten() {
            validate_key(k)?;
            validate_value(k, v)?;
            requirements.push(Requirement::Equals(k.clone(), v.clone()));
        }

        for expr in selector.match_expressions.iter().flatten() {
            let key = expr.key.clone();
            validate_key(&key)?;
            let values = expr.values.clone().unwrap_or_default();
            for value in &values {
                validate_value(&key, value)?;
            }
            let req = match expr.operator.as_str() {
                "In" | "NotIn" if values.is_empty() => {
                    return Err(ChaosError::InvalidSelector(format!(
                        "operator {} on '{key}' requires values",
                        expr.operator
                    )))
                }
                "In" => Requirement::In(key, values),
                "NotIn" => Requirement::NotIn(key, values),
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    return Err(ChaosError::InvalidSelector(format!(
                        "operator {} on '{key}' takes no values",
                        expr.operator
                    )))
                }
                "Exists" => Requirement::Exists(key),
                "DoesNotExist" => Requirement::DoesNotExist(key),
                other => {
                    return Err(ChaosError::InvalidSelector(format!(
                        "unknown operator '{other}'"
                    )))
                }
            };
            requirements.push(req);
        }

        Ok(Self { requirements })
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// `[prefix/]name`: the prefix is a DNS subdomain, the name a qualified name.
fn validate_key(key: &str) -> ChaosResult<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let valid = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix.split('.').all(|part| {
                !part.is_empty()
                    && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
        if !valid {
            return Err(ChaosError::InvalidSelector(format!(
                "invalid label key prefix in '{key}'"
            )));
        }
    }
    if !is_qualified_name(name) {
        return Err(ChaosError::InvalidSelector(format!(
            "invalid label key '{key}'"
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> ChaosResult<()> {
    if value.is_empty() || is_qualified_name(value) {
        return Ok(());
    }
    Err(ChaosError::InvalidSelector(format!(
        "invalid value '{value}' for label '{key}'"
    )))
}

/// At most 63 alphanumerics, `-`, `_` or `.`, starting and ending alphanumeric.
fn is_qualified_name(s: &str) -> bool {
    let alnum_edge = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    !s.is_empty()
        && s.len() <= 63
        && alnum_edge(s.chars().next())
        && alnum_edge(s.chars().last())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn match_labels_and_expressions_combine() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "db")])),
            match_expressions: Some(vec![
                expr("tier", "In", &["primary", "replica"]),
                expr("canary", "DoesNotExist", &[]),
            ]),
        };
        let query = LabelQuery::from_selector(&selector).unwrap();
        assert_eq!(
            query.to_string(),
            "app=db,tier in (primary,replica),!canary"
        );

        assert!(query.matches(&labels(&[("app", "db"), ("tier", "primary")])));
        assert!(!query.matches(&labels(&[("app", "db"), ("tier", "cache")])));
        assert!(!query.matches(&labels(&[
            ("app", "db"),
            ("tier", "replica"),
            ("canary", "yes")
        ])));
        assert!(!query.matches(&labels(&[("tier", "primary")])));
    }

    #[test]
    fn empty_selector_selects_everything() {
        let query = LabelQuery::from_selector(&LabelSelector::default()).unwrap();
        assert!(query.is_everything());
        assert!(query.matches(&BTreeMap::new()));
        assert_eq!(query.to_string(), "");
    }

    #[test]
    fn not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_expressions: Some(vec![expr("env", "NotIn", &["prod"])]),
            ..Default::default()
        };
        let query = LabelQuery::from_selector(&selector).unwrap();
        assert!(query.matches(&BTreeMap::new()));
        assert!(query.matches(&labels(&[("env", "dev")])));
        assert!(!query.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [
            expr("tier", "In", &[]),
            expr("tier", "Exists", &["x"]),
            expr("tier", "Like", &["x"]),
            expr("", "Exists", &[]),
        ] {
            let selector = LabelSelector {
                match_expressions: Some(vec![bad]),
                ..Default::default()
            };
            assert!(matches!(
                LabelQuery::from_selector(&selector),
                Err(ChaosError::InvalidSelector(_))
            ));
        }
    }

    #[test]
    fn label_syntax_is_checked() {
        let ok = LabelSelector {
            match_labels: Some(labels(&[("app.kubernetes.io/name", "web-1.2_x"), ("tier", "")])),
            match_expressions: Some(vec![expr("chaos-agents.io/role", "In", &["db"])]),
        };
        assert!(LabelQuery::from_selector(&ok).is_ok());

        let long = "v".repeat(64);
        let bad_labels = [
            ("-app", "web"),
            ("app", "web server"),
            ("app", "-web"),
            ("Example.com/app", "web"),
            ("example.com/", "web"),
            ("/app", "web"),
            ("app", long.as_str()),
        ];
        for (k, v) in bad_labels {
            let selector = LabelSelector {
                match_labels: Some(labels(&[(k, v)])),
                ..Default::default()
            };
            assert!(
                matches!(
                    LabelQuery::from_selector(&selector),
                    Err(ChaosError::InvalidSelector(_))
                ),
                "{k}={v} should be rejected"
            );
        }

        let selector = LabelSelector {
            match_expressions: Some(vec![expr("tier", "In", &["primary", "re plica"])]),
            ..Default::default()
        };
        assert!(LabelQuery::from_selector(&selector).is_err());
    }
}
