//! Query predicates over entry attributes.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::storage::{AttributeValue, QueryInfo};

/// Boolean condition over a [`QueryInfo`]'s attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Predicate {
    /// Every item of the type
    All,
    Eq {
        attribute: String,
        value: AttributeValue,
    },
    Ne {
        attribute: String,
        value: AttributeValue,
    },
    Lt {
        attribute: String,
        value: AttributeValue,
    },
    Le {
        attribute: String,
        value: AttributeValue,
    },
    Gt {
        attribute: String,
        value: AttributeValue,
    },
    Ge {
        attribute: String,
        value: AttributeValue,
    },
    In {
        attribute: String,
        values: Vec<AttributeValue>,
    },
    /// Text attribute starts with `prefix`
    StartsWith {
        attribute: String,
        prefix: String,
    },
    And {
        clauses: Vec<Predicate>,
    },
    Or {
        clauses: Vec<Predicate>,
    },
    Not {
        clause: Box<Predicate>,
    },
}

impl Predicate {
    pub fn eq(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Predicate::Eq {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn gt(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Predicate::Gt {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn lt(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Predicate::Lt {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn and(clauses: Vec<Predicate>) -> Self {
        Predicate::And { clauses }
    }

    /// A missing attribute or incomparable value never matches
    pub fn evaluate(&self, info: &QueryInfo) -> bool {
        let compare = |attribute: &str, value: &AttributeValue| {
            info.attributes
                .get(attribute)
                .and_then(|actual| actual.compare(value))
        };

        match self {
            Predicate::All => true,
            Predicate::Eq { attribute, value } => {
                compare(attribute, value) == Some(Ordering::Equal)
            }
            Predicate::Ne { attribute, value } => {
                matches!(compare(attribute, value), Some(o) if o != Ordering::Equal)
            }
            Predicate::Lt { attribute, value } => compare(attribute, value) == Some(Ordering::Less),
            Predicate::Le { attribute, value } => {
                matches!(compare(attribute, value), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::Gt { attribute, value } => {
                compare(attribute, value) == Some(Ordering::Greater)
            }
            Predicate::Ge { attribute, value } => {
                matches!(compare(attribute, value), Some(Ordering::Greater | Ordering::Equal))
            }
            Predicate::In { attribute, values } => values
                .iter()
                .any(|value| compare(attribute, value) == Some(Ordering::Equal)),
            Predicate::StartsWith { attribute, prefix } => matches!(
                info.attributes.get(attribute),
                Some(AttributeValue::Text(text)) if text.starts_with(prefix.as_str())
            ),
            Predicate::And { clauses } => clauses.iter().all(|c| c.evaluate(info)),
            Predicate::Or { clauses } => clauses.iter().any(|c| c.evaluate(info)),
            Predicate::Not { clause } => !clause.evaluate(info),
        }
    }

    /// Attribute names the predicate reads
    pub fn attributes(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_attributes(&mut names);
        names
    }

    fn collect_attributes(&self, names: &mut BTreeSet<String>) {
        match self {
            Predicate::All => {}
            Predicate::Eq { attribute, .. }
            | Predicate::Ne { attribute, .. }
            | Predicate::Lt { attribute, .. }
            | Predicate::Le { attribute, .. }
            | Predicate::Gt { attribute, .. }
            | Predicate::Ge { attribute, .. }
            | Predicate::In { attribute, .. }
            | Predicate::StartsWith { attribute, .. } => {
                names.insert(attribute.clone());
            }
            Predicate::And { clauses } | Predicate::Or { clauses } => {
                for clause in clauses {
                    clause.collect_attributes(names);
                }
            }
            Predicate::Not { clause } => clause.collect_attributes(names),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(age: i64, city: &str) -> QueryInfo {
        QueryInfo::new("Person")
            .with("age", AttributeValue::Int(age))
            .with("city", AttributeValue::Text(city.to_string()))
    }

    #[test]
    fn test_comparisons() {
        let info = person(30, "Lagos");
        assert!(Predicate::gt("age", AttributeValue::Int(18)).evaluate(&info));
        assert!(!Predicate::lt("age", AttributeValue::Float(29.5)).evaluate(&info));
        assert!(Predicate::eq("city", AttributeValue::Text("Lagos".into())).evaluate(&info));
        assert!(Predicate::StartsWith {
            attribute: "city".into(),
            prefix: "La".into()
        }
        .evaluate(&info));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let info = person(30, "Lagos");
        assert!(!Predicate::eq("name", AttributeValue::Text("x".into())).evaluate(&info));
        assert!(!Predicate::Ne {
            attribute: "name".into(),
            value: AttributeValue::Int(1)
        }
        .evaluate(&info));
    }

    #[test]
    fn test_boolean_composition() {
        let info = person(30, "Lagos");
        let adult_in_lagos = Predicate::and(vec![
            Predicate::Ge {
                attribute: "age".into(),
                value: AttributeValue::Int(18),
            },
            Predicate::In {
                attribute: "city".into(),
                values: vec![
                    AttributeValue::Text("Abuja".into()),
                    AttributeValue::Text("Lagos".into()),
                ],
            },
        ]);
        assert!(adult_in_lagos.evaluate(&info));
        assert!(!Predicate::Not {
            clause: Box::new(adult_in_lagos.clone())
        }
        .evaluate(&info));
        assert_eq!(
            adult_in_lagos.attributes().into_iter().collect::<Vec<_>>(),
            vec!["age".to_string(), "city".to_string()]
        );
    }

    #[test]
    fn test_json_form() {
        let predicate = Predicate::gt("age", AttributeValue::Int(18));
        let json = serde_json::to_string(&predicate).unwrap();
        assert_eq!(json, r#"{"op":"gt","attribute":"age","value":18}"#);
        let back: Predicate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, predicate);
    }
}
