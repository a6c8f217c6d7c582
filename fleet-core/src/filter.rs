//! Client-supplied filter trees.
//!
//! API clients send filters as a postfix list of nodes, usually base64
//! encoded in a query string:
//!
//! ```json
//! [
//!   {"type": "property", "params": {"name": "name", "operator": "contains", "value": "web"}},
//!   {"type": "property", "params": {"name": "online", "operator": "bool", "value": "true"}},
//!   {"type": "operator", "params": {"name": "and"}}
//! ]
//! ```
//!
//! Parsing validates operators and coerces values up front, so a bad filter
//! is a [`ValidationError`] at the edge and never reaches the store.

use crate::ValidationError;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied to a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyOperator {
    /// Substring (strings) or containment of every element (lists)
    Contains,
    /// Equal to
    Eq,
    /// Equal to a coerced boolean
    Bool,
    /// Greater than a coerced number
    Gt,
}

impl PropertyOperator {
    fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "contains" => Ok(Self::Contains),
            "eq" => Ok(Self::Eq),
            "bool" => Ok(Self::Bool),
            "gt" => Ok(Self::Gt),
            other => Err(ValidationError::UnknownOperator {
                operator: other.to_string(),
            }),
        }
    }
}

/// Boolean connective joining two sub-trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(ValidationError::UnknownOperator {
                operator: other.to_string(),
            }),
        }
    }
}

/// A property comparison with its value already coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Case-insensitive substring match.
    Contains(String),
    /// Every listed value is present in the array field.
    ContainsAll(Vec<Value>),
    Eq(Value),
    Bool(bool),
    Gt(f64),
}

/// Parsed filter: a binary tree of logical nodes over property leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterTree {
    Property {
        name: String,
        condition: Condition,
    },
    Logical {
        operator: LogicalOperator,
        left: Box<FilterTree>,
        right: Box<FilterTree>,
    },
}

impl FilterTree {
    /// Build and validate a property leaf.
    pub fn property(
        name: impl Into<String>,
        operator: PropertyOperator,
        value: Value,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_property_name(&name)?;
        let condition = coerce(&name, operator, value)?;
        Ok(FilterTree::Property { name, condition })
    }

    pub fn and(left: FilterTree, right: FilterTree) -> Self {
        FilterTree::Logical {
            operator: LogicalOperator::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: FilterTree, right: FilterTree) -> Self {
        FilterTree::Logical {
            operator: LogicalOperator::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// A validated, possibly empty, client filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filters {
    root: Option<FilterTree>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
enum RawNode {
    Property {
        name: String,
        operator: String,
        #[serde(default)]
        value: Value,
    },
    Operator {
        name: String,
    },
}

impl Filters {
    /// A filter that matches everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(root: FilterTree) -> Self {
        Self { root: Some(root) }
    }

    pub fn root(&self) -> Option<&FilterTree> {
        self.root.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Decode a base64 (standard or URL-safe alphabet) JSON filter list.
    pub fn from_base64(encoded: &str) -> Result<Self, ValidationError> {
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return Ok(Self::none());
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(trimmed))
            .map_err(|e| ValidationError::MalformedFilter {
                reason: format!("invalid base64: {}", e),
            })?;
        let text = String::from_utf8(bytes).map_err(|e| ValidationError::MalformedFilter {
            reason: format!("invalid utf-8: {}", e),
        })?;
        Self::from_json(&text)
    }

    /// Parse a JSON filter list.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ValidationError::MalformedFilter {
                reason: e.to_string(),
            })?;
        Self::from_value(value)
    }

    /// Parse an already-decoded JSON filter list.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let nodes: Vec<RawNode> =
            serde_json::from_value(value).map_err(|e| ValidationError::MalformedFilter {
                reason: e.to_string(),
            })?;

        let mut stack: Vec<FilterTree> = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                RawNode::Property {
                    name,
                    operator,
                    value,
                } => {
                    let operator = PropertyOperator::parse(&operator)?;
                    stack.push(FilterTree::property(name, operator, value)?);
                }
                RawNode::Operator { name } => {
                    let operator = LogicalOperator::parse(&name)?;
                    let (Some(right), Some(left)) = (stack.pop(), stack.pop()) else {
                        return Err(ValidationError::MalformedFilter {
                            reason: format!("operator '{}' needs two operands", name),
                        });
                    };
                    stack.push(FilterTree::Logical {
                        operator,
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
            }
        }

        // Dangling sub-trees are implicitly joined with AND.
        let root = stack.into_iter().reduce(FilterTree::and);
        Ok(Self { root })
    }
}

fn validate_property_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
    }
    if name.starts_with('$') || name.split('.').any(str::is_empty) {
        return Err(ValidationError::InvalidValue {
            field: "name".to_string(),
            reason: format!("'{}' is not a valid property path", name),
        });
    }
    Ok(())
}

fn coerce(
    name: &str,
    operator: PropertyOperator,
    value: Value,
) -> Result<Condition, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidValue {
        field: name.to_string(),
        reason: reason.to_string(),
    };

    match operator {
        PropertyOperator::Contains => match value {
            Value::String(s) => Ok(Condition::Contains(s)),
            Value::Array(items) => Ok(Condition::ContainsAll(items)),
            _ => Err(invalid("contains expects a string or a list")),
        },
        PropertyOperator::Eq => Ok(Condition::Eq(value)),
        PropertyOperator::Bool => match value {
            Value::Bool(b) => Ok(Condition::Bool(b)),
            Value::Number(n) => Ok(Condition::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Condition::Bool(true)),
                "false" | "0" => Ok(Condition::Bool(false)),
                _ => Err(invalid("bool expects true/false/1/0")),
            },
            _ => Err(invalid("bool expects a boolean, number or string")),
        },
        PropertyOperator::Gt => match value {
            Value::Number(n) => n
                .as_f64()
                .map(Condition::Gt)
                .ok_or_else(|| invalid("gt expects a finite number")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Condition::Gt)
                .ok_or_else(|| invalid("gt expects a numeric string")),
            _ => Err(invalid("gt expects a number or numeric string")),
        },
    }
}
