// Expression Evaluator
// Resolves expressions against a variable context of completed node outputs

use super::{Expression, TemplatePart};
use crate::address::Address;

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unresolved reference '{path}'")]
    Unresolved { path: String },

    #[error("reference '{path}' is null (producer not complete or not a dependency)")]
    NullValue { path: String },

    #[error("cannot index '{path}': expected a list")]
    NotAList { path: String },

    #[error("{0}")]
    Custom(String),
}

/// Variable context handed to the evaluator
///
/// The root is a JSON object. Node outputs live under `step.<type>.<name>`,
/// and an indexed instance additionally sees its own `index`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    root: Map<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a top-level variable
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.root.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    /// Insert `value` at `root.type.name`, creating intermediate objects
    pub fn set_nested(&mut self, root: &str, group: &str, name: &str, value: Value) {
        let group_map = self
            .root
            .entry(root.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !group_map.is_object() {
            *group_map = Value::Object(Map::new());
        }
        if let Value::Object(groups) = group_map {
            let names = groups
                .entry(group.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !names.is_object() {
                *names = Value::Object(Map::new());
            }
            if let Value::Object(names) = names {
                names.insert(name.to_string(), value);
            }
        }
    }

    /// Walk `path` through the context
    pub fn lookup(&self, path: &Address) -> Result<&Value, EvalError> {
        let unresolved = || EvalError::Unresolved {
            path: path.to_string(),
        };

        let mut segments = path.segments().iter();
        let first = segments.next().ok_or_else(unresolved)?;
        let mut current = self.root.get(&first.name).ok_or_else(unresolved)?;
        if let Some(index) = first.index {
            current = index_into(current, index, path)?;
        }

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(&segment.name).ok_or_else(unresolved)?,
                Value::Null => {
                    return Err(EvalError::NullValue {
                        path: path.to_string(),
                    })
                }
                _ => return Err(unresolved()),
            };
            if let Some(index) = segment.index {
                current = index_into(current, index, path)?;
            }
        }

        Ok(current)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}

fn index_into<'a>(value: &'a Value, index: usize, path: &Address) -> Result<&'a Value, EvalError> {
    match value {
        Value::Array(items) => items.get(index).ok_or_else(|| EvalError::Unresolved {
            path: path.to_string(),
        }),
        Value::Null => Err(EvalError::NullValue {
            path: path.to_string(),
        }),
        _ => Err(EvalError::NotAList {
            path: path.to_string(),
        }),
    }
}

/// Turns an expression plus a variable context into a typed value
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &Expression, ctx: &EvalContext) -> Result<Value, EvalError>;

    /// Evaluate a map of named argument expressions into a JSON object
    fn evaluate_args(
        &self,
        args: &BTreeMap<String, Expression>,
        ctx: &EvalContext,
    ) -> Result<Value, EvalError> {
        let mut object = Map::new();
        for (name, expr) in args {
            object.insert(name.clone(), self.evaluate(expr, ctx)?);
        }
        Ok(Value::Object(object))
    }
}

/// Default evaluator: path lookups plus string interpolation
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for PathEvaluator {
    fn evaluate(&self, expr: &Expression, ctx: &EvalContext) -> Result<Value, EvalError> {
        match expr {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Reference(path) => match ctx.lookup(path)? {
                Value::Null => Err(EvalError::NullValue {
                    path: path.to_string(),
                }),
                value => Ok(value.clone()),
            },
            Expression::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Reference(path) => match ctx.lookup(path)? {
                            Value::String(s) => out.push_str(s),
                            Value::Null => {
                                return Err(EvalError::NullValue {
                                    path: path.to_string(),
                                })
                            }
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
            Expression::List(items) => items
                .iter()
                .map(|item| self.evaluate(item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expression::Map(entries) => self.evaluate_args(entries, ctx),
        }
    }
}
