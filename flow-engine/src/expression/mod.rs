// Expression Module
// Unevaluated argument expressions, reference extraction, and evaluation

pub mod evaluator;
pub mod lexer;

pub use evaluator::{EvalContext, EvalError, Evaluator, PathEvaluator};
pub use lexer::{tokenize, LexError, TemplatePart};

use crate::address::Address;

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// An unevaluated expression attached to a step or resource argument
///
/// Deserializes from any YAML/JSON value: strings are scanned for `${path}`
/// interpolations, lists and maps are walked recursively, and every other
/// scalar becomes a literal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum Expression {
    Literal(Value),
    /// A whole-value reference, `${step.http.fetch.output}`
    Reference(Address),
    /// A string with interpolated references
    Template(Vec<TemplatePart>),
    List(Vec<Expression>),
    Map(BTreeMap<String, Expression>),
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    /// Parse a string expression, recognizing `${...}` interpolations
    pub fn parse(input: &str) -> Result<Self, LexError> {
        let parts = tokenize(input)?;

        if let [TemplatePart::Reference(address)] = parts.as_slice() {
            return Ok(Expression::Reference(address.clone()));
        }

        if parts
            .iter()
            .all(|part| matches!(part, TemplatePart::Text(_)))
        {
            return Ok(Expression::Literal(Value::String(input.to_string())));
        }

        Ok(Expression::Template(parts))
    }

    /// Every path referenced by this expression, in document order
    pub fn references(&self) -> Vec<&Address> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Address>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Reference(address) => refs.push(address),
            Expression::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(address) = part {
                        refs.push(address);
                    }
                }
            }
            Expression::List(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Expression::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(refs);
                }
            }
        }
    }
}

impl TryFrom<Value> for Expression {
    type Error = LexError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Expression::parse(&s),
            Value::Array(items) => Ok(Expression::List(
                items
                    .into_iter()
                    .map(Expression::try_from)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(entries) => Ok(Expression::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Expression::try_from(v).map(|e| (k, e)))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(Expression::Literal(other)),
        }
    }
}
