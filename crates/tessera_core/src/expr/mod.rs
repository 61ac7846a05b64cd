//! Scalar expressions evaluated against a row.

pub mod function;

use std::collections::HashSet;
use std::fmt;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

pub use self::function::{Arity, Function};
use crate::column::Column;
use crate::raster::Row;
use crate::value::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Binary {
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulus,
    Concatenation,
    Equal,
    NotEqual,
    Greater,
    Lesser,
    GreaterEqual,
    LesserEqual,
    /// Case insensitive substring test.
    ContainsString,
    ContainsStringStrict,
    /// Case insensitive regex match.
    MatchesRegex,
    MatchesRegexStrict,
}

impl Binary {
    pub fn apply(&self, lhs: &Value, rhs: &Value) -> Value {
        match self {
            Binary::Addition => lhs.add(rhs),
            Binary::Subtraction => lhs.subtract(rhs),
            Binary::Multiplication => lhs.multiply(rhs),
            Binary::Division => lhs.divide(rhs),
            Binary::Modulus => lhs.modulus(rhs),
            Binary::Concatenation => lhs.concat(rhs),
            Binary::Equal => lhs.equals(rhs),
            Binary::NotEqual => lhs.not_equals(rhs),
            Binary::Greater => lhs.compare_with(rhs, |o| o.is_gt()),
            Binary::Lesser => lhs.compare_with(rhs, |o| o.is_lt()),
            Binary::GreaterEqual => lhs.compare_with(rhs, |o| o.is_ge()),
            Binary::LesserEqual => lhs.compare_with(rhs, |o| o.is_le()),
            Binary::ContainsString | Binary::ContainsStringStrict => {
                match (lhs.string_value(), rhs.string_value()) {
                    (Some(haystack), Some(needle)) => {
                        if *self == Binary::ContainsString {
                            Value::Bool(haystack.to_lowercase().contains(&needle.to_lowercase()))
                        } else {
                            Value::Bool(haystack.contains(&needle))
                        }
                    }
                    _ => Value::Invalid,
                }
            }
            Binary::MatchesRegex | Binary::MatchesRegexStrict => {
                let (Some(haystack), Some(pattern)) = (lhs.string_value(), rhs.string_value())
                else {
                    return Value::Invalid;
                };
                match RegexBuilder::new(&pattern)
                    .case_insensitive(*self == Binary::MatchesRegex)
                    .build()
                {
                    Ok(re) => Value::Bool(re.is_match(&haystack)),
                    Err(_) => Value::Invalid,
                }
            }
        }
    }

    /// If the result is always a boolean or `Invalid`.
    pub fn is_predicate(&self) -> bool {
        matches!(
            self,
            Binary::Equal
                | Binary::NotEqual
                | Binary::Greater
                | Binary::Lesser
                | Binary::GreaterEqual
                | Binary::LesserEqual
                | Binary::ContainsString
                | Binary::ContainsStringStrict
                | Binary::MatchesRegex
                | Binary::MatchesRegexStrict
        )
    }

    /// If `a op b == b op a` for every input.
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Binary::Addition | Binary::Multiplication | Binary::Equal | Binary::NotEqual
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Binary::Addition => "+",
            Binary::Subtraction => "-",
            Binary::Multiplication => "*",
            Binary::Division => "/",
            Binary::Modulus => "%",
            Binary::Concatenation => "&",
            Binary::Equal => "=",
            Binary::NotEqual => "<>",
            Binary::Greater => ">",
            Binary::Lesser => "<",
            Binary::GreaterEqual => ">=",
            Binary::LesserEqual => "<=",
            Binary::ContainsString => "~=",
            Binary::ContainsStringStrict => "~~=",
            Binary::MatchesRegex => "±=",
            Binary::MatchesRegexStrict => "±±=",
        }
    }
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Value),
    /// The input value, for expressions applied to a single value.
    Identity,
    /// Column of the row being evaluated.
    Sibling(Column),
    /// Column of the foreign row when evaluating a join condition.
    Foreign(Column),
    Call {
        function: Function,
        args: Vec<Expression>,
    },
    Binary {
        op: Binary,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn sibling(column: impl Into<Column>) -> Self {
        Expression::Sibling(column.into())
    }

    pub fn foreign(column: impl Into<Column>) -> Self {
        Expression::Foreign(column.into())
    }

    pub fn call(function: Function, args: Vec<Expression>) -> Self {
        Expression::Call { function, args }
    }

    pub fn binary(op: Binary, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Conjunction of all expressions, flattening nested ANDs.
    pub fn and(exprs: impl IntoIterator<Item = Expression>) -> Self {
        let mut args = Vec::new();
        for expr in exprs {
            match expr {
                Expression::Call {
                    function: Function::And,
                    args: inner,
                } => args.extend(inner),
                other => args.push(other),
            }
        }
        Expression::call(Function::And, args)
    }

    /// If evaluating always yields a boolean or `Invalid`, whatever the row.
    pub fn is_predicate(&self) -> bool {
        match self {
            Expression::Literal(v) => matches!(v, Value::Bool(_) | Value::Invalid),
            Expression::Binary { op, .. } => op.is_predicate(),
            Expression::Call { function, .. } => matches!(
                function,
                Function::Not
                    | Function::And
                    | Function::Or
                    | Function::Xor
                    | Function::In
                    | Function::NotIn
            ),
            Expression::Identity | Expression::Sibling(_) | Expression::Foreign(_) => false,
        }
    }

    pub fn apply(&self, row: &Row, foreign: Option<&Row>, input: Option<&Value>) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::Identity => input.cloned().unwrap_or(Value::Invalid),
            Expression::Sibling(col) => row.value(col).cloned().unwrap_or(Value::Invalid),
            Expression::Foreign(col) => foreign
                .and_then(|f| f.value(col))
                .cloned()
                .unwrap_or(Value::Invalid),
            Expression::Call { function, args } => {
                let values: Vec<Value> =
                    args.iter().map(|a| a.apply(row, foreign, input)).collect();
                function.apply(&values)
            }
            Expression::Binary { op, lhs, rhs } => {
                let l = lhs.apply(row, foreign, input);
                let r = rhs.apply(row, foreign, input);
                op.apply(&l, &r)
            }
        }
    }

    /// Evaluate an expression that doesn't reference any row.
    pub fn apply_constant(&self) -> Value {
        self.apply(&Row::empty(), None, None)
    }

    /// Whether this expression evaluates to the same value for any row.
    pub fn is_constant(&self) -> bool {
        match self {
            Expression::Literal(_) => true,
            Expression::Identity | Expression::Sibling(_) | Expression::Foreign(_) => false,
            Expression::Call { function, args } => {
                function.is_deterministic() && args.iter().all(|a| a.is_constant())
            }
            Expression::Binary { lhs, rhs, .. } => lhs.is_constant() && rhs.is_constant(),
        }
    }

    /// Fold constant sub expressions into literals.
    pub fn prepare(&self) -> Expression {
        if self.is_constant() {
            return Expression::Literal(self.apply_constant());
        }
        match self {
            Expression::Call { function, args } => Expression::Call {
                function: *function,
                args: args.iter().map(|a| a.prepare()).collect(),
            },
            Expression::Binary { op, lhs, rhs } => {
                Expression::binary(*op, lhs.prepare(), rhs.prepare())
            }
            other => other.clone(),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        match self {
            Expression::Call { function, args } => {
                function.is_deterministic() && args.iter().all(|a| a.is_deterministic())
            }
            Expression::Binary { lhs, rhs, .. } => lhs.is_deterministic() && rhs.is_deterministic(),
            _ => true,
        }
    }

    /// All sibling columns referenced by this expression.
    pub fn siblings(&self) -> HashSet<Column> {
        let mut out = HashSet::new();
        self.visit(&mut |e| {
            if let Expression::Sibling(c) = e {
                out.insert(c.clone());
            }
        });
        out
    }

    pub fn references_foreign(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expression::Foreign(_)) {
                found = true;
            }
        });
        found
    }

    fn visit(&self, f: &mut impl FnMut(&Expression)) {
        f(self);
        match self {
            Expression::Call { args, .. } => args.iter().for_each(|a| a.visit(f)),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            _ => (),
        }
    }

    /// If this is `column = literal` (in either order), the column and value.
    pub fn column_equals_literal(&self) -> Option<(&Column, &Value)> {
        match self {
            Expression::Binary {
                op: Binary::Equal,
                lhs,
                rhs,
            } => match (lhs.as_ref(), rhs.as_ref()) {
                (Expression::Sibling(c), Expression::Literal(v))
                | (Expression::Literal(v), Expression::Sibling(c)) => Some((c, v)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(Value::String(s)) => write!(f, "\"{s}\""),
            Expression::Literal(v) => write!(f, "{v}"),
            Expression::Identity => write!(f, "@"),
            Expression::Sibling(c) => write!(f, "[@{c}]"),
            Expression::Foreign(c) => write!(f, "[#{c}]"),
            Expression::Call { function, args } => {
                write!(f, "{function}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expression::Binary { op, lhs, rhs } => write!(f, "({lhs}{}{rhs})", op.symbol()),
        }
    }
}
