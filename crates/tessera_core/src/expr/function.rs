use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Functions that can be called from an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    Identity,
    Negate,
    Not,
    And,
    Or,
    Xor,
    If,
    IfError,
    Coalesce,
    Uppercase,
    Lowercase,
    Trim,
    Length,
    Concat,
    Left,
    Right,
    Absolute,
    Round,
    Floor,
    Ceiling,
    Sqrt,
    Sign,
    Sum,
    /// Number of numeric values.
    Count,
    /// Number of values, whatever they are.
    CountAll,
    Min,
    Max,
    Average,
    In,
    NotIn,
    Random,
}

/// Accepted number of arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Between(usize, usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Fixed(f) => n == f,
            Arity::Between(lo, hi) => n >= lo && n <= hi,
            Arity::AtLeast(lo) => n >= lo,
            Arity::Any => true,
        }
    }
}

impl Function {
    pub const ALL: &'static [Function] = &[
        Function::Identity,
        Function::Negate,
        Function::Not,
        Function::And,
        Function::Or,
        Function::Xor,
        Function::If,
        Function::IfError,
        Function::Coalesce,
        Function::Uppercase,
        Function::Lowercase,
        Function::Trim,
        Function::Length,
        Function::Concat,
        Function::Left,
        Function::Right,
        Function::Absolute,
        Function::Round,
        Function::Floor,
        Function::Ceiling,
        Function::Sqrt,
        Function::Sign,
        Function::Sum,
        Function::Count,
        Function::CountAll,
        Function::Min,
        Function::Max,
        Function::Average,
        Function::In,
        Function::NotIn,
        Function::Random,
    ];

    pub fn arity(&self) -> Arity {
        match self {
            Function::Identity
            | Function::Negate
            | Function::Not
            | Function::Uppercase
            | Function::Lowercase
            | Function::Trim
            | Function::Length
            | Function::Absolute
            | Function::Floor
            | Function::Ceiling
            | Function::Sqrt
            | Function::Sign => Arity::Fixed(1),
            Function::Xor | Function::IfError | Function::Left | Function::Right => Arity::Fixed(2),
            Function::If => Arity::Fixed(3),
            Function::Round => Arity::Between(1, 2),
            Function::In | Function::NotIn => Arity::AtLeast(1),
            Function::Random => Arity::Fixed(0),
            Function::And
            | Function::Or
            | Function::Coalesce
            | Function::Concat
            | Function::Sum
            | Function::Count
            | Function::CountAll
            | Function::Min
            | Function::Max
            | Function::Average => Arity::Any,
        }
    }

    /// Whether calling with the same arguments always gives the same result.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, Function::Random)
    }

    /// Functions usable to reduce a group of values in an aggregation.
    pub fn is_reducer(&self) -> bool {
        matches!(
            self,
            Function::Sum
                | Function::Count
                | Function::CountAll
                | Function::Min
                | Function::Max
                | Function::Average
                | Function::Concat
        )
    }

    pub fn apply(&self, args: &[Value]) -> Value {
        if !self.arity().accepts(args.len()) {
            return Value::Invalid;
        }

        match self {
            Function::Identity => args[0].clone(),
            Function::Negate => args[0].negate(),
            Function::Not => match args[0].bool_value() {
                Some(b) if args[0].is_valid() => Value::Bool(!b),
                _ => Value::Invalid,
            },
            Function::And => fold_bools(args, true, |a, b| a && b),
            Function::Or => fold_bools(args, false, |a, b| a || b),
            Function::Xor => match (args[0].bool_value(), args[1].bool_value()) {
                (Some(a), Some(b)) => Value::Bool(a ^ b),
                _ => Value::Invalid,
            },
            Function::If => match args[0].bool_value() {
                Some(true) => args[1].clone(),
                Some(false) => args[2].clone(),
                None => Value::Invalid,
            },
            Function::IfError => {
                if args[0].is_valid() {
                    args[0].clone()
                } else {
                    args[1].clone()
                }
            }
            Function::Coalesce => args
                .iter()
                .find(|v| v.is_valid() && !v.is_empty())
                .cloned()
                .unwrap_or(Value::Empty),
            Function::Uppercase => map_string(&args[0], |s| s.to_uppercase()),
            Function::Lowercase => map_string(&args[0], |s| s.to_lowercase()),
            Function::Trim => map_string(&args[0], |s| s.trim().to_string()),
            Function::Length => match args[0].string_value() {
                Some(s) => Value::from(s.chars().count()),
                None => Value::Invalid,
            },
            Function::Concat => {
                let mut out = String::new();
                for arg in args {
                    match arg {
                        Value::Empty => (),
                        Value::Invalid => return Value::Invalid,
                        other => out.push_str(&other.string_value().unwrap_or_default()),
                    }
                }
                Value::String(out)
            }
            Function::Left | Function::Right => {
                let (Some(s), Some(n)) = (args[0].string_value(), args[1].int_value()) else {
                    return Value::Invalid;
                };
                let chars: Vec<char> = s.chars().collect();
                let Ok(n) = usize::try_from(n) else {
                    return Value::Invalid;
                };
                if n > chars.len() {
                    return Value::Invalid;
                }
                let taken: String = if *self == Function::Left {
                    chars[..n].iter().collect()
                } else {
                    chars[chars.len() - n..].iter().collect()
                };
                Value::String(taken)
            }
            Function::Absolute => match &args[0] {
                Value::Int(v) => v.checked_abs().map(Value::Int).unwrap_or(Value::Invalid),
                other => map_double(other, f64::abs),
            },
            Function::Round => {
                let decimals = match args.get(1) {
                    Some(d) => match d.int_value() {
                        Some(d) => d,
                        None => return Value::Invalid,
                    },
                    None => 0,
                };
                let Some(v) = args[0].double_value() else {
                    return Value::Invalid;
                };
                if decimals <= 0 {
                    return double_to_int_value(v.round());
                }
                let factor = 10f64.powi(decimals.min(15) as i32);
                Value::Double((v * factor).round() / factor)
            }
            Function::Floor => match args[0].double_value() {
                Some(v) => double_to_int_value(v.floor()),
                None => Value::Invalid,
            },
            Function::Ceiling => match args[0].double_value() {
                Some(v) => double_to_int_value(v.ceil()),
                None => Value::Invalid,
            },
            Function::Sqrt => match args[0].double_value() {
                Some(v) if v >= 0.0 => Value::Double(v.sqrt()),
                _ => Value::Invalid,
            },
            Function::Sign => match args[0].double_value() {
                Some(v) if v > 0.0 => Value::Int(1),
                Some(v) if v < 0.0 => Value::Int(-1),
                Some(_) => Value::Int(0),
                None => Value::Invalid,
            },
            Function::Sum => {
                let mut total = Value::Int(0);
                for arg in args.iter().filter(|v| !v.is_empty()) {
                    total = total.add(arg);
                    if !total.is_valid() {
                        break;
                    }
                }
                total
            }
            Function::Count => Value::from(
                args.iter()
                    .filter(|v| v.is_valid() && !v.is_empty() && v.double_value().is_some())
                    .count(),
            ),
            Function::CountAll => Value::from(args.len()),
            Function::Min | Function::Max => {
                let mut best: Option<f64> = None;
                for arg in args.iter().filter(|v| !v.is_empty()) {
                    let Some(v) = arg.double_value() else {
                        return Value::Invalid;
                    };
                    best = Some(match best {
                        None => v,
                        Some(b) if *self == Function::Min => b.min(v),
                        Some(b) => b.max(v),
                    });
                }
                match best {
                    Some(v) if v.fract() == 0.0 => double_to_int_value(v),
                    Some(v) => Value::Double(v),
                    None => Value::Invalid,
                }
            }
            Function::Average => {
                let mut sum = 0.0;
                let mut n = 0usize;
                for arg in args.iter().filter(|v| !v.is_empty()) {
                    let Some(v) = arg.double_value() else {
                        return Value::Invalid;
                    };
                    sum += v;
                    n += 1;
                }
                if n == 0 {
                    Value::Invalid
                } else {
                    Value::Double(sum / n as f64)
                }
            }
            Function::In | Function::NotIn => {
                let needle = &args[0];
                if !needle.is_valid() {
                    return Value::Invalid;
                }
                let found = args[1..].iter().any(|v| v == needle);
                Value::Bool(found == (*self == Function::In))
            }
            Function::Random => Value::Double(rand::rng().random::<f64>()),
        }
    }
}

fn fold_bools(args: &[Value], init: bool, f: fn(bool, bool) -> bool) -> Value {
    let mut acc = init;
    for arg in args {
        if !arg.is_valid() {
            return Value::Invalid;
        }
        match arg.bool_value() {
            Some(b) => acc = f(acc, b),
            None => return Value::Invalid,
        }
    }
    Value::Bool(acc)
}

fn map_string(value: &Value, f: impl FnOnce(&str) -> String) -> Value {
    match value.string_value() {
        Some(s) => Value::String(f(&s)),
        None => Value::Invalid,
    }
}

fn map_double(value: &Value, f: impl FnOnce(f64) -> f64) -> Value {
    match value.double_value() {
        Some(v) => Value::Double(f(v)),
        None => Value::Invalid,
    }
}

fn double_to_int_value(v: f64) -> Value {
    match Value::Double(v).int_value() {
        Some(i) if i as f64 == v => Value::Int(i),
        _ => Value::Double(v),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
