//! Textual operation steps.
//!
//! Each step is `name` or `name:argument`:
//!
//! - `limit:N`, `offset:N`, `random:N`
//! - `distinct`, `transpose`
//! - `select:a,b,c`
//! - `sort:a,-b` sorts numerically, `-` for descending
//! - `where:column=value` keeps rows where the column equals the value
//! - `filter:EXPR` and `calc:column=EXPR` take JSON encoded expressions
//! - `count-by:column` counts rows per value of the column

use tessera_core::column::Column;
use tessera_core::dataset::{Aggregation, Aggregator, Operation, Order};
use tessera_core::expr::{Binary, Expression, Function};
use tessera_core::value::Value;
use tessera_error::{EngineError, Result, ResultExt};

pub fn parse_step(step: &str) -> Result<Operation> {
    let (name, arg) = match step.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (step, None),
    };
    let required = || {
        arg.ok_or_else(|| EngineError::new("Step requires an argument").with_field("step", step))
    };

    let operation = match name {
        "limit" => Operation::Limit(parse_count(required()?, step)?),
        "offset" => Operation::Offset(parse_count(required()?, step)?),
        "random" => Operation::Random(parse_count(required()?, step)?),
        "distinct" => Operation::Distinct,
        "transpose" => Operation::Transpose,
        "select" => Operation::SelectColumns(split_columns(required()?)),
        "sort" => Operation::Sort(
            required()?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|key| match key.strip_prefix('-') {
                    Some(column) => Order::descending(column),
                    None => Order::ascending(key.trim_start_matches('+')),
                })
                .collect(),
        ),
        "where" => {
            let (column, value) = split_assignment(required()?, step)?;
            Operation::Filter(Expression::binary(
                Binary::Equal,
                Expression::sibling(column),
                Expression::Literal(parse_literal(value)),
            ))
        }
        "filter" => Operation::Filter(parse_expression(required()?)?),
        "calc" => {
            let (column, expr) = split_assignment(required()?, step)?;
            Operation::Calculate(vec![(Column::new(column), parse_expression(expr)?)])
        }
        "count-by" => {
            let column = Column::new(required()?);
            Operation::Aggregate(Aggregation {
                groups: vec![(column.clone(), Expression::Sibling(column.clone()))],
                values: vec![(
                    Column::new("count"),
                    Aggregator {
                        map: Expression::Sibling(column),
                        reduce: Function::CountAll,
                    },
                )],
            })
        }
        other => {
            return Err(EngineError::new("Unknown step").with_field("step", other));
        }
    };
    Ok(operation)
}

fn parse_count(arg: &str, step: &str) -> Result<usize> {
    arg.trim()
        .parse()
        .context_fn(|| format!("Invalid row count in step '{step}'"))
}

fn split_columns(arg: &str) -> Vec<Column> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Column::new)
        .collect()
}

fn split_assignment<'a>(arg: &'a str, step: &str) -> Result<(&'a str, &'a str)> {
    arg.split_once('=')
        .ok_or_else(|| EngineError::new("Expected 'column=value'").with_field("step", step))
}

fn parse_expression(json: &str) -> Result<Expression> {
    serde_json::from_str(json).context("Invalid expression")
}

/// Integers, then decimals, then booleans, anything else is a string.
pub fn parse_literal(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(d) = s.parse::<f64>() {
        if d.is_finite() {
            return Value::Double(d);
        }
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_steps() {
        assert!(matches!(parse_step("limit:5").unwrap(), Operation::Limit(5)));
        assert!(matches!(parse_step("offset: 2").unwrap(), Operation::Offset(2)));
        assert!(matches!(parse_step("distinct").unwrap(), Operation::Distinct));
        assert!(parse_step("limit").is_err());
        assert!(parse_step("limit:x").is_err());
        assert!(parse_step("explode").is_err());
    }

    #[test]
    fn sort_and_select() {
        match parse_step("sort:a,-b").unwrap() {
            Operation::Sort(orders) => {
                assert_eq!(vec![Order::ascending("a"), Order::descending("b")], orders);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_step("select:a, b").unwrap() {
            Operation::SelectColumns(columns) => {
                assert_eq!(tessera_core::column::columns(&["a", "b"]), columns);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn where_shorthand() {
        match parse_step("where:city=Delft").unwrap() {
            Operation::Filter(expr) => assert_eq!(
                Expression::binary(
                    Binary::Equal,
                    Expression::sibling("city"),
                    Expression::literal("Delft")
                ),
                expr
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn json_expressions() {
        let expr = Expression::binary(Binary::Greater, Expression::sibling("a"), Expression::literal(4));
        let json = serde_json::to_string(&expr).unwrap();
        match parse_step(&format!("filter:{json}")).unwrap() {
            Operation::Filter(parsed) => assert_eq!(expr, parsed),
            other => panic!("unexpected {other:?}"),
        }
        match parse_step(&format!("calc:d={json}")).unwrap() {
            Operation::Calculate(calcs) => assert_eq!(Column::new("d"), calcs[0].0),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_step("filter:{not json").is_err());
    }

    #[test]
    fn literals() {
        assert_eq!(Value::Int(3), parse_literal("3"));
        assert_eq!(Value::Double(2.5), parse_literal("2.5"));
        assert_eq!(Value::Bool(true), parse_literal("true"));
        assert_eq!(Value::from("x"), parse_literal("x"));
    }
}
