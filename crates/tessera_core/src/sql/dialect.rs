//! Translation of expressions into SQL.
//!
//! Translation is all or nothing: when any part of an expression has no SQL
//! equivalent the whole expression is untranslatable and the caller falls
//! back to evaluating it in memory.

use std::fmt;

use crate::column::Column;
use crate::dataset::Aggregator;
use crate::expr::{Binary, Expression, Function};
use crate::value::Value;

pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn identifier_qualifier(&self) -> &'static str {
        "\""
    }

    fn identifier_qualifier_escape(&self) -> &'static str {
        "\"\""
    }

    fn string_qualifier(&self) -> &'static str {
        "'"
    }

    fn string_qualifier_escape(&self) -> &'static str {
        "''"
    }

    fn quote_identifier(&self, name: &str) -> String {
        let q = self.identifier_qualifier();
        format!(
            "{q}{}{q}",
            name.replace(q, self.identifier_qualifier_escape())
        )
    }

    fn column_identifier(&self, column: &Column, table: Option<&str>) -> String {
        match table {
            Some(table) => format!(
                "{}.{}",
                self.quote_identifier(table),
                self.quote_identifier(column.name())
            ),
            None => self.quote_identifier(column.name()),
        }
    }

    fn table_identifier(&self, table: &str) -> String {
        self.quote_identifier(table)
    }

    fn quote_string(&self, s: &str) -> String {
        let q = self.string_qualifier();
        format!("{q}{}{q}", s.replace(q, self.string_qualifier_escape()))
    }

    fn value_to_sql(&self, value: &Value) -> Option<String> {
        match value {
            Value::Int(v) => Some(v.to_string()),
            Value::Double(v) | Value::Date(v) if v.is_finite() => value.string_value(),
            Value::Double(_) | Value::Date(_) => None,
            Value::String(s) => Some(self.quote_string(s)),
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Empty => Some("NULL".to_string()),
            Value::Invalid => None,
        }
    }

    fn force_numeric_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS NUMERIC)")
    }

    fn force_string_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS VARCHAR)")
    }

    /// Translate an expression. Column references are qualified with
    /// `alias` when given.
    fn expression_to_sql(&self, expr: &Expression, alias: Option<&str>) -> Option<String> {
        match expr {
            Expression::Literal(value) => self.value_to_sql(value),
            Expression::Sibling(column) => Some(self.column_identifier(column, alias)),
            Expression::Identity | Expression::Foreign(_) => None,
            Expression::Call { function, args } => {
                if !function.arity().accepts(args.len()) {
                    return None;
                }
                let args = args
                    .iter()
                    .map(|a| self.expression_to_sql(a, alias))
                    .collect::<Option<Vec<_>>>()?;
                self.unary_to_sql(*function, &args)
            }
            Expression::Binary { op, lhs, rhs } => {
                let lhs = self.expression_to_sql(lhs, alias)?;
                let rhs = self.expression_to_sql(rhs, alias)?;
                self.binary_to_sql(*op, &lhs, &rhs)
            }
        }
    }

    fn concat_to_sql(&self, parts: &[String]) -> String {
        format!("({})", parts.join(" || "))
    }

    fn unary_to_sql(&self, function: Function, args: &[String]) -> Option<String> {
        let value = args.first();
        let sql = match function {
            Function::Identity => value?.clone(),
            Function::Negate => format!("-({})", value?),
            Function::Not => format!("NOT({})", value?),
            Function::And if args.is_empty() => "(1=1)".to_string(),
            Function::And => format!("({})", args.join(" AND ")),
            Function::Or if args.is_empty() => "(1=0)".to_string(),
            Function::Or => format!("({})", args.join(" OR ")),
            Function::Xor => format!("(({}) <> ({}))", args.first()?, args.get(1)?),
            Function::If => format!(
                "(CASE WHEN {} THEN {} ELSE {} END)",
                args.first()?,
                args.get(1)?,
                args.get(2)?
            ),
            Function::Coalesce => format!("COALESCE({})", args.join(", ")),
            Function::Uppercase => format!("UPPER({})", value?),
            Function::Lowercase => format!("LOWER({})", value?),
            Function::Trim => format!("TRIM({})", value?),
            Function::Length => format!("LENGTH({})", value?),
            Function::Concat => self.concat_to_sql(args),
            Function::Left => format!("SUBSTR({}, 1, {})", value?, args.get(1)?),
            Function::Absolute => format!("ABS({})", value?),
            Function::Round => match args.get(1) {
                Some(decimals) => format!("ROUND({}, {decimals})", value?),
                None => format!("ROUND({})", value?),
            },
            Function::Floor => format!("FLOOR({})", value?),
            Function::Ceiling => format!("CEIL({})", value?),
            Function::Sqrt => format!("SQRT({})", value?),
            Function::Sign => format!("SIGN({})", value?),
            Function::Sum if args.is_empty() => "0".to_string(),
            Function::Sum => format!("({})", args.join(" + ")),
            Function::Min => format!("LEAST({})", args.join(", ")),
            Function::Max => format!("GREATEST({})", args.join(", ")),
            Function::Average => format!("(({}) / {})", args.join(" + "), args.len()),
            Function::In | Function::NotIn if args.len() < 2 => return None,
            Function::In => format!("({} IN ({}))", value?, args[1..].join(", ")),
            Function::NotIn => format!("({} NOT IN ({}))", value?, args[1..].join(", ")),
            Function::Random => "RANDOM()".to_string(),
            Function::IfError | Function::Right | Function::Count | Function::CountAll => {
                return None;
            }
        };
        Some(sql)
    }

    fn binary_to_sql(&self, op: Binary, lhs: &str, rhs: &str) -> Option<String> {
        let sql = match op {
            Binary::Addition => format!("({lhs} + {rhs})"),
            Binary::Subtraction => format!("({lhs} - {rhs})"),
            Binary::Multiplication => format!("({lhs} * {rhs})"),
            Binary::Division => format!("({lhs} / {rhs})"),
            Binary::Modulus => format!("MOD({lhs}, {rhs})"),
            Binary::Concatenation => self.concat_to_sql(&[lhs.to_string(), rhs.to_string()]),
            Binary::Equal => format!("({lhs} = {rhs})"),
            Binary::NotEqual => format!("({lhs} <> {rhs})"),
            Binary::Greater => format!("({lhs} > {rhs})"),
            Binary::Lesser => format!("({lhs} < {rhs})"),
            Binary::GreaterEqual => format!("({lhs} >= {rhs})"),
            Binary::LesserEqual => format!("({lhs} <= {rhs})"),
            Binary::ContainsString => format!("(POSITION(LOWER({rhs}) IN LOWER({lhs})) > 0)"),
            Binary::ContainsStringStrict => format!("(POSITION({rhs} IN {lhs}) > 0)"),
            Binary::MatchesRegex | Binary::MatchesRegexStrict => return None,
        };
        Some(sql)
    }

    fn aggregation_to_sql(&self, aggregator: &Aggregator, alias: Option<&str>) -> Option<String> {
        let expr = self.expression_to_sql(&aggregator.map, alias)?;
        let sql = match aggregator.reduce {
            Function::Sum => format!("SUM({expr})"),
            Function::Min => format!("MIN({expr})"),
            Function::Max => format!("MAX({expr})"),
            Function::Average => format!("AVG({expr})"),
            Function::CountAll => "COUNT(*)".to_string(),
            _ => return None,
        };
        Some(sql)
    }

    /// Clause placed after a table reference to force lookups through an
    /// index, None when the dialect has no such hint.
    fn index_hint(&self, _index: &str) -> Option<String> {
        None
    }

    fn limit_offset_to_sql(&self, limit: Option<usize>, offset: Option<usize>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(l), None) => Some(format!("LIMIT {l}")),
            (Some(l), Some(o)) => Some(format!("LIMIT {l} OFFSET {o}")),
            (None, Some(o)) => Some(format!("OFFSET {o}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDialect;

impl SqlDialect for StandardDialect {}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn identifier_qualifier(&self) -> &'static str {
        "`"
    }

    fn identifier_qualifier_escape(&self) -> &'static str {
        "\\`"
    }

    fn string_qualifier_escape(&self) -> &'static str {
        "\\'"
    }

    fn force_numeric_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS DECIMAL)")
    }

    fn force_string_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS BINARY)")
    }

    fn concat_to_sql(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn unary_to_sql(&self, function: Function, args: &[String]) -> Option<String> {
        match function {
            Function::Random => Some("RAND()".to_string()),
            Function::Right => Some(format!("RIGHT({}, {})", args.first()?, args.get(1)?)),
            Function::Concat => Some(self.concat_to_sql(args)),
            _ => StandardDialect.unary_to_sql(function, args),
        }
    }

    fn binary_to_sql(&self, op: Binary, lhs: &str, rhs: &str) -> Option<String> {
        match op {
            Binary::Modulus => Some(format!("({lhs} % {rhs})")),
            Binary::Concatenation => Some(self.concat_to_sql(&[lhs.to_string(), rhs.to_string()])),
            Binary::MatchesRegex => Some(format!("({lhs} REGEXP {rhs})")),
            Binary::MatchesRegexStrict => Some(format!(
                "({} REGEXP {rhs})",
                self.force_string_expression(lhs)
            )),
            Binary::ContainsStringStrict => Some(format!(
                "(LOCATE({rhs}, {}) > 0)",
                self.force_string_expression(lhs)
            )),
            _ => StandardDialect.binary_to_sql(op, lhs, rhs),
        }
    }

    fn aggregation_to_sql(&self, aggregator: &Aggregator, alias: Option<&str>) -> Option<String> {
        match aggregator.reduce {
            // COUNT counts everything that is not NULL, only numbers count here.
            Function::Count => {
                let expr = self.expression_to_sql(&aggregator.map, alias)?;
                Some(format!(
                    "SUM(CASE WHEN {expr} REGEXP '^[[:digit:]]+$' THEN 1 ELSE 0 END)"
                ))
            }
            _ => StandardDialect.aggregation_to_sql(aggregator, alias),
        }
    }

    fn limit_offset_to_sql(&self, limit: Option<usize>, offset: Option<usize>) -> Option<String> {
        match (limit, offset) {
            (None, Some(o)) => Some(format!("LIMIT 18446744073709551615 OFFSET {o}")),
            _ => StandardDialect.limit_offset_to_sql(limit, offset),
        }
    }
}
