use tessera_core::dataset::Aggregator;
use tessera_core::expr::{Binary, Function};
use tessera_core::sql::{SqlDialect, StandardDialect};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn force_numeric_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS REAL)")
    }

    fn force_string_expression(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    fn unary_to_sql(&self, function: Function, args: &[String]) -> Option<String> {
        let value = args.first();
        let sql = match function {
            // Not available without the math extension.
            Function::Floor | Function::Ceiling | Function::Sqrt => return None,
            Function::Sign => format!(
                "(CASE WHEN {v} > 0 THEN 1 WHEN {v} < 0 THEN -1 ELSE 0 END)",
                v = value?
            ),
            // The single argument forms are aggregates in SQLite.
            Function::Min | Function::Max if args.len() == 1 => value?.clone(),
            Function::Min => format!("MIN({})", args.join(", ")),
            Function::Max => format!("MAX({})", args.join(", ")),
            Function::Average => format!("(({}) / {}.0)", args.join(" + "), args.len()),
            _ => return StandardDialect.unary_to_sql(function, args),
        };
        Some(sql)
    }

    fn binary_to_sql(&self, op: Binary, lhs: &str, rhs: &str) -> Option<String> {
        let sql = match op {
            Binary::Modulus => format!("({lhs} % {rhs})"),
            // Integer division truncates in SQLite.
            Binary::Division => format!("(({lhs} * 1.0) / {rhs})"),
            Binary::ContainsString => format!("(INSTR(LOWER({lhs}), LOWER({rhs})) > 0)"),
            Binary::ContainsStringStrict => format!("(INSTR({lhs}, {rhs}) > 0)"),
            _ => return StandardDialect.binary_to_sql(op, lhs, rhs),
        };
        Some(sql)
    }

    fn aggregation_to_sql(&self, aggregator: &Aggregator, alias: Option<&str>) -> Option<String> {
        match aggregator.reduce {
            Function::Count => {
                let expr = self.expression_to_sql(&aggregator.map, alias)?;
                Some(format!(
                    "SUM(CASE WHEN typeof({expr}) IN ('integer', 'real') THEN 1 ELSE 0 END)"
                ))
            }
            _ => StandardDialect.aggregation_to_sql(aggregator, alias),
        }
    }

    fn index_hint(&self, index: &str) -> Option<String> {
        Some(format!("INDEXED BY {}", self.quote_identifier(index)))
    }

    fn limit_offset_to_sql(&self, limit: Option<usize>, offset: Option<usize>) -> Option<String> {
        match (limit, offset) {
            (None, Some(o)) => Some(format!("LIMIT -1 OFFSET {o}")),
            _ => StandardDialect.limit_offset_to_sql(limit, offset),
        }
    }
}
