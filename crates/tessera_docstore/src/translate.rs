//! Translation of expressions into document store terms.
//!
//! Like SQL translation this is all or nothing.

use tessera_core::expr::Expression;

use crate::document::value_to_json;
use crate::term::ValueTerm;

/// Term computing `expr` for a document. None when any part refers to
/// something documents can't express: the input value, a foreign row, or a
/// literal without a JSON form.
pub fn expression_to_term(expr: &Expression) -> Option<ValueTerm> {
    match expr {
        Expression::Literal(value) => value_to_json(value).map(ValueTerm::datum),
        Expression::Sibling(column) => Some(ValueTerm::field(column.name())),
        Expression::Identity | Expression::Foreign(_) => None,
        Expression::Call { function, args } => {
            if !function.arity().accepts(args.len()) {
                return None;
            }
            let args = args
                .iter()
                .map(expression_to_term)
                .collect::<Option<Vec<_>>>()?;
            Some(ValueTerm::Call {
                function: *function,
                args,
            })
        }
        Expression::Binary { op, lhs, rhs } => Some(ValueTerm::binary(
            *op,
            expression_to_term(lhs)?,
            expression_to_term(rhs)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_core::column::Column;
    use tessera_core::expr::{Binary, Function};
    use tessera_core::value::Value;

    use super::*;

    #[test]
    fn translates_comparisons() {
        let expr = Expression::binary(
            Binary::Greater,
            Expression::sibling("age"),
            Expression::literal(30),
        );
        assert_eq!(
            Some(ValueTerm::binary(
                Binary::Greater,
                ValueTerm::field("age"),
                ValueTerm::datum(json!(30))
            )),
            expression_to_term(&expr)
        );
    }

    #[test]
    fn untranslatable_parts_fail_whole() {
        let expr = Expression::and([
            Expression::binary(Binary::Equal, Expression::sibling("a"), Expression::literal(1)),
            Expression::binary(
                Binary::Equal,
                Expression::sibling("b"),
                Expression::Foreign(Column::new("b")),
            ),
        ]);
        assert_eq!(None, expression_to_term(&expr));

        assert_eq!(None, expression_to_term(&Expression::literal(Value::Invalid)));

        let bad_arity = Expression::call(Function::Negate, vec![]);
        assert_eq!(None, expression_to_term(&bad_arity));
    }
}
