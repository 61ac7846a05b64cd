//! Merging of adjacent operations.
//!
//! A coalesced dataset keeps the most recent operation pending instead of
//! applying it right away. When another operation arrives the two are merged
//! if a law allows it, otherwise the pending one is applied to the wrapped
//! dataset first.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::trace;

use super::{Dataset, DatasetRef, Operation, PushDown, apply_operation};
use crate::column::Column;
use crate::config::EngineConfig;
use crate::expr::Expression;
use crate::runtime::job::Job;
use crate::sql::SqlDataset;
use crate::stream::{ColumnsCallback, RasterCallback, StreamRef};

pub struct CoalescedDataset {
    source: DatasetRef,
    pending: Option<Operation>,
    config: Arc<EngineConfig>,
    resolved: OnceLock<DatasetRef>,
}

impl CoalescedDataset {
    pub fn new(source: DatasetRef, config: Arc<EngineConfig>) -> Self {
        Self::with_pending(source, None, config)
    }

    fn with_pending(
        source: DatasetRef,
        pending: Option<Operation>,
        config: Arc<EngineConfig>,
    ) -> Self {
        CoalescedDataset {
            source,
            pending,
            config,
            resolved: OnceLock::new(),
        }
    }

    pub fn pending(&self) -> Option<&Operation> {
        self.pending.as_ref()
    }

    /// Add an operation, merging it with the pending one when possible.
    pub fn push(&self, operation: &Operation) -> CoalescedDataset {
        let pending = match &self.pending {
            Some(pending) => pending,
            None => {
                return CoalescedDataset::with_pending(
                    self.source.clone(),
                    Some(operation.clone()),
                    self.config.clone(),
                );
            }
        };

        match merge(pending, operation) {
            Some(merged) => {
                trace!(
                    pending = pending.name(),
                    next = operation.name(),
                    "coalesced operations"
                );
                CoalescedDataset::with_pending(self.source.clone(), merged, self.config.clone())
            }
            None => CoalescedDataset::with_pending(
                self.resolved().clone(),
                Some(operation.clone()),
                self.config.clone(),
            ),
        }
    }

    /// The wrapped dataset with the pending operation applied.
    fn resolved(&self) -> &DatasetRef {
        self.resolved.get_or_init(|| match &self.pending {
            Some(op) => apply_operation(&self.source, op.clone(), &self.config),
            None => self.source.clone(),
        })
    }
}

/// Merge `next` into `pending`.
///
/// Returns `Some(merged)` when the pair is equivalent to a single operation,
/// where `merged` being None means the pair cancels out.
pub fn merge(pending: &Operation, next: &Operation) -> Option<Option<Operation>> {
    let merged = match (pending, next) {
        (Operation::Limit(a), Operation::Limit(b)) => Operation::Limit(*a.min(b)),
        (Operation::Offset(a), Operation::Offset(b)) => Operation::Offset(a.saturating_add(*b)),
        (Operation::Random(a), Operation::Random(b)) => Operation::Random(*a.min(b)),
        (Operation::Sort(first), Operation::Sort(second)) => {
            let mut orders = second.clone();
            orders.extend(first.iter().cloned());
            Operation::Sort(orders)
        }
        (Operation::Transpose, Operation::Transpose) => return Some(None),
        (Operation::Distinct, Operation::Distinct) => Operation::Distinct,
        // A row passes a filter only on `Bool(true)`, while AND also accepts
        // truthy numbers and strings.
        (Operation::Filter(a), Operation::Filter(b)) if a.is_predicate() && b.is_predicate() => {
            Operation::Filter(Expression::and([a.clone(), b.clone()]))
        }
        (Operation::SelectColumns(first), Operation::SelectColumns(second)) => {
            let kept = second
                .iter()
                .filter(|c| first.contains(c))
                .cloned()
                .collect();
            Operation::SelectColumns(kept)
        }
        (Operation::Calculate(first), Operation::Calculate(second)) => {
            let assigned: HashSet<&Column> = first.iter().map(|(c, _)| c).collect();
            let depends = second
                .iter()
                .any(|(_, expr)| expr.siblings().iter().any(|c| assigned.contains(c)));
            if depends {
                return None;
            }
            let mut merged = first.clone();
            for (column, expr) in second {
                match merged.iter_mut().find(|(c, _)| c == column) {
                    Some(existing) => existing.1 = expr.clone(),
                    None => merged.push((column.clone(), expr.clone())),
                }
            }
            Operation::Calculate(merged)
        }
        _ => return None,
    };
    Some(Some(merged))
}

impl Dataset for CoalescedDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        self.resolved().raster(job, callback)
    }

    fn stream(&self) -> StreamRef {
        self.resolved().stream()
    }

    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        self.resolved().columns(job, callback)
    }

    fn push_down(&self, operation: &Operation) -> PushDown {
        PushDown::Pushed(Arc::new(self.push(operation)))
    }

    fn as_sql(&self) -> Option<&SqlDataset> {
        self.resolved().as_sql()
    }

    fn as_any(&self) -> Option<&dyn Any> {
        self.resolved().as_any()
    }
}

impl fmt::Debug for CoalescedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescedDataset")
            .field("pending", &self.pending.as_ref().map(|op| op.name()))
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::columns;
    use crate::dataset::testutil::{abc, materialize};
    use crate::dataset::{DatasetExt, Order, default_config};
    use crate::expr::Binary;
    use crate::raster::Raster;
    use crate::value::Value;

    fn wide() -> DatasetRef {
        crate::dataset::RasterDataset::shared(
            Raster::from_rows(columns(&["a", "b"]), (0..50).map(|i| vec![i % 7, 100 - i])).unwrap(),
        )
    }

    fn chain(source: DatasetRef, operations: Vec<Operation>) -> CoalescedDataset {
        operations
            .iter()
            .fold(CoalescedDataset::new(source, default_config()), |acc, op| {
                acc.push(op)
            })
    }

    fn assert_same(merged: &DatasetRef, direct: &DatasetRef) {
        assert_eq!(materialize(direct), materialize(merged));
    }

    #[test]
    fn limit_limit() {
        let merged = chain(abc(), vec![Operation::Limit(10), Operation::Limit(2)]);
        assert!(matches!(merged.pending(), Some(Operation::Limit(2))));

        let merged = abc().coalesced().limit(10).limit(2);
        assert_same(&merged, &abc().limit(2));
    }

    #[test]
    fn offset_offset() {
        let merged = chain(wide(), vec![Operation::Offset(2), Operation::Offset(1)]);
        assert!(matches!(merged.pending(), Some(Operation::Offset(3))));

        let merged = wide().coalesced().offset(2).offset(1);
        assert_same(&merged, &wide().offset(3));
    }

    #[test]
    fn sort_sort() {
        let merged = wide()
            .coalesced()
            .sort(vec![Order::descending("b")])
            .sort(vec![Order::ascending("a")]);
        let direct = wide().sort(vec![Order::ascending("a"), Order::descending("b")]);
        assert_same(&merged, &direct);

        // Same as sorting twice without coalescing.
        let twice = wide()
            .sort(vec![Order::descending("b")])
            .sort(vec![Order::ascending("a")]);
        assert_same(&twice, &direct);
    }

    #[test]
    fn transpose_transpose() {
        let merged = chain(abc(), vec![Operation::Transpose, Operation::Transpose]);
        assert!(merged.pending().is_none());

        let merged = abc().coalesced().transpose().transpose();
        assert_eq!(materialize(&abc()), materialize(&merged));

        let thrice = abc().coalesced().transpose().transpose().transpose();
        assert_same(&thrice, &abc().transpose());
    }

    #[test]
    fn filter_filter() {
        let a = Expression::binary(Binary::Greater, Expression::sibling("a"), Expression::literal(1));
        let b = Expression::binary(Binary::Lesser, Expression::sibling("b"), Expression::literal(90));
        let merged = wide().coalesced().filter(a.clone()).filter(b.clone());
        assert_same(&merged, &wide().filter(a).filter(b));
    }

    #[test]
    fn select_select() {
        let first = columns(&["a", "b"]);
        let second = columns(&["b", "c"]);
        let merged = abc()
            .coalesced()
            .select_columns(first.clone())
            .select_columns(second.clone());
        let out = materialize(&merged);
        assert_eq!(columns(&["b"]), out.columns());
        assert_same(&merged, &abc().select_columns(first).select_columns(second));
    }

    #[test]
    fn calculate_merges_when_independent() {
        let double =
            Expression::binary(Binary::Multiplication, Expression::sibling("a"), Expression::literal(2));
        let ops = vec![
            Operation::Calculate(vec![(Column::new("d"), double)]),
            Operation::Calculate(vec![(Column::new("e"), Expression::sibling("b"))]),
        ];
        let merged = chain(abc(), ops);
        assert!(matches!(merged.pending(), Some(Operation::Calculate(c)) if c.len() == 2));

        let merged: DatasetRef = Arc::new(merged);
        let out = materialize(&merged);
        assert_eq!(columns(&["a", "b", "c", "d", "e"]), out.columns());
        assert_eq!(Value::from(2), out.rows()[0][3]);
    }

    #[test]
    fn calculate_depending_on_previous_is_not_merged() {
        let first = vec![(Column::new("d"), Expression::literal(1))];
        let second = vec![(
            Column::new("e"),
            Expression::binary(Binary::Addition, Expression::sibling("d"), Expression::literal(1)),
        )];
        let merged = chain(
            abc(),
            vec![Operation::Calculate(first.clone()), Operation::Calculate(second.clone())],
        );
        assert!(matches!(merged.pending(), Some(Operation::Calculate(c)) if c.len() == 1));

        let merged: DatasetRef = Arc::new(merged);
        assert_same(&merged, &abc().calculate(first).calculate(second));
        assert_eq!(Value::from(2), materialize(&merged).rows()[0][4]);
    }

    #[test]
    fn unrelated_operations_applied_in_order() {
        let merged = abc().coalesced().limit(2).offset(1);
        assert_same(&merged, &abc().limit(2).offset(1));
        assert_eq!(1, materialize(&merged).row_count());
    }

    fn mixed() -> DatasetRef {
        let rows = vec![
            vec![Value::from("x"), Value::from(3), Value::Empty],
            vec![Value::from(1), Value::from("yes"), Value::Bool(true)],
            vec![Value::from("y"), Value::from(0), Value::from(7)],
            vec![Value::from(2), Value::from("10"), Value::Empty],
            vec![Value::from("z"), Value::Double(2.5), Value::from("b")],
            vec![Value::from("x"), Value::from(3), Value::Empty],
        ];
        crate::dataset::RasterDataset::shared(Raster::try_new(columns(&["k", "v", "w"]), rows).unwrap())
    }

    fn apply_all(source: DatasetRef, operations: &[Operation]) -> DatasetRef {
        operations
            .iter()
            .fold(source, |acc, op| acc.apply(op.clone()))
    }

    #[test]
    fn laws_hold_on_mixed_values() {
        let int_valued = Expression::sibling("v");
        let with_empty = Expression::binary(Binary::Equal, Expression::sibling("w"), Expression::literal(7));
        let text_compare =
            Expression::binary(Binary::Greater, Expression::sibling("k"), Expression::literal(1));

        let cases = vec![
            vec![Operation::Limit(4), Operation::Limit(2)],
            vec![Operation::Offset(1), Operation::Offset(3)],
            vec![Operation::Offset(4), Operation::Offset(4)],
            vec![
                Operation::Sort(vec![Order::ascending("v")]),
                Operation::Sort(vec![Order::descending("k")]),
            ],
            vec![
                Operation::Sort(vec![Order::new(Expression::sibling("w"), true, false)]),
                Operation::Sort(vec![Order::ascending("w")]),
            ],
            vec![Operation::Distinct, Operation::Distinct],
            vec![
                Operation::Filter(int_valued.clone()),
                Operation::Filter(Expression::literal(true)),
            ],
            vec![
                Operation::Filter(with_empty.clone()),
                Operation::Filter(text_compare.clone()),
            ],
            vec![Operation::Filter(text_compare), Operation::Filter(int_valued)],
            vec![Operation::Filter(with_empty), Operation::Filter(Expression::literal(true))],
            vec![
                Operation::SelectColumns(columns(&["k", "v"])),
                Operation::SelectColumns(columns(&["w"])),
            ],
            vec![
                Operation::SelectColumns(columns(&["W", "k"])),
                Operation::SelectColumns(columns(&["w", "w", "zzz"])),
            ],
            vec![
                Operation::Calculate(vec![(Column::new("d"), Expression::sibling("v"))]),
                Operation::Calculate(vec![(Column::new("v"), Expression::sibling("w"))]),
            ],
            vec![
                Operation::Calculate(vec![(Column::new("v"), Expression::literal(1))]),
                Operation::Calculate(vec![(Column::new("v"), Expression::sibling("k"))]),
            ],
        ];

        for operations in cases {
            let names: Vec<&str> = operations.iter().map(|op| op.name()).collect();
            let sequential = materialize(&apply_all(mixed(), &operations));
            let merged = materialize(&apply_all(mixed().coalesced(), &operations));
            assert_eq!(sequential, merged, "{names:?}");
        }
    }

    #[test]
    fn filter_with_non_boolean_predicate_is_not_merged() {
        let merged = chain(
            abc(),
            vec![
                Operation::Filter(Expression::sibling("a")),
                Operation::Filter(Expression::literal(true)),
            ],
        );
        assert!(matches!(merged.pending(), Some(Operation::Filter(Expression::Literal(_)))));

        let merged: DatasetRef = Arc::new(merged);
        let sequential = abc()
            .filter(Expression::sibling("a"))
            .filter(Expression::literal(true));
        assert_eq!(0, materialize(&merged).row_count());
        assert_same(&merged, &sequential);
    }

    #[test]
    fn select_with_no_common_columns() {
        let merged = abc()
            .coalesced()
            .select_columns(columns(&["a"]))
            .select_columns(columns(&["b"]));
        let out = materialize(&merged);
        assert!(out.columns().is_empty());
        assert_eq!(3, out.row_count());
        assert_same(&merged, &abc().select_columns(columns(&["a"])).select_columns(columns(&["b"])));
    }

    #[test]
    fn transpose_twice_on_mixed_values() {
        let rows = vec![
            vec![Value::from("x"), Value::from(3), Value::Empty],
            vec![Value::from(1), Value::from("yes"), Value::Bool(true)],
            vec![Value::from("y"), Value::Double(2.5), Value::from(7)],
        ];
        let source = crate::dataset::RasterDataset::shared(
            Raster::try_new(columns(&["k", "v", "w"]), rows).unwrap(),
        );
        let merged = source.coalesced().transpose().transpose();
        assert_eq!(materialize(&source.transpose().transpose()), materialize(&merged));
        assert_eq!(materialize(&source), materialize(&merged));
    }

    #[test]
    fn random_random_keeps_smaller_sample() {
        let merged = mixed().coalesced().random(5).random(2);
        let sequential = mixed().random(5).random(2);
        assert_eq!(materialize(&sequential).row_count(), materialize(&merged).row_count());

        let all = materialize(&mixed());
        for row in materialize(&merged).rows() {
            assert!(all.rows().contains(row));
        }
    }

    #[test]
    fn resolves_for_inspection() {
        let merged = abc().coalesced().limit(2);
        assert!(merged.as_sql().is_none());
        assert!(merged.as_any().is_none());
    }

    #[test]
    fn merge_laws() {
        assert!(matches!(
            merge(&Operation::Random(5), &Operation::Random(3)),
            Some(Some(Operation::Random(3)))
        ));
        assert!(matches!(
            merge(&Operation::Distinct, &Operation::Distinct),
            Some(Some(Operation::Distinct))
        ));
        assert!(merge(&Operation::Limit(1), &Operation::Offset(1)).is_none());
    }
}
