//! In-memory implementations of dataset operations.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::seq::index;
use tessera_error::{EngineError, Result};

use super::{Aggregation, Join, JoinType, Operation, Order};
use crate::column::Column;
use crate::expr::{Binary, Expression};
use crate::raster::{Raster, Row};
use crate::value::Value;

/// Apply `operation` to `raster`. Operations combining two datasets receive
/// the materialized other side in `foreign`.
pub fn apply(raster: &Raster, operation: &Operation, foreign: Option<&Raster>) -> Result<Raster> {
    match operation {
        Operation::Limit(n) => limit(raster, *n),
        Operation::Offset(n) => offset(raster, *n),
        Operation::Random(n) => random(raster, *n),
        Operation::Filter(condition) => {
            let condition = condition.prepare();
            let rows = filter_rows(raster.columns(), raster.rows(), &condition);
            Raster::try_new(raster.columns().to_vec(), rows)
        }
        Operation::Calculate(calculations) => {
            let plan = CalculationPlan::new(raster.columns(), calculations);
            let rows = plan.calculate_rows(raster.columns(), raster.rows());
            Raster::try_new(plan.columns, rows)
        }
        Operation::Sort(orders) => sort(raster, orders),
        Operation::Distinct => distinct(raster),
        Operation::Union(_) => union(raster, require_foreign(operation, foreign)?),
        Operation::Join(join) => self::join(raster, require_foreign(operation, foreign)?, join),
        Operation::SelectColumns(columns) => select_columns(raster, columns),
        Operation::Transpose => transpose(raster),
        Operation::Aggregate(aggregation) => aggregate(raster, aggregation),
    }
}

fn require_foreign<'a>(operation: &Operation, foreign: Option<&'a Raster>) -> Result<&'a Raster> {
    foreign.ok_or_else(|| {
        EngineError::new("Missing materialized foreign dataset")
            .with_field("operation", operation.name())
    })
}

/// Hashable stand-in for a value, equal for values that compare equal.
///
/// Invalid values never equal anything, they get a key unique to their
/// position.
fn value_key(value: &Value, position: usize) -> String {
    match value {
        Value::Empty => "\0e".to_string(),
        Value::Invalid => format!("\0i{position}"),
        other => match other.double_value() {
            Some(d) => format!("\0n{d}"),
            None => other.string_value().unwrap_or_default(),
        },
    }
}

fn row_key(row: &[Value], row_idx: usize) -> Vec<String> {
    row.iter()
        .enumerate()
        .map(|(col_idx, v)| value_key(v, row_idx * row.len() + col_idx))
        .collect()
}

pub fn limit(raster: &Raster, n: usize) -> Result<Raster> {
    let rows = raster.rows().iter().take(n).cloned().collect();
    Raster::try_new(raster.columns().to_vec(), rows)
}

pub fn offset(raster: &Raster, n: usize) -> Result<Raster> {
    let rows = raster.rows().iter().skip(n).cloned().collect();
    Raster::try_new(raster.columns().to_vec(), rows)
}

/// Uniform sample of `n` rows without replacement, in their original order.
pub fn random(raster: &Raster, n: usize) -> Result<Raster> {
    let len = raster.row_count();
    let amount = n.min(len);
    let mut picked = index::sample(&mut rand::rng(), len, amount).into_vec();
    picked.sort_unstable();
    let rows = picked.into_iter().map(|i| raster.rows()[i].clone()).collect();
    Raster::try_new(raster.columns().to_vec(), rows)
}

/// Rows for which `condition` evaluates to true.
pub fn filter_rows(
    columns: &[Column],
    rows: &[Vec<Value>],
    condition: &Expression,
) -> Vec<Vec<Value>> {
    rows.iter()
        .filter(|row| {
            matches!(
                condition.apply(&Row::new(columns, row), None, None),
                Value::Bool(true)
            )
        })
        .cloned()
        .collect()
}

/// Output layout of a calculate operation.
#[derive(Debug, Clone)]
pub struct CalculationPlan {
    pub columns: Vec<Column>,
    targets: Vec<(usize, Expression)>,
}

impl CalculationPlan {
    pub fn new(columns: &[Column], calculations: &[(Column, Expression)]) -> Self {
        let mut out_columns = columns.to_vec();
        let mut targets = Vec::with_capacity(calculations.len());
        for (column, expr) in calculations {
            let idx = match out_columns.iter().position(|c| c == column) {
                Some(idx) => idx,
                None => {
                    out_columns.push(column.clone());
                    out_columns.len() - 1
                }
            };
            targets.push((idx, expr.prepare()));
        }
        CalculationPlan {
            columns: out_columns,
            targets,
        }
    }

    /// Every expression sees the row as it was before the calculation.
    pub fn calculate_rows(&self, columns: &[Column], rows: &[Vec<Value>]) -> Vec<Vec<Value>> {
        rows.iter()
            .map(|row| {
                let source = Row::new(columns, row);
                let mut out = row.clone();
                out.resize(self.columns.len(), Value::Empty);
                for (idx, expr) in &self.targets {
                    out[*idx] = expr.apply(&source, None, None);
                }
                out
            })
            .collect()
    }
}

fn compare_keys(a: &Value, b: &Value, order: &Order) -> Ordering {
    let ord = if order.numeric {
        match (a.double_value(), b.double_value()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => compare_strings(a, b),
        }
    } else {
        compare_strings(a, b)
    };
    if order.ascending { ord } else { ord.reverse() }
}

fn compare_strings(a: &Value, b: &Value) -> Ordering {
    match (a.string_value(), b.string_value()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort, earlier orders take precedence.
pub fn sort(raster: &Raster, orders: &[Order]) -> Result<Raster> {
    let columns = raster.columns();
    let orders: Vec<Order> = orders
        .iter()
        .map(|o| Order::new(o.expression.prepare(), o.ascending, o.numeric))
        .collect();

    let mut keyed: Vec<(Vec<Value>, &Vec<Value>)> = raster
        .rows()
        .iter()
        .map(|row| {
            let source = Row::new(columns, row);
            let keys = orders
                .iter()
                .map(|o| o.expression.apply(&source, None, None))
                .collect();
            (keys, row)
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for (idx, order) in orders.iter().enumerate() {
            match compare_keys(&a[idx], &b[idx], order) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    });

    let rows = keyed.into_iter().map(|(_, row)| row.clone()).collect();
    Raster::try_new(columns.to_vec(), rows)
}

/// Remove duplicate rows, keeping the first occurrence.
pub fn distinct(raster: &Raster) -> Result<Raster> {
    let mut seen = HashSet::new();
    let rows = raster
        .rows()
        .iter()
        .enumerate()
        .filter(|(idx, row)| seen.insert(row_key(row, *idx)))
        .map(|(_, row)| row.clone())
        .collect();
    Raster::try_new(raster.columns().to_vec(), rows)
}

/// Columns of `left` followed by the columns only `right` has.
fn merged_columns(left: &[Column], right: &[Column]) -> Vec<Column> {
    let mut columns = left.to_vec();
    columns.extend(right.iter().filter(|c| !left.contains(c)).cloned());
    columns
}

fn project_row(columns: &[Column], source_columns: &[Column], row: &[Value]) -> Vec<Value> {
    let source = Row::new(source_columns, row);
    columns
        .iter()
        .map(|c| source.value(c).cloned().unwrap_or(Value::Empty))
        .collect()
}

pub fn union(left: &Raster, right: &Raster) -> Result<Raster> {
    let columns = merged_columns(left.columns(), right.columns());
    let mut rows = Vec::with_capacity(left.row_count() + right.row_count());
    for row in left.rows() {
        rows.push(project_row(&columns, left.columns(), row));
    }
    for row in right.rows() {
        rows.push(project_row(&columns, right.columns(), row));
    }
    Raster::try_new(columns, rows)
}

/// Sibling and foreign columns compared for equality, in either order.
fn equi_join_columns(condition: &Expression) -> Option<(&Column, &Column)> {
    match condition {
        Expression::Binary {
            op: Binary::Equal,
            lhs,
            rhs,
        } => match (lhs.as_ref(), rhs.as_ref()) {
            (Expression::Sibling(s), Expression::Foreign(f))
            | (Expression::Foreign(f), Expression::Sibling(s)) => Some((s, f)),
            _ => None,
        },
        _ => None,
    }
}

pub fn join(left: &Raster, right: &Raster, join: &Join) -> Result<Raster> {
    let columns = merged_columns(left.columns(), right.columns());
    let right_only: Vec<usize> = right
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| !left.columns().contains(c))
        .map(|(idx, _)| idx)
        .collect();

    let condition = join.condition.prepare();
    let equi = equi_join_columns(&condition).and_then(|(s, f)| {
        Some((left.column_index(s)?, right.column_index(f)?))
    });

    // Equality joins are answered from a hash of the foreign rows.
    let index: Option<HashMap<String, Vec<usize>>> = equi.map(|(_, f_idx)| {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (row_idx, row) in right.rows().iter().enumerate() {
            index
                .entry(value_key(&row[f_idx], row_idx))
                .or_default()
                .push(row_idx);
        }
        index
    });

    let mut rows = Vec::new();
    for (left_idx, left_row) in left.rows().iter().enumerate() {
        let matches: Vec<usize> = match (&index, equi) {
            (Some(index), Some((s_idx, _))) => {
                // Invalid keys are unique to their position and never match.
                let key = value_key(&left_row[s_idx], usize::MAX - left_idx);
                index.get(&key).cloned().unwrap_or_default()
            }
            _ => {
                let sibling = Row::new(left.columns(), left_row);
                (0..right.row_count())
                    .filter(|&r| {
                        let foreign = Row::new(right.columns(), &right.rows()[r]);
                        matches!(
                            condition.apply(&sibling, Some(&foreign), None),
                            Value::Bool(true)
                        )
                    })
                    .collect()
            }
        };

        if matches.is_empty() {
            if join.join_type == JoinType::Left {
                let mut out = left_row.clone();
                out.extend(std::iter::repeat_n(Value::Empty, right_only.len()));
                rows.push(out);
            }
            continue;
        }

        for r in matches {
            let mut out = left_row.clone();
            out.extend(right_only.iter().map(|&idx| right.rows()[r][idx].clone()));
            rows.push(out);
        }
    }

    Raster::try_new(columns, rows)
}

/// Keep the requested columns that exist, in request order.
pub fn select_columns(raster: &Raster, columns: &[Column]) -> Result<Raster> {
    let mut selected: Vec<(Column, usize)> = Vec::new();
    for column in columns {
        if selected.iter().any(|(c, _)| c == column) {
            continue;
        }
        if let Some(idx) = raster.column_index(column) {
            selected.push((raster.columns()[idx].clone(), idx));
        }
    }

    let rows = raster
        .rows()
        .iter()
        .map(|row| selected.iter().map(|(_, idx)| row[*idx].clone()).collect())
        .collect();
    Raster::try_new(selected.into_iter().map(|(c, _)| c).collect(), rows)
}

/// Swap rows and columns.
///
/// The values of the first column become the new column names and the old
/// column names become the first column.
pub fn transpose(raster: &Raster) -> Result<Raster> {
    if raster.column_count() == 0 {
        return Ok(Raster::empty());
    }

    let mut columns = vec![raster.columns()[0].clone()];
    for row in raster.rows() {
        let idx = columns.len();
        let candidate = row[0]
            .string_value()
            .filter(|s| !s.is_empty())
            .map(Column::new)
            .filter(|c| !columns.contains(c));
        let column = match candidate {
            Some(column) => column,
            None => unique_default_column(&columns, idx),
        };
        columns.push(column);
    }

    let rows = raster.columns()[1..]
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let mut out = Vec::with_capacity(raster.row_count() + 1);
            out.push(Value::String(column.name().to_string()));
            out.extend(raster.rows().iter().map(|row| row[idx + 1].clone()));
            out
        })
        .collect();

    Raster::try_new(columns, rows)
}

fn unique_default_column(existing: &[Column], idx: usize) -> Column {
    let mut column = Column::default_for_index(idx);
    let mut attempt = 0;
    while existing.contains(&column) {
        attempt += 1;
        column = Column::new(format!("{}_{attempt}", Column::default_for_index(idx)));
    }
    column
}

/// Group rows by the group expressions and reduce the value columns.
pub fn aggregate(raster: &Raster, aggregation: &Aggregation) -> Result<Raster> {
    let columns: Vec<Column> = aggregation
        .groups
        .iter()
        .map(|(c, _)| c.clone())
        .chain(aggregation.values.iter().map(|(c, _)| c.clone()))
        .collect();

    let groups: Vec<Expression> = aggregation.groups.iter().map(|(_, e)| e.prepare()).collect();
    let maps: Vec<Expression> = aggregation
        .values
        .iter()
        .map(|(_, a)| a.map.prepare())
        .collect();

    let mut group_index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut group_values: Vec<Vec<Value>> = Vec::new();
    let mut collected: Vec<Vec<Vec<Value>>> = Vec::new();

    for (row_idx, row) in raster.rows().iter().enumerate() {
        let source = Row::new(raster.columns(), row);
        let key_values: Vec<Value> = groups
            .iter()
            .map(|g| g.apply(&source, None, None))
            .collect();
        let key = row_key(&key_values, row_idx);
        let idx = *group_index.entry(key).or_insert_with(|| {
            group_values.push(key_values);
            collected.push(vec![Vec::new(); maps.len()]);
            group_values.len() - 1
        });
        for (value_idx, map) in maps.iter().enumerate() {
            collected[idx][value_idx].push(map.apply(&source, None, None));
        }
    }

    let rows = group_values
        .into_iter()
        .zip(collected)
        .map(|(mut out, values)| {
            for ((_, aggregator), values) in aggregation.values.iter().zip(values) {
                out.push(aggregator.reduce.apply(&values));
            }
            out
        })
        .collect();

    Raster::try_new(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::columns;
    use crate::dataset::testutil::rows_of;
    use crate::dataset::{Aggregator, RasterDataset};
    use crate::expr::Function;

    fn abc() -> Raster {
        Raster::from_rows(
            columns(&["a", "b", "c"]),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]],
        )
        .unwrap()
    }

    #[test]
    fn limit_offset_clamp() {
        assert_eq!(2, limit(&abc(), 2).unwrap().row_count());
        assert_eq!(3, limit(&abc(), 20).unwrap().row_count());
        assert_eq!(1, offset(&abc(), 2).unwrap().row_count());
        assert_eq!(0, offset(&abc(), 20).unwrap().row_count());
    }

    #[test]
    fn random_sample() {
        let raster = Raster::from_rows(columns(&["x"]), (0..100).map(|i| vec![i])).unwrap();
        let sample = random(&raster, 10).unwrap();
        assert_eq!(10, sample.row_count());
        let set: HashSet<_> = sample.rows().iter().map(|r| r[0].to_string()).collect();
        assert_eq!(10, set.len());

        assert_eq!(3, random(&abc(), 10).unwrap().row_count());
    }

    #[test]
    fn filter_keeps_columns() {
        let condition = Expression::binary(
            Binary::Greater,
            Expression::sibling("a"),
            Expression::literal(100),
        );
        let out = apply(&abc(), &Operation::Filter(condition), None).unwrap();
        assert_eq!(0, out.row_count());
        assert_eq!(3, out.column_count());
    }

    #[test]
    fn calculate_sees_previous_values() {
        let calcs = vec![
            (
                Column::new("a"),
                Expression::binary(Binary::Addition, Expression::sibling("a"), Expression::literal(1)),
            ),
            (
                Column::new("d"),
                Expression::binary(Binary::Multiplication, Expression::sibling("a"), Expression::literal(10)),
            ),
        ];
        let out = apply(&abc(), &Operation::Calculate(calcs), None).unwrap();
        assert_eq!(columns(&["a", "b", "c", "d"]), out.columns());
        assert_eq!(
            rows_of(vec![vec![2, 2, 3, 10], vec![5, 5, 6, 40], vec![8, 8, 9, 70]]),
            out.rows()
        );
    }

    #[test]
    fn sort_numeric_and_string() {
        let raster = Raster::try_new(
            columns(&["x"]),
            vec![
                vec![Value::from(10)],
                vec![Value::from("abc")],
                vec![Value::from(9)],
            ],
        )
        .unwrap();

        let out = sort(&raster, &[Order::ascending("x")]).unwrap();
        assert_eq!(
            vec![vec![Value::from(9)], vec![Value::from(10)], vec![Value::from("abc")]],
            out.rows()
        );

        let by_string = Order::new(Expression::sibling("x"), true, false);
        let out = sort(&raster, &[by_string]).unwrap();
        assert_eq!(
            vec![vec![Value::from(10)], vec![Value::from(9)], vec![Value::from("abc")]],
            out.rows()
        );
    }

    #[test]
    fn sort_is_stable() {
        let raster = Raster::from_rows(
            columns(&["k", "v"]),
            vec![vec![1, 1], vec![0, 2], vec![1, 3], vec![0, 4]],
        )
        .unwrap();
        let out = sort(&raster, &[Order::ascending("k")]).unwrap();
        assert_eq!(
            rows_of(vec![vec![0, 2], vec![0, 4], vec![1, 1], vec![1, 3]]),
            out.rows()
        );
    }

    #[test]
    fn distinct_rows() {
        let raster = Raster::try_new(
            columns(&["x"]),
            vec![
                vec![Value::from(1)],
                vec![Value::from("1")],
                vec![Value::Empty],
                vec![Value::Empty],
                vec![Value::Invalid],
                vec![Value::Invalid],
            ],
        )
        .unwrap();
        let out = distinct(&raster).unwrap();
        assert_eq!(4, out.row_count());
    }

    #[test]
    fn union_pads_columns() {
        let left = Raster::from_rows(columns(&["a", "b"]), vec![vec![1, 2]]).unwrap();
        let right = Raster::from_rows(columns(&["b", "c", "d", "e"]), vec![vec![3, 4, 5, 6]]).unwrap();
        let out = union(&left, &right).unwrap();
        assert_eq!(columns(&["a", "b", "c", "d", "e"]), out.columns());
        assert_eq!(2, out.row_count());
        assert!(out.rows()[0][2].is_empty());
        assert!(out.rows()[1][0].is_empty());
        assert_eq!(Value::from(3), out.rows()[1][1]);
    }

    fn join_fixture(join_type: JoinType, condition: Expression) -> Raster {
        let left = abc();
        let right = Raster::from_rows(
            columns(&["a", "label"]),
            vec![
                vec![Value::from(1), Value::from("one")],
                vec![Value::from(7), Value::from("seven")],
                vec![Value::from(7), Value::from("zeven")],
            ],
        )
        .unwrap();
        let condition_join = Join {
            join_type,
            foreign: RasterDataset::shared(right.clone()),
            condition,
        };
        join(&left, &right, &condition_join).unwrap()
    }

    #[test]
    fn join_counts() {
        let equal = Expression::binary(Binary::Equal, Expression::sibling("a"), Expression::foreign("a"));
        let inner = join_fixture(JoinType::Inner, equal.clone());
        assert_eq!(columns(&["a", "b", "c", "label"]), inner.columns());
        assert_eq!(3, inner.row_count());

        let left = join_fixture(JoinType::Left, equal);
        assert_eq!(4, left.row_count());
        assert!(left.rows()[1][3].is_empty());

        // Non-equality conditions go through the nested loop.
        let greater = Expression::binary(Binary::Greater, Expression::sibling("a"), Expression::foreign("a"));
        let inner = join_fixture(JoinType::Inner, greater);
        assert_eq!(2, inner.row_count());
        assert_eq!(Value::from(4), inner.rows()[0][0]);
        assert_eq!(Value::from("one"), inner.rows()[0][3]);
    }

    #[test]
    fn transpose_twice_is_identity() {
        let once = transpose(&abc()).unwrap();
        assert_eq!(columns(&["a", "1", "4", "7"]), once.columns());
        assert_eq!(2, once.row_count());

        let twice = transpose(&once).unwrap();
        assert_eq!(abc(), twice);

        let thrice = transpose(&twice).unwrap();
        assert_eq!(once, thrice);
    }

    #[test]
    fn transpose_duplicate_headers() {
        let raster = Raster::from_rows(columns(&["k", "v"]), vec![vec![1, 2], vec![1, 3]]).unwrap();
        let out = transpose(&raster).unwrap();
        assert_eq!(columns(&["k", "1", "C"]), out.columns());
        assert_eq!(Raster::empty(), transpose(&Raster::empty()).unwrap());
    }

    #[test]
    fn aggregate_groups() {
        let raster = Raster::from_rows(
            columns(&["k", "v"]),
            vec![vec![1, 10], vec![2, 20], vec![1, 30]],
        )
        .unwrap();
        let aggregation = Aggregation {
            groups: vec![(Column::new("k"), Expression::sibling("k"))],
            values: vec![
                (
                    Column::new("total"),
                    Aggregator {
                        map: Expression::sibling("v"),
                        reduce: Function::Sum,
                    },
                ),
                (
                    Column::new("n"),
                    Aggregator {
                        map: Expression::sibling("v"),
                        reduce: Function::Count,
                    },
                ),
            ],
        };
        let out = aggregate(&raster, &aggregation).unwrap();
        assert_eq!(columns(&["k", "total", "n"]), out.columns());
        assert_eq!(rows_of(vec![vec![1, 40, 2], vec![2, 20, 1]]), out.rows());
    }
}
