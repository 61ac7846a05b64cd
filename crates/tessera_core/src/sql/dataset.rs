use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::dialect::SqlDialect;
use super::fragment::{SqlFragment, Stage};
use crate::column::Column;
use crate::dataset::{Aggregation, Dataset, Operation, Order, PushDown};
use crate::expr::{Expression, Function};
use crate::runtime::job::Job;
use crate::stream::{ColumnsCallback, RasterCallback, RasterFuture, StreamRef, collect_future};

/// Connection to a database that can run SQL queries.
pub trait SqlDatabase: Send + Sync + fmt::Debug {
    fn dialect(&self) -> &dyn SqlDialect;

    /// Stream over the results of `sql`. Cloning the stream runs the query
    /// again.
    fn query(&self, sql: &str) -> StreamRef;
}

/// Index on a table. Only the leading column is used for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlIndex {
    pub name: String,
    pub columns: Vec<Column>,
}

/// Dataset backed by a SQL query.
///
/// Operations are folded into the query whenever every expression they carry
/// translates to SQL.
pub struct SqlDataset {
    database: Arc<dyn SqlDatabase>,
    fragment: SqlFragment,
    columns: Vec<Column>,
    indexes: Vec<SqlIndex>,
    future: OnceLock<Arc<RasterFuture>>,
}

impl SqlDataset {
    pub fn new(
        database: Arc<dyn SqlDatabase>,
        table: &str,
        columns: Vec<Column>,
        indexes: Vec<SqlIndex>,
    ) -> Self {
        SqlDataset {
            database,
            fragment: SqlFragment::table(table),
            columns,
            indexes,
            future: OnceLock::new(),
        }
    }

    fn derive(&self, fragment: SqlFragment, columns: Vec<Column>) -> PushDown {
        PushDown::Pushed(Arc::new(SqlDataset {
            database: self.database.clone(),
            fragment,
            columns,
            indexes: Vec::new(),
            future: OnceLock::new(),
        }))
    }

    pub fn sql(&self) -> String {
        self.fragment.sql(self.database.dialect())
    }

    /// Columns the query produces.
    pub fn result_columns(&self) -> &[Column] {
        &self.columns
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.database.dialect()
    }

    fn same_database(&self, other: &SqlDataset) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.database), Arc::as_ptr(&other.database))
    }

    /// Index whose leading column is `column`, usable while selecting
    /// straight from the table.
    fn index_on(&self, column: &Column) -> Option<&SqlIndex> {
        self.fragment.base_table()?;
        self.indexes
            .iter()
            .find(|idx| idx.columns.first() == Some(column))
    }

    fn push_filter(&self, condition: &Expression) -> Option<SqlFragment> {
        let condition = condition.prepare();
        // WHERE treats any nonzero value as true.
        if !condition.is_predicate() {
            return None;
        }
        let frag = if self.fragment.stage() == Stage::Where {
            self.fragment.clone()
        } else {
            self.fragment.ready_for(Stage::Where, self.dialect())
        };
        let sql = self.dialect().expression_to_sql(&condition, Some(frag.alias()))?;

        let hinted = condition
            .column_equals_literal()
            .and_then(|(column, _)| self.index_on(column))
            .and_then(|index| self.dialect().index_hint(&index.name))
            .and_then(|hint| frag.with_index_hint(hint));
        if hinted.is_some() {
            debug!(sql = %sql, "filtering through index lookup");
        }

        Some(hinted.unwrap_or(frag).filter(sql, self.dialect()))
    }

    fn push_calculate(&self, calculations: &[(Column, Expression)]) -> Option<(SqlFragment, Vec<Column>)> {
        let dialect = self.dialect();
        let frag = self.fragment.ready_for(Stage::Select, dialect);
        let alias = frag.alias().to_string();

        let mut columns = self.columns.clone();
        let mut exprs: Vec<String> = columns
            .iter()
            .map(|c| dialect.column_identifier(c, Some(&alias)))
            .collect();

        for (column, expr) in calculations {
            let sql = dialect.expression_to_sql(&expr.prepare(), Some(&alias))?;
            match columns.iter().position(|c| c == column) {
                Some(idx) => exprs[idx] = sql,
                None => {
                    columns.push(column.clone());
                    exprs.push(sql);
                }
            }
        }

        let list = exprs
            .into_iter()
            .zip(&columns)
            .map(|(sql, c)| format!("{sql} AS {}", dialect.quote_identifier(c.name())))
            .collect();
        Some((frag.select(list), columns))
    }

    /// None when no requested column exists, an empty select list is not
    /// valid SQL.
    fn push_select(&self, requested: &[Column]) -> Option<(SqlFragment, Vec<Column>)> {
        let dialect = self.dialect();
        let mut columns: Vec<Column> = Vec::new();
        for column in requested {
            if columns.contains(column) {
                continue;
            }
            if let Some(existing) = self.columns.iter().find(|c| *c == column) {
                columns.push(existing.clone());
            }
        }
        if columns.is_empty() {
            return None;
        }

        let frag = self.fragment.ready_for(Stage::Select, dialect);
        let list = columns
            .iter()
            .map(|c| {
                format!(
                    "{} AS {}",
                    dialect.column_identifier(c, Some(frag.alias())),
                    dialect.quote_identifier(c.name())
                )
            })
            .collect();
        Some((frag.select(list), columns))
    }

    fn push_sort(&self, orders: &[Order]) -> Option<SqlFragment> {
        let dialect = self.dialect();
        let frag = if self.fragment.stage() == Stage::Order {
            self.fragment.clone()
        } else {
            self.fragment.ready_for(Stage::Order, dialect)
        };

        let keys = orders
            .iter()
            .map(|order| {
                let sql = dialect.expression_to_sql(&order.expression.prepare(), Some(frag.alias()))?;
                let sql = if order.numeric {
                    dialect.force_numeric_expression(&sql)
                } else {
                    dialect.force_string_expression(&sql)
                };
                let direction = if order.ascending { "ASC" } else { "DESC" };
                Some(format!("{sql} {direction}"))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(frag.order(keys))
    }

    fn push_random(&self, n: usize) -> Option<SqlFragment> {
        let dialect = self.dialect();
        let random = dialect.unary_to_sql(Function::Random, &[])?;
        let frag = self.fragment.ready_for(Stage::Order, dialect);
        Some(frag.order(vec![random]).limit(n, dialect))
    }

    fn push_aggregate(&self, aggregation: &Aggregation) -> Option<(SqlFragment, Vec<Column>)> {
        // Without groups SQL yields one row even for empty input.
        if aggregation.groups.is_empty() {
            return None;
        }
        let dialect = self.dialect();
        let frag = self.fragment.ready_for(Stage::Group, dialect);
        let alias = frag.alias().to_string();

        let mut group_by = Vec::with_capacity(aggregation.groups.len());
        let mut list = Vec::new();
        let mut columns = Vec::new();
        for (column, expr) in &aggregation.groups {
            let sql = dialect.expression_to_sql(&expr.prepare(), Some(&alias))?;
            list.push(format!("{sql} AS {}", dialect.quote_identifier(column.name())));
            group_by.push(sql);
            columns.push(column.clone());
        }
        for (column, aggregator) in &aggregation.values {
            let sql = dialect.aggregation_to_sql(aggregator, Some(&alias))?;
            list.push(format!("{sql} AS {}", dialect.quote_identifier(column.name())));
            columns.push(column.clone());
        }
        Some((frag.group(group_by, list), columns))
    }

    fn raster_future(&self) -> &Arc<RasterFuture> {
        self.future
            .get_or_init(|| Arc::new(collect_future(self.stream())))
    }
}

impl Dataset for SqlDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        self.raster_future().get(Some(job), callback);
    }

    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        let columns = self.columns.clone();
        job.spawn(move || callback(Ok(columns)));
    }

    fn stream(&self) -> StreamRef {
        let sql = self.sql();
        debug!(%sql, "running query");
        self.database.query(&sql)
    }

    fn push_down(&self, operation: &Operation) -> PushDown {
        let dialect = self.dialect();
        let columns = self.columns.clone();
        match operation {
            Operation::Limit(n) => self.derive(self.fragment.limit(*n, dialect), columns),
            Operation::Offset(n) => self.derive(self.fragment.offset(*n, dialect), columns),
            Operation::Random(n) => match self.push_random(*n) {
                Some(frag) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Filter(condition) => match self.push_filter(condition) {
                Some(frag) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Calculate(calculations) => match self.push_calculate(calculations) {
                Some((frag, columns)) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Sort(orders) => match self.push_sort(orders) {
                Some(frag) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Distinct => self.derive(self.fragment.distinct(dialect), columns),
            Operation::SelectColumns(requested) => match self.push_select(requested) {
                Some((frag, columns)) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Aggregate(aggregation) => match self.push_aggregate(aggregation) {
                Some((frag, columns)) => self.derive(frag, columns),
                None => PushDown::Fallback,
            },
            Operation::Union(other) => match other.as_sql() {
                Some(other) if self.same_database(other) && other.columns == self.columns => {
                    self.derive(self.fragment.union_all(&other.fragment, dialect), columns)
                }
                _ => PushDown::Fallback,
            },
            Operation::Join(_) | Operation::Transpose => PushDown::Fallback,
        }
    }

    fn as_sql(&self) -> Option<&SqlDataset> {
        Some(self)
    }
}

impl fmt::Debug for SqlDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlDataset")
            .field("sql", &self.sql())
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::column::columns;
    use crate::dataset::{DatasetExt, DatasetRef};
    use crate::expr::Binary;
    use crate::sql::dialect::StandardDialect;
    use crate::stream::EmptyStream;

    #[derive(Debug)]
    struct HintingDialect;

    impl SqlDialect for HintingDialect {
        fn index_hint(&self, index: &str) -> Option<String> {
            Some(format!("USE INDEX ({})", self.quote_identifier(index)))
        }
    }

    #[derive(Debug)]
    struct RecordingDatabase<D> {
        dialect: D,
        queries: Mutex<Vec<String>>,
    }

    impl<D: SqlDialect> SqlDatabase for RecordingDatabase<D> {
        fn dialect(&self) -> &dyn SqlDialect {
            &self.dialect
        }

        fn query(&self, sql: &str) -> StreamRef {
            self.queries.lock().push(sql.to_string());
            Arc::new(EmptyStream)
        }
    }

    fn items<D: SqlDialect + 'static>(dialect: D) -> (Arc<RecordingDatabase<D>>, DatasetRef) {
        let db = Arc::new(RecordingDatabase {
            dialect,
            queries: Mutex::new(Vec::new()),
        });
        let dataset: DatasetRef = Arc::new(SqlDataset::new(
            db.clone(),
            "items",
            columns(&["a", "b", "c"]),
            vec![SqlIndex {
                name: "items_a".to_string(),
                columns: columns(&["a"]),
            }],
        ));
        (db, dataset)
    }

    fn sql_of(dataset: &DatasetRef) -> String {
        dataset.as_sql().expect("sql dataset").sql()
    }

    fn a_equals(n: i64) -> Expression {
        Expression::binary(Binary::Equal, Expression::sibling("a"), Expression::literal(n))
    }

    #[test]
    fn filter_and_limit_pushed() {
        let (_, items) = items(StandardDialect);
        let out = items.filter(a_equals(3)).limit(10);
        assert_eq!(
            "SELECT * FROM \"items\" AS \"T0\" WHERE (\"T0\".\"a\" = 3) LIMIT 10",
            sql_of(&out)
        );

        let out = items.filter(a_equals(3)).filter(a_equals(4));
        assert_eq!(
            "SELECT * FROM \"items\" AS \"T0\" WHERE ((\"T0\".\"a\" = 3) AND (\"T0\".\"a\" = 4))",
            sql_of(&out)
        );
    }

    #[test]
    fn index_lookup_when_hint_available() {
        let (_, items) = items(HintingDialect);
        let out = items.filter(Expression::binary(
            Binary::Equal,
            Expression::literal(3),
            Expression::sibling("A"),
        ));
        assert_eq!(
            "SELECT * FROM \"items\" AS \"T0\" USE INDEX (\"items_a\") WHERE (3 = \"T0\".\"A\")",
            sql_of(&out)
        );

        // No index on b.
        let out = items.filter(Expression::binary(
            Binary::Equal,
            Expression::sibling("b"),
            Expression::literal(3),
        ));
        assert!(!sql_of(&out).contains("USE INDEX"));

        // Index only applies to the base table.
        let out = items.limit(5).filter(a_equals(3));
        assert!(!sql_of(&out).contains("USE INDEX"));
    }

    #[test]
    fn calculate_and_select() {
        let (_, items) = items(StandardDialect);
        let out = items
            .calculate(vec![(
                Column::new("d"),
                Expression::binary(Binary::Multiplication, Expression::sibling("a"), Expression::literal(2)),
            )])
            .select_columns(columns(&["d", "a", "zzz"]));
        assert_eq!(columns(&["d", "a"]), out.as_sql().unwrap().result_columns());
        assert_eq!(
            "SELECT \"T1\".\"d\" AS \"d\", \"T1\".\"a\" AS \"a\" FROM (SELECT \"T0\".\"a\" AS \"a\", \"T0\".\"b\" AS \"b\", \"T0\".\"c\" AS \"c\", (\"T0\".\"a\" * 2) AS \"d\" FROM \"items\" AS \"T0\") AS \"T1\"",
            sql_of(&out)
        );
    }

    #[test]
    fn select_of_unknown_columns_falls_back() {
        let (_, items) = items(StandardDialect);
        let out = items.select_columns(columns(&["zzz"]));
        assert!(out.as_sql().is_none());
        assert!(format!("{out:?}").starts_with("GenericDataset"));
    }

    #[test]
    fn sort_keys_compose() {
        let (_, items) = items(StandardDialect);
        let out = items
            .sort(vec![Order::ascending("a")])
            .sort(vec![Order::new(Expression::sibling("b"), false, false)]);
        assert_eq!(
            "SELECT * FROM \"items\" AS \"T0\" ORDER BY CAST(\"T0\".\"b\" AS VARCHAR) DESC, CAST(\"T0\".\"a\" AS NUMERIC) ASC",
            sql_of(&out)
        );
    }

    #[test]
    fn untranslatable_falls_back() {
        let (_, items) = items(StandardDialect);
        let regex = Expression::binary(Binary::MatchesRegex, Expression::sibling("b"), Expression::literal("x"));
        let out = items.filter(regex);
        assert!(out.as_sql().is_none());
        assert!(format!("{out:?}").starts_with("GenericDataset"));

        let out = items.transpose();
        assert!(out.as_sql().is_none());

        let out = items.filter(Expression::sibling("a"));
        assert!(out.as_sql().is_none());
    }

    #[test]
    fn union_same_database_only() {
        let (db, items) = items(StandardDialect);
        let other: DatasetRef = Arc::new(SqlDataset::new(db, "items", columns(&["a", "b", "c"]), vec![]));
        let out = items.union(other);
        assert!(sql_of(&out).contains("UNION ALL"));

        let (_, elsewhere) = self::items(StandardDialect);
        let out = items.union(elsewhere);
        assert!(out.as_sql().is_none());
    }

    #[test]
    fn aggregate_pushed() {
        let (_, items) = items(StandardDialect);
        let out = items.aggregate(Aggregation {
            groups: vec![(Column::new("a"), Expression::sibling("a"))],
            values: vec![(
                Column::new("total"),
                crate::dataset::Aggregator {
                    map: Expression::sibling("b"),
                    reduce: Function::Sum,
                },
            )],
        });
        assert_eq!(
            "SELECT \"T0\".\"a\" AS \"a\", SUM(\"T0\".\"b\") AS \"total\" FROM \"items\" AS \"T0\" GROUP BY \"T0\".\"a\"",
            sql_of(&out)
        );
    }

    #[test]
    fn stream_runs_query() {
        let (db, items) = items(StandardDialect);
        let out = items.limit(1);
        let _ = out.stream();
        assert_eq!(1, db.queries.lock().len());
    }
}
