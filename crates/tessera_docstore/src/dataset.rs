use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tessera_core::column::Column;
use tessera_core::dataset::{Dataset, DatasetRef, Operation, PushDown};
use tessera_core::expr::Expression;
use tessera_core::runtime::job::Job;
use tessera_core::stream::{
    ColumnsCallback, RasterCallback, RasterFuture, StreamRef, collect_future,
};
use tessera_error::Result;
use tracing::debug;

use crate::document::value_to_json;
use crate::store::DocumentStore;
use crate::stream::DocumentStream;
use crate::term::Query;
use crate::translate::expression_to_term;

/// Dataset backed by a document query.
pub struct DocumentDataset {
    store: Arc<DocumentStore>,
    query: Query,
    columns: Vec<Column>,
    /// Indexed fields, only usable while reading a whole table.
    indexes: Vec<Column>,
    future: OnceLock<Arc<RasterFuture>>,
}

impl DocumentDataset {
    /// Dataset over all documents of `table`, with a column for every field.
    pub fn table(store: &Arc<DocumentStore>, table: &str) -> Result<DatasetRef> {
        let columns = store.fields(table)?.into_iter().map(Column::new).collect();
        let indexes = store.indexes(table)?.into_iter().map(Column::new).collect();
        Ok(Arc::new(DocumentDataset {
            store: store.clone(),
            query: Query::table(table),
            columns,
            indexes,
            future: OnceLock::new(),
        }))
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn derive(&self, query: Query, columns: Vec<Column>) -> PushDown {
        PushDown::Pushed(Arc::new(DocumentDataset {
            store: self.store.clone(),
            query,
            columns,
            indexes: Vec::new(),
            future: OnceLock::new(),
        }))
    }

    fn push_filter(&self, condition: &Expression) -> Option<Query> {
        let condition = condition.prepare();
        let predicate = expression_to_term(&condition)?;

        let lookup = condition.column_equals_literal().and_then(|(column, value)| {
            let index = self.indexes.iter().find(|idx| *idx == column)?;
            self.query.get_all(index.name(), value_to_json(value)?)
        });
        if let Some(lookup) = lookup {
            debug!(%condition, "filtering through document index");
            return Some(lookup);
        }
        Some(self.query.filter(predicate))
    }

    fn push_calculate(&self, calculations: &[(Column, Expression)]) -> Option<(Query, Vec<Column>)> {
        let mut columns = self.columns.clone();
        let mut fields = Vec::with_capacity(calculations.len());
        for (column, expr) in calculations {
            let term = expression_to_term(&expr.prepare())?;
            let name = match columns.iter().find(|c| *c == column) {
                Some(existing) => existing.name().to_string(),
                None => {
                    columns.push(column.clone());
                    column.name().to_string()
                }
            };
            fields.push((name, term));
        }
        Some((self.query.merge(fields), columns))
    }

    fn push_select(&self, requested: &[Column]) -> (Query, Vec<Column>) {
        let mut columns: Vec<Column> = Vec::new();
        for column in requested {
            if columns.contains(column) {
                continue;
            }
            if let Some(existing) = self.columns.iter().find(|c| *c == column) {
                columns.push(existing.clone());
            }
        }
        let fields = columns.iter().map(|c| c.name().to_string()).collect();
        (self.query.pluck(fields), columns)
    }

    fn raster_future(&self) -> &Arc<RasterFuture> {
        self.future
            .get_or_init(|| Arc::new(collect_future(self.stream())))
    }
}

impl Dataset for DocumentDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        self.raster_future().get(Some(job), callback);
    }

    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        let columns = self.columns.clone();
        job.spawn(move || callback(Ok(columns)));
    }

    fn stream(&self) -> StreamRef {
        Arc::new(DocumentStream::new(
            self.store.clone(),
            self.query.clone(),
            Some(self.columns.clone()),
        ))
    }

    fn push_down(&self, operation: &Operation) -> PushDown {
        let columns = self.columns.clone();
        match operation {
            Operation::Limit(n) => self.derive(self.query.limit(*n), columns),
            Operation::Offset(n) => self.derive(self.query.skip(*n), columns),
            Operation::Random(n) => self.derive(self.query.sample(*n), columns),
            Operation::Distinct => self.derive(self.query.distinct(), columns),
            Operation::Filter(condition) => match self.push_filter(condition) {
                Some(query) => self.derive(query, columns),
                None => PushDown::Fallback,
            },
            Operation::Calculate(calculations) => match self.push_calculate(calculations) {
                Some((query, columns)) => self.derive(query, columns),
                None => PushDown::Fallback,
            },
            Operation::SelectColumns(requested) => {
                let (query, columns) = self.push_select(requested);
                self.derive(query, columns)
            }
            Operation::Union(other) => {
                let other = other
                    .as_any()
                    .and_then(|any| any.downcast_ref::<DocumentDataset>());
                match other {
                    Some(other) if Arc::ptr_eq(&self.store, &other.store) => {
                        let mut columns = columns;
                        for column in &other.columns {
                            if !columns.contains(column) {
                                columns.push(column.clone());
                            }
                        }
                        self.derive(self.query.union(&other.query), columns)
                    }
                    _ => PushDown::Fallback,
                }
            }
            Operation::Sort(_)
            | Operation::Join(_)
            | Operation::Transpose
            | Operation::Aggregate(_) => PushDown::Fallback,
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}

impl fmt::Debug for DocumentDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentDataset")
            .field("query", &self.query)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_core::dataset::{DatasetExt, RasterDataset};
    use tessera_core::expr::Binary;
    use tessera_core::raster::Raster;
    use tessera_core::runtime::scheduler::Qos;
    use tessera_core::value::Value;

    use super::*;

    fn people() -> (Arc<DocumentStore>, DatasetRef) {
        logutil::init_test();
        let store = DocumentStore::with_batch_size(4);
        store.create_table("people").unwrap();
        store.create_index("people", "city").unwrap();
        let cities = ["Utrecht", "Delft", "Gouda"];
        store
            .insert(
                "people",
                (0..30).map(|i| {
                    serde_json::from_value(json!({
                        "id": i,
                        "city": cities[i % 3],
                        "age": 20 + i,
                    }))
                    .unwrap()
                }),
            )
            .unwrap();
        let people = DocumentDataset::table(&store, "people").unwrap();
        (store, people)
    }

    fn materialize(dataset: &DatasetRef) -> Raster {
        dataset
            .wait_raster(&Job::new(Qos::UserInitiated))
            .unwrap()
            .as_ref()
            .clone()
    }

    fn query_of(dataset: &DatasetRef) -> Query {
        dataset
            .as_any()
            .and_then(|a| a.downcast_ref::<DocumentDataset>())
            .expect("document dataset")
            .query()
            .clone()
    }

    fn city_is(city: &str) -> Expression {
        Expression::binary(Binary::Equal, Expression::sibling("city"), Expression::literal(city))
    }

    #[test]
    fn index_lookup_matches_in_memory_filter() {
        let (_, people) = people();
        let pushed = people.filter(city_is("Delft"));
        assert!(matches!(query_of(&pushed), Query::GetAll { .. }));

        let generic = RasterDataset::shared(materialize(&people)).filter(city_is("Delft"));
        let from_store = materialize(&pushed);
        assert_eq!(10, from_store.row_count());
        assert_eq!(materialize(&generic), from_store);
    }

    #[test]
    fn non_index_filter_uses_term() {
        let (_, people) = people();
        let old = Expression::binary(Binary::GreaterEqual, Expression::sibling("age"), Expression::literal(45));
        let pushed = people.filter(old);
        assert!(matches!(query_of(&pushed), Query::Filter { .. }));
        assert_eq!(5, materialize(&pushed).row_count());

        // Index only applies directly on the table.
        let pushed = people.limit(10).filter(city_is("Delft"));
        assert!(matches!(query_of(&pushed), Query::Filter { .. }));
        assert_eq!(3, materialize(&pushed).row_count());
    }

    #[test]
    fn calculate_select_and_paging() {
        let (_, people) = people();
        let out = people
            .calculate(vec![(
                Column::new("decade"),
                Expression::binary(Binary::Division, Expression::sibling("age"), Expression::literal(10)),
            )])
            .select_columns(tessera_core::column::columns(&["id", "decade", "nope"]))
            .offset(28);
        let raster = materialize(&out);
        assert_eq!(tessera_core::column::columns(&["id", "decade"]), raster.columns());
        assert_eq!(2, raster.row_count());
        assert_eq!(Value::from(4.8), raster.rows()[0][1]);
    }

    #[test]
    fn untranslatable_calculation_falls_back() {
        let (_, people) = people();
        let out = people.calculate(vec![(
            Column::new("shout"),
            Expression::binary(Binary::Concatenation, Expression::sibling("city"), Expression::literal("!")),
        )]);
        assert!(out.as_any().is_none());
        assert_eq!(Value::from("Utrecht!"), materialize(&out).rows()[0][3]);
    }

    #[test]
    fn union_and_distinct() {
        let (store, people) = people();
        let again = DocumentDataset::table(&store, "people").unwrap();
        let cities = tessera_core::column::columns(&["city"]);
        let out = people
            .select_columns(cities.clone())
            .union(again.select_columns(cities))
            .distinct();
        assert!(matches!(query_of(&out), Query::Distinct { .. }));
        assert_eq!(3, materialize(&out).row_count());
    }
}
