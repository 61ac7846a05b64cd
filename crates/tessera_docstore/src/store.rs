//! In-process document server.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::index;
use tessera_core::config::DEFAULT_BATCH_SIZE;
use tessera_core::runtime::job::Job;
use tessera_core::value::Value;
use tessera_error::{EngineError, Result};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::document::{Document, field, json_to_value, store_value};
use crate::term::Query;

/// Field every document is keyed on. Always indexed.
pub const PRIMARY_KEY: &str = "id";

pub type ResponseCallback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// One page of query results.
#[derive(Debug)]
pub struct Response {
    pub documents: Vec<Document>,
    /// Handle for the next page, None on the last one.
    pub continuation: Option<Continuation>,
}

impl Response {
    fn paged(documents: Vec<Document>, batch_size: usize) -> Response {
        Continuation {
            remaining: documents.into_iter(),
            batch_size,
        }
        .into_response()
    }
}

pub struct Continuation {
    remaining: std::vec::IntoIter<Document>,
    batch_size: usize,
}

impl Continuation {
    /// Request the next page.
    pub fn next(self, job: &Job, callback: ResponseCallback) {
        job.spawn(move || callback(Ok(self.into_response())));
    }

    fn into_response(mut self) -> Response {
        let documents: Vec<Document> = self.remaining.by_ref().take(self.batch_size).collect();
        let continuation = if self.remaining.len() > 0 { Some(self) } else { None };
        Response {
            documents,
            continuation,
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

#[derive(Debug)]
struct Table {
    documents: Vec<Document>,
    indexes: BTreeSet<String>,
}

#[derive(Debug)]
pub struct DocumentStore {
    tables: RwLock<HashMap<String, Table>>,
    batch_size: usize,
}

impl DocumentStore {
    pub fn new() -> Arc<Self> {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Arc<Self> {
        Arc::new(DocumentStore {
            tables: RwLock::new(HashMap::new()),
            batch_size: batch_size.max(1),
        })
    }

    pub fn create_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(EngineError::new("Table already exists").with_field("table", name));
        }
        tables.insert(
            name.to_string(),
            Table {
                documents: Vec::new(),
                indexes: BTreeSet::from([PRIMARY_KEY.to_string()]),
            },
        );
        debug!(table = name, "created document table");
        Ok(())
    }

    pub fn create_index(&self, table: &str, field: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let table_ref = tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table))?;
        table_ref.indexes.insert(field.to_string());
        Ok(())
    }

    /// Insert documents, assigning a random primary key to those without
    /// one. Returns the primary keys of the inserted documents.
    pub fn insert(
        &self,
        table: &str,
        documents: impl IntoIterator<Item = Document>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut tables = self.tables.write();
        let table_ref = tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table))?;

        let mut keys = Vec::new();
        for mut document in documents {
            let key = document
                .entry(PRIMARY_KEY)
                .or_insert_with(|| serde_json::Value::String(Uuid::new_v4().to_string()))
                .clone();
            keys.push(key);
            table_ref.documents.push(document);
        }
        trace!(table, inserted = keys.len(), "inserted documents");
        Ok(keys)
    }

    pub fn indexes(&self, table: &str) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let table_ref = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(table_ref.indexes.iter().cloned().collect())
    }

    /// Every field name occurring in the table, sorted.
    pub fn fields(&self, table: &str) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let table_ref = tables.get(table).ok_or_else(|| missing_table(table))?;
        let fields: BTreeSet<&String> = table_ref
            .documents
            .iter()
            .flat_map(|doc| doc.keys())
            .collect();
        Ok(fields.into_iter().cloned().collect())
    }

    /// Run `query` on the job's queue, answering with its first page.
    pub fn run(self: &Arc<Self>, query: Query, job: &Job, callback: ResponseCallback) {
        let store = self.clone();
        job.spawn(move || {
            let result = store
                .evaluate(&query)
                .map(|documents| Response::paged(documents, store.batch_size));
            callback(result)
        });
    }

    pub fn evaluate(&self, query: &Query) -> Result<Vec<Document>> {
        let documents: Vec<Document> = match query {
            Query::Table { name } => {
                let tables = self.tables.read();
                let table = tables.get(name).ok_or_else(|| missing_table(name))?;
                table.documents.clone()
            }
            Query::GetAll { table, index, key } => {
                let tables = self.tables.read();
                let table_ref = tables.get(table).ok_or_else(|| missing_table(table))?;
                if !table_ref.indexes.contains(index) {
                    return Err(EngineError::new("Missing index")
                        .with_field("table", table)
                        .with_field("index", index));
                }
                let key = json_to_value(Some(key));
                table_ref
                    .documents
                    .iter()
                    .filter(|doc| is_true(&json_to_value(field(doc, index)).equals(&key)))
                    .cloned()
                    .collect()
            }
            Query::Filter { source, predicate } => {
                let mut documents = self.evaluate(source)?;
                documents.retain(|doc| is_true(&predicate.evaluate(doc)));
                documents
            }
            Query::Merge { source, fields } => {
                let mut documents = self.evaluate(source)?;
                for doc in &mut documents {
                    let values: Vec<serde_json::Value> = fields
                        .iter()
                        .map(|(_, term)| store_value(&term.evaluate(doc)))
                        .collect();
                    for ((name, _), value) in fields.iter().zip(values) {
                        doc.insert(name.clone(), value);
                    }
                }
                documents
            }
            Query::Pluck { source, fields } => self
                .evaluate(source)?
                .into_iter()
                .map(|doc| {
                    fields
                        .iter()
                        .filter_map(|name| field(&doc, name).map(|v| (name.clone(), v.clone())))
                        .collect::<Document>()
                })
                .collect(),
            Query::Limit { source, n } => {
                let mut documents = self.evaluate(source)?;
                documents.truncate(*n);
                documents
            }
            Query::Skip { source, n } => {
                let mut documents = self.evaluate(source)?;
                documents.drain(..(*n).min(documents.len()));
                documents
            }
            Query::Sample { source, n } => {
                let documents = self.evaluate(source)?;
                let amount = (*n).min(documents.len());
                let mut picked = index::sample(&mut rand::rng(), documents.len(), amount).into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| documents[i].clone()).collect()
            }
            Query::Distinct { source } => {
                let mut seen = HashSet::new();
                self.evaluate(source)?
                    .into_iter()
                    .enumerate()
                    .filter(|(idx, doc)| seen.insert(document_key(doc, *idx)))
                    .map(|(_, doc)| doc)
                    .collect()
            }
            Query::Union { source, other } => {
                let mut documents = self.evaluate(source)?;
                documents.extend(self.evaluate(other)?);
                documents
            }
        };
        Ok(documents)
    }
}

fn missing_table(table: &str) -> EngineError {
    EngineError::new("Missing table").with_field("table", table)
}

fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

/// Key under which equal documents collide. Null fields count as missing,
/// numbers compare by value and invalid values never collide.
fn document_key(document: &Document, position: usize) -> Vec<(String, String)> {
    let mut key: Vec<(String, String)> = document
        .iter()
        .filter_map(|(name, json)| {
            let value = match json_to_value(Some(json)) {
                Value::Empty => return None,
                Value::Invalid => format!("\0i{position}"),
                other => match other.double_value() {
                    Some(d) => format!("\0n{d}"),
                    None => other.string_value().unwrap_or_default(),
                },
            };
            Some((name.to_lowercase(), value))
        })
        .collect();
    key.sort();
    key
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_core::runtime::scheduler::Qos;

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    fn people() -> Arc<DocumentStore> {
        let store = DocumentStore::with_batch_size(2);
        store.create_table("people").unwrap();
        store.create_index("people", "city").unwrap();
        store
            .insert(
                "people",
                vec![
                    doc(json!({"id": 1, "name": "ann", "city": "Utrecht", "age": 31})),
                    doc(json!({"id": 2, "name": "bob", "city": "Delft", "age": 25})),
                    doc(json!({"id": 3, "name": "cas", "city": "Utrecht", "age": 47})),
                    doc(json!({"name": "dee", "city": "Gouda"})),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn insert_assigns_keys() {
        let store = people();
        let docs = store.evaluate(&Query::table("people")).unwrap();
        assert_eq!(4, docs.len());
        let key = docs[3].get(PRIMARY_KEY).unwrap().as_str().unwrap();
        assert!(Uuid::parse_str(key).is_ok());
        assert_eq!(vec!["age", "city", "id", "name"], store.fields("people").unwrap());
        assert_eq!(vec!["city", "id"], store.indexes("people").unwrap());
    }

    #[test]
    fn get_all_uses_index() {
        let store = people();
        let query = Query::table("people").get_all("city", json!("Utrecht")).unwrap();
        assert_eq!(2, store.evaluate(&query).unwrap().len());

        let unindexed = Query::table("people").get_all("name", json!("ann")).unwrap();
        assert!(store.evaluate(&unindexed).is_err());
    }

    #[test]
    fn pluck_skip_distinct() {
        let store = people();
        let query = Query::table("people").pluck(vec!["city".to_string()]).skip(1).distinct();
        let docs = store.evaluate(&query).unwrap();
        let cities: Vec<_> = docs.iter().map(|d| d["city"].clone()).collect();
        assert_eq!(vec![json!("Delft"), json!("Utrecht"), json!("Gouda")], cities);
    }

    #[test]
    fn pages_through_continuations() {
        let store = people();
        let job = Job::new(Qos::UserInitiated);
        let (tx, rx) = std::sync::mpsc::channel();
        store.run(Query::table("people"), &job, Box::new(move |r| tx.send(r).unwrap()));
        let first = rx.recv().unwrap().unwrap();
        assert_eq!(2, first.documents.len());

        let (tx, rx) = std::sync::mpsc::channel();
        first.continuation.unwrap().next(&job, Box::new(move |r| tx.send(r).unwrap()));
        let second = rx.recv().unwrap().unwrap();
        assert_eq!(2, second.documents.len());
        assert!(second.continuation.is_none());
    }

    #[test]
    fn missing_table_fails() {
        let store = people();
        let err = store.evaluate(&Query::table("nope")).unwrap_err();
        assert_eq!(Some("nope"), err.get_field("table"));
    }
}
