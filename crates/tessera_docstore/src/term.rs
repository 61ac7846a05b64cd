//! Query terms understood by the document store.
//!
//! Terms serialize to JSON so queries can be logged or shipped as is.

use serde::{Deserialize, Serialize};
use tessera_core::expr::{Binary, Function};
use tessera_core::value::Value;

use crate::document::{Document, field, json_to_value};

/// Term evaluating to a value for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "term", rename_all = "snake_case")]
pub enum ValueTerm {
    Datum {
        value: serde_json::Value,
    },
    Field {
        name: String,
    },
    Binary {
        op: Binary,
        lhs: Box<ValueTerm>,
        rhs: Box<ValueTerm>,
    },
    Call {
        function: Function,
        args: Vec<ValueTerm>,
    },
}

impl ValueTerm {
    pub fn datum(value: serde_json::Value) -> Self {
        ValueTerm::Datum { value }
    }

    pub fn field(name: impl Into<String>) -> Self {
        ValueTerm::Field { name: name.into() }
    }

    pub fn binary(op: Binary, lhs: ValueTerm, rhs: ValueTerm) -> Self {
        ValueTerm::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn evaluate(&self, document: &Document) -> Value {
        match self {
            ValueTerm::Datum { value } => json_to_value(Some(value)),
            ValueTerm::Field { name } => json_to_value(field(document, name)),
            ValueTerm::Binary { op, lhs, rhs } => {
                op.apply(&lhs.evaluate(document), &rhs.evaluate(document))
            }
            ValueTerm::Call { function, args } => {
                let args: Vec<Value> = args.iter().map(|a| a.evaluate(document)).collect();
                function.apply(&args)
            }
        }
    }
}

/// Term evaluating to a sequence of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    Table {
        name: String,
    },
    /// Documents of a table whose indexed field equals `key`.
    GetAll {
        table: String,
        index: String,
        key: serde_json::Value,
    },
    Filter {
        source: Box<Query>,
        predicate: ValueTerm,
    },
    /// Add or replace fields, every term sees the document before the merge.
    Merge {
        source: Box<Query>,
        fields: Vec<(String, ValueTerm)>,
    },
    /// Keep only the given fields. Documents lacking them are kept.
    Pluck {
        source: Box<Query>,
        fields: Vec<String>,
    },
    Limit {
        source: Box<Query>,
        n: usize,
    },
    Skip {
        source: Box<Query>,
        n: usize,
    },
    Sample {
        source: Box<Query>,
        n: usize,
    },
    Distinct {
        source: Box<Query>,
    },
    Union {
        source: Box<Query>,
        other: Box<Query>,
    },
}

impl Query {
    pub fn table(name: impl Into<String>) -> Self {
        Query::Table { name: name.into() }
    }

    /// Name of the table when the query reads a whole table.
    pub fn as_table(&self) -> Option<&str> {
        match self {
            Query::Table { name } => Some(name),
            _ => None,
        }
    }

    pub fn get_all(&self, index: impl Into<String>, key: serde_json::Value) -> Option<Query> {
        let table = self.as_table()?;
        Some(Query::GetAll {
            table: table.to_string(),
            index: index.into(),
            key,
        })
    }

    pub fn filter(&self, predicate: ValueTerm) -> Query {
        self.wrap(|source| Query::Filter { source, predicate })
    }

    pub fn merge(&self, fields: Vec<(String, ValueTerm)>) -> Query {
        self.wrap(|source| Query::Merge { source, fields })
    }

    pub fn pluck(&self, fields: Vec<String>) -> Query {
        self.wrap(|source| Query::Pluck { source, fields })
    }

    pub fn limit(&self, n: usize) -> Query {
        self.wrap(|source| Query::Limit { source, n })
    }

    pub fn skip(&self, n: usize) -> Query {
        self.wrap(|source| Query::Skip { source, n })
    }

    pub fn sample(&self, n: usize) -> Query {
        self.wrap(|source| Query::Sample { source, n })
    }

    pub fn distinct(&self) -> Query {
        self.wrap(|source| Query::Distinct { source })
    }

    pub fn union(&self, other: &Query) -> Query {
        let other = Box::new(other.clone());
        self.wrap(|source| Query::Union { source, other })
    }

    fn wrap(&self, build: impl FnOnce(Box<Query>) -> Query) -> Query {
        build(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn evaluate_terms() {
        let d = doc(json!({"a": 4, "s": "Hello"}));
        let gt = ValueTerm::binary(
            Binary::Greater,
            ValueTerm::field("a"),
            ValueTerm::datum(json!(3)),
        );
        assert_eq!(Value::Bool(true), gt.evaluate(&d));

        let upper = ValueTerm::Call {
            function: Function::Uppercase,
            args: vec![ValueTerm::field("s")],
        };
        assert_eq!(Value::from("HELLO"), upper.evaluate(&d));

        let missing = ValueTerm::field("zzz");
        assert_eq!(Value::Empty, missing.evaluate(&d));
    }

    #[test]
    fn serializes_as_tagged_json() {
        let query = Query::table("people").filter(ValueTerm::binary(
            Binary::Equal,
            ValueTerm::field("age"),
            ValueTerm::datum(json!(30)),
        ));
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!("filter", encoded["query"]);
        assert_eq!("table", encoded["source"]["query"]);
        assert_eq!("binary", encoded["predicate"]["term"]);
        assert_eq!("Equal", encoded["predicate"]["op"]);

        let decoded: Query = serde_json::from_value(encoded).unwrap();
        assert_eq!(query, decoded);
    }
}
