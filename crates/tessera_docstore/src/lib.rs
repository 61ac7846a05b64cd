//! Document store backend.
//!
//! An in-process document server holding tables of JSON documents, queried
//! through a small term language. Datasets over the store translate filters,
//! calculations, projections and friends into terms, and use secondary
//! indexes for equality filters.

pub mod dataset;
pub mod document;
pub mod store;
pub mod stream;
pub mod term;
pub mod translate;

pub use self::dataset::DocumentDataset;
pub use self::document::Document;
pub use self::store::{Continuation, DocumentStore, Response};
pub use self::stream::DocumentStream;
pub use self::term::{Query, ValueTerm};
