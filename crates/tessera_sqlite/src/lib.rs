//! SQLite backed datasets.
//!
//! Tables are exposed as SQL datasets, so that filters, sorts, limits and
//! friends are compiled into the query sent to SQLite. Equality filters on
//! the leading column of an index are forced through that index.

mod client;
mod database;
mod dialect;
mod stream;

pub use self::client::SqliteClient;
pub use self::database::SqliteDatabase;
pub use self::dialect::SqliteDialect;
pub use self::stream::SqliteStream;
