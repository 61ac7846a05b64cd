//! SQL backed datasets.

pub mod dataset;
pub mod dialect;
pub mod fragment;

pub use self::dataset::{SqlDatabase, SqlDataset, SqlIndex};
pub use self::dialect::{MySqlDialect, SqlDialect, StandardDialect};
pub use self::fragment::SqlFragment;
