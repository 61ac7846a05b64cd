pub mod column;
pub mod config;
pub mod dataset;
pub mod expr;
pub mod raster;
pub mod runtime;
pub mod sql;
pub mod stream;
pub mod value;
