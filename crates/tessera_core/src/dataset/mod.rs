//! Lazy dataset algebra.
//!
//! A dataset is an immutable plan node. Operations return new datasets and
//! nothing is computed until `raster` or `stream` is requested. Each dataset
//! gets a chance to push an operation down into its own representation (for
//! example a SQL query), anything it can not handle is wrapped in a
//! [`GenericDataset`] which applies the operation in memory.

pub mod coalesce;
pub mod generic;
pub mod memory;
pub mod raster;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock};

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use tessera_error::{EngineError, Result};
use tracing::trace;

pub use self::coalesce::CoalescedDataset;
pub use self::generic::GenericDataset;
pub use self::raster::{RasterDataset, StreamDataset};
use crate::column::Column;
use crate::config::EngineConfig;
use crate::expr::{Expression, Function};
use crate::raster::Raster;
use crate::runtime::job::Job;
use crate::sql::SqlDataset;
use crate::stream::{ColumnsCallback, RasterCallback, StreamRef};

pub type DatasetRef = Arc<dyn Dataset>;

pub trait Dataset: Send + Sync + fmt::Debug {
    /// Materialize the dataset.
    fn raster(&self, job: &Job, callback: RasterCallback);

    /// Stream over the rows of the dataset.
    fn stream(&self) -> StreamRef;

    fn columns(&self, job: &Job, callback: ColumnsCallback) {
        self.raster(
            job,
            Box::new(move |result| callback(result.map(|r| r.columns().to_vec()))),
        )
    }

    /// Try to express `operation` natively.
    fn push_down(&self, _operation: &Operation) -> PushDown {
        PushDown::Fallback
    }

    /// The SQL query behind this dataset, if it is backed by one.
    fn as_sql(&self) -> Option<&SqlDataset> {
        None
    }

    /// Concrete dataset, for backends that recognize their own datasets.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// Result of offering an operation to a dataset.
#[derive(Debug)]
pub enum PushDown {
    /// The dataset incorporated the operation.
    Pushed(DatasetRef),
    /// The operation has to be applied in memory.
    Fallback,
}

/// Sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub expression: Expression,
    pub ascending: bool,
    /// Compare as numbers instead of strings.
    pub numeric: bool,
}

impl Order {
    pub fn new(expression: Expression, ascending: bool, numeric: bool) -> Self {
        Order {
            expression,
            ascending,
            numeric,
        }
    }

    pub fn ascending(column: impl Into<Column>) -> Self {
        Order::new(Expression::sibling(column), true, true)
    }

    pub fn descending(column: impl Into<Column>) -> Self {
        Order::new(Expression::sibling(column), false, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Left,
    Inner,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub foreign: DatasetRef,
    /// Condition evaluated with the left row as siblings and the foreign row
    /// as foreigns.
    pub condition: Expression,
}

/// Value column of an aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    pub map: Expression,
    pub reduce: Function,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub groups: Vec<(Column, Expression)>,
    pub values: Vec<(Column, Aggregator)>,
}

#[derive(Debug, Clone)]
pub enum Operation {
    Limit(usize),
    Offset(usize),
    Random(usize),
    Filter(Expression),
    Calculate(Vec<(Column, Expression)>),
    Sort(Vec<Order>),
    Distinct,
    Union(DatasetRef),
    Join(Join),
    SelectColumns(Vec<Column>),
    Transpose,
    Aggregate(Aggregation),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Limit(_) => "limit",
            Operation::Offset(_) => "offset",
            Operation::Random(_) => "random",
            Operation::Filter(_) => "filter",
            Operation::Calculate(_) => "calculate",
            Operation::Sort(_) => "sort",
            Operation::Distinct => "distinct",
            Operation::Union(_) => "union",
            Operation::Join(_) => "join",
            Operation::SelectColumns(_) => "select_columns",
            Operation::Transpose => "transpose",
            Operation::Aggregate(_) => "aggregate",
        }
    }

    /// Dataset that has to be materialized next to the source.
    pub fn foreign(&self) -> Option<&DatasetRef> {
        match self {
            Operation::Union(other) => Some(other),
            Operation::Join(join) => Some(&join.foreign),
            _ => None,
        }
    }
}

static DEFAULT_CONFIG: LazyLock<Arc<EngineConfig>> =
    LazyLock::new(|| Arc::new(EngineConfig::default()));

pub fn default_config() -> Arc<EngineConfig> {
    DEFAULT_CONFIG.clone()
}

/// Apply an operation to a dataset, pushing it down when possible.
pub fn apply_operation(
    dataset: &DatasetRef,
    operation: Operation,
    config: &Arc<EngineConfig>,
) -> DatasetRef {
    match dataset.push_down(&operation) {
        PushDown::Pushed(pushed) => {
            trace!(operation = operation.name(), "pushed down operation");
            pushed
        }
        PushDown::Fallback => {
            trace!(operation = operation.name(), "applying operation in memory");
            Arc::new(GenericDataset::new(dataset.clone(), operation, config.clone()))
        }
    }
}

/// Operation builders on dataset references.
pub trait DatasetExt {
    fn apply(&self, operation: Operation) -> DatasetRef;
    fn apply_with(&self, operation: Operation, config: &Arc<EngineConfig>) -> DatasetRef;
    fn coalesced(&self) -> DatasetRef;
    fn coalesced_with(&self, config: &Arc<EngineConfig>) -> DatasetRef;

    /// Block the current thread until the dataset is materialized.
    ///
    /// Fails if the job is cancelled before the raster is delivered.
    fn wait_raster(&self, job: &Job) -> Result<Arc<Raster>>;

    fn limit(&self, n: usize) -> DatasetRef {
        self.apply(Operation::Limit(n))
    }

    fn offset(&self, n: usize) -> DatasetRef {
        self.apply(Operation::Offset(n))
    }

    fn random(&self, n: usize) -> DatasetRef {
        self.apply(Operation::Random(n))
    }

    fn filter(&self, condition: Expression) -> DatasetRef {
        self.apply(Operation::Filter(condition))
    }

    fn calculate(&self, calculations: Vec<(Column, Expression)>) -> DatasetRef {
        self.apply(Operation::Calculate(calculations))
    }

    fn sort(&self, orders: Vec<Order>) -> DatasetRef {
        self.apply(Operation::Sort(orders))
    }

    fn distinct(&self) -> DatasetRef {
        self.apply(Operation::Distinct)
    }

    fn union(&self, other: DatasetRef) -> DatasetRef {
        self.apply(Operation::Union(other))
    }

    fn join(&self, join: Join) -> DatasetRef {
        self.apply(Operation::Join(join))
    }

    fn select_columns(&self, columns: Vec<Column>) -> DatasetRef {
        self.apply(Operation::SelectColumns(columns))
    }

    fn transpose(&self) -> DatasetRef {
        self.apply(Operation::Transpose)
    }

    fn aggregate(&self, aggregation: Aggregation) -> DatasetRef {
        self.apply(Operation::Aggregate(aggregation))
    }
}

impl DatasetExt for DatasetRef {
    fn apply(&self, operation: Operation) -> DatasetRef {
        apply_operation(self, operation, &DEFAULT_CONFIG)
    }

    fn apply_with(&self, operation: Operation, config: &Arc<EngineConfig>) -> DatasetRef {
        apply_operation(self, operation, config)
    }

    fn coalesced(&self) -> DatasetRef {
        self.coalesced_with(&DEFAULT_CONFIG)
    }

    fn coalesced_with(&self, config: &Arc<EngineConfig>) -> DatasetRef {
        Arc::new(CoalescedDataset::new(self.clone(), config.clone()))
    }

    fn wait_raster(&self, job: &Job) -> Result<Arc<Raster>> {
        let (tx, rx) = oneshot::channel();
        self.raster(
            job,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match futures::executor::block_on(rx) {
            Ok(result) => result,
            Err(_) => Err(EngineError::new("Dataset was cancelled before it was materialized")
                .with_field("job_id", job.id())),
        }
    }
}
