use std::fmt;
use std::sync::Arc;

use tessera_error::Result;
use tracing::debug;

use super::memory::{self, CalculationPlan};
use super::{DatasetRef, Dataset, Operation};
use crate::config::EngineConfig;
use crate::raster::Raster;
use crate::runtime::future::{Future, Satisfier};
use crate::runtime::job::Job;
use crate::runtime::parallel::parallel_map_reduce;
use crate::stream::{DeferredStream, RasterCallback, RasterFuture, StreamRef};
use crate::value::Value;

/// Applies one operation in memory to the materialized source.
///
/// The result is computed once and shared by every consumer of the dataset,
/// including its streams.
pub struct GenericDataset {
    source: DatasetRef,
    operation: Operation,
    config: Arc<EngineConfig>,
    future: Arc<RasterFuture>,
}

impl GenericDataset {
    pub fn new(source: DatasetRef, operation: Operation, config: Arc<EngineConfig>) -> Self {
        let time_limit = config.time_limit;
        let future = {
            let source = source.clone();
            let operation = operation.clone();
            let config = config.clone();
            let producer = move |job: &Job, satisfier: Satisfier<Result<Arc<Raster>>>| {
                execute(source, operation, config, job.clone(), satisfier)
            };
            match time_limit {
                Some(limit) => Future::with_time_limit(producer, limit),
                None => Future::new(producer),
            }
        };

        GenericDataset {
            source,
            operation,
            config,
            future: Arc::new(future),
        }
    }

    pub fn source(&self) -> &DatasetRef {
        &self.source
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

fn execute(
    source: DatasetRef,
    operation: Operation,
    config: Arc<EngineConfig>,
    job: Job,
    satisfier: Satisfier<Result<Arc<Raster>>>,
) {
    let source_job = job.clone();
    source.raster(
        &source_job,
        Box::new(move |result| {
            let raster = match result {
                Ok(raster) => raster,
                Err(e) => {
                    satisfier.satisfy(Err(e));
                    return;
                }
            };

            match operation.foreign().cloned() {
                Some(foreign) => {
                    let foreign_job = job.clone();
                    foreign.raster(
                        &foreign_job,
                        Box::new(move |result| match result {
                            Ok(other) => apply_local(
                                &raster,
                                &operation,
                                Some(other.as_ref()),
                                &job,
                                satisfier,
                            ),
                            Err(e) => satisfier.satisfy(Err(e)),
                        }),
                    );
                }
                None => apply_operation(raster, operation, &config, job, satisfier),
            }
        }),
    );
}

/// Filters and calculations over large inputs are spread over the job's
/// queue, everything else runs inline.
fn apply_operation(
    raster: Arc<Raster>,
    operation: Operation,
    config: &EngineConfig,
    job: Job,
    satisfier: Satisfier<Result<Arc<Raster>>>,
) {
    let chunk_size = config.parallel_chunk_size;
    if raster.row_count() <= chunk_size {
        apply_local(&raster, &operation, None, &job, satisfier);
        return;
    }

    match operation {
        Operation::Filter(condition) => {
            let condition = Arc::new(condition.prepare());
            let columns = raster.columns().to_vec();
            let map_columns = columns.clone();
            let (_, rows) = Arc::unwrap_or_clone(raster).into_parts();
            let future = parallel_map_reduce(
                rows,
                chunk_size,
                move |chunk: &[Vec<Value>]| memory::filter_rows(&map_columns, chunk, &condition),
                append_rows,
            );
            deliver_rows(future, columns, &job, satisfier);
        }
        Operation::Calculate(calculations) => {
            let plan = Arc::new(CalculationPlan::new(raster.columns(), &calculations));
            let source_columns = raster.columns().to_vec();
            let columns = plan.columns.clone();
            let (_, rows) = Arc::unwrap_or_clone(raster).into_parts();
            let future = parallel_map_reduce(
                rows,
                chunk_size,
                move |chunk: &[Vec<Value>]| plan.calculate_rows(&source_columns, chunk),
                append_rows,
            );
            deliver_rows(future, columns, &job, satisfier);
        }
        other => apply_local(&raster, &other, None, &job, satisfier),
    }
}

fn append_rows(
    mut rows: Vec<Vec<Value>>,
    acc: Option<Vec<Vec<Value>>>,
) -> Vec<Vec<Value>> {
    match acc {
        Some(mut acc) => {
            acc.append(&mut rows);
            acc
        }
        None => rows,
    }
}

fn deliver_rows(
    future: Future<Option<Vec<Vec<Value>>>>,
    columns: Vec<crate::column::Column>,
    job: &Job,
    satisfier: Satisfier<Result<Arc<Raster>>>,
) {
    future.get(Some(job), move |rows| {
        let result = Raster::try_new(columns, rows.unwrap_or_default()).map(Arc::new);
        satisfier.satisfy(result);
    });
}

fn apply_local(
    raster: &Raster,
    operation: &Operation,
    foreign: Option<&Raster>,
    job: &Job,
    satisfier: Satisfier<Result<Arc<Raster>>>,
) {
    let result = job.time(operation.name(), raster.row_count(), "rows", || {
        memory::apply(raster, operation, foreign)
    });
    match result {
        Some(result) => satisfier.satisfy(result.map(Arc::new)),
        None => debug!(job_id = job.id(), operation = operation.name(), "operation cancelled"),
    }
}

impl Dataset for GenericDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        self.future.get(Some(job), callback);
    }

    fn stream(&self) -> StreamRef {
        Arc::new(DeferredStream::with_batch_size(
            self.future.clone(),
            self.config.batch_size,
        ))
    }
}

impl fmt::Debug for GenericDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericDataset")
            .field("operation", &self.operation.name())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
