use std::sync::Arc;

use super::{Dataset, DatasetRef};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::raster::Raster;
use crate::runtime::job::Job;
use crate::stream::{RasterCallback, RasterFuture, RasterStream, StreamRef, collect_future};

/// Dataset over a raster that is already in memory.
#[derive(Debug)]
pub struct RasterDataset {
    raster: Arc<Raster>,
    batch_size: usize,
}

impl RasterDataset {
    pub fn new(raster: Arc<Raster>) -> Self {
        RasterDataset {
            raster,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(raster: Arc<Raster>, batch_size: usize) -> Self {
        RasterDataset { raster, batch_size }
    }

    pub fn shared(raster: Raster) -> DatasetRef {
        Arc::new(Self::new(Arc::new(raster)))
    }
}

impl Dataset for RasterDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        let raster = self.raster.clone();
        job.spawn(move || callback(Ok(raster)));
    }

    fn stream(&self) -> StreamRef {
        Arc::new(RasterStream::with_batch_size(
            self.raster.clone(),
            self.batch_size,
        ))
    }
}

/// Dataset reading from a stream.
///
/// Materialization collects a private clone of the stream once. Each call to
/// `stream` hands out a fresh cursor.
pub struct StreamDataset {
    stream: StreamRef,
    future: Arc<RasterFuture>,
}

impl StreamDataset {
    pub fn new(stream: StreamRef) -> Self {
        let future = Arc::new(collect_future(stream.clone_stream()));
        StreamDataset { stream, future }
    }
}

impl Dataset for StreamDataset {
    fn raster(&self, job: &Job, callback: RasterCallback) {
        self.future.get(Some(job), callback);
    }

    fn stream(&self) -> StreamRef {
        self.stream.clone_stream()
    }
}

impl std::fmt::Debug for StreamDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDataset")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::columns;
    use crate::dataset::DatasetExt;
    use crate::dataset::testutil::materialize;

    #[test]
    fn stream_dataset_round_trip() {
        let raster =
            Raster::from_rows(columns(&["x"]), (0..600).map(|i| vec![i])).unwrap();
        let stream = Arc::new(RasterStream::with_batch_size(Arc::new(raster.clone()), 100));
        let dataset: DatasetRef = Arc::new(StreamDataset::new(stream));

        assert_eq!(raster, materialize(&dataset));
        assert_eq!(10, materialize(&dataset.limit(10)).row_count());
    }
}
