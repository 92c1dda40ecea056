//! Async data loader with ordered background prefetch

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use super::batching::{load_batch, DetectionBatch};
use super::Dataset;
use crate::error::{Error, Result};

/// Streams shuffled batches of a dataset, one stream per epoch
pub struct DataLoader<D: Dataset + 'static> {
    dataset: Arc<D>,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
}

impl<D: Dataset + 'static> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, batch_size: usize, num_workers: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("Batch size must be positive"));
        }
        info!(
            "Creating DataLoader with batch_size={}, num_workers={}, seed={}",
            batch_size, num_workers, seed
        );

        Ok(Self {
            dataset,
            batch_size,
            num_workers,
            seed,
        })
    }

    /// Number of batches per epoch, the last one possibly short
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample order of an epoch
    ///
    /// Depends only on the seed and the epoch index.
    pub fn epoch_order(&self, epoch_index: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch_index));
        indices.shuffle(&mut rng);
        indices
    }

    /// Start streaming the batches of an epoch
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self))]
    pub fn epoch_stream(&self, epoch_index: usize) -> DataLoaderStream {
        let batches: Vec<Vec<usize>> = self
            .epoch_order(epoch_index)
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        debug!("Epoch {} split into {} batches", epoch_index, batches.len());

        DataLoaderStream::new(self.dataset.clone(), batches, self.num_workers, epoch_index)
    }
}

fn epoch_seed(seed: u64, epoch_index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(epoch_index as u64)
}

/// Stream of an epoch's batches, in shuffle order
pub struct DataLoaderStream {
    receiver: mpsc::Receiver<Result<DetectionBatch>>,
    batches_processed: usize,
    total_batches: usize,
    epoch: usize,
}

impl DataLoaderStream {
    fn new<D: Dataset + 'static>(
        dataset: Arc<D>,
        batches: Vec<Vec<usize>>,
        num_workers: usize,
        epoch: usize,
    ) -> Self {
        let total_batches = batches.len();
        let in_flight = num_workers.max(1);
        let (sender, receiver) = mpsc::channel(in_flight);

        tokio::spawn(Self::producer(dataset, batches, in_flight, sender));

        Self {
            receiver,
            batches_processed: 0,
            total_batches,
            epoch,
        }
    }

    /// Decode batches on the blocking pool, at most `in_flight` at once,
    /// and forward them in order. Stops after the first failure.
    async fn producer<D: Dataset + 'static>(
        dataset: Arc<D>,
        batches: Vec<Vec<usize>>,
        in_flight: usize,
        sender: mpsc::Sender<Result<DetectionBatch>>,
    ) {
        let mut loads = stream::iter(batches.into_iter().map(|indices| {
            let dataset = dataset.clone();
            tokio::task::spawn_blocking(move || load_batch(dataset.as_ref(), &indices))
        }))
        .buffered(in_flight);

        while let Some(joined) = loads.next().await {
            let batch = joined.unwrap_or_else(|e| {
                Err(Error::internal(format!("batch loading task failed: {e}")))
            });
            let failed = batch.is_err();
            if let Err(e) = &batch {
                error!("Batch loading failed: {}", e);
            }
            if sender.send(batch).await.is_err() {
                debug!("Batch receiver dropped, stopping producer");
                break;
            }
            if failed {
                break;
            }
        }
    }

    /// Get the number of batches processed
    pub fn batches_processed(&self) -> usize {
        self.batches_processed
    }

    /// Get the total number of batches
    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Get the epoch index
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Stream for DataLoaderStream {
    type Item = Result<DetectionBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(batch)) => {
                self.batches_processed += 1;
                Poll::Ready(Some(batch))
            }
            Poll::Ready(None) => {
                debug!(
                    "Epoch {} stream finished: {}/{} batches",
                    self.epoch, self.batches_processed, self.total_batches
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
