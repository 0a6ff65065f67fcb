use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    Result,
    data::ShardLoader,
    registry::BoxedModel,
    sink::ResultSink,
    task::{NamedMethod, Task},
};

/// Evaluation runtime of a single rank.
pub struct Worker {
    rank: usize,
    loader: ShardLoader,
    model: BoxedModel,
    methods: Vec<NamedMethod>,
    task: Task,
}

impl Worker {
    /// Creates a new `Worker`.
    ///
    /// # Arguments
    /// * `rank` - The rank this worker evaluates the shard of.
    /// * `loader` - Batches of the rank's shard.
    /// * `model` - The model replica owned by this worker.
    /// * `methods` - The attribution methods being evaluated.
    /// * `task` - What to compute for every batch.
    pub fn new(
        rank: usize,
        loader: ShardLoader,
        model: BoxedModel,
        methods: Vec<NamedMethod>,
        task: Task,
    ) -> Self {
        Self {
            rank,
            loader,
            model,
            methods,
            task,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Evaluates every batch of the shard and hands the results to `sink`.
    ///
    /// `cancel` is checked between batches, results already handed over are
    /// kept. `Done` is sent exactly once when the loop ends without errors.
    ///
    /// # Returns
    /// The amount of evaluated batches.
    pub async fn run<S: ResultSink>(&mut self, sink: &mut S, cancel: &CancellationToken) -> Result<usize> {
        let rank = self.rank;
        info!(rank = rank, samples = self.loader.len(); "starting {} over the shard", self.task.name());

        let mut batches = 0;
        loop {
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                info!(rank = rank, batches = batches; "stop requested, leaving the rest of the shard");
                break;
            }

            let Some(batch) = self.loader.next_batch() else {
                break;
            };
            let batch = batch?;

            let result = self
                .task
                .run_batch(&batch, self.model.as_ref(), &mut self.methods)?;
            batches += 1;

            if result.indices.is_empty() {
                debug!(rank = rank, batch = batches; "batch produced no rows");
                continue;
            }

            sink.partial(rank, result).await?;
        }

        sink.done(rank).await?;
        info!(rank = rank, batches = batches; "worker done");
        Ok(batches)
    }
}
