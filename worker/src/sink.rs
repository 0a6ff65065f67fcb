use std::io;

use comms::{
    FrameSender,
    msg::{Command, Msg, Payload},
};
use log::debug;
use results::BatchResult;
use tokio::io::AsyncWrite;

use crate::Result;

/// Destination of a worker's results.
#[allow(unused)]
#[trait_variant::make(ResultSink: Send)]
pub trait LocalResultSink {
    /// Hands over the results of one batch.
    ///
    /// # Arguments
    /// * `rank` - The producing worker.
    /// * `result` - The batch results, tagged with their global indices.
    async fn partial(&mut self, rank: usize, result: BatchResult) -> Result<()>;

    /// Signals that `rank` won't produce any more results.
    async fn done(&mut self, rank: usize) -> Result<()>;
}

/// Streams results to the orchestrator over the network.
pub struct NetSink<W: AsyncWrite + Unpin> {
    tx: FrameSender<W>,
}

impl<W: AsyncWrite + Unpin> NetSink<W> {
    pub fn new(tx: FrameSender<W>) -> Self {
        Self { tx }
    }

    /// Reports a failure, the last message of a failing worker.
    pub async fn error(&mut self, detail: &str) -> io::Result<()> {
        self.tx.send(&Msg::Err(detail.into())).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}

impl<W: AsyncWrite + Unpin + Send> ResultSink for NetSink<W> {
    async fn partial(&mut self, rank: usize, result: BatchResult) -> Result<()> {
        let (header, values) = result.to_wire(rank);
        debug!(rank = rank, rows = header.indices.len(), values = values.len(); "sending partial result");

        let msg = Msg::Data(Payload::Partial {
            header,
            values: &values,
        });
        self.tx.send(&msg).await?;
        Ok(())
    }

    async fn done(&mut self, rank: usize) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Done { rank })).await?;
        Ok(())
    }
}
