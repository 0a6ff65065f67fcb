use std::{io, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg},
    specs::WorkerSpec,
};
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{Result, WorkerBuilder, WorkerErr, registry::Registry, sink::NetSink};

const CONNECT_ATTEMPTS: usize = 20;
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Connects to the orchestrator at `addr` and serves as worker `rank` until
/// it is told to disconnect.
///
/// # Arguments
/// * `addr` - The orchestrator's rendezvous address.
/// * `rank` - This worker's rank.
/// * `registry` - Where component names are resolved.
///
/// # Errors
/// Any failure is first reported to the orchestrator as an `Err` message.
pub async fn serve(addr: &str, rank: usize, registry: &Registry) -> Result<()> {
    let stream = connect(addr).await?;
    stream.set_nodelay(true)?;

    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);
    session(rank, registry, rx, tx).await
}

async fn connect(addr: &str) -> io::Result<TcpStream> {
    let mut backoff = Duration::from_millis(25);
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!("connection attempt {attempt} to {addr} failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs the worker side of the protocol over an established channel.
///
/// The worker greets with `Hello`, receives its spec, streams its partial
/// results followed by `Done` and then waits for `Disconnect`. A `Stop`
/// received meanwhile ends the evaluation after the current batch.
pub async fn session<R, W>(
    rank: usize,
    registry: &Registry,
    mut rx: FrameReceiver<R>,
    mut tx: FrameSender<W>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    tx.send(&Msg::Control(Command::Hello { rank })).await?;
    let mut sink = NetSink::new(tx);

    let spec = match wait_for_spec(rank, &mut rx).await {
        Ok(spec) => spec,
        Err(e) => return Err(report(&mut sink, e).await),
    };

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(listen(rank, rx, cancel.clone()));

    let outcome = match WorkerBuilder::build(&spec, registry) {
        Ok(mut worker) => worker.run(&mut sink, &cancel).await,
        Err(e) => Err(e),
    };

    if let Err(e) = outcome {
        listener.abort();
        return Err(report(&mut sink, e).await);
    }

    listener.await.map_err(io::Error::other)??;
    sink.shutdown().await?;
    info!(rank = rank; "disconnected");
    Ok(())
}

async fn report<W: AsyncWrite + Unpin>(sink: &mut NetSink<W>, e: WorkerErr) -> WorkerErr {
    error!("worker failed: {e}");
    if let Err(send_err) = sink.error(&e.to_string()).await {
        warn!("could not report the failure: {send_err}");
    }
    e
}

async fn wait_for_spec<R: AsyncRead + Unpin>(rank: usize, rx: &mut FrameReceiver<R>) -> Result<WorkerSpec> {
    let mut buf: Vec<u32> = Vec::new();

    match rx.recv_into(&mut buf).await? {
        Msg::Control(Command::CreateWorker(spec)) if spec.rank == rank => Ok(*spec),
        Msg::Control(Command::CreateWorker(spec)) => Err(WorkerErr::UnexpectedMessage(format!(
            "spec for rank {} sent to rank {rank}",
            spec.rank
        ))),
        Msg::Err(detail) => Err(WorkerErr::UnexpectedMessage(format!(
            "orchestrator error: {detail}"
        ))),
        other => Err(WorkerErr::UnexpectedMessage(format!("{other:?}"))),
    }
}

/// Control plane of a running worker.
///
/// Returns once the orchestrator disconnects, a lost orchestrator cancels the
/// evaluation.
async fn listen<R: AsyncRead + Unpin>(
    rank: usize,
    mut rx: FrameReceiver<R>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf: Vec<u32> = Vec::new();

    loop {
        match rx.recv_into(&mut buf).await {
            Ok(Msg::Control(Command::Stop)) => {
                debug!(rank = rank; "stop received");
                cancel.cancel();
            }
            Ok(Msg::Control(Command::Disconnect)) => return Ok(()),
            Ok(other) => warn!("ignoring unexpected message {other:?}"),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(rank = rank; "orchestrator closed the connection");
                cancel.cancel();
                return Ok(());
            }
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        }
    }
}
