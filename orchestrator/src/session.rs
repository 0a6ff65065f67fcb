use std::{io, net::SocketAddr, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
    specs::WorkerSpec,
};
use log::{debug, info, warn};
use results::BatchResult;
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinSet,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use worker::{Registry, ResultSink, WorkerBuilder};

use crate::{
    OrchestratorError, Result,
    handler::{Flow, ResultHandler},
    spawner::{Spawner, WorkerExit},
};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

const EVENT_BUFFER: usize = 64;

/// How long a rank that lost its connection before `Done` may take to exit.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// What the connection readers forward to the receive loop.
enum Event {
    Connected { rank: usize, tx: NetTx },
    Partial { rank: usize, result: BatchResult },
    Done { rank: usize },
    Failed { rank: usize, detail: String },
    Closed { rank: usize },
}

impl Event {
    fn rank(&self) -> usize {
        match self {
            Self::Connected { rank, .. }
            | Self::Partial { rank, .. }
            | Self::Done { rank }
            | Self::Failed { rank, .. }
            | Self::Closed { rank } => *rank,
        }
    }
}

#[derive(Default)]
struct RankState {
    tx: Option<NetTx>,
    connected: bool,
    done: bool,
    exit: Option<WorkerExit>,
    error: Option<String>,
}

/// Drives one evaluation run over a group of workers.
pub struct Orchestrator<'a> {
    specs: Vec<WorkerSpec>,
    address: String,
    connect_timeout: Duration,
    registry: &'a Registry,
    spawner: &'a dyn Spawner,
}

impl<'a> Orchestrator<'a> {
    /// Creates a new `Orchestrator`.
    ///
    /// # Arguments
    /// * `specs` - One spec per rank, in rank order.
    /// * `address` - The rendezvous address workers connect to.
    /// * `connect_timeout` - How long to wait for every worker to connect.
    /// * `registry` - Component registry, used by an inline worker.
    /// * `spawner` - Starts the worker processes.
    pub fn new(
        specs: Vec<WorkerSpec>,
        address: impl Into<String>,
        connect_timeout: Duration,
        registry: &'a Registry,
        spawner: &'a dyn Spawner,
    ) -> Self {
        Self {
            specs,
            address: address.into(),
            connect_timeout,
            registry,
            spawner,
        }
    }

    pub fn world_size(&self) -> usize {
        self.specs.len()
    }

    /// Runs every worker to completion, feeding their results to `handler`.
    ///
    /// A single worker runs inline on the current task, otherwise one
    /// worker per rank is spawned and results are received over the network.
    ///
    /// # Errors
    /// A worker that goes away without reporting `Done` aborts the run with
    /// `OrchestratorError::FatalWorkerFailure`.
    pub async fn run<H: ResultHandler>(&self, handler: &mut H) -> Result<()> {
        match self.specs.as_slice() {
            [] => return Err(OrchestratorError::InvalidConfig("no workers to run".into())),
            [spec] => self.run_inline(spec, handler).await?,
            _ => self.run_distributed(handler).await?,
        }

        handler.finish()
    }

    async fn run_inline<H: ResultHandler>(&self, spec: &WorkerSpec, handler: &mut H) -> Result<()> {
        info!("running a single worker inline");

        let cancel = CancellationToken::new();
        let mut worker = WorkerBuilder::build(spec, self.registry)?;
        let mut sink = InlineSink {
            handler,
            cancel: &cancel,
            failure: None,
        };

        worker.run(&mut sink, &cancel).await?;
        match sink.failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_distributed<H: ResultHandler>(&self, handler: &mut H) -> Result<()> {
        let world_size = self.world_size();
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|source| OrchestratorError::ConnectionFailed {
                addr: self.address.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;
        info!("waiting for {world_size} workers on {addr}");

        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let acceptor = tokio::spawn(accept(listener, events_tx));

        let mut exits = JoinSet::new();
        for spec in &self.specs {
            let rank = spec.rank;
            let mut process = match self.spawner.spawn(addr, rank) {
                Ok(process) => process,
                Err(e) => {
                    acceptor.abort();
                    return Err(e.into());
                }
            };
            exits.spawn(async move { (rank, process.wait().await) });
        }

        let mut ranks: Vec<RankState> = (0..world_size).map(|_| RankState::default()).collect();
        let mut stopping = false;
        let mut lost: Option<(usize, Instant)> = None;
        let connect_deadline = Instant::now() + self.connect_timeout;

        let outcome = loop {
            if ranks.iter().all(|rank| rank.done) {
                break Ok(());
            }

            let connecting = ranks.iter().any(|rank| !rank.connected && !rank.done);
            let lost_deadline = lost.map_or(connect_deadline, |(_, deadline)| deadline);

            tokio::select! {
                Some(event) = events.recv() => {
                    match self.on_event(event, &mut ranks, handler, &mut stopping).await {
                        Ok(Some(rank)) if lost.is_none() => lost = Some((rank, Instant::now() + EXIT_GRACE)),
                        Ok(_) => {}
                        Err(e) => break Err(e),
                    }
                }
                Some(joined) = exits.join_next() => {
                    let (rank, exit) = match joined {
                        Ok(joined) => joined,
                        Err(e) => break Err(io::Error::other(e).into()),
                    };

                    let exit = match exit {
                        Ok(exit) => exit,
                        Err(e) => break Err(e.into()),
                    };

                    ranks[rank].exit = Some(exit);
                    if !ranks[rank].done {
                        break Err(fatal(rank, &ranks[rank]));
                    }
                }
                _ = sleep_until(connect_deadline), if connecting => {
                    let missing: Vec<usize> = (0..world_size)
                        .filter(|&rank| !ranks[rank].connected && !ranks[rank].done)
                        .collect();
                    break Err(OrchestratorError::Timeout(format!(
                        "workers {missing:?} didn't connect within {:?}",
                        self.connect_timeout
                    )));
                }
                _ = sleep_until(lost_deadline), if lost.is_some() => {
                    let Some((rank, _)) = lost else { continue };
                    if !ranks[rank].done {
                        break Err(fatal(rank, &ranks[rank]));
                    }
                    lost = None;
                }
                else => break Err(OrchestratorError::Io(io::Error::other("every worker went silent"))),
            }

            if let Some((rank, _)) = lost
                && ranks[rank].done
            {
                lost = None;
            }
        };

        acceptor.abort();
        outcome?;

        // Every rank is done, the exit codes are only informative from here on.
        let drain = async {
            while let Some(joined) = exits.join_next().await {
                if let Ok((rank, Ok(exit))) = joined
                    && !exit.success()
                {
                    warn!("worker {rank} exited with {:?} after reporting done", exit.code);
                }
            }
        };
        if tokio::time::timeout(EXIT_GRACE, drain).await.is_err() {
            warn!("some workers didn't exit after disconnecting");
        }

        info!("every worker is done");
        Ok(())
    }

    /// Applies one event to the run state.
    ///
    /// # Returns
    /// The rank whose connection closed before it reported `Done`, if any.
    async fn on_event<H: ResultHandler>(
        &self,
        event: Event,
        ranks: &mut [RankState],
        handler: &mut H,
        stopping: &mut bool,
    ) -> Result<Option<usize>> {
        if event.rank() >= ranks.len() {
            warn!("ignoring a message from unknown rank {}", event.rank());
            return Ok(None);
        }

        match event {
            Event::Connected { rank, mut tx } => {
                let Some(state) = ranks.get_mut(rank).filter(|state| !state.connected)
                else {
                    warn!("rejecting a connection claiming rank {rank}");
                    return Ok(None);
                };

                let create = Msg::Control(Command::CreateWorker(Box::new(self.specs[rank].clone())));
                if let Err(e) = tx.send(&create).await {
                    warn!("could not send its worker spec to rank {rank}: {e}");
                }

                if *stopping && let Err(e) = tx.send(&Msg::Control(Command::Stop)).await {
                    warn!("could not stop worker {rank}: {e}");
                }

                debug!(rank = rank; "worker connected");
                state.tx = Some(tx);
                state.connected = true;
            }
            Event::Partial { rank, result } => {
                if handler.handle(rank, result)? == Flow::Stop && !*stopping {
                    info!("stopping every worker");
                    *stopping = true;
                    broadcast_stop(ranks).await;
                }
            }
            Event::Done { rank } => {
                let state = &mut ranks[rank];
                state.done = true;
                info!(rank = rank; "worker done");

                if let Some(tx) = state.tx.as_mut()
                    && let Err(e) = tx.send(&Msg::Control(Command::Disconnect)).await
                {
                    warn!("could not disconnect worker {rank}: {e}");
                }
            }
            Event::Failed { rank, detail } => {
                warn!("worker {rank} reported an error: {detail}");
                ranks[rank].error = Some(detail);
            }
            Event::Closed { rank } => {
                let state = &mut ranks[rank];
                state.tx = None;
                if !state.done {
                    return Ok(Some(rank));
                }
            }
        }

        Ok(None)
    }
}

fn fatal(rank: usize, state: &RankState) -> OrchestratorError {
    OrchestratorError::FatalWorkerFailure {
        rank,
        exit: state.exit.and_then(|exit| exit.code),
        detail: state
            .error
            .clone()
            .unwrap_or_else(|| "the worker went away before reporting done".into()),
    }
}

async fn broadcast_stop(ranks: &mut [RankState]) {
    for (rank, state) in ranks.iter_mut().enumerate() {
        if state.done {
            continue;
        }

        if let Some(tx) = state.tx.as_mut()
            && let Err(e) = tx.send(&Msg::Control(Command::Stop)).await
        {
            warn!("could not stop worker {rank}: {e}");
        }
    }
}

/// Accepts worker connections and starts a reader for each one.
async fn accept(listener: TcpListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted a connection from {peer}");
                tokio::spawn(read_connection(stream, peer, events.clone()));
            }
            Err(e) => warn!("failed to accept a connection: {e}"),
        }
    }
}

/// Forwards everything one worker sends, in order, until its connection closes.
async fn read_connection(stream: TcpStream, peer: SocketAddr, events: mpsc::Sender<Event>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set nodelay for {peer}: {e}");
    }

    let (rx, tx) = stream.into_split();
    let (mut rx, tx): (NetRx, NetTx) = comms::channel(rx, tx);
    let mut buf: Vec<u32> = Vec::new();

    let rank = match rx.recv_into(&mut buf).await {
        Ok(Msg::Control(Command::Hello { rank })) => rank,
        Ok(other) => {
            warn!("{peer} didn't greet, sent {other:?}");
            return;
        }
        Err(e) => {
            warn!("{peer} went away before greeting: {e}");
            return;
        }
    };

    if events.send(Event::Connected { rank, tx }).await.is_err() {
        return;
    }

    loop {
        let event = match rx.recv_into(&mut buf).await {
            Ok(Msg::Data(Payload::Partial { header, values })) => {
                match BatchResult::from_wire(&header, values) {
                    Ok(result) => Event::Partial { rank, result },
                    Err(e) => Event::Failed {
                        rank,
                        detail: format!("malformed partial result: {e}"),
                    },
                }
            }
            Ok(Msg::Control(Command::Done { .. })) => Event::Done { rank },
            Ok(Msg::Err(detail)) => Event::Failed {
                rank,
                detail: detail.into_owned(),
            },
            Ok(other) => {
                warn!("ignoring unexpected message from worker {rank}: {other:?}");
                continue;
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("lost worker {rank}: {e}");
                }
                Event::Closed { rank }
            }
        };

        let closed = matches!(event, Event::Closed { .. });
        if events.send(event).await.is_err() || closed {
            return;
        }
    }
}

/// Feeds results of an inline worker straight into the handler.
struct InlineSink<'h, H: ResultHandler> {
    handler: &'h mut H,
    cancel: &'h CancellationToken,
    /// The first handler error, the worker is cancelled once it is set.
    failure: Option<OrchestratorError>,
}

impl<H: ResultHandler> ResultSink for InlineSink<'_, H> {
    async fn partial(&mut self, rank: usize, result: BatchResult) -> worker::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }

        match self.handler.handle(rank, result) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => self.cancel.cancel(),
            Err(e) => {
                self.failure = Some(e);
                self.cancel.cancel();
            }
        }

        Ok(())
    }

    async fn done(&mut self, rank: usize) -> worker::Result<()> {
        debug!(rank = rank; "inline worker done");
        Ok(())
    }
}
