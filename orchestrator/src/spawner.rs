//! Ways of starting the worker of every rank.

use std::{
    io,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
    thread,
};

use futures::{FutureExt, future::BoxFuture};
use log::{error, info};
use tokio::{process::Command, sync::oneshot};
use worker::Registry;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the worker was killed or vanished without a code.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running worker that can be waited on.
pub trait WorkerProcess: Send {
    fn wait(&mut self) -> BoxFuture<'_, io::Result<WorkerExit>>;
}

/// Starts the worker of a rank, pointed at the orchestrator's address.
pub trait Spawner: Send + Sync {
    fn spawn(&self, addr: SocketAddr, rank: usize) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Spawns every worker as a child process running `<program> worker <addr> <rank>`.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl WorkerProcess for tokio::process::Child {
    fn wait(&mut self) -> BoxFuture<'_, io::Result<WorkerExit>> {
        async move {
            let status = tokio::process::Child::wait(self).await?;
            Ok(WorkerExit {
                code: status.code(),
            })
        }
        .boxed()
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, addr: SocketAddr, rank: usize) -> io::Result<Box<dyn WorkerProcess>> {
        let child = Command::new(&self.program)
            .arg("worker")
            .arg(addr.to_string())
            .arg(rank.to_string())
            .kill_on_drop(true)
            .spawn()?;

        info!(rank = rank; "spawned worker process {}", child.id().unwrap_or_default());
        Ok(Box::new(child))
    }
}

/// Runs every worker on its own thread of the current process.
///
/// Exit codes mimic a process: `0` on success, `1` on error and `101` on panic.
#[derive(Debug, Clone)]
pub struct ThreadSpawner {
    registry: Arc<Registry>,
}

impl ThreadSpawner {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

struct WorkerThread {
    exit: Option<oneshot::Receiver<i32>>,
}

impl WorkerProcess for WorkerThread {
    fn wait(&mut self) -> BoxFuture<'_, io::Result<WorkerExit>> {
        async move {
            let code = match self.exit.take() {
                Some(exit) => exit.await.ok(),
                None => None,
            };
            Ok(WorkerExit { code })
        }
        .boxed()
    }
}

fn run_thread(addr: SocketAddr, rank: usize, registry: &Registry) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("worker {rank} could not start its runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(worker::client::serve(&addr.to_string(), rank, registry)) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker {rank} failed: {e}");
            1
        }
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, addr: SocketAddr, rank: usize) -> io::Result<Box<dyn WorkerProcess>> {
        let registry = Arc::clone(&self.registry);
        let (tx, rx) = oneshot::channel();

        thread::Builder::new()
            .name(format!("worker-{rank}"))
            .spawn(move || {
                let code = catch_unwind(AssertUnwindSafe(|| run_thread(addr, rank, &registry)))
                    .unwrap_or(101);
                let _ = tx.send(code);
            })?;

        Ok(Box::new(WorkerThread { exit: Some(rx) }))
    }
}
