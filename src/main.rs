use std::{env, path::PathBuf, process, sync::Arc};

use anyhow::{Context, bail};
use log::{error, info};
use orchestrator::{ProcessSpawner, configs::RunConfig};
use worker::Registry;

const USAGE: &str = "usage:
    attrbench run <config.json>
    attrbench worker <address> <rank>";

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = dispatch(&args).await {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn dispatch(args: &[String]) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::builtin());

    match args {
        [mode, config] if mode == "run" => run(config, &registry).await,
        [mode, address, rank] if mode == "worker" => {
            let rank = rank
                .parse()
                .with_context(|| format!("invalid rank {rank:?}"))?;
            worker::client::serve(address, rank, &registry)
                .await
                .with_context(|| format!("worker {rank} failed"))
        }
        _ => bail!("{USAGE}"),
    }
}

async fn run(path: &str, registry: &Registry) -> anyhow::Result<()> {
    let config = RunConfig::from_file(path)?;

    let program = match &config.worker_program {
        Some(program) => program.clone(),
        None => env::current_exe().context("cannot locate the worker executable")?,
    };
    let output: PathBuf = config.output.clone();

    let spawner = ProcessSpawner::new(program);
    orchestrator::evaluate(config, registry, &spawner).await?;

    info!("results saved to {}", output.display());
    println!("{}", output.display());
    Ok(())
}
