use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use comms::specs::{ComponentSpec, TaskSpec};
use serde::{Deserialize, Serialize};

use crate::{OrchestratorError, Result};

fn default_address() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    12355
}

fn default_connect_timeout() -> u64 {
    60
}

/// Everything a run is configured with, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Rendezvous host, workers connect to `address:port`.
    #[serde(default = "default_address")]
    pub address: String,
    /// Rendezvous port, `0` picks a free one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// One worker is spawned per device.
    pub devices: Vec<usize>,
    pub batch_size: usize,
    pub model: ComponentSpec,
    pub dataset: ComponentSpec,
    #[serde(default)]
    pub methods: BTreeMap<String, ComponentSpec>,
    pub task: TaskSpec,
    /// Where the results are written.
    pub output: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    /// The program spawned as `<program> worker <addr> <rank>`, defaults to
    /// the running executable.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl RunConfig {
    /// Reads a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;

        serde_json::from_str(&text).map_err(|e| {
            OrchestratorError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The address the orchestrator listens on.
    pub fn rendezvous(&self) -> String {
        match self.address.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }
}
