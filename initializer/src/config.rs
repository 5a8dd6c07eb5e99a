use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{InitErr, Result};

const DEFAULT_MASTER_ADDR: &str = "localhost";
const DEFAULT_MASTER_PORT: u16 = 6000;
const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_SEED: i64 = 1234;

/// The transports a worker can rendezvous with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Gloo,
    Nccl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Gloo => "gloo",
            BackendKind::Nccl => "nccl",
        })
    }
}

/// How strictly `local_rank == rank % device_count` is enforced.
///
/// Heterogeneous launchers may hand out local ranks that don't follow the round robin layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalRankCheck {
    #[default]
    Relaxed,
    Strict,
}

/// The resolved configuration of a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: Option<usize>,
    pub model_parallel_size: usize,
    pub seed: Option<i64>,
    pub distributed_backend: BackendKind,
    pub master_addr: String,
    pub master_port: u16,
    pub rendezvous_timeout_ms: u64,
    pub require_accelerator: bool,
    pub local_rank_check: LocalRankCheck,
    pub resume_budget_secs: Option<u64>,
    pub telemetry_dir: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: None,
            model_parallel_size: 1,
            seed: Some(DEFAULT_SEED),
            distributed_backend: BackendKind::Nccl,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            rendezvous_timeout_ms: DEFAULT_RENDEZVOUS_TIMEOUT.as_millis() as u64,
            require_accelerator: true,
            local_rank_check: LocalRankCheck::Relaxed,
            resume_budget_secs: None,
            telemetry_dir: None,
        }
    }
}

impl Configuration {
    /// Loads a configuration from a JSON file, missing keys take their default value.
    ///
    /// # Errors
    /// Returns `InitErr::Config` if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| InitErr::Config(format!("cannot read '{}': {e}", path.display())))?;

        Self::from_json(&content)
    }

    /// Parses a configuration from a JSON document.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| InitErr::Config(format!("invalid JSON: {e}")))
    }

    /// Applies the launcher's environment variables on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides looked up by environment variable name.
    ///
    /// # Arguments
    /// * `lookup` - Resolves `RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `MASTER_ADDR` and `MASTER_PORT`.
    ///
    /// # Errors
    /// Returns `InitErr::Config` if a numeric variable doesn't parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(rank) = parse_var(&lookup, "RANK")? {
            self.rank = rank;
        }
        if let Some(world_size) = parse_var(&lookup, "WORLD_SIZE")? {
            self.world_size = world_size;
        }
        if let Some(local_rank) = parse_var(&lookup, "LOCAL_RANK")? {
            self.local_rank = Some(local_rank);
        }
        if let Some(addr) = lookup("MASTER_ADDR") {
            self.master_addr = addr;
        }
        if let Some(port) = parse_var(&lookup, "MASTER_PORT")? {
            self.master_port = port;
        }

        Ok(())
    }

    /// Checks the values that don't need any other subsystem to be validated.
    ///
    /// Seed and topology checks happen in their own phases.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(InitErr::Config("world_size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(InitErr::Config(format!(
                "rank {} is out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        if self.model_parallel_size == 0 {
            return Err(InitErr::Config(
                "model_parallel_size must be at least 1".into(),
            ));
        }
        if self.master_addr.is_empty() {
            return Err(InitErr::Config("master_addr must not be empty".into()));
        }

        Ok(())
    }

    /// The `host:port` pair every rank meets at.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    /// The bounded wait for the whole world to join.
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| InitErr::Config(format!("{key}={raw:?}: {e}")))
}
