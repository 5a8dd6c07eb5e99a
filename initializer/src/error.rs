use std::{error::Error, fmt, io, time::Duration};

use crate::config::BackendKind;

/// The initializer's result type.
pub type Result<T> = std::result::Result<T, InitErr>;

/// Every condition that stops a worker from joining the job.
///
/// None of these are retried in-process, a supervisor relaunches the whole worker.
#[derive(Debug)]
pub enum InitErr {
    /// No accelerator could be found on this host.
    AcceleratorUnavailable,
    /// The seed was absent, zero or negative.
    InvalidSeed(Option<i64>),
    /// Not every rank joined before the deadline.
    RendezvousTimeout { endpoint: String, timeout: Duration },
    /// The model parallel size doesn't evenly divide the world size.
    TopologyMisconfiguration {
        world_size: usize,
        model_parallel_size: usize,
    },
    /// The supplied local rank disagrees with `rank % device_count`.
    LocalRankMismatch { local_rank: usize, expected: usize },
    /// The configured backend can't run in the current environment.
    BackendUnsupported {
        backend: BackendKind,
        reason: &'static str,
    },
    /// A named random stream was registered twice or looked up without being registered.
    RngStream(String),
    /// The coordinator reported a violation or sent an unexpected frame.
    Protocol(String),
    /// The configuration could not be loaded or is inconsistent.
    Config(String),
    Io(io::Error),
}

impl fmt::Display for InitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitErr::AcceleratorUnavailable => {
                f.write_str("accelerator unavailable: this job requires at least one device")
            }
            InitErr::InvalidSeed(Some(seed)) => {
                write!(f, "invalid seed: {seed} should be a positive integer")
            }
            InitErr::InvalidSeed(None) => {
                f.write_str("invalid seed: no seed given, it should be a positive integer")
            }
            InitErr::RendezvousTimeout { endpoint, timeout } => write!(
                f,
                "rendezvous timeout: not every rank joined tcp://{endpoint} within {timeout:?}"
            ),
            InitErr::TopologyMisconfiguration {
                world_size,
                model_parallel_size,
            } => write!(
                f,
                "model parallel size {model_parallel_size} doesn't divide world size {world_size}"
            ),
            InitErr::LocalRankMismatch {
                local_rank,
                expected,
            } => write!(
                f,
                "local rank mismatch: got {local_rank}, rank % device count is {expected}"
            ),
            InitErr::BackendUnsupported { backend, reason } => {
                write!(f, "backend {backend} unsupported: {reason}")
            }
            InitErr::RngStream(detail) => write!(f, "rng stream: {detail}"),
            InitErr::Protocol(detail) => write!(f, "rendezvous protocol error: {detail}"),
            InitErr::Config(detail) => write!(f, "invalid configuration: {detail}"),
            InitErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for InitErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InitErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for InitErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
