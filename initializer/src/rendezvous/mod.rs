//! The TCP control plane every worker joins: a coordinator hosted by rank 0 and one
//! `Fabric` client per worker.

mod coordinator;
mod fabric;

use comms::{FrameReceiver, FrameSender};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub use coordinator::Coordinator;
pub use fabric::{Fabric, Rendezvous};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;
