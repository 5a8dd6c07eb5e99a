use std::{io, time::Duration};

use comms::msg::{Command, Msg, WORLD_GROUP};
use log::{debug, info};
use tokio::{net::TcpStream, task::JoinHandle, time};

use super::{Coordinator, NetRx, NetTx};
use crate::{
    error::{InitErr, Result},
    group::{Collective, ProcessGroup},
};

const MIN_CONNECT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Where and how a single rank meets the rest of the world.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    pub endpoint: String,
    pub rank: usize,
    pub world_size: usize,
    pub timeout: Duration,
}

impl Rendezvous {
    /// The init method string as launchers print it.
    pub fn init_method(&self) -> String {
        format!("tcp://{}", self.endpoint)
    }
}

/// A worker's connection to the job-wide control plane.
pub struct Fabric {
    rank: usize,
    world_size: usize,
    rx: NetRx,
    tx: NetTx,
    buf: Vec<u8>,
    coordinator: Option<JoinHandle<io::Result<()>>>,
}

impl Fabric {
    /// Joins the job, hosting the coordinator when this is rank 0.
    ///
    /// Connecting is retried until the deadline since rank 0 may still be starting up, the
    /// whole join is a single bounded wait.
    ///
    /// # Errors
    /// `InitErr::RendezvousTimeout` if not every rank joined in time, `InitErr::Protocol` if the
    /// coordinator refused this rank.
    pub async fn join(rdzv: &Rendezvous) -> Result<Self> {
        let coordinator = if rdzv.rank == 0 {
            let coordinator = Coordinator::bind(&rdzv.endpoint, rdzv.world_size).await?;
            Some(coordinator.spawn())
        } else {
            None
        };

        match time::timeout(rdzv.timeout, Self::handshake(rdzv)).await {
            Ok(Ok((rx, tx))) => Ok(Self {
                rank: rdzv.rank,
                world_size: rdzv.world_size,
                rx,
                tx,
                buf: Vec::new(),
                coordinator,
            }),
            Ok(Err(e)) => {
                abort(coordinator);
                Err(e)
            }
            Err(_) => {
                abort(coordinator);
                Err(InitErr::RendezvousTimeout {
                    endpoint: rdzv.endpoint.clone(),
                    timeout: rdzv.timeout,
                })
            }
        }
    }

    async fn handshake(rdzv: &Rendezvous) -> Result<(NetRx, NetTx)> {
        let stream = connect_retrying(&rdzv.endpoint).await;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);

        let msg = Msg::Control(Command::Join {
            rank: rdzv.rank,
            world_size: rdzv.world_size,
        });
        tx.send(&msg).await?;
        debug!(rank = rdzv.rank; "join sent, waiting for the rest of the world");

        let mut buf = Vec::new();
        match recv_control(&mut rx, &mut buf).await? {
            Command::Welcome { world_size } if world_size == rdzv.world_size => Ok((rx, tx)),
            other => Err(InitErr::Protocol(format!("expected welcome, got {other:?}"))),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The group every rank belongs to.
    pub fn world(&self) -> ProcessGroup {
        ProcessGroup::new(WORLD_GROUP, (0..self.world_size).collect())
    }

    /// Collectively creates a group, every rank must call this with the same `ranks` and in
    /// the same order, members or not.
    pub async fn new_group(&mut self, ranks: Vec<usize>) -> Result<ProcessGroup> {
        let msg = Msg::Control(Command::NewGroup {
            ranks: ranks.clone(),
        });
        self.tx.send(&msg).await?;

        match self.recv().await? {
            Command::GroupCreated { group_id } => Ok(ProcessGroup::new(group_id, ranks)),
            other => Err(InitErr::Protocol(format!(
                "expected group creation, got {other:?}"
            ))),
        }
    }

    /// Blocks until every member of `group` arrived.
    pub async fn group_barrier(&mut self, group: &ProcessGroup) -> Result<()> {
        let group_id = group.id();
        self.tx
            .send(&Msg::Control(Command::Barrier { group_id }))
            .await?;

        match self.recv().await? {
            Command::Release { group_id: released } if released == group_id => Ok(()),
            other => Err(InitErr::Protocol(format!(
                "expected release of group {group_id}, got {other:?}"
            ))),
        }
    }

    /// Leaves the job. Rank 0 keeps serving the coordinator until every other rank left.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Disconnect)).await?;
        self.tx.close().await?;

        if let Some(coordinator) = self.coordinator.take() {
            info!("waiting for every rank to leave");
            coordinator.await.map_err(io::Error::other)??;
        }

        Ok(())
    }

    async fn recv(&mut self) -> Result<Command> {
        recv_control(&mut self.rx, &mut self.buf).await
    }
}

impl Collective for Fabric {
    async fn barrier(&mut self) -> Result<()> {
        let world = self.world();
        self.group_barrier(&world).await
    }
}

fn abort(coordinator: Option<JoinHandle<io::Result<()>>>) {
    if let Some(handle) = coordinator {
        handle.abort();
    }
}

async fn recv_control(rx: &mut NetRx, buf: &mut Vec<u8>) -> Result<Command> {
    let msg: Msg = rx.recv_into(buf).await?;

    match msg {
        Msg::Control(cmd) => Ok(cmd),
        Msg::Err(detail) => Err(InitErr::Protocol(detail.into_owned())),
    }
}

async fn connect_retrying(endpoint: &str) -> TcpStream {
    let mut backoff = MIN_CONNECT_BACKOFF;

    loop {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return stream,
            Err(e) => {
                debug!("rendezvous at {endpoint} not reachable yet: {e}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
            }
        }
    }
}
