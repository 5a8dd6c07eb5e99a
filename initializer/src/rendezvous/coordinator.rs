use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    net::SocketAddr,
};

use comms::msg::{Command, Msg, WORLD_GROUP};
use log::{debug, info, warn};
use tokio::{
    net::TcpListener,
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};

use super::{NetRx, NetTx};

type ConnId = usize;

enum Event {
    Frame(ConnId, Msg<'static>),
    Closed(ConnId),
}

/// A group creation every rank has to take part in before it completes.
struct PendingGroup {
    ranks: Vec<usize>,
    arrived: BTreeSet<usize>,
}

/// Accepts every rank of the job and serves group creation and barriers until they all leave.
pub struct Coordinator {
    listener: TcpListener,
    world_size: usize,
}

impl Coordinator {
    /// Binds the rendezvous endpoint.
    ///
    /// # Arguments
    /// * `endpoint` - The `host:port` pair to listen at.
    /// * `world_size` - The amount of ranks to wait for.
    pub async fn bind(endpoint: &str, world_size: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(endpoint).await?;
        info!(endpoint = endpoint, world_size = world_size; "coordinator listening");

        Ok(Self {
            listener,
            world_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the coordinator in the background.
    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.run())
    }

    /// Serves the rendezvous protocol.
    ///
    /// # Returns
    /// Once every rank joined and then disconnected, or an io error if accepting failed.
    pub async fn run(self) -> io::Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut state = State::new(self.world_size);
        let mut next_conn: ConnId = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept(), if !state.welcomed => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true)?;

                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);

                    let conn = next_conn;
                    next_conn += 1;

                    debug!(conn = conn; "connection from {addr}");
                    state.senders.insert(conn, tx);
                    tokio::spawn(forward(conn, rx, events_tx.clone()));
                }
                Some(event) = events_rx.recv() => {
                    match event {
                        Event::Frame(conn, Msg::Control(cmd)) => state.handle(conn, cmd).await,
                        Event::Frame(conn, Msg::Err(detail)) => {
                            warn!(conn = conn; "peer reported an error: {detail}");
                        }
                        Event::Closed(conn) => state.close(conn),
                    }

                    if state.finished() {
                        break;
                    }
                }
            }
        }

        info!("every rank left, coordinator done");
        Ok(())
    }
}

/// Reads frames from one connection and forwards them to the coordinator loop.
async fn forward(conn: ConnId, mut rx: NetRx, events: UnboundedSender<Event>) {
    let mut buf = Vec::new();

    loop {
        let res: io::Result<Msg> = rx.recv_into(&mut buf).await;

        match res {
            Ok(msg) => {
                if events.send(Event::Frame(conn, msg.into_owned())).is_err() {
                    return;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(conn = conn; "connection broke: {e}");
                }

                let _ = events.send(Event::Closed(conn));
                return;
            }
        }
    }
}

struct State {
    world_size: usize,
    welcomed: bool,
    senders: HashMap<ConnId, NetTx>,
    rank_of: HashMap<ConnId, usize>,
    conn_of: BTreeMap<usize, ConnId>,
    groups: Vec<Vec<usize>>,
    pending_group: Option<PendingGroup>,
    arrivals: HashMap<usize, BTreeSet<usize>>,
}

impl State {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            welcomed: false,
            senders: HashMap::new(),
            rank_of: HashMap::new(),
            conn_of: BTreeMap::new(),
            groups: vec![(0..world_size).collect()],
            pending_group: None,
            arrivals: HashMap::new(),
        }
    }

    fn finished(&self) -> bool {
        self.welcomed && self.senders.is_empty()
    }

    async fn handle(&mut self, conn: ConnId, cmd: Command) {
        match cmd {
            Command::Join { rank, world_size } => self.join(conn, rank, world_size).await,
            Command::Disconnect => {
                debug!(conn = conn; "disconnect");
                self.close(conn);
            }
            Command::NewGroup { ranks } => {
                if let Some(rank) = self.member(conn).await {
                    self.new_group(conn, rank, ranks).await;
                }
            }
            Command::Barrier { group_id } => {
                if let Some(rank) = self.member(conn).await {
                    self.barrier(conn, rank, group_id).await;
                }
            }
            other => {
                self.reject(conn, format!("unexpected command {other:?}"))
                    .await
            }
        }
    }

    async fn join(&mut self, conn: ConnId, rank: usize, world_size: usize) {
        let problem = if self.welcomed {
            Some("rendezvous already complete".to_string())
        } else if self.rank_of.contains_key(&conn) {
            Some("connection already joined".to_string())
        } else if world_size != self.world_size {
            Some(format!(
                "world size mismatch: got {world_size}, coordinator expects {}",
                self.world_size
            ))
        } else if rank >= self.world_size {
            Some(format!(
                "rank {rank} out of range for world size {}",
                self.world_size
            ))
        } else if self.conn_of.contains_key(&rank) {
            Some(format!("rank {rank} joined twice"))
        } else {
            None
        };

        if let Some(problem) = problem {
            self.reject(conn, problem).await;
            self.close(conn);
            return;
        }

        self.rank_of.insert(conn, rank);
        self.conn_of.insert(rank, conn);
        info!(
            rank = rank,
            joined = self.conn_of.len(),
            world_size = self.world_size;
            "rank joined"
        );

        if self.conn_of.len() == self.world_size {
            self.welcomed = true;
            let msg = Msg::Control(Command::Welcome {
                world_size: self.world_size,
            });

            let members: Vec<_> = self.conn_of.keys().copied().collect();
            self.send_to_ranks(&members, &msg).await;
            info!("rendezvous complete");
        }
    }

    async fn new_group(&mut self, conn: ConnId, rank: usize, ranks: Vec<usize>) {
        let mut unique = ranks.clone();
        unique.sort_unstable();
        unique.dedup();

        if ranks.is_empty() || unique.len() != ranks.len() {
            return self
                .reject(conn, format!("invalid group membership {ranks:?}"))
                .await;
        }
        if let Some(out) = ranks.iter().find(|&&r| r >= self.world_size) {
            return self
                .reject(conn, format!("group member {out} is not part of the world"))
                .await;
        }

        let pending = self.pending_group.get_or_insert_with(|| PendingGroup {
            ranks: ranks.clone(),
            arrived: BTreeSet::new(),
        });

        if pending.ranks != ranks {
            let expected = format!("{:?}", pending.ranks);
            return self
                .reject(
                    conn,
                    format!("group {ranks:?} differs from the pending {expected}"),
                )
                .await;
        }
        if !pending.arrived.insert(rank) {
            return self
                .reject(conn, format!("rank {rank} is already creating this group"))
                .await;
        }
        if pending.arrived.len() < self.world_size {
            return;
        }

        self.pending_group = None;
        let group_id = self.groups.len();
        debug!(group_id = group_id; "group {ranks:?} created");
        self.groups.push(ranks);

        let msg = Msg::Control(Command::GroupCreated { group_id });
        let everyone: Vec<_> = (0..self.world_size).collect();
        self.send_to_ranks(&everyone, &msg).await;
    }

    async fn barrier(&mut self, conn: ConnId, rank: usize, group_id: usize) {
        let Some(members) = self.groups.get(group_id).cloned() else {
            return self
                .reject(conn, format!("unknown group {group_id}"))
                .await;
        };
        if !members.contains(&rank) {
            return self
                .reject(
                    conn,
                    format!("rank {rank} is not a member of group {group_id}"),
                )
                .await;
        }

        let arrived = self.arrivals.entry(group_id).or_default();
        if !arrived.insert(rank) {
            return self
                .reject(
                    conn,
                    format!("rank {rank} arrived twice at barrier {group_id}"),
                )
                .await;
        }
        if arrived.len() < members.len() {
            return;
        }

        self.arrivals.remove(&group_id);
        if group_id == WORLD_GROUP {
            debug!("world barrier released");
        }

        let msg = Msg::Control(Command::Release { group_id });
        self.send_to_ranks(&members, &msg).await;
    }

    /// Resolves the rank of a connection that already went through the rendezvous.
    async fn member(&mut self, conn: ConnId) -> Option<usize> {
        match self.rank_of.get(&conn).copied() {
            Some(rank) if self.welcomed => Some(rank),
            _ => {
                self.reject(conn, "rendezvous not complete for this connection".into())
                    .await;
                None
            }
        }
    }

    async fn send_to_ranks(&mut self, ranks: &[usize], msg: &Msg<'_>) {
        for rank in ranks {
            if let Some(&conn) = self.conn_of.get(rank) {
                self.send(conn, msg).await;
            }
        }
    }

    async fn reject(&mut self, conn: ConnId, detail: String) {
        warn!(conn = conn; "rejecting: {detail}");
        self.send(conn, &Msg::Err(detail.into())).await;
    }

    async fn send(&mut self, conn: ConnId, msg: &Msg<'_>) {
        let Some(tx) = self.senders.get_mut(&conn) else {
            return;
        };

        if let Err(e) = tx.send(msg).await {
            warn!(conn = conn; "failed to send {msg:?}: {e}");
        }
    }

    fn close(&mut self, conn: ConnId) {
        self.senders.remove(&conn);

        if let Some(rank) = self.rank_of.remove(&conn) {
            self.conn_of.remove(&rank);

            if self.welcomed {
                debug!(rank = rank; "rank left");
            } else {
                warn!(rank = rank; "rank left before the rendezvous completed");
            }
        }
    }
}
