//! # Communication Engine Module
//!
//! The per-process heart of the runtime. One engine instance lives inside
//! each rank and owns three groups of tasks:
//!
//! 1. **Reader tasks** — one per peer connection, decoding frames and
//!    feeding them into the dispatcher channel (see `transport`).
//! 2. **Writer tasks** — one per peer connection, draining the outbound
//!    queues.
//! 3. **The dispatcher** — a single task owning the inbox, the
//!    posted-receive queue, the request table, and the collective
//!    controller state. All matcher state is touched only here, so inbound
//!    frame handling is serialized with request posting by construction.
//!
//! User-facing calls never block a thread: they enqueue an event and await
//! a completion cell.
//!
//! ## Matching rules
//!
//! Posting a receive scans the inbox in arrival order for the first entry
//! satisfying `(source, tag, comm)`, where `ANY_SOURCE`/`ANY_TAG` match
//! everything; a miss appends the request to the posted queue. An inbound
//! user frame scans the posted queue in posting order; a miss appends to
//! the inbox. Messages from the same sender with the same tag are thereby
//! delivered in send order. Acknowledgement frames resolve the oldest
//! matching synchronous send; collective-tagged frames are routed to the
//! collective controller.

use crate::collective::{CollectiveCtx, CollectiveSlot, Disposition};
use crate::communicator::Communicator;
use crate::error::MpiError;
use crate::logging;
use crate::request::{RequestCell, RequestId, RequestTable};
use crate::serializer;
use crate::settings::Settings;
use crate::topology::TopologyCache;
use crate::transport::{self, PeerAddr, Transport};
use crate::wire::{
    is_collective_tag, CommId, Command, Frame, FrameHeader, Rank, Tag, ANY_SOURCE, ANY_TAG,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the launcher hands a freshly spawned rank.
pub struct ProcessConfig {
    pub rank: Rank,
    pub size: usize,
    /// Job name; appears in the per-rank log file name.
    pub name: String,
    /// Addresses of every cohort member, self included, sorted by rank.
    pub peers: Vec<PeerAddr>,
    pub settings: Settings,
    /// Pre-bound listener for this rank. When absent the engine binds the
    /// address advertised in `peers`. In-process cohorts (tests) pre-bind
    /// so ephemeral ports are known up front.
    pub listener: Option<std::net::TcpListener>,
}

/// Events consumed by the dispatcher.
pub(crate) enum Event {
    Frame(Frame),
    PostRecv {
        id: RequestId,
        cell: Arc<RequestCell>,
        source: Rank,
        tag: Tag,
        comm: CommId,
    },
    PostSyncSend {
        id: RequestId,
        cell: Arc<RequestCell>,
        peer: u32,
        tag: Tag,
        comm: CommId,
    },
    StartCollective(CollectiveSlot),
    Cancel(RequestId),
    Finalize {
        done: oneshot::Sender<()>,
    },
}

/// State shared between the user API, the dispatcher, and the transport.
pub(crate) struct EngineShared {
    pub rank: u32,
    pub size: u32,
    pub settings: Settings,
    pub topo_cache: TopologyCache,
    pub closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<Event>,
    senders: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    next_request: AtomicU64,
    started_at: Instant,
}

impl EngineShared {
    pub fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub fn post(&self, event: Event) -> Result<(), MpiError> {
        self.events
            .send(event)
            .map_err(|_| MpiError::Mpi("engine dispatcher has stopped".into()))
    }

    /// Route a frame towards `dest`. Frames to the local rank loop straight
    /// back into the dispatcher, preserving self-send semantics.
    pub fn send_frame(&self, dest: u32, frame: Frame) -> Result<(), MpiError> {
        if dest == self.rank {
            return self.post(Event::Frame(frame));
        }
        self.senders
            .get(dest as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| MpiError::Transport(format!("no connection to rank {dest}")))?
            .send(frame)
            .map_err(|_| MpiError::Transport(format!("connection to rank {dest} is closed")))
    }

    /// Seconds since the engine started.
    pub fn wtime(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// A received message not yet claimed by any posted receive.
struct InboxEntry {
    sender: u32,
    tag: Tag,
    comm: CommId,
    command: Command,
    ack_required: bool,
    payload: Vec<u8>,
}

/// A posted receive waiting for a matching arrival.
struct PostedRecv {
    id: RequestId,
    cell: Arc<RequestCell>,
    source: Rank,
    tag: Tag,
    comm: CommId,
}

/// A synchronous send waiting for the receiver's acknowledgement.
struct PendingAck {
    id: RequestId,
    peer: u32,
    tag: Tag,
    comm: CommId,
}

struct Dispatcher {
    engine: Arc<EngineShared>,
    inbox: VecDeque<InboxEntry>,
    posted: VecDeque<PostedRecv>,
    sync_sends: VecDeque<PendingAck>,
    table: RequestTable,
    collectives: HashMap<Tag, CollectiveSlot>,
    /// Next per-tag collective instance number. Assigned in invocation
    /// order, which the ordering contract makes identical on every rank.
    coll_seq: HashMap<Tag, u64>,
    /// Collective frames whose instance has not started locally yet.
    backlog: HashMap<Tag, VecDeque<Frame>>,
}

impl Dispatcher {
    fn new(engine: Arc<EngineShared>) -> Self {
        Dispatcher {
            engine,
            inbox: VecDeque::new(),
            posted: VecDeque::new(),
            sync_sends: VecDeque::new(),
            table: RequestTable::new(),
            collectives: HashMap::new(),
            coll_seq: HashMap::new(),
            backlog: HashMap::new(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Frame(frame) => self.handle_frame(frame),
                Event::PostRecv {
                    id,
                    cell,
                    source,
                    tag,
                    comm,
                } => self.post_recv(id, cell, source, tag, comm),
                Event::PostSyncSend {
                    id,
                    cell,
                    peer,
                    tag,
                    comm,
                } => {
                    self.table.insert(id, cell);
                    self.sync_sends.push_back(PendingAck {
                        id,
                        peer,
                        tag,
                        comm,
                    });
                }
                Event::StartCollective(slot) => self.start_collective(slot),
                Event::Cancel(id) => {
                    self.table.cancel(id);
                    self.posted.retain(|p| p.id != id);
                    self.sync_sends.retain(|p| p.id != id);
                }
                Event::Finalize { done } => {
                    self.shutdown();
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let header = &frame.header;
        if header.receiver != self.engine.rank {
            warn!(
                sender = header.sender,
                receiver = header.receiver,
                "dropping misrouted frame"
            );
            return;
        }
        if is_collective_tag(header.tag) {
            self.handle_collective_frame(frame);
            return;
        }
        match header.command {
            Command::Ack => self.resolve_ack(header.sender, header.tag, header.comm_id),
            Command::Shutdown => {}
            _ => self.handle_user_frame(frame),
        }
    }

    /// Inbound user data: oldest matching posted receive wins, otherwise
    /// the frame is buffered in arrival order.
    fn handle_user_frame(&mut self, frame: Frame) {
        let header = frame.header;
        let matched = self.posted.iter().position(|p| {
            p.comm == header.comm_id
                && (p.source == ANY_SOURCE || p.source as u32 == header.sender)
                && (p.tag == ANY_TAG || p.tag == header.tag)
        });
        match matched {
            Some(pos) => {
                let posted = self.posted.remove(pos).expect("indexed posted entry");
                if posted.cell.is_cancelled() {
                    // The matching arrival of a cancelled receive is
                    // discarded, not re-buffered.
                    self.table.remove(posted.id);
                    debug!(id = posted.id, "discarding arrival for cancelled receive");
                    return;
                }
                self.deliver(
                    posted,
                    header.sender,
                    header.tag,
                    header.comm_id,
                    header.command,
                    header.ack_required,
                    frame.payload,
                );
            }
            None => self.inbox.push_back(InboxEntry {
                sender: header.sender,
                tag: header.tag,
                comm: header.comm_id,
                command: header.command,
                ack_required: header.ack_required,
                payload: frame.payload,
            }),
        }
    }

    fn post_recv(
        &mut self,
        id: RequestId,
        cell: Arc<RequestCell>,
        source: Rank,
        tag: Tag,
        comm: CommId,
    ) {
        let matched = self.inbox.iter().position(|e| {
            e.comm == comm
                && (source == ANY_SOURCE || source as u32 == e.sender)
                && (tag == ANY_TAG || tag == e.tag)
        });
        match matched {
            Some(pos) => {
                let entry = self.inbox.remove(pos).expect("indexed inbox entry");
                let posted = PostedRecv {
                    id,
                    cell,
                    source,
                    tag,
                    comm,
                };
                self.deliver(
                    posted,
                    entry.sender,
                    entry.tag,
                    entry.comm,
                    entry.command,
                    entry.ack_required,
                    entry.payload,
                );
            }
            None => {
                self.table.insert(id, cell.clone());
                self.posted.push_back(PostedRecv {
                    id,
                    cell,
                    source,
                    tag,
                    comm,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        posted: PostedRecv,
        sender: u32,
        tag: Tag,
        comm: CommId,
        command: Command,
        ack_required: bool,
        payload: Vec<u8>,
    ) {
        let value = match serializer::decode(command, &payload) {
            Ok(value) => value,
            Err(err) => self.fatal("payload decode failed", &err),
        };
        self.table.remove(posted.id);
        posted.cell.mark_ready(Some(value));
        if ack_required {
            let ack = Frame {
                header: FrameHeader {
                    command: Command::Ack,
                    sender: self.engine.rank,
                    receiver: sender,
                    comm_id: comm,
                    tag,
                    ack_required: false,
                    payload_len: 0,
                },
                coll: None,
                payload: Vec::new(),
            };
            if let Err(err) = self.engine.send_frame(sender, ack) {
                self.fatal("acknowledgement send failed", &err);
            }
        }
    }

    /// Complete the oldest synchronous send matching the acknowledgement.
    fn resolve_ack(&mut self, sender: u32, tag: Tag, comm: CommId) {
        let matched = self
            .sync_sends
            .iter()
            .position(|p| p.peer == sender && p.tag == tag && p.comm == comm);
        match matched {
            Some(pos) => {
                let pending = self.sync_sends.remove(pos).expect("indexed ack entry");
                self.table.mark_ready(pending.id, None);
            }
            None => warn!(sender, tag, "acknowledgement without outstanding ssend"),
        }
    }

    fn start_collective(&mut self, mut slot: CollectiveSlot) {
        let tag = slot.tag;
        if self.collectives.contains_key(&tag) {
            // Collectives on one communicator must be issued in the same
            // order everywhere; overlapping ones on a tag is a caller bug.
            warn!(tag, "collective started while a previous one is active");
        }
        let seq = self.coll_seq.entry(tag).or_insert(0);
        slot.seq = *seq;
        *seq += 1;

        let mut ctx = CollectiveCtx::new(&self.engine, tag, slot.comm, slot.class_id, slot.seq);
        let started = slot.algo.start(&mut ctx);
        slot.dirty |= ctx.sent;
        match started {
            Ok(true) => self.finish_slot(slot),
            Ok(false) => {
                self.collectives.insert(tag, slot);
                self.replay_backlog(tag);
            }
            Err(err) => self.fatal("collective start failed", &err),
        }
    }

    /// Route a collective frame by `(tag, instance)`: frames for the active
    /// instance feed its state machine, frames for a future instance wait
    /// in the backlog, frames for a completed instance are stale and
    /// dropped.
    fn handle_collective_frame(&mut self, frame: Frame) {
        let tag = frame.header.tag;
        let Some(header) = frame.coll else {
            warn!(tag, "collective frame without a collective header");
            return;
        };
        // Active instance number, or the next one to be assigned when no
        // slot is live.
        let (current, active) = match self.collectives.get(&tag) {
            Some(slot) => (slot.seq, true),
            None => (self.coll_seq.get(&tag).copied().unwrap_or(0), false),
        };
        if active && header.seq == current {
            self.feed_collective(tag, frame);
        } else if header.seq < current {
            debug!(tag, seq = header.seq, "dropping stale collective frame");
        } else {
            self.backlog.entry(tag).or_default().push_back(frame);
        }
    }

    /// Feed one same-instance frame into the active slot for `tag`,
    /// overtaking first if the sender advertises a different class and the
    /// slot is still clean.
    fn feed_collective(&mut self, tag: Tag, frame: Frame) {
        let advertised = {
            let slot = &self.collectives[&tag];
            match frame.coll {
                Some(header) if !slot.dirty && header.class_id != slot.class_id => {
                    Some(header.class_id)
                }
                _ => None,
            }
        };
        if let Some(class_id) = advertised {
            self.overtake(tag, class_id);
        }

        let slot = self.collectives.get_mut(&tag).expect("active slot");
        let mut ctx = CollectiveCtx::new(&self.engine, tag, slot.comm, slot.class_id, slot.seq);
        let sender = frame.header.sender;
        let disposition = slot.algo.accept_msg(sender, frame, &mut ctx);
        slot.dirty |= ctx.sent;
        match disposition {
            Ok(Disposition::Consumed) => {
                slot.dirty = true;
            }
            Ok(Disposition::Finished) => {
                slot.dirty = true;
                let slot = self.collectives.remove(&tag).expect("active slot");
                self.finish_slot(slot);
            }
            Ok(Disposition::Ignored(frame)) => {
                warn!(
                    tag,
                    sender = frame.header.sender,
                    "collective state machine refused a same-instance frame"
                );
            }
            Err(err) => self.fatal("collective frame handling failed", &err),
        }
    }

    /// Rebuild the active request as the advertised class, reusing the
    /// preserved initial arguments and the topology cache, then start it.
    /// The completion cell carries over, so the waiting caller observes the
    /// overtaker's completion.
    fn overtake(&mut self, tag: Tag, class_id: u8) {
        let slot = self.collectives.get_mut(&tag).expect("active slot");
        debug!(
            tag,
            from = slot.class_id,
            to = class_id,
            "overtaking collective request"
        );
        let algo = match crate::collective::build(&self.engine, slot.kind, class_id, &slot.init) {
            Ok(algo) => algo,
            Err(err) => self.fatal("collective overtake failed", &err),
        };
        let slot = self.collectives.get_mut(&tag).expect("active slot");
        slot.algo = algo;
        slot.class_id = class_id;
        // The overtaker starts dirty: a second overtake is forbidden.
        slot.dirty = true;

        let mut ctx = CollectiveCtx::new(&self.engine, tag, slot.comm, slot.class_id, slot.seq);
        let started = slot.algo.start(&mut ctx);
        match started {
            Ok(true) => {
                let slot = self.collectives.remove(&tag).expect("active slot");
                self.finish_slot(slot);
            }
            Ok(false) => {}
            Err(err) => self.fatal("overtaken collective start failed", &err),
        }
    }

    /// Extract the completed operation's data and wake the caller.
    fn finish_slot(&mut self, mut slot: CollectiveSlot) {
        match slot.algo.take_data() {
            Ok(data) => slot.cell.mark_ready(data),
            Err(err) => self.fatal("collective result decode failed", &err),
        }
    }

    /// Move backlogged frames belonging to the newly active instance into
    /// its state machine; drop anything stale.
    fn replay_backlog(&mut self, tag: Tag) {
        let Some(slot) = self.collectives.get(&tag) else {
            return;
        };
        let seq = slot.seq;
        let Some(queued) = self.backlog.get_mut(&tag) else {
            return;
        };
        let mut matching = VecDeque::new();
        queued.retain(|frame| match frame.coll {
            Some(header) if header.seq == seq => {
                matching.push_back(frame.clone());
                false
            }
            Some(header) => header.seq > seq,
            None => false,
        });
        while let Some(frame) = matching.pop_front() {
            if !self.collectives.contains_key(&tag) {
                // Completed mid-replay; anything left over is stale.
                break;
            }
            self.feed_collective(tag, frame);
        }
    }

    /// Announce shutdown to every peer and drain bookkeeping.
    fn shutdown(&mut self) {
        for peer in 0..self.engine.size {
            if peer == self.engine.rank {
                continue;
            }
            let _ = self
                .engine
                .send_frame(peer, transport::shutdown_frame(self.engine.rank, peer));
        }
        let pending = self.table.len();
        if pending > 0 {
            warn!(
                pending,
                snapshot = ?self.table.snapshot(),
                "finalizing with outstanding requests"
            );
        }
        debug!("dispatcher shut down");
    }

    /// Serialization and transport faults inside the dispatcher are fatal
    /// to the process by design; the launcher fails the job.
    fn fatal(&self, context: &str, err: &MpiError) -> ! {
        tracing::error!(%err, context, "fatal engine fault, terminating");
        std::process::exit(1);
    }
}

/// Handle to a fully initialized runtime instance. Owns the engine tasks;
/// its lifetime brackets the program between `init` and `finalize`.
pub struct Mpi {
    engine: Arc<EngineShared>,
    world: Communicator,
    dispatcher: JoinHandle<()>,
    transport_tasks: Vec<JoinHandle<()>>,
    _log_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Mpi {
    /// Bring the engine up: bind, build the peer mesh, start the dispatcher.
    /// Returns once a connection to every peer exists.
    pub async fn init(config: ProcessConfig) -> Result<Mpi, MpiError> {
        let ProcessConfig {
            rank,
            size,
            name,
            peers,
            settings,
            listener,
        } = config;

        if size == 0 || rank < 0 || rank as usize >= size {
            return Err(MpiError::Mpi(format!(
                "rank {rank} outside cohort of size {size}"
            )));
        }
        if peers.len() != size || peers.iter().enumerate().any(|(i, p)| p.rank as usize != i) {
            return Err(MpiError::Mpi(
                "peer list must hold every rank in order".into(),
            ));
        }

        let log_guard = logging::init_rank_logging(&settings, &name, rank);
        info!(rank, size, %name, "initializing communication engine");

        let rank = rank as u32;
        let size = size as u32;

        let listener = match listener {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            None => {
                let me = &peers[rank as usize];
                TcpListener::bind((me.host.as_str(), me.port)).await?
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let transport = transport::connect_all(
            rank,
            size,
            listener,
            &peers,
            &settings,
            events_tx.clone(),
            closing.clone(),
        )
        .await?;
        let Transport { senders, tasks } = transport;

        let engine = Arc::new(EngineShared {
            rank,
            size,
            settings,
            topo_cache: TopologyCache::new(),
            closing,
            events: events_tx,
            senders,
            next_request: AtomicU64::new(1),
            started_at: Instant::now(),
        });

        let dispatcher = tokio::spawn(Dispatcher::new(engine.clone()).run(events_rx));
        let world = Communicator::world(engine.clone());

        info!(rank, size, "engine ready, all peers connected");
        Ok(Mpi {
            engine,
            world,
            dispatcher,
            transport_tasks: tasks,
            _log_guard: log_guard,
        })
    }

    /// The world communicator spanning the whole cohort.
    pub fn world(&self) -> &Communicator {
        &self.world
    }

    /// Synchronize with the cohort, say goodbye to every peer, and tear the
    /// engine down. Normal return corresponds to process exit code 0.
    pub async fn finalize(self) -> Result<(), MpiError> {
        // Nobody leaves before everybody has arrived; afterwards peer
        // disconnects are expected rather than fatal.
        self.world.barrier().await?;
        self.engine.closing.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        self.engine.post(Event::Finalize { done: done_tx })?;
        done_rx
            .await
            .map_err(|_| MpiError::Mpi("dispatcher exited before finalize completed".into()))?;

        const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, self.dispatcher).await;
        for task in self.transport_tasks {
            let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, task).await;
        }
        info!(rank = self.engine.rank, "engine finalized");
        Ok(())
    }
}
