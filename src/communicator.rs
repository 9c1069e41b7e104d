//! # Communicator Module
//!
//! The user-facing surface of the runtime. A communicator is a named,
//! immutable group of ranks with a stable numeric id; it references the
//! engine and exposes point-to-point and collective operations over its
//! members. Rank and size never change for a communicator's lifetime.
//!
//! Blocking operations (`send`, `recv`, `barrier`, every collective) are
//! `async fn`s that suspend the caller until the underlying request reaches
//! a terminal state. `isend`/`irecv` return a [`RequestHandle`]
//! immediately; combine them with [`waitany`](crate::request::waitany) /
//! [`waitall`](crate::request::waitall) for completion-driven patterns.

use crate::collective::{self, CollectiveInit, CollectiveKind, CollectiveSlot};
use crate::engine::{EngineShared, Event};
use crate::error::MpiError;
use crate::group::Group;
use crate::op::Op;
use crate::request::{RequestCell, RequestHandle, RequestKind};
use crate::serializer::{self, Value};
use crate::wire::{CommId, Frame, FrameHeader, Rank, Tag, ANY_SOURCE, ANY_TAG};
use std::sync::Arc;

/// A named group of ranks sharing point-to-point and collective scope.
#[derive(Clone)]
pub struct Communicator {
    pub(crate) engine: Arc<EngineShared>,
    id: CommId,
    name: String,
    group: Group,
}

impl Communicator {
    /// The world communicator spanning every rank of the cohort.
    pub(crate) fn world(engine: Arc<EngineShared>) -> Self {
        let size = engine.size as usize;
        Communicator {
            engine,
            id: crate::wire::WORLD_COMM_ID,
            name: "world".to_string(),
            group: Group::world(size),
        }
    }

    /// This process's rank within the communicator.
    pub fn rank(&self) -> Rank {
        self.engine.rank as Rank
    }

    /// Number of ranks in the communicator.
    pub fn size(&self) -> usize {
        self.engine.size as usize
    }

    pub fn id(&self) -> CommId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group of member ranks. Pure data; deriving new groups from it
    /// creates no connections.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Seconds of wall-clock time since the engine started.
    pub fn wtime(&self) -> f64 {
        self.engine.wtime()
    }

    fn check_peer(&self, rank: Rank) -> Result<u32, MpiError> {
        if rank < 0 || rank as usize >= self.size() {
            return Err(MpiError::NoSuchRank {
                rank,
                size: self.size(),
            });
        }
        Ok(rank as u32)
    }

    fn check_tag(tag: Tag) -> Result<(), MpiError> {
        if tag < 0 {
            return Err(MpiError::Mpi(format!(
                "user tags must be non-negative, got {tag}"
            )));
        }
        Ok(())
    }

    fn data_frame(
        &self,
        dest: u32,
        tag: Tag,
        data: &Value,
        ack_required: bool,
    ) -> Result<Frame, MpiError> {
        let (command, payload) = serializer::encode(data)?;
        Ok(Frame {
            header: FrameHeader {
                command,
                sender: self.engine.rank,
                receiver: dest,
                comm_id: self.id,
                tag,
                ack_required,
                payload_len: payload.len() as u64,
            },
            coll: None,
            payload,
        })
    }

    /// Non-blocking buffered send. The returned request is already complete:
    /// the payload is encoded and queued before this returns.
    pub fn isend(&self, data: Value, dest: Rank, tag: Tag) -> Result<RequestHandle, MpiError> {
        let dest = self.check_peer(dest)?;
        Self::check_tag(tag)?;
        let frame = self.data_frame(dest, tag, &data, false)?;
        self.engine.send_frame(dest, frame)?;
        Ok(RequestHandle {
            id: self.engine.next_request_id(),
            kind: RequestKind::Send,
            cell: Arc::new(RequestCell::ready(None)),
            engine: self.engine.clone(),
        })
    }

    /// Blocking buffered send.
    pub async fn send(&self, data: Value, dest: Rank, tag: Tag) -> Result<(), MpiError> {
        self.isend(data, dest, tag)?.wait().await.map(|_| ())
    }

    /// Non-blocking synchronous send; completes only once the receiver has
    /// matched the message and acknowledged it.
    pub fn issend(&self, data: Value, dest: Rank, tag: Tag) -> Result<RequestHandle, MpiError> {
        let dest = self.check_peer(dest)?;
        Self::check_tag(tag)?;
        let frame = self.data_frame(dest, tag, &data, true)?;

        let id = self.engine.next_request_id();
        let cell = Arc::new(RequestCell::new());
        // Register the ack waiter before the frame can possibly race back.
        self.engine.post(Event::PostSyncSend {
            id,
            cell: cell.clone(),
            peer: dest,
            tag,
            comm: self.id,
        })?;
        self.engine.send_frame(dest, frame)?;
        Ok(RequestHandle {
            id,
            kind: RequestKind::SyncSend,
            cell,
            engine: self.engine.clone(),
        })
    }

    /// Blocking synchronous send.
    pub async fn ssend(&self, data: Value, dest: Rank, tag: Tag) -> Result<(), MpiError> {
        self.issend(data, dest, tag)?.wait().await.map(|_| ())
    }

    /// Non-blocking receive. `source`/`tag` accept the [`ANY_SOURCE`] and
    /// [`ANY_TAG`] wildcards.
    pub fn irecv(&self, source: Rank, tag: Tag) -> Result<RequestHandle, MpiError> {
        if source != ANY_SOURCE {
            self.check_peer(source)?;
        }
        if tag != ANY_TAG {
            Self::check_tag(tag)?;
        }
        let id = self.engine.next_request_id();
        let cell = Arc::new(RequestCell::new());
        self.engine.post(Event::PostRecv {
            id,
            cell: cell.clone(),
            source,
            tag,
            comm: self.id,
        })?;
        Ok(RequestHandle {
            id,
            kind: RequestKind::Recv,
            cell,
            engine: self.engine.clone(),
        })
    }

    /// Blocking receive; resolves to the received payload.
    pub async fn recv(&self, source: Rank, tag: Tag) -> Result<Value, MpiError> {
        self.irecv(source, tag)?.wait().await
    }

    /// Combined send and receive, issued concurrently to stay deadlock-free
    /// in exchange patterns such as rings.
    pub async fn sendrecv(
        &self,
        data: Value,
        dest: Rank,
        send_tag: Tag,
        source: Rank,
        recv_tag: Tag,
    ) -> Result<Value, MpiError> {
        let recv = self.irecv(source, recv_tag)?;
        let send = self.isend(data, dest, send_tag)?;
        send.wait().await?;
        recv.wait().await
    }

    fn launch(
        &self,
        kind: CollectiveKind,
        init: CollectiveInit,
    ) -> Result<RequestHandle, MpiError> {
        let class_id = collective::select_class(&self.engine, kind, &init)?;
        let algo = collective::build(&self.engine, kind, class_id, &init)?;
        let cell = Arc::new(RequestCell::new());
        let slot = CollectiveSlot {
            kind,
            tag: kind.tag(),
            comm: self.id,
            class_id,
            // The dispatcher assigns the instance number; it owns the
            // per-tag invocation count.
            seq: 0,
            dirty: false,
            cell: cell.clone(),
            init,
            algo,
        };
        let id = self.engine.next_request_id();
        self.engine.post(Event::StartCollective(slot))?;
        Ok(RequestHandle {
            id,
            kind: RequestKind::Collective,
            cell,
            engine: self.engine.clone(),
        })
    }

    /// Synchronize every rank; no rank leaves before all have entered.
    pub async fn barrier(&self) -> Result<(), MpiError> {
        self.launch(
            CollectiveKind::Barrier,
            CollectiveInit {
                root: 0,
                data: Value::None,
                op: None,
                encoded: None,
            },
        )?
        .wait()
        .await
        .map(|_| ())
    }

    /// Broadcast `data` from `root` to every rank; resolves to the root's
    /// value everywhere. Non-roots pass `None`.
    pub async fn bcast(&self, data: Option<Value>, root: Rank) -> Result<Value, MpiError> {
        let root = self.check_peer(root)?;
        let is_root = root == self.engine.rank;
        let data = match (is_root, data) {
            (true, Some(data)) => data,
            (true, None) => {
                return Err(MpiError::Mpi("broadcast root must supply data".into()));
            }
            (false, _) => Value::None,
        };
        // Encode at the call site: the root's algorithm choice depends on
        // the payload size, and encode errors belong to the caller.
        let encoded = if is_root {
            Some(serializer::encode(&data)?)
        } else {
            None
        };
        self.launch(
            CollectiveKind::Bcast,
            CollectiveInit {
                root,
                data,
                op: None,
                encoded,
            },
        )?
        .wait()
        .await
    }

    /// Reduce every rank's contribution with `op`; the result lands on
    /// `root` (`Some` there, `None` elsewhere). Contributions are folded in
    /// ascending rank order.
    pub async fn reduce(
        &self,
        data: Value,
        op: Op,
        root: Rank,
    ) -> Result<Option<Value>, MpiError> {
        let root = self.check_peer(root)?;
        let value = self
            .launch(
                CollectiveKind::Reduce,
                CollectiveInit {
                    root,
                    data,
                    op: Some(op),
                    encoded: None,
                },
            )?
            .wait()
            .await?;
        Ok(if root == self.engine.rank {
            Some(value)
        } else {
            None
        })
    }

    /// Reduce and distribute the result to every rank.
    pub async fn allreduce(&self, data: Value, op: Op) -> Result<Value, MpiError> {
        self.launch(
            CollectiveKind::Allreduce,
            CollectiveInit {
                root: 0,
                data,
                op: Some(op),
                encoded: None,
            },
        )?
        .wait()
        .await
    }

    /// Inclusive prefix reduction: rank `r` resolves to
    /// `v_0 ⊕ v_1 ⊕ … ⊕ v_r`.
    pub async fn scan(&self, data: Value, op: Op) -> Result<Value, MpiError> {
        self.launch(
            CollectiveKind::Scan,
            CollectiveInit {
                root: 0,
                data,
                op: Some(op),
                encoded: None,
            },
        )?
        .wait()
        .await
    }

    /// Split the root's list into `size` equal chunks and deliver chunk `i`
    /// to rank `i`. A non-divisible tail is silently dropped. Non-roots
    /// pass `None`.
    pub async fn scatter(&self, data: Option<Value>, root: Rank) -> Result<Value, MpiError> {
        let root = self.check_peer(root)?;
        let is_root = root == self.engine.rank;
        let data = match (is_root, data) {
            (true, Some(data)) => data,
            (true, None) => {
                return Err(MpiError::Mpi("scatter root must supply data".into()));
            }
            (false, _) => Value::None,
        };
        self.launch(
            CollectiveKind::Scatter,
            CollectiveInit {
                root,
                data,
                op: None,
                encoded: None,
            },
        )?
        .wait()
        .await
    }

    /// Collect every rank's contribution on `root` in rank order (`Some`
    /// there, `None` elsewhere). List contributions are concatenated, which
    /// makes gather the inverse of scatter.
    pub async fn gather(&self, data: Value, root: Rank) -> Result<Option<Value>, MpiError> {
        let root = self.check_peer(root)?;
        let value = self
            .launch(
                CollectiveKind::Gather,
                CollectiveInit {
                    root,
                    data,
                    op: None,
                    encoded: None,
                },
            )?
            .wait()
            .await?;
        Ok(if root == self.engine.rank {
            Some(value)
        } else {
            None
        })
    }

    /// Collect every rank's contribution on every rank, in rank order.
    pub async fn allgather(&self, data: Value) -> Result<Value, MpiError> {
        self.launch(
            CollectiveKind::Allgather,
            CollectiveInit {
                root: 0,
                data,
                op: None,
                encoded: None,
            },
        )?
        .wait()
        .await
    }

    /// Personalized exchange: entry `j` of this rank's list travels to rank
    /// `j`; resolves to the entries addressed to this rank, in sender
    /// order.
    pub async fn alltoall(&self, data: Value) -> Result<Value, MpiError> {
        self.launch(
            CollectiveKind::Alltoall,
            CollectiveInit {
                root: 0,
                data,
                op: None,
                encoded: None,
            },
        )?
        .wait()
        .await
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}
