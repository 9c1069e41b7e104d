//! # Collective Controller Module
//!
//! Registry and driver for collective operations. Each collective tag maps
//! to an ordered list of candidate algorithm classes; the first class whose
//! configured size window accepts the communicator wins. Accepted requests
//! become [`CollectiveSlot`]s owned by the dispatcher, which routes every
//! inbound collective frame into the slot's state machine.
//!
//! ## Dynamic overtaking
//!
//! Only the originator of a rooted collective knows the payload, so only it
//! can pick the best algorithm for the data at hand; everyone else accepts
//! optimistically. Every collective frame carries the sender's algorithm
//! class id. When a frame advertises a different class and the local
//! request has not yet sent or consumed anything (`dirty == false`), the
//! dispatcher rebuilds the request as the advertised class from the
//! preserved initial arguments, marks it dirty, starts it, and feeds it all
//! subsequent traffic. The original completion event is shared, so the
//! caller blocked in `wait` never notices the swap. Once dirty, a request
//! can no longer be overtaken.

use crate::engine::EngineShared;
use crate::error::MpiError;
use crate::op::Op;
use crate::request::RequestCell;
use crate::serializer::Value;
use crate::topology::TreeKind;
use crate::wire::{
    CollectiveHeader, CommId, Command, Frame, FrameHeader, Tag, TAG_ALLGATHER, TAG_ALLREDUCE,
    TAG_ALLTOALL, TAG_BARRIER, TAG_BCAST, TAG_GATHER, TAG_REDUCE, TAG_SCAN, TAG_SCATTER,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) mod alltoall;
pub(crate) mod barrier;
pub(crate) mod bcast;
pub(crate) mod gather;
pub(crate) mod reduce;
pub(crate) mod scatter;

/// Algorithm class identifiers carried in the collective header.
pub(crate) const CLASS_FLAT_TREE: u8 = 0;
pub(crate) const CLASS_BINOMIAL_TREE: u8 = 1;
pub(crate) const CLASS_STATIC_FANOUT: u8 = 2;
pub(crate) const CLASS_DISSEMINATION: u8 = 3;
pub(crate) const CLASS_NAIVE: u8 = 4;

/// The collective operations the controller knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectiveKind {
    Bcast,
    Barrier,
    Reduce,
    Allreduce,
    Scatter,
    Gather,
    Allgather,
    Alltoall,
    Scan,
}

impl CollectiveKind {
    pub fn tag(self) -> Tag {
        match self {
            CollectiveKind::Bcast => TAG_BCAST,
            CollectiveKind::Barrier => TAG_BARRIER,
            CollectiveKind::Reduce => TAG_REDUCE,
            CollectiveKind::Allreduce => TAG_ALLREDUCE,
            CollectiveKind::Scatter => TAG_SCATTER,
            CollectiveKind::Gather => TAG_GATHER,
            CollectiveKind::Allgather => TAG_ALLGATHER,
            CollectiveKind::Alltoall => TAG_ALLTOALL,
            CollectiveKind::Scan => TAG_SCAN,
        }
    }

    /// Setting-key prefix for bound overrides.
    fn settings_prefix(self) -> &'static str {
        match self {
            CollectiveKind::Bcast => "BCAST",
            CollectiveKind::Barrier => "BARRIER",
            CollectiveKind::Reduce => "REDUCE",
            CollectiveKind::Allreduce => "ALLREDUCE",
            CollectiveKind::Scatter => "SCATTER",
            CollectiveKind::Gather => "GATHER",
            CollectiveKind::Allgather => "ALLGATHER",
            CollectiveKind::Alltoall => "ALLTOALL",
            CollectiveKind::Scan => "SCAN",
        }
    }

    /// Ordered candidate classes. First acceptor wins.
    fn candidates(self) -> &'static [u8] {
        match self {
            CollectiveKind::Allgather => &[CLASS_DISSEMINATION],
            CollectiveKind::Alltoall => &[CLASS_NAIVE],
            _ => &[CLASS_FLAT_TREE, CLASS_BINOMIAL_TREE, CLASS_STATIC_FANOUT],
        }
    }
}

/// Initial arguments of a collective request, preserved verbatim so an
/// overtaken request can be rebuilt as a different class.
#[derive(Debug, Clone)]
pub(crate) struct CollectiveInit {
    pub root: u32,
    /// Local contribution, or the full input at the root.
    pub data: Value,
    pub op: Option<Op>,
    /// Pre-encoded payload for the broadcast root; encoding happens at the
    /// call site so encode errors surface to the caller synchronously.
    pub encoded: Option<(Command, Vec<u8>)>,
}

/// What an algorithm did with an inbound frame.
pub(crate) enum Disposition {
    /// Frame belonged to this request and advanced its state.
    Consumed,
    /// Frame consumed and the request just completed.
    Finished,
    /// Frame is not for this request; hand it back for a later one.
    Ignored(Frame),
}

/// Capability set every collective algorithm implements.
pub(crate) trait Collective: Send {
    /// Kick the state machine off. Returns `true` when the request is
    /// already complete (e.g. a broadcast root with no children left to
    /// hear from).
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError>;

    /// Feed one inbound frame to the state machine.
    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError>;

    /// Extract the operation's local result after completion. `None` for
    /// operations that produce no data on this rank.
    fn take_data(&mut self) -> Result<Option<Value>, MpiError>;
}

/// One in-flight collective operation as owned by the dispatcher.
pub(crate) struct CollectiveSlot {
    pub kind: CollectiveKind,
    pub tag: Tag,
    pub comm: CommId,
    pub class_id: u8,
    /// Per-tag instance number; assigned by the dispatcher in invocation
    /// order, which the concurrency contract makes identical on every rank.
    pub seq: u64,
    /// Set once the request has sent or consumed a frame; never cleared.
    pub dirty: bool,
    pub cell: Arc<RequestCell>,
    pub init: CollectiveInit,
    pub algo: Box<dyn Collective>,
}

/// Per-call context handed to the state machines: lets them emit frames
/// stamped with the right tag, class id, and instance number, and records
/// whether anything was sent so the dispatcher can maintain the dirty flag.
pub(crate) struct CollectiveCtx<'a> {
    engine: &'a EngineShared,
    tag: Tag,
    comm: CommId,
    class_id: u8,
    seq: u64,
    pub sent: bool,
}

impl<'a> CollectiveCtx<'a> {
    pub fn new(engine: &'a EngineShared, tag: Tag, comm: CommId, class_id: u8, seq: u64) -> Self {
        CollectiveCtx {
            engine,
            tag,
            comm,
            class_id,
            seq,
            sent: false,
        }
    }

    /// Send `payload` to `dest` under this collective's tag. The bytes are
    /// emitted as-is: transit nodes forward received payloads unchanged and
    /// nothing is ever re-encoded here.
    pub fn send(&mut self, dest: u32, command: Command, payload: Vec<u8>) -> Result<(), MpiError> {
        let frame = Frame {
            header: FrameHeader {
                command,
                sender: self.engine.rank,
                receiver: dest,
                comm_id: self.comm,
                tag: self.tag,
                ack_required: false,
                payload_len: payload.len() as u64,
            },
            coll: Some(CollectiveHeader {
                class_id: self.class_id,
                seq: self.seq,
            }),
            payload,
        };
        self.engine.send_frame(dest, frame)?;
        self.sent = true;
        Ok(())
    }
}

/// Engine-internal payloads exchanged by the collective algorithms. These
/// always travel under [`Command::ObjectGraph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum CollPayload {
    /// Barrier token.
    Token,
    /// Partially reduced, rank-ordered segments flowing towards the root.
    Segments(Vec<Segment>),
    /// Unreduced per-rank contributions.
    Ranked(Vec<(u32, Value)>),
    /// Prefix-reduction table broadcast by the scan root.
    Prefixes(Vec<Value>),
    /// Scatter chunk table indexed by global rank; `None` outside the
    /// receiver's subtree.
    Chunks(Vec<Option<Value>>),
    /// One rank's chunk in the naive all-to-all exchange.
    Single(Value),
}

/// A contiguous run of ranks `[first, first + count)` whose contributions
/// have been folded, in ascending rank order, into `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Segment {
    pub first: u32,
    pub count: u32,
    pub value: Value,
}

pub(crate) fn encode_payload(payload: &CollPayload) -> Result<Vec<u8>, MpiError> {
    Ok(bincode::serialize(payload)?)
}

pub(crate) fn decode_payload(command: Command, bytes: &[u8]) -> Result<CollPayload, MpiError> {
    if command != Command::ObjectGraph {
        return Err(MpiError::Serialization(format!(
            "collective control payload arrived with command {command:?}"
        )));
    }
    Ok(bincode::deserialize(bytes)?)
}

/// Assemble rank-keyed contributions into the rank-ordered output list.
/// List contributions are concatenated, scalars appended, matching the
/// gather convention of chunked inputs.
pub(crate) fn concat_ranked(
    mut pairs: Vec<(u32, Value)>,
    size: u32,
) -> Result<Value, MpiError> {
    pairs.sort_unstable_by_key(|(rank, _)| *rank);
    if pairs.len() != size as usize || pairs.iter().enumerate().any(|(i, (r, _))| *r != i as u32)
    {
        return Err(MpiError::Mpi(format!(
            "incomplete collective contribution set: got {} of {size} ranks",
            pairs.len()
        )));
    }
    let mut out = Vec::with_capacity(pairs.len());
    for (_, value) in pairs {
        match value {
            Value::List(items) => out.extend(items),
            other => out.push(other),
        }
    }
    Ok(Value::List(out))
}

fn tree_kind_of(class_id: u8) -> Option<TreeKind> {
    match class_id {
        CLASS_FLAT_TREE => Some(TreeKind::Flat),
        CLASS_BINOMIAL_TREE => Some(TreeKind::Binomial),
        CLASS_STATIC_FANOUT => Some(TreeKind::StaticFanout),
        _ => None,
    }
}

fn tree_settings_prefix(kind: TreeKind) -> &'static str {
    match kind {
        TreeKind::Flat => "FLAT_TREE",
        TreeKind::Binomial => "BINOMIAL_TREE",
        TreeKind::StaticFanout => "STATIC_FANOUT",
    }
}

fn class_accepts(engine: &EngineShared, kind: CollectiveKind, class_id: u8) -> bool {
    match tree_kind_of(class_id) {
        Some(tree) => {
            let (min, max) = engine
                .settings
                .accept_range(kind.settings_prefix(), tree_settings_prefix(tree));
            let size = engine.size as usize;
            size >= min && size <= max
        }
        // Dissemination and the naive exchange carry no bounds and accept
        // every size.
        None => true,
    }
}

/// Pick the algorithm class for a fresh collective request.
///
/// Candidates are tried in registry order; the broadcast root additionally
/// jumps straight to the binomial tree when its encoded payload crosses the
/// configured threshold, since only it knows the payload size.
pub(crate) fn select_class(
    engine: &EngineShared,
    kind: CollectiveKind,
    init: &CollectiveInit,
) -> Result<u8, MpiError> {
    if kind == CollectiveKind::Bcast && engine.rank == init.root {
        if let Some((_, bytes)) = &init.encoded {
            if bytes.len() >= engine.settings.large_payload_threshold
                && class_accepts(engine, kind, CLASS_BINOMIAL_TREE)
            {
                return Ok(CLASS_BINOMIAL_TREE);
            }
        }
    }

    for &class in kind.candidates() {
        if class_accepts(engine, kind, class) {
            return Ok(class);
        }
    }
    Err(MpiError::Mpi(format!(
        "no {kind:?} algorithm accepts a cohort of {}",
        engine.size
    )))
}

/// Construct the state machine for `(kind, class_id)` from the preserved
/// initial arguments. Used both for fresh requests and for overtaking.
pub(crate) fn build(
    engine: &EngineShared,
    kind: CollectiveKind,
    class_id: u8,
    init: &CollectiveInit,
) -> Result<Box<dyn Collective>, MpiError> {
    let topology = tree_kind_of(class_id).map(|tree| {
        engine.topo_cache.get(
            tree,
            engine.size,
            engine.rank,
            init.root,
            engine.settings.static_tree_fanout as u32,
        )
    });

    match kind {
        CollectiveKind::Bcast => Ok(Box::new(bcast::TreeBcast::new(
            expect_topology(topology)?,
            init,
        )?)),
        CollectiveKind::Barrier => Ok(Box::new(barrier::TreeBarrier::new(expect_topology(
            topology,
        )?))),
        CollectiveKind::Reduce => Ok(Box::new(reduce::TreeReduce::new(
            expect_topology(topology)?,
            engine.rank,
            engine.size,
            init,
            reduce::ReduceMode::Reduce,
        )?)),
        CollectiveKind::Allreduce => Ok(Box::new(reduce::TreeReduce::new(
            expect_topology(topology)?,
            engine.rank,
            engine.size,
            init,
            reduce::ReduceMode::Allreduce,
        )?)),
        CollectiveKind::Scan => Ok(Box::new(reduce::TreeScan::new(
            expect_topology(topology)?,
            engine.rank,
            engine.size,
            init,
        )?)),
        CollectiveKind::Scatter => Ok(Box::new(scatter::TreeScatter::new(
            expect_topology(topology)?,
            engine.rank,
            engine.size,
            init,
        )?)),
        CollectiveKind::Gather => Ok(Box::new(gather::TreeGather::new(
            expect_topology(topology)?,
            engine.rank,
            engine.size,
            init,
        )?)),
        CollectiveKind::Allgather => Ok(Box::new(gather::DisseminationAllgather::new(
            engine.rank,
            engine.size,
            init,
        ))),
        CollectiveKind::Alltoall => Ok(Box::new(alltoall::NaiveAlltoall::new(
            engine.rank,
            engine.size,
            init,
        )?)),
    }
}

fn expect_topology(
    topology: Option<Arc<crate::topology::Topology>>,
) -> Result<Arc<crate::topology::Topology>, MpiError> {
    topology.ok_or_else(|| MpiError::Mpi("tree collective built without a topology".into()))
}
