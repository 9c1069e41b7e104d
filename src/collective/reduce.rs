//! Tree reduce, allreduce, and scan.
//!
//! ## Reduce
//!
//! Contributions climb the tree as rank-ordered [`Segment`]s. A segment is
//! a contiguous run of ranks whose values have already been folded, in
//! ascending rank order, into one value; interior nodes merge their own
//! contribution with their children's segments and coalesce neighbours.
//! Because only adjacent runs are ever combined, the final fold at the root
//! applies the operator exactly in ascending rank order, which keeps
//! non-commutative operators correct for every root and tree shape.
//!
//! ## Allreduce
//!
//! A reduce followed by a broadcast of the result down the same tree; the
//! downward payload is serializer-encoded once at the root and forwarded by
//! interior nodes without re-encoding.
//!
//! ## Scan
//!
//! Per-rank values are gathered unreduced to the root, which computes the
//! full prefix table `P_r = v_0 ⊕ … ⊕ v_r` and floods it back down the
//! tree; every rank extracts its own entry.

use super::{
    decode_payload, encode_payload, Collective, CollectiveCtx, CollectiveInit, CollPayload,
    Disposition, Segment,
};
use crate::error::MpiError;
use crate::op::Op;
use crate::serializer::{self, Value};
use crate::topology::Topology;
use crate::wire::{Command, Frame};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReduceMode {
    /// Result lands on the root only.
    Reduce,
    /// Result is broadcast back down to every rank.
    Allreduce,
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Up,
    AwaitingDown,
    Done,
}

pub(crate) struct TreeReduce {
    topology: Arc<Topology>,
    size: u32,
    op: Op,
    mode: ReduceMode,
    segments: Vec<Segment>,
    missing_children: Vec<u32>,
    phase: Phase,
    /// Root-side result, or the decoded downward payload on other ranks.
    result: Option<Value>,
    /// Raw downward payload on transit ranks, decoded lazily.
    stored_down: Option<(Command, Vec<u8>)>,
}

impl TreeReduce {
    pub fn new(
        topology: Arc<Topology>,
        rank: u32,
        size: u32,
        init: &CollectiveInit,
        mode: ReduceMode,
    ) -> Result<Self, MpiError> {
        let op = init
            .op
            .ok_or_else(|| MpiError::Mpi("reduce invoked without an operator".into()))?;
        let missing_children = topology.children().to_vec();
        Ok(TreeReduce {
            topology,
            size,
            op,
            mode,
            segments: vec![Segment {
                first: rank,
                count: 1,
                value: init.data.clone(),
            }],
            missing_children,
            phase: Phase::Up,
            result: None,
            stored_down: None,
        })
    }

    fn is_root(&self) -> bool {
        self.topology.parent().is_none()
    }

    /// Insert new segments and fold every adjacent pair. Sorting first
    /// keeps the folds in ascending rank order.
    fn merge_segments(&mut self, incoming: Vec<Segment>) -> Result<(), MpiError> {
        self.segments.extend(incoming);
        self.segments.sort_unstable_by_key(|s| s.first);

        let mut merged: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            match merged.last_mut() {
                Some(last) if last.first + last.count == segment.first => {
                    last.value = self.op.apply(&last.value, &segment.value)?;
                    last.count += segment.count;
                }
                _ => merged.push(segment),
            }
        }
        self.segments = merged;
        Ok(())
    }

    /// All children heard; either push the subtree result up or, at the
    /// root, finish the fold and start the downward phase if required.
    fn subtree_complete(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if !self.is_root() {
            let parent = self.topology.parent().unwrap();
            let payload = encode_payload(&CollPayload::Segments(self.segments.clone()))?;
            ctx.send(parent, Command::ObjectGraph, payload)?;
            return match self.mode {
                // Plain reduce: nothing further flows down to us.
                ReduceMode::Reduce => {
                    self.phase = Phase::Done;
                    Ok(true)
                }
                ReduceMode::Allreduce => {
                    self.phase = Phase::AwaitingDown;
                    Ok(false)
                }
            };
        }

        // Root: the coalesced segments must now cover the whole cohort.
        if self.segments.len() != 1
            || self.segments[0].first != 0
            || self.segments[0].count != self.size
        {
            return Err(MpiError::Mpi(format!(
                "reduce tree delivered incomplete coverage: {:?} of {} ranks",
                self.segments.iter().map(|s| (s.first, s.count)).collect::<Vec<_>>(),
                self.size
            )));
        }
        let result = self.segments.remove(0).value;

        if self.mode == ReduceMode::Allreduce {
            let (command, bytes) = serializer::encode(&result)?;
            for &child in self.topology.children() {
                ctx.send(child, command, bytes.clone())?;
            }
        }
        self.result = Some(result);
        self.phase = Phase::Done;
        Ok(true)
    }
}

impl Collective for TreeReduce {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if self.missing_children.is_empty() {
            // Leaves contribute right away; a childless root is a cohort of
            // one and completes on the spot.
            return self.subtree_complete(ctx);
        }
        Ok(false)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        match self.phase {
            Phase::Up => {
                let Some(pos) = self.missing_children.iter().position(|&c| c == sender) else {
                    return Ok(Disposition::Ignored(frame));
                };
                let CollPayload::Segments(incoming) =
                    decode_payload(frame.header.command, &frame.payload)?
                else {
                    return Err(MpiError::Serialization(
                        "reduce expected segment payload".into(),
                    ));
                };
                self.missing_children.remove(pos);
                self.merge_segments(incoming)?;
                if self.missing_children.is_empty() {
                    if self.subtree_complete(ctx)? {
                        return Ok(Disposition::Finished);
                    }
                }
                Ok(Disposition::Consumed)
            }
            Phase::AwaitingDown => {
                if Some(sender) != self.topology.parent() {
                    return Ok(Disposition::Ignored(frame));
                }
                // Transit forwarding of the final value.
                let command = frame.header.command;
                for &child in self.topology.children() {
                    ctx.send(child, command, frame.payload.clone())?;
                }
                self.stored_down = Some((command, frame.payload));
                self.phase = Phase::Done;
                Ok(Disposition::Finished)
            }
            Phase::Done => Ok(Disposition::Ignored(frame)),
        }
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        if let Some(result) = self.result.take() {
            return Ok(Some(result));
        }
        match (self.mode, self.stored_down.take()) {
            (ReduceMode::Allreduce, Some((command, bytes))) => {
                Ok(Some(serializer::decode(command, &bytes)?))
            }
            _ => Ok(None),
        }
    }
}

pub(crate) struct TreeScan {
    topology: Arc<Topology>,
    rank: u32,
    size: u32,
    op: Op,
    pairs: Vec<(u32, Value)>,
    missing_children: Vec<u32>,
    phase: Phase,
    result: Option<Value>,
    stored_down: Option<(Command, Vec<u8>)>,
}

impl TreeScan {
    pub fn new(
        topology: Arc<Topology>,
        rank: u32,
        size: u32,
        init: &CollectiveInit,
    ) -> Result<Self, MpiError> {
        let op = init
            .op
            .ok_or_else(|| MpiError::Mpi("scan invoked without an operator".into()))?;
        let missing_children = topology.children().to_vec();
        Ok(TreeScan {
            topology,
            rank,
            size,
            op,
            pairs: vec![(rank, init.data.clone())],
            missing_children,
            phase: Phase::Up,
            result: None,
            stored_down: None,
        })
    }

    fn subtree_complete(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        match self.topology.parent() {
            Some(parent) => {
                let payload = encode_payload(&CollPayload::Ranked(self.pairs.clone()))?;
                ctx.send(parent, Command::ObjectGraph, payload)?;
                self.phase = Phase::AwaitingDown;
                Ok(false)
            }
            None => {
                // Root holds every contribution; build the prefix table.
                self.pairs.sort_unstable_by_key(|(rank, _)| *rank);
                if self.pairs.len() != self.size as usize {
                    return Err(MpiError::Mpi(format!(
                        "scan gathered {} of {} contributions",
                        self.pairs.len(),
                        self.size
                    )));
                }
                let mut prefixes: Vec<Value> = Vec::with_capacity(self.pairs.len());
                for (_, value) in &self.pairs {
                    let next = match prefixes.last() {
                        Some(prev) => self.op.apply(prev, value)?,
                        None => value.clone(),
                    };
                    prefixes.push(next);
                }
                self.result = Some(prefixes[self.rank as usize].clone());

                let bytes = encode_payload(&CollPayload::Prefixes(prefixes))?;
                for &child in self.topology.children() {
                    ctx.send(child, Command::ObjectGraph, bytes.clone())?;
                }
                self.phase = Phase::Done;
                Ok(true)
            }
        }
    }
}

impl Collective for TreeScan {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if self.missing_children.is_empty() {
            return self.subtree_complete(ctx);
        }
        Ok(false)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        match self.phase {
            Phase::Up => {
                let Some(pos) = self.missing_children.iter().position(|&c| c == sender) else {
                    return Ok(Disposition::Ignored(frame));
                };
                let CollPayload::Ranked(incoming) =
                    decode_payload(frame.header.command, &frame.payload)?
                else {
                    return Err(MpiError::Serialization(
                        "scan expected ranked payload".into(),
                    ));
                };
                self.missing_children.remove(pos);
                self.pairs.extend(incoming);
                if self.missing_children.is_empty() {
                    if self.subtree_complete(ctx)? {
                        return Ok(Disposition::Finished);
                    }
                }
                Ok(Disposition::Consumed)
            }
            Phase::AwaitingDown => {
                if Some(sender) != self.topology.parent() {
                    return Ok(Disposition::Ignored(frame));
                }
                // The prefix table is identical everywhere; forward raw.
                let command = frame.header.command;
                for &child in self.topology.children() {
                    ctx.send(child, command, frame.payload.clone())?;
                }
                self.stored_down = Some((command, frame.payload));
                self.phase = Phase::Done;
                Ok(Disposition::Finished)
            }
            Phase::Done => Ok(Disposition::Ignored(frame)),
        }
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        if let Some(result) = self.result.take() {
            return Ok(Some(result));
        }
        match self.stored_down.take() {
            Some((command, bytes)) => {
                let CollPayload::Prefixes(prefixes) = decode_payload(command, &bytes)? else {
                    return Err(MpiError::Serialization(
                        "scan expected prefix payload".into(),
                    ));
                };
                prefixes
                    .into_iter()
                    .nth(self.rank as usize)
                    .map(Some)
                    .ok_or_else(|| {
                        MpiError::Mpi("scan prefix table shorter than cohort".into())
                    })
            }
            None => Ok(None),
        }
    }
}
