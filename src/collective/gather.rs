//! Tree gather and the dissemination allgather.
//!
//! Gather is the inverse of scatter: `(rank, value)` pairs accumulate up
//! the tree and the root assembles the rank-ordered result, concatenating
//! list contributions and appending scalars.
//!
//! Allgather uses the dissemination algorithm: in round `k` every rank
//! sends its accumulated buffer to `(r + 2^k) mod size` and expects the
//! buffer of `(r - 2^k) mod size`, doubling coverage each round. Frames
//! overtaking their round are buffered and replayed once the round
//! advances.

use super::{
    concat_ranked, decode_payload, encode_payload, Collective, CollectiveCtx, CollectiveInit,
    CollPayload, Disposition,
};
use crate::error::MpiError;
use crate::serializer::Value;
use crate::topology::Topology;
use crate::wire::{Command, Frame};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) struct TreeGather {
    topology: Arc<Topology>,
    size: u32,
    pairs: Vec<(u32, Value)>,
    missing_children: Vec<u32>,
    result: Option<Value>,
    done: bool,
}

impl TreeGather {
    pub fn new(
        topology: Arc<Topology>,
        rank: u32,
        size: u32,
        init: &CollectiveInit,
    ) -> Result<Self, MpiError> {
        let missing_children = topology.children().to_vec();
        Ok(TreeGather {
            topology,
            size,
            pairs: vec![(rank, init.data.clone())],
            missing_children,
            result: None,
            done: false,
        })
    }

    fn subtree_complete(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<(), MpiError> {
        match self.topology.parent() {
            Some(parent) => {
                let payload = encode_payload(&CollPayload::Ranked(std::mem::take(
                    &mut self.pairs,
                )))?;
                ctx.send(parent, Command::ObjectGraph, payload)?;
            }
            None => {
                self.result = Some(concat_ranked(std::mem::take(&mut self.pairs), self.size)?);
            }
        }
        self.done = true;
        Ok(())
    }
}

impl Collective for TreeGather {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if self.missing_children.is_empty() {
            self.subtree_complete(ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        if self.done {
            return Ok(Disposition::Ignored(frame));
        }
        let Some(pos) = self.missing_children.iter().position(|&c| c == sender) else {
            return Ok(Disposition::Ignored(frame));
        };
        let CollPayload::Ranked(incoming) = decode_payload(frame.header.command, &frame.payload)?
        else {
            return Err(MpiError::Serialization(
                "gather expected ranked payload".into(),
            ));
        };
        self.missing_children.remove(pos);
        self.pairs.extend(incoming);
        if self.missing_children.is_empty() {
            self.subtree_complete(ctx)?;
            return Ok(Disposition::Finished);
        }
        Ok(Disposition::Consumed)
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        Ok(self.result.take())
    }
}

pub(crate) struct DisseminationAllgather {
    rank: u32,
    size: u32,
    rounds: u32,
    round: u32,
    accumulated: BTreeMap<u32, Value>,
    /// Frames that arrived ahead of their round.
    buffered: Vec<Frame>,
    done: bool,
}

impl DisseminationAllgather {
    pub fn new(rank: u32, size: u32, init: &CollectiveInit) -> Self {
        let rounds = if size > 1 {
            32 - (size - 1).leading_zeros()
        } else {
            0
        };
        let mut accumulated = BTreeMap::new();
        accumulated.insert(rank, init.data.clone());
        DisseminationAllgather {
            rank,
            size,
            rounds,
            round: 0,
            accumulated,
            buffered: Vec::new(),
            done: false,
        }
    }

    fn offset(&self) -> u32 {
        1 << self.round
    }

    fn expected_sender(&self) -> u32 {
        (self.rank + self.size - self.offset() % self.size) % self.size
    }

    fn send_round(&self, ctx: &mut CollectiveCtx<'_>) -> Result<(), MpiError> {
        let dest = (self.rank + self.offset()) % self.size;
        let pairs: Vec<(u32, Value)> = self
            .accumulated
            .iter()
            .map(|(rank, value)| (*rank, value.clone()))
            .collect();
        let payload = encode_payload(&CollPayload::Ranked(pairs))?;
        ctx.send(dest, Command::ObjectGraph, payload)
    }

    fn merge(&mut self, frame: &Frame) -> Result<(), MpiError> {
        let CollPayload::Ranked(incoming) = decode_payload(frame.header.command, &frame.payload)?
        else {
            return Err(MpiError::Serialization(
                "allgather expected ranked payload".into(),
            ));
        };
        for (rank, value) in incoming {
            self.accumulated.entry(rank).or_insert(value);
        }
        Ok(())
    }

    /// Advance past the round just satisfied, replaying any buffered frame
    /// that matches the new expected sender. Returns `true` once all rounds
    /// are done.
    fn advance(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        loop {
            self.round += 1;
            if self.round >= self.rounds {
                if self.accumulated.len() != self.size as usize {
                    return Err(MpiError::Mpi(format!(
                        "allgather finished with {} of {} contributions",
                        self.accumulated.len(),
                        self.size
                    )));
                }
                return Ok(true);
            }
            self.send_round(ctx)?;
            let expected = self.expected_sender();
            match self
                .buffered
                .iter()
                .position(|f| f.header.sender == expected)
            {
                Some(pos) => {
                    let frame = self.buffered.remove(pos);
                    self.merge(&frame)?;
                }
                None => return Ok(false),
            }
        }
    }
}

impl Collective for DisseminationAllgather {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if self.size == 1 {
            self.done = true;
            return Ok(true);
        }
        self.send_round(ctx)?;
        Ok(false)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        if self.done {
            return Ok(Disposition::Ignored(frame));
        }
        if sender != self.expected_sender() {
            // Ahead of its round; hold on to it.
            self.buffered.push(frame);
            return Ok(Disposition::Consumed);
        }
        self.merge(&frame)?;
        if self.advance(ctx)? {
            self.done = true;
            return Ok(Disposition::Finished);
        }
        Ok(Disposition::Consumed)
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        if !self.done {
            return Ok(None);
        }
        let pairs: Vec<(u32, Value)> = std::mem::take(&mut self.accumulated)
            .into_iter()
            .collect();
        Ok(Some(concat_ranked(pairs, self.size)?))
    }
}
