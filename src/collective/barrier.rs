//! Two-phase tree barrier.
//!
//! Tokens flow up the tree first: leaves send immediately, interior nodes
//! wait for every child before notifying their parent. Once the root has
//! heard from its whole subtree it releases a downward wave; each node
//! forwards the release to its children and exits. Completion is signalled
//! on the downward traversal, so no rank leaves the barrier before every
//! rank has entered it.

use super::{encode_payload, Collective, CollectiveCtx, CollPayload, Disposition};
use crate::error::MpiError;
use crate::serializer::Value;
use crate::topology::Topology;
use crate::wire::{Command, Frame};
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting for tokens from the listed children.
    CollectingChildren,
    /// Upward token sent; waiting for the release from the parent.
    AwaitingParent,
    Done,
}

pub(crate) struct TreeBarrier {
    topology: Arc<Topology>,
    missing_children: Vec<u32>,
    phase: Phase,
}

impl TreeBarrier {
    pub fn new(topology: Arc<Topology>) -> Self {
        let missing_children = topology.children().to_vec();
        TreeBarrier {
            topology,
            missing_children,
            phase: Phase::CollectingChildren,
        }
    }

    fn token(&self) -> Result<Vec<u8>, MpiError> {
        encode_payload(&CollPayload::Token)
    }

    fn release_children(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<(), MpiError> {
        let token = self.token()?;
        for &child in self.topology.children() {
            ctx.send(child, Command::ObjectGraph, token.clone())?;
        }
        self.phase = Phase::Done;
        Ok(())
    }
}

impl Collective for TreeBarrier {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if !self.missing_children.is_empty() {
            return Ok(false);
        }
        match self.topology.parent() {
            Some(parent) => {
                // Leaf: nothing to wait for below, notify upwards.
                ctx.send(parent, Command::ObjectGraph, self.token()?)?;
                self.phase = Phase::AwaitingParent;
                Ok(false)
            }
            None => {
                // Single-rank cohort: nobody to synchronize with.
                self.phase = Phase::Done;
                Ok(true)
            }
        }
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        match self.phase {
            Phase::CollectingChildren => {
                let Some(pos) = self.missing_children.iter().position(|&c| c == sender) else {
                    return Ok(Disposition::Ignored(frame));
                };
                self.missing_children.remove(pos);
                if !self.missing_children.is_empty() {
                    return Ok(Disposition::Consumed);
                }
                match self.topology.parent() {
                    Some(parent) => {
                        ctx.send(parent, Command::ObjectGraph, self.token()?)?;
                        self.phase = Phase::AwaitingParent;
                        Ok(Disposition::Consumed)
                    }
                    None => {
                        // Root has heard from the whole tree; release it.
                        self.release_children(ctx)?;
                        Ok(Disposition::Finished)
                    }
                }
            }
            Phase::AwaitingParent => {
                if Some(sender) != self.topology.parent() {
                    return Ok(Disposition::Ignored(frame));
                }
                self.release_children(ctx)?;
                Ok(Disposition::Finished)
            }
            Phase::Done => Ok(Disposition::Ignored(frame)),
        }
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        Ok(None)
    }
}
