//! Tree broadcast.
//!
//! The root encodes its payload once and sends it to every child; interior
//! nodes store the raw bytes, forward them unchanged to their own children
//! (transit, no re-encoding), and decode only when the caller collects the
//! result. Works over any of the tree shapes; the shape in use travels in
//! the collective header so receivers can overtake to the root's choice.

use super::{Collective, CollectiveCtx, CollectiveInit, Disposition};
use crate::error::MpiError;
use crate::serializer::{self, Value};
use crate::topology::Topology;
use crate::wire::{Command, Frame};
use std::sync::Arc;

pub(crate) struct TreeBcast {
    topology: Arc<Topology>,
    /// Payload in wire form: the root's own encoding, or the bytes received
    /// from the parent.
    stored: Option<(Command, Vec<u8>)>,
    /// The root keeps its decoded input so `take_data` returns it without a
    /// decode round-trip.
    root_value: Option<Value>,
    done: bool,
}

impl TreeBcast {
    pub fn new(topology: Arc<Topology>, init: &CollectiveInit) -> Result<Self, MpiError> {
        let is_root = topology.parent().is_none();
        let (stored, root_value) = if is_root {
            let encoded = match &init.encoded {
                Some(encoded) => encoded.clone(),
                None => serializer::encode(&init.data)?,
            };
            (Some(encoded), Some(init.data.clone()))
        } else {
            (None, None)
        };
        Ok(TreeBcast {
            topology,
            stored,
            root_value,
            done: false,
        })
    }
}

impl Collective for TreeBcast {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        if self.topology.parent().is_some() {
            // Non-roots wait for the payload to arrive.
            return Ok(false);
        }
        let (command, bytes) = self
            .stored
            .clone()
            .ok_or_else(|| MpiError::Mpi("broadcast root started without data".into()))?;
        for &child in self.topology.children() {
            ctx.send(child, command, bytes.clone())?;
        }
        self.done = true;
        Ok(true)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        if self.done || Some(sender) != self.topology.parent() {
            return Ok(Disposition::Ignored(frame));
        }

        // Transit: pass the received bytes straight through.
        let command = frame.header.command;
        for &child in self.topology.children() {
            ctx.send(child, command, frame.payload.clone())?;
        }
        self.stored = Some((command, frame.payload));
        self.done = true;
        Ok(Disposition::Finished)
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        if let Some(value) = self.root_value.take() {
            return Ok(Some(value));
        }
        match self.stored.take() {
            Some((command, bytes)) => Ok(Some(serializer::decode(command, &bytes)?)),
            None => Ok(None),
        }
    }
}
