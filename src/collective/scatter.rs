//! Tree scatter.
//!
//! The root splits its input list into `size` equal chunks — chunk `i` is
//! destined for rank `i`; when the length is not divisible the trailing
//! remainder is silently dropped — and sends each child a `size`-slot table
//! holding only the chunks for that child's subtree. Interior nodes keep
//! their own slot and forward the rest downwards, so no node ever sees
//! chunks outside its subtree.

use super::{
    decode_payload, encode_payload, Collective, CollectiveCtx, CollectiveInit, CollPayload,
    Disposition,
};
use crate::error::MpiError;
use crate::serializer::Value;
use crate::topology::Topology;
use crate::wire::{Command, Frame};
use std::sync::Arc;

pub(crate) struct TreeScatter {
    topology: Arc<Topology>,
    rank: u32,
    size: u32,
    /// Full chunk table at the root until `start` distributes it.
    table: Option<Vec<Option<Value>>>,
    own: Option<Value>,
    done: bool,
}

impl TreeScatter {
    pub fn new(
        topology: Arc<Topology>,
        rank: u32,
        size: u32,
        init: &CollectiveInit,
    ) -> Result<Self, MpiError> {
        let is_root = topology.parent().is_none();
        let (table, own) = if is_root {
            let items = init.data.as_list().ok_or_else(|| {
                MpiError::Mpi("scatter requires a list payload at the root".into())
            })?;
            // Equal chunks; a non-divisible tail is dropped by design.
            let chunk_len = items.len() / size as usize;
            let mut table: Vec<Option<Value>> = Vec::with_capacity(size as usize);
            for i in 0..size as usize {
                table.push(Some(Value::List(
                    items[i * chunk_len..(i + 1) * chunk_len].to_vec(),
                )));
            }
            let own = table[rank as usize].clone();
            (Some(table), own)
        } else {
            (None, None)
        };
        Ok(TreeScatter {
            topology,
            rank,
            size,
            table,
            own,
            done: false,
        })
    }

    /// Send each child the table slice covering its subtree.
    fn distribute(
        &self,
        table: &[Option<Value>],
        ctx: &mut CollectiveCtx<'_>,
    ) -> Result<(), MpiError> {
        for &child in self.topology.children() {
            let mut subtable: Vec<Option<Value>> = vec![None; self.size as usize];
            subtable[child as usize] = table[child as usize].clone();
            for &descendant in self.topology.descendants(child) {
                subtable[descendant as usize] = table[descendant as usize].clone();
            }
            let payload = encode_payload(&CollPayload::Chunks(subtable))?;
            ctx.send(child, Command::ObjectGraph, payload)?;
        }
        Ok(())
    }
}

impl Collective for TreeScatter {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        let Some(table) = self.table.take() else {
            return Ok(false);
        };
        self.distribute(&table, ctx)?;
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
        let CollPayload::Chunks(table) = decode_payload(frame.header.command, &frame.payload)?
        else {
            return Err(MpiError::Serialization(
                "scatter expected chunk payload".into(),
            ));
        };
        if table.len() != self.size as usize {
            return Err(MpiError::Mpi(format!(
                "scatter chunk table holds {} slots for a cohort of {}",
                table.len(),
                self.size
            )));
        }
        self.own = table[self.rank as usize].clone();
        self.distribute(&table, ctx)?;
        self.done = true;
        Ok(Disposition::Finished)
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        self.own
            .take()
            .map(Some)
            .ok_or_else(|| MpiError::Mpi("scatter finished without a local chunk".into()))
    }
}
