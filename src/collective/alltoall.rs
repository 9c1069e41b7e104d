//! Naive all-to-all exchange.
//!
//! Every rank owns a list with one entry per peer; entry `j` travels
//! directly to rank `j`. Each rank therefore issues `size - 1` sends up
//! front and completes once `size - 1` peer chunks have arrived. No tree is
//! involved, so a duplicate frame from a peer can only belong to a later
//! exchange and is handed back to the dispatcher.

use super::{
    concat_ranked, decode_payload, encode_payload, Collective, CollectiveCtx, CollectiveInit,
    CollPayload, Disposition,
};
use crate::error::MpiError;
use crate::serializer::Value;
use crate::wire::{Command, Frame};
use std::collections::BTreeMap;

pub(crate) struct NaiveAlltoall {
    rank: u32,
    size: u32,
    outgoing: Vec<Value>,
    received: BTreeMap<u32, Value>,
    done: bool,
}

impl NaiveAlltoall {
    pub fn new(rank: u32, size: u32, init: &CollectiveInit) -> Result<Self, MpiError> {
        let outgoing = init
            .data
            .as_list()
            .filter(|items| items.len() == size as usize)
            .map(<[Value]>::to_vec)
            .ok_or_else(|| {
                MpiError::Mpi(format!(
                    "alltoall requires a list with one entry per rank ({size})"
                ))
            })?;
        Ok(NaiveAlltoall {
            rank,
            size,
            outgoing,
            received: BTreeMap::new(),
            done: false,
        })
    }
}

impl Collective for NaiveAlltoall {
    fn start(&mut self, ctx: &mut CollectiveCtx<'_>) -> Result<bool, MpiError> {
        let chunks = std::mem::take(&mut self.outgoing);
        for (dest, chunk) in chunks.into_iter().enumerate() {
            if dest as u32 == self.rank {
                self.received.insert(self.rank, chunk);
            } else {
                let payload = encode_payload(&CollPayload::Single(chunk))?;
                ctx.send(dest as u32, Command::ObjectGraph, payload)?;
            }
        }
        if self.size == 1 {
            self.done = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn accept_msg(
        &mut self,
        sender: u32,
        frame: Frame,
        _ctx: &mut CollectiveCtx<'_>,
    ) -> Result<Disposition, MpiError> {
        if self.done || self.received.contains_key(&sender) {
            return Ok(Disposition::Ignored(frame));
        }
        let CollPayload::Single(value) = decode_payload(frame.header.command, &frame.payload)?
        else {
            return Err(MpiError::Serialization(
                "alltoall expected a single-chunk payload".into(),
            ));
        };
        self.received.insert(sender, value);
        if self.received.len() == self.size as usize {
            self.done = true;
            return Ok(Disposition::Finished);
        }
        Ok(Disposition::Consumed)
    }

    fn take_data(&mut self) -> Result<Option<Value>, MpiError> {
        if !self.done {
            return Ok(None);
        }
        let pairs: Vec<(u32, Value)> = std::mem::take(&mut self.received).into_iter().collect();
        Ok(Some(concat_ranked(pairs, self.size)?))
    }
}
