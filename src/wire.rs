//! # Wire Format Module
//!
//! Defines the message envelope shared by every peer connection. A frame is
//! a fixed-width little-endian header, an optional collective header, and a
//! variable-length payload:
//!
//! ```text
//! ┌─────────────────────────────┬──────────────────────┬──────────────┐
//! │ header (28 bytes, LE)       │ collective header    │ payload      │
//! │                             │ (0..=255 bytes)      │ (N bytes)    │
//! └─────────────────────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! Header fields, in order:
//!
//! - `command: u16` — encoding family or control kind
//! - `sender_rank: u32`
//! - `receiver_rank: u32`
//! - `comm_id: u32`
//! - `tag: i32` — non-negative for user traffic, reserved negative values
//!   for collective operations
//! - `ack_required: u8`
//! - `collective_header_len: u8`
//! - `payload_length: u64`
//!
//! The transport is responsible only for moving frames intact and in order;
//! all interpretation happens in the dispatcher.

use crate::error::MpiError;
use serde::{Deserialize, Serialize};

/// Rank of a process within a communicator.
pub type Rank = i32;

/// Message tag. User tags are non-negative; the runtime reserves negative
/// tags for collective traffic.
pub type Tag = i32;

/// Stable numeric identifier of a communicator. The world communicator is 0.
pub type CommId = u32;

/// Wildcard matching any sender in a posted receive.
pub const ANY_SOURCE: Rank = -1;

/// Wildcard matching any tag in a posted receive.
pub const ANY_TAG: Tag = -1;

/// Sentinel returned by `Group::translate_ranks` for unmapped ranks.
pub const UNDEFINED: Rank = -32766;

/// Id of the world communicator.
pub const WORLD_COMM_ID: CommId = 0;

// Reserved tags for collective operations. User tags must be >= 0, so these
// can never collide with point-to-point traffic.
pub(crate) const TAG_BCAST: Tag = -2;
pub(crate) const TAG_BARRIER: Tag = -3;
pub(crate) const TAG_REDUCE: Tag = -4;
pub(crate) const TAG_ALLREDUCE: Tag = -5;
pub(crate) const TAG_SCATTER: Tag = -6;
pub(crate) const TAG_GATHER: Tag = -7;
pub(crate) const TAG_ALLGATHER: Tag = -8;
pub(crate) const TAG_ALLTOALL: Tag = -9;
pub(crate) const TAG_SCAN: Tag = -10;

/// True for tags routed to the collective controller instead of the
/// point-to-point matcher.
pub(crate) fn is_collective_tag(tag: Tag) -> bool {
    (TAG_SCAN..=TAG_BCAST).contains(&tag)
}

/// Command word of a frame: the payload encoding family for data frames, or
/// a control kind for protocol frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// General object-graph payload (bincode).
    ObjectGraph = 0,
    /// Identity-encoded byte string.
    ByteString = 1,
    /// Dense numeric array: raw element bytes plus an
    /// `(element_type, shape)` sidecar.
    RawArray = 2,
    /// Acknowledgement of a synchronous send. No payload.
    Ack = 3,
    /// Goodbye frame emitted during shutdown. No payload.
    Shutdown = 4,
}

impl Command {
    pub(crate) fn from_u16(raw: u16) -> Result<Self, MpiError> {
        match raw {
            0 => Ok(Command::ObjectGraph),
            1 => Ok(Command::ByteString),
            2 => Ok(Command::RawArray),
            3 => Ok(Command::Ack),
            4 => Ok(Command::Shutdown),
            other => Err(MpiError::Transport(format!(
                "unknown command word {other} in frame header"
            ))),
        }
    }
}

/// Size of the fixed header in bytes.
pub(crate) const HEADER_LEN: usize = 28;

/// Upper bound on a single payload; a larger length in a header is treated
/// as a framing violation.
pub(crate) const MAX_PAYLOAD: u64 = 1 << 30;

/// Opaque tuple carried by collective frames: the algorithm class chosen by
/// the sender, and the per-tag instance number of the operation the frame
/// belongs to. Receivers compare the class against their own choice and may
/// overtake their in-flight request; the instance number keeps pipelined
/// collectives apart when consecutive operations use differently shaped
/// trees (frames then travel different connections, so per-connection FIFO
/// alone cannot separate them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CollectiveHeader {
    pub class_id: u8,
    pub seq: u64,
}

/// Decoded fixed header of one frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameHeader {
    pub command: Command,
    pub sender: u32,
    pub receiver: u32,
    pub comm_id: CommId,
    pub tag: Tag,
    pub ack_required: bool,
    pub payload_len: u64,
}

/// One complete frame as read from, or written to, a peer connection.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub header: FrameHeader,
    pub coll: Option<CollectiveHeader>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize the entire frame into one contiguous buffer ready for a
    /// single write.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MpiError> {
        let coll_bytes = match &self.coll {
            Some(h) => bincode::serialize(h)?,
            None => Vec::new(),
        };
        if coll_bytes.len() > u8::MAX as usize {
            return Err(MpiError::Transport(
                "collective header exceeds 255 bytes".into(),
            ));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + coll_bytes.len() + self.payload.len());
        buf.extend_from_slice(&(self.header.command as u16).to_le_bytes());
        buf.extend_from_slice(&self.header.sender.to_le_bytes());
        buf.extend_from_slice(&self.header.receiver.to_le_bytes());
        buf.extend_from_slice(&self.header.comm_id.to_le_bytes());
        buf.extend_from_slice(&self.header.tag.to_le_bytes());
        buf.push(self.header.ack_required as u8);
        buf.push(coll_bytes.len() as u8);
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&coll_bytes);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Parse a fixed header. Returns the header plus the collective-header
/// length that follows it on the stream.
pub(crate) fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<(FrameHeader, usize), MpiError> {
    let command = Command::from_u16(u16::from_le_bytes([buf[0], buf[1]]))?;
    let sender = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let receiver = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let comm_id = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let tag = i32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
    let ack_required = buf[18] != 0;
    let coll_len = buf[19] as usize;
    let payload_len = u64::from_le_bytes([
        buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
    ]);

    if payload_len > MAX_PAYLOAD {
        return Err(MpiError::Transport(format!(
            "payload length {payload_len} exceeds the {MAX_PAYLOAD} byte frame limit"
        )));
    }

    Ok((
        FrameHeader {
            command,
            sender,
            receiver,
            comm_id,
            tag,
            ack_required,
            payload_len,
        },
        coll_len,
    ))
}

pub(crate) fn decode_collective_header(bytes: &[u8]) -> Result<CollectiveHeader, MpiError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(coll: Option<CollectiveHeader>) -> Frame {
        Frame {
            header: FrameHeader {
                command: Command::ObjectGraph,
                sender: 3,
                receiver: 7,
                comm_id: WORLD_COMM_ID,
                tag: 42,
                ack_required: true,
                payload_len: 5,
            },
            coll,
            payload: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn test_header_round_trip() {
        let frame = sample_frame(None);
        let bytes = frame.to_bytes().unwrap();
        assert!(bytes.len() >= HEADER_LEN);

        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&bytes[..HEADER_LEN]);
        let (header, coll_len) = decode_header(&head).unwrap();

        assert_eq!(header.command, Command::ObjectGraph);
        assert_eq!(header.sender, 3);
        assert_eq!(header.receiver, 7);
        assert_eq!(header.tag, 42);
        assert!(header.ack_required);
        assert_eq!(header.payload_len, 5);
        assert_eq!(coll_len, 0);
        assert_eq!(&bytes[HEADER_LEN..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_collective_header_round_trip() {
        let frame = sample_frame(Some(CollectiveHeader {
            class_id: 1,
            seq: 3,
        }));
        let bytes = frame.to_bytes().unwrap();

        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&bytes[..HEADER_LEN]);
        let (_, coll_len) = decode_header(&head).unwrap();
        assert!(coll_len > 0);

        let coll = decode_collective_header(&bytes[HEADER_LEN..HEADER_LEN + coll_len]).unwrap();
        assert_eq!(coll.class_id, 1);
        assert_eq!(coll.seq, 3);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let frame = sample_frame(None);
        let mut bytes = frame.to_bytes().unwrap();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;

        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&bytes[..HEADER_LEN]);
        assert!(decode_header(&head).is_err());
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut frame = sample_frame(None);
        frame.header.payload_len = MAX_PAYLOAD + 1;
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&frame.to_bytes().unwrap()[..HEADER_LEN]);
        // Patch the length field past the limit.
        head[20..28].copy_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        assert!(decode_header(&head).is_err());
    }

    #[test]
    fn test_collective_tag_range() {
        assert!(is_collective_tag(TAG_BCAST));
        assert!(is_collective_tag(TAG_SCAN));
        assert!(!is_collective_tag(0));
        assert!(!is_collective_tag(ANY_TAG));
        assert!(!is_collective_tag(17));
    }
}
