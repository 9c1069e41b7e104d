//! # Transport Module
//!
//! Maintains one duplex TCP stream per peer and moves whole frames across
//! them. The transport performs no matching: reader tasks decode frames and
//! hand them to the dispatcher; writer tasks drain per-connection queues so
//! outbound frames from any task are serialized per connection.
//!
//! ## Mesh establishment
//!
//! Connection setup is deterministic: rank `r` dials every peer with a
//! lower rank (retrying while the cohort boots) and accepts one connection
//! from every peer with a higher rank. A dialing peer identifies itself
//! with a 4-byte hello carrying its rank, so the acceptor can place the
//! stream in the right slot.
//!
//! ## Failure policy
//!
//! Loss of a peer connection during normal operation is unrecoverable: the
//! reader logs the fault and terminates the process. During shutdown each
//! peer sends a goodbye frame; reads that fail after the engine has begun
//! closing are treated as orderly teardown.

use crate::engine::Event;
use crate::error::MpiError;
use crate::settings::Settings;
use crate::wire::{
    decode_collective_header, decode_header, Command, Frame, FrameHeader, Rank, HEADER_LEN,
    WORLD_COMM_ID,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Network address of one cohort member, as provided by the launcher.
#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub rank: Rank,
    pub host: String,
    pub port: u16,
}

/// Established peer mesh: one outbound queue per remote rank plus the
/// reader/writer tasks that service the connections.
pub(crate) struct Transport {
    pub senders: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Establish the full mesh for `rank` in a cohort of `size`.
///
/// `listener` must already be bound to this rank's advertised address.
/// Returns once a stream to every peer exists.
pub(crate) async fn connect_all(
    rank: u32,
    size: u32,
    listener: TcpListener,
    peers: &[PeerAddr],
    settings: &Settings,
    events: mpsc::UnboundedSender<Event>,
    closing: Arc<AtomicBool>,
) -> Result<Transport, MpiError> {
    let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

    // Dial every lower rank, retrying while the cohort boots.
    for peer in peers.iter().filter(|p| (p.rank as u32) < rank) {
        let addr = format!("{}:{}", peer.host, peer.port);
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(err) => {
                    attempt += 1;
                    if attempt >= settings.connect_attempts {
                        return Err(MpiError::Transport(format!(
                            "failed to reach rank {} at {addr} after {attempt} attempts: {err}",
                            peer.rank
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(settings.connect_retry_ms)).await;
                }
            }
        };
        let mut stream = configure_stream(stream, settings.socket_buffer_size)?;
        stream.write_all(&rank.to_le_bytes()).await?;
        stream.flush().await?;
        debug!(peer = peer.rank, %addr, "dialed peer");
        streams[peer.rank as usize] = Some(stream);
    }

    // Accept one connection from every higher rank. The hello frame tells
    // us which one just arrived; arrival order is not deterministic.
    let expected_accepts = (size - 1 - rank) as usize;
    for _ in 0..expected_accepts {
        let (stream, remote) = listener.accept().await?;
        let mut stream = configure_stream(stream, settings.socket_buffer_size)?;
        let mut hello = [0u8; 4];
        stream.read_exact(&mut hello).await?;
        let peer_rank = u32::from_le_bytes(hello);
        if peer_rank <= rank || peer_rank >= size {
            return Err(MpiError::Transport(format!(
                "unexpected hello from rank {peer_rank} (remote {remote})"
            )));
        }
        if streams[peer_rank as usize].is_some() {
            return Err(MpiError::Transport(format!(
                "duplicate connection from rank {peer_rank}"
            )));
        }
        debug!(peer = peer_rank, %remote, "accepted peer");
        streams[peer_rank as usize] = Some(stream);
    }

    // Split every stream and hand each half to its task.
    let mut senders: Vec<Option<mpsc::UnboundedSender<Frame>>> =
        (0..size).map(|_| None).collect();
    let mut tasks = Vec::new();
    for (peer, slot) in streams.into_iter().enumerate() {
        let Some(stream) = slot else { continue };
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tasks.push(tokio::spawn(reader_loop(
            peer as u32,
            read_half,
            events.clone(),
            closing.clone(),
        )));
        tasks.push(tokio::spawn(writer_loop(
            peer as u32,
            write_half,
            rx,
            closing.clone(),
        )));
        senders[peer] = Some(tx);
    }

    Ok(Transport { senders, tasks })
}

/// Apply the low-latency socket options to a fresh stream.
fn configure_stream(stream: TcpStream, buffer_size: usize) -> Result<TcpStream, MpiError> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(TcpStream::from_std(std_stream)?)
}

/// Build the goodbye frame announced to a peer during shutdown.
pub(crate) fn shutdown_frame(rank: u32, peer: u32) -> Frame {
    Frame {
        header: FrameHeader {
            command: Command::Shutdown,
            sender: rank,
            receiver: peer,
            comm_id: WORLD_COMM_ID,
            tag: 0,
            ack_required: false,
            payload_len: 0,
        },
        coll: None,
        payload: Vec::new(),
    }
}

async fn reader_loop(
    peer: u32,
    mut stream: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
    closing: Arc<AtomicBool>,
) {
    loop {
        let mut head = [0u8; HEADER_LEN];
        if let Err(err) = stream.read_exact(&mut head).await {
            if closing.load(Ordering::SeqCst) {
                debug!(peer, "connection closed during shutdown");
                return;
            }
            fatal_connection(peer, &format!("read failed: {err}"));
        }

        let (header, coll_len) = match decode_header(&head) {
            Ok(parsed) => parsed,
            Err(err) => fatal_connection(peer, &format!("framing violation: {err}")),
        };

        if header.command == Command::Shutdown {
            debug!(peer, "received goodbye frame");
            return;
        }

        let coll = if coll_len > 0 {
            let mut coll_bytes = vec![0u8; coll_len];
            if let Err(err) = stream.read_exact(&mut coll_bytes).await {
                fatal_connection(peer, &format!("read failed: {err}"));
            }
            match decode_collective_header(&coll_bytes) {
                Ok(h) => Some(h),
                Err(err) => fatal_connection(peer, &format!("bad collective header: {err}")),
            }
        } else {
            None
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(err) = stream.read_exact(&mut payload).await {
            fatal_connection(peer, &format!("read failed: {err}"));
        }

        let frame = Frame {
            header,
            coll,
            payload,
        };
        if events.send(Event::Frame(frame)).is_err() {
            // Dispatcher already gone; nothing left to deliver to.
            debug!(peer, "dispatcher closed, reader exiting");
            return;
        }
    }
}

async fn writer_loop(
    peer: u32,
    mut stream: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    closing: Arc<AtomicBool>,
) {
    while let Some(frame) = outbound.recv().await {
        let is_goodbye = frame.header.command == Command::Shutdown;
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(peer, %err, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(err) = stream.write_all(&bytes).await {
            if closing.load(Ordering::SeqCst) {
                return;
            }
            fatal_connection(peer, &format!("write failed: {err}"));
        }
        let _ = stream.flush().await;
        if is_goodbye {
            debug!(peer, "goodbye frame sent, writer exiting");
            return;
        }
    }
}

/// Connection loss outside shutdown takes the whole process down; the
/// launcher sees the non-zero exit and fails the job.
fn fatal_connection(peer: u32, detail: &str) -> ! {
    error!(peer, detail, "peer connection lost, terminating");
    std::process::exit(1);
}
