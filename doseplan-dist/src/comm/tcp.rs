//! Cluster transport: length-framed bincode messages over TCP.
//!
//! The coordinator listens and accepts one connection per worker, assigning
//! ranks in accept order; workers connect and learn their rank from the
//! handshake. Only coordinator ↔ worker links exist (star topology), which
//! covers the whole collective schedule.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use bincode::config;

use super::{CommError, Communicator, Message, COORDINATOR};

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct Handshake {
    rank: u32,
    size: u32,
}

/// Socket-backed communicator for one rank of a cluster group.
pub struct TcpComm {
    rank: usize,
    size: usize,
    links: Vec<Option<TcpStream>>,
}

impl TcpComm {
    /// Coordinator side: accept `workers` connections on `addr`.
    pub fn listen(addr: impl ToSocketAddrs, workers: usize) -> Result<TcpComm, CommError> {
        Self::listen_on(TcpListener::bind(addr)?, workers)
    }

    /// Coordinator side over a pre-bound listener (lets callers bind to an
    /// ephemeral port and publish the address first).
    pub fn listen_on(listener: TcpListener, workers: usize) -> Result<TcpComm, CommError> {
        let size = workers + 1;
        let mut links: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        for assigned in 1..size {
            let (stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;
            tracing::debug!(rank = assigned, %peer, "worker connected");
            write_frame(
                &stream,
                &Handshake {
                    rank: assigned as u32,
                    size: size as u32,
                },
            )?;
            links[assigned] = Some(stream);
        }
        Ok(TcpComm {
            rank: COORDINATOR,
            size,
            links,
        })
    }

    /// Worker side: connect to the coordinator at `addr` and receive the
    /// assigned rank.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<TcpComm, CommError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let handshake: Handshake = read_frame(&stream)?;
        if handshake.rank == 0 || handshake.rank >= handshake.size {
            return Err(CommError::Handshake(format!(
                "coordinator assigned invalid rank {} of {}",
                handshake.rank, handshake.size
            )));
        }
        let size = handshake.size as usize;
        let mut links: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        links[COORDINATOR] = Some(stream);
        Ok(TcpComm {
            rank: handshake.rank as usize,
            size,
            links,
        })
    }

    fn link(&self, peer: usize) -> Result<&TcpStream, CommError> {
        self.links
            .get(peer)
            .and_then(|l| l.as_ref())
            .ok_or(CommError::UnsupportedRoute {
                from: self.rank,
                to: peer,
            })
    }
}

impl Communicator for TcpComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, message: Message) -> Result<(), CommError> {
        write_frame(self.link(dest)?, &message)
    }

    fn recv(&self, src: usize) -> Result<Message, CommError> {
        read_frame(self.link(src)?)
    }
}

/// Write one `[u32 length][bincode payload]` frame.
fn write_frame<T: bincode::Encode>(mut stream: &TcpStream, value: &T) -> Result<(), CommError> {
    let bytes = bincode::encode_to_vec(value, config::standard())?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read one frame and decode it.
fn read_frame<T: bincode::Decode<()>>(mut stream: &TcpStream) -> Result<T, CommError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let (value, _) = bincode::decode_from_slice(&buf, config::standard())?;
    Ok(value)
}
