//! In-process transport: one rank per thread, `std::sync::mpsc` channels
//! between every ordered pair. Used by the `--workers` CLI mode and the
//! distributed-equivalence tests.

use std::sync::mpsc::{channel, Receiver, Sender};

use super::{CommError, Communicator, Message};

/// Channel-backed communicator for one rank of an in-process group.
pub struct MemComm {
    rank: usize,
    size: usize,
    senders: Vec<Option<Sender<Message>>>,
    receivers: Vec<Option<Receiver<Message>>>,
}

impl MemComm {
    /// Create a fully connected group of `size` ranks.
    ///
    /// Element `r` of the returned vector is rank `r`'s endpoint; move each
    /// onto its own thread.
    pub fn connected(size: usize) -> Vec<MemComm> {
        let mut comms: Vec<MemComm> = (0..size)
            .map(|rank| MemComm {
                rank,
                size,
                senders: (0..size).map(|_| None).collect(),
                receivers: (0..size).map(|_| None).collect(),
            })
            .collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                comms[from].senders[to] = Some(tx);
                comms[to].receivers[from] = Some(rx);
            }
        }
        comms
    }
}

impl Communicator for MemComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, message: Message) -> Result<(), CommError> {
        let sender = self
            .senders
            .get(dest)
            .and_then(|s| s.as_ref())
            .ok_or(CommError::UnsupportedRoute {
                from: self.rank,
                to: dest,
            })?;
        sender
            .send(message)
            .map_err(|_| CommError::Disconnected { rank: dest })
    }

    fn recv(&self, src: usize) -> Result<Message, CommError> {
        let receiver = self
            .receivers
            .get(src)
            .and_then(|r| r.as_ref())
            .ok_or(CommError::UnsupportedRoute {
                from: src,
                to: self.rank,
            })?;
        receiver
            .recv()
            .map_err(|_| CommError::Disconnected { rank: src })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Body, Tag};

    #[test]
    fn pairwise_messages_arrive_in_order() {
        let mut comms = MemComm::connected(2);
        let worker = comms.pop().unwrap();
        let root = comms.pop().unwrap();

        root.send(
            1,
            Message {
                tag: Tag::Iterate,
                body: Body::F64(vec![1.0, 2.0]),
            },
        )
        .unwrap();
        root.send(
            1,
            Message {
                tag: Tag::Shutdown,
                body: Body::Empty,
            },
        )
        .unwrap();

        let first = worker.recv(0).unwrap();
        assert_eq!(first.tag, Tag::Iterate);
        let second = worker.recv(0).unwrap();
        assert_eq!(second.tag, Tag::Shutdown);
    }

    #[test]
    fn recv_expect_flags_tag_mismatch() {
        let mut comms = MemComm::connected(2);
        let worker = comms.pop().unwrap();
        let root = comms.pop().unwrap();

        root.send(
            1,
            Message {
                tag: Tag::EvalObj,
                body: Body::Empty,
            },
        )
        .unwrap();

        let err = worker.recv_expect(0, Tag::Iterate).unwrap_err();
        assert!(matches!(
            err,
            CommError::TagMismatch {
                expected: Tag::Iterate,
                found: Tag::EvalObj,
            }
        ));
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        let mut comms = MemComm::connected(2);
        let worker = comms.pop().unwrap();
        drop(comms); // coordinator endpoint gone

        assert!(matches!(
            worker.recv(0),
            Err(CommError::Disconnected { rank: 0 })
        ));
    }
}
