//! Point-to-point transport between ranks and the frames carried over it.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sx_types::{Message, RemoteError, Sample, SampleId, SxError, SxResult, WorkerId};

/// Rank 0 is the engine's home rank.
pub const HOME_RANK: usize = 0;

/// Rank identity plus byte-level send/receive.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    /// Number of ranks, including the home rank.
    fn size(&self) -> usize;

    fn send(&self, to: usize, bytes: Vec<u8>) -> SxResult<()>;

    /// Block until a frame arrives; returns the sender's rank.
    fn recv(&self) -> SxResult<(usize, Vec<u8>)>;
}

/// Everything ranks say to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum WireFrame {
    /// Home -> worker: run this sample.
    Assign { sample: Sample, leader: bool },
    /// Home -> worker: mail for a running sample.
    Deliver { sample_id: SampleId, payload: Value },
    /// Worker -> home: a leader's callback sent a message.
    Outbound { message: Message },
    /// Worker -> home: slot freed.
    Released { worker: WorkerId, sample_id: SampleId },
    /// Worker -> home: leader's finished sample.
    Finished { sample: Sample },
    /// Worker -> home: callback failure.
    Failed { sample_id: SampleId, error: RemoteError },
    Shutdown,
}

impl WireFrame {
    pub fn encode(&self) -> SxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> SxResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn send_frame(transport: &dyn Transport, to: usize, frame: &WireFrame) -> SxResult<()> {
    transport.send(to, frame.encode()?)
}

pub fn recv_frame(transport: &dyn Transport) -> SxResult<(usize, WireFrame)> {
    let (from, bytes) = transport.recv()?;
    Ok((from, WireFrame::decode(&bytes)?))
}

type Envelope = (usize, Vec<u8>);

/// In-process transport: one crossbeam channel per rank.
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
}

impl ChannelTransport {
    /// Build a fully connected world of `size` ranks; element `r` is rank `r`.
    pub fn world(size: usize) -> Vec<ChannelTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: usize, bytes: Vec<u8>) -> SxResult<()> {
        let peer = self.peers.get(to).ok_or_else(|| SxError::Transport {
            message: format!("rank {to} is outside a world of {} ranks", self.peers.len()),
        })?;
        peer.send((self.rank, bytes)).map_err(|_| SxError::Transport {
            message: format!("rank {to} is no longer receiving"),
        })
    }

    fn recv(&self) -> SxResult<(usize, Vec<u8>)> {
        self.inbox.recv().map_err(|_| SxError::Transport {
            message: format!("rank {} has no remaining peers", self.rank),
        })
    }
}
