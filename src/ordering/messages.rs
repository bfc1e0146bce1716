//! Peer-peer message and durable log entry types.

use super::*;

/// Peer-peer message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMsg {
    /// Batch assignment from a bucket leader to everyone.
    Preprepare {
        epoch: Epoch,
        seq_no: SeqNo,
        bucket: BucketId,
        batch: Batch,
    },

    /// Prepare vote for the digest at a sequence number.
    Prepare {
        seq_no: SeqNo,
        epoch: Epoch,
        digest: Digest,
    },

    /// Commit vote for the digest at a sequence number.
    Commit {
        seq_no: SeqNo,
        epoch: Epoch,
        digest: Digest,
    },
}

/// "I prepared this digest at this sequence number in this epoch."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PEntry {
    pub seq_no: SeqNo,
    pub epoch: Epoch,
    pub digest: Digest,
}

/// "I preprepared this digest at this sequence number in this epoch."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QEntry {
    pub seq_no: SeqNo,
    pub epoch: Epoch,
    pub digest: Digest,
}

/// A stable or candidate checkpoint together with the network config in
/// effect at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CEntry {
    pub seq_no: SeqNo,
    pub checkpoint_value: Bytes,
    pub network_config: Option<NetworkConfig>,
}

/// Stable storage WAL log entry type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persisted {
    PEntry(PEntry),
    QEntry(QEntry),
    CEntry(CEntry),
}

impl Persisted {
    /// Sequence number the entry is about.
    pub fn seq_no(&self) -> SeqNo {
        match self {
            Persisted::PEntry(e) => e.seq_no,
            Persisted::QEntry(e) => e.seq_no,
            Persisted::CEntry(e) => e.seq_no,
        }
    }
}

/// Checkpoint reference inside an epoch change proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq_no: SeqNo,
    pub value: Bytes,
}

/// P-set or Q-set element inside an epoch change proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetEntry {
    pub seq_no: SeqNo,
    pub epoch: Epoch,
    pub digest: Digest,
}

impl From<&PEntry> for SetEntry {
    fn from(e: &PEntry) -> Self {
        SetEntry {
            seq_no: e.seq_no,
            epoch: e.epoch,
            digest: e.digest.clone(),
        }
    }
}

impl From<&QEntry> for SetEntry {
    fn from(e: &QEntry) -> Self {
        SetEntry {
            seq_no: e.seq_no,
            epoch: e.epoch,
            digest: e.digest.clone(),
        }
    }
}
