//! Bucketed BFT ordering core.
//!
//! Per-sequence-number three-phase agreement (preprepare, prepare, commit)
//! organized into leader-assigned buckets for pipelined throughput, plus the
//! durable write-ahead state needed to survive restarts and to prove past
//! progress at epoch change. Everything here is a synchronous state machine:
//! every operation returns the side effects the surrounding driver must
//! carry out (broadcast, persist, digest, validate, commit), and never
//! performs I/O or blocks itself.
//!
//! Broadcasts are expected to be looped back to the sender by the driver, so
//! a bucket leader learns of its own Preprepare through `apply_preprepare`
//! like everyone else. Repeated votes from one node are deduplicated.
//!
//! References:
//!   - <https://arxiv.org/abs/1906.05552>
//!   - <https://pmg.csail.mit.edu/papers/osdi99.pdf>

mod bucket;
mod clientwin;
mod epochchange;
mod messages;
mod persisted;
mod recovery;
mod sequence;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::utils::MiradorError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

pub use bucket::{Bucket, BucketStatus};
pub use clientwin::{
    ClientWaiter, ClientWindow, Request, RequestData, RequestState,
    RequestWindowStatus,
};
pub use epochchange::{CheckpointOracle, EpochChange};
pub use messages::{
    CEntry, Checkpoint, PEntry, PeerMsg, Persisted, QEntry, SetEntry,
};
pub use persisted::PersistedLog;
pub use recovery::load_persisted;
pub use sequence::{Sequence, SequenceState};

/// Sequence number type.
pub type SeqNo = u64;

/// Bucket ID type.
pub type BucketId = u64;

/// Node ID type. Nodes are numbered `0..population`.
pub type NodeId = u64;

/// Epoch number type.
pub type Epoch = u64;

/// Client ID type.
pub type ClientId = u64;

/// Content digest of a batch, produced by the hashing collaborator.
pub type Digest = Bytes;

/// Request batch type: ordered opaque request references.
pub type Batch = Vec<Bytes>;

/// Cluster-wide configuration, snapshotted into every checkpoint entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// IDs of all nodes in the committee.
    pub nodes: Vec<NodeId>,

    /// Maximum number of Byzantine nodes tolerated.
    pub f: u64,

    /// Number of sequence numbers between two checkpoints.
    pub checkpoint_interval: u64,

    /// Number of buckets sequence numbers are striped across.
    pub number_of_buckets: u64,

    /// Maximum number of sequence numbers an epoch may span.
    pub max_epoch_length: u64,

    /// Number of checkpoint intervals the watermark window spans.
    pub total_checkpoints: u64,

    /// Number of checkpoint intervals retained for epoch change proofs.
    pub garbage_checkpoints: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            nodes: vec![0, 1, 2, 3],
            f: 1,
            checkpoint_interval: 10,
            number_of_buckets: 1,
            max_epoch_length: 200,
            total_checkpoints: 10,
            garbage_checkpoints: 4,
        }
    }
}

impl NetworkConfig {
    /// Composes a network config from defaults and an optional TOML string.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, MiradorError> {
        let config = parsed_config!(config_str => NetworkConfig;
                                    nodes, f, checkpoint_interval,
                                    number_of_buckets, max_epoch_length,
                                    total_checkpoints, garbage_checkpoints)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency of the config.
    pub fn validate(&self) -> Result<(), MiradorError> {
        let population = self.nodes.len() as u64;
        if population < 3 * self.f + 1 {
            return Err(MiradorError::Config(format!(
                "{} nodes cannot tolerate f={}",
                population, self.f
            )));
        }
        if self.nodes.iter().enumerate().any(|(i, &n)| n != i as NodeId) {
            return Err(MiradorError::Config(format!(
                "node IDs must be 0..{}, got {:?}",
                population, self.nodes
            )));
        }
        if self.checkpoint_interval == 0 {
            return Err(MiradorError::Config(
                "checkpoint_interval must be positive".into(),
            ));
        }
        if self.number_of_buckets == 0 {
            return Err(MiradorError::Config(
                "number_of_buckets must be positive".into(),
            ));
        }
        if self.garbage_checkpoints + 1 >= self.total_checkpoints {
            return Err(MiradorError::Config(format!(
                "garbage_checkpoints {} leaves no pipelining room in {}",
                self.garbage_checkpoints, self.total_checkpoints
            )));
        }
        Ok(())
    }

    /// Number of nodes in the committee.
    #[inline]
    pub fn population(&self) -> usize {
        self.nodes.len()
    }

    /// Matching votes needed to treat a claim as certain. Any two quorums
    /// must share at least `f + 1` nodes, hence at least one honest node:
    /// `ceil((n + f + 1) / 2)`, which is `2f + 1` when `n = 3f + 1`.
    #[inline]
    pub fn quorum(&self) -> usize {
        (self.population() + self.f as usize + 2) / 2
    }

    /// Number of checkpoint intervals a bucket leader must stay below the
    /// high watermark: the garbage intervals plus one empty interval are
    /// reserved so that peers which have not yet moved their watermarks
    /// still accept the Preprepare.
    #[inline]
    pub fn pipeline_margin(&self) -> u64 {
        self.total_checkpoints - self.garbage_checkpoints - 1
    }
}

/// Batching parameters of the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchParameters {
    /// A leader cuts its proposal queue into a batch once it holds at least
    /// this many bytes.
    pub cut_size_bytes: usize,
}

/// Local node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// My node ID.
    pub id: NodeId,

    /// Batching parameters when leading a bucket.
    pub batch_parameters: BatchParameters,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: 0,
            batch_parameters: BatchParameters {
                cut_size_bytes: 4096,
            },
        }
    }
}

impl NodeConfig {
    /// Composes a node config from defaults and an optional TOML string.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, MiradorError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    id, batch_parameters)?;
        if config.batch_parameters.cut_size_bytes == 0 {
            return Err(MiradorError::Config(
                "cut_size_bytes must be positive".into(),
            ));
        }
        Ok(config)
    }
}

/// Configuration of one epoch, produced by the epoch driver. Immutable while
/// shared; a watermark slide or a new epoch replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochConfig {
    /// Epoch number.
    pub number: Epoch,

    /// Lowest sequence number in flight (inclusive).
    pub low_watermark: SeqNo,

    /// Highest sequence number in flight (inclusive).
    pub high_watermark: SeqNo,

    /// Bucket ID -> leader node ID.
    pub buckets: BTreeMap<BucketId, NodeId>,

    /// Local node configuration.
    pub my_config: NodeConfig,

    /// Cluster-wide configuration.
    pub network_config: NetworkConfig,
}

impl EpochConfig {
    /// Creates an epoch config, checking that every bucket has a leader in
    /// the committee and that the watermark window is well-formed.
    pub fn new(
        number: Epoch,
        low_watermark: SeqNo,
        high_watermark: SeqNo,
        buckets: BTreeMap<BucketId, NodeId>,
        my_config: NodeConfig,
        network_config: NetworkConfig,
    ) -> Result<Arc<Self>, MiradorError> {
        network_config.validate()?;
        if low_watermark > high_watermark {
            return Err(MiradorError::Config(format!(
                "low watermark {} above high watermark {}",
                low_watermark, high_watermark
            )));
        }
        if buckets.len() as u64 != network_config.number_of_buckets
            || buckets
                .keys()
                .any(|&b| b >= network_config.number_of_buckets)
        {
            return Err(MiradorError::Config(format!(
                "bucket map {:?} does not cover {} buckets",
                buckets, network_config.number_of_buckets
            )));
        }
        let population = network_config.population() as NodeId;
        if let Some(leader) = buckets.values().find(|&&l| l >= population) {
            return Err(MiradorError::Config(format!(
                "bucket leader {} not in committee",
                leader
            )));
        }
        if my_config.id >= population {
            return Err(MiradorError::Config(format!(
                "my id {} not in committee",
                my_config.id
            )));
        }
        Ok(Arc::new(EpochConfig {
            number,
            low_watermark,
            high_watermark,
            buckets,
            my_config,
            network_config,
        }))
    }

    /// Returns a copy of this config with the watermark window slid.
    pub fn with_watermarks(
        &self,
        low_watermark: SeqNo,
        high_watermark: SeqNo,
    ) -> Result<Arc<Self>, MiradorError> {
        Self::new(
            self.number,
            low_watermark,
            high_watermark,
            self.buckets.clone(),
            self.my_config.clone(),
            self.network_config.clone(),
        )
    }

    /// My node ID.
    #[inline]
    pub fn me(&self) -> NodeId {
        self.my_config.id
    }

    /// Checkpoint interval of the network.
    #[inline]
    pub fn checkpoint_interval(&self) -> u64 {
        self.network_config.checkpoint_interval
    }

    /// Bucket a sequence number belongs to.
    #[inline]
    pub fn bucket_of(&self, seq_no: SeqNo) -> BucketId {
        seq_no % self.network_config.number_of_buckets
    }

    /// Leader of given bucket, if the bucket exists.
    #[inline]
    pub fn leader_of(&self, bucket: BucketId) -> Option<NodeId> {
        self.buckets.get(&bucket).copied()
    }
}

/// Vote phase a piece of evidence was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotePhase {
    Prepare,
    Commit,
}

/// Observed Byzantine behavior of a peer or client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    /// A peer voted for a digest that differs from the one I computed.
    DigestMismatch {
        source: NodeId,
        seq_no: SeqNo,
        phase: VotePhase,
    },

    /// A bucket leader proposed a batch that failed local validation.
    InvalidBatch { leader: NodeId, seq_no: SeqNo },

    /// A client submitted two different requests under one request number.
    ConflictingRequest { client: ClientId, req_no: u64 },
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Evidence::DigestMismatch {
                source,
                seq_no,
                phase,
            } => write!(
                f,
                "node {} sent mismatching {:?} digest for seq {}",
                source, phase, seq_no
            ),
            Evidence::InvalidBatch { leader, seq_no } => write!(
                f,
                "leader {} proposed invalid batch at seq {}",
                leader, seq_no
            ),
            Evidence::ConflictingRequest { client, req_no } => write!(
                f,
                "client {} sent conflicting requests for req_no {}",
                client, req_no
            ),
        }
    }
}

/// Request to the hashing collaborator; answered via `apply_digest_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRequest {
    pub seq_no: SeqNo,
    pub bucket: BucketId,
    pub batch: Batch,
}

/// Request to the validation collaborator; answered via
/// `apply_validate_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateRequest {
    pub seq_no: SeqNo,
    pub bucket: BucketId,
    pub batch: Batch,
}

/// Notice that a sequence number committed, to be applied in order by the
/// caller before it advances `PersistedLog::set_last_committed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub q_entry: QEntry,
    pub batch: Batch,
}

/// Side effects requested by an operation of the ordering core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions {
    /// Messages to send to every node, including myself.
    pub broadcast: Vec<PeerMsg>,

    /// Entries to append to durable storage before acting on the broadcasts.
    pub persist: Vec<Persisted>,

    /// Batches that need a digest computed.
    pub digest: Vec<DigestRequest>,

    /// Batches that need validating.
    pub validate: Vec<ValidateRequest>,

    /// Newly committed sequence numbers.
    pub commits: Vec<CommitNotice>,

    /// Non-fatal Byzantine behavior observed while processing.
    pub evidence: Vec<Evidence>,
}

impl Actions {
    /// Moves all side effects of `other` onto the end of `self`.
    pub fn append(&mut self, mut other: Actions) {
        self.broadcast.append(&mut other.broadcast);
        self.persist.append(&mut other.persist);
        self.digest.append(&mut other.digest);
        self.validate.append(&mut other.validate);
        self.commits.append(&mut other.commits);
        self.evidence.append(&mut other.evidence);
    }

    /// True if no side effect is requested.
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty()
            && self.persist.is_empty()
            && self.digest.is_empty()
            && self.validate.is_empty()
            && self.commits.is_empty()
            && self.evidence.is_empty()
    }
}
