//! Mirador: bucketed BFT ordering core.
//!
//! The `ordering` module holds the synchronous agreement state machines; the
//! `server` module holds the storage collaborators they are reloaded from.

#[macro_use]
mod utils;

mod ordering;
mod server;

pub use utils::{logger_init, Bitmap, MiradorError, ME};

pub use ordering::{
    load_persisted, Actions, Batch, BatchParameters, Bucket, BucketId,
    BucketStatus, CEntry, Checkpoint, CheckpointOracle, ClientId,
    ClientWaiter, ClientWindow, CommitNotice, Digest, DigestRequest, Epoch,
    EpochChange, EpochConfig, Evidence, NetworkConfig, NodeConfig, NodeId,
    PEntry, PeerMsg, Persisted, PersistedLog, QEntry, Request, RequestData,
    RequestState, RequestWindowStatus, SeqNo, Sequence, SequenceState,
    SetEntry, ValidateRequest, VotePhase,
};
pub use server::{FileStorage, MemStorage, Storage};
