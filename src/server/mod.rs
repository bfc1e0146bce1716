//! Mirador's durable storage collaborators.

mod storage;

pub use storage::{FileStorage, MemStorage, Storage};
