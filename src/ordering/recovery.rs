//! Ordering core -- reconstruction of the persisted log on startup.

use super::*;

use crate::server::Storage;

/// Replays every persisted entry from index 0 into a fresh `PersistedLog`,
/// then truncates to the third-newest checkpoint (or the oldest, if fewer
/// than three exist) and sets the commit frontier to the newest checkpoint.
pub fn load_persisted<S: Storage + ?Sized>(
    storage: &mut S,
) -> Result<PersistedLog, MiradorError> {
    let mut log = PersistedLog::new();

    let mut index = 0;
    while let Some(entry) = storage.load(index)? {
        log.add_entry(entry)?;
        index += 1;
    }

    let checkpoints: Vec<SeqNo> = log.checkpoints().map(|c| c.seq_no).collect();
    let (oldest, newest) = match (checkpoints.first(), checkpoints.last()) {
        (Some(&oldest), Some(&newest)) => (oldest, newest),
        _ => {
            return logged_err!(
                "no checkpoint among {} persisted entries",
                index
            );
        }
    };

    if checkpoints.len() >= 3 {
        log.truncate(checkpoints[checkpoints.len() - 3]);
    } else {
        log.truncate(oldest);
    }
    log.reset_last_committed(newest);

    pf_info!(
        "recovered {} persisted entries: last committed {}",
        index,
        newest
    );
    Ok(log)
}
