//! Ordering core -- epoch change proof construction.

use super::*;

/// Tells which checkpoints have been certified stable by a quorum.
pub trait CheckpointOracle {
    fn is_stable(&self, seq_no: SeqNo) -> bool;
}

impl<F> CheckpointOracle for F
where
    F: Fn(SeqNo) -> bool,
{
    fn is_stable(&self, seq_no: SeqNo) -> bool {
        self(seq_no)
    }
}

/// Proof a node contributes towards starting `new_epoch`. All lists are in
/// canonical order (sequence number, then epoch), so honest nodes with
/// identical logs produce byte-identical proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochChange {
    pub new_epoch: Epoch,

    /// Highest stable checkpoint, the anchor of the proof.
    pub stable_checkpoint: Checkpoint,

    /// All known checkpoints including the anchor, ascending.
    pub checkpoints: Vec<Checkpoint>,

    /// Prepared entries in the window after the anchor.
    pub p_set: Vec<SetEntry>,

    /// Preprepared entries in the window after the anchor.
    pub q_set: Vec<SetEntry>,
}

impl EpochChange {
    /// Known checkpoints other than the anchor.
    pub fn corroborating(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints
            .iter()
            .filter(move |c| c.seq_no != self.stable_checkpoint.seq_no)
    }
}

impl PersistedLog {
    /// Builds my epoch change proof, anchored at the highest checkpoint the
    /// oracle reports stable and covering the three checkpoint intervals
    /// after it.
    pub fn construct_epoch_change<O: CheckpointOracle + ?Sized>(
        &self,
        new_epoch: Epoch,
        oracle: &O,
    ) -> Result<EpochChange, MiradorError> {
        let anchor = match self
            .checkpoints()
            .rev()
            .find(|c| oracle.is_stable(c.seq_no))
        {
            Some(anchor) => anchor,
            None => {
                return logged_err!(
                    "no stable checkpoint to anchor epoch {} change",
                    new_epoch
                );
            }
        };
        let network_config = match &anchor.network_config {
            Some(config) => config,
            None => {
                return logged_err!(
                    "stable checkpoint {} lacks network config",
                    anchor.seq_no
                );
            }
        };

        let checkpoints: Vec<Checkpoint> = self
            .checkpoints()
            .map(|c| Checkpoint {
                seq_no: c.seq_no,
                value: c.checkpoint_value.clone(),
            })
            .collect();

        let mut p_set = vec![];
        let mut q_set = vec![];
        let end = match network_config
            .checkpoint_interval
            .checked_mul(3)
            .and_then(|span| anchor.seq_no.checked_add(span))
        {
            Some(end) => end,
            None => {
                return logged_err!(
                    "epoch change window after checkpoint {} overflows",
                    anchor.seq_no
                );
            }
        };
        for seq_no in anchor.seq_no..end {
            let mut q_entries = self.q_entries(seq_no).peekable();
            if q_entries.peek().is_none() {
                continue;
            }
            q_set.extend(q_entries.map(SetEntry::from));
            if let Some(p_entry) = self.p_entry(seq_no) {
                p_set.push(SetEntry::from(p_entry));
            }
        }

        pf_info!(
            "epoch {} change at {}: {} checkpoints {} P {} Q",
            new_epoch,
            anchor.seq_no,
            checkpoints.len(),
            p_set.len(),
            q_set.len()
        );
        Ok(EpochChange {
            new_epoch,
            stable_checkpoint: Checkpoint {
                seq_no: anchor.seq_no,
                value: anchor.checkpoint_value.clone(),
            },
            checkpoints,
            p_set,
            q_set,
        })
    }
}

#[cfg(test)]
mod epochchange_tests {
    use super::*;
    use crate::ordering::test_helpers::{c_entry, digest};

    use rand::seq::SliceRandom;
    use rand::thread_rng;

    fn entries() -> Vec<Persisted> {
        let mut entries = vec![];
        for seq_no in [10, 20, 30] {
            entries.push(Persisted::CEntry(c_entry(seq_no)));
        }
        for seq_no in 25..=65 {
            for epoch in [1, 3, 2] {
                if (seq_no + epoch) % 3 != 0 {
                    entries.push(Persisted::QEntry(QEntry {
                        seq_no,
                        epoch,
                        digest: digest("q"),
                    }));
                }
            }
            if seq_no % 2 == 0 {
                entries.push(Persisted::PEntry(PEntry {
                    seq_no,
                    epoch: 2,
                    digest: digest("p"),
                }));
            }
        }
        entries
    }

    #[test]
    fn anchors_at_highest_stable() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        for entry in entries() {
            log.add_entry(entry)?;
        }
        let ec = log.construct_epoch_change(4, &|s: SeqNo| s == 30)?;
        assert_eq!(ec.new_epoch, 4);
        assert_eq!(ec.stable_checkpoint.seq_no, 30);
        let cps: Vec<SeqNo> = ec.checkpoints.iter().map(|c| c.seq_no).collect();
        assert_eq!(cps, vec![10, 20, 30]);
        let others: Vec<SeqNo> = ec.corroborating().map(|c| c.seq_no).collect();
        assert_eq!(others, vec![10, 20]);

        // window is [30, 60)
        assert_eq!(ec.q_set.first().map(|e| e.seq_no), Some(30));
        assert!(ec.q_set.iter().all(|e| (30..60).contains(&e.seq_no)));
        assert!(ec.p_set.iter().all(|e| (30..60).contains(&e.seq_no)));
        assert!(ec
            .q_set
            .windows(2)
            .all(|w| (w[0].seq_no, w[0].epoch) < (w[1].seq_no, w[1].epoch)));
        assert!(ec.p_set.windows(2).all(|w| w[0].seq_no < w[1].seq_no));
        Ok(())
    }

    #[test]
    fn lower_stable_checkpoint_anchors() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        for entry in entries() {
            log.add_entry(entry)?;
        }
        let ec = log.construct_epoch_change(4, &|s: SeqNo| s <= 20)?;
        assert_eq!(ec.stable_checkpoint.seq_no, 20);
        assert_eq!(ec.checkpoints.len(), 3);
        assert!(ec.q_set.iter().all(|e| (20..50).contains(&e.seq_no)));
        Ok(())
    }

    #[test]
    fn no_stable_checkpoint_fails() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        for entry in entries() {
            log.add_entry(entry)?;
        }
        assert!(log
            .construct_epoch_change(4, &|_: SeqNo| false)
            .unwrap_err()
            .is_contract_violation());
        Ok(())
    }

    #[test]
    fn window_past_u64_max_fails() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        log.add_entry(Persisted::CEntry(c_entry(u64::MAX - 5)))?;
        assert!(log
            .construct_epoch_change(4, &|_: SeqNo| true)
            .unwrap_err()
            .is_contract_violation());
        Ok(())
    }

    #[test]
    fn byte_identical_across_insertion_orders() -> Result<(), MiradorError> {
        let mut a = PersistedLog::new();
        for entry in entries() {
            a.add_entry(entry)?;
        }

        let mut shuffled = entries();
        let (mut checkpoints, mut rest): (Vec<_>, Vec<_>) = shuffled
            .drain(..)
            .partition(|e| matches!(e, Persisted::CEntry(_)));
        checkpoints.shuffle(&mut thread_rng());
        // P-entries share one epoch per seq, so any order is valid
        rest.shuffle(&mut thread_rng());
        let mut b = PersistedLog::new();
        for entry in checkpoints.into_iter().chain(rest) {
            b.add_entry(entry)?;
        }

        let oracle = |s: SeqNo| s == 30;
        let ec_a = a.construct_epoch_change(4, &oracle)?;
        let ec_b = b.construct_epoch_change(4, &oracle)?;
        assert_eq!(rmp_serde::to_vec(&ec_a)?, rmp_serde::to_vec(&ec_b)?);
        Ok(())
    }
}
