//! Ordering core -- durable P/Q/C-set accumulation.

use super::*;

/// In-memory image of everything persisted that is needed to prove past
/// progress. All maps are ordered by key so that anything derived from them
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedLog {
    /// Seq -> most recent PEntry.
    p_set: BTreeMap<SeqNo, PEntry>,

    /// Seq -> Epoch -> QEntry.
    q_set: BTreeMap<SeqNo, BTreeMap<Epoch, QEntry>>,

    /// Seq -> CEntry.
    c_set: BTreeMap<SeqNo, CEntry>,

    /// Highest contiguously committed sequence number.
    last_committed: SeqNo,
}

impl PersistedLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn last_committed(&self) -> SeqNo {
        self.last_committed
    }

    pub fn p_entry(&self, seq_no: SeqNo) -> Option<&PEntry> {
        self.p_set.get(&seq_no)
    }

    /// Q-entries at a sequence number, ascending by epoch.
    pub fn q_entries(&self, seq_no: SeqNo) -> impl Iterator<Item = &QEntry> {
        self.q_set.get(&seq_no).into_iter().flat_map(|m| m.values())
    }

    pub fn c_entry(&self, seq_no: SeqNo) -> Option<&CEntry> {
        self.c_set.get(&seq_no)
    }

    /// All known checkpoints, ascending by sequence number.
    pub fn checkpoints(&self) -> impl DoubleEndedIterator<Item = &CEntry> {
        self.c_set.values()
    }

    /// Records a prepared digest. The epoch for a sequence number may never
    /// go backwards.
    pub fn add_p_entry(
        &mut self,
        entry: PEntry,
    ) -> Result<Actions, MiradorError> {
        if let Some(old) = self.p_set.get(&entry.seq_no) {
            if old.epoch > entry.epoch {
                return logged_err!(
                    "PEntry for seq {} regresses epoch {} -> {}",
                    entry.seq_no,
                    old.epoch,
                    entry.epoch
                );
            }
        }

        pf_trace!("add PEntry seq {} epoch {}", entry.seq_no, entry.epoch);
        self.p_set.insert(entry.seq_no, entry.clone());
        Ok(Actions {
            persist: vec![Persisted::PEntry(entry)],
            ..Default::default()
        })
    }

    /// Records a preprepared digest, keeping one entry per epoch.
    pub fn add_q_entry(
        &mut self,
        entry: QEntry,
    ) -> Result<Actions, MiradorError> {
        pf_trace!("add QEntry seq {} epoch {}", entry.seq_no, entry.epoch);
        self.q_set
            .entry(entry.seq_no)
            .or_default()
            .insert(entry.epoch, entry.clone());
        Ok(Actions {
            persist: vec![Persisted::QEntry(entry)],
            ..Default::default()
        })
    }

    /// Records a checkpoint. It must carry its network config snapshot.
    pub fn add_c_entry(
        &mut self,
        entry: CEntry,
    ) -> Result<Actions, MiradorError> {
        if entry.network_config.is_none() {
            return logged_err!(
                "CEntry for seq {} lacks network config",
                entry.seq_no
            );
        }

        pf_debug!("add CEntry seq {}", entry.seq_no);
        self.c_set.insert(entry.seq_no, entry.clone());
        Ok(Actions {
            persist: vec![Persisted::CEntry(entry)],
            ..Default::default()
        })
    }

    /// Dispatches a persisted entry to the matching `add_*`.
    pub fn add_entry(
        &mut self,
        entry: Persisted,
    ) -> Result<Actions, MiradorError> {
        match entry {
            Persisted::PEntry(e) => self.add_p_entry(e),
            Persisted::QEntry(e) => self.add_q_entry(e),
            Persisted::CEntry(e) => self.add_c_entry(e),
        }
    }

    /// Advances the commit frontier by exactly one.
    pub fn set_last_committed(
        &mut self,
        seq_no: SeqNo,
    ) -> Result<(), MiradorError> {
        if self.last_committed.checked_add(1) != Some(seq_no) {
            return logged_err!(
                "commit of seq {} does not follow last committed {}",
                seq_no,
                self.last_committed
            );
        }
        self.last_committed = seq_no;
        Ok(())
    }

    /// Forces the commit frontier, used when reloading from a checkpoint.
    pub(super) fn reset_last_committed(&mut self, seq_no: SeqNo) {
        self.last_committed = seq_no;
    }

    /// Drops P/Q-entries at or below `low_watermark` and checkpoints strictly
    /// below it; the checkpoint at the watermark anchors the next proof.
    pub fn truncate(&mut self, low_watermark: SeqNo) {
        self.p_set.retain(|&seq_no, _| seq_no > low_watermark);
        self.q_set.retain(|&seq_no, _| seq_no > low_watermark);
        self.c_set.retain(|&seq_no, _| seq_no >= low_watermark);
        pf_debug!("truncated log to watermark {}", low_watermark);
    }
}

#[cfg(test)]
mod persisted_tests {
    use super::*;
    use crate::ordering::test_helpers::{c_entry, digest};

    fn p_entry(seq_no: SeqNo, epoch: Epoch) -> PEntry {
        PEntry {
            seq_no,
            epoch,
            digest: digest("p"),
        }
    }

    fn q_entry(seq_no: SeqNo, epoch: Epoch) -> QEntry {
        QEntry {
            seq_no,
            epoch,
            digest: digest("q"),
        }
    }

    #[test]
    fn p_entry_epoch_regression() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        let actions = log.add_p_entry(p_entry(5, 3))?;
        assert_eq!(actions.persist, vec![Persisted::PEntry(p_entry(5, 3))]);
        assert!(log
            .add_p_entry(p_entry(5, 2))
            .unwrap_err()
            .is_contract_violation());
        assert_eq!(log.p_entry(5).map(|e| e.epoch), Some(3));
        log.add_p_entry(p_entry(5, 3))?;
        log.add_p_entry(p_entry(5, 4))?;
        assert_eq!(log.p_entry(5).map(|e| e.epoch), Some(4));
        Ok(())
    }

    #[test]
    fn q_entries_across_epochs() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        log.add_q_entry(q_entry(7, 4))?;
        log.add_q_entry(q_entry(7, 1))?;
        log.add_q_entry(q_entry(7, 4))?;
        let epochs: Vec<Epoch> = log.q_entries(7).map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1, 4]);
        assert_eq!(log.q_entries(8).count(), 0);
        Ok(())
    }

    #[test]
    fn c_entry_requires_network_config() {
        let mut log = PersistedLog::new();
        let mut entry = c_entry(10);
        entry.network_config = None;
        assert!(log.add_c_entry(entry).is_err());
        assert!(log.c_entry(10).is_none());
        assert!(log.add_entry(Persisted::CEntry(c_entry(10))).is_ok());
        assert!(log.c_entry(10).is_some());
    }

    #[test]
    fn last_committed_gap_free() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        log.set_last_committed(1)?;
        log.set_last_committed(2)?;
        assert!(log.set_last_committed(2).is_err());
        assert!(log.set_last_committed(4).is_err());
        assert_eq!(log.last_committed(), 2);

        log.reset_last_committed(u64::MAX);
        assert!(log
            .set_last_committed(0)
            .unwrap_err()
            .is_contract_violation());
        assert_eq!(log.last_committed(), u64::MAX);
        Ok(())
    }

    #[test]
    fn checkpoints_iterate_both_ways() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        for seq_no in [20, 0, 10] {
            log.add_c_entry(c_entry(seq_no))?;
        }
        let up: Vec<SeqNo> = log.checkpoints().map(|c| c.seq_no).collect();
        let down: Vec<SeqNo> =
            log.checkpoints().rev().map(|c| c.seq_no).collect();
        assert_eq!(up, vec![0, 10, 20]);
        assert_eq!(down, vec![20, 10, 0]);
        Ok(())
    }

    #[test]
    fn truncate_boundaries() -> Result<(), MiradorError> {
        let mut log = PersistedLog::new();
        for seq_no in [9, 10, 11] {
            log.add_p_entry(p_entry(seq_no, 1))?;
            log.add_q_entry(q_entry(seq_no, 1))?;
            log.add_c_entry(c_entry(seq_no))?;
        }
        log.truncate(10);
        assert!(log.p_entry(10).is_none());
        assert!(log.p_entry(11).is_some());
        assert_eq!(log.q_entries(10).count(), 0);
        assert_eq!(log.q_entries(11).count(), 1);
        let cps: Vec<SeqNo> = log.checkpoints().map(|c| c.seq_no).collect();
        assert_eq!(cps, vec![10, 11]);
        Ok(())
    }
}
