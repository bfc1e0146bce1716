//! Ordering core -- single sequence number agreement state machine.

use super::*;

use crate::utils::Bitmap;

/// Agreement state of one sequence number. Transitions strictly forward.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum SequenceState {
    Unknown = 0,
    Preprepared = 1,
    Digested = 2,
    Validated = 3,
    Prepared = 4,
    Committed = 5,
}

/// Votes keyed by the digest they were cast for. Before my own digest is
/// known, votes for any digest are buffered; afterwards only the matching
/// entry is kept.
type VoteSets = BTreeMap<Digest, Bitmap>;

/// Agreement state for exactly one (epoch, seq_no) pair.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Epoch this sequence belongs to.
    config: Arc<EpochConfig>,

    /// Sequence number.
    seq_no: SeqNo,

    /// Bucket owning this sequence number.
    bucket: BucketId,

    /// Leader of the owning bucket.
    leader: NodeId,

    /// Current state.
    state: SequenceState,

    /// Digest of the batch, set once.
    digest: Option<Digest>,

    /// Batch assigned by the Preprepare.
    batch: Batch,

    /// Prepare votes received.
    prepares: VoteSets,

    /// Commit votes received.
    commits: VoteSets,
}

impl Sequence {
    /// Creates a fresh sequence in `Unknown` state.
    pub fn new(
        config: Arc<EpochConfig>,
        seq_no: SeqNo,
        bucket: BucketId,
        leader: NodeId,
    ) -> Self {
        Sequence {
            config,
            seq_no,
            bucket,
            leader,
            state: SequenceState::Unknown,
            digest: None,
            batch: vec![],
            prepares: VoteSets::new(),
            commits: VoteSets::new(),
        }
    }

    #[inline]
    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    #[inline]
    pub fn state(&self) -> SequenceState {
        self.state
    }

    #[inline]
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    #[inline]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Number of distinct nodes whose Prepare matches my digest.
    pub fn prepare_count(&self) -> usize {
        self.matching(&self.prepares)
    }

    /// Number of distinct nodes whose Commit matches my digest.
    pub fn commit_count(&self) -> usize {
        self.matching(&self.commits)
    }

    #[inline]
    fn is_leader(&self) -> bool {
        self.leader == self.config.me()
    }

    fn matching(&self, votes: &VoteSets) -> usize {
        self.digest
            .as_ref()
            .and_then(|d| votes.get(d))
            .map_or(0, |set| set.count())
    }

    /// My digest, which must be set in any state past `Preprepared`.
    fn own_digest(&self) -> Result<Digest, MiradorError> {
        match &self.digest {
            Some(digest) => Ok(digest.clone()),
            None => logged_err!("seq {} has no digest yet", self.seq_no),
        }
    }

    fn q_entry(&self, digest: Digest) -> QEntry {
        QEntry {
            seq_no: self.seq_no,
            epoch: self.config.number,
            digest,
        }
    }

    /// Records a vote of `source` for `digest` into `votes`. Each source is
    /// counted once per phase, whatever digest it voted for first.
    fn record_vote(
        votes: &mut VoteSets,
        population: usize,
        source: NodeId,
        digest: Digest,
    ) -> Result<bool, MiradorError> {
        if source as usize >= population {
            return logged_err!("vote from unknown node {}", source);
        }
        for set in votes.values() {
            if set.get(source)? {
                return Ok(false);
            }
        }
        votes
            .entry(digest)
            .or_insert_with(|| Bitmap::new(population, false))
            .insert(source)
    }

    /// Drops buffered votes that do not match `digest`, reporting their
    /// sources.
    fn purge_mismatched(
        votes: &mut VoteSets,
        digest: &Digest,
        seq_no: SeqNo,
        phase: VotePhase,
        evidence: &mut Vec<Evidence>,
    ) {
        votes.retain(|d, set| {
            if d == digest {
                return true;
            }
            for source in set.ones() {
                pf_warn!(
                    "node {} {:?} digest mismatch at seq {}",
                    source,
                    phase,
                    seq_no
                );
                evidence.push(Evidence::DigestMismatch {
                    source,
                    seq_no,
                    phase,
                });
            }
            false
        });
    }

    /// Assigns the batch. Valid only from `Unknown`; requests a digest.
    pub fn apply_preprepare(
        &mut self,
        batch: Batch,
    ) -> Result<Actions, MiradorError> {
        if self.state != SequenceState::Unknown {
            return logged_err!(
                "preprepare for seq {} in state {:?}",
                self.seq_no,
                self.state
            );
        }

        self.batch = batch;
        self.state = SequenceState::Preprepared;
        pf_trace!(
            "seq {} preprepared with {} requests",
            self.seq_no,
            self.batch.len()
        );

        Ok(Actions {
            digest: vec![DigestRequest {
                seq_no: self.seq_no,
                bucket: self.bucket,
                batch: self.batch.clone(),
            }],
            ..Default::default()
        })
    }

    /// Stores the computed digest. Valid only from `Preprepared`. A non-leader
    /// then requests validation; a leader is expected to follow up with
    /// `apply_self_vote`.
    pub fn apply_digest_result(
        &mut self,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        if self.state != SequenceState::Preprepared {
            return logged_err!(
                "digest result for seq {} in state {:?}",
                self.seq_no,
                self.state
            );
        }

        let mut actions = Actions::default();
        Self::purge_mismatched(
            &mut self.prepares,
            &digest,
            self.seq_no,
            VotePhase::Prepare,
            &mut actions.evidence,
        );
        Self::purge_mismatched(
            &mut self.commits,
            &digest,
            self.seq_no,
            VotePhase::Commit,
            &mut actions.evidence,
        );

        self.digest = Some(digest);
        self.state = SequenceState::Digested;
        pf_trace!("seq {} digested", self.seq_no);

        if !self.is_leader() {
            actions.validate.push(ValidateRequest {
                seq_no: self.seq_no,
                bucket: self.bucket,
                batch: self.batch.clone(),
            });
        }
        Ok(actions)
    }

    /// Leader-only acceptance of its own batch: skips validation and records
    /// the leader's Prepare without sending it, since the Preprepare already
    /// stands for it.
    pub fn apply_self_vote(&mut self) -> Result<Actions, MiradorError> {
        if !self.is_leader() {
            return logged_err!(
                "self vote for seq {} by non-leader {}",
                self.seq_no,
                self.config.me()
            );
        }
        if self.state != SequenceState::Digested {
            return logged_err!(
                "self vote for seq {} in state {:?}",
                self.seq_no,
                self.state
            );
        }
        let digest = self.own_digest()?;

        self.state = SequenceState::Validated;
        let mut actions = Actions {
            persist: vec![Persisted::QEntry(self.q_entry(digest.clone()))],
            ..Default::default()
        };
        Self::record_vote(
            &mut self.prepares,
            self.config.network_config.population(),
            self.leader,
            digest,
        )?;
        self.check_prepared(&mut actions)?;
        Ok(actions)
    }

    /// Applies the local validation verdict. Valid only from `Digested` on a
    /// non-leader. An invalid batch is reported as evidence against the
    /// leader and leaves the state untouched.
    pub fn apply_validate_result(
        &mut self,
        valid: bool,
    ) -> Result<Actions, MiradorError> {
        if self.is_leader() {
            return logged_err!(
                "validate result for seq {} on its leader",
                self.seq_no
            );
        }
        if self.state != SequenceState::Digested {
            return logged_err!(
                "validate result for seq {} in state {:?}",
                self.seq_no,
                self.state
            );
        }
        if !valid {
            pf_warn!(
                "leader {} proposed invalid batch at seq {}",
                self.leader,
                self.seq_no
            );
            return Err(MiradorError::ByzantineEvidence(
                Evidence::InvalidBatch {
                    leader: self.leader,
                    seq_no: self.seq_no,
                },
            ));
        }
        let digest = self.own_digest()?;

        self.state = SequenceState::Validated;
        pf_trace!("seq {} validated", self.seq_no);
        let mut actions = Actions {
            persist: vec![Persisted::QEntry(self.q_entry(digest.clone()))],
            broadcast: vec![PeerMsg::Prepare {
                seq_no: self.seq_no,
                epoch: self.config.number,
                digest: digest.clone(),
            }],
            ..Default::default()
        };
        Self::record_vote(
            &mut self.prepares,
            self.config.network_config.population(),
            self.config.me(),
            digest,
        )?;
        self.check_prepared(&mut actions)?;
        Ok(actions)
    }

    /// Records a Prepare vote. A vote for a digest other than mine is
    /// reported and ignored.
    pub fn apply_prepare(
        &mut self,
        source: NodeId,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        let mut actions = Actions::default();
        if self.state == SequenceState::Committed {
            return Ok(actions);
        }
        if let Some(mine) = &self.digest {
            if *mine != digest {
                pf_warn!(
                    "node {} Prepare digest mismatch at seq {}",
                    source,
                    self.seq_no
                );
                actions.evidence.push(Evidence::DigestMismatch {
                    source,
                    seq_no: self.seq_no,
                    phase: VotePhase::Prepare,
                });
                return Ok(actions);
            }
        }

        if Self::record_vote(
            &mut self.prepares,
            self.config.network_config.population(),
            source,
            digest,
        )? {
            pf_trace!("seq {} Prepare <- {}", self.seq_no, source);
            self.check_prepared(&mut actions)?;
        }
        Ok(actions)
    }

    /// Records a Commit vote, with the same matching discipline as Prepare.
    pub fn apply_commit(
        &mut self,
        source: NodeId,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        let mut actions = Actions::default();
        if self.state == SequenceState::Committed {
            return Ok(actions);
        }
        if let Some(mine) = &self.digest {
            if *mine != digest {
                pf_warn!(
                    "node {} Commit digest mismatch at seq {}",
                    source,
                    self.seq_no
                );
                actions.evidence.push(Evidence::DigestMismatch {
                    source,
                    seq_no: self.seq_no,
                    phase: VotePhase::Commit,
                });
                return Ok(actions);
            }
        }

        if Self::record_vote(
            &mut self.commits,
            self.config.network_config.population(),
            source,
            digest,
        )? {
            pf_trace!("seq {} Commit <- {}", self.seq_no, source);
            self.check_committed(&mut actions);
        }
        Ok(actions)
    }

    /// Moves `Validated` -> `Prepared` once a Prepare quorum matches, then
    /// casts my Commit.
    fn check_prepared(
        &mut self,
        actions: &mut Actions,
    ) -> Result<(), MiradorError> {
        if self.state != SequenceState::Validated
            || self.prepare_count() < self.config.network_config.quorum()
        {
            return Ok(());
        }
        let digest = match self.digest.clone() {
            Some(d) => d,
            None => return Ok(()),
        };

        self.state = SequenceState::Prepared;
        pf_debug!(
            "seq {} prepared in epoch {}",
            self.seq_no,
            self.config.number
        );

        actions.persist.push(Persisted::PEntry(PEntry {
            seq_no: self.seq_no,
            epoch: self.config.number,
            digest: digest.clone(),
        }));
        actions.broadcast.push(PeerMsg::Commit {
            seq_no: self.seq_no,
            epoch: self.config.number,
            digest: digest.clone(),
        });
        Self::record_vote(
            &mut self.commits,
            self.config.network_config.population(),
            self.config.me(),
            digest,
        )?;
        self.check_committed(actions);
        Ok(())
    }

    /// Moves `Prepared` -> `Committed` once a Commit quorum matches.
    fn check_committed(&mut self, actions: &mut Actions) {
        if self.state != SequenceState::Prepared
            || self.commit_count() < self.config.network_config.quorum()
        {
            return;
        }
        let digest = match self.digest.clone() {
            Some(d) => d,
            None => return,
        };

        self.state = SequenceState::Committed;
        pf_debug!(
            "seq {} committed in epoch {}",
            self.seq_no,
            self.config.number
        );

        actions.commits.push(CommitNotice {
            q_entry: self.q_entry(digest),
            batch: self.batch.clone(),
        });
    }
}

#[cfg(test)]
mod sequence_tests {
    use super::*;
    use crate::ordering::test_helpers::{digest, epoch_config};

    fn batch() -> Batch {
        vec![Bytes::from_static(b"req-a"), Bytes::from_static(b"req-b")]
    }

    #[test]
    fn follower_full_path() -> Result<(), MiradorError> {
        let config = epoch_config(1, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 5, 0, 0);

        let actions = s.apply_preprepare(batch())?;
        assert_eq!(actions.digest.len(), 1);
        assert_eq!(actions.digest[0].seq_no, 5);
        assert_eq!(s.state(), SequenceState::Preprepared);

        let actions = s.apply_digest_result(digest("d5"))?;
        assert_eq!(actions.validate.len(), 1);
        assert_eq!(s.state(), SequenceState::Digested);

        let actions = s.apply_validate_result(true)?;
        assert_eq!(s.state(), SequenceState::Validated);
        assert_eq!(
            actions.broadcast,
            vec![PeerMsg::Prepare {
                seq_no: 5,
                epoch: 3,
                digest: digest("d5")
            }]
        );
        assert!(matches!(actions.persist[0], Persisted::QEntry(_)));

        // implicit leader vote plus mine is not yet a quorum
        let actions = s.apply_prepare(0, digest("d5"))?;
        assert!(actions.is_empty());
        assert_eq!(s.state(), SequenceState::Validated);

        let actions = s.apply_prepare(2, digest("d5"))?;
        assert_eq!(s.state(), SequenceState::Prepared);
        assert!(matches!(actions.persist[0], Persisted::PEntry(_)));
        assert!(matches!(actions.broadcast[0], PeerMsg::Commit { .. }));
        assert_eq!(s.commit_count(), 1);

        s.apply_commit(0, digest("d5"))?;
        let actions = s.apply_commit(3, digest("d5"))?;
        assert_eq!(s.state(), SequenceState::Committed);
        assert_eq!(actions.commits.len(), 1);
        assert_eq!(actions.commits[0].q_entry.seq_no, 5);
        assert_eq!(actions.commits[0].batch, batch());

        // terminal: later votes are no-ops
        assert!(s.apply_commit(2, digest("d5"))?.is_empty());
        assert_eq!(s.state(), SequenceState::Committed);
        Ok(())
    }

    #[test]
    fn leader_self_vote_path() -> Result<(), MiradorError> {
        let config = epoch_config(0, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 1, 0, 0);
        s.apply_preprepare(batch())?;
        let actions = s.apply_digest_result(digest("d1"))?;
        assert!(actions.validate.is_empty());

        let actions = s.apply_self_vote()?;
        assert_eq!(s.state(), SequenceState::Validated);
        assert!(actions.broadcast.is_empty());
        assert_eq!(s.prepare_count(), 1);

        s.apply_prepare(1, digest("d1"))?;
        assert_eq!(s.state(), SequenceState::Validated);
        s.apply_prepare(2, digest("d1"))?;
        assert_eq!(s.state(), SequenceState::Prepared);
        assert!(s.apply_validate_result(true).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_and_duplicate_votes() -> Result<(), MiradorError> {
        let config = epoch_config(1, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 2, 0, 0);
        s.apply_preprepare(batch())?;
        s.apply_digest_result(digest("good"))?;
        s.apply_validate_result(true)?;

        let actions = s.apply_prepare(2, digest("evil"))?;
        assert_eq!(
            actions.evidence,
            vec![Evidence::DigestMismatch {
                source: 2,
                seq_no: 2,
                phase: VotePhase::Prepare
            }]
        );
        assert_eq!(s.prepare_count(), 1);

        s.apply_prepare(0, digest("good"))?;
        s.apply_prepare(0, digest("good"))?;
        s.apply_prepare(1, digest("good"))?;
        assert_eq!(s.prepare_count(), 2);
        assert_eq!(s.state(), SequenceState::Validated);
        assert_eq!(s.digest(), Some(&digest("good")));
        Ok(())
    }

    #[test]
    fn early_votes_buffered() -> Result<(), MiradorError> {
        let config = epoch_config(1, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 4, 0, 0);
        s.apply_prepare(2, digest("good"))?;
        s.apply_prepare(3, digest("evil"))?;
        s.apply_commit(3, digest("evil"))?;

        s.apply_preprepare(batch())?;
        let actions = s.apply_digest_result(digest("good"))?;
        assert_eq!(actions.evidence.len(), 2);
        assert_eq!(s.prepare_count(), 1);
        assert_eq!(s.commit_count(), 0);

        s.apply_validate_result(true)?;
        s.apply_prepare(0, digest("good"))?;
        assert_eq!(s.state(), SequenceState::Prepared);
        Ok(())
    }

    #[test]
    fn five_nodes_need_four_votes() -> Result<(), MiradorError> {
        // five nodes tolerating one fault: three votes are not enough, or an
        // equivocating leader could get two digests committed
        let network_config = NetworkConfig {
            nodes: vec![0, 1, 2, 3, 4],
            f: 1,
            ..Default::default()
        };
        let my_config = NodeConfig {
            id: 1,
            ..Default::default()
        };
        let buckets = [(0, 0)].into_iter().collect();
        let config =
            EpochConfig::new(3, 1, 100, buckets, my_config, network_config)?;
        let mut s = Sequence::new(config, 1, 0, 0);
        s.apply_preprepare(batch())?;
        s.apply_digest_result(digest("d1"))?;
        s.apply_validate_result(true)?;
        s.apply_prepare(0, digest("d1"))?;
        s.apply_prepare(2, digest("d1"))?;
        assert_eq!(s.prepare_count(), 3);
        assert_eq!(s.state(), SequenceState::Validated);

        s.apply_prepare(3, digest("d1"))?;
        assert_eq!(s.state(), SequenceState::Prepared);
        Ok(())
    }

    #[test]
    fn invalid_batch_is_evidence() -> Result<(), MiradorError> {
        let config = epoch_config(1, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 9, 0, 0);
        s.apply_preprepare(batch())?;
        s.apply_digest_result(digest("d9"))?;
        let err = s.apply_validate_result(false).unwrap_err();
        assert_eq!(
            err,
            MiradorError::ByzantineEvidence(Evidence::InvalidBatch {
                leader: 0,
                seq_no: 9
            })
        );
        assert_eq!(s.state(), SequenceState::Digested);
        Ok(())
    }

    #[test]
    fn out_of_order_calls_rejected() -> Result<(), MiradorError> {
        let config = epoch_config(1, &[0], 1, 100, 1);
        let mut s = Sequence::new(config, 3, 0, 0);
        assert!(s
            .apply_digest_result(digest("d3"))
            .unwrap_err()
            .is_contract_violation());
        assert!(s.apply_validate_result(true).is_err());
        assert!(s.apply_self_vote().is_err());
        s.apply_preprepare(batch())?;
        assert!(s
            .apply_preprepare(batch())
            .unwrap_err()
            .is_contract_violation());
        assert!(s.apply_prepare(7, digest("d3")).is_err());
        assert_eq!(s.state(), SequenceState::Preprepared);
        Ok(())
    }
}
