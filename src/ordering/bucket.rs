//! Ordering core -- pipelined bucket lane over a sequence number range.

use std::collections::VecDeque;
use std::mem;

use super::*;

/// Diagnostic snapshot of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub id: BucketId,
    pub leader: bool,
    pub next_assigned: SeqNo,
    pub next_preprepare: SeqNo,
    pub next_prepare: SeqNo,
    pub next_commit: SeqNo,
    pub batches_pending: usize,
    /// States of owned sequences, ascending from the low watermark.
    pub sequences: Vec<SequenceState>,
}

/// One pipeline lane. Owns every sequence number `s` in the watermark window
/// with `s % number_of_buckets == id`, kept contiguously in a ring buffer.
#[derive(Debug)]
pub struct Bucket {
    /// Governing epoch config.
    config: Arc<EpochConfig>,

    /// Bucket ID.
    id: BucketId,

    /// Leader of this bucket in the current epoch.
    leader: NodeId,

    /// Distance between consecutive owned sequence numbers.
    stride: u64,

    /// Owned sequences in ascending order; the front is the lowest owned
    /// sequence number at or above the low watermark.
    sequences: VecDeque<Sequence>,

    /// Next sequence number I will preprepare, if leading.
    next_assigned: SeqNo,

    /// Local progress cursors, for diagnostics.
    next_preprepare: SeqNo,
    next_prepare: SeqNo,
    next_commit: SeqNo,

    /// Proposals not yet cut into a batch (leader only).
    queue: Batch,

    /// Total bytes in `queue`.
    size_bytes: usize,

    /// Batches cut but not yet assigned a sequence number (leader only).
    pending: VecDeque<Batch>,
}

impl Bucket {
    /// Creates the bucket and populates its window.
    pub fn new(
        config: Arc<EpochConfig>,
        id: BucketId,
    ) -> Result<Self, MiradorError> {
        let leader = match config.leader_of(id) {
            Some(leader) => leader,
            None => return logged_err!("no leader for bucket {}", id),
        };
        let stride = config.network_config.number_of_buckets;
        let first = Self::first_owned(config.low_watermark, id, stride);

        let mut bucket = Bucket {
            config,
            id,
            leader,
            stride,
            sequences: VecDeque::new(),
            next_assigned: first,
            next_preprepare: first,
            next_prepare: first,
            next_commit: first,
            queue: vec![],
            size_bytes: 0,
            pending: VecDeque::new(),
        };
        bucket.fill_window();
        pf_debug!(
            "bucket {} created leader {} window [{}, {}]",
            id,
            leader,
            bucket.config.low_watermark,
            bucket.config.high_watermark
        );
        Ok(bucket)
    }

    /// Smallest sequence number at or above `low` owned by bucket `id`.
    fn first_owned(low: SeqNo, id: BucketId, stride: u64) -> SeqNo {
        let rem = low % stride;
        if rem <= id {
            low - rem + id
        } else {
            (low - rem).saturating_add(stride + id)
        }
    }

    #[inline]
    pub fn id(&self) -> BucketId {
        self.id
    }

    #[inline]
    pub fn leader(&self) -> NodeId {
        self.leader
    }

    #[inline]
    pub fn i_am_leader(&self) -> bool {
        self.leader == self.config.me()
    }

    #[inline]
    pub fn next_assigned(&self) -> SeqNo {
        self.next_assigned
    }

    #[inline]
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// Looks up an owned sequence inside the window.
    pub fn sequence(&self, seq_no: SeqNo) -> Option<&Sequence> {
        self.index(seq_no).ok().map(|idx| &self.sequences[idx])
    }

    fn index(&self, seq_no: SeqNo) -> Result<usize, MiradorError> {
        if seq_no < self.config.low_watermark
            || seq_no > self.config.high_watermark
        {
            return Err(MiradorError::msg(format!(
                "seq {} outside watermarks [{}, {}]",
                seq_no, self.config.low_watermark, self.config.high_watermark
            )));
        }
        if seq_no % self.stride != self.id {
            return Err(MiradorError::msg(format!(
                "seq {} not owned by bucket {}",
                seq_no, self.id
            )));
        }
        match self.sequences.front() {
            Some(front) => {
                Ok(((seq_no - front.seq_no()) / self.stride) as usize)
            }
            None => Err(MiradorError::msg(format!(
                "bucket {} owns no sequence in window",
                self.id
            ))),
        }
    }

    fn sequence_mut(
        &mut self,
        seq_no: SeqNo,
    ) -> Result<&mut Sequence, MiradorError> {
        match self.index(seq_no) {
            Ok(idx) => Ok(&mut self.sequences[idx]),
            Err(e) => {
                pf_error!("bucket {}: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// Creates fresh sequences for owned slots newly inside the window.
    fn fill_window(&mut self) {
        let mut next = match self.sequences.back() {
            Some(back) => back.seq_no().checked_add(self.stride),
            None => Some(Self::first_owned(
                self.config.low_watermark,
                self.id,
                self.stride,
            )),
        };
        while let Some(seq_no) = next {
            if seq_no > self.config.high_watermark
                || seq_no % self.stride != self.id
            {
                break;
            }
            self.sequences.push_back(Sequence::new(
                self.config.clone(),
                seq_no,
                self.id,
                self.leader,
            ));
            next = seq_no.checked_add(self.stride);
        }
    }

    /// Adopts a slid watermark window of the same epoch: prunes sequences
    /// below the new low watermark, creates the ones newly inside, then
    /// drains pending batches into the freed capacity.
    pub fn move_watermarks(
        &mut self,
        config: Arc<EpochConfig>,
    ) -> Result<Actions, MiradorError> {
        if config.number != self.config.number {
            return logged_err!(
                "bucket {} of epoch {} cannot move to epoch {}",
                self.id,
                self.config.number,
                config.number
            );
        }
        if config.low_watermark < self.config.low_watermark
            || config.high_watermark < self.config.high_watermark
        {
            return logged_err!(
                "bucket {} watermarks [{}, {}] cannot move back to [{}, {}]",
                self.id,
                self.config.low_watermark,
                self.config.high_watermark,
                config.low_watermark,
                config.high_watermark
            );
        }
        if config.leader_of(self.id) != Some(self.leader) {
            return logged_err!(
                "bucket {} leader changed within epoch {}",
                self.id,
                config.number
            );
        }

        while let Some(front) = self.sequences.front() {
            if front.seq_no() >= config.low_watermark {
                break;
            }
            self.sequences.pop_front();
        }
        self.config = config;
        self.fill_window();

        let first =
            Self::first_owned(self.config.low_watermark, self.id, self.stride);
        self.next_assigned = self.next_assigned.max(first);
        self.next_preprepare = self.next_preprepare.max(first);
        self.next_prepare = self.next_prepare.max(first);
        self.next_commit = self.next_commit.max(first);
        self.advance_cursors();
        pf_debug!(
            "bucket {} watermarks moved to [{}, {}]",
            self.id,
            self.config.low_watermark,
            self.config.high_watermark
        );

        if self.i_am_leader() {
            self.drain_queue()
        } else {
            Ok(Actions::default())
        }
    }

    /// Queues proposal data; cuts a batch once the queue reaches the cut
    /// size, then drains.
    pub fn propose(&mut self, data: Bytes) -> Result<Actions, MiradorError> {
        if !self.i_am_leader() {
            return logged_err!(
                "cannot propose in bucket {} led by {}",
                self.id,
                self.leader
            );
        }

        self.size_bytes += data.len();
        self.queue.push(data);
        let cut_size_bytes =
            self.config.my_config.batch_parameters.cut_size_bytes;
        if self.size_bytes >= cut_size_bytes {
            let batch = mem::take(&mut self.queue);
            pf_trace!(
                "bucket {} cut batch of {} requests {} bytes",
                self.id,
                batch.len(),
                self.size_bytes
            );
            self.pending.push_back(batch);
            self.size_bytes = 0;
        }

        self.drain_queue()
    }

    /// Assigns pending batches to consecutive sequence numbers while the
    /// pipelining margin below the high watermark allows.
    pub fn drain_queue(&mut self) -> Result<Actions, MiradorError> {
        if !self.i_am_leader() {
            return logged_err!(
                "cannot drain bucket {} led by {}",
                self.id,
                self.leader
            );
        }

        let mut actions = Actions::default();
        let margin = self.config.network_config.pipeline_margin()
            * self.config.checkpoint_interval();
        let limit = match self.config.high_watermark.checked_sub(margin) {
            Some(limit) => limit,
            None => return Ok(actions),
        };

        while self.next_assigned <= limit {
            let batch = match self.pending.pop_front() {
                Some(batch) => batch,
                None => break,
            };
            pf_debug!(
                "bucket {} assigns seq {} to batch of {}",
                self.id,
                self.next_assigned,
                batch.len()
            );
            actions.broadcast.push(PeerMsg::Preprepare {
                epoch: self.config.number,
                seq_no: self.next_assigned,
                bucket: self.id,
                batch,
            });
            self.next_assigned = self.next_assigned.saturating_add(self.stride);
        }

        Ok(actions)
    }

    /// Moves each progress cursor past sequences that reached its phase.
    fn advance_cursors(&mut self) {
        fn advance(
            cursor: &mut SeqNo,
            sequences: &VecDeque<Sequence>,
            stride: u64,
            at_least: SequenceState,
        ) {
            let base = match sequences.front() {
                Some(front) => front.seq_no(),
                None => return,
            };
            while *cursor >= base {
                let idx = ((*cursor - base) / stride) as usize;
                match sequences.get(idx) {
                    Some(s) if s.state() >= at_least => {
                        *cursor = cursor.saturating_add(stride)
                    }
                    _ => break,
                }
            }
        }

        advance(
            &mut self.next_preprepare,
            &self.sequences,
            self.stride,
            SequenceState::Preprepared,
        );
        advance(
            &mut self.next_prepare,
            &self.sequences,
            self.stride,
            SequenceState::Prepared,
        );
        advance(
            &mut self.next_commit,
            &self.sequences,
            self.stride,
            SequenceState::Committed,
        );
    }

    pub fn apply_preprepare(
        &mut self,
        seq_no: SeqNo,
        batch: Batch,
    ) -> Result<Actions, MiradorError> {
        let actions = self.sequence_mut(seq_no)?.apply_preprepare(batch)?;
        self.advance_cursors();
        Ok(actions)
    }

    /// Stores the digest; when leading, immediately accepts the batch with
    /// my own implicit vote instead of validating it.
    pub fn apply_digest_result(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        let i_am_leader = self.i_am_leader();
        let s = self.sequence_mut(seq_no)?;
        let mut actions = s.apply_digest_result(digest)?;
        if i_am_leader {
            actions.append(s.apply_self_vote()?);
        }
        self.advance_cursors();
        Ok(actions)
    }

    /// Applies the validation verdict; on success as a follower, also counts
    /// the leader's Prepare implied by its Preprepare.
    pub fn apply_validate_result(
        &mut self,
        seq_no: SeqNo,
        valid: bool,
    ) -> Result<Actions, MiradorError> {
        let leader = self.leader;
        let s = self.sequence_mut(seq_no)?;
        let mut actions = s.apply_validate_result(valid)?;
        let digest = s.digest().cloned();
        if let Some(digest) = digest {
            actions.append(s.apply_prepare(leader, digest)?);
        }
        self.advance_cursors();
        Ok(actions)
    }

    pub fn apply_prepare(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        let actions = self.sequence_mut(seq_no)?.apply_prepare(source, digest)?;
        self.advance_cursors();
        Ok(actions)
    }

    pub fn apply_commit(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        digest: Digest,
    ) -> Result<Actions, MiradorError> {
        let actions = self.sequence_mut(seq_no)?.apply_commit(source, digest)?;
        self.advance_cursors();
        Ok(actions)
    }

    pub fn status(&self) -> BucketStatus {
        BucketStatus {
            id: self.id,
            leader: self.i_am_leader(),
            next_assigned: self.next_assigned,
            next_preprepare: self.next_preprepare,
            next_prepare: self.next_prepare,
            next_commit: self.next_commit,
            batches_pending: self.pending.len(),
            sequences: self.sequences.iter().map(|s| s.state()).collect(),
        }
    }
}
