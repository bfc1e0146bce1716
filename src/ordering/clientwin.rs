//! Ordering core -- per-client request admission window.

use super::*;

use tokio::sync::watch;

/// A client request as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    pub client_id: ClientId,
    pub req_no: u64,
    pub data: Bytes,
}

/// Commit state of a request slot, mirrored from the sequence that carries
/// the request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum RequestState {
    Unallocated = 0,
    Allocated = 1,
    Committed = 2,
}

/// An allocated request slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_data: RequestData,
    pub digest: Digest,
    pub state: RequestState,
    /// Sequence number the request committed in; meaningful once committed.
    pub seq_no: SeqNo,
}

/// Observability snapshot of a client window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWindowStatus {
    pub low_watermark: u64,
    pub high_watermark: u64,
    /// Per slot: 0 = empty, 1 = allocated, 2 = committed.
    pub allocated: Vec<u64>,
}

/// Handle on one watermark window of a client. Fires exactly once, when the
/// window slides; after that the holder must fetch a fresh waiter from the
/// `ClientWindow` and re-check against its bounds.
#[derive(Debug, Clone)]
pub struct ClientWaiter {
    pub low_watermark: u64,
    pub high_watermark: u64,

    /// Window generation this waiter was issued for.
    generation: u64,

    /// Receiver side of the window generation channel.
    rx_gen: watch::Receiver<u64>,
}

impl ClientWaiter {
    /// True once the window this waiter was issued for has slid away.
    pub fn is_expired(&self) -> bool {
        *self.rx_gen.borrow() != self.generation
    }

    /// Waits until the window slides. Returns immediately if it already
    /// has, or if the window itself was dropped.
    pub async fn expired(&mut self) {
        while !self.is_expired() {
            if self.rx_gen.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sliding window of request slots of one client, bounded by watermarks.
#[derive(Debug)]
pub struct ClientWindow {
    client_id: ClientId,
    low_watermark: u64,
    high_watermark: u64,

    /// Slots indexed by `req_no - low_watermark`.
    requests: Vec<Option<Request>>,

    /// Current window generation; bumped on every slide.
    generation: u64,

    /// Sender side of the window generation channel.
    tx_gen: watch::Sender<u64>,
}

impl ClientWindow {
    /// Creates a window over `[low_watermark, high_watermark]`.
    pub fn new(
        client_id: ClientId,
        low_watermark: u64,
        high_watermark: u64,
    ) -> Result<Self, MiradorError> {
        let size = match high_watermark
            .checked_sub(low_watermark)
            .and_then(|span| span.checked_add(1))
            .and_then(|size| usize::try_from(size).ok())
        {
            Some(size) => size,
            None => {
                return logged_err!(
                    "client {} window [{}, {}] is inverted or unbounded",
                    client_id,
                    low_watermark,
                    high_watermark
                );
            }
        };
        let (tx_gen, _) = watch::channel(0);
        Ok(ClientWindow {
            client_id,
            low_watermark,
            high_watermark,
            requests: vec![None; size],
            generation: 0,
            tx_gen,
        })
    }

    #[inline]
    pub fn low_watermark(&self) -> u64 {
        self.low_watermark
    }

    #[inline]
    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    /// Returns a waiter for the current window.
    pub fn waiter(&self) -> ClientWaiter {
        ClientWaiter {
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
            generation: self.generation,
            rx_gen: self.tx_gen.subscribe(),
        }
    }

    fn offset(&self, req_no: u64) -> Result<usize, MiradorError> {
        if req_no > self.high_watermark || req_no < self.low_watermark {
            return logged_err!(
                "client {} req_no {} outside window [{}, {}]",
                self.client_id,
                req_no,
                self.low_watermark,
                self.high_watermark
            );
        }
        Ok((req_no - self.low_watermark) as usize)
    }

    /// Places a request into its slot. Re-allocating the same digest is a
    /// no-op; a different digest for an occupied slot is reported against
    /// the client and the first request is kept.
    pub fn allocate(
        &mut self,
        request_data: RequestData,
        digest: Digest,
    ) -> Result<(), MiradorError> {
        if request_data.client_id != self.client_id {
            return logged_err!(
                "request of client {} allocated in window of client {}",
                request_data.client_id,
                self.client_id
            );
        }
        let offset = self.offset(request_data.req_no)?;

        if let Some(existing) = &self.requests[offset] {
            if existing.digest == digest {
                return Ok(());
            }
            pf_warn!(
                "client {} sent conflicting requests for req_no {}",
                self.client_id,
                request_data.req_no
            );
            return Err(MiradorError::ByzantineEvidence(
                Evidence::ConflictingRequest {
                    client: self.client_id,
                    req_no: request_data.req_no,
                },
            ));
        }

        pf_trace!(
            "client {} allocated req_no {}",
            self.client_id,
            request_data.req_no
        );
        self.requests[offset] = Some(Request {
            request_data,
            digest,
            state: RequestState::Allocated,
            seq_no: 0,
        });
        Ok(())
    }

    /// Looks up the request in a slot; `None` if the slot is empty.
    pub fn request(
        &self,
        req_no: u64,
    ) -> Result<Option<&Request>, MiradorError> {
        let offset = self.offset(req_no)?;
        Ok(self.requests[offset].as_ref())
    }

    /// State of a slot.
    pub fn request_state(
        &self,
        req_no: u64,
    ) -> Result<RequestState, MiradorError> {
        Ok(self
            .request(req_no)?
            .map_or(RequestState::Unallocated, |r| r.state))
    }

    /// Mirrors the commit of the sequence carrying this request.
    pub fn mark_committed(
        &mut self,
        req_no: u64,
        seq_no: SeqNo,
    ) -> Result<(), MiradorError> {
        let offset = self.offset(req_no)?;
        match self.requests[offset].as_mut() {
            Some(request) => {
                if request.state == RequestState::Committed
                    && request.seq_no != seq_no
                {
                    return logged_err!(
                        "client {} req_no {} committed twice at {} and {}",
                        self.client_id,
                        req_no,
                        request.seq_no,
                        seq_no
                    );
                }
                request.state = RequestState::Committed;
                request.seq_no = seq_no;
                Ok(())
            }
            None => logged_err!(
                "client {} req_no {} committed without allocation",
                self.client_id,
                req_no
            ),
        }
    }

    /// Slides the window past the contiguous prefix of slots committed at or
    /// below `max_seq_no`. Returns the number of slots retired; if any, the
    /// current waiter fires. Fails, leaving the window as is, if the slide
    /// would run past the end of the request number space.
    pub fn garbage_collect(
        &mut self,
        max_seq_no: SeqNo,
    ) -> Result<usize, MiradorError> {
        let retired = self
            .requests
            .iter()
            .take_while(|slot| {
                matches!(slot, Some(r) if r.state == RequestState::Committed
                                        && r.seq_no <= max_seq_no)
            })
            .count();
        if retired == 0 {
            return Ok(0);
        }
        let high_watermark =
            match self.high_watermark.checked_add(retired as u64) {
                Some(high) => high,
                None => {
                    return logged_err!(
                        "client {} window cannot slide {} past {}",
                        self.client_id,
                        retired,
                        self.high_watermark
                    );
                }
            };

        let size = self.requests.len();
        let mut requests = Vec::with_capacity(size);
        requests.extend(self.requests.drain(retired..));
        requests.resize(size, None);
        self.requests = requests;
        self.low_watermark += retired as u64;
        self.high_watermark = high_watermark;

        self.generation += 1;
        self.tx_gen.send_replace(self.generation);
        pf_debug!(
            "client {} window slid by {} to [{}, {}]",
            self.client_id,
            retired,
            self.low_watermark,
            self.high_watermark
        );
        Ok(retired)
    }

    pub fn status(&self) -> RequestWindowStatus {
        RequestWindowStatus {
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
            allocated: self
                .requests
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .map_or(RequestState::Unallocated, |r| r.state)
                        as u64
                })
                .collect(),
        }
    }
}
