//! Retryable-request deduplication index.
//!
//! Guarantees exactly-once semantics for client writes in the presence of
//! retries, leader failovers, and log replay. Admitted requests are tracked
//! as running until their replication outcome is known; successful ones are
//! folded into compact per-client ranges of contiguous request ids. The
//! ranges double as the log-GC floor: the smallest retained op id gates log
//! truncation, and time-bounded retention keeps that floor moving even
//! under continuous traffic.

use std::collections::{hash_map, BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::clock::{CoarseTimePoint, RestartSafeClock};
use super::error::ConsensusError;
use super::metrics::RetryableRequestsMetrics;
use super::settings::RetryableRequestSettings;
use super::types::{ClientId, ConsensusRoundRef, OpId, ReplicateMsg, RequestId, WriteRequest};

/// A request admitted by `register` whose replication outcome is not yet
/// known. Rounds that arrive for the same id while it is running are parked
/// here and notified once, in arrival order, when the outcome lands.
#[derive(Debug)]
struct RunningRetryableRequest {
    entry_time: CoarseTimePoint,
    duplicate_rounds: Vec<ConsensusRoundRef>,
}

/// Contiguous block of successfully replicated request ids for one client.
#[derive(Clone, Copy, Debug)]
struct ReplicatedRequestRange {
    first_id: RequestId,
    last_id: RequestId,
    min_op_id: OpId,
    min_time: CoarseTimePoint,
    max_time: CoarseTimePoint,
}

impl ReplicatedRequestRange {
    fn new(id: RequestId, op_id: OpId, time: CoarseTimePoint) -> Self {
        Self {
            first_id: id,
            last_id: id,
            min_op_id: op_id,
            min_time: time,
            max_time: time,
        }
    }

    fn insert_time(&mut self, time: CoarseTimePoint) {
        self.min_time = self.min_time.min(time);
        self.max_time = self.max_time.max(time);
    }
}

/// Replicated ranges of one client, indexed simultaneously by the last id
/// of each range and by its minimum op id. The id ordering drives range
/// lookup and boundary extension; the op-id ordering is used only by log GC
/// to drop the oldest ranges and read the surviving minimum. Every mutation
/// that touches `last_id` or `min_op_id` goes through a method here so the
/// two orderings stay consistent.
#[derive(Debug, Default)]
struct ReplicatedRanges {
    by_last_id: BTreeMap<RequestId, ReplicatedRequestRange>,
    by_min_op_id: BTreeMap<OpId, RequestId>,
}

impl ReplicatedRanges {
    fn len(&self) -> usize {
        self.by_last_id.len()
    }

    fn is_empty(&self) -> bool {
        self.by_last_id.is_empty()
    }

    /// First range with `last_id >= id`.
    fn first_ending_at_or_after(&self, id: RequestId) -> Option<&ReplicatedRequestRange> {
        self.by_last_id.range(id..).next().map(|(_, range)| range)
    }

    /// Last range with `last_id < id`.
    fn last_ending_before(&self, id: RequestId) -> Option<&ReplicatedRequestRange> {
        self.by_last_id
            .range(..id)
            .next_back()
            .map(|(_, range)| range)
    }

    fn get(&self, last_id: RequestId) -> Option<&ReplicatedRequestRange> {
        self.by_last_id.get(&last_id)
    }

    /// Mutable access for in-place edits of `first_id` and the time bounds.
    /// Callers must not change `last_id` or `min_op_id` through this.
    fn range_mut(&mut self, last_id: RequestId) -> Option<&mut ReplicatedRequestRange> {
        self.by_last_id.get_mut(&last_id)
    }

    fn insert(&mut self, range: ReplicatedRequestRange) {
        self.by_min_op_id.insert(range.min_op_id, range.last_id);
        self.by_last_id.insert(range.last_id, range);
    }

    fn remove(&mut self, last_id: RequestId) -> Option<ReplicatedRequestRange> {
        let range = self.by_last_id.remove(&last_id)?;
        self.by_min_op_id.remove(&range.min_op_id);
        Some(range)
    }

    /// Lower the op-id bound of the range ending at `last_id`, rebalancing
    /// the op-id ordering. No-op unless `op_id` is smaller than the current
    /// bound.
    fn update_min_op_id(&mut self, last_id: RequestId, op_id: OpId) {
        let Some(range) = self.by_last_id.get_mut(&last_id) else {
            return;
        };
        if op_id < range.min_op_id {
            self.by_min_op_id.remove(&range.min_op_id);
            range.min_op_id = op_id;
            self.by_min_op_id.insert(op_id, last_id);
        }
    }

    /// Grow the range ending at `last_id` one id to the right, absorbing
    /// `time`. Ordering is preserved because neighbouring ranges are never
    /// adjacent.
    fn extend_right(&mut self, last_id: RequestId, time: CoarseTimePoint) {
        let Some(mut range) = self.remove(last_id) else {
            return;
        };
        range.insert_time(time);
        range.last_id += 1;
        self.insert(range);
    }

    /// Raise the left edge of the first range crossing `bound` to `bound`.
    /// Neither ordering is affected.
    fn trim_first_crossing(&mut self, bound: RequestId) {
        if let Some((_, range)) = self.by_last_id.range_mut(bound..).next() {
            if range.first_id < bound {
                range.first_id = bound;
            }
        }
    }

    /// Remove every range whose `last_id` is below `bound`. Returns how
    /// many were removed.
    fn remove_ending_below(&mut self, bound: RequestId) -> usize {
        let doomed: Vec<RequestId> = self.by_last_id.range(..bound).map(|(id, _)| *id).collect();
        for last_id in &doomed {
            self.remove(*last_id);
        }
        doomed.len()
    }

    /// Drop the op-id-ordered prefix of ranges whose `max_time` is older
    /// than `threshold`, stopping at the first survivor. Returns how many
    /// were removed.
    fn remove_expired_prefix(&mut self, threshold: CoarseTimePoint) -> usize {
        let mut doomed = Vec::new();
        for last_id in self.by_min_op_id.values() {
            match self.by_last_id.get(last_id) {
                Some(range) if range.max_time < threshold => doomed.push(*last_id),
                _ => break,
            }
        }
        for last_id in &doomed {
            self.remove(*last_id);
        }
        doomed.len()
    }

    /// Smallest op id across the surviving ranges.
    fn min_op_id(&self) -> Option<OpId> {
        self.by_min_op_id.keys().next().copied()
    }
}

/// All retryable-request state tracked for a single client.
#[derive(Debug, Default)]
struct ClientRetryableRequests {
    running: HashMap<RequestId, RunningRetryableRequest>,
    replicated: ReplicatedRanges,
    /// Greatest low-watermark the client has advertised; never decreases.
    min_running_request_id: RequestId,
    /// `UNSET` while any running or replicated entry exists, otherwise the
    /// moment the tables emptied. Drives delayed client eviction.
    empty_since: CoarseTimePoint,
}

/// Aggregate cardinalities across all clients, for tests and debug output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub running: usize,
    pub replicated: usize,
}

/// View of the fields the index reads from a write replicate.
#[derive(Clone, Copy, Debug)]
struct ReplicateData<'a> {
    write: &'a WriteRequest,
    op_id: OpId,
}

impl<'a> ReplicateData<'a> {
    /// `None` for non-write replicates; those are not retryable.
    fn from_msg(msg: &'a ReplicateMsg) -> Option<Self> {
        msg.write.as_ref().map(|write| Self {
            write,
            op_id: msg.id,
        })
    }

    fn client_id(&self) -> ClientId {
        self.write.client_id
    }

    fn request_id(&self) -> RequestId {
        self.write.request_id
    }

    fn min_running_request_id(&self) -> RequestId {
        self.write.min_running_request_id
    }

    fn op_id(&self) -> OpId {
        self.op_id
    }
}

/// Per-tablet retryable-request index.
///
/// Not internally synchronized: the consensus replica serializes every
/// operation under its update lock, together with log appends and round
/// transitions. No operation suspends, blocks, or performs I/O.
pub struct RetryableRequests {
    log_prefix: String,
    clients: HashMap<ClientId, ClientRetryableRequests>,
    clock: RestartSafeClock,
    settings: Arc<RetryableRequestSettings>,
    metrics: Option<Arc<RetryableRequestsMetrics>>,
}

impl RetryableRequests {
    pub fn new(log_prefix: impl Into<String>) -> Self {
        Self::with_clock_and_settings(
            log_prefix,
            RestartSafeClock::system(),
            Arc::new(RetryableRequestSettings::from_env()),
        )
    }

    pub fn with_clock_and_settings(
        log_prefix: impl Into<String>,
        clock: RestartSafeClock,
        settings: Arc<RetryableRequestSettings>,
    ) -> Self {
        let log_prefix = log_prefix.into();
        tracing::debug!(prefix = %log_prefix, "retryable request index created");
        Self {
            log_prefix,
            clients: HashMap::new(),
            clock,
            settings,
            metrics: None,
        }
    }

    /// Clock shared with the consensus layer, used to stamp entry times.
    pub fn clock(&self) -> &RestartSafeClock {
        &self.clock
    }

    pub fn settings(&self) -> &Arc<RetryableRequestSettings> {
        &self.settings
    }

    /// Attach the per-tablet gauges.
    pub fn set_metrics(&mut self, metrics: Arc<RetryableRequestsMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Offer an incoming round to the index.
    ///
    /// Returns `Ok(true)` when the round was admitted (or carries no write
    /// payload and is not retryable), `Ok(false)` when it is a duplicate of
    /// a running request and was parked for notification, `Expired` when the
    /// request id is below the client's low-watermark, and `AlreadyPresent`
    /// when the id was already replicated.
    ///
    /// An `UNSET` entry time is replaced with the current clock value.
    pub fn register(
        &mut self,
        round: &ConsensusRoundRef,
        entry_time: CoarseTimePoint,
    ) -> Result<bool, ConsensusError> {
        let Some(data) = ReplicateData::from_msg(round.replicate_msg()) else {
            return Ok(true);
        };

        let entry_time = if entry_time.is_unset() {
            self.clock.now()
        } else {
            entry_time
        };

        let metrics = self.metrics.clone();
        let client = self.clients.entry(data.client_id()).or_default();

        cleanup_replicated_requests(client, data.min_running_request_id(), metrics.as_deref());

        if data.request_id() < client.min_running_request_id {
            return Err(ConsensusError::Expired {
                request_id: data.request_id(),
                min_running_request_id: client.min_running_request_id,
            });
        }

        if let Some(range) = client.replicated.first_ending_at_or_after(data.request_id()) {
            if range.first_id <= data.request_id() {
                return Err(ConsensusError::AlreadyPresent(format!(
                    "duplicate request {} from client {} (min running {})",
                    data.request_id(),
                    data.client_id(),
                    client.min_running_request_id
                )));
            }
        }

        match client.running.entry(data.request_id()) {
            hash_map::Entry::Occupied(mut existing) => {
                existing.get_mut().duplicate_rounds.push(round.clone());
                Ok(false)
            }
            hash_map::Entry::Vacant(slot) => {
                slot.insert(RunningRetryableRequest {
                    entry_time,
                    duplicate_rounds: Vec::new(),
                });
                client.empty_since = CoarseTimePoint::UNSET;
                tracing::trace!(
                    prefix = %self.log_prefix,
                    client = %data.client_id(),
                    request_id = data.request_id(),
                    op_id = %data.op_id(),
                    "running request added"
                );
                if let Some(m) = &metrics {
                    m.inc_running();
                }
                Ok(true)
            }
        }
    }

    /// Report the replication outcome of a write round.
    ///
    /// Deferred duplicates are notified exactly once, in registration order:
    /// with a synthetic `AlreadyPresent` when the primary succeeded, with
    /// the primary's failure otherwise. On success the request id is folded
    /// into the client's replicated ranges.
    pub fn replication_finished(
        &mut self,
        replicate_msg: &ReplicateMsg,
        status: &Result<(), ConsensusError>,
        leader_term: i64,
    ) {
        let Some(data) = ReplicateData::from_msg(replicate_msg) else {
            return;
        };

        let metrics = self.metrics.clone();
        let range_time_limit = self.settings.range_time_limit();
        let client = self.clients.entry(data.client_id()).or_default();

        let Some(running) = client.running.remove(&data.request_id()) else {
            tracing::error!(
                prefix = %self.log_prefix,
                client = %data.client_id(),
                request_id = data.request_id(),
                running = ?client.running,
                "replication finished for request with unknown id"
            );
            debug_assert!(
                false,
                "replication finished for unknown request id {}",
                data.request_id()
            );
            return;
        };
        tracing::trace!(
            prefix = %self.log_prefix,
            client = %data.client_id(),
            request_id = data.request_id(),
            replicated = status.is_ok(),
            "running request finished"
        );

        let duplicate_status = match status {
            Ok(()) => ConsensusError::AlreadyPresent("Duplicate request".to_string()),
            Err(err) => err.clone(),
        };
        for duplicate in &running.duplicate_rounds {
            duplicate.notify_replication_finished(Err(duplicate_status.clone()), leader_term, None);
        }
        if let Some(m) = &metrics {
            m.dec_running();
        }

        if status.is_ok() {
            add_replicated(
                &self.log_prefix,
                client,
                data.op_id(),
                data.request_id(),
                running.entry_time,
                range_time_limit,
                metrics.as_deref(),
            );
        }
    }

    /// Rebuild replicated state from a committed log entry during replay.
    /// The running table must be empty for the replayed request id.
    pub fn bootstrap(&mut self, replicate_msg: &ReplicateMsg, entry_time: CoarseTimePoint) {
        let Some(data) = ReplicateData::from_msg(replicate_msg) else {
            return;
        };

        let metrics = self.metrics.clone();
        let range_time_limit = self.settings.range_time_limit();
        let client = self.clients.entry(data.client_id()).or_default();

        if client.running.contains_key(&data.request_id()) {
            tracing::error!(
                prefix = %self.log_prefix,
                client = %data.client_id(),
                request_id = data.request_id(),
                running = ?client.running,
                "bootstrapped request is still marked running"
            );
            debug_assert!(
                false,
                "bootstrapped running request id {}",
                data.request_id()
            );
            return;
        }
        tracing::trace!(
            prefix = %self.log_prefix,
            client = %data.client_id(),
            request_id = data.request_id(),
            op_id = %data.op_id(),
            "bootstrapped request"
        );

        cleanup_replicated_requests(client, data.min_running_request_id(), metrics.as_deref());
        add_replicated(
            &self.log_prefix,
            client,
            data.op_id(),
            data.request_id(),
            entry_time,
            range_time_limit,
            metrics.as_deref(),
        );
    }

    /// Drop replicated ranges older than the retention window, evict
    /// clients whose tables have been empty for the same window, and return
    /// the smallest op id the log must still retain. `OpId::MAX` means
    /// nothing is retained and the log may truncate anywhere.
    pub fn clean_expired_replicated_and_get_min_op_id(&mut self) -> OpId {
        let mut result = OpId::MAX;
        let now = self.clock.now();
        let threshold = now.saturating_sub(self.settings.retention());
        let metrics = self.metrics.clone();
        let log_prefix = self.log_prefix.as_str();

        self.clients.retain(|client_id, client| {
            let expired = client.replicated.remove_expired_prefix(threshold);
            if expired > 0 {
                if let Some(m) = &metrics {
                    m.dec_ranges_by(expired as i64);
                }
            }
            if let Some(min_op_id) = client.replicated.min_op_id() {
                result = result.min(min_op_id);
            }
            if client.replicated.is_empty() && client.running.is_empty() {
                // Eviction is delayed so late retries below the watermark
                // can still be rejected.
                if client.empty_since.is_unset() {
                    client.empty_since = now;
                } else if client.empty_since < threshold {
                    tracing::trace!(prefix = %log_prefix, client = %client_id, "evicting idle client");
                    return false;
                }
            }
            true
        });

        result
    }

    /// Low-watermark advertised by `client_id`, if the client is known.
    pub fn min_running_request_id(&self, client_id: ClientId) -> Result<RequestId, ConsensusError> {
        match self.clients.get(&client_id) {
            Some(client) => Ok(client.min_running_request_id),
            None => Err(ConsensusError::NotFound(format!(
                "client requests data not found for client {client_id}"
            ))),
        }
    }

    /// Running / replicated cardinalities across every client.
    pub fn debug_counts(&self) -> IndexCounts {
        let mut counts = IndexCounts::default();
        for client in self.clients.values() {
            counts.running += client.running.len();
            counts.replicated += client.replicated.len();
        }
        counts
    }
}

/// Advance the client's low-watermark to `new_min_running_request_id`,
/// dropping every replicated range entirely below it and raising the left
/// edge of the range the watermark lands in. The watermark never moves
/// backwards.
fn cleanup_replicated_requests(
    client: &mut ClientRetryableRequests,
    new_min_running_request_id: RequestId,
    metrics: Option<&RetryableRequestsMetrics>,
) {
    if new_min_running_request_id <= client.min_running_request_id {
        return;
    }
    client
        .replicated
        .trim_first_crossing(new_min_running_request_id);
    let removed = client
        .replicated
        .remove_ending_below(new_min_running_request_id);
    if removed > 0 {
        if let Some(m) = metrics {
            m.dec_ranges_by(removed as i64);
        }
    }
    client.min_running_request_id = new_min_running_request_id;
}

/// Fold a just-committed request id into the client's replicated ranges:
/// attach to the range starting right after it, grow the range ending right
/// before it, join neighbours when the id closes the gap between them, or
/// start a new single-id range.
fn add_replicated(
    log_prefix: &str,
    client: &mut ClientRetryableRequests,
    op_id: OpId,
    request_id: RequestId,
    time: CoarseTimePoint,
    range_time_limit: Duration,
    metrics: Option<&RetryableRequestsMetrics>,
) {
    client.empty_since = CoarseTimePoint::UNSET;

    let next = client
        .replicated
        .first_ending_at_or_after(request_id)
        .map(|range| (range.first_id, range.last_id));

    if let Some((next_first_id, next_last_id)) = next {
        if next_first_id <= request_id {
            tracing::error!(
                prefix = %log_prefix,
                request_id,
                op_id = %op_id,
                replicated = ?client.replicated,
                "request already replicated"
            );
            debug_assert!(false, "request id {request_id} already replicated");
            return;
        }

        // Attaching to the left end of a range is rare, so the range time
        // limit is not checked on this path.
        if next_first_id == request_id + 1 {
            if let Some(range) = client.replicated.range_mut(next_last_id) {
                range.insert_time(time);
            }
            if !try_join_ranges(client, next_last_id, op_id, range_time_limit, metrics) {
                if let Some(range) = client.replicated.range_mut(next_last_id) {
                    range.first_id -= 1;
                }
                client.replicated.update_min_op_id(next_last_id, op_id);
            }
            return;
        }
    }

    if try_join_to_end_of_range(client, op_id, request_id, time, range_time_limit) {
        return;
    }

    client
        .replicated
        .insert(ReplicatedRequestRange::new(request_id, op_id, time));
    if let Some(m) = metrics {
        m.inc_ranges();
    }
}

/// Join the range ending at `last_id` with its predecessor. Possible only
/// when exactly the just-replicated id separates them and the merged span
/// fits the range time limit.
fn try_join_ranges(
    client: &mut ClientRetryableRequests,
    last_id: RequestId,
    min_op_id: OpId,
    range_time_limit: Duration,
    metrics: Option<&RetryableRequestsMetrics>,
) -> bool {
    let Some((cur_first_id, cur_max_time)) = client
        .replicated
        .get(last_id)
        .map(|range| (range.first_id, range.max_time))
    else {
        return false;
    };
    let Some((prev_last_id, prev_min_time, prev_min_op_id)) = client
        .replicated
        .last_ending_before(last_id)
        .map(|range| (range.last_id, range.min_time, range.min_op_id))
    else {
        return false;
    };

    if prev_last_id + 2 != cur_first_id {
        return false;
    }
    if cur_max_time > prev_min_time + range_time_limit {
        return false;
    }

    let min_op_id = min_op_id.min(prev_min_op_id);
    let Some(prev) = client.replicated.remove(prev_last_id) else {
        return false;
    };
    if let Some(range) = client.replicated.range_mut(last_id) {
        range.first_id = prev.first_id;
        range.insert_time(prev.min_time);
        range.insert_time(prev.max_time);
    }
    client.replicated.update_min_op_id(last_id, min_op_id);
    if let Some(m) = metrics {
        m.dec_ranges();
    }
    true
}

/// Grow the range ending right before `request_id` to include it, when the
/// new entry time keeps the range within the time limit.
fn try_join_to_end_of_range(
    client: &mut ClientRetryableRequests,
    op_id: OpId,
    request_id: RequestId,
    time: CoarseTimePoint,
    range_time_limit: Duration,
) -> bool {
    let Some((prev_last_id, prev_min_time)) = client
        .replicated
        .last_ending_before(request_id)
        .map(|range| (range.last_id, range.min_time))
    else {
        return false;
    };

    if prev_last_id + 1 != request_id {
        return false;
    }
    // A request attaching to the end of a range rarely carries a time below
    // the range's min_time, so only the forward span is checked.
    if time > prev_min_time + range_time_limit {
        return false;
    }

    client.replicated.extend_right(prev_last_id, time);
    client.replicated.update_min_op_id(request_id, op_id);
    true
}
