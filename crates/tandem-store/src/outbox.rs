//! Outbox Queue - durable, ordered collection of pending outbound operations.
//!
//! Items are kept in insertion order (`seq`) and drained by priority tier,
//! high first. An item whose dependencies are unresolved is skipped by the
//! caller, never blocking the rest of the queue. Completed and cancelled
//! items leave the outbox; permanently failed ones stay until resolved by hand.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tandem_core::{CorrelationId, ItemId, LocalId, PayloadHash};

/// Default window in which an identical payload is treated as a duplicate.
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Tiers in the order they are drained.
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an item does to its target entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// A caller-built request with no entity bookkeeping attached.
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Dispatching,
    /// Waiting for `next_retry_at` after a transient failure.
    Retrying,
    /// Permanent failure; surfaced, never retried automatically.
    Failed,
}

/// A request to be placed in the outbox.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub target: Option<LocalId>,
    pub operation: Operation,
    pub method: Method,
    pub url_template: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub dependency_refs: BTreeSet<LocalId>,
    pub priority: Priority,
}

impl OutboundRequest {
    pub fn new(method: Method, url_template: impl Into<String>) -> Self {
        Self {
            target: None,
            operation: Operation::Custom,
            method,
            url_template: url_template.into(),
            body: None,
            headers: BTreeMap::new(),
            dependency_refs: BTreeSet::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_target(mut self, target: LocalId, operation: Operation) -> Self {
        self.target = Some(target);
        self.operation = operation;
        self
    }

    pub fn with_dependency(mut self, id: LocalId) -> Self {
        self.dependency_refs.insert(id);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One outbound mutation awaiting acknowledgement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: ItemId,
    pub seq: u64,
    pub correlation_id: CorrelationId,
    pub payload_hash: PayloadHash,
    pub target: Option<LocalId>,
    pub operation: Operation,
    pub dependency_refs: BTreeSet<LocalId>,
    pub method: Method,
    pub url_template: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub timestamp: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<u64>,
    pub priority: Priority,
    pub state: ItemState,
    /// Sent at least once with no recorded outcome, e.g. cut off by a crash.
    #[serde(default)]
    pub attempted: bool,
}

impl OutboxItem {
    fn from_request(request: OutboundRequest, seq: u64, now: u64) -> Self {
        let payload_hash = PayloadHash::of_request(
            request.method.as_str(),
            &request.url_template,
            request.body.as_ref(),
        );
        Self {
            id: ItemId::new(),
            seq,
            correlation_id: CorrelationId::new(),
            payload_hash,
            target: request.target,
            operation: request.operation,
            dependency_refs: request.dependency_refs,
            method: request.method,
            url_template: request.url_template,
            body: request.body,
            headers: request.headers,
            timestamp: now,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            priority: request.priority,
            state: ItemState::Queued,
            attempted: false,
        }
    }

    pub fn compute_hash(&self) -> PayloadHash {
        PayloadHash::of_request(self.method.as_str(), &self.url_template, self.body.as_ref())
    }

    /// Whether a previous attempt may have been processed by the server.
    pub fn may_have_reached_server(&self) -> bool {
        self.state == ItemState::Dispatching || self.retry_count > 0 || self.attempted
    }

    pub fn is_outstanding(&self) -> bool {
        self.state != ItemState::Failed
    }
}

/// Outcome of an enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Added(ItemId),
    /// Dropped: an identical payload is already pending within the window.
    Duplicate(ItemId),
}

impl Enqueued {
    pub fn item_id(&self) -> ItemId {
        match self {
            Enqueued::Added(id) | Enqueued::Duplicate(id) => *id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Outbox {
    items: BTreeMap<u64, OutboxItem>,
    by_id: HashMap<ItemId, u64>,
    by_correlation: HashMap<CorrelationId, u64>,
    by_hash: HashMap<PayloadHash, BTreeSet<u64>>,
    next_seq: u64,
    dedup_window_ms: u64,
}

impl Outbox {
    pub fn new(dedup_window_ms: u64) -> Self {
        Self {
            items: BTreeMap::new(),
            by_id: HashMap::new(),
            by_correlation: HashMap::new(),
            by_hash: HashMap::new(),
            next_seq: 1,
            dedup_window_ms,
        }
    }

    /// Rebuild an outbox from persisted items.
    pub fn from_items(items: impl IntoIterator<Item = OutboxItem>, dedup_window_ms: u64) -> Self {
        let mut outbox = Self::new(dedup_window_ms);
        for item in items {
            outbox.next_seq = outbox.next_seq.max(item.seq + 1);
            outbox.index(&item);
            outbox.items.insert(item.seq, item);
        }
        outbox
    }

    pub fn dedup_window_ms(&self) -> u64 {
        self.dedup_window_ms
    }

    pub fn set_dedup_window_ms(&mut self, window: u64) {
        self.dedup_window_ms = window;
    }

    fn index(&mut self, item: &OutboxItem) {
        self.by_id.insert(item.id, item.seq);
        self.by_correlation
            .insert(item.correlation_id.clone(), item.seq);
        self.by_hash
            .entry(item.payload_hash)
            .or_default()
            .insert(item.seq);
    }

    fn unindex(&mut self, item: &OutboxItem) {
        self.by_id.remove(&item.id);
        self.by_correlation.remove(&item.correlation_id);
        if let Some(seqs) = self.by_hash.get_mut(&item.payload_hash) {
            seqs.remove(&item.seq);
            if seqs.is_empty() {
                self.by_hash.remove(&item.payload_hash);
            }
        }
    }

    /// Find a live duplicate of `hash` enqueued within the dedup window.
    ///
    /// A match only counts while it is still the latest outstanding write to
    /// its target. Once something else for that target was queued after it,
    /// the same payload again is a real change and must go out.
    pub fn find_duplicate(&self, hash: &PayloadHash, now: u64) -> Option<ItemId> {
        let window_start = now.saturating_sub(self.dedup_window_ms);
        self.by_hash.get(hash)?.iter().find_map(|seq| {
            let item = self.items.get(seq)?;
            let live = item.is_outstanding() && item.timestamp >= window_start;
            (live && !self.is_superseded(item)).then_some(item.id)
        })
    }

    /// Whether a later outstanding item writes to the same target as `item`.
    /// Requests without a target are keyed by method and URL.
    fn is_superseded(&self, item: &OutboxItem) -> bool {
        self.items
            .range(item.seq + 1..)
            .map(|(_, later)| later)
            .filter(|later| later.is_outstanding())
            .any(|later| match item.target {
                Some(target) => later.target == Some(target),
                None => {
                    later.target.is_none()
                        && later.method == item.method
                        && later.url_template == item.url_template
                }
            })
    }

    pub fn enqueue(&mut self, request: OutboundRequest, now: u64) -> Enqueued {
        let item = OutboxItem::from_request(request, self.next_seq, now);

        if let Some(existing) = self.find_duplicate(&item.payload_hash, now) {
            tracing::debug!(
                existing = %existing,
                hash = %item.payload_hash.short(),
                "dropping duplicate enqueue"
            );
            return Enqueued::Duplicate(existing);
        }

        self.next_seq += 1;
        let id = item.id;
        self.index(&item);
        self.items.insert(item.seq, item);
        Enqueued::Added(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&OutboxItem> {
        self.by_id.get(id).and_then(|seq| self.items.get(seq))
    }

    pub fn by_correlation(&self, correlation: &CorrelationId) -> Option<&OutboxItem> {
        self.by_correlation
            .get(correlation)
            .and_then(|seq| self.items.get(seq))
    }

    /// Mutate an item in place, keeping the hash index consistent.
    pub fn update<R>(&mut self, id: &ItemId, f: impl FnOnce(&mut OutboxItem) -> R) -> Option<R> {
        let seq = *self.by_id.get(id)?;
        let mut item = self.items.remove(&seq)?;
        self.unindex(&item);

        let result = f(&mut item);
        item.payload_hash = item.compute_hash();

        self.index(&item);
        self.items.insert(seq, item);
        Some(result)
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<OutboxItem> {
        let seq = *self.by_id.get(id)?;
        let item = self.items.remove(&seq)?;
        self.unindex(&item);
        Some(item)
    }

    /// Move retrying items whose backoff elapsed back to `Queued`.
    pub fn promote_due(&mut self, now: u64) -> usize {
        let mut promoted = 0;
        for item in self.items.values_mut() {
            if item.state == ItemState::Retrying && item.next_retry_at.map_or(true, |at| at <= now)
            {
                item.state = ItemState::Queued;
                promoted += 1;
            }
        }
        promoted
    }

    /// Queued items in drain order: high tier first, insertion order within a tier.
    pub fn candidates(&mut self, now: u64) -> Vec<ItemId> {
        self.promote_due(now);
        let mut order = Vec::new();
        for tier in Priority::DRAIN_ORDER {
            order.extend(
                self.items
                    .values()
                    .filter(|item| item.priority == tier && item.state == ItemState::Queued)
                    .map(|item| item.id),
            );
        }
        order
    }

    /// All items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &OutboxItem> {
        self.items.values()
    }

    pub fn items(&self) -> Vec<OutboxItem> {
        self.items.values().cloned().collect()
    }

    pub fn items_for_target(&self, target: &LocalId) -> Vec<ItemId> {
        self.items
            .values()
            .filter(|item| item.target.as_ref() == Some(target))
            .map(|item| item.id)
            .collect()
    }

    pub fn items_depending_on(&self, local: &LocalId) -> Vec<ItemId> {
        self.items
            .values()
            .filter(|item| item.dependency_refs.contains(local))
            .map(|item| item.id)
            .collect()
    }

    /// The queued, never-attempted create of `target`, if any.
    pub fn unsent_create(&self, target: &LocalId) -> Option<&OutboxItem> {
        self.items.values().find(|item| {
            item.target.as_ref() == Some(target)
                && item.operation == Operation::Create
                && item.state == ItemState::Queued
                && !item.may_have_reached_server()
        })
    }

    /// Items not yet acknowledged and not failed.
    pub fn pending_count(&self) -> usize {
        self.items.values().filter(|item| item.is_outstanding()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items.len() - self.pending_count()
    }

    pub fn failed_items(&self) -> Vec<OutboxItem> {
        self.items
            .values()
            .filter(|item| item.state == ItemState::Failed)
            .cloned()
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.state == ItemState::Dispatching)
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}
