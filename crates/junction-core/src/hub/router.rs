//! Point-to-point, broadcast and paired request/response delivery.
//!
//! Every active role owns one unbounded inbound queue drained by a single
//! dispatcher task, so messages reach a role in the order they were sent.
//! Delivery is at-most-once: messages for an inactive role are dropped, and
//! a handler failure on a fire-and-forget message is logged, never returned
//! to the sender.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::fanout::Dispatch;
use crate::metrics::Metrics;
use crate::self_healing::{CallContextTracker, Clearable};

use super::error::{HubError, HubResult};
use super::message::{Message, MessageKind, MessageLog};
use super::roles::{definition, RoleDefinition, RoleHandler, RoleKey};
use super::session::SessionEntry;

/// Operator view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub key: RoleKey,
    pub name: String,
    pub priority: u8,
    pub active: bool,
}

struct Delivery {
    message: Message,
    reply: Option<oneshot::Sender<HubResult<Value>>>,
}

struct RoleSlot {
    definition: RoleDefinition,
    /// Replaced on every activation so a retired dispatcher keeps seeing `false`.
    active: Arc<AtomicBool>,
    queue: Option<mpsc::UnboundedSender<Delivery>>,
}

impl RoleSlot {
    fn new(definition: RoleDefinition) -> Self {
        Self {
            definition,
            active: Arc::new(AtomicBool::new(false)),
            queue: None,
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// The message router shared by every component through the context.
pub struct Hub {
    slots: RwLock<BTreeMap<RoleKey, RoleSlot>>,
    log: std::sync::Mutex<MessageLog>,
    pub(super) sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    pub(super) metrics: Arc<Metrics>,
    tracker: Option<Arc<CallContextTracker>>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig, metrics: Arc<Metrics>) -> Self {
        let slots = RoleKey::ALL
            .into_iter()
            .map(|key| (key, RoleSlot::new(definition(key))))
            .collect();
        Self {
            slots: RwLock::new(slots),
            log: std::sync::Mutex::new(MessageLog::new(config.message_log_capacity)),
            sessions: Mutex::new(HashMap::new()),
            metrics,
            tracker: None,
            config,
        }
    }

    /// Report refused circular calls to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<CallContextTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Activate `role` with `handler`. Returns `false` (and changes nothing)
    /// when the role is already active.
    ///
    /// Must be called from within a tokio runtime: activation spawns the
    /// role's dispatcher task.
    pub async fn register(&self, role: RoleKey, handler: Arc<dyn RoleHandler>) -> bool {
        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(role)
            .or_insert_with(|| RoleSlot::new(definition(role)));
        if slot.is_active() {
            debug!(role = %role, "register ignored: role already active");
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        slot.active = Arc::clone(&active);
        slot.queue = Some(tx);
        tokio::spawn(dispatch_loop(role, handler, active, rx, Arc::clone(&self.metrics)));

        info!(role = %role, "role registered");
        true
    }

    /// Deactivate `role`. Returns `false` when it was not active.
    /// Messages still queued for the role are dropped.
    pub async fn unregister(&self, role: RoleKey) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(&role) {
            Some(slot) if slot.is_active() => {
                slot.active.store(false, Ordering::SeqCst);
                slot.queue = None;
                info!(role = %role, "role unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn is_active(&self, role: RoleKey) -> bool {
        self.slots
            .read()
            .await
            .get(&role)
            .map(RoleSlot::is_active)
            .unwrap_or(false)
    }

    pub async fn active_roles(&self) -> Vec<RoleKey> {
        self.slots
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.is_active())
            .map(|(key, _)| *key)
            .collect()
    }

    pub async fn roles(&self) -> Vec<RoleStatus> {
        let slots = self.slots.read().await;
        let mut out: Vec<RoleStatus> = slots
            .values()
            .map(|slot| RoleStatus {
                key: slot.definition.key,
                name: slot.definition.name.to_string(),
                priority: slot.definition.priority,
                active: slot.is_active(),
            })
            .collect();
        out.sort_by_key(|s| (s.priority, s.key));
        out
    }

    /// Fire-and-forget delivery. The id is returned even when the recipient
    /// is inactive and the message is dropped.
    pub async fn send(&self, from: RoleKey, to: RoleKey, kind: MessageKind, payload: Value) -> Uuid {
        let message = Message::new(from, to, kind, payload);
        let id = message.id;
        self.record(&message);
        if let Err(e) = self.enqueue(Delivery {
            message,
            reply: None,
        })
        .await
        {
            self.metrics.inc_messages_dropped();
            debug!(message_id = %id, from = %from, to = %to, error = %e, "message dropped");
        }
        id
    }

    /// Fire-and-forget delivery to every active role except the sender and
    /// `exclude`. Returns how many recipients the message was queued for.
    pub async fn broadcast(
        &self,
        from: RoleKey,
        kind: MessageKind,
        payload: Value,
        exclude: &[RoleKey],
    ) -> usize {
        let recipients: Vec<RoleKey> = self
            .active_roles()
            .await
            .into_iter()
            .filter(|r| *r != from && !exclude.contains(r))
            .collect();
        for to in &recipients {
            self.send(from, *to, kind, payload.clone()).await;
        }
        debug!(from = %from, recipients = recipients.len(), "broadcast sent");
        recipients.len()
    }

    /// Paired request/response with a timeout.
    #[instrument(skip(self, payload), fields(from = %from, to = %to))]
    pub async fn request(
        &self,
        from: RoleKey,
        to: RoleKey,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> HubResult<Value> {
        self.request_message(Message::new(from, to, kind, payload), timeout)
            .await
    }

    /// Issue a request on behalf of the role currently handling `parent`,
    /// carrying the call chain forward. Calling a role already in the chain
    /// is refused as circular.
    pub async fn forward(
        &self,
        parent: &Message,
        to: RoleKey,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> HubResult<Value> {
        let mut message = Message::new(parent.to, to, kind, payload);
        let mut chain = parent.chain.clone();
        if !chain.contains(&parent.to) {
            chain.push(parent.to);
        }
        message.chain = chain;
        self.request_message(message, timeout).await
    }

    async fn request_message(&self, message: Message, timeout: Duration) -> HubResult<Value> {
        let to = message.to;
        if message.chain.contains(&to) {
            let chain = message
                .chain
                .iter()
                .chain(std::iter::once(&to))
                .map(RoleKey::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            warn!(chain = %chain, "circular call refused");
            if let Some(tracker) = &self.tracker {
                tracker.record_cycle(&chain);
            }
            return Err(HubError::CircularCall { chain });
        }

        self.record(&message);
        let from = message.from;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Delivery {
            message,
            reply: Some(tx),
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if let Ok(value) = &result {
                    self.record(&Message::new(to, from, MessageKind::Response, value.clone()));
                }
                result
            }
            Ok(Err(_)) => Err(HubError::ReplyDropped {
                role: to.to_string(),
            }),
            Err(_) => Err(HubError::Timeout {
                role: to.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn enqueue(&self, delivery: Delivery) -> HubResult<()> {
        let to = delivery.message.to;
        let slots = self.slots.read().await;
        let inactive = || HubError::RoleInactive {
            role: to.to_string(),
        };
        let slot = slots.get(&to).ok_or_else(inactive)?;
        if !slot.is_active() {
            return Err(inactive());
        }
        let queue = slot.queue.as_ref().ok_or_else(inactive)?;
        queue.send(delivery).map_err(|_| inactive())
    }

    fn record(&self, message: &Message) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.push(message.clone());
    }

    /// Most recent messages, newest first.
    pub fn recent_messages(&self, limit: usize) -> Vec<Message> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.recent(limit)
    }
}

async fn dispatch_loop(
    role: RoleKey,
    handler: Arc<dyn RoleHandler>,
    active: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    metrics: Arc<Metrics>,
) {
    while let Some(Delivery { message, reply }) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            metrics.inc_messages_dropped();
            debug!(role = %role, message_id = %message.id, "dropped: role deactivated");
            if let Some(reply) = reply {
                let _ = reply.send(Err(HubError::RoleInactive {
                    role: role.to_string(),
                }));
            }
            continue;
        }

        let result = match AssertUnwindSafe(handler.handle(&message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(HubError::Handler {
                role: role.to_string(),
                reason: "handler panicked".to_string(),
            }),
        };
        metrics.inc_messages_delivered();

        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(role = %role, message_id = %message.id, error = %e, "handler failed");
                }
            }
        }
    }
    debug!(role = %role, "dispatcher stopped");
}

#[async_trait]
impl Dispatch for Hub {
    async fn call(
        &self,
        from: RoleKey,
        to: RoleKey,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> HubResult<Value> {
        self.request(from, to, kind, payload, timeout).await
    }
}

impl Clearable for Hub {
    fn cache_name(&self) -> &'static str {
        "hub.message_log"
    }

    fn clear_cache(&self) -> usize {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.clear()
    }
}
