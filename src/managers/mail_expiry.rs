//! Mail expiry
//!
//! Unclaimed messages expire at a fixed time. Attachments go back to the
//! sender (or the fallback owner for system mail), the recipient is told and
//! the stored message is purged. A message whose attachments could not be
//! returned is left in storage.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::MailConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

pub type CharacterId = ObjectId;

// ============================================================================
// Mail Collaborators
// ============================================================================

/// Items attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    pub items: Vec<(u32, u64)>,
    pub currency: u64,
}

impl Attachments {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.currency == 0
    }
}

pub trait ExpiringMail: Subject {
    fn expires_at(&self) -> Millis;

    fn sender(&self) -> Option<CharacterId>;

    fn recipient(&self) -> CharacterId;

    fn attachments(&self) -> Option<Attachments>;
}

/// Mail persistence and delivery side
pub trait MailStore: Send + Sync {
    /// Move attachments into `owner`'s storage
    fn return_attachments(&self, owner: CharacterId, attachments: Attachments) -> Result<(), TaskError>;

    fn notify_expired(&self, recipient: CharacterId, message: ObjectId);

    fn purge(&self, message: ObjectId) -> Result<(), TaskError>;
}

// ============================================================================
// Mail Expiry Manager
// ============================================================================

pub struct MailExpiryManager {
    queue: DeferredQueue<Arc<dyn ExpiringMail>>,
    store: Arc<dyn MailStore>,
    clock: Arc<dyn Clock>,
    config: MailConfig,
}

impl MailExpiryManager {
    pub fn new(
        config: &MailConfig,
        store: Arc<dyn MailStore>,
        clock: Arc<dyn Clock>,
        metrics: &Metrics,
    ) -> Self {
        Self {
            queue: DeferredQueue::new("mail_expiry", metrics.register("mail_expiry", ManagerKind::Queue)),
            store,
            clock,
            config: *config,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(
            scheduler,
            self,
            "mail_expiry",
            self.config.period_ms,
            self.queue.stats(),
            |m| {
                m.run_tick();
            },
        )
        .into_iter()
        .collect()
    }

    pub fn add(&self, message: Arc<dyn ExpiringMail>) -> bool {
        self.queue.insert(message.object_id(), message)
    }

    /// Claimed or deleted by the recipient
    pub fn remove(&self, id: ObjectId) -> bool {
        self.queue.remove(id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.queue.contains(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn expire(&self, message: &dyn ExpiringMail) -> Result<(), TaskError> {
        let id = message.object_id();
        if let Some(attachments) = message.attachments().filter(|a| !a.is_empty()) {
            let owner = message.sender().unwrap_or(self.config.fallback_owner);
            self.store
                .return_attachments(owner, attachments)
                .map_err(|e| {
                    warn!("Mail {} kept in storage, attachments not returned", id);
                    e
                })?;
        }

        self.store.notify_expired(message.recipient(), id);
        self.store.purge(id)?;
        info!("Mail {} expired", id);
        Ok(())
    }

    pub fn run_tick(&self) -> Option<SweepReport> {
        let now = self.clock.now_millis();
        self.queue.sweep(|_, message| {
            if now < message.expires_at() {
                return Ok(Verdict::Keep);
            }
            // A failed return propagates and the record stays unpurged
            self.expire(message.as_ref())?;
            self.queue.stats().actions.fetch_add(1, Ordering::Relaxed);
            Ok(Verdict::Drop)
        })
    }
}
