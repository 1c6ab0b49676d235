//! AI re-evaluation
//!
//! Creatures with an active controller get `think()` once per period.
//! Losing the controller takes the creature out of the schedule.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{AiController, ObjectId, Subject};
use crate::task::{PoolSet, PoolSpec, PoolWorker, RecurringScheduler, Retention};
use crate::util::clock::{Clock, Millis};

pub trait Thinker: Subject {
    fn controller(&self) -> Option<Arc<dyn AiController>>;
}

struct ThinkWorker;

impl PoolWorker<dyn Thinker> for ThinkWorker {
    fn update(&self, subject: &Arc<dyn Thinker>, _now: Millis) -> Result<Retention, TaskError> {
        match subject.controller() {
            Some(ai) => {
                ai.think();
                Ok(Retention::Keep)
            }
            None => Ok(Retention::Release),
        }
    }
}

pub struct ThinkManager {
    set: PoolSet<dyn Thinker>,
}

impl ThinkManager {
    pub fn new(
        config: &PoolConfig,
        scheduler: Arc<dyn RecurringScheduler>,
        clock: Arc<dyn Clock>,
        metrics: &Metrics,
    ) -> Self {
        Self {
            set: PoolSet::new(
                PoolSpec::new("think", config.capacity, config.period()),
                Arc::new(ThinkWorker),
                scheduler,
                clock,
                metrics.register("think", ManagerKind::Pool),
            ),
        }
    }

    pub fn add(&self, subject: Arc<dyn Thinker>) -> bool {
        self.set.add(subject)
    }

    pub fn remove(&self, subject: &dyn Thinker) -> bool {
        self.set.remove_id(subject.object_id())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.set.contains(id)
    }

    pub fn pools(&self) -> &PoolSet<dyn Thinker> {
        &self.set
    }

    pub fn shutdown(&self) {
        self.set.shutdown();
    }
}
