//! Domain events and the in-process event bus.
//!
//! Delivery is best-effort and at-most-once. A subscriber error is logged
//! and never reaches the publisher.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DispatchMode;
use crate::error::Result;
use crate::model::{JobRun, SlaEvaluation};

/// Event types published by ingestion and detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A new run was recorded
    RunStarted { run: JobRun },

    /// A run reached a terminal status
    RunCompleted { run: JobRun },

    /// A run was confirmed to have breached its SLA
    SlaBreached {
        run: JobRun,
        evaluation: SlaEvaluation,
    },
}

impl DomainEvent {
    #[must_use]
    pub fn run(&self) -> &JobRun {
        match self {
            Self::RunStarted { run } | Self::RunCompleted { run } | Self::SlaBreached { run, .. } => {
                run
            }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::SlaBreached { .. } => "sla_breached",
        }
    }
}

/// Receives every published event; ignore the ones you don't care about.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Fan-out of [`DomainEvent`]s to registered subscribers
pub struct EventBus {
    dispatch: DispatchMode,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DispatchMode::Inline)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("dispatch", &self.dispatch)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new(dispatch: DispatchMode) -> Self {
        Self {
            dispatch,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn dispatch(&self) -> DispatchMode {
        self.dispatch
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        debug!(subscriber = subscriber.name(), "Event subscriber registered");
        match self.subscribers.write() {
            Ok(mut guard) => guard.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Deliver `event` to every subscriber.
    ///
    /// Inline dispatch returns after all subscribers ran, in registration
    /// order. Spawned dispatch returns immediately.
    pub async fn publish(&self, event: DomainEvent) {
        let subscribers = self.snapshot();
        debug!(
            kind = event.kind(),
            run_id = %event.run().run_id,
            subscribers = subscribers.len(),
            "Publishing event"
        );
        match self.dispatch {
            DispatchMode::Inline => {
                for subscriber in subscribers {
                    deliver(subscriber.as_ref(), &event).await;
                }
            }
            DispatchMode::Spawned => {
                let event = Arc::new(event);
                for subscriber in subscribers {
                    let event = Arc::clone(&event);
                    tokio::spawn(async move {
                        deliver(subscriber.as_ref(), &event).await;
                    });
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
        match self.subscribers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

async fn deliver(subscriber: &dyn EventSubscriber, event: &DomainEvent) {
    if let Err(err) = subscriber.handle(event).await {
        warn!(
            subscriber = subscriber.name(),
            kind = event.kind(),
            run_id = %event.run().run_id,
            error = %err,
            "Event subscriber failed"
        );
    }
}
