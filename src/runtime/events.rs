use crate::runtime::instance::ExecutionId;
use crate::runtime::storage::{EventSubscription, TimerJob};
use serde_json::Value;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Lifecycle events published to listeners after an operation commits.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ProcessStarted { instance: Uuid, definition: String },
    ProcessCompleted { instance: Uuid },
    ActivityStarted { instance: Uuid, execution: ExecutionId, activity: String },
    ActivityCompleted { instance: Uuid, execution: ExecutionId, activity: String },
    ActivityCancelled { instance: Uuid, execution: ExecutionId, activity: String },
    VariableCreated { instance: Uuid, scope: ExecutionId, name: String },
    TimerScheduled { instance: Uuid, execution: ExecutionId, activity: String },
    JobCanceled { instance: Uuid, job: Uuid, activity: String },
}

impl LifecycleEvent {
    pub fn activity(&self) -> Option<&str> {
        match self {
            LifecycleEvent::ActivityStarted { activity, .. }
            | LifecycleEvent::ActivityCompleted { activity, .. }
            | LifecycleEvent::ActivityCancelled { activity, .. }
            | LifecycleEvent::TimerScheduled { activity, .. }
            | LifecycleEvent::JobCanceled { activity, .. } => Some(activity),
            _ => None,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &LifecycleEvent);
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::ProcessStarted { instance, definition } => {
                info!(instance = %instance, definition = %definition, "process started");
            }
            LifecycleEvent::ProcessCompleted { instance } => {
                info!(instance = %instance, "process completed");
            }
            LifecycleEvent::ActivityStarted { instance, activity, .. } => {
                info!(instance = %instance, activity = %activity, "activity started");
            }
            LifecycleEvent::ActivityCompleted { instance, activity, .. } => {
                info!(instance = %instance, activity = %activity, "activity completed");
            }
            LifecycleEvent::ActivityCancelled { instance, activity, .. } => {
                info!(instance = %instance, activity = %activity, "activity cancelled");
            }
            LifecycleEvent::VariableCreated { instance, name, .. } => {
                info!(instance = %instance, name = %name, "variable created");
            }
            LifecycleEvent::TimerScheduled { instance, activity, .. } => {
                info!(instance = %instance, activity = %activity, "timer scheduled");
            }
            LifecycleEvent::JobCanceled { instance, job, .. } => {
                info!(instance = %instance, job = %job, "job canceled");
            }
        }
    }
}

/// Records every published event; lets tests assert exact ordering.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything recorded so far.
    pub fn take(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Deferred store write, applied only when the operation commits.
#[derive(Debug, Clone)]
pub enum StoreOp {
    SetGlobal { instance: Uuid, name: String, value: Value },
    SetLocal { instance: Uuid, execution: ExecutionId, name: String, value: Value },
    CreateSubscription(EventSubscription),
    CancelSubscription { instance: Uuid, id: Uuid },
    ScheduleJob(TimerJob),
    CancelJob { instance: Uuid, id: Uuid },
    ClearInstance { instance: Uuid },
}

/// Ordered in-memory log of lifecycle events and store writes produced
/// while an operation runs. Flushed only after the whole operation
/// commits; a failure discards it wholesale, so no partially-observed side
/// effects escape.
#[derive(Default)]
pub struct TxnLog {
    pub events: Vec<LifecycleEvent>,
    pub store_ops: Vec<StoreOp>,
}

impl TxnLog {
    pub fn emit(&mut self, event: LifecycleEvent) {
        self.events.push(event);
    }

    pub fn op(&mut self, op: StoreOp) {
        self.store_ops.push(op);
    }
}
