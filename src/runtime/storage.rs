use crate::dsl::EventKind;
use crate::runtime::instance::ExecutionId;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Signal/message registration owned by a scope execution; torn down with
/// that scope, never independently.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSubscription {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Owning execution (scope for event sub-processes, host execution for
    /// boundary events).
    pub execution_id: ExecutionId,
    /// The event-defining activity.
    pub activity_id: String,
    pub kind: EventKind,
    pub event_name: String,
    pub interrupting: bool,
}

/// Scheduled timer, owned the same way as an [`EventSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimerJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution_id: ExecutionId,
    pub activity_id: String,
    pub due_ms: u64,
}

// --- Interfaces ---

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, subscription: EventSubscription) -> Result<()>;
    async fn cancel(&self, instance_id: Uuid, id: Uuid) -> Result<()>;
    async fn list(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>>;
    async fn clear_instance(&self, instance_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn schedule(&self, job: TimerJob) -> Result<()>;
    async fn cancel(&self, instance_id: Uuid, id: Uuid) -> Result<()>;
    async fn list(&self, instance_id: Uuid) -> Result<Vec<TimerJob>>;
    async fn clear_instance(&self, instance_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn set_global(&self, instance_id: Uuid, key: &str, value: Value) -> Result<()>;
    async fn get_global(&self, instance_id: Uuid, key: &str) -> Result<Option<Value>>;
    /// Used for iterating all variables (e.g. for expression evaluation).
    /// Note: this might be expensive in remote implementations.
    async fn all_globals(&self, instance_id: Uuid) -> Result<HashMap<String, Value>>;
    async fn set_local(&self, instance_id: Uuid, execution_id: ExecutionId, key: &str, value: Value) -> Result<()>;
    async fn clear_instance(&self, instance_id: Uuid) -> Result<()>;
}

// --- In-Memory Implementations ---

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: DashMap<Uuid, Vec<EventSubscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn create(&self, subscription: EventSubscription) -> Result<()> {
        self.subscriptions.entry(subscription.instance_id).or_default().push(subscription);
        Ok(())
    }

    async fn cancel(&self, instance_id: Uuid, id: Uuid) -> Result<()> {
        if let Some(mut list) = self.subscriptions.get_mut(&instance_id) {
            list.retain(|s| s.id != id);
        }
        Ok(())
    }

    async fn list(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>> {
        Ok(self.subscriptions.get(&instance_id).map(|l| l.clone()).unwrap_or_default())
    }

    async fn clear_instance(&self, instance_id: Uuid) -> Result<()> {
        self.subscriptions.remove(&instance_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, Vec<TimerJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn schedule(&self, job: TimerJob) -> Result<()> {
        self.jobs.entry(job.instance_id).or_default().push(job);
        Ok(())
    }

    async fn cancel(&self, instance_id: Uuid, id: Uuid) -> Result<()> {
        if let Some(mut list) = self.jobs.get_mut(&instance_id) {
            list.retain(|j| j.id != id);
        }
        Ok(())
    }

    async fn list(&self, instance_id: Uuid) -> Result<Vec<TimerJob>> {
        Ok(self.jobs.get(&instance_id).map(|l| l.clone()).unwrap_or_default())
    }

    async fn clear_instance(&self, instance_id: Uuid) -> Result<()> {
        self.jobs.remove(&instance_id);
        Ok(())
    }
}

pub struct InMemoryVariableStore {
    // Map<InstanceID, Map<VarKey, Value>>
    globals: DashMap<Uuid, DashMap<String, Value>>,
    locals: DashMap<(Uuid, ExecutionId), DashMap<String, Value>>,
}

impl InMemoryVariableStore {
    pub fn new() -> Self {
        Self { globals: DashMap::new(), locals: DashMap::new() }
    }
}

impl Default for InMemoryVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn set_global(&self, instance_id: Uuid, key: &str, value: Value) -> Result<()> {
        self.globals.entry(instance_id).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_global(&self, instance_id: Uuid, key: &str) -> Result<Option<Value>> {
        if let Some(vars) = self.globals.get(&instance_id) {
            Ok(vars.get(key).map(|v| v.value().clone()))
        } else {
            Ok(None)
        }
    }

    async fn all_globals(&self, instance_id: Uuid) -> Result<HashMap<String, Value>> {
        if let Some(vars) = self.globals.get(&instance_id) {
            let mut map = HashMap::new();
            for item in vars.iter() {
                map.insert(item.key().clone(), item.value().clone());
            }
            Ok(map)
        } else {
            Ok(HashMap::new())
        }
    }

    async fn set_local(&self, instance_id: Uuid, execution_id: ExecutionId, key: &str, value: Value) -> Result<()> {
        self.locals.entry((instance_id, execution_id)).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn clear_instance(&self, instance_id: Uuid) -> Result<()> {
        self.globals.remove(&instance_id);
        self.locals.retain(|(inst, _), _| *inst != instance_id);
        Ok(())
    }
}
