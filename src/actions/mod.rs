use crate::runtime::events::{LifecycleEvent, StoreOp, TxnLog};
use crate::runtime::instance::ExecutionId;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

pub mod builtin;
pub mod http;

/// Plugin interface: automatic (service) tasks are executed by a
/// registered handler.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, params: Value, ctx: &mut TaskContext<'_>) -> Result<Value>;
}

/// Variable access handed to task handlers. Writes go through the
/// enclosing transaction log, so they roll back together with the
/// operation that ran the handler.
pub struct TaskContext<'a> {
    instance_id: Uuid,
    root: ExecutionId,
    vars: &'a mut HashMap<String, Value>,
    txn: &'a mut TxnLog,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        instance_id: Uuid,
        root: ExecutionId,
        vars: &'a mut HashMap<String, Value>,
        txn: &'a mut TxnLog,
    ) -> Self {
        Self { instance_id, root, vars, txn }
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.vars.get(key).cloned()
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        let created = !self.vars.contains_key(key);
        self.vars.insert(key.to_string(), value.clone());
        self.txn.op(StoreOp::SetGlobal { instance: self.instance_id, name: key.to_string(), value });
        if created {
            self.txn.emit(LifecycleEvent::VariableCreated {
                instance: self.instance_id,
                scope: self.root,
                name: key.to_string(),
            });
        }
    }

    pub fn all_vars(&self) -> HashMap<String, Value> {
        self.vars.clone()
    }
}

/// Substitutes `${name}` parameter values with the referenced variables
/// before a handler runs. Unknown references resolve to null.
pub fn resolve_params(params: &HashMap<String, Value>, vars: &HashMap<String, Value>) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in params {
        let resolved = match value {
            Value::String(s) if s.starts_with("${") && s.ends_with('}') => {
                let name = &s[2..s.len() - 1];
                vars.get(name).cloned().unwrap_or(Value::Null)
            }
            other => other.clone(),
        };
        out.insert(key.clone(), resolved);
    }
    Value::Object(out)
}
