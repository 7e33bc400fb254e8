use crate::runtime::instance::ExecutionId;
use crate::runtime::storage::VariableStore;
use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Redis-backed projection of process variables, for deployments where
/// other services read instance state out-of-process.
pub struct RedisVariableStore {
    client: redis::Client,
}

impl RedisVariableStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn var_key(&self, instance_id: Uuid) -> String {
        format!("procflow:inst:{}:vars", instance_id)
    }

    fn local_key(&self, instance_id: Uuid, execution_id: ExecutionId) -> String {
        format!("procflow:inst:{}:exec:{}:vars", instance_id, execution_id)
    }
}

#[async_trait]
impl VariableStore for RedisVariableStore {
    async fn set_global(&self, instance_id: Uuid, key: &str, value: Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&value)?;
        let _: () = conn.hset(self.var_key(instance_id), key, serialized).await?;
        Ok(())
    }

    async fn get_global(&self, instance_id: Uuid, key: &str) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let val_str: Option<String> = conn.hget(self.var_key(instance_id), key).await?;

        if let Some(s) = val_str {
            let val: Value = serde_json::from_str(&s)?;
            Ok(Some(val))
        } else {
            Ok(None)
        }
    }

    async fn all_globals(&self, instance_id: Uuid) -> Result<HashMap<String, Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.var_key(instance_id)).await?;
        let mut map = HashMap::new();
        for (k, v) in raw {
            map.insert(k, serde_json::from_str(&v)?);
        }
        Ok(map)
    }

    async fn set_local(
        &self,
        instance_id: Uuid,
        execution_id: ExecutionId,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&value)?;
        let _: () = conn.hset(self.local_key(instance_id, execution_id), key, serialized).await?;
        Ok(())
    }

    async fn clear_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.var_key(instance_id)).await?;
        Ok(())
    }
}
