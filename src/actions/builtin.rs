use crate::actions::{TaskContext, TaskHandler};
use crate::runtime::expr;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

#[derive(Debug)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, _ctx: &mut TaskContext<'_>) -> Result<Value> {
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!("[LOG] {}", msg);
        } else {
            info!("[LOG] {:?}", params);
        }
        Ok(Value::Null)
    }
}

#[derive(Debug)]
pub struct AssignHandler;

#[async_trait]
impl TaskHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &mut TaskContext<'_>) -> Result<Value> {
        // 1. Handle "assignments" list
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    ctx.set_var(k, v.clone());
                }
            }
        }

        // 2. Handle "expression": "var = expr" assigns, a bare expr returns
        if let Some(raw) = params.get("expression").and_then(|v| v.as_str()) {
            let (target_var, rhs) = match raw.split_once('=') {
                Some((left, right)) => (Some(left.trim()), right.trim()),
                None => (None, raw),
            };
            if let Some(result) = expr::eval_value(rhs, &ctx.all_vars()) {
                match target_var {
                    Some(name) => ctx.set_var(name, result),
                    None => {
                        if params.get("value").is_none() {
                            return Ok(result);
                        }
                    }
                }
            }
        }

        // 3. Handle "value"
        if let Some(val) = params.get("value") {
            Ok(val.clone())
        } else {
            Ok(Value::Null)
        }
    }
}
