use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::Value;
use std::collections::HashMap;
use tracing::error;

/// Builds an evalexpr context from JSON variables. Only scalar types are
/// mapped; structured values are not visible to expressions.
fn build_context(vars: &HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in vars {
        let ev = match v {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(ev) = ev {
            let _ = ctx.set_value(k.clone(), ev);
        }
    }
    ctx
}

/// Evaluates a boolean condition against the given variables. Evaluation
/// failures are logged and treated as `false`, matching how sequence-flow
/// guards behave on missing data.
pub fn eval_bool(condition: &str, vars: &HashMap<String, Value>) -> bool {
    let ctx = build_context(vars);
    match eval_with_context(condition, &ctx) {
        Ok(evalexpr::Value::Boolean(b)) => b,
        Ok(other) => {
            error!(condition, result = ?other, "condition did not evaluate to a boolean");
            false
        }
        Err(e) => {
            error!(condition, error = %e, "condition evaluation failed");
            false
        }
    }
}

/// Evaluates an expression to a JSON value, or `None` on failure.
pub fn eval_value(expression: &str, vars: &HashMap<String, Value>) -> Option<Value> {
    let ctx = build_context(vars);
    match eval_with_context(expression, &ctx) {
        Ok(evalexpr::Value::String(s)) => Some(Value::String(s)),
        Ok(evalexpr::Value::Int(i)) => Some(Value::from(i)),
        Ok(evalexpr::Value::Float(f)) => Some(Value::from(f)),
        Ok(evalexpr::Value::Boolean(b)) => Some(Value::Bool(b)),
        Ok(_) => None,
        Err(e) => {
            error!(expression, error = %e, "expression evaluation failed");
            None
        }
    }
}
