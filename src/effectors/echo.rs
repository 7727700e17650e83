use async_trait::async_trait;
use serde_json::{json, Value};

use crate::proto::{CapabilityType, PlanStep, StepResult, StepType};

use super::{Effector, EffectorContext, EffectorError};

/// Zero-risk effector for wiring tests: echoes the message back.
pub struct EchoEffector;

#[async_trait]
impl Effector for EchoEffector {
    fn capability_type(&self) -> CapabilityType {
        CapabilityType::Echo
    }

    fn default_config(&self) -> Value {
        json!({})
    }

    fn validate_request(&self, operation: &str, params: &Value) -> Result<Value, Vec<String>> {
        if operation != "say" {
            return Err(vec![format!("unknown echo operation: {operation}")]);
        }
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(json!({ "message": message }))
    }

    fn dry_run(
        &self,
        _ctx: &EffectorContext,
        operation: &str,
        params: &Value,
    ) -> Result<Vec<PlanStep>, EffectorError> {
        if operation != "say" {
            return Err(EffectorError::UnsupportedOperation(operation.to_string()));
        }
        let message = params.get("message").and_then(|v| v.as_str()).unwrap_or("");
        Ok(vec![PlanStep::new(
            StepType::Echo,
            format!("Echo {:?}", message),
            json!({ "message": message }),
        )])
    }

    async fn execute(&self, _ctx: &EffectorContext, steps: &[PlanStep]) -> Vec<StepResult> {
        steps
            .iter()
            .map(|step| {
                let message = step
                    .inputs
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                StepResult::success(step.step_id, message)
            })
            .collect()
    }
}
