use async_trait::async_trait;
use serde_json::{json, Value};

use crate::proto::{CapabilityType, PlanStep, StepResult, StepType};

use super::{Effector, EffectorContext, EffectorError};

/// Advisory only: records the intent to reach a set of domains. No firewall
/// state is touched.
pub struct NetworkEffector;

#[async_trait]
impl Effector for NetworkEffector {
    fn capability_type(&self) -> CapabilityType {
        CapabilityType::Network
    }

    fn default_config(&self) -> Value {
        json!({ "advisory": true })
    }

    fn validate_request(&self, operation: &str, params: &Value) -> Result<Value, Vec<String>> {
        if operation != "allow" {
            return Err(vec![format!("unknown network operation: {operation}")]);
        }

        let mut errors = Vec::new();
        let domains: Vec<String> = match params.get("domains") {
            Some(Value::Array(items)) if !items.is_empty() => {
                let mut collected = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(d) if !d.trim().is_empty() => collected.push(d.trim().to_string()),
                        _ => errors.push("domains must be non-empty strings".to_string()),
                    }
                }
                collected
            }
            _ => {
                errors.push("domains is required and must be a non-empty array".to_string());
                Vec::new()
            }
        };

        let purpose = params
            .get("purpose")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if errors.is_empty() {
            Ok(json!({ "domains": domains, "purpose": purpose }))
        } else {
            Err(errors)
        }
    }

    fn dry_run(
        &self,
        _ctx: &EffectorContext,
        operation: &str,
        params: &Value,
    ) -> Result<Vec<PlanStep>, EffectorError> {
        if operation != "allow" {
            return Err(EffectorError::UnsupportedOperation(operation.to_string()));
        }

        let domains: Vec<String> = params
            .get("domains")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|d| d.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let step = PlanStep::new(
            StepType::NetAllow,
            format!(
                "Allow outbound access to {} domain(s): {}",
                domains.len(),
                domains.join(", ")
            ),
            json!({
                "domains": domains,
                "purpose": params.get("purpose").cloned().unwrap_or(Value::Null),
            }),
        );
        Ok(vec![step])
    }

    async fn execute(&self, _ctx: &EffectorContext, steps: &[PlanStep]) -> Vec<StepResult> {
        steps
            .iter()
            .map(|step| {
                let domains: Vec<&str> = step
                    .inputs
                    .get("domains")
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().filter_map(|d| d.as_str()).collect())
                    .unwrap_or_default();
                StepResult::success(
                    step.step_id,
                    format!("recorded allow-intent for: {}", domains.join(", ")),
                )
            })
            .collect()
    }
}
