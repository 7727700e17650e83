use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::proto::{CapabilityType, PlanStep, StepResult, StepType};
use crate::risk::flags;

use super::{is_path_allowed, resolve_absolute, Effector, EffectorContext, EffectorError};

const EXEC_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Captured stream cap; anything past this stays in the pipe and the
/// wall-clock timeout is what reaps a runaway producer.
const STREAM_CAP: u64 = 1_048_576;
const OUTPUT_LIMIT: usize = 1000;

/// Commands that stay runnable while safe mode is on, matched by basename.
const SAFE_MODE_BASELINE: &[&str] = &["ls", "cat", "head", "tail", "echo", "pwd", "whoami", "date"];

pub struct ShellEffector;

#[async_trait]
impl Effector for ShellEffector {
    fn capability_type(&self) -> CapabilityType {
        CapabilityType::Shell
    }

    fn default_config(&self) -> Value {
        json!({ "timeoutMs": 30_000 })
    }

    fn validate_request(&self, operation: &str, params: &Value) -> Result<Value, Vec<String>> {
        if operation != "run" {
            return Err(vec![format!("unknown shell operation: {operation}")]);
        }

        let mut errors = Vec::new();
        let command = match params.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => c.trim().to_string(),
            _ => {
                errors.push("command is required".to_string());
                String::new()
            }
        };

        let args: Vec<String> = match params.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut collected = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => collected.push(s.to_string()),
                        None => errors.push("args must be an array of strings".to_string()),
                    }
                }
                collected
            }
            Some(_) => {
                errors.push("args must be an array of strings".to_string());
                Vec::new()
            }
        };

        let cwd = params
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "/".to_string())
            });

        if errors.is_empty() {
            Ok(json!({ "command": command, "args": args, "cwd": cwd }))
        } else {
            Err(errors)
        }
    }

    fn dry_run(
        &self,
        ctx: &EffectorContext,
        operation: &str,
        params: &Value,
    ) -> Result<Vec<PlanStep>, EffectorError> {
        if operation != "run" {
            return Err(EffectorError::UnsupportedOperation(operation.to_string()));
        }

        let command = param_str(params, "command");
        let args = param_args(params);
        let cwd = resolve_absolute(param_str(params, "cwd"));
        let full_cmd = full_command(command, &args);

        if !is_path_allowed(&cwd, &ctx.allowed_roots) {
            let step = PlanStep::new(
                StepType::ShellRun,
                format!(
                    "Access denied: working directory {} is outside the allowed roots",
                    cwd.display()
                ),
                json!({ "command": command, "args": args, "cwd": cwd.display().to_string() }),
            )
            .with_flag(flags::PATH_DENIED);
            return Ok(vec![step]);
        }

        let mut step = PlanStep::new(
            StepType::ShellRun,
            format!("Run `{}` in {}", full_cmd, cwd.display()),
            json!({ "command": command, "args": args, "cwd": cwd.display().to_string() }),
        );

        if !allowlist_matches(&full_cmd, &ctx.shell_allow_list) {
            step.risk_flags.push(flags::COMMAND_NOT_ALLOWED.to_string());
            step.risk_flags.push(flags::WOULD_BE_BLOCKED.to_string());
        }

        if ctx.safe_mode && !in_safe_mode_baseline(command) {
            step.risk_flags.push(flags::BLOCKED_BY_SAFE_MODE.to_string());
        }

        Ok(vec![step])
    }

    async fn execute(&self, ctx: &EffectorContext, steps: &[PlanStep]) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            results.push(self.execute_step(ctx, step).await);
        }
        results
    }
}

impl ShellEffector {
    async fn execute_step(&self, ctx: &EffectorContext, step: &PlanStep) -> StepResult {
        if step.risk_flags.iter().any(|f| f == flags::PATH_DENIED) {
            return StepResult::blocked(step.step_id, "working directory outside allowed roots");
        }

        let command = step
            .inputs
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let args: Vec<String> = step
            .inputs
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let cwd = resolve_absolute(
            step.inputs
                .get("cwd")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
        );
        let full_cmd = full_command(command, &args);

        // Policy is re-checked at execute time; the plan may predate a
        // settings change.
        if !is_path_allowed(&cwd, &ctx.allowed_roots) {
            return StepResult::blocked(step.step_id, "working directory outside allowed roots");
        }
        if !allowlist_matches(&full_cmd, &ctx.shell_allow_list) {
            return StepResult::blocked(
                step.step_id,
                format!("command not in allowlist: {full_cmd}"),
            );
        }
        if ctx.safe_mode && !in_safe_mode_baseline(command) {
            return StepResult::blocked(step.step_id, "blocked by safe mode");
        }

        let mut child = match Command::new(command)
            .args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return StepResult::failed(step.step_id, format!("spawn failed: {err}"));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = timeout(EXEC_TIMEOUT, async {
            let (out_buf, err_buf) = tokio::join!(
                read_capped(stdout, STREAM_CAP),
                read_capped(stderr, STREAM_CAP)
            );
            let status = child.wait().await;
            (status, out_buf, err_buf)
        })
        .await;

        match outcome {
            Ok((Ok(status), out_buf, err_buf)) => {
                let stdout_text = truncate(&String::from_utf8_lossy(&out_buf), OUTPUT_LIMIT);
                let stderr_text = truncate(&String::from_utf8_lossy(&err_buf), OUTPUT_LIMIT);
                let mut result = if status.success() {
                    StepResult::success(step.step_id, stdout_text.clone())
                } else {
                    StepResult::failed(
                        step.step_id,
                        format!("command exited with {status}"),
                    )
                };
                result.stdout = Some(stdout_text);
                result.stderr = Some(stderr_text);
                result
            }
            Ok((Err(err), _, _)) => {
                StepResult::failed(step.step_id, format!("wait failed: {err}"))
            }
            Err(_) => {
                let _ = child.kill().await;
                StepResult::failed(
                    step.step_id,
                    format!("command timed out after {} ms", EXEC_TIMEOUT.as_millis()),
                )
            }
        }
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>, cap: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        let _ = reader.take(cap).read_to_end(&mut buf).await;
    }
    buf
}

fn full_command(command: &str, args: &[String]) -> String {
    format!("{} {}", command, args.join(" ")).trim().to_string()
}

fn allowlist_matches(full_cmd: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match Regex::new(pattern) {
        Ok(re) => re.is_match(full_cmd),
        Err(err) => {
            warn!(%pattern, %err, "invalid shell allowlist pattern, skipping");
            false
        }
    })
}

fn in_safe_mode_baseline(command: &str) -> bool {
    let basename = command.rsplit('/').next().unwrap_or(command);
    SAFE_MODE_BASELINE.contains(&basename)
}

fn param_str<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn param_args(params: &Value) -> Vec<String> {
    params
        .get("args")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}
