use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::proto::{CapabilityType, PlanStep, StepResult, StepType};
use crate::risk::flags;

use super::{is_path_allowed, resolve_absolute, Effector, EffectorContext, EffectorError};

/// Result output is truncated to this many characters; full content never
/// lands in receipts.
const OUTPUT_LIMIT: usize = 1000;
const PREVIEW_LIMIT: usize = 200;

pub struct FilesystemEffector;

#[async_trait]
impl Effector for FilesystemEffector {
    fn capability_type(&self) -> CapabilityType {
        CapabilityType::Filesystem
    }

    fn default_config(&self) -> Value {
        json!({ "maxReadBytes": 1_048_576 })
    }

    fn validate_request(&self, operation: &str, params: &Value) -> Result<Value, Vec<String>> {
        let mut errors = Vec::new();
        match operation {
            "read" | "delete" | "list" => {
                let path = require_str(params, "path", &mut errors);
                if errors.is_empty() {
                    return Ok(json!({ "path": path }));
                }
            }
            "write" => {
                let path = require_str(params, "path", &mut errors);
                let content = require_str(params, "content", &mut errors);
                if errors.is_empty() {
                    return Ok(json!({ "path": path, "content": content }));
                }
            }
            "move" => {
                let from = require_str(params, "from", &mut errors);
                let to = require_str(params, "to", &mut errors);
                if errors.is_empty() {
                    return Ok(json!({ "from": from, "to": to }));
                }
            }
            other => errors.push(format!("unknown filesystem operation: {other}")),
        }
        Err(errors)
    }

    fn dry_run(
        &self,
        ctx: &EffectorContext,
        operation: &str,
        params: &Value,
    ) -> Result<Vec<PlanStep>, EffectorError> {
        let steps = match operation {
            "read" => {
                let path = resolve_absolute(param_str(params, "path"));
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return Ok(vec![denied_step(StepType::FsRead, &path.display().to_string())]);
                }
                vec![PlanStep::new(
                    StepType::FsRead,
                    format!("Read file {}", path.display()),
                    json!({ "path": path.display().to_string() }),
                )]
            }
            "write" => {
                let path = resolve_absolute(param_str(params, "path"));
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return Ok(vec![denied_step(StepType::FsWrite, &path.display().to_string())]);
                }
                let content = param_str(params, "content");
                // The one dry-run I/O: read existing content for the diff.
                let existing = fs::read_to_string(&path).unwrap_or_default();
                let mut step = PlanStep::new(
                    StepType::FsWrite,
                    format!("Write {} bytes to {}", content.len(), path.display()),
                    json!({ "path": path.display().to_string(), "content": content }),
                );
                step.diff = Some(unified_diff(&existing, content, &path.display().to_string()));
                step.preview = Some(truncate(content, PREVIEW_LIMIT));
                vec![step]
            }
            "delete" => {
                let path = resolve_absolute(param_str(params, "path"));
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return Ok(vec![denied_step(StepType::FsDelete, &path.display().to_string())]);
                }
                let mut inputs = json!({ "path": path.display().to_string() });
                let description = if path.is_dir() {
                    let count = count_files(&path);
                    inputs["fileCount"] = json!(count);
                    format!("Delete directory {} ({} files)", path.display(), count)
                } else {
                    format!("Delete file {}", path.display())
                };
                vec![PlanStep::new(StepType::FsDelete, description, inputs)]
            }
            "list" => {
                let path = resolve_absolute(param_str(params, "path"));
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return Ok(vec![denied_step(StepType::FsList, &path.display().to_string())]);
                }
                vec![PlanStep::new(
                    StepType::FsList,
                    format!("List directory {}", path.display()),
                    json!({ "path": path.display().to_string() }),
                )]
            }
            "move" => {
                let from = resolve_absolute(param_str(params, "from"));
                let to = resolve_absolute(param_str(params, "to"));
                for path in [&from, &to] {
                    if !is_path_allowed(path, &ctx.allowed_roots) {
                        return Ok(vec![denied_step(StepType::FsMove, &path.display().to_string())]);
                    }
                }
                vec![PlanStep::new(
                    StepType::FsMove,
                    format!("Move {} to {}", from.display(), to.display()),
                    json!({
                        "from": from.display().to_string(),
                        "to": to.display().to_string(),
                    }),
                )]
            }
            other => return Err(EffectorError::UnsupportedOperation(other.to_string())),
        };

        Ok(steps
            .into_iter()
            .map(|step| mark_safe_mode(step, ctx.safe_mode))
            .collect())
    }

    async fn execute(&self, ctx: &EffectorContext, steps: &[PlanStep]) -> Vec<StepResult> {
        steps
            .iter()
            .map(|step| self.execute_step(ctx, step))
            .collect()
    }
}

impl FilesystemEffector {
    fn execute_step(&self, ctx: &EffectorContext, step: &PlanStep) -> StepResult {
        if step.risk_flags.iter().any(|f| f == flags::PATH_DENIED) {
            return StepResult::blocked(step.step_id, "path outside allowed roots");
        }

        let destructive = matches!(
            step.step_type,
            StepType::FsWrite | StepType::FsDelete | StepType::FsMove
        );
        if ctx.safe_mode && destructive {
            return StepResult::blocked(step.step_id, "blocked by safe mode");
        }

        match step.step_type {
            StepType::FsRead => {
                let path = step_path(step, "path");
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return StepResult::blocked(step.step_id, "path outside allowed roots");
                }
                match fs::read_to_string(&path) {
                    Ok(content) => StepResult::success(step.step_id, truncate(&content, OUTPUT_LIMIT)),
                    Err(err) => StepResult::failed(step.step_id, format!("read failed: {err}")),
                }
            }
            StepType::FsWrite => {
                let path = step_path(step, "path");
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return StepResult::blocked(step.step_id, "path outside allowed roots");
                }
                let content = step
                    .inputs
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if let Some(parent) = path.parent() {
                    if let Err(err) = fs::create_dir_all(parent) {
                        return StepResult::failed(step.step_id, format!("mkdir failed: {err}"));
                    }
                }
                match fs::write(&path, content) {
                    Ok(()) => StepResult::success(
                        step.step_id,
                        format!("wrote {} bytes to {}", content.len(), path.display()),
                    ),
                    Err(err) => StepResult::failed(step.step_id, format!("write failed: {err}")),
                }
            }
            StepType::FsDelete => {
                let path = step_path(step, "path");
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return StepResult::blocked(step.step_id, "path outside allowed roots");
                }
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => StepResult::success(step.step_id, format!("deleted {}", path.display())),
                    Err(err) => StepResult::failed(step.step_id, format!("delete failed: {err}")),
                }
            }
            StepType::FsList => {
                let path = step_path(step, "path");
                if !is_path_allowed(&path, &ctx.allowed_roots) {
                    return StepResult::blocked(step.step_id, "path outside allowed roots");
                }
                match fs::read_dir(&path) {
                    Ok(entries) => {
                        let mut names: Vec<String> = entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .collect();
                        names.sort();
                        StepResult::success(step.step_id, truncate(&names.join("\n"), OUTPUT_LIMIT))
                    }
                    Err(err) => StepResult::failed(step.step_id, format!("list failed: {err}")),
                }
            }
            StepType::FsMove => {
                let from = step_path(step, "from");
                let to = step_path(step, "to");
                if !is_path_allowed(&from, &ctx.allowed_roots)
                    || !is_path_allowed(&to, &ctx.allowed_roots)
                {
                    return StepResult::blocked(step.step_id, "path outside allowed roots");
                }
                match fs::rename(&from, &to) {
                    Ok(()) => StepResult::success(
                        step.step_id,
                        format!("moved {} to {}", from.display(), to.display()),
                    ),
                    Err(err) => StepResult::failed(step.step_id, format!("move failed: {err}")),
                }
            }
            _ => StepResult::failed(step.step_id, "unsupported step type for filesystem effector"),
        }
    }
}

fn mark_safe_mode(mut step: PlanStep, safe_mode: bool) -> PlanStep {
    let destructive = matches!(
        step.step_type,
        StepType::FsWrite | StepType::FsDelete | StepType::FsMove
    );
    if safe_mode && destructive {
        step.risk_flags.push(flags::BLOCKED_BY_SAFE_MODE.to_string());
    }
    step
}

fn denied_step(step_type: StepType, path: &str) -> PlanStep {
    PlanStep::new(
        step_type,
        format!("Access denied: {path} is outside the allowed roots"),
        json!({ "path": path }),
    )
    .with_flag(flags::PATH_DENIED)
}

fn require_str<'a>(params: &'a Value, key: &str, errors: &mut Vec<String>) -> &'a str {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            errors.push(format!("{key} is required"));
            ""
        }
    }
}

fn param_str<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn step_path(step: &PlanStep, key: &str) -> std::path::PathBuf {
    resolve_absolute(step.inputs.get(key).and_then(|v| v.as_str()).unwrap_or(""))
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}

fn count_files(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            count += count_files(&path);
        } else {
            count += 1;
        }
    }
    count
}

/// Minimal unified diff: common prefix/suffix lines are trimmed and the
/// changed span is emitted as a single hunk.
fn unified_diff(old: &str, new: &str, path: &str) -> String {
    if old == new {
        return format!("--- a/{path}\n+++ b/{path}\n");
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];

    let old_start = if old_mid.is_empty() { prefix } else { prefix + 1 };
    let new_start = if new_mid.is_empty() { prefix } else { prefix + 1 };

    let header = if old.is_empty() {
        format!("--- /dev/null\n+++ b/{path}\n")
    } else {
        format!("--- a/{path}\n+++ b/{path}\n")
    };

    let mut out = header;
    out.push_str(&format!(
        "@@ -{},{} +{},{} @@\n",
        old_start,
        old_mid.len(),
        new_start,
        new_mid.len()
    ));
    for line in old_mid {
        out.push_str(&format!("-{line}\n"));
    }
    for line in new_mid {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;

    fn ctx(root: &Path, safe_mode: bool) -> EffectorContext {
        EffectorContext {
            allowed_roots: vec![root.to_path_buf()],
            shell_allow_list: vec![],
            safe_mode,
            agent_id: 1,
            request_id: 1,
        }
    }

    #[test]
    fn validate_requires_path() {
        let effector = FilesystemEffector;
        let errors = effector
            .validate_request("read", &json!({}))
            .expect_err("missing path");
        assert!(errors[0].contains("path"));

        let errors = effector
            .validate_request("write", &json!({"path": "/tmp/x"}))
            .expect_err("missing content");
        assert!(errors[0].contains("content"));

        let errors = effector
            .validate_request("format", &json!({}))
            .expect_err("unknown op");
        assert!(errors[0].contains("unknown filesystem operation"));
    }

    #[test]
    fn dry_run_read_inside_root() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;
        let path = dir.path().join("x.txt");

        let steps = effector
            .dry_run(
                &ctx(dir.path(), false),
                "read",
                &json!({"path": path.display().to_string()}),
            )
            .expect("dry run");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::FsRead);
        assert!(steps[0].risk_flags.is_empty());
    }

    #[test]
    fn dry_run_denies_path_outside_roots() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;

        let steps = effector
            .dry_run(&ctx(dir.path(), false), "read", &json!({"path": "/etc/passwd"}))
            .expect("dry run");
        assert_eq!(steps.len(), 1);
        assert!(steps[0].risk_flags.iter().any(|f| f == flags::PATH_DENIED));
    }

    #[test]
    fn dry_run_denies_traversal_escape() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;
        let sneaky = format!("{}/../../../etc/passwd", dir.path().display());

        let steps = effector
            .dry_run(&ctx(dir.path(), false), "read", &json!({"path": sneaky}))
            .expect("dry run");
        assert!(steps[0].risk_flags.iter().any(|f| f == flags::PATH_DENIED));
    }

    #[test]
    fn dry_run_write_produces_diff_against_existing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.txt");
        fs::write(&path, "alpha\nbeta\n").expect("seed");

        let effector = FilesystemEffector;
        let steps = effector
            .dry_run(
                &ctx(dir.path(), false),
                "write",
                &json!({"path": path.display().to_string(), "content": "alpha\ngamma\n"}),
            )
            .expect("dry run");

        let diff = steps[0].diff.as_deref().expect("diff");
        assert!(diff.contains("-beta"));
        assert!(diff.contains("+gamma"));
        assert!(diff.contains("@@"));
    }

    #[test]
    fn dry_run_write_of_new_file_diffs_from_dev_null() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("fresh.txt");

        let effector = FilesystemEffector;
        let steps = effector
            .dry_run(
                &ctx(dir.path(), false),
                "write",
                &json!({"path": path.display().to_string(), "content": "hello\n"}),
            )
            .expect("dry run");

        let diff = steps[0].diff.as_deref().expect("diff");
        assert!(diff.starts_with("--- /dev/null"));
        assert!(diff.contains("+hello"));
    }

    #[test]
    fn safe_mode_flags_destructive_steps_only() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;
        let path = dir.path().join("x.txt").display().to_string();

        let read = effector
            .dry_run(&ctx(dir.path(), true), "read", &json!({"path": path.clone()}))
            .expect("read");
        assert!(read[0].risk_flags.is_empty());

        let delete = effector
            .dry_run(&ctx(dir.path(), true), "delete", &json!({"path": path}))
            .expect("delete");
        assert!(delete[0]
            .risk_flags
            .iter()
            .any(|f| f == flags::BLOCKED_BY_SAFE_MODE));
    }

    #[tokio::test]
    async fn execute_round_trip_write_read_move_delete() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;
        let context = ctx(dir.path(), false);
        let path = dir.path().join("a.txt").display().to_string();
        let moved = dir.path().join("b.txt").display().to_string();

        let write = effector
            .dry_run(&context, "write", &json!({"path": path.clone(), "content": "hello"}))
            .expect("plan write");
        let results = effector.execute(&context, &write).await;
        assert_eq!(results[0].status, crate::proto::StepStatus::Success);

        let read = effector
            .dry_run(&context, "read", &json!({"path": path.clone()}))
            .expect("plan read");
        let results = effector.execute(&context, &read).await;
        assert_eq!(results[0].output.as_deref(), Some("hello"));

        let mv = effector
            .dry_run(&context, "move", &json!({"from": path, "to": moved.clone()}))
            .expect("plan move");
        let results = effector.execute(&context, &mv).await;
        assert_eq!(results[0].status, crate::proto::StepStatus::Success);

        let delete = effector
            .dry_run(&context, "delete", &json!({"path": moved}))
            .expect("plan delete");
        let results = effector.execute(&context, &delete).await;
        assert_eq!(results[0].status, crate::proto::StepStatus::Success);
    }

    #[tokio::test]
    async fn execute_blocks_denied_step_without_io() {
        let dir = tempdir().expect("tempdir");
        let effector = FilesystemEffector;
        let context = ctx(dir.path(), false);

        let steps = effector
            .dry_run(&context, "read", &json!({"path": "/etc/passwd"}))
            .expect("plan");
        let results = effector.execute(&context, &steps).await;
        assert_eq!(results[0].status, crate::proto::StepStatus::Blocked);
        assert!(results[0].output.is_none());
    }

    #[tokio::test]
    async fn execute_blocks_destructive_step_in_safe_mode() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("keep.txt");
        fs::write(&path, "important").expect("seed");

        let effector = FilesystemEffector;
        let plan_ctx = ctx(dir.path(), true);
        let steps = effector
            .dry_run(
                &plan_ctx,
                "delete",
                &json!({"path": path.display().to_string()}),
            )
            .expect("plan");
        let results = effector.execute(&plan_ctx, &steps).await;

        assert_eq!(results[0].status, crate::proto::StepStatus::Blocked);
        assert!(path.exists(), "safe mode must not delete");
    }

    #[tokio::test]
    async fn read_output_is_truncated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("big.txt");
        fs::write(&path, "x".repeat(5000)).expect("seed");

        let effector = FilesystemEffector;
        let context = ctx(dir.path(), false);
        let steps = effector
            .dry_run(&context, "read", &json!({"path": path.display().to_string()}))
            .expect("plan");
        let results = effector.execute(&context, &steps).await;

        assert_eq!(results[0].output.as_ref().expect("output").len(), OUTPUT_LIMIT);
    }

    #[test]
    fn delete_dry_run_counts_directory_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("bulk");
        fs::create_dir_all(target.join("nested")).expect("mkdir");
        for i in 0..12 {
            fs::write(target.join(format!("f{i}.txt")), "x").expect("seed");
        }
        fs::write(target.join("nested/deep.txt"), "x").expect("seed");

        let effector = FilesystemEffector;
        let steps = effector
            .dry_run(
                &ctx(dir.path(), false),
                "delete",
                &json!({"path": target.display().to_string()}),
            )
            .expect("plan");
        assert_eq!(steps[0].inputs["fileCount"], json!(13));
    }

    #[test]
    fn unified_diff_trims_common_context() {
        let diff = unified_diff("a\nb\nc\n", "a\nB\nc\n", "f.txt");
        assert!(diff.contains("@@ -2,1 +2,1 @@"));
        assert!(diff.contains("-b\n"));
        assert!(diff.contains("+B\n"));
        assert!(!diff.contains("-a"));
        assert!(!diff.contains("-c"));
    }

    #[test]
    fn resolve_is_lexical_only() {
        // No filesystem access: nonexistent paths still normalize.
        assert_eq!(
            resolve_absolute("/no/such/dir/../file"),
            PathBuf::from("/no/such/file")
        );
    }
}
