//! Built-in tools registered against the core [`orkestra::tool::ToolRegistry`]:
//! a workspace-confined filesystem set, a thin cron dispatcher, and a secret
//! vault front-end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use orkestra::cron::{CronScheduler, Job, Schedule};
use orkestra::secrets::SecretVault;
use orkestra::tool::{object_schema, ParamSchema, Tool, ToolContext, APPROVAL_REQUIRED_PREFIX};

/// Resolves `path` against `root`, rejecting anything that escapes it unless
/// `ctx.approved`. Escaping means the resolved path's lexical components walk
/// above `root` — we don't require the path to already exist.
fn guarded_path(root: &Path, path: &str, ctx: &ToolContext) -> Result<PathBuf, String> {
    let candidate = root.join(path);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    if ctx.approved {
                        normalized.push(component);
                    } else {
                        return Err(format!("{APPROVAL_REQUIRED_PREFIX}\npath {path:?} escapes the workspace"));
                    }
                }
            }
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) && !ctx.approved {
        return Err(format!("{APPROVAL_REQUIRED_PREFIX}\npath {path:?} escapes the workspace"));
    }
    Ok(normalized)
}

/// Reads a UTF-8 text file from the workspace.
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    /// Builds the tool, confining reads to `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Reads a UTF-8 text file from the workspace. Params: path."
    }

    fn schema(&self) -> ParamSchema {
        object_schema([("path", ParamSchema::string())], ["path"])
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> String {
        let Some(path) = params.get("path").and_then(Value::as_str) else {
            return "Error: missing required parameter 'path'".to_owned();
        };
        let resolved = match guarded_path(&self.root, path, ctx) {
            Ok(p) => p,
            Err(e) => return e,
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => content,
            Err(e) => format!("Error: failed to read {path:?}: {e}"),
        }
    }
}

/// Overwrites (creating if absent) a file in the workspace. High-privilege:
/// any call outside the workspace requires approval.
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    /// Builds the tool, confining writes to `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Writes (overwriting) a UTF-8 text file in the workspace. Params: path, content."
    }

    fn schema(&self) -> ParamSchema {
        object_schema(
            [("path", ParamSchema::string()), ("content", ParamSchema::string())],
            ["path", "content"],
        )
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> String {
        let (Some(path), Some(content)) = (
            params.get("path").and_then(Value::as_str),
            params.get("content").and_then(Value::as_str),
        ) else {
            return "Error: missing required parameter 'path' or 'content'".to_owned();
        };
        let resolved = match guarded_path(&self.root, path, ctx) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return format!("Error: failed to create parent directory for {path:?}: {e}");
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => format!("wrote {} bytes to {path}", content.len()),
            Err(e) => format!("Error: failed to write {path:?}: {e}"),
        }
    }
}

/// Replaces exactly one occurrence of `old_text` with `new_text` in a file.
pub struct EditFileTool {
    root: PathBuf,
}

impl EditFileTool {
    /// Builds the tool, confining edits to `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replaces exactly one occurrence of old_text with new_text in a workspace file. \
         Params: path, old_text, new_text."
    }

    fn schema(&self) -> ParamSchema {
        object_schema(
            [
                ("path", ParamSchema::string()),
                ("old_text", ParamSchema::string()),
                ("new_text", ParamSchema::string()),
            ],
            ["path", "old_text", "new_text"],
        )
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> String {
        let (Some(path), Some(old_text), Some(new_text)) = (
            params.get("path").and_then(Value::as_str),
            params.get("old_text").and_then(Value::as_str),
            params.get("new_text").and_then(Value::as_str),
        ) else {
            return "Error: missing required parameter".to_owned();
        };
        let resolved = match guarded_path(&self.root, path, ctx) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return format!("Error: failed to read {path:?}: {e}"),
        };
        let occurrences = content.matches(old_text).count();
        match occurrences {
            0 => format!("Error: old_text not found in {path}"),
            1 => {
                let replaced = content.replacen(old_text, new_text, 1);
                match tokio::fs::write(&resolved, replaced).await {
                    Ok(()) => format!("edited {path}"),
                    Err(e) => format!("Error: failed to write {path:?}: {e}"),
                }
            }
            n => format!("Error: old_text occurs {n} times in {path}, expected exactly one"),
        }
    }
}

/// Lists the entries of a workspace directory.
pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    /// Builds the tool, confining listings to `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    fn description(&self) -> &'static str {
        "Lists the entries of a workspace directory. Params: path (default \".\")."
    }

    fn schema(&self) -> ParamSchema {
        object_schema([("path", ParamSchema::string())], [])
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> String {
        let path = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let resolved = match guarded_path(&self.root, path, ctx) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let mut entries = match tokio::fs::read_dir(&resolved).await {
            Ok(rd) => rd,
            Err(e) => return format!("Error: failed to list {path:?}: {e}"),
        };
        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => break,
                Err(e) => return format!("Error: failed to list {path:?}: {e}"),
            }
        }
        names.sort();
        names.join("\n")
    }
}

/// Thin dispatcher onto [`CronScheduler`] operations, keyed by `action`.
pub struct CronTool {
    scheduler: Arc<CronScheduler>,
}

impl CronTool {
    /// Wraps `scheduler` as a tool.
    #[must_use]
    pub const fn new(scheduler: Arc<CronScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn description(&self) -> &'static str {
        "Schedules or cancels a recurring reminder. Params: action (\"register\"|\"unregister\"), \
         job_id, and for register: either at (RFC 3339) or every_ms."
    }

    fn schema(&self) -> ParamSchema {
        object_schema(
            [
                (
                    "action",
                    ParamSchema::String {
                        min_length: None,
                        max_length: None,
                        r#enum: Some(vec!["register".to_owned(), "unregister".to_owned()]),
                    },
                ),
                ("job_id", ParamSchema::string()),
                ("at", ParamSchema::string()),
                ("every_ms", ParamSchema::integer()),
            ],
            ["action", "job_id"],
        )
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> String {
        let Some(action) = params.get("action").and_then(Value::as_str) else {
            return "Error: missing required parameter 'action'".to_owned();
        };
        let Some(job_id) = params.get("job_id").and_then(Value::as_str) else {
            return "Error: missing required parameter 'job_id'".to_owned();
        };

        match action {
            "unregister" => match self.scheduler.unregister(job_id).await {
                Ok(()) => format!("unregistered {job_id}"),
                Err(e) => format!("Error: {e}"),
            },
            "register" => {
                let schedule = if let Some(at) = params.get("at").and_then(Value::as_str) {
                    match at.parse() {
                        Ok(ts) => Schedule::At(ts),
                        Err(e) => return format!("Error: invalid 'at' timestamp: {e}"),
                    }
                } else if let Some(ms) = params.get("every_ms").and_then(Value::as_i64) {
                    Schedule::Every {
                        anchor: chrono::Utc::now(),
                        period: chrono::Duration::milliseconds(ms),
                    }
                } else {
                    return "Error: register requires either 'at' or 'every_ms'".to_owned();
                };
                let delete_after_run = matches!(schedule, Schedule::At(_));
                let job = Job::new(job_id, schedule, Value::Null).with_delete_after_run(delete_after_run);
                match self.scheduler.register(job).await {
                    Ok(()) => format!("registered {job_id}"),
                    Err(e) => format!("Error: {e}"),
                }
            }
            other => format!("Error: unknown action {other:?}, expected register|unregister"),
        }
    }
}

/// Thin dispatcher onto [`SecretVault`] operations, keyed by `action`. Never
/// exposes plaintext back through `reveal`/`get` — the vault's placeholder
/// substitution (`resolve`) is how a secret actually reaches a downstream
/// call, not this tool.
pub struct SecretTool {
    vault: Arc<SecretVault>,
}

impl SecretTool {
    /// Wraps `vault` as a tool.
    #[must_use]
    pub const fn new(vault: Arc<SecretVault>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl Tool for SecretTool {
    fn name(&self) -> &'static str {
        "secret"
    }

    fn description(&self) -> &'static str {
        "Manages stored secrets. Params: action (\"put\"|\"remove\"|\"list\"), name, and for put: value. \
         Never returns plaintext; reference a stored secret elsewhere as {{secret:name}}."
    }

    fn schema(&self) -> ParamSchema {
        object_schema(
            [
                (
                    "action",
                    ParamSchema::String {
                        min_length: None,
                        max_length: None,
                        r#enum: Some(vec!["put".to_owned(), "remove".to_owned(), "list".to_owned()]),
                    },
                ),
                ("name", ParamSchema::string()),
                ("value", ParamSchema::string()),
            ],
            ["action"],
        )
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> String {
        let Some(action) = params.get("action").and_then(Value::as_str) else {
            return "Error: missing required parameter 'action'".to_owned();
        };

        match action {
            "list" => match self.vault.list_names().await {
                Ok(names) if names.is_empty() => "no secrets stored".to_owned(),
                Ok(names) => names.join("\n"),
                Err(e) => format!("Error: {e}"),
            },
            "remove" => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return "Error: missing required parameter 'name'".to_owned();
                };
                match self.vault.remove(name).await {
                    Ok(()) => format!("removed {name}"),
                    Err(e) => format!("Error: {e}"),
                }
            }
            "put" => {
                let (Some(name), Some(value)) = (
                    params.get("name").and_then(Value::as_str),
                    params.get("value").and_then(Value::as_str),
                ) else {
                    return "Error: missing required parameter 'name' or 'value'".to_owned();
                };
                match self.vault.put(name, value).await {
                    Ok(()) => format!("stored {name}"),
                    Err(e) => format!("Error: {e}"),
                }
            }
            other => format!("Error: unknown action {other:?}, expected put|remove|list"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orkestra::tool::ToolRegistry;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(WriteFileTool::new(dir.path().to_path_buf())))
            .await
            .unwrap();
        registry
            .register(Arc::new(ReadFileTool::new(dir.path().to_path_buf())))
            .await
            .unwrap();

        let ctx = ToolContext::new();
        let result = registry
            .execute("write_file", serde_json::json!({"path": "a.txt", "content": "hi"}), &ctx)
            .await;
        assert!(result.starts_with("wrote"));

        let read_back = registry
            .execute("read_file", serde_json::json!({"path": "a.txt"}), &ctx)
            .await;
        assert_eq!(read_back, "hi");
    }

    #[tokio::test]
    async fn escaping_path_requires_approval() {
        let dir = tempdir().unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf());
        let ctx = ToolContext::new();
        let result = tool.execute(serde_json::json!({"path": "../../etc/passwd"}), &ctx).await;
        assert!(result.starts_with(APPROVAL_REQUIRED_PREFIX));
    }

    #[tokio::test]
    async fn edit_requires_exactly_one_occurrence() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "foo foo").await.unwrap();
        let tool = EditFileTool::new(dir.path().to_path_buf());
        let ctx = ToolContext::new();
        let result = tool
            .execute(
                serde_json::json!({"path": "a.txt", "old_text": "foo", "new_text": "bar"}),
                &ctx,
            )
            .await;
        assert!(result.contains("occurs 2 times"));
    }

    #[tokio::test]
    async fn list_dir_sorts_entries() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "").await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "").await.unwrap();
        let tool = ListDirTool::new(dir.path().to_path_buf());
        let ctx = ToolContext::new();
        let result = tool.execute(serde_json::json!({}), &ctx).await;
        assert_eq!(result, "a.txt\nb.txt");
    }

    #[tokio::test]
    async fn secret_put_never_echoes_value_back() {
        let vault = Arc::new(SecretVault::in_memory().unwrap());
        let tool = SecretTool::new(Arc::clone(&vault));
        let ctx = ToolContext::new();
        let put = tool
            .execute(serde_json::json!({"action": "put", "name": "api-key", "value": "sk-hunter2"}), &ctx)
            .await;
        assert_eq!(put, "stored api-key");

        let listed = tool.execute(serde_json::json!({"action": "list"}), &ctx).await;
        assert_eq!(listed, "api-key");
        assert!(!listed.contains("hunter2"));

        let removed = tool
            .execute(serde_json::json!({"action": "remove", "name": "api-key"}), &ctx)
            .await;
        assert_eq!(removed, "removed api-key");
        assert_eq!(vault.list_names().await.unwrap().len(), 0);
    }
}
