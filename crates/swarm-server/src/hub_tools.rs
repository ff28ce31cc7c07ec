//! The fifteen meta-tools exposed through the session-scoped tool
//! server.
//!
//! Every operation is synchronous request/response against the
//! supervisor. A failing meta-tool returns a result carrying a
//! plain-text error with the `is_error` flag set; the transport-level
//! request still succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use swarm_core::errors::HubError;
use swarm_core::profile::{ProfileBundle, ProfileEntry};
use swarm_core::tools::{ToolCallOutcome, ToolDescriptor};
use swarm_core::worker::{WorkerConfig, WorkerConfigPatch, WorkerTransport};
use swarm_runtime::profiles::ProfileCatalog;
use swarm_runtime::{catalog, Supervisor, WorkerState};

/// The meta-tool dispatcher bound to the shared supervisor.
pub struct HubTools {
    supervisor: Arc<Supervisor>,
    profiles: ProfileCatalog,
}

impl HubTools {
    /// Bind the meta-tools to a supervisor.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let profiles = ProfileCatalog::new(supervisor.store().clone());
        Self {
            supervisor,
            profiles,
        }
    }

    /// Execute one meta-tool. Unknown names and argument errors come
    /// back as error results, never as transport failures.
    #[instrument(skip(self, args), fields(tool))]
    pub async fn dispatch(
        &self,
        session: Option<&str>,
        tool: &str,
        args: Value,
    ) -> ToolCallOutcome {
        let result = match tool {
            "discover" => self.discover(args).await,
            "declare_worker" => self.declare_worker(args).await,
            "remove_worker" => self.remove_worker(args).await,
            "list_workers" => self.list_workers(),
            "stop_worker" => self.stop_worker(args).await,
            "start_worker" => self.start_worker(args).await,
            "reset_worker" => self.reset_worker(args).await,
            "update_worker" => self.update_worker(args).await,
            "list_tools" => self.list_tools(args),
            "call_tool" => self.call_tool(session, args).await,
            "list_profiles" => self.list_profiles(),
            "activate_profile" => self.activate_profile(args).await,
            "deactivate_profile" => self.deactivate_profile(args).await,
            "create_profile" => self.create_profile(args),
            "delete_profile" => self.delete_profile(args),
            other => Err(HubError::not_found(format!("meta-tool '{other}'"))),
        };
        result.unwrap_or_else(ToolCallOutcome::from)
    }

    // ── discovery ──────────────────────────────────────────────────────

    async fn discover(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize)]
        struct Args {
            query: String,
            limit: Option<usize>,
        }
        let args: Args = parse_args(args)?;
        let results = catalog::discover(&args.query, args.limit).await;
        Ok(ToolCallOutcome::json(&serde_json::to_value(&results)?))
    }

    // ── worker lifecycle ───────────────────────────────────────────────

    async fn declare_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize)]
        struct Args {
            name: String,
            #[serde(default = "default_transport")]
            transport: WorkerTransport,
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            #[serde(default)]
            description: String,
            stateful: Option<bool>,
        }
        let args: Args = parse_args(args)?;
        let config = WorkerConfig {
            name: args.name,
            transport: args.transport,
            command: args.command,
            args: args.args,
            env: args.env,
            url: args.url,
            headers: args.headers,
            description: args.description,
            stateful: args.stateful.unwrap_or(false),
        };

        let snapshot = self.supervisor.declare(config).await?;
        if snapshot.state != WorkerState::Connected {
            return Err(HubError::SpawnFailed(
                snapshot
                    .last_error
                    .unwrap_or_else(|| "worker failed to connect".into()),
            ));
        }
        metrics::counter!("swarm_workers_declared_total").increment(1);
        Ok(ToolCallOutcome::json(&json!({
            "name": snapshot.base_name,
            "state": snapshot.state,
            "tools": snapshot.tool_count,
        })))
    }

    async fn remove_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        let was_live = self.supervisor.stop(&name).await;
        let was_stored = self
            .supervisor
            .store()
            .delete_worker(&name)
            .map_err(HubError::from)?;
        if !was_live && !was_stored {
            return Err(HubError::not_found(format!("worker '{name}'")));
        }
        Ok(ToolCallOutcome::text(format!("removed worker '{name}'")))
    }

    fn list_workers(&self) -> Result<ToolCallOutcome, HubError> {
        let live = self.supervisor.list();
        let mut rows: Vec<Value> = live
            .iter()
            .map(|s| {
                json!({
                    "name": s.internal_name,
                    "state": s.state,
                    "transport": s.transport,
                    "pid": s.process_id,
                    "tools": s.tool_count,
                    "stateful": s.stateful,
                })
            })
            .collect();

        // Persisted-but-not-live workers are listed as stopped.
        for config in self.supervisor.store().list_workers().map_err(HubError::from)? {
            if self.supervisor.get(&config.name).is_none() {
                rows.push(json!({
                    "name": config.name,
                    "state": "stopped",
                    "transport": config.transport,
                    "stateful": config.stateful,
                }));
            }
        }
        Ok(ToolCallOutcome::json(&Value::Array(rows)))
    }

    async fn stop_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        if self.supervisor.get(&name).is_none() {
            return Err(HubError::NotConnected(format!(
                "worker '{name}' is not running"
            )));
        }
        let _ = self.supervisor.stop(&name).await;
        Ok(ToolCallOutcome::text(format!("stopped worker '{name}'")))
    }

    async fn start_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        if let Some(live) = self.supervisor.get(&name) {
            if live.state == WorkerState::Connected {
                return Err(HubError::Conflict(format!(
                    "worker '{name}' is already running"
                )));
            }
        }
        let config = self
            .supervisor
            .store()
            .get_worker(&name)
            .map_err(HubError::from)?
            .ok_or_else(|| HubError::not_found(format!("worker '{name}'")))?;

        let snapshot = self.supervisor.declare(config).await?;
        if snapshot.state != WorkerState::Connected {
            return Err(HubError::SpawnFailed(
                snapshot
                    .last_error
                    .unwrap_or_else(|| "worker failed to connect".into()),
            ));
        }
        Ok(ToolCallOutcome::text(format!("started worker '{name}'")))
    }

    async fn reset_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        let snapshot = self.supervisor.restart(&name).await?;
        if snapshot.state != WorkerState::Connected {
            return Err(HubError::SpawnFailed(
                snapshot
                    .last_error
                    .unwrap_or_else(|| "worker failed to connect".into()),
            ));
        }
        Ok(ToolCallOutcome::text(format!("reset worker '{name}'")))
    }

    async fn update_worker(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize)]
        struct Args {
            name: String,
            #[serde(flatten)]
            patch: WorkerConfigPatch,
        }
        let args: Args = parse_args(args)?;

        let current = self
            .supervisor
            .store()
            .get_worker(&args.name)
            .map_err(HubError::from)?
            .ok_or_else(|| HubError::not_found(format!("worker '{}'", args.name)))?;

        let merged = current.merged(args.patch).validate()?;
        let running = self.supervisor.get(&args.name).is_some();

        if running {
            // Stop-then-respawn with the new config; persisted on connect.
            let snapshot = self.supervisor.declare(merged).await?;
            if snapshot.state != WorkerState::Connected {
                return Err(HubError::SpawnFailed(
                    snapshot
                        .last_error
                        .unwrap_or_else(|| "worker failed to reconnect".into()),
                ));
            }
        } else {
            self.supervisor
                .store()
                .save_worker(&merged)
                .map_err(HubError::from)?;
        }
        Ok(ToolCallOutcome::text(format!(
            "updated worker '{}'",
            args.name
        )))
    }

    // ── tools ──────────────────────────────────────────────────────────

    fn list_tools(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize, Default)]
        struct Args {
            server: Option<String>,
        }
        let args: Args = if args.is_null() {
            Args::default()
        } else {
            parse_args(args)?
        };

        match args.server {
            Some(base) => {
                let tools = self
                    .supervisor
                    .tools_of(&base)
                    .ok_or_else(|| HubError::not_found(format!("worker '{base}'")))?;
                Ok(ToolCallOutcome::json(&serde_json::to_value(&tools)?))
            }
            None => {
                let lines: Vec<String> = self
                    .supervisor
                    .list()
                    .iter()
                    .map(|s| {
                        format!(
                            "{}: {} tools ({})",
                            s.internal_name,
                            s.tool_count,
                            serde_json::to_value(s.state)
                                .ok()
                                .and_then(|v| v.as_str().map(str::to_owned))
                                .unwrap_or_default()
                        )
                    })
                    .collect();
                Ok(ToolCallOutcome::text(lines.join("\n")))
            }
        }
    }

    async fn call_tool(
        &self,
        session: Option<&str>,
        args: Value,
    ) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize)]
        struct Args {
            server: String,
            tool: String,
            #[serde(default)]
            args: Value,
        }
        let args: Args = parse_args(args)?;
        if self.supervisor.get(&args.server).is_none() {
            return Err(HubError::not_found(format!("worker '{}'", args.server)));
        }
        metrics::counter!("swarm_tool_calls_total").increment(1);
        self.supervisor
            .call_queued(&args.server, &args.tool, args.args, session)
            .await
    }

    // ── profiles ───────────────────────────────────────────────────────

    fn list_profiles(&self) -> Result<ToolCallOutcome, HubError> {
        let bundles = self.profiles.list()?;
        let rows: Vec<Value> = bundles
            .iter()
            .map(|b| {
                json!({
                    "name": b.name,
                    "description": b.description,
                    "builtin": b.builtin,
                    "workers": b.entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect();
        Ok(ToolCallOutcome::json(&Value::Array(rows)))
    }

    async fn activate_profile(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        let bundle = self
            .profiles
            .get(&name)?
            .ok_or_else(|| HubError::not_found(format!("profile '{name}'")))?;

        let mut report = Vec::new();
        for entry in &bundle.entries {
            // Already-connected workers are left untouched; anything in
            // another state is stopped and redeclared by `declare`.
            if self
                .supervisor
                .get(&entry.name)
                .is_some_and(|s| s.state == WorkerState::Connected)
            {
                report.push(format!("{}: already connected", entry.name));
                continue;
            }
            match self.supervisor.declare(entry.to_worker_config()).await {
                Ok(snapshot) if snapshot.state == WorkerState::Connected => {
                    report.push(format!("{}: connected", entry.name));
                }
                Ok(snapshot) => {
                    report.push(format!(
                        "{}: failed ({})",
                        entry.name,
                        snapshot.last_error.unwrap_or_default()
                    ));
                }
                Err(e) => report.push(format!("{}: failed ({e})", entry.name)),
            }
        }
        Ok(ToolCallOutcome::text(format!(
            "activated profile '{name}'\n{}",
            report.join("\n")
        )))
    }

    async fn deactivate_profile(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        let bundle = self
            .profiles
            .get(&name)?
            .ok_or_else(|| HubError::not_found(format!("profile '{name}'")))?;

        let mut stopped = 0usize;
        for entry in &bundle.entries {
            if self.supervisor.get(&entry.name).is_some() {
                let _ = self.supervisor.stop(&entry.name).await;
                stopped += 1;
            }
        }
        // Persisted configs deliberately survive deactivation.
        Ok(ToolCallOutcome::text(format!(
            "deactivated profile '{name}' ({stopped} workers stopped)"
        )))
    }

    fn create_profile(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        #[derive(Deserialize)]
        struct Args {
            name: String,
            #[serde(default)]
            description: String,
            entries: Vec<ProfileEntry>,
        }
        let args: Args = parse_args(args)?;
        let bundle = ProfileBundle {
            name: args.name.clone(),
            description: args.description,
            entries: args.entries,
            builtin: false,
        };
        self.profiles.create(&bundle)?;
        Ok(ToolCallOutcome::text(format!(
            "created profile '{}'",
            args.name
        )))
    }

    fn delete_profile(&self, args: Value) -> Result<ToolCallOutcome, HubError> {
        let name = name_arg(args)?;
        self.profiles.delete(&name)?;
        Ok(ToolCallOutcome::text(format!("deleted profile '{name}'")))
    }
}

fn default_transport() -> WorkerTransport {
    WorkerTransport::Local
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, HubError> {
    serde_json::from_value(args).map_err(|e| HubError::bad_input(e.to_string()))
}

fn name_arg(args: Value) -> Result<String, HubError> {
    #[derive(Deserialize)]
    struct Args {
        name: String,
    }
    parse_args::<Args>(args).map(|a| a.name)
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Descriptors for every meta-tool, in protocol order.
#[must_use]
pub fn descriptors() -> Vec<ToolDescriptor> {
    fn object(properties: Value, required: &[&str]) -> Value {
        json!({"type": "object", "properties": properties, "required": required})
    }
    let name_only = object(json!({"name": {"type": "string"}}), &["name"]);

    vec![
        ToolDescriptor::new(
            "discover",
            "Search the external worker catalogs",
            object(
                json!({"query": {"type": "string"}, "limit": {"type": "integer"}}),
                &["query"],
            ),
        ),
        ToolDescriptor::new(
            "declare_worker",
            "Declare and start a worker; persists once connected",
            object(
                json!({
                    "name": {"type": "string"},
                    "transport": {"type": "string", "enum": ["local", "sse", "streamable-http"]},
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object"},
                    "url": {"type": "string"},
                    "headers": {"type": "object"},
                    "description": {"type": "string"},
                    "stateful": {"type": "boolean"}
                }),
                &["name"],
            ),
        ),
        ToolDescriptor::new(
            "remove_worker",
            "Stop a worker and remove it from the store",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "list_workers",
            "List live and persisted workers",
            object(json!({}), &[]),
        ),
        ToolDescriptor::new(
            "stop_worker",
            "Stop a live worker, keeping its persisted config",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "start_worker",
            "Start a worker from its persisted config",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "reset_worker",
            "Restart a worker (or spawn it fresh from the store)",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "update_worker",
            "Merge-update a worker config; respawns if running",
            object(
                json!({
                    "name": {"type": "string"},
                    "transport": {"type": "string"},
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object"},
                    "url": {"type": "string"},
                    "headers": {"type": "object"},
                    "description": {"type": "string"},
                    "stateful": {"type": "boolean"}
                }),
                &["name"],
            ),
        ),
        ToolDescriptor::new(
            "list_tools",
            "Summarize tools per worker, or full schemas for one",
            object(json!({"server": {"type": "string"}}), &[]),
        ),
        ToolDescriptor::new(
            "call_tool",
            "Invoke a tool on a managed worker",
            object(
                json!({
                    "server": {"type": "string"},
                    "tool": {"type": "string"},
                    "args": {"type": "object"}
                }),
                &["server", "tool"],
            ),
        ),
        ToolDescriptor::new(
            "list_profiles",
            "List built-in and user profile bundles",
            object(json!({}), &[]),
        ),
        ToolDescriptor::new(
            "activate_profile",
            "Declare every worker in a profile bundle",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "deactivate_profile",
            "Stop every live worker in a profile bundle",
            name_only.clone(),
        ),
        ToolDescriptor::new(
            "create_profile",
            "Persist a user profile bundle",
            object(
                json!({
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "entries": {"type": "array", "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "command": {"type": "string"},
                            "args": {"type": "array", "items": {"type": "string"}},
                            "env": {"type": "object"},
                            "description": {"type": "string"}
                        },
                        "required": ["name", "command"]
                    }}
                }),
                &["name", "entries"],
            ),
        ),
        ToolDescriptor::new(
            "delete_profile",
            "Delete a user profile bundle (built-ins are protected)",
            name_only,
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifteen_meta_tools() {
        let all = descriptors();
        assert_eq!(all.len(), 15);
        let names: Vec<&str> = all.iter().map(|d| d.name.as_str()).collect();
        for expected in [
            "discover",
            "declare_worker",
            "remove_worker",
            "list_workers",
            "stop_worker",
            "start_worker",
            "reset_worker",
            "update_worker",
            "list_tools",
            "call_tool",
            "list_profiles",
            "activate_profile",
            "deactivate_profile",
            "create_profile",
            "delete_profile",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn descriptors_have_object_schemas() {
        for desc in descriptors() {
            assert_eq!(desc.input_schema["type"], "object", "{}", desc.name);
        }
    }

    #[test]
    fn name_arg_rejects_missing_field() {
        let err = name_arg(json!({})).unwrap_err();
        assert_eq!(err.code(), "BAD_INPUT");
        assert_eq!(name_arg(json!({"name": "w"})).unwrap(), "w");
    }
}
