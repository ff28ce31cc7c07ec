//! Profile bundles: named groups of worker declarations.
//!
//! Two sources exist: read-only built-ins compiled into the runtime
//! and user-defined bundles held by the store. Built-ins shadow
//! same-named user bundles; user bundles cannot take a built-in name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::HubError;
use crate::worker::WorkerConfig;

/// One worker declaration inside a bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    /// Worker base name.
    pub name: String,
    /// Launcher command.
    pub command: String,
    /// Launcher arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl ProfileEntry {
    /// Expand into a local worker config (validated by the caller).
    #[must_use]
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            name: self.name.clone(),
            transport: crate::worker::WorkerTransport::Local,
            command: Some(self.command.clone()),
            args: self.args.clone(),
            env: self.env.clone(),
            url: None,
            headers: HashMap::new(),
            description: self.description.clone(),
            stateful: false,
        }
    }
}

/// A named group of worker declarations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileBundle {
    /// Bundle name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The worker declarations.
    pub entries: Vec<ProfileEntry>,
    /// Whether this bundle is a compiled-in built-in.
    #[serde(default)]
    pub builtin: bool,
}

impl ProfileBundle {
    /// Validate a user-supplied bundle: name charset and ≥ 1 entry.
    pub fn validate(&self) -> Result<(), HubError> {
        if !WorkerConfig::valid_name(&self.name) {
            return Err(HubError::bad_input(format!(
                "profile name '{}' must match [A-Za-z0-9_-]+",
                self.name
            )));
        }
        if self.entries.is_empty() {
            return Err(HubError::bad_input(format!(
                "profile '{}' needs at least one entry",
                self.name
            )));
        }
        for entry in &self.entries {
            if !WorkerConfig::valid_name(&entry.name) {
                return Err(HubError::bad_input(format!(
                    "profile entry name '{}' must match [A-Za-z0-9_-]+",
                    entry.name
                )));
            }
            if entry.command.is_empty() {
                return Err(HubError::bad_input(format!(
                    "profile entry '{}' needs a command",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
