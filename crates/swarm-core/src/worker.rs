//! Worker configuration and instance naming.
//!
//! A [`WorkerConfig`] is the declarative definition of one worker; the
//! supervisor indexes live attempts under *internal names*: the base
//! name for the primary, `base#k` for pool-scaled copies, and
//! `base@<session-prefix>` for session-owned stateful copies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::HubError;

/// Worker names auto-detected as stateful at declare time when the
/// flag is not set explicitly. All are browser-automation workers whose
/// correctness depends on uninterleaved per-caller state.
pub const STATEFUL_NAMES: [&str; 5] = [
    "playwright",
    "puppeteer",
    "browser-use",
    "selenium",
    "stagehand",
];

/// How many characters of the session id go into a session-owned
/// instance name.
pub const SESSION_PREFIX_LEN: usize = 8;

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// The transport a worker speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerTransport {
    /// Child process on standard streams.
    Local,
    /// Server-sent-event HTTP.
    Sse,
    /// Bidirectional streamable HTTP.
    StreamableHttp,
}

impl WorkerTransport {
    /// Whether this transport runs as a local child process.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for WorkerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Sse => write!(f, "sse"),
            Self::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Declarative definition of one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Persistent identifier, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Transport the worker speaks.
    pub transport: WorkerTransport,
    /// Launcher command (local only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Ordered launcher arguments (local only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment (local only).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL (network transports only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra request headers (network transports only).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the worker requires per-session isolation.
    #[serde(default)]
    pub stateful: bool,
}

impl WorkerConfig {
    /// Whether `name` is a valid worker base name.
    #[must_use]
    pub fn valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    /// Validate the config, applying stateful auto-detection.
    ///
    /// Local workers need a command; network workers need a URL. The
    /// stateful flag is forced on when the base name is in the
    /// built-in stateful name-set.
    pub fn validate(mut self) -> Result<Self, HubError> {
        if !Self::valid_name(&self.name) {
            return Err(HubError::bad_input(format!(
                "worker name '{}' must match [A-Za-z0-9_-]+",
                self.name
            )));
        }
        match self.transport {
            WorkerTransport::Local => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(HubError::bad_input(format!(
                        "local worker '{}' requires a command",
                        self.name
                    )));
                }
            }
            WorkerTransport::Sse | WorkerTransport::StreamableHttp => {
                if self.url.as_deref().is_none_or(str::is_empty) {
                    return Err(HubError::bad_input(format!(
                        "{} worker '{}' requires a url",
                        self.transport, self.name
                    )));
                }
            }
        }
        if STATEFUL_NAMES.contains(&self.name.as_str()) {
            self.stateful = true;
        }
        Ok(self)
    }

    /// Merge the provided fields of `patch` into this config.
    ///
    /// `None`/empty patch fields leave the current value untouched.
    #[must_use]
    pub fn merged(mut self, patch: WorkerConfigPatch) -> Self {
        if let Some(transport) = patch.transport {
            self.transport = transport;
        }
        if let Some(command) = patch.command {
            self.command = Some(command);
        }
        if let Some(args) = patch.args {
            self.args = args;
        }
        if let Some(env) = patch.env {
            self.env = env;
        }
        if let Some(url) = patch.url {
            self.url = Some(url);
        }
        if let Some(headers) = patch.headers {
            self.headers = headers;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(stateful) = patch.stateful {
            self.stateful = stateful;
        }
        self
    }
}

/// Partial update for [`WorkerConfig::merged`]. Only present fields change.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WorkerConfigPatch {
    /// New transport.
    pub transport: Option<WorkerTransport>,
    /// New command.
    pub command: Option<String>,
    /// New argument list (replaces, not appends).
    pub args: Option<Vec<String>>,
    /// New environment (replaces).
    pub env: Option<HashMap<String, String>>,
    /// New URL.
    pub url: Option<String>,
    /// New headers (replaces).
    pub headers: Option<HashMap<String, String>>,
    /// New description.
    pub description: Option<String>,
    /// New stateful flag.
    pub stateful: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal names
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded form of an instance's internal name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InternalName {
    /// The primary instance for a base.
    Primary {
        /// The base name.
        base: String,
    },
    /// A pool-scaled copy, index ≥ 1.
    Scaled {
        /// The base name.
        base: String,
        /// Scaled index (`base#k`).
        index: usize,
    },
    /// A session-owned stateful copy.
    SessionOwned {
        /// The base name.
        base: String,
        /// First [`SESSION_PREFIX_LEN`] chars of the owning session id.
        session_prefix: String,
    },
}

impl InternalName {
    /// Parse an internal name into its components.
    #[must_use]
    pub fn parse(internal: &str) -> Self {
        if let Some((base, rest)) = internal.split_once('#') {
            if let Ok(index) = rest.parse::<usize>() {
                if index >= 1 {
                    return Self::Scaled {
                        base: base.to_owned(),
                        index,
                    };
                }
            }
        }
        if let Some((base, prefix)) = internal.split_once('@') {
            return Self::SessionOwned {
                base: base.to_owned(),
                session_prefix: prefix.to_owned(),
            };
        }
        Self::Primary {
            base: internal.to_owned(),
        }
    }

    /// The base name.
    #[must_use]
    pub fn base(&self) -> &str {
        match self {
            Self::Primary { base } | Self::Scaled { base, .. } | Self::SessionOwned { base, .. } => {
                base
            }
        }
    }

    /// Whether a derived marker (`#` or `@`) appears in `internal`.
    ///
    /// Derived instances are never written back to the store.
    #[must_use]
    pub fn is_derived(internal: &str) -> bool {
        internal.contains('#') || internal.contains('@')
    }
}

/// Internal name for a pool-scaled copy.
#[must_use]
pub fn scaled_name(base: &str, index: usize) -> String {
    format!("{base}#{index}")
}

/// Internal name for a session-owned copy.
#[must_use]
pub fn session_name(base: &str, session_id: &str) -> String {
    let prefix: String = session_id.chars().take(SESSION_PREFIX_LEN).collect();
    format!("{base}@{prefix}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> WorkerConfig {
        WorkerConfig {
            name: name.into(),
            transport: WorkerTransport::Local,
            command: Some("npx".into()),
            args: vec!["-y".into(), "some-worker".into()],
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            description: String::new(),
            stateful: false,
        }
    }

    #[test]
    fn name_charset() {
        assert!(WorkerConfig::valid_name("fetch"));
        assert!(WorkerConfig::valid_name("my_worker-2"));
        assert!(!WorkerConfig::valid_name(""));
        assert!(!WorkerConfig::valid_name("a b"));
        assert!(!WorkerConfig::valid_name("a#1"));
        assert!(!WorkerConfig::valid_name("a@b"));
        assert!(!WorkerConfig::valid_name("über"));
    }

    #[test]
    fn local_requires_command() {
        let mut cfg = local("w");
        cfg.command = None;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "BAD_INPUT");
    }

    #[test]
    fn network_requires_url() {
        let cfg = WorkerConfig {
            transport: WorkerTransport::Sse,
            command: None,
            url: None,
            ..local("remote")
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stateful_autodetected_from_name_set() {
        let cfg = local("playwright").validate().unwrap();
        assert!(cfg.stateful);

        let cfg = local("fetch").validate().unwrap();
        assert!(!cfg.stateful);
    }

    #[test]
    fn explicit_stateful_survives_validation() {
        let mut cfg = local("fetch");
        cfg.stateful = true;
        assert!(cfg.validate().unwrap().stateful);
    }

    #[test]
    fn merge_patch_only_touches_present_fields() {
        let cfg = local("w");
        let merged = cfg.clone().merged(WorkerConfigPatch {
            description: Some("updated".into()),
            ..WorkerConfigPatch::default()
        });
        assert_eq!(merged.description, "updated");
        assert_eq!(merged.command, cfg.command);
        assert_eq!(merged.args, cfg.args);
    }

    #[test]
    fn merge_patch_replaces_args_wholesale() {
        let merged = local("w").merged(WorkerConfigPatch {
            args: Some(vec!["--flag".into()]),
            ..WorkerConfigPatch::default()
        });
        assert_eq!(merged.args, vec!["--flag".to_owned()]);
    }

    #[test]
    fn internal_name_parse_primary() {
        assert_eq!(
            InternalName::parse("fetch"),
            InternalName::Primary {
                base: "fetch".into()
            }
        );
    }

    #[test]
    fn internal_name_parse_scaled() {
        assert_eq!(
            InternalName::parse("fetch#3"),
            InternalName::Scaled {
                base: "fetch".into(),
                index: 3
            }
        );
    }

    #[test]
    fn internal_name_parse_session_owned() {
        let parsed = InternalName::parse("browser@1a2b3c4d");
        assert_eq!(
            parsed,
            InternalName::SessionOwned {
                base: "browser".into(),
                session_prefix: "1a2b3c4d".into()
            }
        );
        assert_eq!(parsed.base(), "browser");
    }

    #[test]
    fn scaled_index_zero_is_not_scaled() {
        // `#0` is not a valid scaled index; treat the whole string as a base.
        assert!(matches!(
            InternalName::parse("w#0"),
            InternalName::Primary { .. }
        ));
    }

    #[test]
    fn derived_marker_detection() {
        assert!(InternalName::is_derived("w#1"));
        assert!(InternalName::is_derived("w@abcd1234"));
        assert!(!InternalName::is_derived("w"));
    }

    #[test]
    fn session_name_uses_prefix() {
        let name = session_name("browser", "0123456789abcdef");
        assert_eq!(name, "browser@01234567");
    }

    #[test]
    fn config_serde_roundtrip() {
        let cfg = local("w").validate().unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: WorkerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn transport_serde_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WorkerTransport::StreamableHttp).unwrap(),
            "\"streamable-http\""
        );
        assert_eq!(
            serde_json::from_str::<WorkerTransport>("\"sse\"").unwrap(),
            WorkerTransport::Sse
        );
    }
}
