//! Sentinel configuration.
//!
//! Configuration is a single YAML file with `${VAR}` environment-variable
//! expansion applied to the raw text before parsing. All durations accept
//! human suffixes (`30s`, `5m`, `24h`). Validation happens once at load;
//! a config that loads successfully never fails later.
//!
//! ```yaml
//! scheduler:
//!   max_concurrency: 3
//!   default_timeout: 10m
//! intake:
//!   listen: "0.0.0.0:8900"
//!   auth_token: "${SENTINEL_TOKEN}"
//! amp:
//!   binary: amp
//!   api_key: "${AMP_API_KEY}"
//! projects:
//!   - key: svc-a
//!     repo_url: git@github.com:acme/svc-a.git
//! ```

pub mod duration;
pub mod error;

pub use error::ConfigError;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Intake HTTP surface.
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Diagnosis pipeline switches.
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
    /// Agent subprocess settings.
    #[serde(default)]
    pub amp: AmpConfig,
    /// Source checkout settings.
    #[serde(default)]
    pub source: SourceConfig,
    /// Notification sink settings.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Skill name -> extension server configuration.
    #[serde(default)]
    pub skills: HashMap<String, SkillServerConfig>,
    /// Registered projects. Read-only after load.
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Bounded queue capacity.
    pub queue_size: usize,
    /// Per-attempt deadline.
    #[serde(with = "duration")]
    pub default_timeout: Duration,
    /// Attempts per task (1 = no retry).
    pub retry_count: u32,
    /// Fixed delay between attempts.
    #[serde(with = "duration")]
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            queue_size: 256,
            default_timeout: Duration::from_secs(600),
            retry_count: 2,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Intake HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Listen address, e.g. `0.0.0.0:8900`.
    pub listen: String,
    /// Optional bearer token; empty disables auth.
    pub auth_token: String,
    /// Max single-event body size in bytes.
    pub max_payload_size: usize,
    /// Minimum severity admitted (`info`, `warning`, `critical`).
    pub min_severity: String,
    /// Per-project events per hour; 0 disables the limit.
    pub rate_limit_per_hour: u32,
    /// Suppression defaults.
    pub dedup: DedupConfig,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8900".to_string(),
            auth_token: String::new(),
            max_payload_size: 1024 * 1024,
            min_severity: "info".to_string(),
            rate_limit_per_hour: 120,
            dedup: DedupConfig::default(),
        }
    }
}

/// Fingerprint suppression defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// Window during which a repeated fingerprint is rejected at intake.
    #[serde(with = "duration")]
    pub default_window: Duration,
    /// Ordered payload field paths used to build the fingerprint.
    pub default_fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::from_secs(1800),
            default_fields: vec![
                "error_msg".to_string(),
                "error".to_string(),
                "message".to_string(),
                "msg".to_string(),
            ],
        }
    }
}

/// Diagnosis pipeline switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosisConfig {
    /// Request structured JSON output from the agent.
    pub structured_output: bool,
    /// Allow the LLM last-resort JSON repair pass.
    pub json_fixer_enabled: bool,
    /// Version tag stamped into every report.
    pub prompt_version: String,
    /// Reuse prior reports for recurring fingerprints.
    pub fingerprint_reuse_enabled: bool,
    /// How far back reuse candidates are considered.
    #[serde(with = "duration")]
    pub fingerprint_reuse_window: Duration,
    /// Minimum normalized score a candidate needs for reuse.
    pub fingerprint_reuse_min_score: u32,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            structured_output: true,
            json_fixer_enabled: true,
            prompt_version: "v3".to_string(),
            fingerprint_reuse_enabled: true,
            fingerprint_reuse_window: Duration::from_secs(72 * 3600),
            fingerprint_reuse_min_score: 60,
        }
    }
}

/// Agent subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmpConfig {
    /// Binary name or path.
    pub binary: String,
    /// API key exported as `AMP_API_KEY`.
    pub api_key: String,
    /// Default agent mode: `smart`, `rush` or `deep`.
    pub default_mode: String,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            binary: "amp".to_string(),
            api_key: String::new(),
            default_mode: "smart".to_string(),
        }
    }
}

/// Source checkout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Directory under which per-project checkouts live.
    pub base_dir: String,
    /// Optional SSH identity file for git.
    pub git_ssh_key: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_dir: "/var/lib/sentinel/repos".to_string(),
            git_ssh_key: String::new(),
        }
    }
}

/// Notification sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Shared secret for signed webhooks; empty disables signing.
    pub secret: String,
    /// Delivery attempts.
    pub retry_count: u32,
    /// Base delay; attempt N waits `N * retry_delay`.
    #[serde(with = "duration")]
    pub retry_delay: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Data directory for the file store; empty selects the in-memory store.
    pub path: String,
}

/// Extension server configuration handed to the agent (settings file
/// `amp.mcpServers` entries). Either a command or a URL form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkillServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// A registered project. Static after registry load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Stable key referenced by events.
    pub key: String,
    /// Display name; defaults to the key.
    #[serde(default)]
    pub name: String,
    /// Clone URL.
    pub repo_url: String,
    /// Branch snapshotted for diagnosis.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Primary language hint passed to the agent.
    #[serde(default)]
    pub language: String,
    /// Subdirectory of the checkout handed to the agent; empty = repo root.
    #[serde(default)]
    pub source_root: String,
    /// Skill names resolved through the skill registry.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Owner handles shown in notifications.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Webhook URL reports for this project are sent to.
    #[serde(default)]
    pub notification_target: String,
    /// Per-project suppression overrides.
    #[serde(default)]
    pub dedup: Option<ProjectDedupOverride>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Project {
    /// Display name, falling back to the key.
    #[must_use]
    pub fn name_or_key(&self) -> &str {
        if self.name.is_empty() {
            &self.key
        } else {
            &self.name
        }
    }
}

/// Per-project suppression overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectDedupOverride {
    /// Ordered field paths replacing the defaults.
    pub fields: Vec<String>,
    /// Window replacing the default.
    #[serde(with = "duration::opt")]
    pub window: Option<Duration>,
}

const VALID_SEVERITIES: &[&str] = &["critical", "warning", "info"];
const VALID_MODES: &[&str] = &["smart", "rush", "deep"];

impl SentinelConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references
    /// from the environment first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from raw YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(raw).map_err(|e| ConfigError::Expand(e.to_string()))?;
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        debug!(
            projects = config.projects.len(),
            skills = config.skills.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Look up a project by key.
    #[must_use]
    pub fn project(&self, key: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.key == key)
    }

    /// Validate semantic constraints. Called by the load paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.queue_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.queue_size must be at least 1".to_string(),
            ));
        }
        if !VALID_SEVERITIES.contains(&self.intake.min_severity.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "intake.min_severity must be one of {VALID_SEVERITIES:?}, got {:?}",
                self.intake.min_severity
            )));
        }
        if !VALID_MODES.contains(&self.amp.default_mode.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "amp.default_mode must be one of {VALID_MODES:?}, got {:?}",
                self.amp.default_mode
            )));
        }
        if self.diagnosis.fingerprint_reuse_min_score > 100 {
            return Err(ConfigError::Invalid(
                "diagnosis.fingerprint_reuse_min_score must be <= 100".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if project.key.is_empty() {
                return Err(ConfigError::Invalid("project with empty key".to_string()));
            }
            if !seen.insert(project.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate project key {:?}",
                    project.key
                )));
            }
            if project.repo_url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "project {:?} has no repo_url",
                    project.key
                )));
            }
            for skill in &project.skills {
                if !self.skills.contains_key(skill) {
                    return Err(ConfigError::Invalid(format!(
                        "project {:?} references unknown skill {skill:?}",
                        project.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Suppression window for a project, honoring overrides.
    #[must_use]
    pub fn dedup_window(&self, project: &Project) -> Duration {
        project
            .dedup
            .as_ref()
            .and_then(|d| d.window)
            .unwrap_or(self.intake.dedup.default_window)
    }

    /// Fingerprint field paths for a project, honoring overrides.
    ///
    /// Returns `(fields, is_override)`; the fingerprint treats
    /// project-provided sets differently from the defaults.
    #[must_use]
    pub fn dedup_fields<'a>(&'a self, project: &'a Project) -> (&'a [String], bool) {
        match project.dedup.as_ref() {
            Some(d) if !d.fields.is_empty() => (&d.fields, true),
            _ => (&self.intake.dedup.default_fields, false),
        }
    }
}
