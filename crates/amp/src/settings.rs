//! Ephemeral settings files.
//!
//! Permissions and extension-server configurations travel to the agent via
//! a JSON settings file referenced with `--settings-file`. The file lives
//! in the system temp directory (never inside the working tree, which the
//! safety check would flag) and is removed when the handle drops.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::AmpError;
use crate::permissions::PermissionRule;

/// Extension server entry in the settings file (`amp.mcpServers`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerConfig {
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

#[derive(Serialize)]
struct SettingsDocument<'a> {
    #[serde(rename = "amp.permissions")]
    permissions: &'a [PermissionRule],
    #[serde(rename = "amp.mcpServers")]
    servers: &'a HashMap<String, ServerConfig>,
}

/// A written settings file. Deleted on drop.
pub struct SettingsFile {
    file: NamedTempFile,
}

impl SettingsFile {
    /// Serialize rules and servers to a fresh temp file.
    pub fn write(
        rules: &[PermissionRule],
        servers: &HashMap<String, ServerConfig>,
    ) -> Result<Self, AmpError> {
        let document = SettingsDocument {
            permissions: rules,
            servers,
        };
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| AmpError::Settings(e.to_string()))?;

        let mut file =
            NamedTempFile::with_prefix("amp-settings-").map_err(|e| AmpError::Settings(e.to_string()))?;
        file.write_all(json.as_bytes())
            .map_err(|e| AmpError::Settings(e.to_string()))?;
        file.flush().map_err(|e| AmpError::Settings(e.to_string()))?;

        Ok(Self { file })
    }

    /// Path to hand to `--settings-file`.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
