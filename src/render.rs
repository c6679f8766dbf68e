//! Config generation: profile -> validated, atomically written worker config.

use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::backend::{find_unresolved_token, parse_key_values, Backend, ConfigFormat, RenderedConfig};
use crate::error::{SessionError, SessionResult};
use crate::profile::{is_placeholder, MiningProfile};

/// Renders and writes backend configuration files
pub struct ConfigGenerator;

impl ConfigGenerator {
    /// Render the configuration for `backend` without touching the disk.
    ///
    /// Rejects profiles that still carry placeholder values and rendered
    /// output with unresolved template tokens.
    pub fn preview(
        profile: &MiningProfile,
        backend: &dyn Backend,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig> {
        profile.validate()?;

        let rendered = backend.render_config(profile, install_path)?;
        if let Some(token) = find_unresolved_token(&rendered.contents) {
            return Err(SessionError::configuration(
                backend.descriptor().config_file,
                format!("unresolved placeholder {}", token),
            ));
        }
        if let Some(sentinel) = find_sentinel(&rendered) {
            return Err(SessionError::configuration(
                backend.descriptor().config_file,
                format!("placeholder value '{}' in rendered config", sentinel.trim()),
            ));
        }
        Ok(rendered)
    }

    /// Render and write the configuration, replacing any previous file
    pub fn render(
        profile: &MiningProfile,
        backend: &dyn Backend,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig> {
        let rendered = Self::preview(profile, backend, install_path)?;
        write_atomically(&rendered)?;
        info!(
            "Wrote {} config to {}",
            backend.descriptor().kind,
            rendered.path.display()
        );
        Ok(rendered)
    }
}

/// First rendered value that is a placeholder as a whole
fn find_sentinel(rendered: &RenderedConfig) -> Option<String> {
    let values: Vec<String> = match rendered.format {
        ConfigFormat::KeyValue => parse_key_values(&rendered.contents).into_values().collect(),
        ConfigFormat::Json => {
            let mut values = Vec::new();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&rendered.contents) {
                collect_strings(&json, &mut values);
            }
            values
        }
    };
    values.into_iter().find(|value| is_placeholder(value))
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn write_atomically(rendered: &RenderedConfig) -> SessionResult<()> {
    let dir = rendered
        .path
        .parent()
        .ok_or_else(|| SessionError::configuration("config", "config path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| SessionError::io(format!("creating {}", dir.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".config-")
        .tempfile_in(dir)
        .map_err(|e| SessionError::io("creating temporary config", e))?;
    tmp.write_all(rendered.contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| SessionError::io("writing temporary config", e))?;
    tmp.persist(&rendered.path)
        .map_err(|e| SessionError::io(format!("replacing {}", rendered.path.display()), e.error))?;

    debug!("Config persisted ({} bytes)", rendered.contents.len());
    Ok(())
}
