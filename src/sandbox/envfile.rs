//! Sandbox-scoped environment variables.
//!
//! The sandbox env file is distinct from the process's own configuration:
//! it lists only the variables allowed to cross into the container. Plain
//! `KEY=VALUE` lines, `#` comments and blanks ignored, the value is
//! everything after the first `=` with no quoting or escaping rules.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// Reads the sandbox env file. A missing file is an empty mapping.
pub fn load(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        debug!(path = %path.display(), "no sandbox env file");
        return HashMap::new();
    };
    parse(&content)
}

/// Parses `KEY=VALUE` lines.
pub fn parse(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }
    vars
}

/// Merges file-sourced values with explicit overrides.
/// On key collision the override wins. Pure transform, no validation.
pub fn merge(
    file_vars: HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = file_vars;
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
