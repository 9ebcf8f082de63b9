use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub sandbox: SandboxSection,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "hermit".to_string(),
        }
    }
}

/// The `[sandbox]` section of the config file.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxSection {
    /// Container image for the sandbox
    pub image: String,
    /// Container name prefix; the process id is appended for uniqueness
    pub container_prefix: String,
    /// Host directory mounted read-write at /mnt
    pub mnt_dir: String,
    /// Skip the /mnt and /skills mounts entirely
    pub no_mnt: bool,
    /// Host directory mounted read-only at /skills
    pub skills_dir: String,
    /// KEY=VALUE file with the variables allowed into the sandbox
    pub env_file: String,
    /// Variables pinned in config; they win over env_file entries
    pub env: HashMap<String, String>,
    pub command_timeout_secs: u64,
    /// Timeout for reaching the container engine daemon
    pub engine_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_prefix: default_container_prefix(),
            mnt_dir: ".".to_string(),
            no_mnt: false,
            skills_dir: "./skills".to_string(),
            env_file: ".env.sandbox".to_string(),
            env: HashMap::new(),
            command_timeout_secs: 30,
            engine_timeout_secs: 10,
        }
    }
}

fn default_image() -> String {
    std::env::var("SANDBOX_CONTAINER_IMAGE").unwrap_or_else(|_| "ubuntu:24.04".to_string())
}

fn default_container_prefix() -> String {
    std::env::var("SANDBOX_CONTAINER_NAME").unwrap_or_else(|_| "hermit-sandbox".to_string())
}

impl SandboxSection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

impl Config {
    /// Loads the config file. A missing file is not an error: defaults apply.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };
        // Expand environment variables like ${SANDBOX_CONTAINER_IMAGE}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Loading ─────────────────────────────────────────

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load("/tmp/hermit-no-such-config.toml").unwrap();
        assert_eq!(config.agent.name, "hermit");
        assert_eq!(config.sandbox.mnt_dir, ".");
        assert!(!config.sandbox.no_mnt);
        assert_eq!(config.sandbox.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_section() {
        let toml = r#"
            [agent]
            name = "worker"

            [sandbox]
            image = "debian:12"
            container_prefix = "worker-box"
            mnt_dir = "~/work"
            no_mnt = true
            command_timeout_secs = 120

            [sandbox.env]
            PINNED = "yes"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.agent.name, "worker");
        assert_eq!(config.sandbox.image, "debian:12");
        assert_eq!(config.sandbox.container_prefix, "worker-box");
        assert!(config.sandbox.no_mnt);
        assert_eq!(config.sandbox.command_timeout(), Duration::from_secs(120));
        assert_eq!(config.sandbox.env["PINNED"], "yes");
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let toml = r#"
            [sandbox]
            image = "alpine:3.20"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.image, "alpine:3.20");
        assert_eq!(config.sandbox.skills_dir, "./skills");
        assert_eq!(config.sandbox.engine_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("HERMIT_TEST_IMAGE", "ubuntu:25.04");
        let toml = r#"
            [sandbox]
            image = "${HERMIT_TEST_IMAGE}"
        "#;
        let expanded = shellexpand::env(toml).unwrap();
        let config: Config = toml::from_str(&expanded).unwrap();
        assert_eq!(config.sandbox.image, "ubuntu:25.04");
    }
}
