//! Configuration file management
//!
//! Loads TOML configuration files and provides application settings.
//! Default config path: ~/.config/corterm/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::command::prompt::{PWD_PATTERN, SFTP_PROMPT, SHELL_PROMPT};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Terminal settings
    pub terminal: TerminalConfig,
    /// Prompt recognition
    pub prompts: PromptsConfig,
    /// Session settings
    pub session: SessionConfig,
}

/// Terminal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Screen width in columns
    pub cols: u16,
    /// Screen height in rows
    pub rows: u16,
    /// TERM environment variable
    pub term_env: String,
    /// Line ending appended to submitted commands
    pub eol: String,
    /// Program to start when none is given (empty = $SHELL)
    pub shell: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 30,
            term_env: "xterm-256color".to_string(),
            eol: "\r".to_string(),
            shell: String::new(),
        }
    }
}

/// One prompt matcher: `kind` is "regex" or "suffix"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRule {
    pub kind: String,
    pub pattern: String,
}

impl PromptRule {
    pub fn regex(pattern: &str) -> Self {
        Self {
            kind: "regex".to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// Prompt recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Prompt of the interactive shell
    pub shell: PromptRule,
    /// Prompt of the SFTP client
    pub sftp: PromptRule,
    /// Reply to `pwd` inside SFTP; the first capture group is the directory
    pub pwd_pattern: String,
    /// Last-line text meaning the remote end closed the session
    pub end_of_session: Vec<String>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            shell: PromptRule::regex(SHELL_PROMPT),
            sftp: PromptRule::regex(SFTP_PROMPT),
            pwd_pattern: PWD_PATTERN.to_string(),
            end_of_session: vec!["logout".to_string(), "Connection closed".to_string()],
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where `!open` downloads go (system temp dir if unset)
    pub temp_dir: Option<PathBuf>,
    /// Idle sleep between output polls (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            poll_interval_ms: 10,
        }
    }
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/corterm/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. CORTERM_CONFIG environment variable
        if let Ok(path) = std::env::var("CORTERM_CONFIG") {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/corterm/config.toml
        if let Some(path) = default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        // 3. System config: /etc/corterm/config.toml
        let system_config = Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. CORTERM_CONFIG environment variable
    /// 2. ~/.config/corterm/config.toml (user config)
    /// 3. /etc/corterm/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Write the commented template to the user config path.
    /// Refuses to replace an existing file unless `force` is set.
    pub fn write_default_config(force: bool) -> Result<PathBuf> {
        let config_path =
            default_config_path().ok_or_else(|| anyhow::anyhow!("Config directory not found"))?;
        Self::write_template(&config_path, force)?;
        Ok(config_path)
    }

    pub fn write_template(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::write(path, DEFAULT_TEMPLATE)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Get default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("corterm").join("config.toml"))
}

const DEFAULT_TEMPLATE: &str = r#"# corterm configuration

[terminal]
cols = 80
rows = 30
term_env = "xterm-256color"
# Appended to every submitted line
eol = "\r"
# Program started when none is given on the command line ("" = $SHELL)
shell = ""

[prompts]
# Reply to `pwd` inside sftp; capture group 1 is the directory
pwd_pattern = '(?m)^Remote working directory: (.*)$'
# Last-line text that means the remote end closed the session
end_of_session = ["logout", "Connection closed"]

# kind = "regex" (matched against the last line) or "suffix"
[prompts.shell]
kind = "regex"
pattern = '^.*[>$#]\s*$'

[prompts.sftp]
kind = "regex"
pattern = 'sftp>\s*$'

[session]
# Download directory for `!open` (system temp dir if unset)
# temp_dir = "/tmp"
poll_interval_ms = 10
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_matches_defaults() {
        let parsed = Config::parse(DEFAULT_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.terminal.eol, defaults.terminal.eol);
        assert_eq!(parsed.terminal.cols, defaults.terminal.cols);
        assert_eq!(parsed.prompts.shell, defaults.prompts.shell);
        assert_eq!(parsed.prompts.sftp, defaults.prompts.sftp);
        assert_eq!(parsed.prompts.pwd_pattern, defaults.prompts.pwd_pattern);
        assert_eq!(parsed.prompts.end_of_session, defaults.prompts.end_of_session);
        assert_eq!(parsed.session.temp_dir, None);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::parse("[terminal]\ncols = 132\n").unwrap();
        assert_eq!(config.terminal.cols, 132);
        assert_eq!(config.terminal.rows, 30);
        assert_eq!(config.prompts.shell.pattern, SHELL_PROMPT);
    }

    #[test]
    fn test_custom_prompt_rule() {
        let config =
            Config::parse("[prompts.shell]\nkind = \"suffix\"\npattern = \"% \"\n").unwrap();
        assert_eq!(config.prompts.shell.kind, "suffix");
        assert_eq!(config.prompts.sftp, PromptRule::regex(SFTP_PROMPT));
    }

    #[test]
    fn test_write_template_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corterm").join("config.toml");
        Config::write_template(&path, false).unwrap();
        assert!(Config::write_template(&path, false).is_err());
        Config::write_template(&path, true).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.terminal.term_env, "xterm-256color");
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[terminal\n").unwrap();
        let err = Config::load_from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }
}
