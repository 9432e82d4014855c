//! pvscope configuration stored at `~/.pvscope/`.
//!
//! - `~/.pvscope/config.json`: optional tuning (wait budgets, retry policy,
//!   copy image) and defaults for flags
//! - `~/.pvscope/checkpoints/`: one JSON checkpoint per unfinished migration
//!
//! Flags override file values; file values override built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pvscope_common::{PollSpec, RetryConfig};
use pvscope_migrate::MigrateConfig;

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".pvscope";
const CONFIG_FILE_NAME: &str = "config.json";
const CHECKPOINT_DIR_NAME: &str = "checkpoints";

/// Poll interval and timeout in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSeconds {
    /// Seconds between checks
    pub interval_secs: u64,
    /// Seconds before giving up
    pub timeout_secs: u64,
}

impl From<PollSeconds> for PollSpec {
    fn from(p: PollSeconds) -> Self {
        PollSpec::secs(p.interval_secs, p.timeout_secs)
    }
}

/// Per-operation wait overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollOverrides {
    /// Reclaim-policy changes
    pub policy: Option<PollSeconds>,
    /// Claim-reference clearing
    pub unlink: Option<PollSeconds>,
    /// Claim binding
    pub bind: Option<PollSeconds>,
    /// Claim deletion
    pub delete: Option<PollSeconds>,
    /// Workload scaling
    pub scale: Option<PollSeconds>,
    /// Data copy
    pub copy: Option<PollSeconds>,
}

/// Step retry overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Attempts per step (0 retries forever)
    pub max_attempts: Option<u32>,
    /// First backoff in seconds
    pub initial_delay_secs: Option<u64>,
    /// Backoff ceiling in seconds
    pub max_delay_secs: Option<u64>,
    /// Backoff growth factor
    pub backoff_multiplier: Option<f64>,
}

/// Contents of `config.json`; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    /// Kubeconfig used when `--kubeconfig` is not given
    pub kubeconfig: Option<String>,
    /// Checkpoint directory used when `--checkpoint-dir` is not given
    pub checkpoint_dir: Option<String>,
    /// Image running the copy
    pub copy_image: Option<String>,
    /// Command running the copy; sees `/data/src` and `/data/dest`
    pub copy_command: Option<Vec<String>>,
    /// Pull secrets for the copy image
    pub image_pull_secrets: Vec<String>,
    /// Wait budgets
    pub polls: PollOverrides,
    /// Step retry policy
    pub retry: RetrySettings,
}

impl FileConfig {
    /// Built-in defaults with this file's overrides applied
    ///
    /// Fails with a validation error when an override is out of range.
    pub fn to_migrate_config(&self) -> Result<MigrateConfig> {
        let mut config = MigrateConfig::default();
        let polls = &self.polls;

        let apply = |target: &mut PollSpec, value: Option<PollSeconds>| {
            if let Some(value) = value {
                *target = value.into();
            }
        };
        apply(&mut config.policy_poll, polls.policy);
        apply(&mut config.unlink_poll, polls.unlink);
        apply(&mut config.bind_poll, polls.bind);
        apply(&mut config.delete_poll, polls.delete);
        apply(&mut config.scale_poll, polls.scale);
        apply(&mut config.copy.poll, polls.copy);

        if let Some(image) = &self.copy_image {
            config.copy.image = image.clone();
        }
        if let Some(command) = &self.copy_command {
            config.copy.command = command.clone();
        }
        config.copy.image_pull_secrets = self.image_pull_secrets.clone();

        let retry = &self.retry;
        let defaults = RetryConfig::default();
        config.retry = RetryConfig {
            max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: retry
                .initial_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_delay),
            max_delay: retry
                .max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier: retry
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Returns `~/.pvscope/`.
pub fn pvscope_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Load the config file.
///
/// An explicit path must exist. The default `~/.pvscope/config.json` is
/// optional and yields defaults when missing.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = pvscope_dir()?.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(FileConfig::default());
            }
            path
        }
    };

    let data = std::fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Resolve the checkpoint directory: flag, then config file, then `~/.pvscope/checkpoints`.
pub fn checkpoint_dir(flag: Option<&Path>, file: &FileConfig) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = &file.checkpoint_dir {
        return Ok(PathBuf::from(dir));
    }
    Ok(pvscope_dir()?.join(CHECKPOINT_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: FileConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, FileConfig::default());
        assert_eq!(config.to_migrate_config().unwrap(), MigrateConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let json = r#"{
            "copyImage": "registry.local/rclone:1.66",
            "imagePullSecrets": ["registry"],
            "polls": { "copy": { "intervalSecs": 10, "timeoutSecs": 7200 } },
            "retry": { "maxAttempts": 8, "initialDelaySecs": 2 }
        }"#;
        let config: FileConfig = serde_json::from_str(json).unwrap();
        let migrate = config.to_migrate_config().unwrap();

        assert_eq!(migrate.copy.image, "registry.local/rclone:1.66");
        assert_eq!(migrate.copy.image_pull_secrets, vec!["registry".to_string()]);
        assert_eq!(migrate.copy.poll, PollSpec::secs(10, 7200));
        assert_eq!(migrate.retry.max_attempts, 8);
        assert_eq!(migrate.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(migrate.retry.max_delay, Duration::from_secs(60));
        // Untouched budgets keep their defaults
        assert_eq!(migrate.bind_poll, MigrateConfig::default().bind_poll);
        assert_eq!(migrate.copy.command, MigrateConfig::default().copy.command);
    }

    #[test]
    fn out_of_range_overrides_are_rejected() {
        let cases = [
            r#"{ "retry": { "backoffMultiplier": -1.0 } }"#,
            r#"{ "retry": { "backoffMultiplier": 0.5 } }"#,
            r#"{ "retry": { "initialDelaySecs": 120, "maxDelaySecs": 10 } }"#,
            r#"{ "retry": { "maxDelaySecs": 18446744073709551615 } }"#,
            r#"{ "polls": { "bind": { "intervalSecs": 2, "timeoutSecs": 18446744073709551615 } } }"#,
            r#"{ "polls": { "scale": { "intervalSecs": 0, "timeoutSecs": 60 } } }"#,
        ];
        for json in cases {
            let config: FileConfig = serde_json::from_str(json).unwrap();
            let result = config.to_migrate_config();
            assert!(
                matches!(result, Err(Error::Migrate(pvscope_common::Error::Validation { .. }))),
                "{} gave {:?}",
                json,
                result
            );
        }
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvscope.json");
        std::fs::write(&path, r#"{"checkpointDir": "/var/lib/pvscope"}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.checkpoint_dir.as_deref(), Some("/var/lib/pvscope"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvscope.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(Error::Config { .. })));
    }

    #[test]
    fn checkpoint_dir_resolution_order() {
        let file = FileConfig {
            checkpoint_dir: Some("/from/file".to_string()),
            ..Default::default()
        };
        assert_eq!(
            checkpoint_dir(Some(Path::new("/from/flag")), &file).unwrap(),
            PathBuf::from("/from/flag")
        );
        assert_eq!(
            checkpoint_dir(None, &file).unwrap(),
            PathBuf::from("/from/file")
        );
    }
}
