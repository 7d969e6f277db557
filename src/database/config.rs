use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Minimum age of the newest backup before a checkpoint writes a new one.
    pub min_interval_minutes: u64,
    /// Number of backups kept on disk, newest first.
    pub retain: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter for env_logger; `RUST_LOG` takes precedence.
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_checkpoint")]
    pub checkpoint: CheckpointConfig,
    #[serde(default = "default_backups")]
    pub backups: BackupConfig,
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

fn default_checkpoint() -> CheckpointConfig {
    CheckpointConfig {
        interval_seconds: 30,
    }
}

fn default_backups() -> BackupConfig {
    BackupConfig {
        min_interval_minutes: 60,
        retain: 10,
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: "info".to_string(),
    }
}

impl AppConfig {
    pub fn default_config() -> Self {
        Self {
            checkpoint: default_checkpoint(),
            backups: default_backups(),
            logging: default_logging(),
        }
    }

    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_secs(self.checkpoint.interval_seconds)
    }

    pub fn backup_min_interval(&self) -> Duration {
        Duration::from_secs(self.backups.min_interval_minutes.saturating_mul(60))
    }

    /// Resets values the runtime cannot work with. Returns true if anything
    /// changed so the caller can rewrite the file.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if self.checkpoint.interval_seconds == 0 {
            self.checkpoint = default_checkpoint();
            changed = true;
        }
        if self.backups.retain == 0 {
            self.backups.retain = default_backups().retain;
            changed = true;
        }
        if self.logging.level.trim().is_empty() {
            self.logging = default_logging();
            changed = true;
        }
        changed
    }
}
