use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::{CONFIG_DIR_NAME, CONFIG_FILE_NAME, DATABASE_SUBFOLDER};
use crate::database::config::AppConfig;
use crate::database::sled_engine::{EngineOptions, SledEngine};
use crate::database::{DatabaseContext, ExitSignal, LifecycleController};

pub struct AppState {
    pub config_path: PathBuf,
    pub config: AppConfig,
    pub storage_path: PathBuf,
    pub controller: Arc<LifecycleController<SledEngine>>,
}

pub fn load_or_init_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let txt = std::fs::read_to_string(path)?;
        let mut cfg: AppConfig = toml::from_str(&txt)?;
        if cfg.normalize() {
            log::warn!("config {} had unusable values, rewriting", path.display());
            std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
        }
        return Ok(cfg);
    }
    let cfg = AppConfig::default_config();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
    Ok(cfg)
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let base = dirs_next::config_dir()
        .or_else(dirs_next::home_dir)
        .ok_or_else(|| anyhow::anyhow!("no config or home directory for this user"))?;
    Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// `<documents>/Archive`, falling back to the home directory on platforms
/// that do not report a documents folder.
pub fn resolve_storage_path() -> anyhow::Result<PathBuf> {
    let documents = dirs_next::document_dir()
        .or_else(dirs_next::home_dir)
        .ok_or_else(|| anyhow::anyhow!("no documents or home directory for this user"))?;
    Ok(documents.join(DATABASE_SUBFOLDER))
}

pub fn build_state(
    config_path: PathBuf,
    config: AppConfig,
    storage_path: PathBuf,
) -> AppState {
    let engine = SledEngine::new(EngineOptions {
        backup_min_interval: config.backup_min_interval(),
        backup_retain: config.backups.retain,
    });
    let controller = Arc::new(LifecycleController::new(
        engine,
        Arc::new(DatabaseContext::new()),
        ExitSignal::new(),
    ));
    AppState {
        config_path,
        config,
        storage_path,
        controller,
    }
}
