mod app_state;
mod console;
mod constants;
pub mod database;

use std::sync::Arc;

use crate::app_state::{build_state, default_config_path, load_or_init_config, resolve_storage_path};
use crate::database::sled_engine::SledEngine;
use crate::database::{start_checkpoint_scheduler, LifecycleController};

pub use crate::app_state::AppState;
pub use crate::console::render;

fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    // Tests and embedders may have installed a logger already.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

pub fn run() -> anyhow::Result<()> {
    let config_path = default_config_path()?;
    let config = load_or_init_config(&config_path)?;
    init_logging(&config.logging.level);
    log::info!("config loaded from {}", config_path.display());

    let storage_path = resolve_storage_path()?;
    let state = build_state(config_path, config, storage_path);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve(state))?;
    // The console's stdin reader is a plain thread; do not wait on it.
    rt.shutdown_background();
    Ok(())
}

async fn serve(state: AppState) -> anyhow::Result<()> {
    let controller: Arc<LifecycleController<SledEngine>> = state.controller.clone();

    controller.initialize(state.storage_path.clone()).await?;

    // Saving starts only once the first open attempt has been classified.
    let scheduler = start_checkpoint_scheduler(controller.clone(), state.config.checkpoint_period());
    let console = tokio::spawn(console::run_console(controller.clone()));

    tokio::select! {
        _ = controller.exit_signal().wait() => {
            log::info!("exit requested");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                log::warn!("ctrl-c handler failed: {e}");
            }
            log::info!("interrupted, saving before exit");
            controller.save_and_terminate().await;
        }
    }

    scheduler.stop().await;
    console.abort();
    controller.engine().close();
    log::info!("database closed");
    Ok(())
}
