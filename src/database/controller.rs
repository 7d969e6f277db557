use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::conditions;
use super::engine::{EngineError, StorageEngine};
use super::shutdown::ExitSignal;
use super::status::{BlockingCondition, Command, LifecycleState, StatusChannel};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("storage path already resolved to {0}")]
    AlreadyInitialized(PathBuf),
    #[error("storage path has not been resolved yet")]
    NotInitialized,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command issued against generation {issued}, current is {current}")]
    Stale { issued: u64, current: u64 },
    #[error("current condition does not offer {0:?}")]
    NotOffered(Command),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Process-scoped lifecycle context: the storage path (resolved once) and the
/// status cell. Lives until the process exits.
#[derive(Default)]
pub struct DatabaseContext {
    storage_path: OnceLock<PathBuf>,
    status: StatusChannel,
}

impl DatabaseContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.get().map(PathBuf::as_path)
    }

    pub fn status(&self) -> &StatusChannel {
        &self.status
    }

    fn resolve(&self, path: PathBuf) -> Result<&Path, LifecycleError> {
        if self.storage_path.set(path).is_err() {
            let existing = self.storage_path.get().cloned().unwrap_or_default();
            return Err(LifecycleError::AlreadyInitialized(existing));
        }
        self.storage_path().ok_or(LifecycleError::NotInitialized)
    }
}

pub struct LifecycleController<E> {
    engine: E,
    ctx: Arc<DatabaseContext>,
    pub(super) save_gate: tokio::sync::Mutex<()>,
    exit: ExitSignal,
}

impl<E: StorageEngine> LifecycleController<E> {
    pub fn new(engine: E, ctx: Arc<DatabaseContext>, exit: ExitSignal) -> Self {
        Self {
            engine,
            ctx,
            save_gate: tokio::sync::Mutex::new(()),
            exit,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn context(&self) -> &Arc<DatabaseContext> {
        &self.ctx
    }

    pub fn status(&self) -> &StatusChannel {
        self.ctx.status()
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn storage_path(&self) -> Result<&Path, LifecycleError> {
        self.ctx.storage_path().ok_or(LifecycleError::NotInitialized)
    }

    /// Resolves the storage path and runs the first open attempt, classifying
    /// any failure into the matching recovery branch.
    pub async fn initialize(&self, path: PathBuf) -> Result<(), LifecycleError> {
        let path = self.ctx.resolve(path)?;
        log::info!("opening database at {}", path.display());
        let epoch = self
            .status()
            .transition(LifecycleState::Opening, None);

        match self.engine.open(path).await {
            Ok(()) => {
                self.settle(epoch, LifecycleState::Open, None, "open");
            }
            Err(EngineError::NotFound) => {
                log::warn!("no database at {}", path.display());
                self.settle(
                    epoch,
                    LifecycleState::AwaitingCreation,
                    Some(conditions::request_create()),
                    "open",
                );
            }
            Err(EngineError::Collision) => {
                log::warn!("database is locked by another instance");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::lock_collision()),
                    "open",
                );
            }
            Err(EngineError::DataIsCorrupted) => {
                log::warn!("database reported corrupted data, looking for a backup");
                self.discover_rollback_from(epoch, path).await;
            }
            Err(EngineError::AlreadyOpen) => {
                log::info!("database already open in this process, releasing stale handles");
                self.engine.release_stale_handles().await;
                self.settle(epoch, LifecycleState::Open, None, "open");
            }
            Err(e) => {
                log::warn!("open failed: {e}");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::unclassified(&e)),
                    "open",
                );
            }
        }
        Ok(())
    }

    /// Runs `CreateStore` against the condition currently shown. Rejected
    /// unless that condition offers it.
    pub async fn create_store(&self) -> Result<(), DispatchError> {
        self.dispatch(self.status().generation(), Command::CreateStore)
            .await
    }

    pub async fn begin_rollback_discovery(&self) -> Result<(), DispatchError> {
        self.dispatch(self.status().generation(), Command::BeginRollbackDiscovery)
            .await
    }

    pub async fn commit_rollback(&self) -> Result<(), DispatchError> {
        self.dispatch(self.status().generation(), Command::CommitRollback)
            .await
    }

    /// Runs the command offered by the condition the caller saw at
    /// `generation`. Anything issued against an older view is rejected.
    pub async fn dispatch(&self, generation: u64, command: Command) -> Result<(), DispatchError> {
        let snap = self.status().snapshot();
        if snap.generation != generation {
            return Err(DispatchError::Stale {
                issued: generation,
                current: snap.generation,
            });
        }
        if !snap
            .condition
            .as_ref()
            .is_some_and(|c| c.offers(command))
        {
            return Err(DispatchError::NotOffered(command));
        }
        let path = self.ctx.storage_path();
        if command != Command::TerminateProcess && path.is_none() {
            return Err(LifecycleError::NotInitialized.into());
        }
        let Some(epoch) = self.status().claim(generation) else {
            return Err(DispatchError::Stale {
                issued: generation,
                current: self.status().generation(),
            });
        };

        log::info!("dispatching {command:?}");
        match (command, path) {
            (Command::TerminateProcess, _) => {
                self.save_and_terminate().await;
            }
            (_, None) => return Err(LifecycleError::NotInitialized.into()),
            (Command::CreateStore, Some(path)) => self.create_store_from(epoch, path).await,
            (Command::BeginRollbackDiscovery, Some(path)) => {
                self.discover_rollback_from(epoch, path).await
            }
            (Command::CommitRollback, Some(path)) => self.commit_rollback_from(epoch, path).await,
        }
        Ok(())
    }

    async fn create_store_from(&self, epoch: u64, path: &Path) {
        let Some(epoch) = self.begin(
            epoch,
            LifecycleState::AwaitingCreation,
            conditions::creating_store(),
            "create",
        ) else {
            return;
        };
        log::info!("creating database at {}", path.display());

        match self.engine.create(path).await {
            Ok(()) => {
                self.settle(epoch, LifecycleState::Open, None, "create");
            }
            Err(EngineError::AlreadyExists) => {
                log::warn!("cannot create database: {} is not empty", path.display());
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::target_not_empty(path)),
                    "create",
                );
            }
            Err(EngineError::Collision) => {
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::lock_collision()),
                    "create",
                );
            }
            Err(e) => {
                log::warn!("create failed: {e}");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::unclassified(&e)),
                    "create",
                );
            }
        }
    }

    async fn discover_rollback_from(&self, epoch: u64, path: &Path) {
        let Some(epoch) = self.begin(
            epoch,
            LifecycleState::RollingBack,
            conditions::searching_backup(),
            "rollback discovery",
        ) else {
            return;
        };

        match self.engine.query_integrity(path).await {
            Ok(info) => {
                log::info!(
                    "rollback candidate found: corrupted={} backup={}",
                    info.corrupted_instant,
                    info.rollback_candidate_instant
                );
                self.settle(
                    epoch,
                    LifecycleState::AwaitingRollbackChoice,
                    Some(conditions::offer_rollback(&info)),
                    "rollback discovery",
                );
            }
            Err(EngineError::NotFound) => {
                log::error!("database is corrupted and no backup is usable");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::no_backup_found()),
                    "rollback discovery",
                );
            }
            Err(e) => {
                log::warn!("rollback discovery failed: {e}");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::unclassified(&e)),
                    "rollback discovery",
                );
            }
        }
    }

    async fn commit_rollback_from(&self, epoch: u64, path: &Path) {
        let Some(epoch) = self.begin(
            epoch,
            LifecycleState::RollingBack,
            conditions::restoring_backup(),
            "rollback",
        ) else {
            return;
        };
        log::info!("rolling back database at {}", path.display());

        match self.engine.commit_rollback(path).await {
            Ok(()) => {
                self.settle(epoch, LifecycleState::Open, None, "rollback");
            }
            Err(EngineError::NotFound) => {
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::no_backup_recoverable()),
                    "rollback",
                );
            }
            Err(EngineError::Collision) => {
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::lock_collision()),
                    "rollback",
                );
            }
            Err(e) => {
                log::warn!("rollback failed: {e}");
                self.settle(
                    epoch,
                    LifecycleState::Blocked,
                    Some(conditions::unclassified(&e)),
                    "rollback",
                );
            }
        }
    }

    /// Shows the in-flight condition for `op`, provided nobody wrote since
    /// `epoch`.
    fn begin(
        &self,
        epoch: u64,
        state: LifecycleState,
        progress: BlockingCondition,
        op: &str,
    ) -> Option<u64> {
        let next = self
            .status()
            .transition_if_current(epoch, state, Some(progress));
        if next.is_none() {
            log::debug!("not starting {op}: status changed since it was requested");
        }
        next
    }

    /// Applies the outcome of an engine call unless a newer write superseded
    /// the operation while it was in flight.
    pub(super) fn settle(
        &self,
        epoch: u64,
        state: LifecycleState,
        condition: Option<BlockingCondition>,
        op: &str,
    ) -> bool {
        let title = condition.as_ref().map(|c| c.title.clone());
        match self
            .status()
            .transition_if_current(epoch, state, condition)
        {
            Some(_) => {
                match title {
                    Some(title) => log::info!("{op}: {} ({title})", state.as_str()),
                    None => log::info!("{op}: {}", state.as_str()),
                }
                true
            }
            None => {
                log::debug!("discarding stale {op} response");
                false
            }
        }
    }
}
