pub mod checkpoint;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod engine;
pub mod shutdown;
pub mod sled_engine;
pub mod status;


pub use checkpoint::{start_checkpoint_scheduler, CheckpointHandle, CheckpointOutcome};
pub use controller::{DatabaseContext, DispatchError, LifecycleController, LifecycleError};
pub use engine::{EngineError, RollbackInfo, StorageEngine};
pub use shutdown::ExitSignal;
pub use status::{
    BlockingCondition, Command, ConditionKind, LifecycleState, StatusChannel, StatusSnapshot,
};
