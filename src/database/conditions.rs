use super::engine::{EngineError, RollbackInfo};
use super::status::{BlockingCondition, Command, ConditionKind};
use std::path::Path;

const CLOSE_LABEL: &str = "close";
const CORRUPTED_TITLE: &str = "corrupted data found in the database";

pub fn fatal(title: &str, detail: Option<String>) -> BlockingCondition {
    BlockingCondition {
        title: title.to_string(),
        detail,
        action_label: Some(CLOSE_LABEL.to_string()),
        action: Some(Command::TerminateProcess),
        kind: ConditionKind::Fatal,
    }
}

pub fn unclassified(error: &EngineError) -> BlockingCondition {
    fatal("error", Some(error.tag()))
}

pub fn lock_collision() -> BlockingCondition {
    fatal(
        "app already open",
        Some("the application can only be open once".to_string()),
    )
}

pub fn request_create() -> BlockingCondition {
    BlockingCondition {
        title: "no database found".to_string(),
        detail: None,
        action_label: Some("create".to_string()),
        action: Some(Command::CreateStore),
        kind: ConditionKind::Recoverable,
    }
}

pub fn target_not_empty(path: &Path) -> BlockingCondition {
    fatal(
        "error creating database",
        Some(format!("the folder '{}' is not empty", path.display())),
    )
}

pub fn searching_backup() -> BlockingCondition {
    BlockingCondition {
        title: CORRUPTED_TITLE.to_string(),
        detail: Some("searching for the most recent non-corrupt backup ...".to_string()),
        action_label: None,
        action: None,
        kind: ConditionKind::Progress,
    }
}

pub fn offer_rollback(info: &RollbackInfo) -> BlockingCondition {
    BlockingCondition {
        title: CORRUPTED_TITLE.to_string(),
        detail: Some(format!(
            "corrupted data:   {}\nbackup:   {}",
            info.corrupted_instant, info.rollback_candidate_instant
        )),
        action_label: Some("continue from backup".to_string()),
        action: Some(Command::CommitRollback),
        kind: ConditionKind::Recoverable,
    }
}

pub fn no_backup_found() -> BlockingCondition {
    fatal(
        CORRUPTED_TITLE,
        Some("no backup could be recovered".to_string()),
    )
}

pub fn no_backup_recoverable() -> BlockingCondition {
    fatal("no backup recoverable", None)
}

pub fn save_failed(error: &EngineError) -> BlockingCondition {
    fatal("error saving data", Some(error.tag()))
}

pub fn creating_store() -> BlockingCondition {
    BlockingCondition {
        title: "creating database ...".to_string(),
        detail: None,
        action_label: None,
        action: None,
        kind: ConditionKind::Progress,
    }
}

pub fn restoring_backup() -> BlockingCondition {
    BlockingCondition {
        title: CORRUPTED_TITLE.to_string(),
        detail: Some("restoring the most recent backup ...".to_string()),
        action_label: None,
        action: None,
        kind: ConditionKind::Progress,
    }
}
