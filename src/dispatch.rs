use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::template::ResolvedCommand;

/// Record of one launched command.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: String,
    pub hook: String,
    pub command: String,
    pub pid: Option<u32>,
    pub log_path: Option<String>,
    pub launched_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(hook: &str, command: &ResolvedCommand, pid: Option<u32>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            hook: hook.to_string(),
            command: command.to_string(),
            pid,
            log_path: None,
            launched_at: Utc::now(),
        }
    }

    /// Whole seconds since the command was launched.
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.launched_at).num_seconds()
    }

    pub fn with_log_path(mut self, path: Option<String>) -> Self {
        self.log_path = path;
        self
    }
}

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Success,
    Failed { code: Option<i32> },
    Lost,
}
