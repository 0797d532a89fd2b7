//! Detached command execution
//!
//! The runner opens the optional output log, spawns the command in its own
//! process group and hands back as soon as the child exists. It never waits
//! for the command to finish.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatch, ExitState};
use crate::error::{HookError, Result};
use crate::template::ResolvedCommand;

/// How long opening the output log may take before the dispatch fails.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Runner {
    sink_timeout: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_TIMEOUT)
    }
}

/// A command that has been spawned and is running on its own.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub dispatch: Dispatch,
    pub child: Child,
}

impl LaunchedProcess {
    /// Reap the child in the background and log how it ended.
    pub fn supervise(self) -> JoinHandle<ExitState> {
        let LaunchedProcess { dispatch, mut child } = self;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(
                        "Dispatch {} of hook '{}' ({}) exited successfully after {}s",
                        dispatch.id,
                        dispatch.hook,
                        dispatch.command,
                        dispatch.elapsed_secs()
                    );
                    ExitState::Success
                }
                Ok(status) => {
                    warn!(
                        "Dispatch {} of hook '{}' ({}) exited with {} after {}s",
                        dispatch.id,
                        dispatch.hook,
                        dispatch.command,
                        status,
                        dispatch.elapsed_secs()
                    );
                    ExitState::Failed {
                        code: status.code(),
                    }
                }
                Err(e) => {
                    error!(
                        "Lost track of dispatch {} of hook '{}': {}",
                        dispatch.id, dispatch.hook, e
                    );
                    ExitState::Lost
                }
            }
        })
    }
}

impl Runner {
    pub fn new(sink_timeout: Duration) -> Self {
        Self { sink_timeout }
    }

    /// Launch `command`, sending stdout and stderr to `sink` when given.
    ///
    /// Resolves once the process is running. A sink that cannot be opened
    /// fails the run before anything is spawned.
    pub async fn run(
        &self,
        hook: &str,
        command: &ResolvedCommand,
        sink: Option<&Path>,
    ) -> Result<LaunchedProcess> {
        if command.executable.trim().is_empty() {
            return Err(HookError::InvalidCommand("executable is empty".to_string()));
        }

        let (stdout, stderr) = match sink {
            Some(path) => {
                let file = self.open_sink(path).await?;
                let clone = file.try_clone().map_err(|source| HookError::SinkOpen {
                    path: path.to_path_buf(),
                    source,
                })?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("$ {}", command);
        let child = cmd.spawn().map_err(|source| HookError::Spawn {
            program: command.executable.clone(),
            source,
        })?;

        let dispatch = Dispatch::new(hook, command, child.id())
            .with_log_path(sink.map(|p| p.display().to_string()));
        info!(
            "Dispatch {} launched '{}' (pid {:?})",
            dispatch.id, dispatch.command, dispatch.pid
        );

        Ok(LaunchedProcess { dispatch, child })
    }

    async fn open_sink(&self, path: &Path) -> Result<File> {
        let open = async {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
        };

        match tokio::time::timeout(self.sink_timeout, open).await {
            Ok(Ok(file)) => Ok(file.into_std().await),
            Ok(Err(source)) => Err(HookError::SinkOpen {
                path: PathBuf::from(path),
                source,
            }),
            Err(_) => Err(HookError::SinkTimeout {
                path: PathBuf::from(path),
                timeout: self.sink_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> ResolvedCommand {
        ResolvedCommand::from_command_line(line).unwrap()
    }

    #[tokio::test]
    async fn launches_without_sink() {
        let launched = Runner::default()
            .run("test", &command("true"), None)
            .await
            .expect("spawn");
        assert!(launched.dispatch.pid.is_some());
        assert_eq!(launched.dispatch.hook, "test");
        assert_eq!(launched.dispatch.log_path, None);
        assert_eq!(launched.supervise().await.unwrap(), ExitState::Success);
    }

    #[tokio::test]
    async fn writes_output_to_sink() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let log = dir.path().join("logs").join("deploy.log");

        let launched = Runner::default()
            .run("test", &command("echo deployed main"), Some(&log))
            .await
            .expect("spawn");
        assert_eq!(launched.supervise().await.unwrap(), ExitState::Success);

        let output = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(output, "deployed main\n");
    }

    #[tokio::test]
    async fn sink_is_appended_to() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let log = dir.path().join("deploy.log");
        let runner = Runner::default();

        for word in ["first", "second"] {
            let launched = runner
                .run("test", &command(&format!("echo {word}")), Some(&log))
                .await
                .expect("spawn");
            launched.supervise().await.unwrap();
        }

        let output = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(output, "first\nsecond\n");
    }

    #[tokio::test]
    async fn sink_failure_never_spawns() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = dir.path().join("spawned");
        // a regular file cannot be used as a directory
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let log = blocker.join("deploy.log");

        let cmd = command(&format!("touch {}", marker.display()));
        let err = Runner::default()
            .run("test", &cmd, Some(&log))
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::SinkOpen { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = Runner::default()
            .run("test", &command("definitely-not-a-real-binary-4b1c"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_executable_is_rejected() {
        let cmd = ResolvedCommand {
            executable: String::new(),
            args: vec![],
        };
        let err = Runner::default().run("test", &cmd, None).await.unwrap_err();
        assert!(matches!(err, HookError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_supervised() {
        let launched = Runner::default()
            .run("test", &command("false"), None)
            .await
            .expect("spawn");
        assert_eq!(
            launched.supervise().await.unwrap(),
            ExitState::Failed { code: Some(1) }
        );
    }
}
