// External tool invocation
//
// Every delegated stage (COLMAP, git, pip, the training script) is described
// as a ToolInvocation and executed through a ToolRunner, so invocation
// sequences can be inspected without spawning processes.

use crate::error::StageError;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Human-readable step name used in logs and errors.
    pub step: String,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(step: impl Into<String>, program: impl AsRef<OsStr>) -> Self {
        Self {
            step: step.into(),
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append `flag value`.
    pub fn opt(self, flag: &str, value: impl AsRef<OsStr>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args_lossy());
        parts.join(" ")
    }

    /// Value following `flag`, if present.
    pub fn value_of(&self, flag: &str) -> Option<String> {
        let args = self.args_lossy();
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

impl ToolOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
        }
    }
}

pub trait ToolRunner {
    /// Run to completion. Spawn failures are errors; exit codes are reported, not judged.
    fn run(&mut self, invocation: &ToolInvocation) -> Result<ToolOutcome, StageError>;
}

/// Blocking child processes with inherited stdio and no timeout.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&mut self, invocation: &ToolInvocation) -> Result<ToolOutcome, StageError> {
        tracing::info!("{}: {}", invocation.step, invocation.command_line());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let status = cmd.status().map_err(|source| StageError::Spawn {
            program: invocation.program.to_string_lossy().into_owned(),
            source,
        })?;

        Ok(ToolOutcome {
            success: status.success(),
            code: status.code(),
        })
    }
}

/// Run and turn a non-zero exit into [`StageError::ToolFailed`].
pub fn run_checked<T: ToolRunner + ?Sized>(
    runner: &mut T,
    invocation: &ToolInvocation,
) -> Result<(), StageError> {
    let outcome = runner.run(invocation)?;
    if outcome.success {
        Ok(())
    } else {
        tracing::error!(
            "{} failed (exit code {:?})",
            invocation.step,
            outcome.code
        );
        Err(StageError::ToolFailed {
            step: invocation.step.clone(),
            code: outcome.code,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    type Hook = Box<dyn FnMut(&ToolInvocation) -> ToolOutcome>;

    /// Records invocations instead of spawning them.
    pub(crate) struct RecordingRunner {
        pub calls: Vec<ToolInvocation>,
        hook: Option<Hook>,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            Self {
                calls: Vec::new(),
                hook: None,
            }
        }

        /// Decide each outcome (and simulate side effects) with `hook`.
        pub(crate) fn with_hook(
            hook: impl FnMut(&ToolInvocation) -> ToolOutcome + 'static,
        ) -> Self {
            Self {
                calls: Vec::new(),
                hook: Some(Box::new(hook)),
            }
        }

        pub(crate) fn steps(&self) -> Vec<String> {
            self.calls.iter().map(|c| c.step.clone()).collect()
        }
    }

    impl ToolRunner for RecordingRunner {
        fn run(&mut self, invocation: &ToolInvocation) -> Result<ToolOutcome, StageError> {
            self.calls.push(invocation.clone());
            Ok(match self.hook.as_mut() {
                Some(hook) => hook(invocation),
                None => ToolOutcome::ok(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let inv = ToolInvocation::new("Matching", "colmap")
            .arg("exhaustive_matcher")
            .opt("--database_path", "/tmp/db.db");
        assert_eq!(
            inv.command_line(),
            "colmap exhaustive_matcher --database_path /tmp/db.db"
        );
        assert_eq!(inv.value_of("--database_path").as_deref(), Some("/tmp/db.db"));
        assert_eq!(inv.value_of("--missing"), None);
    }

    #[test]
    fn test_run_checked_reports_exit_code() {
        let mut runner = RecordingRunner::with_hook(|_| ToolOutcome::failed(3));
        let inv = ToolInvocation::new("Mapping", "colmap");
        match run_checked(&mut runner, &inv) {
            Err(StageError::ToolFailed { step, code }) => {
                assert_eq!(step, "Mapping");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_system_runner_spawn_failure() {
        let inv = ToolInvocation::new("Missing tool", "splat-pipeline-no-such-binary");
        assert!(matches!(
            SystemRunner.run(&inv),
            Err(StageError::Spawn { .. })
        ));
    }
}
