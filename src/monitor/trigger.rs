//! No-progress escalation hooks
//!
//! When a worker has made no progress for the trigger threshold, the monitor
//! hands a [`NoProgressEvent`] to a [`TriggerHook`] on a separate thread and
//! applies the returned [`EscalationOutcome`]. While a hook runs, the job's
//! grace period does not expire.

use crate::config::TriggerAction;
use crate::job::{JobId, OpKind};
use std::process::Command;
use std::time::Duration;
use tracing::{error, info};

/// A worker that stopped making progress
#[derive(Debug, Clone)]
pub struct NoProgressEvent {
    pub job: JobId,
    pub tag: Option<String>,
    pub thread: String,
    pub device: String,
    pub stalled: Duration,
    /// Device call the worker is blocked in, if any
    pub op: Option<OpKind>,
    pub record: Option<u64>,
    pub offset: Option<u64>,
}

/// What to do about a hung worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    Continue,
    /// Stop the job
    TerminateJob,
    /// Leave everything as it is for inspection; the monitor stops acting
    Wedge,
    /// Terminate every job in the process
    AbortProcess,
}

impl From<TriggerAction> for EscalationOutcome {
    fn from(action: TriggerAction) -> Self {
        match action {
            TriggerAction::Continue => EscalationOutcome::Continue,
            TriggerAction::Terminate => EscalationOutcome::TerminateJob,
            TriggerAction::Wedge => EscalationOutcome::Wedge,
            TriggerAction::Abort => EscalationOutcome::AbortProcess,
        }
    }
}

pub trait TriggerHook: Send + Sync {
    fn escalate(&self, event: &NoProgressEvent) -> EscalationOutcome;
}

/// Fixed outcome from the configured trigger action
#[derive(Debug, Clone, Copy)]
pub struct ActionHook(pub TriggerAction);

impl TriggerHook for ActionHook {
    fn escalate(&self, _event: &NoProgressEvent) -> EscalationOutcome {
        self.0.into()
    }
}

/// Runs a shell command; its exit status picks the outcome
///
/// 0 continues, 1 terminates the job, 2 wedges, anything else aborts. A
/// command that cannot be started falls back to the configured action.
#[derive(Debug, Clone)]
pub struct CommandHook {
    cmd: String,
    fallback: TriggerAction,
}

impl CommandHook {
    pub fn new(cmd: impl Into<String>, fallback: TriggerAction) -> Self {
        Self {
            cmd: cmd.into(),
            fallback,
        }
    }
}

impl TriggerHook for CommandHook {
    fn escalate(&self, event: &NoProgressEvent) -> EscalationOutcome {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.cmd)
            .env("IOVET_JOB", event.job.to_string())
            .env("IOVET_TAG", event.tag.as_deref().unwrap_or(""))
            .env("IOVET_THREAD", &event.thread)
            .env("IOVET_DEVICE", &event.device)
            .env("IOVET_STALLED", event.stalled.as_secs().to_string())
            .env("IOVET_OP", event.op.map(|op| op.to_string()).unwrap_or_default())
            .env("IOVET_RECORD", event.record.map(|r| r.to_string()).unwrap_or_default())
            .env("IOVET_OFFSET", event.offset.map(|o| o.to_string()).unwrap_or_default())
            .status();
        match status {
            Ok(status) => {
                info!(job = event.job, cmd = %self.cmd, %status, "trigger command finished");
                match status.code() {
                    Some(0) => EscalationOutcome::Continue,
                    Some(1) => EscalationOutcome::TerminateJob,
                    Some(2) => EscalationOutcome::Wedge,
                    _ => EscalationOutcome::AbortProcess,
                }
            }
            Err(e) => {
                error!(job = event.job, cmd = %self.cmd, error = %e, "trigger command could not run");
                self.fallback.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NoProgressEvent {
        NoProgressEvent {
            job: 1,
            tag: None,
            thread: "t0".into(),
            device: "vol".into(),
            stalled: Duration::from_secs(5),
            op: Some(OpKind::Read),
            record: Some(3),
            offset: Some(12288),
        }
    }

    #[test]
    fn test_action_hook() {
        assert_eq!(ActionHook(TriggerAction::Wedge).escalate(&event()), EscalationOutcome::Wedge);
        assert_eq!(ActionHook(TriggerAction::Continue).escalate(&event()), EscalationOutcome::Continue);
    }

    #[test]
    fn test_command_exit_status() {
        let cases = [
            ("exit 0", EscalationOutcome::Continue),
            ("exit 1", EscalationOutcome::TerminateJob),
            ("exit 2", EscalationOutcome::Wedge),
            ("exit 9", EscalationOutcome::AbortProcess),
        ];
        for (cmd, expected) in cases {
            let hook = CommandHook::new(cmd, TriggerAction::Continue);
            assert_eq!(hook.escalate(&event()), expected, "{}", cmd);
        }
    }

    #[test]
    fn test_command_sees_event() {
        let hook = CommandHook::new(r#"test "$IOVET_THREAD" = t0 && test "$IOVET_STALLED" = 5"#, TriggerAction::Abort);
        assert_eq!(hook.escalate(&event()), EscalationOutcome::Continue);

        let hook = CommandHook::new(
            r#"test "$IOVET_OP" = read && test "$IOVET_RECORD" = 3 && test "$IOVET_OFFSET" = 12288"#,
            TriggerAction::Abort,
        );
        assert_eq!(hook.escalate(&event()), EscalationOutcome::Continue);
    }
}
