// src/core/events.rs

use colored::*;
use uuid::Uuid;

/// What happened to a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamChange {
    /// A value was stored, replacing any previous one.
    Set,
    /// A value was accumulated into an existing one.
    Joined,
    /// The value was removed.
    Unset,
    /// The value was restored to the declared default.
    Reset,
}

/// Structured lifecycle notifications emitted while a run executes.
///
/// All notifications are advisory: implementations can observe them for
/// logging or progress display, but nothing they do affects control flow.
/// Every method has a no-op default, so observers implement only what they
/// care about.
pub trait ExecutionObserver {
    /// A run (one built queue) is starting.
    fn run_started(&self, _run: Uuid) {}

    /// The run finished; all phases are closed.
    fn run_finished(&self, _run: Uuid) {}

    /// A non-empty phase is about to drain its queue.
    fn phase_started(&self, _phase: &str) {}

    /// The phase's queue is exhausted and the phase is now closed.
    fn phase_completed(&self, _phase: &str) {}

    /// A command is about to execute.
    fn command_started(&self, _command: &str) {}

    /// The command's action (and cycle, if any) completed.
    fn command_completed(&self, _command: &str) {}

    /// A parameter value changed in the store.
    fn parameter_changed(&self, _param: &str, _change: ParamChange) {}
}

/// The default observer: forwards lifecycle notifications to the `log`
/// crate. Command and phase transitions log at info, parameter changes at
/// debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ExecutionObserver for LogObserver {
    fn run_started(&self, run: Uuid) {
        log::info!("Run {} started.", run);
    }

    fn run_finished(&self, run: Uuid) {
        log::info!("Run {} finished.", run);
    }

    fn phase_started(&self, phase: &str) {
        log::info!("{} phase '{}'", "▶".blue(), phase.cyan());
    }

    fn phase_completed(&self, phase: &str) {
        log::info!("{} phase '{}'", "✓".green(), phase.cyan());
    }

    fn command_started(&self, command: &str) {
        log::info!("{} {}", "→".blue(), command.green());
    }

    fn command_completed(&self, command: &str) {
        log::debug!("Command '{}' completed.", command);
    }

    fn parameter_changed(&self, param: &str, change: ParamChange) {
        log::debug!("Parameter '{}' changed: {:?}.", param, change);
    }
}

// MARK: --- UNIT TESTS ---
