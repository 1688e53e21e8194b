// src/core/cycle.rs

use crate::core::events::ExecutionObserver;
use crate::core::registry::{CommandId, CommandRegistry, CycleBody};
use crate::core::resolver::{self, ScheduleError};
use crate::core::store::ParameterStore;
use std::rc::Rc;

/// Everything command execution needs besides the store: the resolved
/// registry, the observer, and the cycle-depth budget. One instance is
/// threaded through a whole run.
pub(crate) struct ExecCtx<'a> {
    pub registry: &'a CommandRegistry,
    pub observer: &'a Rc<dyn ExecutionObserver>,
    pub max_cycle_depth: u32,
}

/// The state machine a cycle instance steps through. `Finalize` is
/// terminal; everything else loops back to `Check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleState {
    Init,
    Check,
    LoopStart,
    RunCommands,
    LoopEnd,
    Finalize,
}

/// Executes one command: the runtime-only requirement check, the action,
/// and the command's cycle (if any), in that order. `depth` counts the
/// enclosing cycle chain; a command reached from a cycle body carries that
/// cycle's depth.
pub(crate) fn execute_command(
    ctx: &ExecCtx<'_>,
    store: &mut ParameterStore,
    id: CommandId,
    depth: u32,
) -> Result<(), ScheduleError> {
    let cmd = ctx.registry.command(id);

    // Runtime-only requirements are deferred until this point, right
    // before the command runs.
    let mut missing = Vec::new();
    for param in &cmd.required_params {
        if store.is_runtime_only(param)?
            && !store.has_value(param)?
            && !store.has_default(param)?
        {
            missing.push(param.clone());
        }
    }
    if !missing.is_empty() {
        return Err(ScheduleError::MissingRequiredParameter {
            command: cmd.name.clone(),
            params: missing,
        });
    }

    ctx.observer.command_started(&cmd.name);
    log::debug!("Executing command '{}'.", cmd.name);

    // The command's own action runs once, before the cycle's init.
    if let Some(action) = &cmd.action {
        action
            .invoke(store)
            .map_err(|source| ScheduleError::ActionFailed {
                command: cmd.name.clone(),
                source,
            })?;
    }

    if let Some(cycle) = &cmd.cycle {
        run_cycle(ctx, store, &cmd.name, cycle, depth + 1)?;
    }

    ctx.observer.command_completed(&cmd.name);
    Ok(())
}

/// Drives one cycle instance through its state machine:
/// `Init -> Check -> {false: Finalize; true: LoopStart -> RunCommands ->
/// LoopEnd -> Check}`. The depth guard fires before `Init`, so no user
/// callback runs for a chain nested too deep.
fn run_cycle(
    ctx: &ExecCtx<'_>,
    store: &mut ParameterStore,
    command: &str,
    cycle: &CycleBody,
    depth: u32,
) -> Result<(), ScheduleError> {
    if depth > ctx.max_cycle_depth {
        return Err(ScheduleError::CycleNestingDepthExceeded {
            command: command.to_string(),
            depth,
            max: ctx.max_cycle_depth,
        });
    }

    let hook = |h: &Option<crate::models::Hook>, store: &mut ParameterStore| match h {
        Some(h) => h.invoke(store).map_err(|source| ScheduleError::ActionFailed {
            command: command.to_string(),
            source,
        }),
        None => Ok(()),
    };

    let mut iterations: u64 = 0;
    let mut state = CycleState::Init;
    loop {
        state = match state {
            CycleState::Init => {
                log::debug!("Cycle of '{}' entering at depth {}.", command, depth);
                hook(&cycle.init, store)?;
                CycleState::Check
            }
            CycleState::Check => {
                let go = cycle
                    .condition
                    .check(store)
                    .map_err(|source| ScheduleError::ActionFailed {
                        command: command.to_string(),
                        source,
                    })?;
                if go {
                    CycleState::LoopStart
                } else {
                    CycleState::Finalize
                }
            }
            CycleState::LoopStart => {
                hook(&cycle.loop_start, store)?;
                CycleState::RunCommands
            }
            CycleState::RunCommands => {
                // An isolated one-phase build over the cycle's own list,
                // re-resolved every iteration.
                let order = resolver::build_cycle_queue(ctx.registry, &cycle.commands)?;
                for member in order {
                    execute_command(ctx, store, member, depth)?;
                }
                CycleState::LoopEnd
            }
            CycleState::LoopEnd => {
                iterations += 1;
                hook(&cycle.loop_end, store)?;
                CycleState::Check
            }
            CycleState::Finalize => {
                hook(&cycle.finalize, store)?;
                log::debug!(
                    "Cycle of '{}' finished after {} iteration(s).",
                    command,
                    iterations
                );
                return Ok(());
            }
        };
    }
}

// MARK: --- UNIT TESTS ---
