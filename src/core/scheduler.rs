// src/core/scheduler.rs

use crate::core::cycle::{self, ExecCtx};
use crate::core::events::ExecutionObserver;
use crate::core::registry::{CommandId, CommandRegistry};
use crate::core::resolver::{self, ExecutionPlan, ScheduleError};
use crate::core::store::ParameterStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Mutable state of one run: the per-phase queues and the open/closed and
/// pending/executed bookkeeping that dynamic enqueues consult.
struct RunState {
    phase_names: Vec<String>,
    phase_index: HashMap<String, usize>,
    queues: Vec<VecDeque<CommandId>>,
    closed: Vec<bool>,
    pending: HashSet<CommandId>,
    executed: HashSet<CommandId>,
}

impl RunState {
    fn from_plan(plan: &ExecutionPlan) -> Self {
        let phase_names: Vec<String> = plan.phases.iter().map(|p| p.phase.clone()).collect();
        let phase_index = phase_names
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();
        let queues: Vec<VecDeque<CommandId>> = plan
            .phases
            .iter()
            .map(|p| p.queue.iter().copied().collect())
            .collect();
        let pending = queues.iter().flatten().copied().collect();
        Self {
            closed: vec![false; phase_names.len()],
            phase_names,
            phase_index,
            queues,
            pending,
            executed: HashSet::new(),
        }
    }
}

/// Drives an execution plan to completion: phases strictly in configured
/// order, each phase drained (including dynamically appended entries)
/// before it closes. An empty phase is skipped with no callbacks. The
/// first failure halts the run; parameter mutations already applied stay
/// applied.
pub fn run(
    registry: &CommandRegistry,
    store: &mut ParameterStore,
    plan: &ExecutionPlan,
    observer: &Rc<dyn ExecutionObserver>,
    max_cycle_depth: u32,
) -> Result<(), ScheduleError> {
    let ctx = ExecCtx {
        registry,
        observer,
        max_cycle_depth,
    };
    let mut st = RunState::from_plan(plan);

    observer.run_started(plan.id);
    for pi in 0..st.queues.len() {
        if st.queues.get(pi).is_none_or(VecDeque::is_empty) {
            // Skipped silently, but closed: late enqueues must fail.
            if let Some(slot) = st.closed.get_mut(pi) {
                *slot = true;
            }
            continue;
        }
        let phase = st.phase_names.get(pi).cloned().unwrap_or_default();
        observer.phase_started(&phase);
        log::debug!("Phase '{}' starting.", phase);

        // Every command queued for this phase validates before the first
        // one executes.
        if let Some(queue) = st.queues.get(pi) {
            resolver::validate_required(registry, store, queue.iter().copied())?;
        }

        while let Some(id) = st.queues.get_mut(pi).and_then(VecDeque::pop_front) {
            st.pending.remove(&id);
            cycle::execute_command(&ctx, store, id, 0)?;
            st.executed.insert(id);

            let next = registry.command(id).next_commands.clone();
            for nid in next {
                enqueue_dynamic(registry, store, &mut st, nid)?;
            }
            sweep_triggers(registry, store, &mut st)?;
        }

        if let Some(slot) = st.closed.get_mut(pi) {
            *slot = true;
        }
        observer.phase_completed(&phase);
        log::debug!("Phase '{}' closed.", phase);
    }
    observer.run_finished(plan.id);
    Ok(())
}

/// Fires triggers armed by parameter mutations during execution. A trigger
/// whose command already ran (or is queued) stays quiet; one whose phase
/// has closed is an error rather than a silent drop.
fn sweep_triggers(
    registry: &CommandRegistry,
    store: &mut ParameterStore,
    st: &mut RunState,
) -> Result<(), ScheduleError> {
    for (param, id) in registry.triggers() {
        if st.pending.contains(id) || st.executed.contains(id) {
            continue;
        }
        if store.has_value(param)? {
            log::debug!(
                "Trigger parameter '{}' fired during execution; enqueueing '{}'.",
                param,
                registry.name_of(*id)
            );
            enqueue_dynamic(registry, store, st, *id)?;
        }
    }
    Ok(())
}

/// Appends a command (with any missing hard prerequisites) to its phase's
/// still-open queue, validates the new entries, and re-runs ordering for
/// each touched queue relative to what remains.
fn enqueue_dynamic(
    registry: &CommandRegistry,
    store: &ParameterStore,
    st: &mut RunState,
    id: CommandId,
) -> Result<(), ScheduleError> {
    let mut order = Vec::new();
    let mut present: HashSet<CommandId> =
        st.pending.union(&st.executed).copied().collect();
    resolver::expand_into(registry, id, &mut order, &mut present);
    if order.is_empty() {
        return Ok(());
    }

    resolver::validate_required(registry, store, order.iter().copied())?;

    let mut touched: HashSet<usize> = HashSet::new();
    for nid in order {
        let cmd = registry.command(nid);
        let Some(&pidx) = st.phase_index.get(&cmd.phase) else {
            unreachable!("phase membership validated at registration");
        };
        if st.closed.get(pidx).copied().unwrap_or(false) {
            return Err(ScheduleError::PhaseClosed {
                command: cmd.name.clone(),
                phase: cmd.phase.clone(),
            });
        }
        if let Some(queue) = st.queues.get_mut(pidx) {
            queue.push_back(nid);
        }
        st.pending.insert(nid);
        touched.insert(pidx);
    }

    for pidx in touched {
        let Some(queue) = st.queues.get_mut(pidx) else {
            continue;
        };
        let members: Vec<CommandId> = queue.iter().copied().collect();
        let sorted = resolver::sort_subset(registry, &members)?;
        *queue = sorted.into_iter().collect();
    }
    Ok(())
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_CYCLE_DEPTH;
    use crate::core::events::ParamChange;
    use crate::models::{
        CommandDefinition, ParamValue, ParameterDefinition, ParameterType, PhaseOrder,
    };
    use std::cell::RefCell;

    /// Records every lifecycle notification as a compact line.
    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl ExecutionObserver for Recorder {
        fn phase_started(&self, phase: &str) {
            self.events.borrow_mut().push(format!("phase+{phase}"));
        }
        fn phase_completed(&self, phase: &str) {
            self.events.borrow_mut().push(format!("phase-{phase}"));
        }
        fn command_started(&self, command: &str) {
            self.events.borrow_mut().push(format!("cmd+{command}"));
        }
        fn command_completed(&self, command: &str) {
            self.events.borrow_mut().push(format!("cmd-{command}"));
        }
        fn parameter_changed(&self, param: &str, change: ParamChange) {
            self.events
                .borrow_mut()
                .push(format!("param:{param}:{change:?}"));
        }
    }

    struct Fixture {
        registry: CommandRegistry,
        store: ParameterStore,
        phases: PhaseOrder,
        recorder: Rc<Recorder>,
        observer: Rc<dyn ExecutionObserver>,
    }

    impl Fixture {
        fn new() -> Self {
            let recorder = Rc::new(Recorder::default());
            let observer: Rc<dyn ExecutionObserver> = recorder.clone();
            let mut store = ParameterStore::new();
            store.set_observer(Some(Rc::clone(&observer)));
            Self {
                registry: CommandRegistry::new(),
                store,
                phases: PhaseOrder::standard(),
                recorder,
                observer,
            }
        }

        fn add(&mut self, def: CommandDefinition) {
            self.registry
                .register(def, &mut self.store, &self.phases, DEFAULT_MAX_CYCLE_DEPTH)
                .expect("registration should succeed");
        }

        fn run(&mut self, invoked: &[&str]) -> Result<(), ScheduleError> {
            let plan =
                resolver::build_queue(&self.registry, &self.store, &self.phases, invoked)?;
            run(
                &self.registry,
                &mut self.store,
                &plan,
                &self.observer,
                DEFAULT_MAX_CYCLE_DEPTH,
            )
        }

        fn events(&self) -> Vec<String> {
            self.recorder.events.borrow().clone()
        }
    }

    #[test]
    fn phases_run_in_order_and_empty_phases_emit_nothing() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("work"));
        fx.add(CommandDefinition::new("prepare").in_phase("setup"));

        fx.run(&["work", "prepare"]).unwrap();
        assert_eq!(
            fx.events(),
            vec![
                "phase+setup",
                "cmd+prepare",
                "cmd-prepare",
                "phase-setup",
                "phase+execution",
                "cmd+work",
                "cmd-work",
                "phase-execution",
            ]
        );
    }

    #[test]
    fn next_commands_append_to_the_open_queue() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("publish"));
        fx.add(CommandDefinition::new("package").then("publish"));
        fx.add(CommandDefinition::new("build").then("package"));

        fx.run(&["build"]).unwrap();
        let commands: Vec<String> = fx
            .events()
            .iter()
            .filter(|e| e.starts_with("cmd+"))
            .cloned()
            .collect();
        assert_eq!(commands, vec!["cmd+build", "cmd+package", "cmd+publish"]);
    }

    #[test]
    fn next_command_in_a_later_phase_runs_there() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("summarize").in_phase("end"));
        fx.add(CommandDefinition::new("work").then("summarize"));

        fx.run(&["work"]).unwrap();
        assert_eq!(
            fx.events(),
            vec![
                "phase+execution",
                "cmd+work",
                "cmd-work",
                "phase-execution",
                "phase+end",
                "cmd+summarize",
                "cmd-summarize",
                "phase-end",
            ]
        );
    }

    #[test]
    fn next_command_into_a_closed_phase_fails() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("too-late").in_phase("setup"));
        fx.add(CommandDefinition::new("work").then("too-late"));

        let err = fx.run(&["work"]).unwrap_err();
        match err {
            ScheduleError::PhaseClosed { command, phase } => {
                assert_eq!(command, "too-late");
                assert_eq!(phase, "setup");
            }
            other => panic!("expected PhaseClosed, got {other:?}"),
        }
    }

    #[test]
    fn trigger_set_during_execution_enqueues_command() {
        let mut fx = Fixture::new();
        fx.add(
            CommandDefinition::new("work").with_action(|store| {
                store.set("report", ParamValue::Flag(true))?;
                Ok(())
            })
            .with_param(ParameterDefinition::new("report", ParameterType::Flag)),
        );
        fx.add(
            CommandDefinition::new("render-report")
                .in_phase("end")
                .triggered_by("report"),
        );

        fx.run(&["work"]).unwrap();
        let commands: Vec<String> = fx
            .events()
            .iter()
            .filter(|e| e.starts_with("cmd+"))
            .cloned()
            .collect();
        assert_eq!(commands, vec!["cmd+work", "cmd+render-report"]);
    }

    #[test]
    fn late_trigger_into_closed_phase_fails() {
        let mut fx = Fixture::new();
        fx.add(
            CommandDefinition::new("work").with_action(|store| {
                store.set("early", ParamValue::Flag(true))?;
                Ok(())
            })
            .with_param(ParameterDefinition::new("early", ParameterType::Flag)),
        );
        fx.add(
            CommandDefinition::new("pre-check")
                .in_phase("setup")
                .triggered_by("early"),
        );

        let err = fx.run(&["work"]).unwrap_err();
        assert!(matches!(err, ScheduleError::PhaseClosed { .. }));
    }

    #[test]
    fn dynamic_append_validates_required_parameters() {
        let mut fx = Fixture::new();
        fx.add(
            CommandDefinition::new("finalize")
                .requires_param("artifact")
                .with_param(ParameterDefinition::new("artifact", ParameterType::Str)),
        );
        fx.add(CommandDefinition::new("work").then("finalize"));

        let err = fx.run(&["work"]).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::MissingRequiredParameter { .. }
        ));
    }

    #[test]
    fn dynamic_append_reorders_against_remaining_queue() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("zeta"));
        fx.add(CommandDefinition::new("omega").goes_after("zeta"));
        fx.add(
            CommandDefinition::new("first")
                .then("omega")
                .goes_before("zeta"),
        );

        fx.run(&["first", "zeta"]).unwrap();
        let commands: Vec<String> = fx
            .events()
            .iter()
            .filter(|e| e.starts_with("cmd+"))
            .cloned()
            .collect();
        assert_eq!(commands, vec!["cmd+first", "cmd+zeta", "cmd+omega"]);
    }

    #[test]
    fn failing_action_halts_the_remainder() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("boom").with_action(|_| anyhow::bail!("exploded")));
        fx.add(CommandDefinition::new("after").goes_after("boom"));

        let err = fx.run(&["boom", "after"]).unwrap_err();
        assert!(matches!(err, ScheduleError::ActionFailed { .. }));
        let commands: Vec<String> = fx
            .events()
            .iter()
            .filter(|e| e.starts_with("cmd+"))
            .cloned()
            .collect();
        // "after" never started.
        assert_eq!(commands, vec!["cmd+boom"]);
    }

    #[test]
    fn parameter_changes_flow_to_the_observer() {
        let mut fx = Fixture::new();
        fx.add(
            CommandDefinition::new("work").with_action(|store| {
                store.set("count", ParamValue::Num(1.0))?;
                store.unset("count")?;
                Ok(())
            })
            .with_param(ParameterDefinition::new("count", ParameterType::Num)),
        );

        fx.run(&["work"]).unwrap();
        let events = fx.events();
        assert!(events.contains(&"param:count:Set".to_string()));
        assert!(events.contains(&"param:count:Unset".to_string()));
    }

    #[test]
    fn already_executed_commands_do_not_requeue() {
        let mut fx = Fixture::new();
        fx.add(CommandDefinition::new("shared"));
        fx.add(CommandDefinition::new("a").then("shared"));
        fx.add(CommandDefinition::new("b").then("shared").goes_after("a"));

        fx.run(&["a", "b"]).unwrap();
        let runs = fx
            .events()
            .iter()
            .filter(|e| *e == "cmd+shared")
            .count();
        assert_eq!(runs, 1);
    }
}
