// src/core/resolver.rs

use crate::core::registry::{CommandId, CommandRegistry, RegistryError};
use crate::core::store::{ParameterStore, StoreError};
use crate::models::PhaseOrder;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;

/// Errors raised while building or driving an execution plan. Everything
/// raised during queue construction prevents any side effect; execution
/// failures halt the remainder of the run.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Circular dependency detected among commands: {}.", .commands.join(" -> "))]
    CircularDependency { commands: Vec<String> },
    #[error("Command '{command}' is missing required parameter(s): {}.", .params.join(", "))]
    MissingRequiredParameter {
        command: String,
        params: Vec<String>,
    },
    #[error("Cannot enqueue command '{command}': phase '{phase}' has already closed.")]
    PhaseClosed { command: String, phase: String },
    #[error("Command '{command}' would run its cycle at depth {depth}; the configured maximum is {max}.")]
    CycleNestingDepthExceeded {
        command: String,
        depth: u32,
        max: u32,
    },
    #[error("Command '{command}' failed: {source}")]
    ActionFailed {
        command: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A per-phase queue of resolved commands, in execution order.
#[derive(Debug, Clone)]
pub struct PhaseQueue {
    /// The phase identifier.
    pub phase: String,
    /// Command handles, ordered by the stable topological sort.
    pub queue: Vec<CommandId>,
}

/// An ordered-by-phase execution plan produced by `build_queue`.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Correlates the plan's lifecycle notifications.
    pub id: uuid::Uuid,
    /// One queue per configured phase, in phase order. Empty queues are
    /// kept so the scheduler can close their phases in order.
    pub phases: Vec<PhaseQueue>,
}

impl ExecutionPlan {
    /// Flattened command order across all phases, mostly useful in tests
    /// and for plan inspection.
    pub fn flattened(&self) -> Vec<CommandId> {
        self.phases.iter().flat_map(|p| p.queue.clone()).collect()
    }
}

/// Expands the invoked commands into a per-phase execution plan:
/// prerequisites auto-enqueue recursively, armed triggers join the set, and
/// each phase's subset is ordered by the constraint graph. The plan is
/// validated against the store before anything executes; an error here
/// means no action has run.
pub fn build_queue(
    registry: &CommandRegistry,
    store: &ParameterStore,
    phases: &PhaseOrder,
    invoked: &[&str],
) -> Result<ExecutionPlan, ScheduleError> {
    let mut order: Vec<CommandId> = Vec::new();
    let mut present: HashSet<CommandId> = HashSet::new();

    for name in invoked {
        let id = registry
            .id_of(name)
            .ok_or_else(|| RegistryError::UnknownCommand {
                name: (*name).to_string(),
            })?;
        if !registry.command(id).invocable {
            return Err(RegistryError::NotInvocable {
                name: (*name).to_string(),
            }
            .into());
        }
        expand_into(registry, id, &mut order, &mut present);
    }

    // Armed triggers: a parameter holding a value enqueues its command.
    // During the initial build every phase is still open.
    for (param, id) in registry.triggers() {
        if !present.contains(id) && store.has_value(param)? {
            log::debug!(
                "Trigger parameter '{}' armed; enqueueing command '{}'.",
                param,
                registry.name_of(*id)
            );
            expand_into(registry, *id, &mut order, &mut present);
        }
    }

    let mut plan_phases = Vec::with_capacity(phases.len());
    for phase in phases.iter() {
        let members: Vec<CommandId> = order
            .iter()
            .copied()
            .filter(|&id| registry.command(id).phase == phase)
            .collect();
        let queue = if members.is_empty() {
            members
        } else {
            sort_subset(registry, &members)?
        };
        plan_phases.push(PhaseQueue {
            phase: phase.to_string(),
            queue,
        });
    }

    // Fail-fast, all-or-nothing: the whole plan validates before any
    // action executes. Runtime-only requirements are exempt here; they are
    // checked immediately before their command runs.
    validate_required(registry, store, order.iter().copied())?;

    let plan = ExecutionPlan {
        id: uuid::Uuid::new_v4(),
        phases: plan_phases,
    };
    log::debug!(
        "Built execution plan {} with {} command(s).",
        plan.id,
        order.len()
    );
    Ok(plan)
}

/// Builds the isolated, one-phase order for a cycle's command list. Hard
/// prerequisites still auto-enqueue; phases and triggers do not apply
/// inside a cycle.
pub(crate) fn build_cycle_queue(
    registry: &CommandRegistry,
    members: &[CommandId],
) -> Result<Vec<CommandId>, ScheduleError> {
    let mut order = Vec::with_capacity(members.len());
    let mut present = HashSet::new();
    for &id in members {
        expand_into(registry, id, &mut order, &mut present);
    }
    sort_subset(registry, &order)
}

/// Depth-first prerequisite expansion: hard dependencies enqueue before
/// their dependents, and a command already present is not duplicated.
pub(crate) fn expand_into(
    registry: &CommandRegistry,
    id: CommandId,
    order: &mut Vec<CommandId>,
    present: &mut HashSet<CommandId>,
) {
    if !present.insert(id) {
        return;
    }
    for &dep in &registry.command(id).require_before {
        expand_into(registry, dep, order, present);
    }
    order.push(id);
}

/// Validates that every non-runtime-only entry of each command's hoisted
/// requirement set holds a value (or declares a default) in the store.
pub(crate) fn validate_required<I>(
    registry: &CommandRegistry,
    store: &ParameterStore,
    ids: I,
) -> Result<(), ScheduleError>
where
    I: IntoIterator<Item = CommandId>,
{
    for id in ids {
        let cmd = registry.command(id);
        let mut missing = Vec::new();
        for param in &cmd.hoisted_required {
            if store.is_runtime_only(param)? {
                continue;
            }
            if !store.has_value(param)? && !store.has_default(param)? {
                missing.push(param.clone());
            }
        }
        if !missing.is_empty() {
            return Err(ScheduleError::MissingRequiredParameter {
                command: cmd.name.clone(),
                params: missing,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// From a `require_before` relationship.
    Hard,
    /// From a `goes_before`/`goes_after` pair with both endpoints present.
    Soft,
}

/// Stable topological sort of one phase's subset. Commands without ordering
/// constraints keep their position in `members` (registration/invocation
/// order); a cycle in the constraint graph names its commands.
pub(crate) fn sort_subset(
    registry: &CommandRegistry,
    members: &[CommandId],
) -> Result<Vec<CommandId>, ScheduleError> {
    let mut graph: StableDiGraph<CommandId, EdgeKind> = StableDiGraph::new();
    let mut node_of: HashMap<CommandId, NodeIndex> = HashMap::with_capacity(members.len());
    for &id in members {
        node_of.insert(id, graph.add_node(id));
    }

    for &id in members {
        let cmd = registry.command(id);
        let Some(&this) = node_of.get(&id) else {
            continue;
        };
        for &dep in &cmd.require_before {
            if let Some(&before) = node_of.get(&dep) {
                graph.add_edge(before, this, EdgeKind::Hard);
            }
        }
        // Soft ordering applies only when both endpoints are in this build.
        for name in &cmd.goes_after {
            if let Some(&before) = registry.id_of(name).and_then(|o| node_of.get(&o)) {
                graph.add_edge(before, this, EdgeKind::Soft);
            }
        }
        for name in &cmd.goes_before {
            if let Some(&after) = registry.id_of(name).and_then(|o| node_of.get(&o)) {
                graph.add_edge(this, after, EdgeKind::Soft);
            }
        }
    }

    // Kahn's algorithm with a deterministic tie-break: among ready nodes,
    // the one earliest in `members` runs first.
    let base_order: HashMap<CommandId, usize> = members
        .iter()
        .enumerate()
        .map(|(pos, &id)| (id, pos))
        .collect();
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.edges_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(&n, _)| {
            let pos = graph
                .node_weight(n)
                .and_then(|id| base_order.get(id))
                .copied()
                .unwrap_or(usize::MAX);
            Reverse((pos, n))
        })
        .collect();

    let mut sorted = Vec::with_capacity(members.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        if let Some(&id) = graph.node_weight(node) {
            sorted.push(id);
        }
        let successors: Vec<NodeIndex> =
            graph.neighbors_directed(node, Direction::Outgoing).collect();
        for succ in successors {
            if let Some(deg) = in_degree.get_mut(&succ) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    let pos = graph
                        .node_weight(succ)
                        .and_then(|id| base_order.get(id))
                        .copied()
                        .unwrap_or(usize::MAX);
                    ready.push(Reverse((pos, succ)));
                }
            }
        }
        // Drop the processed node so the leftover subgraph is exactly the
        // cyclic part when the sort comes up short.
        graph.remove_node(node);
    }

    if sorted.len() == members.len() {
        return Ok(sorted);
    }

    // The leftover subgraph contains the cycle(s); name the commands on
    // the first strongly-connected component larger than a lone node.
    let sccs = petgraph::algo::tarjan_scc(&graph);
    let cyclic = sccs
        .into_iter()
        .find(|scc| {
            scc.len() > 1
                || scc
                    .first()
                    .is_some_and(|&n| graph.find_edge(n, n).is_some())
        })
        .unwrap_or_default();
    let mut commands: Vec<String> = cyclic
        .iter()
        .filter_map(|&n| graph.node_weight(n))
        .map(|&id| registry.name_of(id).to_string())
        .collect();
    commands.sort();
    Err(ScheduleError::CircularDependency { commands })
}

// MARK: --- UNIT TESTS ---
