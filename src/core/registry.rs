// src/core/registry.rs

use crate::core::store::{ParameterStore, StoreError};
use crate::models::{
    CommandDefinition, CommandRef, Condition, CycleDefinition, Hook, PhaseOrder,
};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while registering command definitions.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("A command named '{name}' is already registered.")]
    DuplicateCommand { name: String },
    #[error("No command named '{name}' is registered.")]
    UnknownCommand { name: String },
    #[error("Command '{name}' is not invocable; it only runs as part of its cycle.")]
    NotInvocable { name: String },
    #[error("Command '{command}' references phase '{phase}', which is not in the configured phase order.")]
    UnknownPhase { command: String, phase: String },
    #[error("Custom phase order omits the framework-reserved phase '{phase}'.")]
    ReservedPhaseMissing { phase: String },
    #[error("Cycle member '{member}' declares phase '{found}', but its cycle runs in phase '{expected}'.")]
    CyclePhaseMismatch {
        member: String,
        expected: String,
        found: String,
    },
    #[error("Command '{command}' nests cycles {depth} deep; the configured maximum is {max}.")]
    CycleDepthExceeded {
        command: String,
        depth: u32,
        max: u32,
    },
    #[error("Parameter '{param}' already triggers command '{existing}'; it cannot also trigger '{requested}'.")]
    DuplicateTrigger {
        param: String,
        existing: String,
        requested: String,
    },
    #[error(transparent)]
    Parameter(#[from] StoreError),
}

/// Dense handle to a registered command. Handed out at registration and
/// stable for the registry's lifetime.
pub type CommandId = usize;

/// A fully-resolved command: every name reference from its definition has
/// been turned into a concrete handle, and cycle requirements have been
/// hoisted.
#[derive(Debug)]
pub struct RegisteredCommand {
    /// Unique name.
    pub name: String,
    /// The command's own unit of work.
    pub action: Option<Hook>,
    /// The command's own declared required parameters.
    pub required_params: Vec<String>,
    /// Required parameters including those hoisted from the cycle's
    /// commands, transitively through nested cycles.
    pub hoisted_required: Vec<String>,
    /// Soft-ordering names (applied only when both endpoints are built).
    pub goes_before: Vec<String>,
    /// Soft-ordering names.
    pub goes_after: Vec<String>,
    /// Hard prerequisites.
    pub require_before: Vec<CommandId>,
    /// Commands enqueued after this one completes.
    pub next_commands: Vec<CommandId>,
    /// Parameter whose set auto-enqueues this command.
    pub trigger_param: Option<String>,
    /// The phase this command runs in.
    pub phase: String,
    /// The resolved cycle body, if the command owns one.
    pub cycle: Option<CycleBody>,
    /// Whether the command can be reached by invocation or trigger.
    pub invocable: bool,
    /// Presentation flag.
    pub framework: bool,
    /// Presentation flag.
    pub exclude_from_help: bool,
    /// Presentation description.
    pub desc: Option<String>,
}

/// A resolved cycle: hooks plus the handles of its command list.
#[derive(Debug)]
pub struct CycleBody {
    /// Runs once before the first condition check.
    pub init: Option<Hook>,
    /// The loop condition.
    pub condition: Condition,
    /// Runs at the top of each iteration.
    pub loop_start: Option<Hook>,
    /// Runs at the bottom of each iteration.
    pub loop_end: Option<Hook>,
    /// Runs once after the condition returns false.
    pub finalize: Option<Hook>,
    /// Handles of the cycle's command list, in declaration order.
    pub commands: Vec<CommandId>,
}

/// Holds every resolved command definition. Registration is recursive:
/// inline parameter and command definitions are registered before the
/// command that carries them, so scheduling only ever sees concrete
/// handles.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: Vec<RegisteredCommand>,
    by_name: HashMap<String, CommandId>,
    triggers: Vec<(String, CommandId)>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command definition (and, recursively, everything it
    /// defines inline). Inline parameters land in `store`; `phases`
    /// validates phase references; `max_cycle_depth` bounds static cycle
    /// nesting.
    pub fn register(
        &mut self,
        def: CommandDefinition,
        store: &mut ParameterStore,
        phases: &PhaseOrder,
        max_cycle_depth: u32,
    ) -> Result<CommandId, RegistryError> {
        self.register_internal(def, store, phases, max_cycle_depth, None, 0)
    }

    fn register_internal(
        &mut self,
        def: CommandDefinition,
        store: &mut ParameterStore,
        phases: &PhaseOrder,
        max_cycle_depth: u32,
        forced_phase: Option<&str>,
        cycle_depth: u32,
    ) -> Result<CommandId, RegistryError> {
        if self.by_name.contains_key(&def.name) {
            return Err(RegistryError::DuplicateCommand { name: def.name });
        }

        // Cycle members must run in the cycle's phase; a conflicting
        // declaration is rejected here, at registration.
        let phase = match (forced_phase, &def.phase) {
            (Some(expected), Some(declared)) if declared != expected => {
                return Err(RegistryError::CyclePhaseMismatch {
                    member: def.name,
                    expected: expected.to_string(),
                    found: declared.clone(),
                });
            }
            (Some(expected), _) => expected.to_string(),
            (None, Some(declared)) => declared.clone(),
            (None, None) => phases.default_phase().to_string(),
        };
        if !phases.contains(&phase) {
            return Err(RegistryError::UnknownPhase {
                command: def.name,
                phase,
            });
        }

        for param in def.params {
            store.define(param)?;
        }

        let require_before = self.resolve_refs(
            def.require_before,
            store,
            phases,
            max_cycle_depth,
            forced_phase,
            cycle_depth,
        )?;
        let next_commands = self.resolve_refs(
            def.next_commands,
            store,
            phases,
            max_cycle_depth,
            forced_phase,
            cycle_depth,
        )?;

        let mut hoisted_required = def.required_params.clone();
        let cycle = match def.cycle {
            Some(cycle_def) => Some(self.register_cycle(
                &def.name,
                cycle_def,
                store,
                phases,
                max_cycle_depth,
                &phase,
                cycle_depth,
                &mut hoisted_required,
            )?),
            None => None,
        };

        // Cycle-owned commands are unreachable from the outside.
        let invocable = def.invocable && cycle_depth == 0;

        let id = self.commands.len();
        if let Some(trigger) = &def.trigger_param {
            if invocable {
                store.definition(trigger)?;
                if let Some((_, existing)) = self.triggers.iter().find(|(p, _)| p == trigger) {
                    return Err(RegistryError::DuplicateTrigger {
                        param: trigger.clone(),
                        existing: self.name_of(*existing).to_string(),
                        requested: def.name,
                    });
                }
                self.triggers.push((trigger.clone(), id));
            } else {
                log::debug!(
                    "Ignoring trigger parameter '{}' on cycle-owned command '{}'.",
                    trigger,
                    def.name
                );
            }
        }

        log::debug!("Registered command '{}' in phase '{}'.", def.name, phase);
        self.by_name.insert(def.name.clone(), id);
        self.commands.push(RegisteredCommand {
            name: def.name,
            action: def.action,
            required_params: def.required_params,
            hoisted_required,
            goes_before: def.goes_before,
            goes_after: def.goes_after,
            require_before,
            next_commands,
            trigger_param: def.trigger_param,
            phase,
            cycle,
            invocable,
            framework: def.framework,
            exclude_from_help: def.exclude_from_help,
            desc: def.desc,
        });
        Ok(id)
    }

    fn resolve_refs(
        &mut self,
        refs: Vec<CommandRef>,
        store: &mut ParameterStore,
        phases: &PhaseOrder,
        max_cycle_depth: u32,
        forced_phase: Option<&str>,
        cycle_depth: u32,
    ) -> Result<Vec<CommandId>, RegistryError> {
        refs.into_iter()
            .map(|r| match r {
                CommandRef::Name(name) => {
                    self.by_name
                        .get(&name)
                        .copied()
                        .ok_or(RegistryError::UnknownCommand { name })
                }
                CommandRef::Inline(inner) => self.register_internal(
                    *inner,
                    store,
                    phases,
                    max_cycle_depth,
                    forced_phase,
                    cycle_depth,
                ),
            })
            .collect()
    }

    fn register_cycle(
        &mut self,
        owner: &str,
        cycle: CycleDefinition,
        store: &mut ParameterStore,
        phases: &PhaseOrder,
        max_cycle_depth: u32,
        phase: &str,
        cycle_depth: u32,
        hoisted_required: &mut Vec<String>,
    ) -> Result<CycleBody, RegistryError> {
        let depth = cycle_depth + 1;
        if depth > max_cycle_depth {
            return Err(RegistryError::CycleDepthExceeded {
                command: owner.to_string(),
                depth,
                max: max_cycle_depth,
            });
        }

        let mut commands = Vec::with_capacity(cycle.commands.len());
        for member in cycle.commands {
            let id =
                self.register_internal(member, store, phases, max_cycle_depth, Some(phase), depth)?;
            // Hoist the member's requirements (already transitive through
            // its own nested cycle) into the owner's validation set.
            for param in self.command(id).hoisted_required.clone() {
                if !hoisted_required.contains(&param) {
                    hoisted_required.push(param);
                }
            }
            commands.push(id);
        }

        Ok(CycleBody {
            init: cycle.init,
            condition: cycle.condition,
            loop_start: cycle.loop_start,
            loop_end: cycle.loop_end,
            finalize: cycle.finalize,
            commands,
        })
    }

    // --- LOOKUP ---

    /// The handle of a registered command.
    pub fn id_of(&self, name: &str) -> Option<CommandId> {
        self.by_name.get(name).copied()
    }

    /// The resolved command behind a handle.
    pub fn command(&self, id: CommandId) -> &RegisteredCommand {
        match self.commands.get(id) {
            Some(cmd) => cmd,
            None => unreachable!("command id out of range"),
        }
    }

    /// The name behind a handle.
    pub fn name_of(&self, id: CommandId) -> &str {
        &self.command(id).name
    }

    /// Iterates all registered commands in registration order.
    pub fn commands(&self) -> impl Iterator<Item = &RegisteredCommand> {
        self.commands.iter()
    }

    /// The trigger table: parameter name to command handle, in registration
    /// order.
    pub fn triggers(&self) -> &[(String, CommandId)] {
        &self.triggers
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// MARK: --- UNIT TESTS ---
