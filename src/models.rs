// src/models.rs

use crate::constants::{DEFAULT_PHASE_ORDER, PHASE_EXECUTION, RESERVED_PHASES};
use crate::core::registry::RegistryError;
use crate::core::store::ParameterStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

// --- PARAMETER VALUE MODEL ---
// These are the primary structures used both at runtime and for the
// serialization of persisted parameter documents (bind name -> value).

/// A typed parameter value. Mappings are ordered so that persisted documents
/// serialize deterministically; map values recurse to support deep merges.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    /// A boolean flag.
    Flag(bool),
    /// A numeric value.
    Num(f64),
    /// A free-form string.
    Str(String),
    /// An ordered sequence of strings.
    Seq(Vec<String>),
    /// A key-value mapping. Values recurse for nested documents.
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// The declared type this value satisfies.
    pub fn kind(&self) -> ParameterType {
        match self {
            Self::Str(_) => ParameterType::Str,
            Self::Num(_) => ParameterType::Num,
            Self::Flag(_) => ParameterType::Flag,
            Self::Seq(_) => ParameterType::Seq,
            Self::Map(_) => ParameterType::Map,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Num(n) => write!(f, "{}", n),
            Self::Flag(b) => write!(f, "{}", b),
            Self::Seq(items) => write!(f, "[{}]", items.join(", ")),
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// The declared type of a parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// Free-form string. Unset value: the empty string.
    Str,
    /// Numeric. Unset value: `0`.
    Num,
    /// Boolean flag. Unset value: `false`.
    Flag,
    /// Ordered sequence of strings. Unset value: the empty sequence.
    Seq,
    /// Key-value mapping. Unset value: the empty mapping.
    Map,
}

impl ParameterType {
    /// The typed zero value returned by non-strict `get` when a parameter
    /// is unset and declares no default.
    pub fn zero_value(self) -> ParamValue {
        match self {
            Self::Str => ParamValue::Str(String::new()),
            Self::Num => ParamValue::Num(0.0),
            Self::Flag => ParamValue::Flag(false),
            Self::Seq => ParamValue::Seq(Vec::new()),
            Self::Map => ParamValue::Map(BTreeMap::new()),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Str => "string",
            Self::Num => "numeric",
            Self::Flag => "flag",
            Self::Seq => "sequence",
            Self::Map => "mapping",
        };
        write!(f, "{}", name)
    }
}

/// Persistence classification of a parameter. The store only classifies;
/// reading and writing the persisted document is the host's job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    /// Persisted in every snapshot scope.
    Always,
    /// Never persisted.
    #[default]
    Never,
    /// Persisted only into the user configuration document.
    UserConfigOnly,
}

/// What `set` does to the other members of a switch group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchPolicy {
    /// Fail if any other group member currently holds a value.
    #[default]
    Reject,
    /// Unset every other group member first.
    UnsetOthers,
    /// Reset every other group member (to its default, or unset) first.
    ResetOthers,
}

/// How `join` merges two mapping values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Top-level keys only; nested maps are replaced wholesale.
    #[default]
    Shallow,
    /// Nested maps are merged key-by-key, recursively.
    Deep,
}

/// How mapping-merge key collisions are resolved.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The incoming value wins.
    #[default]
    MostRecentWins,
    /// The existing value wins.
    OldestWins,
    /// A collision is an error.
    Fail,
}

// --- PARAMETER DEFINITIONS ---

/// Declares a parameter: its storage key, type, CLI aliases and the rules
/// the store enforces on every mutation. Immutable once registered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    /// Unique registry key.
    pub name: String,
    /// Storage key; defaults to `name`.
    pub bind_name: Option<String>,
    /// Declared type.
    pub ty: ParameterType,
    /// CLI tokens resolving to this parameter. May be empty, in which case
    /// the parameter is settable only programmatically.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Value restored by `reset` and returned by `get` when unset.
    #[serde(default)]
    pub default: Option<ParamValue>,
    /// Validated before the owning command's phase executes.
    #[serde(default)]
    pub required: bool,
    /// Excluded from persistence and pre-execution validation; checked only
    /// immediately before the command using it runs.
    #[serde(default)]
    pub runtime_only: bool,
    /// Persistence classification.
    #[serde(default)]
    pub persistence: Persistence,
    /// Names of parameters mutually exclusive with this one.
    #[serde(default)]
    pub switch_group: Vec<String>,
    /// Behavior applied to the group when this parameter is set.
    #[serde(default)]
    pub switch_policy: SwitchPolicy,
    /// Restricted value set. String and sequence values match
    /// case-insensitively and are normalized to the declared casing.
    #[serde(default)]
    pub allowed_values: Option<Vec<ParamValue>>,
    /// Write-once: mutation fails while a value is held.
    #[serde(default)]
    pub immutable: bool,
    /// Separator used by `join` on string parameters.
    #[serde(default)]
    pub join_separator: Option<String>,
    /// Mapping accumulation strategy.
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Mapping accumulation collision policy.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Human-readable description, used only for help rendering.
    #[serde(default)]
    pub desc: Option<String>,
}

impl ParameterDefinition {
    /// Starts a definition with the given name and type; everything else
    /// takes its default.
    pub fn new(name: impl Into<String>, ty: ParameterType) -> Self {
        Self {
            name: name.into(),
            bind_name: None,
            ty,
            aliases: Vec::new(),
            default: None,
            required: false,
            runtime_only: false,
            persistence: Persistence::default(),
            switch_group: Vec::new(),
            switch_policy: SwitchPolicy::default(),
            allowed_values: None,
            immutable: false,
            join_separator: None,
            merge_strategy: MergeStrategy::default(),
            conflict_policy: ConflictPolicy::default(),
            desc: None,
        }
    }

    /// Overrides the storage key.
    pub fn with_bind_name(mut self, bind: impl Into<String>) -> Self {
        self.bind_name = Some(bind.into());
        self
    }

    /// Adds a CLI alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Declares the default value.
    pub fn with_default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Marks the parameter as required by validation.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the parameter as runtime-only.
    pub fn runtime_only(mut self) -> Self {
        self.runtime_only = true;
        self.persistence = Persistence::Never;
        self
    }

    /// Sets the persistence classification.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Declares the parameters mutually exclusive with this one and the
    /// policy applied when this one is set.
    pub fn with_switch_group<I, S>(mut self, members: I, policy: SwitchPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.switch_group = members.into_iter().map(Into::into).collect();
        self.switch_policy = policy;
        self
    }

    /// Restricts the accepted values.
    pub fn with_allowed_values<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = ParamValue>,
    {
        self.allowed_values = Some(values.into_iter().collect());
        self
    }

    /// Makes the parameter write-once.
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Overrides the string-join separator.
    pub fn with_join_separator(mut self, sep: impl Into<String>) -> Self {
        self.join_separator = Some(sep.into());
        self
    }

    /// Configures mapping accumulation.
    pub fn with_merge(mut self, strategy: MergeStrategy, conflicts: ConflictPolicy) -> Self {
        self.merge_strategy = strategy;
        self.conflict_policy = conflicts;
        self
    }

    /// Attaches a description for help rendering.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// The storage key values are kept under.
    pub fn bind(&self) -> &str {
        self.bind_name.as_deref().unwrap_or(&self.name)
    }
}

// --- CALLABLE HANDLES ---
// Command actions and cycle hooks are stored as concrete handles resolved at
// registration, never dispatched by name at call time. Execution is strictly
// single-threaded, so a non-atomic reference count suffices.

/// A zero-argument unit of work over the parameter store.
#[derive(Clone)]
pub struct Hook(Rc<dyn Fn(&mut ParameterStore) -> anyhow::Result<()>>);

impl Hook {
    /// Wraps a closure as a stored handle.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        Self(Rc::new(f))
    }

    /// Runs the unit of work.
    pub fn invoke(&self, store: &mut ParameterStore) -> anyhow::Result<()> {
        (self.0)(store)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

/// A zero-argument predicate over the parameter store, used as a cycle's
/// loop condition.
#[derive(Clone)]
pub struct Condition(Rc<dyn Fn(&mut ParameterStore) -> anyhow::Result<bool>>);

impl Condition {
    /// Wraps a closure as a stored handle.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<bool> + 'static,
    {
        Self(Rc::new(f))
    }

    /// Evaluates the predicate.
    pub fn check(&self, store: &mut ParameterStore) -> anyhow::Result<bool> {
        (self.0)(store)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Condition(..)")
    }
}

// --- COMMAND DEFINITIONS ---

/// A reference to another command: either by name, or as a full inline
/// definition registered recursively before the referencing command.
#[derive(Debug, Clone)]
pub enum CommandRef {
    /// Reference to an already-registered command.
    Name(String),
    /// A full definition, registered eagerly when the outer command is.
    Inline(Box<CommandDefinition>),
}

impl From<&str> for CommandRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for CommandRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<CommandDefinition> for CommandRef {
    fn from(def: CommandDefinition) -> Self {
        Self::Inline(Box::new(def))
    }
}

/// Declares a command: its action, scheduling constraints, phase, and an
/// optional cycle. Immutable once registered.
#[derive(Debug, Clone)]
pub struct CommandDefinition {
    /// Unique registry key.
    pub name: String,
    /// The command's own unit of work. Runs once; for cycle-owning commands,
    /// before the cycle's `init`.
    pub action: Option<Hook>,
    /// Parameter names validated before execution.
    pub required_params: Vec<String>,
    /// Soft ordering: this command sorts before the named ones, when both
    /// are in the same per-phase build.
    pub goes_before: Vec<String>,
    /// Soft ordering: this command sorts after the named ones.
    pub goes_after: Vec<String>,
    /// Hard prerequisites, auto-enqueued when missing from the build.
    pub require_before: Vec<CommandRef>,
    /// Commands auto-enqueued after this one completes.
    pub next_commands: Vec<CommandRef>,
    /// Setting this parameter auto-enqueues the command.
    pub trigger_param: Option<String>,
    /// Phase identifier; defaults to the execution phase.
    pub phase: Option<String>,
    /// Optional repeat-loop owned by this command.
    pub cycle: Option<CycleDefinition>,
    /// Whether the command can be invoked by name or trigger. Forced false
    /// for cycle-owned commands.
    pub invocable: bool,
    /// Presentation flag: the command belongs to the framework itself.
    pub framework: bool,
    /// Presentation flag: hidden from help listings.
    pub exclude_from_help: bool,
    /// Parameters registered together with this command.
    pub params: Vec<ParameterDefinition>,
    /// Human-readable description, used only for help rendering.
    pub desc: Option<String>,
}

impl CommandDefinition {
    /// Starts a definition with the given name; everything else takes its
    /// default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
            required_params: Vec::new(),
            goes_before: Vec::new(),
            goes_after: Vec::new(),
            require_before: Vec::new(),
            next_commands: Vec::new(),
            trigger_param: None,
            phase: None,
            cycle: None,
            invocable: true,
            framework: false,
            exclude_from_help: false,
            params: Vec::new(),
            desc: None,
        }
    }

    /// Attaches the command's unit of work.
    pub fn with_action<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        self.action = Some(Hook::new(f));
        self
    }

    /// Declares a parameter that must hold a value before execution.
    pub fn requires_param(mut self, name: impl Into<String>) -> Self {
        self.required_params.push(name.into());
        self
    }

    /// Soft ordering: sort before the named command when both are built.
    pub fn goes_before(mut self, name: impl Into<String>) -> Self {
        self.goes_before.push(name.into());
        self
    }

    /// Soft ordering: sort after the named command when both are built.
    pub fn goes_after(mut self, name: impl Into<String>) -> Self {
        self.goes_after.push(name.into());
        self
    }

    /// Hard prerequisite: auto-enqueued before this command when missing.
    pub fn require_before(mut self, dep: impl Into<CommandRef>) -> Self {
        self.require_before.push(dep.into());
        self
    }

    /// Auto-enqueue the referenced command after this one completes.
    pub fn then(mut self, next: impl Into<CommandRef>) -> Self {
        self.next_commands.push(next.into());
        self
    }

    /// Auto-enqueue this command whenever the named parameter is set.
    pub fn triggered_by(mut self, param: impl Into<String>) -> Self {
        self.trigger_param = Some(param.into());
        self
    }

    /// Binds the command to a phase.
    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Attaches a cycle.
    pub fn with_cycle(mut self, cycle: CycleDefinition) -> Self {
        self.cycle = Some(cycle);
        self
    }

    /// Registers a parameter together with this command.
    pub fn with_param(mut self, param: ParameterDefinition) -> Self {
        self.params.push(param);
        self
    }

    /// Marks the command as framework-owned (presentation only).
    pub fn framework(mut self) -> Self {
        self.framework = true;
        self
    }

    /// Hides the command from help listings (presentation only).
    pub fn exclude_from_help(mut self) -> Self {
        self.exclude_from_help = true;
        self
    }

    /// Attaches a description for help rendering.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }
}

/// A repeat-loop attached to a command. All hooks are optional except the
/// loop condition; the command list may nest further cycles.
#[derive(Debug, Clone)]
pub struct CycleDefinition {
    /// Runs once, before the first condition check.
    pub init: Option<Hook>,
    /// Checked before every iteration; `false` ends the loop.
    pub condition: Condition,
    /// Runs at the top of every iteration.
    pub loop_start: Option<Hook>,
    /// Runs at the bottom of every iteration.
    pub loop_end: Option<Hook>,
    /// Runs exactly once, after the condition first returns `false`.
    pub finalize: Option<Hook>,
    /// The cycle's own command list, resolved as an isolated one-phase
    /// build each iteration.
    pub commands: Vec<CommandDefinition>,
}

impl CycleDefinition {
    /// Starts a cycle with the given loop condition.
    pub fn new<F>(condition: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<bool> + 'static,
    {
        Self {
            init: None,
            condition: Condition::new(condition),
            loop_start: None,
            loop_end: None,
            finalize: None,
            commands: Vec::new(),
        }
    }

    /// Attaches the init hook.
    pub fn on_init<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        self.init = Some(Hook::new(f));
        self
    }

    /// Attaches the loop-start hook.
    pub fn on_loop_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        self.loop_start = Some(Hook::new(f));
        self
    }

    /// Attaches the loop-end hook.
    pub fn on_loop_end<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        self.loop_end = Some(Hook::new(f));
        self
    }

    /// Attaches the finalize hook.
    pub fn on_finalize<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ParameterStore) -> anyhow::Result<()> + 'static,
    {
        self.finalize = Some(Hook::new(f));
        self
    }

    /// Adds a command to the cycle's list.
    pub fn with_command(mut self, def: CommandDefinition) -> Self {
        self.commands.push(def);
        self
    }
}

// --- PHASE ORDER ---

/// An ordered sequence of phase identifiers. All commands in one phase run
/// before any command in the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOrder {
    phases: Vec<String>,
}

impl PhaseOrder {
    /// The built-in order: setup, cleanup, execution, teardown, end.
    pub fn standard() -> Self {
        Self {
            phases: DEFAULT_PHASE_ORDER.iter().map(ToString::to_string).collect(),
        }
    }

    /// A host-supplied order. The framework-reserved phases must be present
    /// by value, or framework-level commands bound to them cannot schedule.
    pub fn custom<I, S>(phases: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phases: Vec<String> = phases.into_iter().map(Into::into).collect();
        for reserved in RESERVED_PHASES {
            if !phases.iter().any(|p| p == reserved) {
                return Err(RegistryError::ReservedPhaseMissing {
                    phase: (*reserved).to_string(),
                });
            }
        }
        Ok(Self { phases })
    }

    /// The default phase assigned to commands that declare none.
    pub fn default_phase(&self) -> &str {
        // Custom orders keep "execution" as the default when they carry it;
        // otherwise the first phase after setup is the execution stage.
        if self.phases.iter().any(|p| p == PHASE_EXECUTION) {
            PHASE_EXECUTION
        } else {
            self.phases
                .iter()
                .position(|p| p == crate::constants::PHASE_SETUP)
                .and_then(|i| self.phases.get(i + 1))
                .or_else(|| self.phases.first())
                .map_or(PHASE_EXECUTION, String::as_str)
        }
    }

    /// Whether the identifier is part of this order.
    pub fn contains(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p == phase)
    }

    /// Iterates the identifiers in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(String::as_str)
    }

    /// Number of phases in the order.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Whether the order is empty.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

impl Default for PhaseOrder {
    fn default() -> Self {
        Self::standard()
    }
}

// MARK: --- UNIT TESTS ---
