// src/app.rs

use crate::constants::DEFAULT_MAX_CYCLE_DEPTH;
use crate::core::binder;
use crate::core::events::{ExecutionObserver, LogObserver};
use crate::core::registry::{CommandRegistry, RegistryError};
use crate::core::resolver::{self, ExecutionPlan, ScheduleError};
use crate::core::scheduler;
use crate::core::store::{ParameterStore, PersistenceScope, StoreError};
use crate::models::{
    CommandDefinition, ParamValue, ParameterDefinition, ParameterType, Persistence, PhaseOrder,
};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Read-only command metadata for the presentation collaborator.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Command name.
    pub name: String,
    /// Description, when declared.
    pub desc: Option<String>,
    /// The phase the command runs in.
    pub phase: String,
    /// The command's own declared required parameters.
    pub required_params: Vec<String>,
    /// Whether the command belongs to the framework itself.
    pub framework: bool,
    /// Whether the command is hidden from help listings.
    pub exclude_from_help: bool,
    /// Whether the command can be invoked by name.
    pub invocable: bool,
}

/// Read-only parameter metadata for the presentation collaborator.
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    /// Parameter name.
    pub name: String,
    /// Storage key.
    pub bind_name: String,
    /// Declared type.
    pub ty: ParameterType,
    /// CLI aliases.
    pub aliases: Vec<String>,
    /// Whether validation requires a value.
    pub required: bool,
    /// Names of mutually-exclusive parameters.
    pub switch_group: Vec<String>,
    /// Persistence classification.
    pub persistence: Persistence,
    /// Description, when declared.
    pub desc: Option<String>,
}

/// The explicit context object owning everything one application instance
/// needs: the parameter store, the command registry, the phase order and
/// the lifecycle observer. Hosts construct one per process (or per test),
/// describe their commands and parameters as data, and call `run`.
///
/// There is deliberately no process-global state: two `Application` values
/// are fully independent.
pub struct Application {
    store: ParameterStore,
    registry: CommandRegistry,
    phases: PhaseOrder,
    max_cycle_depth: u32,
    observer: Rc<dyn ExecutionObserver>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("store", &self.store)
            .field("commands", &self.registry.len())
            .field("phases", &self.phases)
            .field("max_cycle_depth", &self.max_cycle_depth)
            .finish_non_exhaustive()
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    /// An application with the standard phase order, the default cycle
    /// depth limit, and log-backed lifecycle notifications.
    pub fn new() -> Self {
        let observer: Rc<dyn ExecutionObserver> = Rc::new(LogObserver);
        let mut store = ParameterStore::new();
        store.set_observer(Some(Rc::clone(&observer)));
        Self {
            store,
            registry: CommandRegistry::new(),
            phases: PhaseOrder::standard(),
            max_cycle_depth: DEFAULT_MAX_CYCLE_DEPTH,
            observer,
        }
    }

    /// Replaces the phase order. Construct custom orders through
    /// `PhaseOrder::custom`, which enforces the reserved phases.
    pub fn with_phase_order(mut self, phases: PhaseOrder) -> Self {
        self.phases = phases;
        self
    }

    /// Overrides the cycle nesting limit.
    pub fn with_max_cycle_depth(mut self, max: u32) -> Self {
        self.max_cycle_depth = max;
        self
    }

    /// Installs a lifecycle observer, replacing the log-backed default.
    pub fn with_observer(mut self, observer: Rc<dyn ExecutionObserver>) -> Self {
        self.store.set_observer(Some(Rc::clone(&observer)));
        self.observer = observer;
        self
    }

    // --- SETUP ---

    /// Registers a parameter definition.
    pub fn define_parameter(&mut self, def: ParameterDefinition) -> Result<(), StoreError> {
        self.store.define(def)
    }

    /// Registers a command definition, recursively registering everything
    /// it defines inline.
    pub fn register_command(&mut self, def: CommandDefinition) -> Result<(), RegistryError> {
        self.registry
            .register(def, &mut self.store, &self.phases, self.max_cycle_depth)
            .map(|_| ())
    }

    // --- PARAMETER ACCESS ---

    /// The store itself, for hooks and tests that want direct access.
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Mutable access to the store.
    pub fn store_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    /// Reads a parameter (typed zero value or declared default when unset).
    pub fn get(&self, reference: &str) -> Result<ParamValue, StoreError> {
        self.store.get(reference)
    }

    /// Stores a parameter value.
    pub fn set(&mut self, reference: &str, value: ParamValue) -> Result<(), StoreError> {
        self.store.set(reference, value)
    }

    /// Accumulates into a parameter value.
    pub fn join(&mut self, reference: &str, value: ParamValue) -> Result<(), StoreError> {
        self.store.join(reference, value)
    }

    /// Removes a parameter value.
    pub fn unset(&mut self, reference: &str) -> Result<(), StoreError> {
        self.store.unset(reference)
    }

    /// Restores a parameter to its declared default.
    pub fn reset(&mut self, reference: &str) -> Result<(), StoreError> {
        self.store.reset(reference)
    }

    /// Applies externally-tokenized (reference, raw value) pairs.
    pub fn bind_cli_args(&mut self, pairs: &[(String, String)]) -> Result<(), StoreError> {
        binder::bind_cli_args(&mut self.store, pairs)
    }

    // --- EXECUTION ---

    /// Builds the per-phase execution plan for the invoked commands
    /// without running it.
    pub fn build_queue(&self, invoked: &[&str]) -> Result<ExecutionPlan, ScheduleError> {
        resolver::build_queue(&self.registry, &self.store, &self.phases, invoked)
    }

    /// Builds and drives a run: fail-fast plan construction, then phases
    /// strictly in order. Queue-build errors leave the store untouched;
    /// execution errors halt the remainder without rolling anything back.
    pub fn run(&mut self, invoked: &[&str]) -> Result<(), ScheduleError> {
        let plan = resolver::build_queue(&self.registry, &self.store, &self.phases, invoked)?;
        scheduler::run(
            &self.registry,
            &mut self.store,
            &plan,
            &self.observer,
            self.max_cycle_depth,
        )
    }

    // --- PERSISTENCE BOUNDARY ---

    /// The persistence classification of a parameter.
    pub fn persistence_class(&self, reference: &str) -> Result<Persistence, StoreError> {
        self.store.persistence_class(reference)
    }

    /// The bind-name -> value document for the given scope, ready for the
    /// host's serializer.
    pub fn snapshot(&self, scope: PersistenceScope) -> BTreeMap<String, ParamValue> {
        self.store.snapshot(scope)
    }

    /// Loads a previously-persisted document back through `set`.
    pub fn load_values<I>(&mut self, doc: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (String, ParamValue)>,
    {
        self.store.load(doc)
    }

    // --- PRESENTATION BOUNDARY ---

    /// Command metadata, in registration order. Read-only; rendering help
    /// from it has no effect on scheduling.
    pub fn command_info(&self) -> Vec<CommandInfo> {
        self.registry
            .commands()
            .map(|cmd| CommandInfo {
                name: cmd.name.clone(),
                desc: cmd.desc.clone(),
                phase: cmd.phase.clone(),
                required_params: cmd.required_params.clone(),
                framework: cmd.framework,
                exclude_from_help: cmd.exclude_from_help,
                invocable: cmd.invocable,
            })
            .collect()
    }

    /// Parameter metadata, in registration order.
    pub fn parameter_info(&self) -> Vec<ParameterInfo> {
        self.store
            .definitions()
            .map(|def| ParameterInfo {
                name: def.name.clone(),
                bind_name: def.bind().to_string(),
                ty: def.ty,
                aliases: def.aliases.clone(),
                required: def.required,
                switch_group: def.switch_group.clone(),
                persistence: def.persistence,
                desc: def.desc.clone(),
            })
            .collect()
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CycleDefinition;
    use std::cell::RefCell;

    #[test]
    fn end_to_end_build_pipeline() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut app = Application::new();
        app.define_parameter(
            ParameterDefinition::new("target", ParameterType::Str)
                .with_alias("-t")
                .with_default(ParamValue::Str("debug".to_string())),
        )
        .unwrap();

        let order: Rc<RefCell<Vec<String>>> = Rc::default();
        let tag = |name: &'static str, order: &Rc<RefCell<Vec<String>>>| {
            let order = Rc::clone(order);
            move |_: &mut ParameterStore| {
                order.borrow_mut().push(name.to_string());
                Ok(())
            }
        };

        app.register_command(
            CommandDefinition::new("prepare")
                .in_phase("setup")
                .with_action(tag("prepare", &order)),
        )
        .unwrap();
        app.register_command(CommandDefinition::new("compile").with_action(tag("compile", &order)))
            .unwrap();
        app.register_command(
            CommandDefinition::new("link")
                .require_before("compile")
                .with_action(tag("link", &order)),
        )
        .unwrap();

        app.bind_cli_args(&[("-t".to_string(), "release".to_string())])
            .unwrap();
        app.run(&["link", "prepare"]).unwrap();

        assert_eq!(
            order.borrow().as_slice(),
            &["prepare", "compile", "link"]
        );
        assert_eq!(app.get("target").unwrap(), ParamValue::Str("release".to_string()));
    }

    #[test]
    fn missing_required_parameter_prevents_all_actions() {
        let mut app = Application::new();
        app.define_parameter(ParameterDefinition::new("k", ParameterType::Str))
            .unwrap();

        let ran: Rc<RefCell<bool>> = Rc::default();
        app.register_command(CommandDefinition::new("c").requires_param("k").with_action({
            let ran = Rc::clone(&ran);
            move |_| {
                *ran.borrow_mut() = true;
                Ok(())
            }
        }))
        .unwrap();

        let err = app.run(&["c"]).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::MissingRequiredParameter { .. }
        ));
        assert!(!*ran.borrow());
    }

    #[test]
    fn cycle_owned_command_runs_only_through_its_cycle() {
        let mut app = Application::new();
        app.define_parameter(
            ParameterDefinition::new("rounds", ParameterType::Num).runtime_only(),
        )
        .unwrap();
        app.set("rounds", ParamValue::Num(2.0)).unwrap();

        let steps: Rc<RefCell<u32>> = Rc::default();
        app.register_command(
            CommandDefinition::new("pump").with_cycle(
                CycleDefinition::new(|store: &mut ParameterStore| {
                    Ok(store.get_num("rounds")? > 0.0)
                })
                .on_loop_end(|store: &mut ParameterStore| {
                    let left = store.get_num("rounds")? - 1.0;
                    store.set("rounds", ParamValue::Num(left))?;
                    Ok(())
                })
                .with_command(CommandDefinition::new("stroke").with_action({
                    let steps = Rc::clone(&steps);
                    move |_| {
                        *steps.borrow_mut() += 1;
                        Ok(())
                    }
                })),
            ),
        )
        .unwrap();

        app.run(&["pump"]).unwrap();
        assert_eq!(*steps.borrow(), 2);

        // The member is registered but unreachable by name.
        let err = app.run(&["stroke"]).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Registry(RegistryError::NotInvocable { .. })
        ));
    }

    #[test]
    fn independent_applications_share_nothing() {
        let mut a = Application::new();
        let mut b = Application::new();
        a.define_parameter(ParameterDefinition::new("x", ParameterType::Num))
            .unwrap();
        a.set("x", ParamValue::Num(1.0)).unwrap();
        assert!(matches!(
            b.set("x", ParamValue::Num(1.0)),
            Err(StoreError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn presentation_queries_expose_definitions() {
        let mut app = Application::new();
        app.define_parameter(
            ParameterDefinition::new("verbose", ParameterType::Flag)
                .with_alias("-v")
                .with_desc("Chatty output."),
        )
        .unwrap();
        app.register_command(
            CommandDefinition::new("hidden-helper")
                .exclude_from_help()
                .framework()
                .in_phase("teardown")
                .with_desc("Internal bookkeeping."),
        )
        .unwrap();

        let params = app.parameter_info();
        assert_eq!(params.len(), 1);
        let verbose = params.first().expect("one parameter");
        assert_eq!(verbose.aliases, vec!["-v".to_string()]);
        assert_eq!(verbose.ty, ParameterType::Flag);

        let commands = app.command_info();
        assert_eq!(commands.len(), 1);
        let helper = commands.first().expect("one command");
        assert!(helper.framework);
        assert!(helper.exclude_from_help);
        assert_eq!(helper.phase, "teardown");
    }

    #[test]
    fn custom_phase_order_gates_registration() {
        let phases = PhaseOrder::custom(vec!["setup", "stage", "teardown"]).unwrap();
        let mut app = Application::new().with_phase_order(phases);
        app.register_command(CommandDefinition::new("deploy").in_phase("stage"))
            .unwrap();
        let err = app
            .register_command(CommandDefinition::new("stray").in_phase("execution"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPhase { .. }));
    }

    #[test]
    fn snapshot_round_trips_through_a_toml_document() {
        let mut app = Application::new();
        app.define_parameter(
            ParameterDefinition::new("editor", ParameterType::Str)
                .with_persistence(Persistence::Always),
        )
        .unwrap();
        app.define_parameter(
            ParameterDefinition::new("theme", ParameterType::Str)
                .with_persistence(Persistence::UserConfigOnly),
        )
        .unwrap();
        app.set("editor", ParamValue::Str("hx".to_string())).unwrap();
        app.set("theme", ParamValue::Str("gruvbox".to_string())).unwrap();

        // The host serializes the document; the core only classifies.
        let doc = app.snapshot(PersistenceScope::UserConfig);
        let serialized = toml::to_string(&doc).expect("document serializes");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, &serialized).expect("write config");

        let restored: BTreeMap<String, ParamValue> =
            toml::from_str(&std::fs::read_to_string(&path).expect("read config"))
                .expect("document parses");

        let mut fresh = Application::new();
        fresh
            .define_parameter(
                ParameterDefinition::new("editor", ParameterType::Str)
                    .with_persistence(Persistence::Always),
            )
            .unwrap();
        fresh
            .define_parameter(
                ParameterDefinition::new("theme", ParameterType::Str)
                    .with_persistence(Persistence::UserConfigOnly),
            )
            .unwrap();
        fresh.load_values(restored).unwrap();
        assert_eq!(
            fresh.get("editor").unwrap(),
            ParamValue::Str("hx".to_string())
        );
        assert_eq!(
            fresh.get("theme").unwrap(),
            ParamValue::Str("gruvbox".to_string())
        );
    }

    /// The host-side shape: an external `clap` front end tokenizes the
    /// command line, and only resolved (reference, raw) pairs reach the
    /// core.
    #[test]
    fn external_clap_front_end_feeds_the_binder() {
        use clap::Parser;

        #[derive(Parser)]
        #[command(no_binary_name = true)]
        struct Cli {
            /// Build target.
            #[arg(long, short)]
            target: Option<String>,
            /// Input files, repeatable.
            #[arg(long)]
            file: Vec<String>,
            /// Chatty output.
            #[arg(long)]
            verbose: bool,
        }

        let cli = Cli::parse_from(["--target", "release", "--file", "a.rs", "--file", "b.rs"]);
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(target) = cli.target {
            pairs.push(("target".to_string(), target));
        }
        for file in cli.file {
            pairs.push(("files".to_string(), file));
        }
        if cli.verbose {
            pairs.push(("verbose".to_string(), String::new()));
        }

        let mut app = Application::new();
        app.define_parameter(ParameterDefinition::new("target", ParameterType::Str))
            .unwrap();
        app.define_parameter(ParameterDefinition::new("files", ParameterType::Seq))
            .unwrap();
        app.define_parameter(ParameterDefinition::new("verbose", ParameterType::Flag))
            .unwrap();
        app.bind_cli_args(&pairs).unwrap();

        assert_eq!(
            app.get("target").unwrap(),
            ParamValue::Str("release".to_string())
        );
        assert_eq!(
            app.get("files").unwrap(),
            ParamValue::Seq(vec!["a.rs".to_string(), "b.rs".to_string()])
        );
        assert_eq!(app.get("verbose").unwrap(), ParamValue::Flag(false));
    }
}
