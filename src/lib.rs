//! ordo: a declarative, phase-ordered command orchestration framework.
//!
//! Applications describe parameters and commands as data; `ordo` resolves
//! execution order from the declared constraints, enforces prerequisites
//! and required parameters, and drives repeatable command loops. Execution
//! is strictly single-threaded and synchronous.
//!
//! The usual entry point is [`Application`]: define parameters, register
//! commands, bind externally-tokenized CLI arguments, and `run`.

pub mod app;
pub mod constants;
pub mod core;
pub mod models;

pub use crate::app::{Application, CommandInfo, ParameterInfo};
pub use crate::core::events::{ExecutionObserver, LogObserver, ParamChange};
pub use crate::core::registry::RegistryError;
pub use crate::core::resolver::{ExecutionPlan, ScheduleError};
pub use crate::core::store::{ParameterStore, PersistenceScope, StoreError};
pub use crate::models::{
    CommandDefinition, CommandRef, CycleDefinition, ParamValue, ParameterDefinition,
    ParameterType, Persistence, PhaseOrder, SwitchPolicy,
};
