// src/core/store.rs

use crate::core::events::{ExecutionObserver, ParamChange};
use crate::models::{
    ConflictPolicy, MergeStrategy, ParamValue, ParameterDefinition, ParameterType, Persistence,
    SwitchPolicy,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

lazy_static! {
    static ref PARAM_NAME_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").unwrap();
}

/// Errors raised by the parameter store. All are raised eagerly; a failed
/// operation performs no further side effects.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No parameter matches reference '{reference}'.")]
    UnknownParameter { reference: String },
    #[error("Reference '{reference}' is ambiguous; it matches: {}.", .matches.join(", "))]
    AmbiguousParameter {
        reference: String,
        matches: Vec<String>,
    },
    #[error("'{name}' is not a valid parameter name.")]
    InvalidName { name: String },
    #[error("Parameter '{name}' collides with an already-registered name, bind name, or alias.")]
    DuplicateParameter { name: String },
    #[error("Type mismatch for parameter '{param}': expected {expected}, got {found}.")]
    TypeMismatch {
        param: String,
        expected: ParameterType,
        found: ParameterType,
    },
    #[error("Parameter '{param}' is immutable and already holds a value.")]
    ImmutableViolation { param: String },
    #[error("Cannot set '{param}': switch-group member '{holder}' already holds a value.")]
    SwitchGroupConflict { param: String, holder: String },
    #[error("Value '{value}' is not allowed for parameter '{param}'.")]
    ValueNotAllowed { param: String, value: String },
    #[error("Parameter '{param}' has no value.")]
    NotSet { param: String },
    #[error("Key '{key}' collides while merging into mapping parameter '{param}'.")]
    MergeConflict { param: String, key: String },
    #[error("Parameter '{param}' of type {ty} does not support join.")]
    JoinUnsupported { param: String, ty: ParameterType },
}

/// Which persisted view of the store a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceScope {
    /// Only `Persistence::Always` parameters.
    Always,
    /// Everything persistable into user configuration: `Always` and
    /// `UserConfigOnly` parameters (i.e. those not marked `Never`).
    UserConfig,
}

type ParamId = usize;

/// The typed parameter store: definitions plus current values, with
/// switch-group, immutability and allowed-value enforcement on every
/// mutation.
///
/// References passed to every operation resolve through three namespaces
/// (parameter name, bind name, CLI alias) and must land on exactly one
/// parameter.
#[derive(Default)]
pub struct ParameterStore {
    defs: Vec<ParameterDefinition>,
    by_name: HashMap<String, ParamId>,
    by_bind: HashMap<String, ParamId>,
    by_alias: HashMap<String, ParamId>,
    values: HashMap<ParamId, ParamValue>,
    observer: Option<Rc<dyn ExecutionObserver>>,
}

impl fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterStore")
            .field("definitions", &self.defs.len())
            .field("values", &self.values.len())
            .finish_non_exhaustive()
    }
}

impl ParameterStore {
    /// An empty store with no observer attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the observer that receives parameter-change notifications.
    pub fn set_observer(&mut self, observer: Option<Rc<dyn ExecutionObserver>>) {
        self.observer = observer;
    }

    // --- DEFINITION REGISTRY ---

    /// Registers a parameter definition. Names, bind names and aliases must
    /// each be unique within their own namespace; a collision is a
    /// `DuplicateParameter` error.
    pub fn define(&mut self, def: ParameterDefinition) -> Result<(), StoreError> {
        if !PARAM_NAME_RE.is_match(&def.name) {
            return Err(StoreError::InvalidName {
                name: def.name.clone(),
            });
        }
        if self.by_name.contains_key(&def.name) || self.by_bind.contains_key(def.bind()) {
            return Err(StoreError::DuplicateParameter {
                name: def.name.clone(),
            });
        }
        for alias in &def.aliases {
            if self.by_alias.contains_key(alias) {
                return Err(StoreError::DuplicateParameter {
                    name: def.name.clone(),
                });
            }
        }

        // Switch-group symmetry is an authoring convention, not an enforced
        // invariant: surface asymmetric declarations without rejecting them.
        for member in &def.switch_group {
            if let Some(&mid) = self.by_name.get(member)
                && let Some(other) = self.defs.get(mid)
                && !other.switch_group.contains(&def.name)
            {
                log::warn!(
                    "Switch group is asymmetric: '{}' excludes '{}', but not vice versa.",
                    def.name,
                    member
                );
            }
        }

        let id = self.defs.len();
        self.by_name.insert(def.name.clone(), id);
        self.by_bind.insert(def.bind().to_string(), id);
        for alias in &def.aliases {
            self.by_alias.insert(alias.clone(), id);
        }
        log::debug!("Registered parameter '{}' ({}).", def.name, def.ty);
        self.defs.push(def);
        Ok(())
    }

    /// Resolves a reference through the name, bind-name and alias
    /// namespaces. Exactly one parameter must match.
    fn resolve(&self, reference: &str) -> Result<ParamId, StoreError> {
        let mut matched: Vec<ParamId> = Vec::with_capacity(2);
        for table in [&self.by_name, &self.by_bind, &self.by_alias] {
            if let Some(&id) = table.get(reference)
                && !matched.contains(&id)
            {
                matched.push(id);
            }
        }
        match matched.as_slice() {
            [] => Err(StoreError::UnknownParameter {
                reference: reference.to_string(),
            }),
            [id] => Ok(*id),
            ids => Err(StoreError::AmbiguousParameter {
                reference: reference.to_string(),
                matches: ids
                    .iter()
                    .filter_map(|&i| self.defs.get(i).map(|d| d.name.clone()))
                    .collect(),
            }),
        }
    }

    fn def(&self, id: ParamId) -> &ParameterDefinition {
        // Ids are handed out by `define` and never escape the store.
        match self.defs.get(id) {
            Some(def) => def,
            None => unreachable!("parameter id out of range"),
        }
    }

    /// The full definition behind a reference.
    pub fn definition(&self, reference: &str) -> Result<&ParameterDefinition, StoreError> {
        self.resolve(reference).map(|id| self.def(id))
    }

    /// Iterates all registered definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.defs.iter()
    }

    /// The declared type behind a reference.
    pub fn type_of(&self, reference: &str) -> Result<ParameterType, StoreError> {
        self.definition(reference).map(|d| d.ty)
    }

    /// Whether the parameter currently holds an explicitly-set value.
    pub fn has_value(&self, reference: &str) -> Result<bool, StoreError> {
        self.resolve(reference).map(|id| self.values.contains_key(&id))
    }

    /// Whether the parameter declares a default value.
    pub fn has_default(&self, reference: &str) -> Result<bool, StoreError> {
        self.definition(reference).map(|d| d.default.is_some())
    }

    /// Whether the parameter is runtime-only.
    pub fn is_runtime_only(&self, reference: &str) -> Result<bool, StoreError> {
        self.definition(reference).map(|d| d.runtime_only)
    }

    /// The persistence classification behind a reference, for the external
    /// persistence collaborator.
    pub fn persistence_class(&self, reference: &str) -> Result<Persistence, StoreError> {
        self.definition(reference).map(|d| d.persistence)
    }

    // --- READ OPERATIONS ---

    /// The current value: the stored one, else the declared default, else
    /// the typed zero value.
    pub fn get(&self, reference: &str) -> Result<ParamValue, StoreError> {
        let id = self.resolve(reference)?;
        if let Some(v) = self.values.get(&id) {
            return Ok(v.clone());
        }
        let def = self.def(id);
        Ok(def.default.clone().unwrap_or_else(|| def.ty.zero_value()))
    }

    /// Strict read: fails with `NotSet` when the parameter neither holds a
    /// value nor declares a default.
    pub fn try_get(&self, reference: &str) -> Result<ParamValue, StoreError> {
        let id = self.resolve(reference)?;
        if let Some(v) = self.values.get(&id) {
            return Ok(v.clone());
        }
        let def = self.def(id);
        def.default.clone().ok_or_else(|| StoreError::NotSet {
            param: def.name.clone(),
        })
    }

    /// Like `get`, but the caller-supplied fallback replaces the typed zero
    /// value when the parameter is unset and has no declared default.
    pub fn get_or(&self, reference: &str, fallback: ParamValue) -> Result<ParamValue, StoreError> {
        let id = self.resolve(reference)?;
        if let Some(v) = self.values.get(&id) {
            return Ok(v.clone());
        }
        Ok(self.def(id).default.clone().unwrap_or(fallback))
    }

    /// Typed read of a string parameter.
    pub fn get_str(&self, reference: &str) -> Result<String, StoreError> {
        match self.get(reference)? {
            ParamValue::Str(s) => Ok(s),
            other => Err(self.mismatch(reference, ParameterType::Str, &other)),
        }
    }

    /// Typed read of a numeric parameter.
    pub fn get_num(&self, reference: &str) -> Result<f64, StoreError> {
        match self.get(reference)? {
            ParamValue::Num(n) => Ok(n),
            other => Err(self.mismatch(reference, ParameterType::Num, &other)),
        }
    }

    /// Typed read of a flag parameter.
    pub fn get_flag(&self, reference: &str) -> Result<bool, StoreError> {
        match self.get(reference)? {
            ParamValue::Flag(b) => Ok(b),
            other => Err(self.mismatch(reference, ParameterType::Flag, &other)),
        }
    }

    /// Typed read of a sequence parameter.
    pub fn get_seq(&self, reference: &str) -> Result<Vec<String>, StoreError> {
        match self.get(reference)? {
            ParamValue::Seq(items) => Ok(items),
            other => Err(self.mismatch(reference, ParameterType::Seq, &other)),
        }
    }

    /// Typed read of a mapping parameter.
    pub fn get_map(&self, reference: &str) -> Result<BTreeMap<String, ParamValue>, StoreError> {
        match self.get(reference)? {
            ParamValue::Map(map) => Ok(map),
            other => Err(self.mismatch(reference, ParameterType::Map, &other)),
        }
    }

    fn mismatch(&self, reference: &str, expected: ParameterType, got: &ParamValue) -> StoreError {
        let param = self
            .definition(reference)
            .map(|d| d.name.clone())
            .unwrap_or_else(|_| reference.to_string());
        StoreError::TypeMismatch {
            param,
            expected,
            found: got.kind(),
        }
    }

    // --- WRITE OPERATIONS ---

    /// Stores a value, replacing any previous one. Type-checks against the
    /// declared type, normalizes against `allowed_values`, enforces
    /// immutability, and applies the switch-group policy to co-members.
    pub fn set(&mut self, reference: &str, value: ParamValue) -> Result<(), StoreError> {
        let id = self.resolve(reference)?;
        self.set_id(id, value)
    }

    fn set_id(&mut self, id: ParamId, value: ParamValue) -> Result<(), StoreError> {
        let (name, group, policy, normalized) = {
            let def = self.def(id);
            Self::check_type(def, &value)?;
            let normalized = Self::normalize_allowed(def, value)?;
            if def.immutable && self.values.contains_key(&id) {
                return Err(StoreError::ImmutableViolation {
                    param: def.name.clone(),
                });
            }
            (
                def.name.clone(),
                def.switch_group.clone(),
                def.switch_policy,
                normalized,
            )
        };

        if !group.is_empty() {
            self.apply_switch_policy(&name, &group, policy)?;
        }

        self.values.insert(id, normalized);
        self.notify(&name, ParamChange::Set);
        Ok(())
    }

    fn apply_switch_policy(
        &mut self,
        name: &str,
        group: &[String],
        policy: SwitchPolicy,
    ) -> Result<(), StoreError> {
        for member in group {
            if member == name {
                continue;
            }
            let Some(&mid) = self.by_name.get(member) else {
                log::debug!(
                    "Switch group of '{}' names unknown parameter '{}'; ignoring.",
                    name,
                    member
                );
                continue;
            };
            match policy {
                SwitchPolicy::Reject => {
                    if self.values.contains_key(&mid) {
                        return Err(StoreError::SwitchGroupConflict {
                            param: name.to_string(),
                            holder: member.clone(),
                        });
                    }
                }
                SwitchPolicy::UnsetOthers => self.unset_id(mid)?,
                SwitchPolicy::ResetOthers => self.reset_id(mid)?,
            }
        }
        Ok(())
    }

    /// Accumulates into the current value instead of replacing it: string
    /// concatenation, sequence append/extend, or mapping merge. Joining an
    /// unset parameter behaves as `set`.
    pub fn join(&mut self, reference: &str, value: ParamValue) -> Result<(), StoreError> {
        let id = self.resolve(reference)?;

        let ty = self.def(id).ty;
        if matches!(ty, ParameterType::Num | ParameterType::Flag) {
            return Err(StoreError::JoinUnsupported {
                param: self.def(id).name.clone(),
                ty,
            });
        }

        if !self.values.contains_key(&id) {
            let initial = {
                let def = self.def(id);
                Self::coerce_join_initial(def, value)?
            };
            return self.set_id(id, initial);
        }

        // Accumulation mutates an existing value, so write-once parameters
        // reject it just as they reject `set`.
        let (name, sep, strategy, conflicts) = {
            let def = self.def(id);
            if def.immutable {
                return Err(StoreError::ImmutableViolation {
                    param: def.name.clone(),
                });
            }
            (
                def.name.clone(),
                def.join_separator
                    .clone()
                    .unwrap_or_else(|| crate::constants::DEFAULT_JOIN_SEPARATOR.to_string()),
                def.merge_strategy,
                def.conflict_policy,
            )
        };

        let addition = {
            let def = self.def(id);
            Self::coerce_join_initial(def, value)?
        };

        let Some(slot) = self.values.get_mut(&id) else {
            unreachable!("value presence checked above");
        };
        match (slot, addition) {
            (ParamValue::Str(existing), ParamValue::Str(fragment)) => {
                existing.push_str(&sep);
                existing.push_str(&fragment);
            }
            (ParamValue::Seq(existing), ParamValue::Seq(items)) => {
                existing.extend(items);
            }
            (ParamValue::Map(existing), ParamValue::Map(incoming)) => {
                Self::merge_maps(existing, incoming, strategy, conflicts, &name)?;
            }
            _ => unreachable!("join coercion yields the declared type"),
        }
        self.notify(&name, ParamChange::Joined);
        Ok(())
    }

    /// Removes the current value. A no-op when unset; fails on immutable,
    /// valued parameters.
    pub fn unset(&mut self, reference: &str) -> Result<(), StoreError> {
        let id = self.resolve(reference)?;
        self.unset_id(id)
    }

    fn unset_id(&mut self, id: ParamId) -> Result<(), StoreError> {
        let def = self.def(id);
        if def.immutable && self.values.contains_key(&id) {
            return Err(StoreError::ImmutableViolation {
                param: def.name.clone(),
            });
        }
        let name = def.name.clone();
        if self.values.remove(&id).is_some() {
            self.notify(&name, ParamChange::Unset);
        }
        Ok(())
    }

    /// Restores the declared default, or behaves as `unset` when there is
    /// none. Fails on immutable, valued parameters.
    pub fn reset(&mut self, reference: &str) -> Result<(), StoreError> {
        let id = self.resolve(reference)?;
        self.reset_id(id)
    }

    fn reset_id(&mut self, id: ParamId) -> Result<(), StoreError> {
        let def = self.def(id);
        if def.immutable && self.values.contains_key(&id) {
            return Err(StoreError::ImmutableViolation {
                param: def.name.clone(),
            });
        }
        let name = def.name.clone();
        match def.default.clone() {
            Some(default) => {
                self.values.insert(id, default);
                self.notify(&name, ParamChange::Reset);
            }
            None => {
                if self.values.remove(&id).is_some() {
                    self.notify(&name, ParamChange::Unset);
                }
            }
        }
        Ok(())
    }

    // --- PERSISTENCE BOUNDARY ---

    /// The persisted view of the store: explicitly-set values of eligible
    /// parameters, keyed by bind name. Serialization of the resulting
    /// document is the host's job.
    pub fn snapshot(&self, scope: PersistenceScope) -> BTreeMap<String, ParamValue> {
        let mut doc = BTreeMap::new();
        for (id, def) in self.defs.iter().enumerate() {
            let eligible = match scope {
                PersistenceScope::Always => def.persistence == Persistence::Always,
                PersistenceScope::UserConfig => def.persistence != Persistence::Never,
            };
            if eligible && let Some(v) = self.values.get(&id) {
                doc.insert(def.bind().to_string(), v.clone());
            }
        }
        doc
    }

    /// Loads a persisted document back into the store through `set`, so
    /// switch-group and immutability rules apply to restored values too.
    pub fn load<I>(&mut self, doc: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (String, ParamValue)>,
    {
        for (bind, value) in doc {
            self.set(&bind, value)?;
        }
        Ok(())
    }

    // --- VALIDATION HELPERS ---

    fn check_type(def: &ParameterDefinition, value: &ParamValue) -> Result<(), StoreError> {
        if value.kind() == def.ty {
            Ok(())
        } else {
            Err(StoreError::TypeMismatch {
                param: def.name.clone(),
                expected: def.ty,
                found: value.kind(),
            })
        }
    }

    /// Checks a value against `allowed_values`, normalizing string and
    /// sequence entries to the declared canonical casing.
    fn normalize_allowed(
        def: &ParameterDefinition,
        value: ParamValue,
    ) -> Result<ParamValue, StoreError> {
        let Some(allowed) = &def.allowed_values else {
            return Ok(value);
        };
        match value {
            ParamValue::Str(s) => Self::canonical_string(def, allowed, s).map(ParamValue::Str),
            ParamValue::Seq(items) => items
                .into_iter()
                .map(|s| Self::canonical_string(def, allowed, s))
                .collect::<Result<Vec<_>, _>>()
                .map(ParamValue::Seq),
            other => {
                if allowed.contains(&other) {
                    Ok(other)
                } else {
                    Err(StoreError::ValueNotAllowed {
                        param: def.name.clone(),
                        value: other.to_string(),
                    })
                }
            }
        }
    }

    fn canonical_string(
        def: &ParameterDefinition,
        allowed: &[ParamValue],
        s: String,
    ) -> Result<String, StoreError> {
        for candidate in allowed {
            if let ParamValue::Str(canonical) = candidate
                && canonical.eq_ignore_ascii_case(&s)
            {
                return Ok(canonical.clone());
            }
        }
        Err(StoreError::ValueNotAllowed {
            param: def.name.clone(),
            value: s,
        })
    }

    /// Shapes an incoming join payload into the parameter's declared type:
    /// a scalar joined into a sequence becomes a one-element sequence.
    fn coerce_join_initial(
        def: &ParameterDefinition,
        value: ParamValue,
    ) -> Result<ParamValue, StoreError> {
        match (def.ty, value) {
            (ParameterType::Seq, ParamValue::Str(s)) => {
                let items = vec![s];
                Self::normalize_allowed(def, ParamValue::Seq(items))
            }
            (_, value) => {
                Self::check_type(def, &value)?;
                Self::normalize_allowed(def, value)
            }
        }
    }

    fn merge_maps(
        dst: &mut BTreeMap<String, ParamValue>,
        src: BTreeMap<String, ParamValue>,
        strategy: MergeStrategy,
        conflicts: ConflictPolicy,
        param: &str,
    ) -> Result<(), StoreError> {
        for (key, value) in src {
            match dst.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => {
                    let both_maps = matches!(slot.get(), ParamValue::Map(_))
                        && matches!(value, ParamValue::Map(_));
                    if strategy == MergeStrategy::Deep && both_maps {
                        if let (ParamValue::Map(existing), ParamValue::Map(incoming)) =
                            (slot.get_mut(), value)
                        {
                            Self::merge_maps(existing, incoming, strategy, conflicts, param)?;
                        }
                    } else {
                        match conflicts {
                            ConflictPolicy::MostRecentWins => {
                                slot.insert(value);
                            }
                            ConflictPolicy::OldestWins => {}
                            ConflictPolicy::Fail => {
                                return Err(StoreError::MergeConflict {
                                    param: param.to_string(),
                                    key: slot.key().clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn notify(&self, param: &str, change: ParamChange) {
        log::trace!("Parameter '{}': {:?}.", param, change);
        if let Some(observer) = &self.observer {
            observer.parameter_changed(param, change);
        }
    }
}

// MARK: --- UNIT TESTS ---
