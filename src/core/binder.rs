// src/core/binder.rs

use crate::core::store::{ParameterStore, StoreError};
use crate::models::{ParamValue, ParameterType};
use std::collections::BTreeMap;

/// Applies a resolved sequence of (parameter-reference, raw value) pairs,
/// already tokenized by the external CLI front end, to the store.
///
/// Scalars replace the current value; sequence and mapping references
/// accumulate through `join`, so a repeated token grows the value instead
/// of clobbering it. Conversion routes by the declared type and surfaces
/// failures as `TypeMismatch`.
pub fn bind_cli_args(
    store: &mut ParameterStore,
    pairs: &[(String, String)],
) -> Result<(), StoreError> {
    for (reference, raw) in pairs {
        let ty = store.type_of(reference)?;
        let value = convert(store, reference, ty, raw)?;
        log::debug!("Binding '{}' <- {}.", reference, value);
        match ty {
            ParameterType::Seq | ParameterType::Map => store.join(reference, value)?,
            _ => store.set(reference, value)?,
        }
    }
    Ok(())
}

/// Converts one raw token into the declared type.
fn convert(
    store: &ParameterStore,
    reference: &str,
    ty: ParameterType,
    raw: &str,
) -> Result<ParamValue, StoreError> {
    match ty {
        ParameterType::Str => Ok(ParamValue::Str(raw.to_string())),
        ParameterType::Seq => Ok(ParamValue::Str(raw.to_string())),
        ParameterType::Num => raw
            .trim()
            .parse::<f64>()
            .map(ParamValue::Num)
            .map_err(|_| mismatch(store, reference, ty)),
        ParameterType::Flag => match raw.trim().to_ascii_lowercase().as_str() {
            // A bare flag token arrives with an empty raw value.
            "" | "true" | "yes" | "1" => Ok(ParamValue::Flag(true)),
            "false" | "no" | "0" => Ok(ParamValue::Flag(false)),
            _ => Err(mismatch(store, reference, ty)),
        },
        ParameterType::Map => match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                let mut entry = BTreeMap::new();
                entry.insert(key.to_string(), ParamValue::Str(value.to_string()));
                Ok(ParamValue::Map(entry))
            }
            _ => Err(mismatch(store, reference, ty)),
        },
    }
}

fn mismatch(store: &ParameterStore, reference: &str, expected: ParameterType) -> StoreError {
    let param = store
        .definition(reference)
        .map(|d| d.name.clone())
        .unwrap_or_else(|_| reference.to_string());
    StoreError::TypeMismatch {
        param,
        expected,
        found: ParameterType::Str,
    }
}

// MARK: --- UNIT TESTS ---
