//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn required_string_arg(node: &KdlNode) -> ConfigResult<String> {
    first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", node.name().value())))
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Reads the first positional argument of `node` as a boolean.
pub(crate) fn bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected a boolean"))
}

/// Reads the first positional integer argument of `node` into `T`.
pub(crate) fn int_arg<T: TryFrom<i128>>(node: &KdlNode) -> ConfigResult<T> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected an integer"))
        .and_then(|n| int_in_range(node.name().value(), n))
}

/// Reads the named integer property `name` of `node`, if present.
pub(crate) fn int_prop<T: TryFrom<i128>>(node: &KdlNode, name: &str) -> ConfigResult<Option<T>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => {
            let n = v
                .as_integer()
                .ok_or_else(|| ConfigError::invalid(name, "expected an integer"))?;
            int_in_range(name, n).map(Some)
        }
    }
}

fn int_in_range<T: TryFrom<i128>>(field: &str, n: i128) -> ConfigResult<T> {
    T::try_from(n).map_err(|_| ConfigError::invalid(field, format!("{n} is out of range")))
}
