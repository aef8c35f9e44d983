// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::{Map, Value};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_integer_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    // Repeated attributes: needs="a" needs="b"
    let result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();
    if !result.is_empty() {
        return result;
    }

    // Block syntax: needs "a" "b"
    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(get_all_string_args)
        .unwrap_or_default()
}

/// Read a positive integer setting, rejecting values outside `min..=max`.
pub(crate) fn bounded_integer(field: &str, value: i128, min: i128, max: i128) -> ConfigResult<u64> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("{} is outside {}..={}", value, min, max),
        });
    }
    u64::try_from(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

/// Convert the `config { ... }` child of a node into a JSON object.
pub(crate) fn config_block(node: &KdlNode) -> Option<Value> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == "config")
        .map(node_to_json)
}

fn document_to_json(doc: &KdlDocument) -> Map<String, Value> {
    doc.nodes()
        .iter()
        .map(|child| (child.name().value().to_string(), node_to_json(child)))
        .collect()
}

fn node_to_json(node: &KdlNode) -> Value {
    let mut props = Map::new();
    let mut args = Vec::new();
    for entry in node.entries() {
        match entry.name() {
            Some(name) => {
                props.insert(name.value().to_string(), value_to_json(entry.value()));
            }
            None => args.push(value_to_json(entry.value())),
        }
    }

    if let Some(children) = node.children() {
        props.extend(document_to_json(children));
    }

    if !props.is_empty() {
        return Value::Object(props);
    }
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

fn value_to_json(value: &KdlValue) -> Value {
    match value {
        KdlValue::String(s) => Value::String(s.clone()),
        KdlValue::Integer(i) => i64::try_from(*i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(*i as f64)),
        KdlValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        KdlValue::Bool(b) => Value::Bool(*b),
        KdlValue::Null => Value::Null,
    }
}
