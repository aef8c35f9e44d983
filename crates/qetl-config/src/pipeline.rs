//! Pipeline document parsing.

use crate::kdl_util::{
    bounded_integer, config_block, get_all_string_args, get_first_string_arg, get_integer_prop,
    get_string_list_prop, get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use qetl_core::pipeline::{
    ExecutionParams, InputSource, OutputSpec, PipelineSpec, Transformation,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Parse a pipeline definition from KDL text.
///
/// Missing sections are not an error here; the job manager decides whether
/// a pipeline is complete enough to run.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineSpec> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut version = "1.0".to_string();
    let mut description = None;
    let mut inputs = Vec::new();
    let mut transformations = Vec::new();
    let mut outputs = Vec::new();
    let mut execution = ExecutionParams::default();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
                if let Some(v) = get_string_prop(node, "version") {
                    version = v;
                }
                description = get_string_prop(node, "description");
            }
            "input" => {
                inputs.push(parse_input(node)?);
            }
            "transform" => {
                transformations.push(parse_transform(node)?);
            }
            "output" => {
                outputs.push(parse_output(node)?);
            }
            "execution" => {
                execution = parse_execution(node)?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let spec = PipelineSpec {
        name,
        version,
        description,
        inputs,
        transformations,
        outputs,
        execution,
    };
    check_references(&spec)?;
    Ok(spec)
}

/// Load a pipeline document from disk. `.json` files are read as the JSON
/// projection of [`PipelineSpec`]; anything else is parsed as KDL.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineSpec> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    debug!(path = %path.display(), "loading pipeline document");

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        let spec: PipelineSpec = serde_json::from_str(&content)?;
        check_references(&spec)?;
        Ok(spec)
    } else {
        parse_pipeline(&content)
    }
}

fn parse_input(node: &KdlNode) -> ConfigResult<InputSource> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("input name".to_string()))?;
    let path = get_string_prop(node, "path")
        .ok_or_else(|| ConfigError::MissingField(format!("path for input '{}'", name)))?;

    Ok(InputSource {
        name,
        path,
        source_type: get_string_prop(node, "type"),
        config: config_block(node),
    })
}

fn parse_transform(node: &KdlNode) -> ConfigResult<Transformation> {
    let component = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("transform component".to_string()))?;

    Ok(Transformation {
        component,
        name: get_string_prop(node, "name"),
        config: config_block(node),
        dependencies: get_string_list_prop(node, "needs"),
    })
}

fn parse_output(node: &KdlNode) -> ConfigResult<OutputSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("output name".to_string()))?;
    let path = get_string_prop(node, "path")
        .ok_or_else(|| ConfigError::MissingField(format!("path for output '{}'", name)))?;

    Ok(OutputSpec {
        name,
        path,
        format: get_string_prop(node, "format").unwrap_or_else(|| "json".to_string()),
        config: config_block(node),
    })
}

fn parse_execution(node: &KdlNode) -> ConfigResult<ExecutionParams> {
    let mut params = ExecutionParams::default();

    if let Some(priority) = get_integer_prop(node, "priority") {
        params.priority = bounded_integer("execution priority", priority, 1, 100)? as u8;
    }
    if let Some(timeout) = get_integer_prop(node, "timeout") {
        params.timeout_secs = Some(bounded_integer(
            "execution timeout",
            timeout,
            1,
            i128::from(u32::MAX),
        )?);
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "notify" {
                params.notifications.extend(get_all_string_args(child));
            }
        }
    }

    Ok(params)
}

/// Check transformation names and dependency references.
fn check_references(spec: &PipelineSpec) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for step in &spec.transformations {
        if !seen.insert(step.key()) {
            return Err(ConfigError::Duplicate(format!(
                "transformation '{}'",
                step.key()
            )));
        }
    }

    for step in &spec.transformations {
        for dep in &step.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "transformation '{}' depends on unknown transformation '{}'",
                    step.key(),
                    dep
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&spec.transformations) {
        return Err(ConfigError::CycleDetected(cycle));
    }
    Ok(())
}

/// Detect cycles in the transformation dependency graph using DFS.
fn detect_cycle(steps: &[Transformation]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let step_map: HashMap<&str, &Transformation> = steps.iter().map(|s| (s.key(), s)).collect();

    for step in steps {
        if !visited.contains_key(step.key()) {
            if let Some(cycle) = dfs_detect_cycle(step.key(), &step_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    step_map: &HashMap<&'a str, &'a Transformation>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(&step) = step_map.get(node) {
        for dep in &step.dependencies {
            let dep: &'a str = dep.as_str();
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, step_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
