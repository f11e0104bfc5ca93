//! Lowering engine: rewrites a traced graph into the exchange format,
//! substituting registered custom operators.
//!
//! Matching is by exact qualified name, scoped by the export's target opset.
//! A traced operator with neither a registry entry nor a builtin mapping is
//! fatal to the whole export; there is no partial output.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use thiserror::Error;

use crate::ir::{
    Attribute, ExportedGraph, GraphIoError, GraphValue, LocalFunction, Node, QualName, TensorSpec,
    ValueId, CUSTOM_DOMAIN_VERSION, SPEC_VERSION,
};
use crate::registry::RegistryContext;
use crate::trace::{TracedGraph, TracedNode};

/// Controls a single export invocation.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub graph_name: String,
    pub opset_version: i64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        // Local functions require opset 15 or later in the exchange format.
        Self {
            graph_name: "main".to_string(),
            opset_version: 15,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LowerError {
    #[error("no primitive or registered mapping for `{name}` at opset {opset_version}")]
    UnresolvedOperator { name: String, opset_version: i64 },
    #[error("rewrite for `{op}` did not set an output type")]
    MissingOutputType { op: String },
    #[error("rewrite for `{op}` declared output type {found:?}, traced type is {expected:?}")]
    OutputTypeMismatch {
        op: String,
        expected: TensorSpec,
        found: TensorSpec,
    },
    #[error("cannot lower `{op}`: {message}")]
    UnsupportedAttribute { op: String, message: String },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Io(#[from] GraphIoError),
}

/// Exported graph under construction. Append-only node list plus the local
/// functions and opset imports the emitted nodes pull in.
struct ModuleBuilder {
    nodes: Vec<Node>,
    specs: HashMap<ValueId, TensorSpec>,
    functions: BTreeMap<(String, String), LocalFunction>,
    opset_imports: BTreeMap<String, i64>,
    next_value: u32,
}

impl ModuleBuilder {
    fn new(opset_version: i64) -> Self {
        Self {
            nodes: Vec::new(),
            specs: HashMap::new(),
            functions: BTreeMap::new(),
            opset_imports: BTreeMap::from([(String::new(), opset_version)]),
            next_value: 0,
        }
    }

    fn allocate(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.specs.insert(id, spec);
        id
    }

    fn push_node(
        &mut self,
        op: QualName,
        inputs: Vec<ValueId>,
        attrs: BTreeMap<String, Attribute>,
        spec: TensorSpec,
    ) -> ValueId {
        if !op.is_builtin() {
            self.opset_imports
                .entry(op.domain.clone())
                .or_insert(CUSTOM_DOMAIN_VERSION);
        }
        let output = self.allocate(spec.clone());
        self.nodes.push(Node {
            output,
            op,
            inputs,
            attrs,
            spec,
        });
        output
    }

    fn attach_function(&mut self, function: &LocalFunction) {
        self.functions
            .entry((function.domain.clone(), function.name.clone()))
            .or_insert_with(|| function.clone());
    }
}

/// Graph-building handle passed to rewrite functions. Wraps the module under
/// construction together with the mapped call-site operands.
pub struct LowerContext<'a> {
    builder: &'a mut ModuleBuilder,
    inputs: Vec<ValueId>,
    output_spec: TensorSpec,
}

impl<'a> LowerContext<'a> {
    /// Call-site operands, already mapped into the target graph.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Inferred type of the traced value being replaced. Rewrites typically
    /// forward this when the replacement preserves the operand type.
    pub fn output_spec(&self) -> &TensorSpec {
        &self.output_spec
    }

    /// Starts a replacement node for the qualified op name. The returned
    /// builder appends to the graph on `emit`, yielding a fresh value handle.
    pub fn op(&mut self, qualified: &str) -> NodeBuilder<'_, 'a> {
        NodeBuilder {
            op: QualName::parse(qualified).ok(),
            raw_name: qualified.to_string(),
            cx: self,
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
            spec: None,
        }
    }
}

/// One-shot builder for a replacement node.
pub struct NodeBuilder<'c, 'a> {
    cx: &'c mut LowerContext<'a>,
    op: Option<QualName>,
    raw_name: String,
    inputs: Vec<ValueId>,
    attrs: BTreeMap<String, Attribute>,
    spec: Option<TensorSpec>,
}

impl NodeBuilder<'_, '_> {
    pub fn input(mut self, value: ValueId) -> Self {
        self.inputs.push(value);
        self
    }

    pub fn inputs(mut self, values: &[ValueId]) -> Self {
        self.inputs.extend_from_slice(values);
        self
    }

    pub fn attr(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attrs.insert(name.into(), attr);
        self
    }

    /// Declares the node's output type. Required: the engine never infers
    /// types for replacement nodes.
    pub fn output_type(mut self, spec: TensorSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn emit(self) -> Result<ValueId, LowerError> {
        let op = self.op.ok_or_else(|| LowerError::UnsupportedAttribute {
            op: self.raw_name.clone(),
            message: "malformed qualified op name".to_string(),
        })?;
        let spec = self.spec.ok_or(LowerError::MissingOutputType {
            op: self.raw_name,
        })?;
        Ok(self.cx.builder.push_node(op, self.inputs, self.attrs, spec))
    }
}

/// Walks the traced node list and produces the exported graph, consulting
/// the registry for substitutions and the builtin table for everything else.
pub fn lower_graph(
    traced: &TracedGraph,
    registry: &RegistryContext,
    options: &ExportOptions,
) -> Result<ExportedGraph, LowerError> {
    let mut builder = ModuleBuilder::new(options.opset_version);
    let mut value_map: HashMap<ValueId, ValueId> = HashMap::new();

    let mut inputs = Vec::with_capacity(traced.inputs.len());
    for input in &traced.inputs {
        let spec = input.tensor.spec();
        let target = builder.allocate(spec.clone());
        value_map.insert(input.value, target);
        inputs.push(GraphValue {
            name: input.name.clone(),
            value: target,
            spec,
        });
    }

    for node in &traced.nodes {
        let mapped = map_operands(node, &value_map)?;
        let target = match registry.lookup(&node.op, options.opset_version) {
            Some(entry) => {
                let mut cx = LowerContext {
                    builder: &mut builder,
                    inputs: mapped,
                    output_spec: node.spec.clone(),
                };
                let output = (entry.rewrite)(&mut cx, node)?;
                let found = builder.specs.get(&output).cloned().ok_or(
                    LowerError::MissingOutputType {
                        op: node.op.to_string(),
                    },
                )?;
                if found != node.spec {
                    return Err(LowerError::OutputTypeMismatch {
                        op: node.op.to_string(),
                        expected: node.spec.clone(),
                        found,
                    });
                }
                if let Some(function) = &entry.function {
                    builder.attach_function(function);
                }
                output
            }
            None => lower_builtin(&mut builder, node, mapped, options.opset_version)?,
        };
        value_map.insert(node.output, target);
    }

    let mut outputs = Vec::with_capacity(traced.outputs.len());
    for output in &traced.outputs {
        let mapped = value_map
            .get(&output.value)
            .copied()
            .ok_or(LowerError::UnresolvedOperator {
                name: format!("<output {}>", output.name),
                opset_version: options.opset_version,
            })?;
        outputs.push(GraphValue {
            name: output.name.clone(),
            value: mapped,
            spec: output.tensor.spec(),
        });
    }

    Ok(ExportedGraph {
        spec_version: SPEC_VERSION.to_string(),
        name: options.graph_name.clone(),
        opset_imports: builder.opset_imports,
        inputs,
        outputs,
        nodes: builder.nodes,
        functions: builder.functions.into_values().collect(),
    })
}

/// Lowers, serializes, and writes the graph to `path` as JSON. The file is
/// only created once lowering and serialization have both succeeded.
pub fn export_to_path<P: AsRef<Path>>(
    traced: &TracedGraph,
    registry: &RegistryContext,
    options: &ExportOptions,
    path: P,
) -> Result<(), ExportError> {
    let graph = lower_graph(traced, registry, options)?;
    graph.save_json(path)?;
    Ok(())
}

fn map_operands(
    node: &TracedNode,
    value_map: &HashMap<ValueId, ValueId>,
) -> Result<Vec<ValueId>, LowerError> {
    node.inputs
        .iter()
        .map(|value| {
            value_map
                .get(value)
                .copied()
                .ok_or(LowerError::UnsupportedAttribute {
                    op: node.op.to_string(),
                    message: format!("operand %{} was never lowered", value.0),
                })
        })
        .collect()
}

/// Fixed mapping from origin-namespace primitives to builtin ops. Exact
/// names only; anything else is an unresolved operator.
fn lower_builtin(
    builder: &mut ModuleBuilder,
    node: &TracedNode,
    inputs: Vec<ValueId>,
    opset_version: i64,
) -> Result<ValueId, LowerError> {
    let unresolved = || LowerError::UnresolvedOperator {
        name: node.op.to_string(),
        opset_version,
    };
    if node.op.domain != "aten" {
        return Err(unresolved());
    }
    let (op, attrs): (&str, BTreeMap<String, Attribute>) = match node.op.op.as_str() {
        "add" => ("Add", BTreeMap::new()),
        "sub" => ("Sub", BTreeMap::new()),
        "mul" => ("Mul", BTreeMap::new()),
        "div" => ("Div", BTreeMap::new()),
        "relu" => ("Relu", BTreeMap::new()),
        "selu" => ("Selu", BTreeMap::new()),
        "celu" => {
            let mut attrs = BTreeMap::new();
            if let Some(alpha) = node.attrs.get("alpha") {
                attrs.insert("alpha".to_string(), alpha.clone());
            }
            ("Celu", attrs)
        }
        "dropout" => {
            match node.attrs.get("train") {
                Some(Attribute::Int(0)) | None => {}
                _ => {
                    return Err(LowerError::UnsupportedAttribute {
                        op: node.op.to_string(),
                        message: "training-mode dropout has no deterministic lowering".to_string(),
                    })
                }
            }
            ("Identity", BTreeMap::new())
        }
        _ => return Err(unresolved()),
    };
    Ok(builder.push_node(QualName::builtin(op), inputs, attrs, node.spec.clone()))
}
