//! Serialized graph format emitted by the lowering engine.
//!
//! An [`ExportedGraph`] is an ordered, acyclic list of single-output nodes plus
//! the local functions it calls and the opset version declared per domain.
//! Once produced it is immutable; the execution runtime consumes it as-is.

use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs, io,
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frozen exchange-format version enforced on load.
pub const SPEC_VERSION: &str = "glift.v1";

/// Opset version a custom domain is imported at. Local functions became
/// expressible in the default domain at opset 15, so custom domains start at 1.
pub const CUSTOM_DOMAIN_VERSION: i64 = 1;

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Scalar element types supported by the exchange format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I64,
    I32,
    Bool,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Returns `true` when the dtype is a signed integer.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::I64 | DType::I32)
    }
}

/// Logical tensor shape. Extents are static; dynamic dimensions are out of
/// scope for the export pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// A rank-0 shape holding a single element.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }
}

/// Unique identifier for values produced by graph inputs and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Attribute payloads are limited to scalars and flat arrays so they stay
/// easy to serialize, hash, and validate across runtimes. `Ref` names an
/// attribute parameter of the enclosing local function and is resolved at
/// call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Ref(String),
}

/// Declared kind of a local-function attribute parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrKind {
    Int,
    Float,
    Str,
    Ints,
    Floats,
}

/// Qualified operator name: `<domain>::<op>`, with the empty domain naming
/// the builtin primitive namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualName {
    pub domain: String,
    pub op: String,
}

impl QualName {
    pub fn new(domain: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            op: op.into(),
        }
    }

    /// Names a builtin primitive (empty domain).
    pub fn builtin(op: impl Into<String>) -> Self {
        Self {
            domain: String::new(),
            op: op.into(),
        }
    }

    /// Parses the `<namespace>::<op>` qualified form; a bare name maps to
    /// the builtin domain.
    pub fn parse(qualified: &str) -> Result<Self, InvalidQualName> {
        match qualified.split_once("::") {
            Some((domain, op)) => {
                if op.is_empty() || op.contains("::") {
                    return Err(InvalidQualName(qualified.to_string()));
                }
                Ok(Self::new(domain, op))
            }
            None if !qualified.is_empty() => Ok(Self::builtin(qualified)),
            None => Err(InvalidQualName(qualified.to_string())),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.domain.is_empty()
    }
}

impl fmt::Display for QualName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.op)
        } else {
            write!(f, "{}::{}", self.domain, self.op)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{0}` is not a valid `<namespace>::<op>` operator name")]
pub struct InvalidQualName(pub String);

/// Single node in an exported graph. Inputs must reference graph inputs or
/// nodes defined earlier in the list, so the graph is acyclic by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub output: ValueId,
    pub op: QualName,
    pub inputs: Vec<ValueId>,
    // Always serialized, even when empty: the binary encoding is positional.
    #[serde(default)]
    pub attrs: BTreeMap<String, Attribute>,
    pub spec: TensorSpec,
}

/// Named, typed graph boundary value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphValue {
    pub name: String,
    pub value: ValueId,
    pub spec: TensorSpec,
}

/// Attribute parameter declared by a local function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrParam {
    pub name: String,
    pub kind: AttrKind,
}

/// Operand of a node inside a local-function body; a plain local value name.
pub type FnOperandName = String;

/// Node inside a local-function body. Bodies only call builtin primitives,
/// so the op is an unqualified op-type string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnNode {
    pub output: String,
    pub op: String,
    pub inputs: Vec<FnOperandName>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Attribute>,
}

/// A named, reusable subgraph usable as a single node under its domain.
///
/// `opset_version` is the builtin opset the body targets; the domain itself
/// is imported at [`CUSTOM_DOMAIN_VERSION`]. `domain + name + opset_version`
/// uniquely identifies a function within a registry and a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFunction {
    pub domain: String,
    pub name: String,
    pub opset_version: i64,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attr_params: Vec<AttrParam>,
    pub body: Vec<FnNode>,
    pub outputs: Vec<String>,
}

impl LocalFunction {
    pub fn qualified_name(&self) -> QualName {
        QualName::new(self.domain.clone(), self.name.clone())
    }
}

/// Complete exported module: graph, local functions, and the opset version
/// declared per domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedGraph {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub name: String,
    pub opset_imports: BTreeMap<String, i64>,
    pub inputs: Vec<GraphValue>,
    pub outputs: Vec<GraphValue>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub functions: Vec<LocalFunction>,
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("graph spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum GraphIoError {
    #[error(transparent)]
    Serialization(#[from] GraphSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Structural violations found by [`ExportedGraph::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("node `{op}` references value %{value} before it is defined")]
    UndefinedValue { op: String, value: u32 },
    #[error("value %{value} is defined more than once")]
    DuplicateValue { value: u32 },
    #[error("graph output `{name}` references undefined value %{value}")]
    UndefinedOutput { name: String, value: u32 },
    #[error("domain `{domain}` is used but missing from opset imports")]
    MissingOpsetImport { domain: String },
}

impl ExportedGraph {
    pub fn to_json_string(&self) -> Result<String, GraphSerdeError> {
        serde_json::to_string_pretty(self).map_err(GraphSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, GraphSerdeError> {
        let mut graph: ExportedGraph = serde_json::from_str(src)?;
        graph.spec_version = normalize_spec_version(graph.spec_version)?;
        Ok(graph)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, GraphSerdeError> {
        bincode::serialize(self).map_err(GraphSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, GraphSerdeError> {
        let mut graph: ExportedGraph = bincode::deserialize(bytes)?;
        graph.spec_version = normalize_spec_version(graph.spec_version)?;
        Ok(graph)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(GraphIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, GraphIoError> {
        let contents = fs::read_to_string(path).map_err(GraphIoError::from)?;
        ExportedGraph::from_json_str(&contents).map_err(GraphIoError::from)
    }

    /// Looks up a local function by domain and name.
    pub fn function(&self, domain: &str, name: &str) -> Option<&LocalFunction> {
        self.functions
            .iter()
            .find(|function| function.domain == domain && function.name == name)
    }

    /// Checks the structural invariants: every node input references a graph
    /// input or an earlier node, no value is defined twice, outputs resolve,
    /// and every used domain has an opset import.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        let mut defined: HashSet<ValueId> = HashSet::new();
        for input in &self.inputs {
            if !defined.insert(input.value) {
                return Err(GraphValidationError::DuplicateValue {
                    value: input.value.0,
                });
            }
        }
        for node in &self.nodes {
            for operand in &node.inputs {
                if !defined.contains(operand) {
                    return Err(GraphValidationError::UndefinedValue {
                        op: node.op.to_string(),
                        value: operand.0,
                    });
                }
            }
            if !defined.insert(node.output) {
                return Err(GraphValidationError::DuplicateValue {
                    value: node.output.0,
                });
            }
            if !self.opset_imports.contains_key(&node.op.domain) {
                return Err(GraphValidationError::MissingOpsetImport {
                    domain: node.op.domain.clone(),
                });
            }
        }
        for output in &self.outputs {
            if !defined.contains(&output.value) {
                return Err(GraphValidationError::UndefinedOutput {
                    name: output.name.clone(),
                    value: output.value.0,
                });
            }
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, GraphSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(GraphSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

impl fmt::Display for ExportedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph @{} (spec_version = {}) {{",
            self.name, self.spec_version
        )?;
        for (domain, version) in &self.opset_imports {
            let shown = if domain.is_empty() { "<builtin>" } else { domain };
            writeln!(f, "  opset {shown} = {version}")?;
        }
        for input in &self.inputs {
            writeln!(
                f,
                "  input {} = %{} : {}",
                input.name,
                input.value.0,
                format_spec(&input.spec)
            )?;
        }
        for node in &self.nodes {
            write!(f, "  %{} = {}(", node.output.0, node.op)?;
            for (idx, operand) in node.inputs.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "%{}", operand.0)?;
            }
            write!(f, ")")?;
            if !node.attrs.is_empty() {
                write!(f, " {{")?;
                for (idx, (name, attr)) in node.attrs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = {attr:?}")?;
                }
                write!(f, "}}")?;
            }
            writeln!(f, " : {}", format_spec(&node.spec))?;
        }
        for output in &self.outputs {
            writeln!(f, "  output {} = %{}", output.name, output.value.0)?;
        }
        for function in &self.functions {
            writeln!(
                f,
                "  func @{}::{} (opset {})",
                function.domain, function.name, function.opset_version
            )?;
        }
        writeln!(f, "}}")
    }
}

fn format_spec(spec: &TensorSpec) -> String {
    let dims: Vec<String> = spec.shape.dims().iter().map(|d| d.to_string()).collect();
    format!("tensor<{:?}, {}>", spec.dtype, dims.join("x"))
}
