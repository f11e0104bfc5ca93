//! Graph capture: executes a model on concrete inputs while recording the
//! origin-namespace operations it performs.
//!
//! The tracer is an append-only node list. Every functional op computes its
//! eager result and emits exactly one [`TracedNode`], so the finished
//! [`TracedGraph`] carries both the operation sequence and the eager outputs
//! the verification harness compares against.

pub mod functional;

use std::collections::BTreeMap;

use crate::ir::{Attribute, QualName, TensorSpec, ValueId};
use crate::tensor::Tensor;

/// Distinguishes example inputs from module parameters at the graph boundary.
/// Both become named inputs of the exported graph; the role records intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    Arg,
    Param,
}

/// Named boundary value of a traced graph, carrying the concrete tensor it
/// was traced with so the harness can replay it through a runtime.
#[derive(Debug, Clone)]
pub struct TraceInput {
    pub name: String,
    pub value: ValueId,
    pub role: InputRole,
    pub tensor: Tensor,
}

/// One recorded operation: an origin-namespace op applied to earlier values.
#[derive(Debug, Clone)]
pub struct TracedNode {
    pub output: ValueId,
    pub op: QualName,
    pub inputs: Vec<ValueId>,
    pub attrs: BTreeMap<String, Attribute>,
    pub spec: TensorSpec,
}

/// Named traced output with its eager result.
#[derive(Debug, Clone)]
pub struct TraceOutput {
    pub name: String,
    pub value: ValueId,
    pub tensor: Tensor,
}

/// Finished capture: inputs, recorded nodes in execution order, and outputs.
#[derive(Debug, Clone)]
pub struct TracedGraph {
    pub inputs: Vec<TraceInput>,
    pub nodes: Vec<TracedNode>,
    pub outputs: Vec<TraceOutput>,
}

/// Handle returned by the tracer for every value flowing through a capture.
/// Holds the eager tensor alongside the SSA identifier.
#[derive(Debug, Clone)]
pub struct TraceTensor {
    value: ValueId,
    data: Tensor,
}

impl TraceTensor {
    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn spec(&self) -> TensorSpec {
        self.data.spec()
    }
}

/// Records operations during a single model execution.
pub struct Tracer {
    inputs: Vec<TraceInput>,
    nodes: Vec<TracedNode>,
    next_value: u32,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            nodes: Vec::new(),
            next_value: 0,
        }
    }

    fn allocate(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Declares an example input and returns its handle.
    pub fn input(&mut self, name: impl Into<String>, tensor: Tensor) -> TraceTensor {
        self.import(name, tensor, InputRole::Arg)
    }

    /// Declares a module parameter (weights, biases) as a graph input.
    pub fn param(&mut self, name: impl Into<String>, tensor: Tensor) -> TraceTensor {
        self.import(name, tensor, InputRole::Param)
    }

    fn import(&mut self, name: impl Into<String>, tensor: Tensor, role: InputRole) -> TraceTensor {
        let value = self.allocate();
        self.inputs.push(TraceInput {
            name: name.into(),
            value,
            role,
            tensor: tensor.clone(),
        });
        TraceTensor {
            value,
            data: tensor,
        }
    }

    /// Appends a node for an op that has already been executed eagerly and
    /// returns the handle for its result. Insertion order is execution order,
    /// which keeps the node list acyclic.
    pub fn emit(
        &mut self,
        op: QualName,
        inputs: &[&TraceTensor],
        attrs: BTreeMap<String, Attribute>,
        output: Tensor,
    ) -> TraceTensor {
        let value = self.allocate();
        self.nodes.push(TracedNode {
            output: value,
            op,
            inputs: inputs.iter().map(|t| t.value).collect(),
            attrs,
            spec: output.spec(),
        });
        TraceTensor {
            value,
            data: output,
        }
    }

    /// Consumes the tracer, naming the requested outputs.
    pub fn finish(self, outputs: Vec<(String, TraceTensor)>) -> TracedGraph {
        TracedGraph {
            inputs: self.inputs,
            nodes: self.nodes,
            outputs: outputs
                .into_iter()
                .map(|(name, tensor)| TraceOutput {
                    name,
                    value: tensor.value,
                    tensor: tensor.data,
                })
                .collect(),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}
