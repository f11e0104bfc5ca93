pub mod ir;
pub mod lower;
pub mod nn;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod tensor;
pub mod trace;

pub use ir::{Attribute, DType, ExportedGraph, LocalFunction, QualName, Shape, TensorSpec, ValueId};
pub use lower::{export_to_path, lower_graph, ExportOptions, LowerContext, LowerError};
pub use registry::RegistryContext;
pub use runtime::GraphRuntime;
pub use tensor::Tensor;
pub use trace::{TraceTensor, Tracer};
