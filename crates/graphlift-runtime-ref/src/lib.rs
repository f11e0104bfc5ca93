pub mod exec;

use std::collections::BTreeMap;
use std::sync::Arc;

use graphlift::ir::ExportedGraph;
use graphlift::runtime::{GraphRuntime, RuntimeError};
use graphlift::tensor::Tensor;

/// Reference interpreter for exported graphs. Single-threaded, host tensors,
/// no fusion; correctness is the only goal.
#[derive(Default)]
pub struct ReferenceCpuRuntime;

impl ReferenceCpuRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl GraphRuntime for ReferenceCpuRuntime {
    fn name(&self) -> &str {
        "reference-cpu"
    }

    fn run(
        &self,
        graph: &ExportedGraph,
        inputs: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, Tensor>, RuntimeError> {
        exec::run_graph(graph, inputs)
    }
}

/// Registers the reference runtime with the global runtime registry.
///
/// Called automatically via a static initializer, but can also be called
/// manually to make sure the runtime is available.
pub fn register_reference_runtime() {
    graphlift::runtime::register_runtime(Arc::new(ReferenceCpuRuntime::new()));
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_REFERENCE_RUNTIME: extern "C" fn() = {
    extern "C" fn register() {
        register_reference_runtime();
    }
    register
};
