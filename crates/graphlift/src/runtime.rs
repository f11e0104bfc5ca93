//! Execution-runtime abstraction and global runtime registry.
//!
//! Runtimes consume a finished [`ExportedGraph`] and named input tensors.
//! They live behind a process-wide registry so verification harnesses can
//! pick an engine by name without linking against it directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use crate::ir::ExportedGraph;
use crate::tensor::Tensor;

/// Errors raised while executing an exported graph.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("graph input `{name}` was not bound")]
    MissingInput { name: String },
    #[error("runtime has no kernel for `{op}`")]
    UnsupportedOp { op: String },
    #[error("local function `{name}` is not attached to the graph")]
    MissingFunction { name: String },
    #[error("attribute `{name}` of `{op}` is missing or has the wrong kind")]
    BadAttribute { op: String, name: String },
    #[error("`{op}`: {message}")]
    Kernel { op: String, message: String },
    #[error("malformed graph: {0}")]
    InvalidGraph(String),
}

/// An engine that can execute exported graphs.
pub trait GraphRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the graph with the given named inputs and returns the named
    /// outputs in graph order.
    fn run(
        &self,
        graph: &ExportedGraph,
        inputs: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, Tensor>, RuntimeError>;
}

struct RuntimeRegistry {
    runtimes: RwLock<HashMap<String, Arc<dyn GraphRuntime>>>,
}

impl RuntimeRegistry {
    fn new() -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, runtime: Arc<dyn GraphRuntime>) {
        self.runtimes
            .write()
            .expect("runtime registry poisoned")
            .insert(runtime.name().to_string(), runtime);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn GraphRuntime>> {
        self.runtimes
            .read()
            .expect("runtime registry poisoned")
            .get(name)
            .cloned()
    }

    fn list(&self) -> Vec<String> {
        let mut runtimes: Vec<String> = self
            .runtimes
            .read()
            .expect("runtime registry poisoned")
            .keys()
            .cloned()
            .collect();
        runtimes.sort();
        runtimes
    }
}

static GLOBAL_REGISTRY: OnceLock<RuntimeRegistry> = OnceLock::new();

fn registry() -> &'static RuntimeRegistry {
    GLOBAL_REGISTRY.get_or_init(RuntimeRegistry::new)
}

pub fn register_runtime(runtime: Arc<dyn GraphRuntime>) {
    registry().register(runtime);
}

pub fn get_runtime(name: &str) -> Option<Arc<dyn GraphRuntime>> {
    registry().get(name)
}

pub fn list_runtimes() -> Vec<String> {
    registry().list()
}
