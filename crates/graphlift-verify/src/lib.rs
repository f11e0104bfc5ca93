//! Verification harness: traces a model, lowers it through a registry,
//! round-trips the serialized graph, executes it on a named runtime, and
//! compares against the eager results elementwise.

use std::collections::BTreeMap;

use thiserror::Error;

use graphlift::ir::{ExportedGraph, GraphSerdeError};
use graphlift::lower::{lower_graph, ExportOptions, LowerError};
use graphlift::registry::RegistryContext;
use graphlift::runtime::{self, RuntimeError};
use graphlift::tensor::Tensor;
use graphlift::trace::{TraceTensor, Tracer};

/// Default absolute tolerance for eager-vs-exported comparison.
pub const ATOL: f64 = 5e-4;
/// Default relative tolerance for eager-vs-exported comparison.
pub const RTOL: f64 = 1e-4;

/// Per-case knobs. `runtime` names an engine in the global runtime registry.
#[derive(Clone)]
pub struct VerifyOptions {
    pub runtime: String,
    pub export: ExportOptions,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            runtime: "reference-cpu".to_string(),
            export: ExportOptions::default(),
            atol: ATOL,
            rtol: RTOL,
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("tracing failed: {0}")]
    Trace(#[source] anyhow::Error),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Serde(#[from] GraphSerdeError),
    #[error("no runtime named `{name}` is registered")]
    MissingRuntime { name: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("runtime produced no output named `{name}`")]
    MissingOutput { name: String },
    #[error(
        "output `{output}`[{index}] diverged: eager {eager}, exported {exported} \
         (max deviation {max_deviation:.3e} exceeds atol {atol:.0e} + rtol {rtol:.0e})"
    )]
    Divergence {
        output: String,
        index: usize,
        eager: f32,
        exported: f32,
        max_deviation: f64,
        atol: f64,
        rtol: f64,
    },
}

/// Outcome of a passing case, kept around so tests can inspect the exported
/// graph and the runtime outputs.
#[derive(Debug)]
pub struct VerifyReport {
    pub graph: ExportedGraph,
    pub outputs: BTreeMap<String, Tensor>,
    pub max_deviation: f64,
}

/// Drives one case end to end: trace, lower against `registry`, round-trip
/// the binary encoding, execute on the configured runtime, and compare every
/// output against the eager result within `atol + rtol * |expected|`.
pub fn run_case<F>(
    inputs: Vec<(String, Tensor)>,
    registry: &RegistryContext,
    options: &VerifyOptions,
    model: F,
) -> Result<VerifyReport, VerifyError>
where
    F: FnOnce(&mut Tracer, &[TraceTensor]) -> anyhow::Result<Vec<TraceTensor>>,
{
    let mut tracer = Tracer::new();
    let handles: Vec<TraceTensor> = inputs
        .into_iter()
        .map(|(name, tensor)| tracer.input(name, tensor))
        .collect();
    let results = model(&mut tracer, &handles).map_err(VerifyError::Trace)?;
    let named: Vec<(String, TraceTensor)> = results
        .into_iter()
        .enumerate()
        .map(|(idx, tensor)| (format!("out{idx}"), tensor))
        .collect();
    let traced = tracer.finish(named);

    let graph = lower_graph(&traced, registry, &options.export)?;
    // Round-trip the wire encoding so the runtime only ever sees what a
    // consumer would deserialize.
    let bytes = graph.to_bincode_bytes()?;
    let graph = ExportedGraph::from_bincode_slice(&bytes)?;

    let runtime =
        runtime::get_runtime(&options.runtime).ok_or_else(|| VerifyError::MissingRuntime {
            name: options.runtime.clone(),
        })?;

    let mut bound: BTreeMap<String, Tensor> = BTreeMap::new();
    for input in &traced.inputs {
        bound.insert(input.name.clone(), input.tensor.clone());
    }
    let outputs = runtime.run(&graph, &bound)?;

    let mut max_deviation = 0.0f64;
    for expected in &traced.outputs {
        let actual = outputs
            .get(&expected.name)
            .ok_or_else(|| VerifyError::MissingOutput {
                name: expected.name.clone(),
            })?;
        let deviation = compare_output(
            &expected.name,
            &expected.tensor,
            actual,
            options.atol,
            options.rtol,
        )?;
        max_deviation = max_deviation.max(deviation);
    }

    Ok(VerifyReport {
        graph,
        outputs,
        max_deviation,
    })
}

fn compare_output(
    name: &str,
    eager: &Tensor,
    exported: &Tensor,
    atol: f64,
    rtol: f64,
) -> Result<f64, VerifyError> {
    let expected = eager.as_f32().map_err(VerifyError::Trace)?;
    let actual = exported
        .as_f32()
        .map_err(|err| RuntimeError::Kernel {
            op: format!("<output {name}>"),
            message: err.to_string(),
        })?;
    if expected.len() != actual.len() {
        return Err(VerifyError::MissingOutput {
            name: format!("{name} (length mismatch)"),
        });
    }
    // Scan the whole output before reporting, so the error carries the max
    // deviation even when an earlier element is the first to violate.
    let mut max_deviation = 0.0f64;
    let mut first_mismatch: Option<(usize, f32, f32)> = None;
    for (index, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        let deviation = (*a as f64 - *b as f64).abs();
        max_deviation = max_deviation.max(deviation);
        if deviation > atol + rtol * (*b as f64).abs() && first_mismatch.is_none() {
            first_mismatch = Some((index, *b, *a));
        }
    }
    if let Some((index, eager, exported)) = first_mismatch {
        return Err(VerifyError::Divergence {
            output: name.to_string(),
            index,
            eager,
            exported,
            max_deviation,
            atol,
            rtol,
        });
    }
    Ok(max_deviation)
}
