//! Graph interpreter and builtin kernels.
//!
//! Nodes are evaluated in list order. Builtin ops map straight to kernels;
//! custom-domain ops are inlined from the local function attached to the
//! graph, with `Ref` attributes resolved against the call site.

use std::collections::{BTreeMap, HashMap};

use graphlift::ir::{Attribute, DType, ExportedGraph, LocalFunction, Node, Shape};
use graphlift::runtime::RuntimeError;
use graphlift::tensor::{Tensor, TensorData};

pub fn run_graph(
    graph: &ExportedGraph,
    inputs: &BTreeMap<String, Tensor>,
) -> Result<BTreeMap<String, Tensor>, RuntimeError> {
    graph
        .validate()
        .map_err(|err| RuntimeError::InvalidGraph(err.to_string()))?;

    let mut values: HashMap<graphlift::ir::ValueId, Tensor> = HashMap::new();
    for input in &graph.inputs {
        let tensor = inputs
            .get(&input.name)
            .ok_or_else(|| RuntimeError::MissingInput {
                name: input.name.clone(),
            })?;
        if tensor.spec() != input.spec {
            return Err(RuntimeError::InvalidGraph(format!(
                "input `{}` bound with {:?}, graph declares {:?}",
                input.name,
                tensor.spec(),
                input.spec
            )));
        }
        values.insert(input.value, tensor.clone());
    }

    for node in &graph.nodes {
        let operands: Vec<&Tensor> = node
            .inputs
            .iter()
            .map(|id| {
                values
                    .get(id)
                    .ok_or_else(|| RuntimeError::InvalidGraph(format!("value %{} undefined", id.0)))
            })
            .collect::<Result<_, _>>()?;
        let result = eval_node(graph, node, &operands)?;
        values.insert(node.output, result);
    }

    let mut outputs = BTreeMap::new();
    for output in &graph.outputs {
        let tensor = values
            .get(&output.value)
            .cloned()
            .ok_or_else(|| RuntimeError::InvalidGraph(format!("output `{}` undefined", output.name)))?;
        outputs.insert(output.name.clone(), tensor);
    }
    Ok(outputs)
}

fn eval_node(graph: &ExportedGraph, node: &Node, operands: &[&Tensor]) -> Result<Tensor, RuntimeError> {
    if node.op.is_builtin() {
        return eval_builtin(&node.op.op, operands, &node.attrs);
    }
    let function = graph
        .function(&node.op.domain, &node.op.op)
        .ok_or_else(|| RuntimeError::MissingFunction {
            name: node.op.to_string(),
        })?;
    eval_function(function, operands, &node.attrs)
}

/// Inlines one call to a local function. Tensor parameters bind positionally;
/// `Ref` attributes in the body resolve against the call-site attributes.
fn eval_function(
    function: &LocalFunction,
    operands: &[&Tensor],
    call_attrs: &BTreeMap<String, Attribute>,
) -> Result<Tensor, RuntimeError> {
    let qualified = format!("{}::{}", function.domain, function.name);
    if operands.len() != function.inputs.len() {
        return Err(RuntimeError::InvalidGraph(format!(
            "`{qualified}` called with {} operands, declares {}",
            operands.len(),
            function.inputs.len()
        )));
    }

    let mut env: HashMap<&str, Tensor> = HashMap::new();
    for (name, tensor) in function.inputs.iter().zip(operands.iter()) {
        env.insert(name.as_str(), (*tensor).clone());
    }

    for fn_node in &function.body {
        let mut attrs = BTreeMap::new();
        for (name, attr) in &fn_node.attrs {
            let resolved = match attr {
                Attribute::Ref(param) => call_attrs
                    .get(param)
                    .cloned()
                    .ok_or_else(|| RuntimeError::BadAttribute {
                        op: qualified.clone(),
                        name: param.clone(),
                    })?,
                other => other.clone(),
            };
            attrs.insert(name.clone(), resolved);
        }
        let inputs: Vec<&Tensor> = fn_node
            .inputs
            .iter()
            .map(|name| {
                env.get(name.as_str()).ok_or_else(|| {
                    RuntimeError::InvalidGraph(format!(
                        "`{qualified}` references undefined value `{name}`"
                    ))
                })
            })
            .collect::<Result<_, _>>()?;
        let result = eval_builtin(&fn_node.op, &inputs, &attrs)?;
        env.insert(fn_node.output.as_str(), result);
    }

    let output = function
        .outputs
        .first()
        .ok_or_else(|| RuntimeError::InvalidGraph(format!("`{qualified}` declares no outputs")))?;
    env.remove(output.as_str())
        .ok_or_else(|| RuntimeError::InvalidGraph(format!("`{qualified}` never defines `{output}`")))
}

fn eval_builtin(
    op: &str,
    inputs: &[&Tensor],
    attrs: &BTreeMap<String, Attribute>,
) -> Result<Tensor, RuntimeError> {
    match op {
        "Add" => binary_f32(op, inputs, |a, b| a + b),
        "Sub" => binary_f32(op, inputs, |a, b| a - b),
        "Mul" => binary_f32(op, inputs, |a, b| a * b),
        "Div" => binary_f32(op, inputs, |a, b| a / b),
        "Exp" => unary_f32(op, inputs, f32::exp),
        "Sqrt" => unary_f32(op, inputs, f32::sqrt),
        "Reciprocal" => unary_f32(op, inputs, f32::recip),
        "Neg" => unary_f32(op, inputs, |v| -v),
        "Abs" => unary_f32(op, inputs, f32::abs),
        "Relu" => unary_f32(op, inputs, |v| v.max(0.0)),
        "Identity" => {
            let x = arity(op, inputs, 1)?[0];
            Ok(x.clone())
        }
        "Selu" => {
            // Defaults fixed by the operator specification.
            let alpha = float_attr(attrs, "alpha").unwrap_or(1.673_263_2);
            let gamma = float_attr(attrs, "gamma").unwrap_or(1.050_701_0);
            unary_f32(op, inputs, move |v| {
                if v > 0.0 {
                    gamma * v
                } else {
                    gamma * alpha * (v.exp() - 1.0)
                }
            })
        }
        "Celu" => {
            let alpha = float_attr(attrs, "alpha").unwrap_or(1.0);
            unary_f32(op, inputs, move |v| {
                v.max(0.0) + (alpha * ((v / alpha).exp() - 1.0)).min(0.0)
            })
        }
        "Less" => compare(op, inputs, |a, b| a < b),
        "LessOrEqual" => compare(op, inputs, |a, b| a <= b),
        "Greater" => compare(op, inputs, |a, b| a > b),
        "GreaterOrEqual" => compare(op, inputs, |a, b| a >= b),
        "Equal" => compare(op, inputs, |a, b| a == b),
        "Not" => {
            let x = arity(op, inputs, 1)?[0];
            let mask = tensor_err(op, x.as_bool())?;
            let flipped = mask.iter().map(|v| !v).collect();
            tensor_err(op, Tensor::from_bool(x.shape().clone(), flipped))
        }
        "Where" => eval_where(inputs),
        "CastLike" => eval_cast_like(inputs),
        "Constant" => eval_constant(attrs),
        "ReduceMean" => eval_reduce_mean(inputs, attrs),
        other => Err(RuntimeError::UnsupportedOp {
            op: other.to_string(),
        }),
    }
}

// --- kernels --------------------------------------------------------------

fn eval_where(inputs: &[&Tensor]) -> Result<Tensor, RuntimeError> {
    let [cond, on_true, on_false] = arity3("Where", inputs)?;
    let mask = tensor_err("Where", cond.as_bool())?;
    let a = tensor_err("Where", on_true.as_f32())?;
    let b = tensor_err("Where", on_false.as_f32())?;
    let shape = broadcast_shape(
        "Where",
        &broadcast_shape("Where", cond.shape().dims(), on_true.shape().dims())?,
        on_false.shape().dims(),
    )?;
    let cond_strides = broadcast_strides(cond.shape().dims(), &shape);
    let true_strides = broadcast_strides(on_true.shape().dims(), &shape);
    let false_strides = broadcast_strides(on_false.shape().dims(), &shape);
    let count: usize = shape.iter().product();
    let mut out = Vec::with_capacity(count);
    for flat in 0..count {
        let index = unravel(flat, &shape);
        let selected = if mask[offset(&index, &cond_strides)] {
            a[offset(&index, &true_strides)]
        } else {
            b[offset(&index, &false_strides)]
        };
        out.push(selected);
    }
    tensor_err("Where", Tensor::from_vec(Shape::new(shape), out))
}

fn eval_cast_like(inputs: &[&Tensor]) -> Result<Tensor, RuntimeError> {
    let pair = arity("CastLike", inputs, 2)?;
    let (source, target) = (pair[0], pair[1]);
    let result = match target.dtype() {
        DType::F32 => {
            let values = match source.data() {
                TensorData::F32(values) => values.clone(),
                TensorData::I64(values) => values.iter().map(|v| *v as f32).collect(),
                TensorData::Bool(values) => {
                    values.iter().map(|v| if *v { 1.0 } else { 0.0 }).collect()
                }
            };
            Tensor::from_vec(source.shape().clone(), values)
        }
        DType::I64 => {
            let values = match source.data() {
                TensorData::F32(values) => values.iter().map(|v| *v as i64).collect(),
                TensorData::I64(values) => values.clone(),
                TensorData::Bool(values) => values.iter().map(|v| i64::from(*v)).collect(),
            };
            Tensor::from_i64(source.shape().clone(), values)
        }
        DType::Bool => {
            let values = match source.data() {
                TensorData::F32(values) => values.iter().map(|v| *v != 0.0).collect(),
                TensorData::I64(values) => values.iter().map(|v| *v != 0).collect(),
                TensorData::Bool(values) => values.clone(),
            };
            Tensor::from_bool(source.shape().clone(), values)
        }
        other => {
            return Err(RuntimeError::Kernel {
                op: "CastLike".to_string(),
                message: format!("cast to {other:?} not supported"),
            })
        }
    };
    tensor_err("CastLike", result)
}

fn eval_constant(attrs: &BTreeMap<String, Attribute>) -> Result<Tensor, RuntimeError> {
    let value = attrs.get("value").ok_or_else(|| RuntimeError::BadAttribute {
        op: "Constant".to_string(),
        name: "value".to_string(),
    })?;
    let tensor = match value {
        Attribute::Float(v) => Tensor::scalar(*v as f32),
        Attribute::Int(v) => Tensor::from_i64(Shape::scalar(), vec![*v])
            .expect("scalar payload matches scalar shape"),
        Attribute::Floats(values) => {
            let data: Vec<f32> = values.iter().map(|v| *v as f32).collect();
            tensor_err("Constant", Tensor::from_vec(Shape::new([data.len()]), data))?
        }
        Attribute::Ints(values) => tensor_err(
            "Constant",
            Tensor::from_i64(Shape::new([values.len()]), values.clone()),
        )?,
        Attribute::Str(_) | Attribute::Ref(_) => {
            return Err(RuntimeError::BadAttribute {
                op: "Constant".to_string(),
                name: "value".to_string(),
            })
        }
    };
    Ok(tensor)
}

fn eval_reduce_mean(
    inputs: &[&Tensor],
    attrs: &BTreeMap<String, Attribute>,
) -> Result<Tensor, RuntimeError> {
    let x = arity("ReduceMean", inputs, 1)?[0];
    let values = tensor_err("ReduceMean", x.as_f32())?;
    let dims = x.shape().dims();
    let rank = dims.len() as i64;

    let axes = match attrs.get("axes") {
        Some(Attribute::Ints(axes)) => axes.clone(),
        Some(_) => {
            return Err(RuntimeError::BadAttribute {
                op: "ReduceMean".to_string(),
                name: "axes".to_string(),
            })
        }
        None => (0..rank).collect(),
    };
    let keepdims = match attrs.get("keepdims") {
        Some(Attribute::Int(v)) => *v != 0,
        None => true,
        Some(_) => {
            return Err(RuntimeError::BadAttribute {
                op: "ReduceMean".to_string(),
                name: "keepdims".to_string(),
            })
        }
    };

    let mut reduced = vec![false; dims.len()];
    for axis in axes {
        let resolved = if axis < 0 { axis + rank } else { axis };
        if resolved < 0 || resolved >= rank {
            return Err(RuntimeError::Kernel {
                op: "ReduceMean".to_string(),
                message: format!("axis {axis} out of range for rank {rank}"),
            });
        }
        reduced[resolved as usize] = true;
    }

    let out_dims: Vec<usize> = dims
        .iter()
        .enumerate()
        .filter_map(|(i, d)| match (reduced[i], keepdims) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(*d),
        })
        .collect();
    let out_count: usize = out_dims.iter().product::<usize>().max(1);
    let group: usize = dims
        .iter()
        .enumerate()
        .filter(|(i, _)| reduced[*i])
        .map(|(_, d)| *d)
        .product::<usize>()
        .max(1);

    let mut sums = vec![0.0f32; out_count];
    for (flat, value) in values.iter().enumerate() {
        let index = unravel(flat, dims);
        let mut out_flat = 0usize;
        for (i, pos) in index.iter().enumerate() {
            let extent = if reduced[i] { 1 } else { dims[i] };
            let pos = if reduced[i] { 0 } else { *pos };
            out_flat = out_flat * extent + pos;
        }
        sums[out_flat] += value;
    }
    let mean: Vec<f32> = sums.into_iter().map(|s| s / group as f32).collect();
    tensor_err("ReduceMean", Tensor::from_vec(Shape::new(out_dims), mean))
}

// --- elementwise helpers --------------------------------------------------

fn unary_f32(
    op: &str,
    inputs: &[&Tensor],
    f: impl Fn(f32) -> f32,
) -> Result<Tensor, RuntimeError> {
    let x = arity(op, inputs, 1)?[0];
    tensor_err(op, x.map_f32(f))
}

fn binary_f32(
    op: &str,
    inputs: &[&Tensor],
    f: impl Fn(f32, f32) -> f32,
) -> Result<Tensor, RuntimeError> {
    let (shape, a_offsets, b_offsets, a, b) = broadcast_pair(op, inputs)?;
    let out = a_offsets
        .zip(b_offsets)
        .map(|(i, j)| f(a[i], b[j]))
        .collect();
    tensor_err(op, Tensor::from_vec(Shape::new(shape), out))
}

fn compare(
    op: &str,
    inputs: &[&Tensor],
    f: impl Fn(f32, f32) -> bool,
) -> Result<Tensor, RuntimeError> {
    let (shape, a_offsets, b_offsets, a, b) = broadcast_pair(op, inputs)?;
    let out = a_offsets
        .zip(b_offsets)
        .map(|(i, j)| f(a[i], b[j]))
        .collect();
    tensor_err(op, Tensor::from_bool(Shape::new(shape), out))
}

type BroadcastPair<'t> = (
    Vec<usize>,
    std::vec::IntoIter<usize>,
    std::vec::IntoIter<usize>,
    &'t [f32],
    &'t [f32],
);

fn broadcast_pair<'t>(op: &str, inputs: &[&'t Tensor]) -> Result<BroadcastPair<'t>, RuntimeError> {
    let pair = arity(op, inputs, 2)?;
    let (lhs, rhs) = (pair[0], pair[1]);
    let a = tensor_err(op, lhs.as_f32())?;
    let b = tensor_err(op, rhs.as_f32())?;
    let shape = broadcast_shape(op, lhs.shape().dims(), rhs.shape().dims())?;
    let a_strides = broadcast_strides(lhs.shape().dims(), &shape);
    let b_strides = broadcast_strides(rhs.shape().dims(), &shape);
    let count: usize = shape.iter().product();
    let mut a_offsets = Vec::with_capacity(count);
    let mut b_offsets = Vec::with_capacity(count);
    for flat in 0..count {
        let index = unravel(flat, &shape);
        a_offsets.push(offset(&index, &a_strides));
        b_offsets.push(offset(&index, &b_strides));
    }
    Ok((shape, a_offsets.into_iter(), b_offsets.into_iter(), a, b))
}

/// Trailing-aligned broadcast of two shapes.
fn broadcast_shape(op: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>, RuntimeError> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = dim_from_end(a, rank - 1 - i, rank);
        let db = dim_from_end(b, rank - 1 - i, rank);
        let extent = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(RuntimeError::Kernel {
                    op: op.to_string(),
                    message: format!("cannot broadcast {x} against {y} (shapes {a:?}, {b:?})"),
                })
            }
        };
        out.push(extent);
    }
    Ok(out)
}

fn dim_from_end(dims: &[usize], position: usize, rank: usize) -> usize {
    let pad = rank - dims.len();
    if position < pad {
        1
    } else {
        dims[position - pad]
    }
}

/// Row-major strides into `dims`, with zero stride on broadcast axes.
fn broadcast_strides(dims: &[usize], out: &[usize]) -> Vec<usize> {
    let pad = out.len() - dims.len();
    let mut strides = vec![0usize; out.len()];
    let mut stride = 1usize;
    for i in (0..dims.len()).rev() {
        strides[pad + i] = if dims[i] == 1 { 0 } else { stride };
        stride *= dims[i];
    }
    strides
}

fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0usize; dims.len()];
    for i in (0..dims.len()).rev() {
        index[i] = flat % dims[i];
        flat /= dims[i];
    }
    index
}

fn offset(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

// --- small utilities ------------------------------------------------------

fn arity<'t>(op: &str, inputs: &[&'t Tensor], expected: usize) -> Result<Vec<&'t Tensor>, RuntimeError> {
    if inputs.len() != expected {
        return Err(RuntimeError::Kernel {
            op: op.to_string(),
            message: format!("expects {expected} inputs, got {}", inputs.len()),
        });
    }
    Ok(inputs.to_vec())
}

fn arity3<'t>(op: &str, inputs: &[&'t Tensor]) -> Result<[&'t Tensor; 3], RuntimeError> {
    match inputs {
        [a, b, c] => Ok([a, b, c]),
        _ => Err(RuntimeError::Kernel {
            op: op.to_string(),
            message: format!("expects 3 inputs, got {}", inputs.len()),
        }),
    }
}

fn float_attr(attrs: &BTreeMap<String, Attribute>, name: &str) -> Option<f32> {
    match attrs.get(name) {
        Some(Attribute::Float(v)) => Some(*v as f32),
        Some(Attribute::Int(v)) => Some(*v as f32),
        _ => None,
    }
}

fn tensor_err<T>(op: &str, result: anyhow::Result<T>) -> Result<T, RuntimeError> {
    result.map_err(|err| RuntimeError::Kernel {
        op: op.to_string(),
        message: err.to_string(),
    })
}
