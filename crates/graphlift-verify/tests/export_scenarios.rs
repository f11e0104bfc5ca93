use graphlift::ir::{Attribute, Shape};
use graphlift::lower::{export_to_path, ExportOptions, LowerError};
use graphlift::nn::{Celu, Dropout, LayerNorm, Module, Selu};
use graphlift::registry::RegistryContext;
use graphlift::script;
use graphlift::tensor::Tensor;
use graphlift::trace::{functional, Tracer};
use graphlift_runtime_ref::register_reference_runtime;
use graphlift_verify::{run_case, VerifyError, VerifyOptions};
use rand::{rngs::StdRng, SeedableRng};

const SELU_SCRIPT: &str = r#"
func @onnxscript::Selu(%x: tensor) opset(15) {
  %alpha = CastLike(1.67326319217681884765625, %x)
  %gamma = CastLike(1.05070102214813232421875, %x)
  %zero = CastLike(0.0, %x)
  %neg = %gamma * (%alpha * Exp(%x) - %alpha)
  %pos = %gamma * %x
  return Where(%x <= %zero, %neg, %pos)
}
"#;

const LAYER_NORM_SCRIPT: &str = r#"
func @onnxscript::layer_norm(%x: tensor, %weight: tensor, %bias: tensor) opset(15) attrs(axes: ints, eps: float) {
  %mean = ReduceMean(%x, axes = @axes)
  %centered = %x - %mean
  %var = ReduceMean(%centered * %centered, axes = @axes)
  %inv_dev = Reciprocal(Sqrt(%var + @eps))
  %normalized = CastLike(%centered * %inv_dev, %weight)
  return %normalized * %weight + %bias
}
"#;

fn selu_registry() -> RegistryContext {
    let function = script::compile(SELU_SCRIPT).expect("selu definition compiles");
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::selu",
            |cx, _node| {
                let inputs = cx.inputs().to_vec();
                let spec = cx.output_spec().clone();
                cx.op("onnxscript::Selu")
                    .inputs(&inputs)
                    .output_type(spec)
                    .emit()
            },
            15,
            Some(function),
        )
        .expect("fresh registry has no conflicting entry");
    registry
}

fn layer_norm_registry() -> RegistryContext {
    let function = script::compile(LAYER_NORM_SCRIPT).expect("layer_norm definition compiles");
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::layer_norm",
            |cx, node| {
                // The replacement reduces over the trailing normalized axes,
                // counted from the end of the input shape.
                let rank = match node.attrs.get("normalized_shape") {
                    Some(Attribute::Ints(dims)) => dims.len() as i64,
                    _ => {
                        return Err(LowerError::UnsupportedAttribute {
                            op: node.op.to_string(),
                            message: "normalized_shape attribute is required".to_string(),
                        })
                    }
                };
                let axes: Vec<i64> = (1..=rank).rev().map(|i| -i).collect();
                let eps = node.attrs.get("eps").cloned().ok_or_else(|| {
                    LowerError::UnsupportedAttribute {
                        op: node.op.to_string(),
                        message: "eps attribute is required".to_string(),
                    }
                })?;
                let inputs = cx.inputs().to_vec();
                let spec = cx.output_spec().clone();
                cx.op("onnxscript::layer_norm")
                    .inputs(&inputs)
                    .attr("axes", Attribute::Ints(axes))
                    .attr("eps", eps)
                    .output_type(spec)
                    .emit()
            },
            15,
            Some(function),
        )
        .expect("fresh registry has no conflicting entry");
    registry
}

#[test]
fn selu_replacement_matches_eager_execution() {
    register_reference_runtime();
    let mut rng = StdRng::seed_from_u64(42);
    let x = Tensor::randn(Shape::new([1, 2, 3, 4]), 1.0, &mut rng);

    let registry = selu_registry();
    let report = run_case(
        vec![("x".to_string(), x)],
        &registry,
        &VerifyOptions::default(),
        |tracer, inputs| Selu.forward(tracer, inputs),
    )
    .expect("exported selu matches eager selu");

    let graph = &report.graph;
    assert_eq!(graph.nodes.len(), 1);
    assert_eq!(graph.nodes[0].op.to_string(), "onnxscript::Selu");
    assert!(graph.function("onnxscript", "Selu").is_some());
    assert_eq!(graph.opset_imports.get("onnxscript"), Some(&1));
    assert_eq!(graph.opset_imports.get(""), Some(&15));
}

#[test]
fn composite_model_with_layer_norm_replacement() {
    register_reference_runtime();
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::randn(Shape::new([2, 3]), 1.0, &mut rng);
    let y = Tensor::randn(Shape::new([2, 3]), 1.0, &mut rng);
    let z = Tensor::randn(Shape::new([2, 3]), 1.0, &mut rng);

    let celu1 = Celu::new(1.0);
    let celu2 = Celu::new(2.0);
    let norms: Vec<LayerNorm> = (0..3)
        .map(|i| LayerNorm::new(format!("ln{i}"), vec![3], i as f32))
        .collect();
    let mut dropout = Dropout::new(0.5);
    dropout.set_training(false);

    let registry = layer_norm_registry();
    let report = run_case(
        vec![
            ("x".to_string(), x),
            ("y".to_string(), y),
            ("z".to_string(), z),
        ],
        &registry,
        &VerifyOptions::default(),
        |tracer, inputs| {
            let a = celu1.forward(tracer, &inputs[0..1])?.remove(0);
            let b = celu2.forward(tracer, &inputs[1..2])?.remove(0);
            let sum = functional::add(tracer, &a, &b)?;
            let mut normed = inputs[2].clone();
            for norm in &norms {
                normed = norm.forward(tracer, std::slice::from_ref(&normed))?.remove(0);
            }
            let dropped = dropout.forward(tracer, std::slice::from_ref(&normed))?.remove(0);
            Ok(vec![sum, dropped])
        },
    )
    .expect("exported composite matches eager execution");

    let graph = &report.graph;
    let replaced: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|node| node.op.domain == "onnxscript")
        .map(|node| node.op.op.as_str())
        .collect();
    assert_eq!(replaced, vec!["layer_norm", "layer_norm", "layer_norm"]);
    // The function is attached once no matter how many call sites it has.
    assert_eq!(graph.functions.len(), 1);
    // Each call site carries its own eps.
    let eps_values: Vec<&Attribute> = graph
        .nodes
        .iter()
        .filter(|node| node.op.domain == "onnxscript")
        .map(|node| &node.attrs["eps"])
        .collect();
    assert_eq!(
        eps_values,
        vec![
            &Attribute::Float(0.0),
            &Attribute::Float(1.0),
            &Attribute::Float(2.0)
        ]
    );
}

#[test]
fn exported_graph_round_trips_through_json() {
    register_reference_runtime();
    let mut rng = StdRng::seed_from_u64(3);
    let x = Tensor::randn(Shape::new([1, 2, 3, 4]), 1.0, &mut rng);

    let registry = selu_registry();
    let report = run_case(
        vec![("x".to_string(), x)],
        &registry,
        &VerifyOptions::default(),
        |tracer, inputs| Selu.forward(tracer, inputs),
    )
    .expect("selu case passes");

    let json = report.graph.to_json_string().expect("graph serializes");
    let value: serde_json::Value = serde_json::from_str(&json).expect("output is valid json");
    assert_eq!(value["spec_version"], "glift.v1");
    assert_eq!(value["functions"][0]["name"], "Selu");
}

#[test]
fn unresolved_operator_fails_without_partial_file() {
    let mut tracer = Tracer::new();
    let x = tracer.input(
        "x",
        Tensor::from_vec(Shape::new([3]), vec![-1.0, 0.2, 1.0]).unwrap(),
    );
    let y = functional::hardshrink(&mut tracer, &x, 0.5).unwrap();
    let traced = tracer.finish(vec![("out".to_string(), y)]);

    let path = std::env::temp_dir().join(format!(
        "graphlift-unresolved-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let registry = RegistryContext::new();
    let err = export_to_path(&traced, &registry, &ExportOptions::default(), &path).unwrap_err();
    assert!(err
        .to_string()
        .contains("no primitive or registered mapping for `aten::hardshrink`"));
    assert!(!path.exists(), "failed export must not leave a file behind");
}

#[test]
fn divergent_replacement_is_reported() {
    register_reference_runtime();
    // Deliberately wrong substitution: relu is not selu on negative inputs.
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::selu",
            |cx, _node| {
                let inputs = cx.inputs().to_vec();
                let spec = cx.output_spec().clone();
                cx.op("Relu").inputs(&inputs).output_type(spec).emit()
            },
            15,
            None,
        )
        .unwrap();

    let x = Tensor::from_vec(Shape::new([2]), vec![-2.0, 1.0]).unwrap();
    let err = run_case(
        vec![("x".to_string(), x)],
        &registry,
        &VerifyOptions::default(),
        |tracer, inputs| Selu.forward(tracer, inputs),
    )
    .unwrap_err();
    match err {
        VerifyError::Divergence { output, .. } => assert_eq!(output, "out0"),
        other => panic!("expected divergence, got {other}"),
    }
}

#[test]
fn divergence_carries_max_deviation_not_first() {
    register_reference_runtime();
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::selu",
            |cx, _node| {
                let inputs = cx.inputs().to_vec();
                let spec = cx.output_spec().clone();
                cx.op("Relu").inputs(&inputs).output_type(spec).emit()
            },
            15,
            None,
        )
        .unwrap();

    // Element 0 barely violates tolerance (~1.8e-3); element 1 is off by
    // ~1.67. The report must point at element 0 but carry the larger
    // deviation.
    let x = Tensor::from_vec(Shape::new([2]), vec![-0.001, -3.0]).unwrap();
    let err = run_case(
        vec![("x".to_string(), x)],
        &registry,
        &VerifyOptions::default(),
        |tracer, inputs| Selu.forward(tracer, inputs),
    )
    .unwrap_err();
    match err {
        VerifyError::Divergence {
            index,
            max_deviation,
            ..
        } => {
            assert_eq!(index, 0);
            assert!(
                max_deviation > 1.0,
                "expected the largest deviation, got {max_deviation}"
            );
        }
        other => panic!("expected divergence, got {other}"),
    }
}

#[test]
fn missing_runtime_is_reported_by_name() {
    let x = Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0]).unwrap();
    let registry = selu_registry();
    let options = VerifyOptions {
        runtime: "accelerator-9000".to_string(),
        ..VerifyOptions::default()
    };
    let err = run_case(
        vec![("x".to_string(), x)],
        &registry,
        &options,
        |tracer, inputs| Selu.forward(tracer, inputs),
    )
    .unwrap_err();
    match err {
        VerifyError::MissingRuntime { name } => assert_eq!(name, "accelerator-9000"),
        other => panic!("expected missing runtime, got {other}"),
    }
}
