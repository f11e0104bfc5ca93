use graphlift::ir::{DType, Shape, TensorSpec};
use graphlift::lower::{lower_graph, ExportOptions, LowerError};
use graphlift::registry::RegistryContext;
use graphlift::script;
use graphlift::tensor::Tensor;
use graphlift::trace::{functional, TracedGraph, Tracer};

fn trace_selu() -> TracedGraph {
    let mut tracer = Tracer::new();
    let x = tracer.input(
        "x",
        Tensor::from_vec(Shape::new([2]), vec![-1.0, 1.0]).unwrap(),
    );
    let y = functional::selu(&mut tracer, &x).unwrap();
    tracer.finish(vec![("out".to_string(), y)])
}

#[test]
fn builtin_table_lowers_known_primitives() {
    let mut tracer = Tracer::new();
    let a = tracer.input("a", Tensor::ones(Shape::new([2, 2])));
    let b = tracer.input("b", Tensor::ones(Shape::new([2, 2])));
    let sum = functional::add(&mut tracer, &a, &b).unwrap();
    let traced = tracer.finish(vec![("out".to_string(), sum)]);

    let graph = lower_graph(&traced, &RegistryContext::new(), &ExportOptions::default()).unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert_eq!(graph.nodes[0].op.to_string(), "Add");
    assert_eq!(graph.opset_imports.len(), 1);
    assert_eq!(graph.opset_imports.get(""), Some(&15));
    graph.validate().unwrap();
}

#[test]
fn selu_without_registration_uses_builtin_op() {
    let traced = trace_selu();
    let graph = lower_graph(&traced, &RegistryContext::new(), &ExportOptions::default()).unwrap();
    assert_eq!(graph.nodes[0].op.to_string(), "Selu");
    assert!(graph.functions.is_empty());
}

#[test]
fn registered_rewrite_attaches_function_and_domain_import() {
    let function = script::compile(
        r#"
        func @onnxscript::Selu(%x: tensor) opset(15) {
          %alpha = CastLike(1.67326, %x)
          %gamma = CastLike(1.0507, %x)
          %zero = CastLike(0.0, %x)
          %neg = %gamma * (%alpha * Exp(%x) - %alpha)
          return Where(%x <= %zero, %neg, %gamma * %x)
        }
        "#,
    )
    .unwrap();
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
        .unwrap();

    let traced = trace_selu();
    let graph = lower_graph(&traced, &registry, &ExportOptions::default()).unwrap();
    assert_eq!(graph.nodes[0].op.to_string(), "onnxscript::Selu");
    assert!(graph.function("onnxscript", "Selu").is_some());
    assert_eq!(graph.opset_imports.get("onnxscript"), Some(&1));
    graph.validate().unwrap();
}

#[test]
fn registration_scoped_to_other_opset_is_ignored() {
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
            14,
            None,
        )
        .unwrap();

    let traced = trace_selu();
    let graph = lower_graph(&traced, &registry, &ExportOptions::default()).unwrap();
    // Export targets opset 15; the opset-14 entry must not match.
    assert_eq!(graph.nodes[0].op.to_string(), "Selu");
}

#[test]
fn rewrite_with_wrong_output_type_fails() {
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::selu",
            |cx, _node| {
                let inputs = cx.inputs().to_vec();
                let wrong = TensorSpec::new(DType::F32, Shape::new([7]));
                cx.op("onnxscript::Selu")
                    .inputs(&inputs)
                    .output_type(wrong)
                    .emit()
            },
            15,
            None,
        )
        .unwrap();

    let traced = trace_selu();
    let err = lower_graph(&traced, &registry, &ExportOptions::default()).unwrap_err();
    match err {
        LowerError::OutputTypeMismatch { op, expected, found } => {
            assert_eq!(op, "aten::selu");
            assert_eq!(expected.shape.dims(), &[2]);
            assert_eq!(found.shape.dims(), &[7]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn rewrite_without_output_type_fails() {
    let mut registry = RegistryContext::new();
    registry
        .register_custom_op_symbolic(
            "aten::selu",
            |cx, _node| {
                let inputs = cx.inputs().to_vec();
                cx.op("onnxscript::Selu").inputs(&inputs).emit()
            },
            15,
            None,
        )
        .unwrap();

    let traced = trace_selu();
    let err = lower_graph(&traced, &registry, &ExportOptions::default()).unwrap_err();
    assert!(matches!(err, LowerError::MissingOutputType { .. }));
}

#[test]
fn unresolved_operator_names_op_and_opset() {
    let mut tracer = Tracer::new();
    let x = tracer.input("x", Tensor::ones(Shape::new([2])));
    let y = functional::hardshrink(&mut tracer, &x, 0.5).unwrap();
    let traced = tracer.finish(vec![("out".to_string(), y)]);

    let err = lower_graph(&traced, &RegistryContext::new(), &ExportOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LowerError::UnresolvedOperator {
            name: "aten::hardshrink".to_string(),
            opset_version: 15
        }
    );
}

#[test]
fn eval_mode_dropout_lowers_to_identity() {
    let mut tracer = Tracer::new();
    let x = tracer.input("x", Tensor::ones(Shape::new([4])));
    let y = functional::dropout(&mut tracer, &x, 0.5, false).unwrap();
    let traced = tracer.finish(vec![("out".to_string(), y)]);

    let graph = lower_graph(&traced, &RegistryContext::new(), &ExportOptions::default()).unwrap();
    assert_eq!(graph.nodes[0].op.to_string(), "Identity");
}
