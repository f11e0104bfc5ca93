use graphlift::ir::{AttrKind, Attribute};
use graphlift::script::{compile, ScriptError};

const SELU: &str = r#"
func @onnxscript::Selu(%x: tensor) opset(15) {
  %alpha = CastLike(1.67326, %x)
  %gamma = CastLike(1.0507, %x)
  %zero = CastLike(0.0, %x)
  %neg = %gamma * (%alpha * Exp(%x) - %alpha)
  %pos = %gamma * %x
  return Where(%x <= %zero, %neg, %pos)
}
"#;

#[test]
fn selu_definition_compiles() {
    let function = compile(SELU).unwrap();
    assert_eq!(function.domain, "onnxscript");
    assert_eq!(function.name, "Selu");
    assert_eq!(function.opset_version, 15);
    assert_eq!(function.inputs, vec!["x".to_string()]);
    assert_eq!(function.outputs.len(), 1);
    // Comparison and Where must both appear in the compiled body.
    assert!(function.body.iter().any(|n| n.op == "LessOrEqual"));
    assert!(function.body.iter().any(|n| n.op == "Where"));
}

#[test]
fn attribute_parameters_are_declared_and_referenced() {
    let function = compile(
        r#"
        func @onnxscript::layer_norm(%x: tensor, %weight: tensor, %bias: tensor) attrs(axes: ints, eps: float) {
          %mean = ReduceMean(%x, axes = @axes)
          %centered = %x - %mean
          %var = ReduceMean(%centered * %centered, axes = @axes)
          %inv_dev = Reciprocal(Sqrt(%var + @eps))
          return %centered * %inv_dev * %weight + %bias
        }
        "#,
    )
    .unwrap();
    assert_eq!(function.attr_params.len(), 2);
    assert_eq!(function.attr_params[0].name, "axes");
    assert_eq!(function.attr_params[0].kind, AttrKind::Ints);
    let reduce = function
        .body
        .iter()
        .find(|n| n.op == "ReduceMean")
        .expect("body reduces over the normalized axes");
    assert_eq!(
        reduce.attrs.get("axes"),
        Some(&Attribute::Ref("axes".to_string()))
    );
}

#[test]
fn scientific_notation_literals_lex() {
    let function = compile(
        r#"
        func @ex::tiny_scale(%x: tensor) {
          return %x * 1e-3
        }
        "#,
    )
    .unwrap();
    let constant = function
        .body
        .iter()
        .find(|n| n.op == "Constant")
        .expect("literal wraps as a constant");
    assert_eq!(constant.attrs.get("value"), Some(&Attribute::Float(1e-3)));
}

#[test]
fn loops_are_rejected_at_definition_time() {
    let err = compile(
        r#"
        func @ex::bad(%x: tensor) {
          for %i in %x
          return %x
        }
        "#,
    )
    .unwrap_err();
    assert_eq!(
        err,
        ScriptError::UnsupportedConstruct {
            construct: "`for` loop".to_string()
        }
    );
}

#[test]
fn comprehensions_are_rejected_at_definition_time() {
    let err = compile(
        r#"
        func @ex::bad(%x: tensor) {
          %axes = [i for i in [1, 2]]
          return %x
        }
        "#,
    )
    .unwrap_err();
    assert_eq!(
        err,
        ScriptError::UnsupportedConstruct {
            construct: "comprehension".to_string()
        }
    );
}

#[test]
fn undeclared_attribute_argument_fails_at_compile_time() {
    let err = compile(
        r#"
        func @ex::bad(%x: tensor) attrs(axes: ints) {
          return ReduceMean(%x, axes = @undeclared)
        }
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::Parse(_)));
}

#[test]
fn undeclared_attribute_reference_is_an_error() {
    let err = compile(
        r#"
        func @ex::bad(%x: tensor) {
          return %x + @eps
        }
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::Parse(_)));
}

#[test]
fn unknown_value_reference_is_an_error() {
    let err = compile("func @ex::bad(%x: tensor) { return %y }").unwrap_err();
    assert!(matches!(err, ScriptError::Parse(_)));
}
