//! Compiler for custom-operator definitions.
//!
//! Definitions are written in a restricted expression language and compiled
//! eagerly into a [`LocalFunction`] before registration, so every language
//! violation surfaces at definition time rather than at a call site during
//! export.
//!
//! # Example
//! ```
//! use graphlift::script::compile;
//!
//! let function = compile(r#"
//! func @onnxscript::Selu(%x: tensor) opset(15) {
//!   %alpha = CastLike(1.67326, %x)
//!   %gamma = CastLike(1.0507, %x)
//!   %neg = %gamma * (%alpha * Exp(%x) - %alpha)
//!   %pos = %gamma * %x
//!   %zero = CastLike(0.0, %x)
//!   return Where(%x <= %zero, %neg, %pos)
//! }
//! "#).expect("valid definition");
//! assert_eq!(function.domain, "onnxscript");
//! assert_eq!(function.outputs.len(), 1);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::ir::{AttrKind, AttrParam, Attribute, FnNode, LocalFunction};

/// The fixed primitive-operator vocabulary a definition body may call.
/// Binary arithmetic and comparisons are reachable through operators as well.
pub const PRIMITIVES: &[&str] = &[
    "Abs",
    "Add",
    "CastLike",
    "Div",
    "Equal",
    "Exp",
    "Greater",
    "GreaterOrEqual",
    "Identity",
    "Less",
    "LessOrEqual",
    "Mul",
    "Neg",
    "Not",
    "Reciprocal",
    "ReduceMean",
    "Sqrt",
    "Sub",
    "Where",
];

/// Errors raised while compiling a definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("unsupported construct: {construct}")]
    UnsupportedConstruct { construct: String },
    #[error("unknown primitive operator `{name}`")]
    UnknownPrimitive { name: String },
    #[error("{0}")]
    Parse(String),
}

impl ScriptError {
    fn parse(msg: impl Into<String>) -> Self {
        ScriptError::Parse(msg.into())
    }

    fn unsupported(construct: impl Into<String>) -> Self {
        ScriptError::UnsupportedConstruct {
            construct: construct.into(),
        }
    }
}

/// Compiles a definition into a reusable local function.
pub fn compile(source: &str) -> Result<LocalFunction, ScriptError> {
    Compiler::new(source).compile()
}

struct Compiler<'a> {
    source: &'a str,
    nodes: Vec<FnNode>,
    defined: HashSet<String>,
    aliases: HashMap<String, String>,
    attr_params: Vec<AttrParam>,
    temp: usize,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            nodes: Vec::new(),
            defined: HashSet::new(),
            aliases: HashMap::new(),
            attr_params: Vec::new(),
            temp: 0,
        }
    }

    fn compile(mut self) -> Result<LocalFunction, ScriptError> {
        let trimmed = self.source.trim();
        if trimmed.is_empty() {
            return Err(ScriptError::parse("definition is empty"));
        }
        let header_end = trimmed
            .find('{')
            .ok_or_else(|| ScriptError::parse("missing `{` to start function body"))?;
        let body_end = trimmed
            .rfind('}')
            .ok_or_else(|| ScriptError::parse("missing `}` to end function body"))?;
        let header = trimmed[..header_end].trim();
        let body = trimmed[header_end + 1..body_end].trim();

        let header = self.parse_header(header)?;
        for input in &header.inputs {
            self.defined.insert(input.clone());
        }
        self.attr_params = header.attr_params.clone();

        let outputs = self.compile_body(body)?;
        if outputs.is_empty() {
            return Err(ScriptError::parse("definition must end with `return`"));
        }

        // Attribute-argument refs (`axes = @name`) land in node attrs without
        // passing through expression compilation; validate them here so an
        // undeclared reference fails at definition time, not at execution.
        for node in &self.nodes {
            for attr in node.attrs.values() {
                if let Attribute::Ref(name) = attr {
                    self.check_attr(name)?;
                }
            }
        }

        Ok(LocalFunction {
            domain: header.domain,
            name: header.name,
            opset_version: header.opset_version,
            inputs: header.inputs,
            attr_params: header.attr_params,
            body: self.nodes,
            outputs,
        })
    }

    // --- header -----------------------------------------------------------

    fn parse_header(&self, header: &str) -> Result<Header, ScriptError> {
        let rest = header
            .strip_prefix("func")
            .ok_or_else(|| ScriptError::parse("definition must start with `func`"))?
            .trim_start();
        let open = rest
            .find('(')
            .ok_or_else(|| ScriptError::parse("missing `(` in function header"))?;
        let close = find_matching_paren(rest, open)
            .ok_or_else(|| ScriptError::parse("missing `)` to close parameter list"))?;

        let name_section = rest[..open].trim();
        let qualified = name_section
            .strip_prefix('@')
            .unwrap_or(name_section)
            .trim();
        let (domain, name) = qualified
            .split_once("::")
            .ok_or_else(|| ScriptError::parse("function name must be `<domain>::<name>`"))?;
        if domain.is_empty() || name.is_empty() {
            return Err(ScriptError::parse("function name must be `<domain>::<name>`"));
        }

        let inputs = self.parse_parameters(&rest[open + 1..close])?;

        let mut opset_version = 15i64;
        let mut attr_params = Vec::new();
        let mut tail = rest[close + 1..].trim();
        while !tail.is_empty() {
            if let Some(after) = tail.strip_prefix("opset") {
                let (value, remaining) = take_paren_group(after)?;
                opset_version = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ScriptError::parse("opset version must be an integer"))?;
                tail = remaining.trim_start();
            } else if let Some(after) = tail.strip_prefix("attrs") {
                let (group, remaining) = take_paren_group(after)?;
                attr_params = parse_attr_params(group)?;
                tail = remaining.trim_start();
            } else {
                return Err(ScriptError::parse(format!(
                    "unexpected header trailer `{tail}`"
                )));
            }
        }

        Ok(Header {
            domain: domain.to_string(),
            name: name.to_string(),
            opset_version,
            inputs,
            attr_params,
        })
    }

    fn parse_parameters(&self, params: &str) -> Result<Vec<String>, ScriptError> {
        let params = params.trim();
        if params.is_empty() {
            return Ok(Vec::new());
        }
        split_top_level(params, ',')
            .into_iter()
            .map(|raw| {
                let decl = raw.trim();
                let (name, ty) = decl
                    .split_once(':')
                    .ok_or_else(|| ScriptError::parse("parameter must be `%name: tensor`"))?;
                if ty.contains('=') {
                    return Err(ScriptError::unsupported("default parameter value"));
                }
                let ty = ty.trim();
                if ty != "tensor" {
                    return Err(ScriptError::parse(format!(
                        "parameter type must be `tensor`, found `{ty}`"
                    )));
                }
                let name = name
                    .trim()
                    .strip_prefix('%')
                    .ok_or_else(|| ScriptError::parse("parameter name must start with `%`"))?;
                if name.is_empty() {
                    return Err(ScriptError::parse("parameter name cannot be empty"));
                }
                Ok(name.to_string())
            })
            .collect()
    }

    // --- body -------------------------------------------------------------

    fn compile_body(&mut self, body: &str) -> Result<Vec<String>, ScriptError> {
        let mut outputs: Vec<String> = Vec::new();
        for line in body.lines() {
            let statement = line.trim().trim_end_matches(';');
            if statement.is_empty() || statement.starts_with("//") {
                continue;
            }
            check_statement_constructs(statement)?;
            if let Some(values) = statement.strip_prefix("return") {
                if !outputs.is_empty() {
                    return Err(ScriptError::parse("multiple `return` statements"));
                }
                let values = values.trim();
                if values.is_empty() {
                    return Err(ScriptError::parse("`return` must produce at least one value"));
                }
                for (idx, raw) in split_top_level(values, ',').into_iter().enumerate() {
                    let expr = self.parse_expression(raw.trim())?;
                    let name = self.compile_to_value(expr, Some(&format!("ret{idx}")))?;
                    outputs.push(name);
                }
                continue;
            }
            if !outputs.is_empty() {
                return Err(ScriptError::parse("statements after `return`"));
            }
            self.compile_assignment(statement)?;
        }
        Ok(outputs)
    }

    fn compile_assignment(&mut self, statement: &str) -> Result<(), ScriptError> {
        let eq = find_assignment_eq(statement).ok_or_else(|| {
            ScriptError::parse(format!("statement is not an assignment: `{statement}`"))
        })?;
        let target = statement[..eq].trim();
        let target = target
            .strip_prefix('%')
            .ok_or_else(|| ScriptError::parse("assignment target must be a `%value`"))?;
        if self.defined.contains(target) || self.aliases.contains_key(target) {
            return Err(ScriptError::parse(format!(
                "value `%{target}` is assigned more than once"
            )));
        }
        let expr = self.parse_expression(statement[eq + 1..].trim())?;
        match expr {
            // A bare value reference is an alias, not an Identity node.
            Expr::Value(source) => {
                let resolved = self.resolve(&source)?;
                self.aliases.insert(target.to_string(), resolved);
            }
            other => {
                let name = self.compile_expr(other, Some(target))?;
                match name {
                    Value::Local(local) if local == target => {}
                    Value::Local(local) => {
                        self.aliases.insert(target.to_string(), local);
                    }
                    Value::Scalar(scalar) => {
                        self.materialize(scalar, Some(target))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_expression(&self, src: &str) -> Result<Expr, ScriptError> {
        let tokens = lex(src)?;
        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.parse_expr()?;
        if parser.pos != tokens.len() {
            return Err(ScriptError::parse(format!(
                "unexpected trailing input in `{src}`"
            )));
        }
        Ok(expr)
    }

    // --- expression lowering ---------------------------------------------

    fn compile_to_value(&mut self, expr: Expr, hint: Option<&str>) -> Result<String, ScriptError> {
        match self.compile_expr(expr, hint)? {
            Value::Local(name) => Ok(name),
            Value::Scalar(scalar) => self.materialize(scalar, hint),
        }
    }

    fn compile_expr(&mut self, expr: Expr, target: Option<&str>) -> Result<Value, ScriptError> {
        match expr {
            Expr::Number(value) => Ok(Value::Scalar(Scalar::Literal(value))),
            Expr::AttrRef(name) => {
                self.check_attr(&name)?;
                Ok(Value::Scalar(Scalar::Attr(name)))
            }
            Expr::Value(name) => Ok(Value::Local(self.resolve(&name)?)),
            Expr::Unary(operand) => {
                let value = self.compile_to_operand(*operand)?;
                Ok(Value::Local(self.push(
                    "Neg",
                    vec![value],
                    BTreeMap::new(),
                    target,
                )))
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.compile_expr(*lhs, None)?;
                let rhs = self.compile_expr(*rhs, None)?;
                let (a, b) = match (lhs, rhs) {
                    (Value::Local(a), Value::Local(b)) => (a, b),
                    (Value::Local(a), Value::Scalar(s)) => {
                        let b = self.materialize_like(s, &a)?;
                        (a, b)
                    }
                    (Value::Scalar(s), Value::Local(b)) => {
                        let a = self.materialize_like(s, &b)?;
                        (a, b)
                    }
                    (Value::Scalar(s1), Value::Scalar(s2)) => {
                        let a = self.materialize(s1, None)?;
                        let b = self.materialize(s2, None)?;
                        (a, b)
                    }
                };
                if op == BinOp::NotEqual {
                    let eq = self.push("Equal", vec![a, b], BTreeMap::new(), None);
                    return Ok(Value::Local(self.push(
                        "Not",
                        vec![eq],
                        BTreeMap::new(),
                        target,
                    )));
                }
                Ok(Value::Local(self.push(
                    op.op_type(),
                    vec![a, b],
                    BTreeMap::new(),
                    target,
                )))
            }
            Expr::Call { callee, args } => {
                if !PRIMITIVES.contains(&callee.as_str()) {
                    return Err(ScriptError::UnknownPrimitive { name: callee });
                }
                let mut inputs = Vec::new();
                let mut attrs = BTreeMap::new();
                for arg in args {
                    match arg {
                        CallArg::Positional(expr) => inputs.push(self.compile_to_operand(expr)?),
                        CallArg::Attr { name, value } => {
                            attrs.insert(name, value);
                        }
                    }
                }
                Ok(Value::Local(self.push(&callee, inputs, attrs, target)))
            }
        }
    }

    fn compile_to_operand(&mut self, expr: Expr) -> Result<String, ScriptError> {
        match self.compile_expr(expr, None)? {
            Value::Local(name) => Ok(name),
            // Literal call arguments become plain constants; ops like
            // CastLike define the matching themselves.
            Value::Scalar(scalar) => self.materialize(scalar, None),
        }
    }

    /// Wraps a literal or attribute reference as a graph constant.
    fn materialize(&mut self, scalar: Scalar, target: Option<&str>) -> Result<String, ScriptError> {
        let value = match scalar {
            Scalar::Literal(v) => Attribute::Float(v),
            Scalar::Attr(name) => Attribute::Ref(name),
        };
        let attrs = BTreeMap::from([("value".to_string(), value)]);
        Ok(self.push("Constant", Vec::new(), attrs, target))
    }

    /// Wraps a scalar as a constant and casts it to match the element type
    /// of the tensor operand it is mixed with.
    fn materialize_like(&mut self, scalar: Scalar, peer: &str) -> Result<String, ScriptError> {
        let constant = self.materialize(scalar, None)?;
        Ok(self.push(
            "CastLike",
            vec![constant, peer.to_string()],
            BTreeMap::new(),
            None,
        ))
    }

    fn push(
        &mut self,
        op: &str,
        inputs: Vec<String>,
        attrs: BTreeMap<String, Attribute>,
        target: Option<&str>,
    ) -> String {
        let output = match target {
            Some(name) => name.to_string(),
            None => loop {
                let candidate = format!("t{}", self.temp);
                self.temp += 1;
                if !self.defined.contains(&candidate) {
                    break candidate;
                }
            },
        };
        self.defined.insert(output.clone());
        self.nodes.push(FnNode {
            output: output.clone(),
            op: op.to_string(),
            inputs,
            attrs,
        });
        output
    }

    fn resolve(&self, name: &str) -> Result<String, ScriptError> {
        if let Some(alias) = self.aliases.get(name) {
            return Ok(alias.clone());
        }
        if self.defined.contains(name) {
            return Ok(name.to_string());
        }
        Err(ScriptError::parse(format!("unknown value `%{name}`")))
    }

    fn check_attr(&self, name: &str) -> Result<(), ScriptError> {
        if self.attr_params.iter().any(|param| param.name == name) {
            Ok(())
        } else {
            Err(ScriptError::parse(format!(
                "unknown attribute parameter `@{name}`"
            )))
        }
    }
}

struct Header {
    domain: String,
    name: String,
    opset_version: i64,
    inputs: Vec<String>,
    attr_params: Vec<AttrParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Less,
    LessOrEqual,
    Equal,
    GreaterOrEqual,
    Greater,
    NotEqual,
}

impl BinOp {
    fn op_type(self) -> &'static str {
        match self {
            BinOp::Add => "Add",
            BinOp::Sub => "Sub",
            BinOp::Mul => "Mul",
            BinOp::Div => "Div",
            BinOp::Less => "Less",
            BinOp::LessOrEqual => "LessOrEqual",
            BinOp::Equal => "Equal",
            BinOp::GreaterOrEqual => "GreaterOrEqual",
            BinOp::Greater => "Greater",
            BinOp::NotEqual => "Not",
        }
    }
}

#[derive(Debug)]
enum Expr {
    Number(f64),
    Value(String),
    AttrRef(String),
    Unary(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<CallArg>,
    },
}

#[derive(Debug)]
enum CallArg {
    Positional(Expr),
    Attr { name: String, value: Attribute },
}

enum Value {
    Local(String),
    Scalar(Scalar),
}

enum Scalar {
    Literal(f64),
    Attr(String),
}

// --- lexer ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    ValueRef(String),
    AttrRef(String),
    Number(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Assign,
    Op(BinOp),
}

fn lex(src: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (token, width) = match two.as_str() {
                    "<=" => (Token::Op(BinOp::LessOrEqual), 2),
                    ">=" => (Token::Op(BinOp::GreaterOrEqual), 2),
                    "==" => (Token::Op(BinOp::Equal), 2),
                    "!=" => (Token::Op(BinOp::NotEqual), 2),
                    _ if c == '<' => (Token::Op(BinOp::Less), 1),
                    _ if c == '>' => (Token::Op(BinOp::Greater), 1),
                    _ if c == '=' => (Token::Assign, 1),
                    _ => return Err(ScriptError::parse(format!("unexpected `{c}`"))),
                };
                tokens.push(token);
                i += width;
            }
            '%' | '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                if end == start {
                    return Err(ScriptError::parse(format!("dangling `{c}`")));
                }
                let name: String = chars[start..end].iter().collect();
                tokens.push(if c == '%' {
                    Token::ValueRef(name)
                } else {
                    Token::AttrRef(name)
                });
                i = end;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut end = i;
                while end < chars.len() {
                    let d = chars[end];
                    let exponent_sign = (d == '+' || d == '-')
                        && end > start
                        && matches!(chars[end - 1], 'e' | 'E');
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                        end += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..end].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ScriptError::parse(format!("malformed number `{text}`")))?;
                tokens.push(Token::Number(value));
                i = end;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end;
            }
            _ => return Err(ScriptError::parse(format!("unexpected character `{c}`"))),
        }
    }
    Ok(tokens)
}

// --- expression parser ----------------------------------------------------

struct ExprParser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> Result<(), ScriptError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(ScriptError::parse(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    // Single, non-associative comparison above additive precedence.
    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        let lhs = self.parse_additive()?;
        if let Some(Token::Op(op)) = self.peek() {
            if matches!(
                op,
                BinOp::Less
                    | BinOp::LessOrEqual
                    | BinOp::Equal
                    | BinOp::GreaterOrEqual
                    | BinOp::Greater
                    | BinOp::NotEqual
            ) {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_additive()?;
                return Ok(Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                });
            }
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_term()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if let Some(Token::Op(BinOp::Sub)) = self.peek() {
            self.pos += 1;
            // Fold negation into numeric literals.
            if let Some(Token::Number(value)) = self.peek() {
                let value = *value;
                self.pos += 1;
                return Ok(Expr::Number(-value));
            }
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next().cloned() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::ValueRef(name)) => Ok(Expr::Value(name)),
            Some(Token::AttrRef(name)) => Ok(Expr::AttrRef(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Err(ScriptError::parse(
                "array literals are only valid as attribute arguments",
            )),
            Some(Token::Ident(name)) => {
                self.expect(&Token::LParen)?;
                let args = self.parse_call_args()?;
                Ok(Expr::Call { callee: name, args })
            }
            other => Err(ScriptError::parse(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>, ScriptError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            // `name = value` introduces an attribute argument.
            let is_attr = matches!(
                (self.peek(), self.tokens.get(self.pos + 1)),
                (Some(Token::Ident(_)), Some(Token::Assign))
            );
            if is_attr {
                let name = match self.next().cloned() {
                    Some(Token::Ident(name)) => name,
                    _ => unreachable!("checked by is_attr"),
                };
                self.pos += 1; // consume `=`
                let value = self.parse_attr_value()?;
                args.push(CallArg::Attr { name, value });
            } else {
                args.push(CallArg::Positional(self.parse_expr()?));
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(ScriptError::parse(format!(
                        "expected `,` or `)` in call, found {other:?}"
                    )))
                }
            }
        }
        Ok(args)
    }

    fn parse_attr_value(&mut self) -> Result<Attribute, ScriptError> {
        match self.next().cloned() {
            Some(Token::AttrRef(name)) => Ok(Attribute::Ref(name)),
            Some(Token::Number(value)) => Ok(number_attr(value)),
            Some(Token::Op(BinOp::Sub)) => match self.next().cloned() {
                Some(Token::Number(value)) => Ok(number_attr(-value)),
                other => Err(ScriptError::parse(format!(
                    "expected number after `-`, found {other:?}"
                ))),
            },
            Some(Token::LBracket) => {
                let mut values = Vec::new();
                loop {
                    match self.next().cloned() {
                        Some(Token::RBracket) => break,
                        Some(Token::Number(value)) => values.push(value),
                        Some(Token::Op(BinOp::Sub)) => match self.next().cloned() {
                            Some(Token::Number(value)) => values.push(-value),
                            other => {
                                return Err(ScriptError::parse(format!(
                                    "expected number after `-`, found {other:?}"
                                )))
                            }
                        },
                        Some(Token::Comma) => continue,
                        other => {
                            return Err(ScriptError::parse(format!(
                                "unexpected token {other:?} in attribute list"
                            )))
                        }
                    }
                }
                if values.iter().all(|v| v.fract() == 0.0) {
                    Ok(Attribute::Ints(values.into_iter().map(|v| v as i64).collect()))
                } else {
                    Ok(Attribute::Floats(values))
                }
            }
            other => Err(ScriptError::parse(format!(
                "unexpected attribute value {other:?}"
            ))),
        }
    }
}

fn number_attr(value: f64) -> Attribute {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Attribute::Int(value as i64)
    } else {
        Attribute::Float(value)
    }
}

// --- helpers --------------------------------------------------------------

/// Rejects language features outside the restricted subset before the
/// statement is lexed, so violations are reported by construct name.
fn check_statement_constructs(statement: &str) -> Result<(), ScriptError> {
    let first = statement.split_whitespace().next().unwrap_or("");
    match first {
        "for" => return Err(ScriptError::unsupported("`for` loop")),
        "while" => return Err(ScriptError::unsupported("`while` loop")),
        "if" | "else" | "elif" => return Err(ScriptError::unsupported("conditional statement")),
        "def" | "lambda" => return Err(ScriptError::unsupported("nested function definition")),
        _ => {}
    }
    if statement.contains('[') && statement.contains(" for ") {
        return Err(ScriptError::unsupported("comprehension"));
    }
    Ok(())
}

fn find_assignment_eq(statement: &str) -> Option<usize> {
    let bytes = statement.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte != b'=' {
            continue;
        }
        let prev = idx.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(idx + 1);
        let part_of_comparison = matches!(prev, Some(b'<') | Some(b'>') | Some(b'!') | Some(b'='))
            || matches!(next, Some(b'='));
        if !part_of_comparison {
            return Some(idx);
        }
    }
    None
}

fn parse_attr_params(group: &str) -> Result<Vec<AttrParam>, ScriptError> {
    let group = group.trim();
    if group.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(group, ',')
        .into_iter()
        .map(|raw| {
            let decl = raw.trim();
            let (name, kind) = decl
                .split_once(':')
                .ok_or_else(|| ScriptError::parse("attribute must be `name: kind`"))?;
            let kind = match kind.trim() {
                "int" => AttrKind::Int,
                "float" => AttrKind::Float,
                "str" => AttrKind::Str,
                "ints" => AttrKind::Ints,
                "floats" => AttrKind::Floats,
                other => {
                    return Err(ScriptError::parse(format!(
                        "unknown attribute kind `{other}`"
                    )))
                }
            };
            Ok(AttrParam {
                name: name.trim().to_string(),
                kind,
            })
        })
        .collect()
}

fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if c == separator && depth == 0 {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn find_matching_paren(input: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, c) in input.char_indices().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn take_paren_group(input: &str) -> Result<(&str, &str), ScriptError> {
    let input = input.trim_start();
    if !input.starts_with('(') {
        return Err(ScriptError::parse("expected `(`"));
    }
    let close = find_matching_paren(input, 0)
        .ok_or_else(|| ScriptError::parse("missing `)` in header"))?;
    Ok((&input[1..close], &input[close + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_mixed_with_tensor_gets_cast_to_match() {
        let function = compile(
            r#"
            func @ex::scale(%x: tensor) {
              return %x * 2.0
            }
            "#,
        )
        .unwrap();
        let ops: Vec<&str> = function.body.iter().map(|n| n.op.as_str()).collect();
        assert_eq!(ops, vec!["Constant", "CastLike", "Mul"]);
    }

    #[test]
    fn attribute_reference_in_arithmetic() {
        let function = compile(
            r#"
            func @ex::shift(%x: tensor) attrs(eps: float) {
              return %x + @eps
            }
            "#,
        )
        .unwrap();
        let constant = &function.body[0];
        assert_eq!(constant.op, "Constant");
        assert_eq!(
            constant.attrs.get("value"),
            Some(&Attribute::Ref("eps".to_string()))
        );
    }

    #[test]
    fn default_parameter_value_is_rejected() {
        let err = compile("func @ex::f(%x: tensor = 1.0) { return %x }").unwrap_err();
        assert_eq!(
            err,
            ScriptError::UnsupportedConstruct {
                construct: "default parameter value".to_string()
            }
        );
    }

    #[test]
    fn unknown_callee_is_rejected_at_compile_time() {
        let err = compile("func @ex::f(%x: tensor) { return Softmax(%x) }").unwrap_err();
        assert_eq!(
            err,
            ScriptError::UnknownPrimitive {
                name: "Softmax".to_string()
            }
        );
    }
}
