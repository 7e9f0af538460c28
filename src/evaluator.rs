use crate::ast::{AssignTarget, BinaryOp, Expr, LogicalOp, Program, Stmt, UnaryOp};
use crate::error::{AtmarkError, Span};
use crate::interp::Interpreter;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::pseudo;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// A mutable binding environment: the interpreter-wide globals, or the
/// stack-scoped locals of a nested expansion or macro call.
pub type Bindings = HashMap<String, Value>;

/// The evaluator bridge.  The interpreter delegates all host expression
/// and statement evaluation through this trait, so another engine can be
/// plugged in without the markup layer caring.
pub trait Engine {
    fn evaluate(
        &self,
        code: &str,
        interp: &mut Interpreter,
        locals: Option<&mut Bindings>,
    ) -> Result<Value, AtmarkError>;

    fn execute(
        &self,
        code: &str,
        interp: &mut Interpreter,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError>;
}

/// The built-in host language engine: lex, parse, and tree-walk.
pub struct ExprEngine;

impl Engine for ExprEngine {
    fn evaluate(
        &self,
        code: &str,
        interp: &mut Interpreter,
        locals: Option<&mut Bindings>,
    ) -> Result<Value, AtmarkError> {
        let tokens = Lexer::new(code).scan_tokens()?;
        let expr = Parser::new(tokens).parse_expression()?;
        Evaluator::new(interp, locals).evaluate_expression(&expr)
    }

    fn execute(
        &self,
        code: &str,
        interp: &mut Interpreter,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let tokens = Lexer::new(code).scan_tokens()?;
        let program = Parser::new(tokens).parse()?;
        Evaluator::new(interp, locals).evaluate_program(&program)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Type,
    Str,
    Int,
    Float,
    Repr,
    Range,
    Keys,
    Sorted,
    Defined,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Type => "type",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Repr => "repr",
            Builtin::Range => "range",
            Builtin::Keys => "keys",
            Builtin::Sorted => "sorted",
            Builtin::Defined => "defined",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        match name {
            "print" => Some(Builtin::Print),
            "len" => Some(Builtin::Len),
            "type" => Some(Builtin::Type),
            "str" => Some(Builtin::Str),
            "int" => Some(Builtin::Int),
            "float" => Some(Builtin::Float),
            "repr" => Some(Builtin::Repr),
            "range" => Some(Builtin::Range),
            "keys" => Some(Builtin::Keys),
            "sorted" => Some(Builtin::Sorted),
            "defined" => Some(Builtin::Defined),
            _ => None,
        }
    }
}

/// Call a callable value from outside an expression context (at-exit
/// routines, hooks).
pub fn call_callable(
    interp: &mut Interpreter,
    callable: Value,
    args: Vec<Value>,
    locals: Option<&mut Bindings>,
) -> Result<Value, AtmarkError> {
    match callable {
        Value::Macro(def) => {
            if def.params.len() != args.len() {
                return Err(AtmarkError::eval(format!(
                    "macro '{}' takes {} arguments, got {}",
                    def.name,
                    def.params.len(),
                    args.len()
                )));
            }
            let mut macro_locals: Bindings =
                def.params.iter().cloned().zip(args).collect();
            let expansion = interp.expand(&def.body, Some(&mut macro_locals))?;
            Ok(Value::String(expansion))
        }
        Value::Bound(op) => pseudo::call(op, args, interp, locals),
        Value::Builtin(builtin) => {
            call_builtin(builtin, args, interp, None, &Span::single(0))
        }
        other => Err(AtmarkError::eval(format!(
            "{} is not callable",
            other.type_name()
        ))),
    }
}

/// Tree-walking evaluator for embedded host code.  Constructed fresh per
/// evaluation around the interpreter, so prints and pseudo-module calls
/// reach the current stream by plain context passing.
pub struct Evaluator<'a> {
    interp: &'a mut Interpreter,
    locals: Option<&'a mut Bindings>,
}

impl<'a> Evaluator<'a> {
    pub fn new(interp: &'a mut Interpreter, locals: Option<&'a mut Bindings>) -> Self {
        Self { interp, locals }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(locals) = &self.locals {
            if let Some(value) = locals.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.interp.globals().get(name) {
            return Some(value.clone());
        }
        Builtin::lookup(name).map(Value::Builtin)
    }

    fn assign_name(&mut self, name: &str, value: Value) {
        match &mut self.locals {
            Some(locals) => {
                locals.insert(name.to_string(), value);
            }
            None => {
                self.interp.globals_mut().insert(name.to_string(), value);
            }
        }
    }

    pub fn evaluate_program(&mut self, program: &Program) -> Result<(), AtmarkError> {
        for statement in &program.statements {
            self.execute_statement(statement)?;
        }
        Ok(())
    }

    fn execute_statement(&mut self, stmt: &Stmt) -> Result<(), AtmarkError> {
        match stmt {
            Stmt::Expression { expr, .. } => {
                self.evaluate_expression(expr)?;
                Ok(())
            }
            Stmt::Block { statements, .. } => {
                for statement in statements {
                    self.execute_statement(statement)?;
                }
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let condition_value = self.evaluate_expression(condition)?;
                if condition_value.is_truthy() {
                    self.execute_statement(then_branch)?;
                } else if let Some(else_stmt) = else_branch {
                    self.execute_statement(else_stmt)?;
                }
                Ok(())
            }
            Stmt::While {
                condition, body, ..
            } => {
                while self.evaluate_expression(condition)?.is_truthy() {
                    self.execute_statement(body)?;
                }
                Ok(())
            }
            Stmt::For {
                initializer,
                condition,
                increment,
                body,
                ..
            } => {
                if let Some(init) = initializer {
                    self.execute_statement(init)?;
                }

                loop {
                    if let Some(cond) = condition {
                        if !self.evaluate_expression(cond)?.is_truthy() {
                            break;
                        }
                    }

                    self.execute_statement(body)?;

                    if let Some(inc) = increment {
                        self.evaluate_expression(inc)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn evaluate_expression(&mut self, expr: &Expr) -> Result<Value, AtmarkError> {
        match expr {
            Expr::Literal { value, .. } => Ok(value.clone()),
            Expr::Variable { name, span } => self.lookup(name).ok_or_else(|| {
                AtmarkError::runtime(span.clone(), format!("Undefined variable '{}'", name))
            }),
            Expr::Assign { name, value, .. } => {
                let val = self.evaluate_expression(value)?;
                self.assign_name(name, val.clone());
                Ok(val)
            }
            Expr::MultiAssign {
                targets,
                value,
                span,
            } => {
                let val = self.evaluate_expression(value)?;
                let values = val.iter_values().ok_or_else(|| {
                    AtmarkError::runtime(
                        span.clone(),
                        format!("Cannot unpack {}", val.type_name()),
                    )
                })?;
                if values.len() != targets.len() {
                    return Err(AtmarkError::runtime(
                        span.clone(),
                        format!(
                            "Cannot unpack sequence of {} into {} targets",
                            values.len(),
                            targets.len()
                        ),
                    ));
                }
                for (target, value) in targets.iter().zip(values) {
                    if let AssignTarget::Variable { name, .. } = target {
                        self.assign_name(name, value);
                    }
                }
                Ok(val)
            }
            Expr::Binary {
                left,
                operator,
                right,
                span,
            } => {
                let left_val = self.evaluate_expression(left)?;
                let right_val = self.evaluate_expression(right)?;
                self.evaluate_binary_op(operator, left_val, right_val, span)
            }
            Expr::Unary {
                operator,
                operand,
                span,
            } => {
                let operand_val = self.evaluate_expression(operand)?;
                self.evaluate_unary_op(operator, operand_val, span)
            }
            Expr::Logical {
                left,
                operator,
                right,
                ..
            } => {
                let left_val = self.evaluate_expression(left)?;

                match operator {
                    LogicalOp::Or => {
                        if left_val.is_truthy() {
                            Ok(left_val)
                        } else {
                            self.evaluate_expression(right)
                        }
                    }
                    LogicalOp::And => {
                        if !left_val.is_truthy() {
                            Ok(left_val)
                        } else {
                            self.evaluate_expression(right)
                        }
                    }
                }
            }
            Expr::Call { callee, args, span } => {
                if let Expr::PropertyAccess {
                    object, property, ..
                } = callee.as_ref()
                {
                    let object_value = self.evaluate_expression(object)?;
                    let arg_values = self.evaluate_args(args)?;
                    return match object_value {
                        Value::Pseudo => {
                            let op = pseudo::lookup(property).ok_or_else(|| {
                                AtmarkError::runtime(
                                    span.clone(),
                                    format!("Unknown interpreter method '{}'", property),
                                )
                            })?;
                            pseudo::call(op, arg_values, self.interp, self.locals.as_deref_mut())
                        }
                        other => self.method_call(other, property, arg_values, span),
                    };
                }
                let callee_value = self.evaluate_expression(callee)?;
                let arg_values = self.evaluate_args(args)?;
                self.call_value(callee_value, arg_values, span)
            }
            Expr::Grouping { expr, .. } => self.evaluate_expression(expr),
            Expr::List { elements, .. } => {
                let mut list_values = Vec::new();
                for element in elements {
                    list_values.push(self.evaluate_expression(element)?);
                }
                Ok(Value::List(list_values))
            }
            Expr::Dict { pairs, span } => {
                let mut dict_values = BTreeMap::new();
                for (key_expr, value_expr) in pairs {
                    let key_value = self.evaluate_expression(key_expr)?;
                    let value_value = self.evaluate_expression(value_expr)?;

                    let key_string = match key_value {
                        Value::String(s) => s,
                        _ => {
                            return Err(AtmarkError::runtime(
                                span.clone(),
                                format!(
                                    "Dictionary keys must be strings, got {}",
                                    key_value.type_name()
                                ),
                            ))
                        }
                    };

                    dict_values.insert(key_string, value_value);
                }
                Ok(Value::Dict(dict_values))
            }
            Expr::PropertyAccess {
                object,
                property,
                span,
            } => {
                let object_value = self.evaluate_expression(object)?;
                match object_value {
                    Value::Pseudo => pseudo::lookup(property).map(Value::Bound).ok_or_else(|| {
                        AtmarkError::runtime(
                            span.clone(),
                            format!("Unknown interpreter method '{}'", property),
                        )
                    }),
                    other => Err(AtmarkError::runtime_with_help(
                        span.clone(),
                        format!(
                            "Unknown property '{}' on {}",
                            property,
                            other.type_name()
                        ),
                        "Methods must be called, e.g. value.upper().".to_string(),
                    )),
                }
            }
            Expr::Index {
                object,
                index,
                span,
            } => {
                let object_value = self.evaluate_expression(object)?;
                let index_value = self.evaluate_expression(index)?;
                self.evaluate_index(object_value, index_value, span)
            }
        }
    }

    fn evaluate_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, AtmarkError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.evaluate_expression(arg)?);
        }
        Ok(values)
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match callee {
            Value::Builtin(builtin) => call_builtin(
                builtin,
                args,
                self.interp,
                self.locals.as_deref(),
                span,
            ),
            Value::Macro(def) => {
                if def.params.len() != args.len() {
                    return Err(AtmarkError::runtime(
                        span.clone(),
                        format!(
                            "macro '{}' takes {} arguments, got {}",
                            def.name,
                            def.params.len(),
                            args.len()
                        ),
                    ));
                }
                let mut macro_locals: Bindings =
                    def.params.iter().cloned().zip(args).collect();
                let expansion = self.interp.expand(&def.body, Some(&mut macro_locals))?;
                Ok(Value::String(expansion))
            }
            Value::Bound(op) => {
                pseudo::call(op, args, self.interp, self.locals.as_deref_mut())
            }
            other => Err(AtmarkError::runtime(
                span.clone(),
                format!("{} is not callable", other.type_name()),
            )),
        }
    }

    fn method_call(
        &mut self,
        object: Value,
        method: &str,
        args: Vec<Value>,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match (&object, method) {
            (Value::String(s), "upper") => Ok(Value::String(s.to_uppercase())),
            (Value::String(s), "lower") => Ok(Value::String(s.to_lowercase())),
            (Value::String(s), "strip") => Ok(Value::String(s.trim().to_string())),
            (Value::String(s), "split") => match args.first() {
                None => Ok(Value::List(
                    s.split_whitespace()
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                )),
                Some(Value::String(sep)) => Ok(Value::List(
                    s.split(sep.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                )),
                Some(other) => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("split() separator must be a string, got {}", other.type_name()),
                )),
            },
            (Value::String(s), "join") => match args.first() {
                Some(Value::List(items)) => {
                    let parts: Vec<String> =
                        items.iter().map(|item| item.to_string()).collect();
                    Ok(Value::String(parts.join(s)))
                }
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "join() takes a list argument".to_string(),
                )),
            },
            (Value::String(s), "replace") => match (args.first(), args.get(1)) {
                (Some(Value::String(from)), Some(Value::String(to))) => {
                    Ok(Value::String(s.replace(from.as_str(), to)))
                }
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "replace() takes two string arguments".to_string(),
                )),
            },
            (Value::String(s), "starts_with") => match args.first() {
                Some(Value::String(p)) => Ok(Value::Bool(s.starts_with(p.as_str()))),
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "starts_with() takes a string argument".to_string(),
                )),
            },
            (Value::String(s), "ends_with") => match args.first() {
                Some(Value::String(p)) => Ok(Value::Bool(s.ends_with(p.as_str()))),
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "ends_with() takes a string argument".to_string(),
                )),
            },
            (Value::String(s), "contains") => match args.first() {
                Some(Value::String(p)) => Ok(Value::Bool(s.contains(p.as_str()))),
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "contains() takes a string argument".to_string(),
                )),
            },
            (Value::Dict(d), "get") => match args.first() {
                Some(Value::String(key)) => Ok(d
                    .get(key)
                    .cloned()
                    .or_else(|| args.get(1).cloned())
                    .unwrap_or(Value::Nil)),
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    "get() takes a string key".to_string(),
                )),
            },
            (Value::Dict(d), "keys") => Ok(Value::List(
                d.keys().map(|key| Value::String(key.clone())).collect(),
            )),
            _ => Err(AtmarkError::runtime_with_help(
                span.clone(),
                format!("Unknown method '{}' on {}", method, object.type_name()),
                "String methods: upper, lower, strip, split, join, replace, starts_with, ends_with, contains.  Dict methods: get, keys.".to_string(),
            )),
        }
    }

    fn evaluate_index(
        &self,
        object: Value,
        index: Value,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match (object, index) {
            (Value::List(list), Value::Int(i)) => {
                let len = list.len() as i64;
                let j = if i < 0 { i + len } else { i };
                if j < 0 || j >= len {
                    return Err(AtmarkError::runtime(
                        span.clone(),
                        format!("List index {} out of range", i),
                    ));
                }
                Ok(list[j as usize].clone())
            }
            (Value::String(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let j = if i < 0 { i + len } else { i };
                if j < 0 || j >= len {
                    return Err(AtmarkError::runtime(
                        span.clone(),
                        format!("String index {} out of range", i),
                    ));
                }
                Ok(Value::String(chars[j as usize].to_string()))
            }
            (Value::Dict(dict), Value::String(key)) => {
                dict.get(&key).cloned().ok_or_else(|| {
                    AtmarkError::runtime(span.clone(), format!("Key not found: '{}'", key))
                })
            }
            (object, index) => Err(AtmarkError::runtime(
                span.clone(),
                format!(
                    "Cannot index {} with {}",
                    object.type_name(),
                    index.type_name()
                ),
            )),
        }
    }

    fn evaluate_binary_op(
        &self,
        operator: &BinaryOp,
        left: Value,
        right: Value,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match operator {
            BinaryOp::Add => match (left, right) {
                (Value::Int(l), Value::Int(r)) => Ok(Value::Int(l + r)),
                (Value::Double(l), Value::Double(r)) => Ok(Value::Double(l + r)),
                (Value::Int(l), Value::Double(r)) => Ok(Value::Double(l as f64 + r)),
                (Value::Double(l), Value::Int(r)) => Ok(Value::Double(l + r as f64)),
                (Value::String(l), Value::String(r)) => Ok(Value::String(l + &r)),
                (l, r) => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot add {} and {}", l.type_name(), r.type_name()),
                )),
            },
            BinaryOp::Subtract => match (left, right) {
                (Value::Int(l), Value::Int(r)) => Ok(Value::Int(l - r)),
                (Value::Double(l), Value::Double(r)) => Ok(Value::Double(l - r)),
                (Value::Int(l), Value::Double(r)) => Ok(Value::Double(l as f64 - r)),
                (Value::Double(l), Value::Int(r)) => Ok(Value::Double(l - r as f64)),
                (l, r) => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot subtract {} and {}", l.type_name(), r.type_name()),
                )),
            },
            BinaryOp::Multiply => match (left, right) {
                (Value::Int(l), Value::Int(r)) => Ok(Value::Int(l * r)),
                (Value::Double(l), Value::Double(r)) => Ok(Value::Double(l * r)),
                (Value::Int(l), Value::Double(r)) => Ok(Value::Double(l as f64 * r)),
                (Value::Double(l), Value::Int(r)) => Ok(Value::Double(l * r as f64)),
                (l, r) => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot multiply {} and {}", l.type_name(), r.type_name()),
                )),
            },
            BinaryOp::Divide => match (left, right) {
                (_, Value::Int(0)) => Err(AtmarkError::runtime(
                    span.clone(),
                    "Division by zero".to_string(),
                )),
                (_, Value::Double(r)) if r == 0.0 => Err(AtmarkError::runtime(
                    span.clone(),
                    "Division by zero".to_string(),
                )),
                (Value::Int(l), Value::Int(r)) => Ok(Value::Double(l as f64 / r as f64)),
                (Value::Double(l), Value::Double(r)) => Ok(Value::Double(l / r)),
                (Value::Int(l), Value::Double(r)) => Ok(Value::Double(l as f64 / r)),
                (Value::Double(l), Value::Int(r)) => Ok(Value::Double(l / r as f64)),
                (l, r) => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot divide {} and {}", l.type_name(), r.type_name()),
                )),
            },
            BinaryOp::Equal => Ok(Value::Bool(is_equal(&left, &right))),
            BinaryOp::NotEqual => Ok(Value::Bool(!is_equal(&left, &right))),
            BinaryOp::Greater => self.compare(left, right, span, |o| o == Ordering::Greater),
            BinaryOp::GreaterEqual => {
                self.compare(left, right, span, |o| o != Ordering::Less)
            }
            BinaryOp::Less => self.compare(left, right, span, |o| o == Ordering::Less),
            BinaryOp::LessEqual => {
                self.compare(left, right, span, |o| o != Ordering::Greater)
            }
            BinaryOp::In => self.evaluate_in_operation(left, right, span),
        }
    }

    fn compare(
        &self,
        left: Value,
        right: Value,
        span: &Span,
        test: fn(Ordering) -> bool,
    ) -> Result<Value, AtmarkError> {
        match compare_values(&left, &right) {
            Some(ordering) => Ok(Value::Bool(test(ordering))),
            None => Err(AtmarkError::runtime(
                span.clone(),
                format!(
                    "Cannot compare {} and {}",
                    left.type_name(),
                    right.type_name()
                ),
            )),
        }
    }

    fn evaluate_unary_op(
        &self,
        operator: &UnaryOp,
        operand: Value,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match operator {
            UnaryOp::Negate => match operand {
                Value::Int(n) => Ok(Value::Int(-n)),
                Value::Double(n) => Ok(Value::Double(-n)),
                _ => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot negate {}", operand.type_name()),
                )),
            },
            UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        }
    }

    fn evaluate_in_operation(
        &self,
        left: Value,
        right: Value,
        span: &Span,
    ) -> Result<Value, AtmarkError> {
        match right {
            Value::List(list) => {
                for item in &list {
                    if is_equal(&left, item) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Value::Dict(dict) => match left {
                Value::String(key) => Ok(Value::Bool(dict.contains_key(&key))),
                _ => Err(AtmarkError::runtime_with_help(
                    span.clone(),
                    format!(
                        "Dictionary key lookup requires a string, got {}",
                        left.type_name()
                    ),
                    "Use 'in' with dictionaries like: \"key\" in {\"key\": \"value\"}."
                        .to_string(),
                )),
            },
            Value::String(string) => match left {
                Value::String(substring) => Ok(Value::Bool(string.contains(&substring))),
                _ => Err(AtmarkError::runtime_with_help(
                    span.clone(),
                    format!(
                        "String containment check requires a string, got {}",
                        left.type_name()
                    ),
                    "Use 'in' with strings like: \"sub\" in \"substring\".".to_string(),
                )),
            },
            _ => Err(AtmarkError::runtime_with_help(
                span.clone(),
                format!("'in' operator not supported for type {}", right.type_name()),
                "The 'in' operator works with lists, dictionaries, and strings.".to_string(),
            )),
        }
    }
}

fn is_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Int(l), Value::Int(r)) => l == r,
        (Value::Double(l), Value::Double(r)) => l == r,
        (Value::Int(l), Value::Double(r)) => (*l as f64) == *r,
        (Value::Double(l), Value::Int(r)) => *l == (*r as f64),
        (Value::String(l), Value::String(r)) => l == r,
        (Value::List(l), Value::List(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| is_equal(a, b))
        }
        _ => false,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        (Value::Double(l), Value::Double(r)) => l.partial_cmp(r),
        (Value::Int(l), Value::Double(r)) => (*l as f64).partial_cmp(r),
        (Value::Double(l), Value::Int(r)) => l.partial_cmp(&(*r as f64)),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn call_builtin(
    builtin: Builtin,
    args: Vec<Value>,
    interp: &mut Interpreter,
    locals: Option<&Bindings>,
    span: &Span,
) -> Result<Value, AtmarkError> {
    let expect = |count: usize| -> Result<(), AtmarkError> {
        if args.len() == count {
            Ok(())
        } else {
            Err(AtmarkError::runtime(
                span.clone(),
                format!(
                    "{}() takes exactly {} argument{}, got {}",
                    builtin.name(),
                    count,
                    if count == 1 { "" } else { "s" },
                    args.len()
                ),
            ))
        }
    };

    match builtin {
        Builtin::Print => {
            let parts: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
            let mut line = parts.join(" ");
            line.push('\n');
            interp.write(&line)?;
            Ok(Value::Nil)
        }
        Builtin::Len => {
            expect(1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                Value::Dict(d) => Ok(Value::Int(d.len() as i64)),
                other => Err(AtmarkError::runtime_with_help(
                    span.clone(),
                    format!("len() not supported for type {}", other.type_name()),
                    "len() only works with strings, lists, and dictionaries.".to_string(),
                )),
            }
        }
        Builtin::Type => {
            expect(1)?;
            Ok(Value::String(args[0].type_name().to_string()))
        }
        Builtin::Str => {
            expect(1)?;
            Ok(Value::String(args[0].to_string()))
        }
        Builtin::Int => {
            expect(1)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Double(n) => Ok(Value::Int(*n as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    AtmarkError::runtime(
                        span.clone(),
                        format!("Cannot convert '{}' to int", s),
                    )
                }),
                other => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot convert {} to int", other.type_name()),
                )),
            }
        }
        Builtin::Float => {
            expect(1)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Double(*n as f64)),
                Value::Double(n) => Ok(Value::Double(*n)),
                Value::String(s) => s.trim().parse::<f64>().map(Value::Double).map_err(|_| {
                    AtmarkError::runtime(
                        span.clone(),
                        format!("Cannot convert '{}' to float", s),
                    )
                }),
                other => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("Cannot convert {} to float", other.type_name()),
                )),
            }
        }
        Builtin::Repr => {
            expect(1)?;
            Ok(Value::String(args[0].repr()))
        }
        Builtin::Range => {
            let ints: Vec<i64> = args
                .iter()
                .map(|arg| match arg {
                    Value::Int(n) => Ok(*n),
                    other => Err(AtmarkError::runtime(
                        span.clone(),
                        format!("range() requires ints, got {}", other.type_name()),
                    )),
                })
                .collect::<Result<_, _>>()?;
            let (start, stop, step) = match ints.len() {
                1 => (0, ints[0], 1),
                2 => (ints[0], ints[1], 1),
                3 => (ints[0], ints[1], ints[2]),
                n => {
                    return Err(AtmarkError::runtime(
                        span.clone(),
                        format!("range() takes 1 to 3 arguments, got {}", n),
                    ))
                }
            };
            if step == 0 {
                return Err(AtmarkError::runtime(
                    span.clone(),
                    "range() step must not be zero".to_string(),
                ));
            }
            let mut values = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                values.push(Value::Int(current));
                current += step;
            }
            Ok(Value::List(values))
        }
        Builtin::Keys => {
            expect(1)?;
            match &args[0] {
                Value::Dict(d) => Ok(Value::List(
                    d.keys().map(|key| Value::String(key.clone())).collect(),
                )),
                other => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("keys() requires a dict, got {}", other.type_name()),
                )),
            }
        }
        Builtin::Sorted => {
            expect(1)?;
            match &args[0] {
                Value::List(items) => {
                    let mut sorted = items.clone();
                    let mut failed = false;
                    sorted.sort_by(|a, b| match compare_values(a, b) {
                        Some(ordering) => ordering,
                        None => {
                            failed = true;
                            Ordering::Equal
                        }
                    });
                    if failed {
                        return Err(AtmarkError::runtime(
                            span.clone(),
                            "sorted() requires comparable elements".to_string(),
                        ));
                    }
                    Ok(Value::List(sorted))
                }
                other => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("sorted() requires a list, got {}", other.type_name()),
                )),
            }
        }
        Builtin::Defined => {
            expect(1)?;
            match &args[0] {
                Value::String(name) => Ok(Value::Bool(interp.defined(name, locals))),
                other => Err(AtmarkError::runtime(
                    span.clone(),
                    format!("defined() takes a name string, got {}", other.type_name()),
                )),
            }
        }
    }
}
