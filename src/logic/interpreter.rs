// Tree-walking evaluator for block scripts.
//
// Every statement and expression costs one step. A run that exceeds its
// step budget stops with `LogicError::BudgetExceeded`, so a runaway loop
// costs one tick's worth of work and nothing more. Evaluation depth and the
// nesting of lists and maps a script builds are bounded as well.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::LogicCall;
use super::ast::{AssignTarget, BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::error::LogicError;
use crate::value::{Value, ValueMap};

/// Deepest recursion through expressions and blocks.
const MAX_DEPTH: usize = 128;

/// Deepest list / map nesting a script may build.
const MAX_VALUE_DEPTH: usize = 64;

enum Flow {
    Next,
    Return(Option<Value>),
}

pub(super) struct Interpreter<'a> {
    call: LogicCall<'a>,
    locals: HashMap<String, Value>,
    steps: u64,
    budget: u64,
    depth: usize,
}

impl<'a> Interpreter<'a> {
    pub(super) fn new(call: LogicCall<'a>, budget: u64) -> Self {
        Self {
            call,
            locals: HashMap::new(),
            steps: 0,
            budget,
            depth: 0,
        }
    }

    /// Run the program and produce its state update.
    ///
    /// - `return { .. }` with an object: that object is the update
    /// - anything else: the (possibly mutated) state copy is the update
    pub(super) fn run(mut self, program: &Program) -> Result<ValueMap, LogicError> {
        match self.exec_block(&program.body)? {
            Flow::Return(Some(Value::Map(update))) => Ok(Arc::unwrap_or_clone(update)),
            _ => Ok(std::mem::take(&mut self.call.state)),
        }
    }

    fn step(&mut self) -> Result<(), LogicError> {
        self.steps += 1;
        if self.steps > self.budget {
            return Err(LogicError::BudgetExceeded { limit: self.budget });
        }
        Ok(())
    }

    /// Run `f` one level deeper, failing past `MAX_DEPTH`.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, LogicError>,
    ) -> Result<T, LogicError> {
        if self.depth >= MAX_DEPTH {
            return Err(LogicError::Type("nesting too deep".into()));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // ═══════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, LogicError> {
        self.nested(|this| {
            for stmt in body {
                if let Flow::Return(value) = this.exec(stmt)? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Next)
        })
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, LogicError> {
        self.step()?;
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                self.locals.insert(name.clone(), value);
            }
            Stmt::Assign(AssignTarget::Local(name), expr) => {
                let value = self.eval(expr)?;
                match self.locals.get_mut(name) {
                    Some(slot) => *slot = value,
                    None => return Err(LogicError::UnknownVariable(name.clone())),
                }
            }
            Stmt::Assign(AssignTarget::State(key), expr) => {
                let value = self.eval(expr)?;
                self.call.state.insert(key.clone(), value);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if self.eval(cond)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                return self.exec_block(branch);
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.is_truthy() {
                    if let Flow::Return(value) = self.exec_block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(expr) => {
                let value = self.eval(expr)?;
                return Err(LogicError::Thrown(thrown_message(&value)));
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Next)
    }

    // ═══════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════

    fn eval(&mut self, expr: &Expr) -> Result<Value, LogicError> {
        self.nested(|this| this.eval_expr(expr))
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, LogicError> {
        self.step()?;
        let value = match expr {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Number(n) => Value::Number(*n),
            Expr::Str(s) => Value::String(s.clone()),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                checked(Value::list(out))?
            }
            Expr::Map(entries) => {
                let mut out = ValueMap::new();
                for (key, e) in entries {
                    let value = self.eval(e)?;
                    out.insert(key.clone(), value);
                }
                checked(Value::map(out))?
            }
            Expr::Ident(name) => self.lookup(name)?,
            Expr::Member(target, key) => {
                // `inputs.x` and friends read straight from the call
                if let Expr::Ident(name) = target.as_ref() {
                    if let Some(value) = self.global_member(name, key) {
                        return Ok(value);
                    }
                }
                let base = self.eval(target)?;
                member(&base, key)?
            }
            Expr::Index(target, index) => {
                let base = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(&base, &index)?
            }
            Expr::Call(name, args) => self.call_function(name, args)?,
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Not => Value::Bool(!value.is_truthy()),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs)?,
            Expr::Ternary(cond, then, otherwise) => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
        };
        Ok(value)
    }

    fn lookup(&self, name: &str) -> Result<Value, LogicError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "inputs" => Ok(Value::map(self.call.inputs.clone())),
            "params" => Ok(Value::map(self.call.params.clone())),
            "state" => Ok(Value::map(self.call.state.clone())),
            "context" => {
                let mut ctx = ValueMap::new();
                ctx.insert("sampleRate".into(), self.call.context.sample_rate.into());
                ctx.insert("bpm".into(), self.call.context.bpm.into());
                Ok(Value::map(ctx))
            }
            _ => Err(LogicError::UnknownVariable(name.to_string())),
        }
    }

    fn global_member(&self, name: &str, key: &str) -> Option<Value> {
        if self.locals.contains_key(name) {
            return None;
        }
        let map = match name {
            "inputs" => self.call.inputs,
            "params" => self.call.params,
            "state" => &self.call.state,
            "context" => {
                return Some(match key {
                    "sampleRate" => self.call.context.sample_rate.into(),
                    "bpm" => self.call.context.bpm.into(),
                    _ => Value::Null,
                });
            }
            _ => return None,
        };
        Some(map.get(key).cloned().unwrap_or_default())
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, LogicError> {
        let l = self.eval(lhs)?;
        match op {
            BinaryOp::And => return if l.is_truthy() { self.eval(rhs) } else { Ok(l) },
            BinaryOp::Or => return if l.is_truthy() { Ok(l) } else { self.eval(rhs) },
            BinaryOp::Coalesce => return if l.is_null() { self.eval(rhs) } else { Ok(l) },
            _ => {}
        }

        let r = self.eval(rhs)?;
        let value = match op {
            BinaryOp::Eq => Value::Bool(l.same(&r)),
            BinaryOp::Ne => Value::Bool(!l.same(&r)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                Value::Bool(compare(op, &l, &r))
            }
            BinaryOp::Add => match (&l, &r) {
                (Value::String(_), _) | (_, Value::String(_)) => Value::String(format!("{}{}", l, r)),
                _ => Value::Number(l.to_number() + r.to_number()),
            },
            _ => Value::Number(arithmetic(op, l.to_number(), r.to_number())),
        };
        Ok(value)
    }

    // ═══════════════════════════════════════════════════════════════
    // Functions
    // ═══════════════════════════════════════════════════════════════

    fn call_function(&mut self, name: &str, args: &[Expr]) -> Result<Value, LogicError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        match name {
            "output" => {
                let port = match values.first() {
                    Some(Value::String(s)) => s.clone(),
                    other => {
                        return Err(LogicError::Type(format!(
                            "output() expects a port name, got {}",
                            other.map_or("nothing", Value::type_name)
                        )));
                    }
                };
                let value = values.get(1).cloned().unwrap_or_default();
                self.call.outputs.insert(port, value);
                Ok(Value::Null)
            }
            "log" => {
                let line = values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.call.logs.push(line);
                Ok(Value::Null)
            }
            "send" => {
                (self.call.send)(values.into_iter().next().unwrap_or_default());
                Ok(Value::Null)
            }
            _ => builtin(name, &values),
        }
    }
}

/// Message recorded for `throw`: an object's `message` field, or the value itself.
fn thrown_message(value: &Value) -> String {
    if let Value::Map(m) = value {
        if let Some(Value::String(message)) = m.get("message") {
            return message.clone();
        }
    }
    value.to_string()
}

fn member(base: &Value, key: &str) -> Result<Value, LogicError> {
    Ok(match base {
        Value::Null => {
            return Err(LogicError::Type(format!(
                "cannot read property '{}' of null",
                key
            )));
        }
        Value::Map(m) => m.get(key).cloned().unwrap_or_default(),
        Value::List(items) if key == "length" => Value::from(items.len() as f64),
        Value::String(s) if key == "length" => Value::from(s.chars().count() as f64),
        _ => Value::Null,
    })
}

fn index_value(base: &Value, index: &Value) -> Result<Value, LogicError> {
    Ok(match (base, index) {
        (Value::Null, _) => {
            return Err(LogicError::Type(format!(
                "cannot read index {} of null",
                index
            )));
        }
        (Value::List(items), Value::Number(n)) => list_slot(*n)
            .and_then(|i| items.get(i).cloned())
            .unwrap_or_default(),
        (Value::String(s), Value::Number(n)) => list_slot(*n)
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or_default(),
        (Value::Map(m), key) => m.get(&key.to_string()).cloned().unwrap_or_default(),
        _ => Value::Null,
    })
}

/// Depth of list / map nesting inside `value`.
fn nesting(value: &Value) -> usize {
    match value {
        Value::List(items) => 1 + items.iter().map(nesting).max().unwrap_or(0),
        Value::Map(entries) => 1 + entries.values().map(nesting).max().unwrap_or(0),
        _ => 0,
    }
}

fn checked(value: Value) -> Result<Value, LogicError> {
    if nesting(&value) > MAX_VALUE_DEPTH {
        return Err(LogicError::Type(format!(
            "values nest deeper than {}",
            MAX_VALUE_DEPTH
        )));
    }
    Ok(value)
}

fn list_slot(n: f64) -> Option<usize> {
    (n >= 0.0 && n.fract() == 0.0).then_some(n as usize)
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> bool {
    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => l.to_number().partial_cmp(&r.to_number()),
    };
    // NaN compares false every way
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    }
}

fn arithmetic(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    }
}

/// Pure helper functions available to every script.
fn builtin(name: &str, args: &[Value]) -> Result<Value, LogicError> {
    let num = |i: usize| args.get(i).map_or(f64::NAN, Value::to_number);

    let n = match name {
        "abs" => num(0).abs(),
        "floor" => num(0).floor(),
        "ceil" => num(0).ceil(),
        "round" => (num(0) + 0.5).floor(),
        "sqrt" => num(0).sqrt(),
        "pow" => num(0).powf(num(1)),
        "exp" => num(0).exp(),
        "sin" => num(0).sin(),
        "cos" => num(0).cos(),
        "min" => args.iter().map(Value::to_number).fold(f64::INFINITY, f64::min),
        "max" => args
            .iter()
            .map(Value::to_number)
            .fold(f64::NEG_INFINITY, f64::max),
        "clamp" => num(0).max(num(1)).min(num(2)),
        "num" => num(0),
        "len" => {
            let count = match args.first() {
                Some(Value::List(items)) => items.len(),
                Some(Value::Map(entries)) => entries.len(),
                Some(Value::String(s)) => s.chars().count(),
                _ => 0,
            };
            count as f64
        }
        "str" => {
            return Ok(Value::String(
                args.first().map(ToString::to_string).unwrap_or_default(),
            ));
        }
        "append" => {
            let mut items = match args.first() {
                Some(Value::List(items)) => items.as_ref().clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(LogicError::Type(format!(
                        "append() expects a list, got {}",
                        other.type_name()
                    )));
                }
            };
            items.extend(args.iter().skip(1).cloned());
            return checked(Value::list(items));
        }
        _ => return Err(LogicError::UnknownFunction(name.to_string())),
    };

    Ok(Value::Number(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{ExecutionContext, parse_program};

    struct Outcome {
        result: Result<ValueMap, LogicError>,
        outputs: ValueMap,
    }

    fn run(source: &str, inputs: ValueMap, state: ValueMap) -> Outcome {
        run_program(&parse_program(source).unwrap(), inputs, state)
    }

    fn run_program(program: &Program, inputs: ValueMap, state: ValueMap) -> Outcome {
        let params = ValueMap::new();
        let mut outputs = ValueMap::new();
        let mut logs = Vec::new();
        let mut send = |_: Value| {};
        let result = Interpreter::new(
            LogicCall {
                inputs: &inputs,
                params: &params,
                state,
                context: ExecutionContext::new(48_000.0, 90.0),
                outputs: &mut outputs,
                logs: &mut logs,
                send: &mut send,
            },
            10_000,
        )
        .run(program);
        Outcome { result, outputs }
    }

    fn out(source: &str) -> Value {
        let outcome = run(source, ValueMap::new(), ValueMap::new());
        outcome.result.unwrap();
        outcome.outputs.get("x").cloned().unwrap_or_default()
    }

    #[test]
    fn test_deep_expression_tree_fails_cleanly() {
        let mut expr = Expr::Bool(true);
        for _ in 0..1000 {
            expr = Expr::Unary(UnaryOp::Not, Box::new(expr));
        }
        let program = Program {
            body: vec![Stmt::Expr(expr)],
        };
        let outcome = run_program(&program, ValueMap::new(), ValueMap::new());
        assert_eq!(
            outcome.result.unwrap_err(),
            LogicError::Type("nesting too deep".into())
        );
    }

    #[test]
    fn test_deep_block_tree_fails_cleanly() {
        let mut body = vec![Stmt::Expr(Expr::Null)];
        for _ in 0..1000 {
            body = vec![Stmt::If {
                cond: Expr::Bool(true),
                then: body,
                otherwise: Vec::new(),
            }];
        }
        let outcome = run_program(&Program { body }, ValueMap::new(), ValueMap::new());
        assert!(matches!(outcome.result, Err(LogicError::Type(_))));
    }

    #[test]
    fn test_moderate_nesting_still_runs() {
        assert_eq!(out(r#"output("x", ((((((((((1))))))))));"#), Value::from(1));
        assert_eq!(out(r#"output("x", len([[[[[[1]]]]]]));"#), Value::from(1));
    }

    #[test]
    fn test_self_wrapping_list_is_bounded() {
        let source = "let x = []; let i = 0; while (i < 100) { x = [x]; i = i + 1; }";
        let outcome = run(source, ValueMap::new(), ValueMap::new());
        assert_eq!(
            outcome.result.unwrap_err(),
            LogicError::Type("values nest deeper than 64".into())
        );

        let source = "let x = []; let i = 0; while (i < 100) { x = append([], x); i = i + 1; }";
        let outcome = run(source, ValueMap::new(), ValueMap::new());
        assert!(matches!(outcome.result, Err(LogicError::Type(_))));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(out(r#"output("x", "note-" + 60);"#), Value::from("note-60"));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(out(r#"output("x", "a" < "b" && 2 >= 2 && !(1 > 3));"#), Value::from(true));
        assert_eq!(out(r#"output("x", 0 / 0 < 1);"#), Value::from(false));
    }

    #[test]
    fn test_short_circuit_skips_right_side() {
        // `explode()` would fail if it were evaluated
        assert_eq!(out(r#"output("x", false && explode());"#), Value::from(false));
        assert_eq!(out(r#"output("x", 7 ?? explode());"#), Value::from(7));
    }

    #[test]
    fn test_list_index_and_length() {
        assert_eq!(out(r#"let l = [10, 20, 30]; output("x", l[1] + l.length);"#), Value::from(23));
        assert_eq!(out(r#"let l = [1]; output("x", l[5]);"#), Value::Null);
        assert_eq!(out(r#"output("x", len(append([1], 2, 3)));"#), Value::from(3));
    }

    #[test]
    fn test_missing_input_is_null_but_member_of_null_fails() {
        assert_eq!(out(r#"output("x", inputs.nothing);"#), Value::Null);

        let outcome = run("let y = inputs.nothing.deeper;", ValueMap::new(), ValueMap::new());
        assert!(matches!(outcome.result, Err(LogicError::Type(_))));
    }

    #[test]
    fn test_assignment_to_undeclared_local() {
        let outcome = run("y = 1;", ValueMap::new(), ValueMap::new());
        assert_eq!(
            outcome.result.unwrap_err(),
            LogicError::UnknownVariable("y".into())
        );
    }

    #[test]
    fn test_local_shadows_global() {
        assert_eq!(out(r#"let inputs = { a: 4 }; output("x", inputs.a);"#), Value::from(4));
    }

    #[test]
    fn test_whole_input_map_is_readable() {
        let mut inputs = ValueMap::new();
        inputs.insert("freq".into(), 440.into());
        let outcome = run(r#"let all = inputs; output("x", all["freq"]);"#, inputs, ValueMap::new());
        outcome.result.unwrap();
        assert_eq!(outcome.outputs.get("x"), Some(&Value::from(440)));
    }

    #[test]
    fn test_throw_object_uses_message() {
        let outcome = run(r#"throw { message: "bad cutoff" };"#, ValueMap::new(), ValueMap::new());
        assert_eq!(
            outcome.result.unwrap_err(),
            LogicError::Thrown("bad cutoff".into())
        );
    }

    #[test]
    fn test_return_inside_loop_stops_run() {
        let mut state = ValueMap::new();
        state.insert("n".into(), 0.into());
        let outcome = run(
            "while (true) { state.n += 1; if (state.n >= 3) { return; } }",
            ValueMap::new(),
            state,
        );
        assert_eq!(outcome.result.unwrap().get("n"), Some(&Value::from(3)));
    }

    #[test]
    fn test_round_and_clamp() {
        assert_eq!(out(r#"output("x", round(2.5));"#), Value::from(3));
        assert_eq!(out(r#"output("x", clamp(12, 0, 10));"#), Value::from(10));
        assert_eq!(out(r#"output("x", min(3, 1, 2) + max(4, 5));"#), Value::from(6));
    }
}
