//! The interpreter loop.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::bytecode::{Constant, FunctionProto, OpCode};
use crate::vm::builtins;
use crate::vm::value::{cell, Cell, Closure, LuaStr, Table, Value};

/// Runtime failures inside the reference VM.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime error: {0}")]
    Message(String),
}

impl RuntimeError {
    pub fn msg(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }
}

pub type VmResult<T> = Result<T, RuntimeError>;

const MAX_CALL_DEPTH: usize = 200;

/// The virtual machine. One per program run; globals are per-instance, so
/// concurrent runs never share state.
pub struct Vm {
    pub globals: Rc<RefCell<Table>>,
    /// When capturing, print output accumulates here instead of stdout.
    capture: Option<Vec<u8>>,
    depth: usize,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            globals: Rc::new(RefCell::new(Table::new())),
            capture: None,
            depth: 0,
        };
        builtins::install(&mut vm);
        vm
    }

    /// A VM whose `print` output is collected for assertions.
    pub fn with_capture() -> Self {
        let mut vm = Self::new();
        vm.capture = Some(Vec::new());
        vm
    }

    pub fn captured_output(&self) -> String {
        String::from_utf8_lossy(self.capture.as_deref().unwrap_or(&[])).into_owned()
    }

    pub(crate) fn write_output(&mut self, bytes: &[u8]) {
        match &mut self.capture {
            Some(buf) => buf.extend_from_slice(bytes),
            None => {
                use std::io::Write;
                let _ = std::io::stdout().write_all(bytes);
            }
        }
    }

    /// Run a prototype as a main chunk.
    pub fn run(&mut self, proto: FunctionProto) -> VmResult<Vec<Value>> {
        let closure = Rc::new(Closure {
            proto: Rc::new(proto),
            upvalues: Vec::new(),
        });
        self.call_closure(&closure, Vec::new())
    }

    /// Call any callable value.
    pub fn call_value(&mut self, func: Value, args: Vec<Value>) -> VmResult<Vec<Value>> {
        match func {
            Value::Closure(closure) => self.call_closure(&closure, args),
            Value::Native(native) => (native.f)(self, args),
            other => Err(RuntimeError::msg(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, args: Vec<Value>) -> VmResult<Vec<Value>> {
        self.depth += 1;
        if self.depth > MAX_CALL_DEPTH {
            self.depth -= 1;
            return Err(RuntimeError::msg("call stack overflow"));
        }
        let result = self.run_frame(closure, args);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, closure: &Rc<Closure>, mut args: Vec<Value>) -> VmResult<Vec<Value>> {
        let proto = closure.proto.clone();
        let num_params = proto.num_params as usize;

        let varargs: Vec<Value> = if proto.is_vararg && args.len() > num_params {
            args.split_off(num_params)
        } else {
            Vec::new()
        };
        args.resize(num_params, Value::Nil);

        let mut regs: Vec<Cell> = Vec::with_capacity(proto.max_stack as usize);
        for arg in args {
            regs.push(cell(arg));
        }
        while regs.len() < proto.max_stack as usize {
            regs.push(cell(Value::Nil));
        }

        let consts: Vec<Value> = proto.constants.iter().map(constant_value).collect();
        // Nested prototypes shared across every closure this frame creates.
        let nested_protos: Vec<Rc<FunctionProto>> =
            proto.protos.iter().map(|p| Rc::new(p.clone())).collect();

        // Stack top beyond the last fixed register, meaningful only right
        // after an instruction that produces "all values".
        let mut top: usize = 0;
        let mut pc: usize = 0;

        // Grow `regs` to cover index `$i`, then store `$v`. The value is
        // evaluated first and the grow completes before the element borrow,
        // so the register vector is never aliased mid-expression.
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {{
                let __v = $v;
                let __i = $i;
                while regs.len() <= __i {
                    regs.push(cell(Value::Nil));
                }
                *regs[__i].borrow_mut() = __v;
            }};
        }
        // Grow `regs` to cover index `$i`, then yield a shared reference to
        // the cell at that slot.
        macro_rules! reg_cell {
            ($i:expr) => {{
                let __i = $i;
                while regs.len() <= __i {
                    regs.push(cell(Value::Nil));
                }
                &regs[__i]
            }};
        }

        loop {
            let instr = *proto
                .code
                .get(pc)
                .ok_or_else(|| RuntimeError::msg("program counter out of range"))?;
            pc += 1;

            let a = instr.a as usize;
            let b = instr.b;
            let c = instr.c;

            match instr.op {
                OpCode::Move => {
                    let v = regs[b as usize].borrow().clone();
                    set_reg!(a, v);
                }
                OpCode::LoadK => {
                    set_reg!(a, consts[b as usize].clone());
                }
                OpCode::LoadBool => {
                    set_reg!(a, Value::Bool(b != 0));
                }
                OpCode::LoadNil => {
                    for i in a..=b as usize {
                        set_reg!(i, Value::Nil);
                    }
                }

                OpCode::GetGlobal => {
                    let key = &consts[b as usize];
                    let v = self.globals.borrow().get(key);
                    set_reg!(a, v);
                }
                OpCode::SetGlobal => {
                    let key = consts[b as usize].clone();
                    let v = regs[a].borrow().clone();
                    self.globals
                        .borrow_mut()
                        .set(key, v)
                        .map_err(RuntimeError::msg)?;
                }
                OpCode::GetUpval => {
                    let v = closure.upvalues[b as usize].borrow().clone();
                    set_reg!(a, v);
                }
                OpCode::SetUpval => {
                    let v = regs[a].borrow().clone();
                    *closure.upvalues[b as usize].borrow_mut() = v;
                }

                OpCode::GetIndex => {
                    let obj = regs[b as usize].borrow().clone();
                    let key = regs[c as usize].borrow().clone();
                    let v = self.index_value(&obj, &key)?;
                    set_reg!(a, v);
                }
                OpCode::SetIndex => {
                    let obj = regs[a].borrow().clone();
                    let key = regs[b as usize].borrow().clone();
                    let v = regs[c as usize].borrow().clone();
                    match obj {
                        Value::Table(t) => {
                            t.borrow_mut().set(key, v).map_err(RuntimeError::msg)?
                        }
                        other => {
                            return Err(RuntimeError::msg(format!(
                                "attempt to index a {} value",
                                other.type_name()
                            )))
                        }
                    }
                }
                OpCode::NewTable => {
                    set_reg!(a, Value::Table(Rc::new(RefCell::new(Table::new()))));
                }
                OpCode::SelfIndex => {
                    let obj = regs[b as usize].borrow().clone();
                    let key = &consts[c as usize];
                    let method = self.index_value(&obj, key)?;
                    set_reg!(a + 1, obj);
                    set_reg!(a, method);
                }

                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let x = to_number(&regs[b as usize].borrow())?;
                    let y = to_number(&regs[c as usize].borrow())?;
                    let r = match instr.op {
                        OpCode::Add => x + y,
                        OpCode::Sub => x - y,
                        OpCode::Mul => x * y,
                        OpCode::Div => x / y,
                        OpCode::Mod => x - (x / y).floor() * y,
                        OpCode::Pow => x.powf(y),
                        _ => unreachable!(),
                    };
                    set_reg!(a, Value::Number(r));
                }
                OpCode::Concat => {
                    let x = regs[b as usize].borrow().clone();
                    let y = regs[c as usize].borrow().clone();
                    let r = concat_values(&x, &y)?;
                    set_reg!(a, r);
                }
                OpCode::Unm => {
                    let x = to_number(&regs[b as usize].borrow())?;
                    set_reg!(a, Value::Number(-x));
                }
                OpCode::Not => {
                    let v = !regs[b as usize].borrow().truthy();
                    set_reg!(a, Value::Bool(v));
                }
                OpCode::Len => {
                    let v = regs[b as usize].borrow().clone();
                    let len = match &v {
                        Value::Str(s) => s.0.len() as f64,
                        Value::Table(t) => t.borrow().length() as f64,
                        other => {
                            return Err(RuntimeError::msg(format!(
                                "attempt to get length of a {} value",
                                other.type_name()
                            )))
                        }
                    };
                    set_reg!(a, Value::Number(len));
                }

                OpCode::Eq => {
                    let x = regs[b as usize].borrow().clone();
                    let y = regs[c as usize].borrow().clone();
                    set_reg!(a, Value::Bool(x.lua_eq(&y)));
                }
                OpCode::Lt | OpCode::Le => {
                    let x = regs[b as usize].borrow().clone();
                    let y = regs[c as usize].borrow().clone();
                    let r = compare(&x, &y, instr.op == OpCode::Le)?;
                    set_reg!(a, Value::Bool(r));
                }

                OpCode::Jmp => {
                    pc = b as usize;
                }
                OpCode::Test => {
                    if regs[a].borrow().truthy() == (c != 0) {
                        pc = b as usize;
                    }
                }

                OpCode::Call => {
                    let func = regs[a].borrow().clone();
                    let call_args: Vec<Value> = if b == 0 {
                        (a + 1..top).map(|i| regs[i].borrow().clone()).collect()
                    } else {
                        (0..b as usize - 1)
                            .map(|i| reg_cell!(a + 1 + i).borrow().clone())
                            .collect()
                    };
                    let results = self.call_value(func, call_args)?;
                    if c == 0 {
                        top = a + results.len();
                        for (i, v) in results.into_iter().enumerate() {
                            set_reg!(a + i, v);
                        }
                    } else {
                        for i in 0..c as usize - 1 {
                            let v = results.get(i).cloned().unwrap_or(Value::Nil);
                            set_reg!(a + i, v);
                        }
                    }
                }
                OpCode::Return => {
                    let count = if b == 0 {
                        top.saturating_sub(a)
                    } else {
                        b as usize - 1
                    };
                    let mut out = Vec::with_capacity(count);
                    for i in 0..count {
                        out.push(reg_cell!(a + i).borrow().clone());
                    }
                    return Ok(out);
                }
                OpCode::Vararg => {
                    if b == 0 {
                        top = a + varargs.len();
                        for (i, v) in varargs.iter().enumerate() {
                            set_reg!(a + i, v.clone());
                        }
                    } else {
                        for i in 0..b as usize - 1 {
                            let v = varargs.get(i).cloned().unwrap_or(Value::Nil);
                            set_reg!(a + i, v);
                        }
                    }
                }

                OpCode::Closure => {
                    let nested = nested_protos[b as usize].clone();
                    let mut upvalues = Vec::with_capacity(nested.upvalues.len());
                    for desc in &nested.upvalues {
                        if desc.is_local {
                            upvalues.push(reg_cell!(desc.index as usize).clone());
                        } else {
                            upvalues.push(closure.upvalues[desc.index as usize].clone());
                        }
                    }
                    set_reg!(a, Value::Closure(Rc::new(Closure {
                        proto: nested,
                        upvalues,
                    })));
                }
                OpCode::Close => {
                    // Detach any capture of slots >= a by giving the frame
                    // fresh cells holding the same values.
                    for i in a..regs.len() {
                        let v = regs[i].borrow().clone();
                        regs[i] = cell(v);
                    }
                }

                OpCode::ForPrep => {
                    let init = for_number(&regs[a].borrow(), "initial value")?;
                    let limit = for_number(&regs[a + 1].borrow(), "limit")?;
                    let step = for_number(&regs[a + 2].borrow(), "step")?;
                    *regs[a].borrow_mut() = Value::Number(init - step);
                    *regs[a + 1].borrow_mut() = Value::Number(limit);
                    *regs[a + 2].borrow_mut() = Value::Number(step);
                    pc = b as usize;
                }
                OpCode::ForLoop => {
                    let step = to_number(&regs[a + 2].borrow())?;
                    let idx = to_number(&regs[a].borrow())? + step;
                    let limit = to_number(&regs[a + 1].borrow())?;
                    *regs[a].borrow_mut() = Value::Number(idx);
                    let continues = if step > 0.0 { idx <= limit } else { idx >= limit };
                    if continues {
                        set_reg!(a + 3, Value::Number(idx));
                        pc = b as usize;
                    }
                }
                OpCode::TForLoop => {
                    let func = regs[a].borrow().clone();
                    let state = regs[a + 1].borrow().clone();
                    let control = regs[a + 2].borrow().clone();
                    let results = self.call_value(func, vec![state, control])?;
                    for i in 0..b as usize {
                        let v = results.get(i).cloned().unwrap_or(Value::Nil);
                        set_reg!(a + 3 + i, v);
                    }
                    let first = results.first().cloned().unwrap_or(Value::Nil);
                    if matches!(first, Value::Nil) {
                        pc = c as usize;
                    } else {
                        *regs[a + 2].borrow_mut() = first;
                    }
                }

                OpCode::SetList => {
                    let table = regs[a].borrow().clone();
                    let Value::Table(t) = table else {
                        return Err(RuntimeError::msg("SetList on non-table"));
                    };
                    let mut index = c as f64;
                    for i in b as usize..top {
                        let v = regs[i].borrow().clone();
                        t.borrow_mut()
                            .set(Value::Number(index), v)
                            .map_err(RuntimeError::msg)?;
                        index += 1.0;
                    }
                }
            }
        }
    }

    /// Table read with `__index` metatable fallback (table or function).
    pub(crate) fn index_value(&mut self, obj: &Value, key: &Value) -> VmResult<Value> {
        match obj {
            Value::Table(t) => {
                let raw = t.borrow().get(key);
                if !matches!(raw, Value::Nil) {
                    return Ok(raw);
                }
                let meta = t.borrow().meta.clone();
                if let Some(meta) = meta {
                    let handler = meta.borrow().get(&Value::str("__index"));
                    match handler {
                        Value::Nil => Ok(Value::Nil),
                        Value::Table(_) => self.index_value(&handler.clone(), key),
                        callable => {
                            let results =
                                self.call_value(callable, vec![obj.clone(), key.clone()])?;
                            Ok(results.into_iter().next().unwrap_or(Value::Nil))
                        }
                    }
                } else {
                    Ok(Value::Nil)
                }
            }
            other => Err(RuntimeError::msg(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Number(n) => Value::Number(*n),
        Constant::Str(bytes) => Value::Str(Rc::new(LuaStr(bytes.clone()))),
    }
}

/// Arithmetic coercion: numbers, or strings that parse as numbers.
pub(crate) fn to_number(value: &Value) -> VmResult<f64> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Str(s) => parse_number(&s.to_string_lossy()).ok_or_else(|| {
            RuntimeError::msg("attempt to perform arithmetic on a string value")
        }),
        other => Err(RuntimeError::msg(format!(
            "attempt to perform arithmetic on a {} value",
            other.type_name()
        ))),
    }
}

fn for_number(value: &Value, what: &str) -> VmResult<f64> {
    to_number(value).map_err(|_| RuntimeError::msg(format!("'for' {} must be a number", what)))
}

/// `tonumber` string rules: optional sign, decimal or 0x hex, surrounding
/// whitespace allowed.
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    if let Some(hex) = trimmed
        .strip_prefix("-0x")
        .or_else(|| trimmed.strip_prefix("-0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|n| -(n as f64));
    }
    trimmed.parse::<f64>().ok()
}

fn concat_values(x: &Value, y: &Value) -> VmResult<Value> {
    let left = concat_part(x)?;
    let right = concat_part(y)?;
    let mut bytes = left;
    bytes.extend_from_slice(&right);
    Ok(Value::bytes(bytes))
}

fn concat_part(value: &Value) -> VmResult<Vec<u8>> {
    match value {
        Value::Str(s) => Ok(s.0.clone()),
        Value::Number(n) => Ok(Value::number_to_string(*n).into_bytes()),
        other => Err(RuntimeError::msg(format!(
            "attempt to concatenate a {} value",
            other.type_name()
        ))),
    }
}

fn compare(x: &Value, y: &Value, or_equal: bool) -> VmResult<bool> {
    match (x, y) {
        (Value::Number(a), Value::Number(b)) => Ok(if or_equal { a <= b } else { a < b }),
        (Value::Str(a), Value::Str(b)) => Ok(if or_equal {
            a.0 <= b.0
        } else {
            a.0 < b.0
        }),
        _ => Err(RuntimeError::msg(format!(
            "attempt to compare {} with {}",
            x.type_name(),
            y.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compile_source;

    fn run(source: &str) -> String {
        let proto = compile_source(source).expect("compiles");
        let mut vm = Vm::with_capture();
        vm.run(proto).expect("runs");
        vm.captured_output()
    }

    fn run_err(source: &str) -> RuntimeError {
        let proto = compile_source(source).expect("compiles");
        let mut vm = Vm::with_capture();
        vm.run(proto).expect_err("fails at runtime")
    }

    #[test]
    fn arithmetic_and_concat() {
        assert_eq!(
            run("print(1 + 2, 'x' .. 'y', #'abc', 10 % 3, 2 ^ 10)"),
            "3\txy\t3\t1\t1024\n"
        );
    }

    #[test]
    fn lua_modulo_follows_floor_division() {
        assert_eq!(run("print(-5 % 3, 5 % -3)"), "1\t-1\n");
    }

    #[test]
    fn string_coercion_in_arithmetic() {
        assert_eq!(run("print('10' + 5)"), "15\n");
    }

    #[test]
    fn short_circuit_evaluation() {
        let source = "\
local function boom() error('must not run') end
print(false and boom())
print(true or boom())
print(nil or 'fallback')";
        assert_eq!(run(source), "false\ntrue\nfallback\n");
    }

    #[test]
    fn closures_share_upvalues() {
        let source = "\
local function pair()
  local n = 0
  local function bump() n = n + 1 end
  local function get() return n end
  return bump, get
end
local bump, get = pair()
bump()
bump()
print(get())";
        assert_eq!(run(source), "2\n");
    }

    #[test]
    fn loop_closures_capture_per_iteration() {
        let source = "\
local fs = {}
for i = 1, 3 do
  fs[i] = function() return i end
end
print(fs[1](), fs[2](), fs[3]())";
        assert_eq!(run(source), "1\t2\t3\n");
    }

    #[test]
    fn numeric_for_negative_step() {
        assert_eq!(run("for i = 3, 1, -1 do print(i) end"), "3\n2\n1\n");
    }

    #[test]
    fn generic_for_over_pairs() {
        let source = "\
local t = { 10, 20 }
local sum = 0
for k, v in pairs(t) do
  sum = sum + k + v
end
print(sum)";
        assert_eq!(run(source), "33\n");
    }

    #[test]
    fn repeat_runs_at_least_once() {
        assert_eq!(run("local n = 10 repeat print(n) n = n + 1 until n > 10"), "10\n");
    }

    #[test]
    fn multiple_assignment_adjusts() {
        let source = "\
local function two() return 1, 2 end
local a, b, c = two()
print(a, b, c)
local d, e = two(), 10
print(d, e)";
        assert_eq!(run(source), "1\t2\tnil\n1\t10\n");
    }

    #[test]
    fn varargs_spread_into_table() {
        let source = "\
local function collect(...)
  local t = { ... }
  return #t, t[1], t[3]
end
print(collect('a', 'b', 'c'))";
        assert_eq!(run(source), "3\ta\tc\n");
    }

    #[test]
    fn metatable_index_fallback() {
        let source = "\
local base = { greeting = 'hi' }
local obj = setmetatable({}, { __index = base })
print(obj.greeting)";
        assert_eq!(run(source), "hi\n");
    }

    #[test]
    fn calling_a_number_fails() {
        let err = run_err("local x = 5 x()");
        assert!(err.to_string().contains("attempt to call a number value"));
    }

    #[test]
    fn deep_recursion_is_bounded() {
        // The call-depth guard returns a "stack overflow" runtime error
        // before any native overflow, but 200 interpreter frames exceed the
        // default 2 MiB test-thread stack in debug builds, so run on a
        // thread with a generous stack.
        std::thread::Builder::new()
            .stack_size(16 * 1024 * 1024)
            .spawn(|| {
                let err = run_err("local function f() return f() end f()");
                assert!(err.to_string().contains("stack overflow"));
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn paren_truncates_multiple_values() {
        let source = "\
local function two() return 1, 2 end
print((two()))";
        assert_eq!(run(source), "1\n");
    }
}
