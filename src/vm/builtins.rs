//! The minimal standard library the reference VM ships: enough for the
//! interpreter template in the emitted output and for the test programs.

use std::cell::RefCell;
use std::rc::Rc;

use crate::vm::value::{value_key, Key, LuaStr, Native, Table, Value};
use crate::vm::vm::{parse_number, RuntimeError, Vm, VmResult};

pub fn install(vm: &mut Vm) {
    let globals = vm.globals.clone();

    set(&globals, "print", native("print", print));
    set(&globals, "type", native("type", type_of));
    set(&globals, "tostring", native("tostring", tostring));
    set(&globals, "tonumber", native("tonumber", tonumber));
    set(&globals, "error", native("error", error_fn));
    set(&globals, "assert", native("assert", assert_fn));
    set(&globals, "select", native("select", select_fn));
    set(&globals, "unpack", native("unpack", unpack_fn));
    set(&globals, "pairs", native("pairs", pairs_fn));
    set(&globals, "ipairs", native("ipairs", ipairs_fn));
    set(&globals, "next", native("next", next_fn));
    set(&globals, "rawget", native("rawget", rawget));
    set(&globals, "rawset", native("rawset", rawset));
    set(&globals, "setmetatable", native("setmetatable", setmetatable));
    set(&globals, "getmetatable", native("getmetatable", getmetatable));

    let string = Rc::new(RefCell::new(Table::new()));
    set(&string, "char", native("char", string_char));
    set(&string, "byte", native("byte", string_byte));
    set(&string, "sub", native("sub", string_sub));
    set(&string, "len", native("len", string_len));
    set(&string, "rep", native("rep", string_rep));
    set(&string, "upper", native("upper", string_upper));
    set(&string, "lower", native("lower", string_lower));
    set(&globals, "string", Value::Table(string));

    let table = Rc::new(RefCell::new(Table::new()));
    set(&table, "concat", native("concat", table_concat));
    set(&table, "insert", native("insert", table_insert));
    set(&table, "remove", native("remove", table_remove));
    set(&globals, "table", Value::Table(table));

    let math = Rc::new(RefCell::new(Table::new()));
    set(&math, "floor", native("floor", math_floor));
    set(&math, "ceil", native("ceil", math_ceil));
    set(&math, "abs", native("abs", math_abs));
    set(&math, "max", native("max", math_max));
    set(&math, "min", native("min", math_min));
    set(&math, "fmod", native("fmod", math_fmod));
    set(&math, "sqrt", native("sqrt", math_sqrt));
    set(&math, "huge", Value::Number(f64::INFINITY));
    set(&globals, "math", Value::Table(math));

    let g = Value::Table(globals.clone());
    set(&globals, "_G", g);
}

fn set(table: &Rc<RefCell<Table>>, name: &str, value: Value) {
    table
        .borrow_mut()
        .set(Value::str(name), value)
        .expect("builtin key");
}

fn native(
    name: &'static str,
    f: fn(&mut Vm, Vec<Value>) -> VmResult<Vec<Value>>,
) -> Value {
    Value::Native(Rc::new(Native {
        name,
        f: Box::new(f),
    }))
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}

fn check_number(args: &[Value], i: usize, who: &str) -> VmResult<f64> {
    match arg(args, i) {
        Value::Number(n) => Ok(n),
        Value::Str(s) => parse_number(&s.to_string_lossy())
            .ok_or_else(|| bad_arg(who, i, "number")),
        _ => Err(bad_arg(who, i, "number")),
    }
}

fn check_str(args: &[Value], i: usize, who: &str) -> VmResult<Rc<LuaStr>> {
    match arg(args, i) {
        Value::Str(s) => Ok(s),
        Value::Number(n) => Ok(Rc::new(LuaStr(Value::number_to_string(n).into_bytes()))),
        _ => Err(bad_arg(who, i, "string")),
    }
}

fn check_table(args: &[Value], i: usize, who: &str) -> VmResult<Rc<RefCell<Table>>> {
    match arg(args, i) {
        Value::Table(t) => Ok(t),
        _ => Err(bad_arg(who, i, "table")),
    }
}

fn bad_arg(who: &str, i: usize, want: &str) -> RuntimeError {
    RuntimeError::msg(format!(
        "bad argument #{} to '{}' ({} expected)",
        i + 1,
        who,
        want
    ))
}

// ===== Base =====

fn print(vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let mut line = Vec::new();
    for (i, value) in args.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        line.extend_from_slice(value.display().as_bytes());
    }
    line.push(b'\n');
    vm.write_output(&line);
    Ok(Vec::new())
}

fn type_of(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::str(arg(&args, 0).type_name())])
}

fn tostring(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::str(&arg(&args, 0).display())])
}

fn tonumber(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let result = match arg(&args, 0) {
        Value::Number(n) => Value::Number(n),
        Value::Str(s) => match parse_number(&s.to_string_lossy()) {
            Some(n) => Value::Number(n),
            None => Value::Nil,
        },
        _ => Value::Nil,
    };
    Ok(vec![result])
}

fn error_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Err(RuntimeError::msg(arg(&args, 0).display()))
}

fn assert_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    if arg(&args, 0).truthy() {
        Ok(args)
    } else {
        let message = match arg(&args, 1) {
            Value::Nil => "assertion failed!".to_string(),
            other => other.display(),
        };
        Err(RuntimeError::msg(message))
    }
}

fn select_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    match arg(&args, 0) {
        Value::Str(s) if s.as_bytes() == b"#" => {
            Ok(vec![Value::Number((args.len() - 1) as f64)])
        }
        Value::Number(n) if n >= 1.0 => {
            let start = n as usize;
            Ok(args.into_iter().skip(start).collect())
        }
        _ => Err(bad_arg("select", 0, "number")),
    }
}

fn unpack_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "unpack")?;
    let first = match arg(&args, 1) {
        Value::Nil => 1.0,
        v => check_number(&[v], 0, "unpack")?,
    };
    let last = match arg(&args, 2) {
        Value::Nil => t.borrow().length() as f64,
        v => check_number(&[v], 0, "unpack")?,
    };
    let mut out = Vec::new();
    let mut i = first;
    while i <= last {
        out.push(t.borrow().get(&Value::Number(i)));
        i += 1.0;
    }
    Ok(out)
}

fn pairs_fn(vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = arg(&args, 0);
    check_table(&args, 0, "pairs")?;
    let next = vm.globals.borrow().get(&Value::str("next"));
    Ok(vec![next, t, Value::Nil])
}

fn ipairs_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = arg(&args, 0);
    check_table(&args, 0, "ipairs")?;
    Ok(vec![native("ipairs_iter", ipairs_iter), t, Value::Number(0.0)])
}

fn ipairs_iter(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "ipairs")?;
    let i = check_number(&args, 1, "ipairs")? + 1.0;
    let v = t.borrow().get(&Value::Number(i));
    if matches!(v, Value::Nil) {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Number(i), v])
    }
}

/// Stateless traversal: array part first, then the hash part in insertion
/// order.
fn next_fn(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "next")?;
    let t = t.borrow();
    let key = arg(&args, 1);

    let array_len = t.array.len();
    // Where to resume: an array position, or a hash position.
    let (array_from, hash_start) = match &key {
        Value::Nil => (Some(0), 0),
        Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 && *n <= array_len as f64 => {
            (Some(*n as usize), 0)
        }
        other => {
            let index = value_key(other)
                .and_then(|k| t.hash.get_index_of(&k))
                .ok_or_else(|| RuntimeError::msg("invalid key to 'next'"))?;
            (None, index + 1)
        }
    };

    if let Some(from) = array_from {
        // Skip holes left by explicit nil writes.
        for i in from..array_len {
            if !matches!(t.array[i], Value::Nil) {
                return Ok(vec![Value::Number((i + 1) as f64), t.array[i].clone()]);
            }
        }
    }

    match t.hash.get_index(hash_start) {
        Some((k, v)) => Ok(vec![key_value(k), v.clone()]),
        None => Ok(vec![Value::Nil]),
    }
}

fn key_value(key: &Key) -> Value {
    match key {
        Key::Bool(b) => Value::Bool(*b),
        Key::Number(bits) => Value::Number(f64::from_bits(*bits)),
        Key::Str(s) => Value::Str(s.clone()),
    }
}

fn rawget(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "rawget")?;
    let v = t.borrow().get(&arg(&args, 1));
    Ok(vec![v])
}

fn rawset(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "rawset")?;
    t.borrow_mut()
        .set(arg(&args, 1), arg(&args, 2))
        .map_err(RuntimeError::msg)?;
    Ok(vec![arg(&args, 0)])
}

fn setmetatable(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "setmetatable")?;
    match arg(&args, 1) {
        Value::Table(meta) => t.borrow_mut().meta = Some(meta),
        Value::Nil => t.borrow_mut().meta = None,
        _ => return Err(bad_arg("setmetatable", 1, "nil or table")),
    }
    Ok(vec![arg(&args, 0)])
}

fn getmetatable(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "getmetatable")?;
    let meta = t.borrow().meta.clone();
    Ok(vec![match meta {
        Some(m) => Value::Table(m),
        None => Value::Nil,
    }])
}

// ===== string =====

fn string_char(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let mut bytes = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let n = check_number(&args, i, "char")?;
        if !(0.0..=255.0).contains(&n) {
            return Err(bad_arg("char", i, "value in range 0..255"));
        }
        bytes.push(n as u8);
    }
    Ok(vec![Value::bytes(bytes)])
}

fn string_byte(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "byte")?;
    let len = s.0.len() as f64;
    let first = match arg(&args, 1) {
        Value::Nil => 1.0,
        v => check_number(&[v], 0, "byte")?,
    };
    let last = match arg(&args, 2) {
        Value::Nil => first,
        v => check_number(&[v], 0, "byte")?,
    };
    let first = normalize_index(first, len).max(1.0);
    let last = normalize_index(last, len).min(len);
    let mut out = Vec::new();
    let mut i = first;
    while i <= last {
        out.push(Value::Number(s.0[i as usize - 1] as f64));
        i += 1.0;
    }
    Ok(out)
}

fn string_sub(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "sub")?;
    let len = s.0.len() as f64;
    let first = match arg(&args, 1) {
        Value::Nil => 1.0,
        v => check_number(&[v], 0, "sub")?,
    };
    let last = match arg(&args, 2) {
        Value::Nil => -1.0,
        v => check_number(&[v], 0, "sub")?,
    };
    let first = normalize_index(first, len).max(1.0);
    let last = normalize_index(last, len).min(len);
    if first > last {
        return Ok(vec![Value::str("")]);
    }
    Ok(vec![Value::bytes(
        s.0[first as usize - 1..last as usize].to_vec(),
    )])
}

/// Negative indexes count from the end, Lua style.
fn normalize_index(i: f64, len: f64) -> f64 {
    if i < 0.0 {
        (len + i + 1.0).max(0.0)
    } else {
        i
    }
}

fn string_len(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "len")?;
    Ok(vec![Value::Number(s.0.len() as f64)])
}

fn string_rep(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "rep")?;
    let n = check_number(&args, 1, "rep")?;
    let mut out = Vec::new();
    for _ in 0..n.max(0.0) as usize {
        out.extend_from_slice(&s.0);
    }
    Ok(vec![Value::bytes(out)])
}

fn string_upper(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "upper")?;
    Ok(vec![Value::bytes(s.0.to_ascii_uppercase())])
}

fn string_lower(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let s = check_str(&args, 0, "lower")?;
    Ok(vec![Value::bytes(s.0.to_ascii_lowercase())])
}

// ===== table =====

fn table_concat(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "concat")?;
    let sep = match arg(&args, 1) {
        Value::Nil => Vec::new(),
        v => check_str(&[v], 0, "concat")?.0.clone(),
    };
    let len = t.borrow().length();
    let mut out = Vec::new();
    for i in 1..=len {
        if i > 1 {
            out.extend_from_slice(&sep);
        }
        match t.borrow().get(&Value::Number(i as f64)) {
            Value::Str(s) => out.extend_from_slice(&s.0),
            Value::Number(n) => out.extend_from_slice(Value::number_to_string(n).as_bytes()),
            other => {
                return Err(RuntimeError::msg(format!(
                    "invalid value (at index {}) in table for 'concat' ({})",
                    i,
                    other.type_name()
                )))
            }
        }
    }
    Ok(vec![Value::bytes(out)])
}

fn table_insert(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "insert")?;
    if args.len() >= 3 {
        let pos = check_number(&args, 1, "insert")? as usize;
        let value = arg(&args, 2);
        let mut table = t.borrow_mut();
        if pos >= 1 && pos <= table.array.len() + 1 {
            table.array.insert(pos - 1, value);
        } else {
            return Err(bad_arg("insert", 1, "position in bounds"));
        }
    } else {
        let value = arg(&args, 1);
        let len = t.borrow().length();
        t.borrow_mut()
            .set(Value::Number((len + 1) as f64), value)
            .map_err(RuntimeError::msg)?;
    }
    Ok(Vec::new())
}

fn table_remove(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let t = check_table(&args, 0, "remove")?;
    let mut table = t.borrow_mut();
    let len = table.array.len();
    let pos = match arg(&args, 1) {
        Value::Nil => len,
        v => check_number(&[v], 0, "remove")? as usize,
    };
    if len == 0 || pos == 0 || pos > len {
        return Ok(vec![Value::Nil]);
    }
    Ok(vec![table.array.remove(pos - 1)])
}

// ===== math =====

fn math_floor(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number(&args, 0, "floor")?.floor())])
}

fn math_ceil(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number(&args, 0, "ceil")?.ceil())])
}

fn math_abs(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number(&args, 0, "abs")?.abs())])
}

fn math_max(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let mut best = check_number(&args, 0, "max")?;
    for i in 1..args.len() {
        best = best.max(check_number(&args, i, "max")?);
    }
    Ok(vec![Value::Number(best)])
}

fn math_min(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let mut best = check_number(&args, 0, "min")?;
    for i in 1..args.len() {
        best = best.min(check_number(&args, i, "min")?);
    }
    Ok(vec![Value::Number(best)])
}

fn math_fmod(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let a = check_number(&args, 0, "fmod")?;
    let b = check_number(&args, 1, "fmod")?;
    Ok(vec![Value::Number(a % b)])
}

fn math_sqrt(_vm: &mut Vm, args: Vec<Value>) -> VmResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number(&args, 0, "sqrt")?.sqrt())])
}
