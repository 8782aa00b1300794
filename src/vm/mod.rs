//! NariVM: the stack machine that executes Nambly listings.
//!
//! The machine is generic over its input and output streams so tests can run
//! programs against in-memory buffers. Tables and iterators are shared by
//! reference (`Rc`), everything else is copied on push.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read as _, Write};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::nambly::{Instruction, Listing, Opcode, Operand};

/// Float comparisons use a relative tolerance, with an absolute floor so
/// values near zero still compare equal.
const FLOAT_REL_TOLERANCE: f64 = 1e-9;
const FLOAT_ABS_TOLERANCE: f64 = 1e-12;

pub fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= (FLOAT_REL_TOLERANCE * scale).max(FLOAT_ABS_TOLERANCE)
}

/// An insertion-ordered string-keyed table. Iteration and `KEYS` follow the
/// order keys were first inserted; overwriting a key keeps its position.
#[derive(Debug, Default)]
pub struct Table {
    entries: HashMap<String, Value>,
    order: Vec<String>,
}

impl Table {
    pub fn set(&mut self, key: String, value: Value) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Table(Rc<RefCell<Table>>),
    /// A snapshot of table keys (or string positions) being walked by `NEXT`.
    Iter(Rc<RefCell<VecDeque<String>>>),
    Nil,
}

impl Value {
    pub fn new_table() -> Value {
        Value::Table(Rc::new(RefCell::new(Table::default())))
    }

    /// The display form, as printed by `DISP` and used for string coercion.
    pub fn as_text(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Text(s) => s.clone(),
            Value::Table(t) => {
                let t = t.borrow();
                let fields: Vec<String> = t
                    .keys()
                    .map(|k| {
                        let v = t.get(k).map(Value::as_text).unwrap_or_default();
                        format!("{k}: '{v}'")
                    })
                    .collect();
                format!("[{}]", fields.join(", "))
            }
            Value::Iter(_) => "(iterator)".to_string(),
            Value::Nil => "nil".to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Float(f) => !approx_eq(*f, 0.0),
            Value::Text(s) => !s.is_empty(),
            Value::Table(t) => !t.borrow().is_empty(),
            Value::Iter(_) => true,
            Value::Nil => false,
        }
    }

    fn truth(flag: bool) -> Value {
        Value::Int(flag as i64)
    }
}

/// Floats always print with a decimal point, so `2.0` stays distinguishable
/// from `2`.
fn format_float(f: f64) -> String {
    if f.is_finite() && f == f.trunc() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// A numeric view of a value, after coercion.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Num::Int(n) => n,
            Num::Float(f) => f as i64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime error on line {line}: execution stack empty for {op}")]
    StackUnderflow { op: Opcode, line: u32 },
    #[error("Runtime error on line {line}: a nil value cannot be turned into a number")]
    NilAsNumber { line: u32 },
    #[error("Runtime error on line {line}: '{text}' is not a valid number")]
    InvalidNumber { text: String, line: u32 },
    #[error("Runtime error on line {line}: {op} expects {expected}")]
    BadOperand { op: Opcode, expected: &'static str, line: u32 },
    #[error("Runtime error on line {line}: unknown label '{label}'")]
    UnknownLabel { label: String, line: u32 },
    #[error("Runtime error on line {line}: return with an empty call stack")]
    EmptyReturnStack { line: u32 },
    #[error("Runtime error on line {line}: no scope left to delete")]
    NoScopeToDelete { line: u32 },
    #[error("Runtime error on line {line}: division by zero")]
    DivisionByZero { line: u32 },
    #[error("Runtime error on line {line}: integer power overflow")]
    PowerOverflow { line: u32 },
    #[error("Runtime error on line {line}: trying to index a nil value")]
    IndexNil { line: u32 },
    #[error("Runtime error on line {line}: cannot index '{value}' with non-integer '{index}'")]
    BadStringIndex { value: String, index: String, line: u32 },
    #[error("Runtime error on line {line}: cannot get the length of a nil value")]
    LenOfNil { line: u32 },
    #[error("Runtime error on line {line}: cannot get keys of a non-table value")]
    KeysOfNonTable { line: u32 },
    #[error("Runtime error on line {line}: cannot iterate over a non-iterable value")]
    NotIterable { line: u32 },
    #[error("Runtime error on line {line}: the iterator '{name}' does not exist")]
    MissingIterator { name: String, line: u32 },
    #[error("Runtime error on line {line}: '{name}' is not an iterator")]
    NotAnIterator { name: String, line: u32 },
    #[error("Runtime error on line {line}: file '{name}' is not open")]
    FileNotOpen { name: String, line: u32 },
    #[error("Runtime error on line {line}: cannot read file '{name}': {source}")]
    FileRead {
        name: String,
        line: u32,
        source: io::Error,
    },
    #[error("Runtime error on line {line}: file i/o failed: {source}")]
    FileIo { line: u32, source: io::Error },
    #[error("Runtime error on line {line}: cannot run subprocess: {source}")]
    Subprocess { line: u32, source: io::Error },
    #[error("Runtime error on line {line}: i/o failed: {source}")]
    Io { line: u32, source: io::Error },
}

/// How a program run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Execution ran off the end of the listing.
    Finished,
    /// An `EXIT` instruction requested this process exit code.
    Exit(i32),
}

pub struct Vm<R, W> {
    scopes: Vec<HashMap<String, Value>>,
    stack: Vec<Value>,
    return_stack: Vec<usize>,
    open_files: HashMap<String, File>,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Vm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Vm {
            scopes: vec![HashMap::new()],
            stack: Vec::new(),
            return_stack: Vec::new(),
            open_files: HashMap::new(),
            input,
            output,
        }
    }

    /// Variable lookup checks the innermost scope, then the global scope.
    /// Intermediate scopes are invisible.
    fn get_variable(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.scopes.last().and_then(|s| s.get(name)) {
            return Some(value);
        }
        self.scopes.first().and_then(|s| s.get(name))
    }

    fn set_variable(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn set_global_variable(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.first_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn delete_variable(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            if scope.remove(name).is_some() {
                return;
            }
        }
        if let Some(scope) = self.scopes.first_mut() {
            scope.remove(name);
        }
    }

    fn pop(&mut self, op: Opcode, line: u32) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow { op, line })
    }

    fn number(&self, value: &Value, line: u32) -> Result<Num, RuntimeError> {
        match value {
            Value::Int(n) => Ok(Num::Int(*n)),
            Value::Float(f) => Ok(Num::Float(*f)),
            Value::Text(s) => parse_number(s).ok_or_else(|| RuntimeError::InvalidNumber {
                text: s.clone(),
                line,
            }),
            Value::Nil => Err(RuntimeError::NilAsNumber { line }),
            other => Err(RuntimeError::InvalidNumber {
                text: other.as_text(),
                line,
            }),
        }
    }

    fn pop_number(&mut self, op: Opcode, line: u32) -> Result<Num, RuntimeError> {
        let value = self.pop(op, line)?;
        self.number(&value, line)
    }

    fn arg_text<'a>(&self, ins: &'a Instruction) -> Result<&'a str, RuntimeError> {
        match ins.args.first() {
            Some(Operand::Text(s)) => Ok(s),
            _ => Err(RuntimeError::BadOperand {
                op: ins.op,
                expected: "a string operand",
                line: ins.line,
            }),
        }
    }

    fn arg_label<'a>(&self, ins: &'a Instruction) -> Result<&'a str, RuntimeError> {
        match ins.args.first() {
            Some(Operand::Symbol(s)) => Ok(s),
            _ => Err(RuntimeError::BadOperand {
                op: ins.op,
                expected: "a label operand",
                line: ins.line,
            }),
        }
    }

    fn label_target(&self, listing: &Listing, ins: &Instruction) -> Result<usize, RuntimeError> {
        let label = self.arg_label(ins)?;
        listing.labels.get(label).copied().ok_or_else(|| RuntimeError::UnknownLabel {
            label: label.to_string(),
            line: ins.line,
        })
    }

    /// Runs the listing to completion or until `EXIT`.
    pub fn run(&mut self, listing: &Listing) -> Result<Outcome, RuntimeError> {
        let mut pc: usize = 0;
        while let Some(ins) = listing.code.get(pc) {
            let line = ins.line;
            match ins.op {
                Opcode::Push => {
                    let value = match ins.args.first() {
                        Some(Operand::Int(n)) => Value::Int(*n),
                        Some(Operand::Float(f)) => Value::Float(*f),
                        Some(Operand::Text(s)) => Value::Text(s.clone()),
                        _ => {
                            return Err(RuntimeError::BadOperand {
                                op: ins.op,
                                expected: "a literal operand",
                                line,
                            });
                        }
                    };
                    self.stack.push(value);
                }
                Opcode::Pnil => self.stack.push(Value::Nil),
                Opcode::Addv => self.arith(ins.op, line, |a, b| a + b, i64::checked_add)?,
                Opcode::Subt => self.arith(ins.op, line, |a, b| a - b, i64::checked_sub)?,
                Opcode::Mult => self.arith(ins.op, line, |a, b| a * b, i64::checked_mul)?,
                Opcode::Fdiv => {
                    let b = self.pop_number(ins.op, line)?.as_f64();
                    let a = self.pop_number(ins.op, line)?.as_f64();
                    if approx_eq(b, 0.0) {
                        return Err(RuntimeError::DivisionByZero { line });
                    }
                    self.stack.push(Value::Float(a / b));
                }
                Opcode::Idiv => {
                    let b = self.pop_number(ins.op, line)?.as_i64();
                    let a = self.pop_number(ins.op, line)?.as_i64();
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero { line });
                    }
                    self.stack.push(Value::Int(floored_div(a, b)));
                }
                Opcode::Modl => {
                    let b = self.pop_number(ins.op, line)?.as_i64();
                    let a = self.pop_number(ins.op, line)?.as_i64();
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero { line });
                    }
                    self.stack.push(Value::Int(floored_mod(a, b)));
                }
                Opcode::Powr => {
                    let b = self.pop_number(ins.op, line)?;
                    let a = self.pop_number(ins.op, line)?;
                    let value = match (a, b) {
                        (Num::Int(base), Num::Int(exp)) if exp >= 0 => {
                            let exp = u32::try_from(exp)
                                .map_err(|_| RuntimeError::PowerOverflow { line })?;
                            Value::Int(
                                base.checked_pow(exp)
                                    .ok_or(RuntimeError::PowerOverflow { line })?,
                            )
                        }
                        _ => Value::Float(a.as_f64().powf(b.as_f64())),
                    };
                    self.stack.push(value);
                }
                Opcode::Isgt => self.compare(ins.op, line, |o| o == std::cmp::Ordering::Greater)?,
                Opcode::Islt => self.compare(ins.op, line, |o| o == std::cmp::Ordering::Less)?,
                Opcode::Isge => self.compare(ins.op, line, |o| o != std::cmp::Ordering::Less)?,
                Opcode::Isle => self.compare(ins.op, line, |o| o != std::cmp::Ordering::Greater)?,
                Opcode::Iseq => {
                    let b = self.pop(ins.op, line)?;
                    let a = self.pop(ins.op, line)?;
                    let eq = self.values_equal(&a, &b, line)?;
                    self.stack.push(Value::truth(eq));
                }
                Opcode::Isne => {
                    let b = self.pop(ins.op, line)?;
                    let a = self.pop(ins.op, line)?;
                    let eq = self.values_equal(&a, &b, line)?;
                    self.stack.push(Value::truth(!eq));
                }
                Opcode::Vset => {
                    let name = self.arg_text(ins)?.to_string();
                    let value = self.pop(ins.op, line)?;
                    self.set_variable(&name, value);
                }
                Opcode::Gset => {
                    let name = self.arg_text(ins)?.to_string();
                    let value = self.pop(ins.op, line)?;
                    self.set_global_variable(&name, value);
                }
                Opcode::Vget => {
                    let value = self
                        .get_variable(self.arg_text(ins)?)
                        .cloned()
                        .unwrap_or(Value::Nil);
                    self.stack.push(value);
                }
                Opcode::Unst => {
                    let name = self.arg_text(ins)?.to_string();
                    self.delete_variable(&name);
                }
                Opcode::Join => {
                    let b = self.pop(ins.op, line)?.as_text();
                    let mut a = self.pop(ins.op, line)?.as_text();
                    a.push_str(&b);
                    self.stack.push(Value::Text(a));
                }
                Opcode::Sstr => {
                    let count = self.pop_number(ins.op, line)?.as_i64();
                    let from = self.pop_number(ins.op, line)?.as_i64();
                    let text = self.pop(ins.op, line)?.as_text();
                    self.stack.push(Value::Text(substring(&text, from, count)));
                }
                Opcode::Jump => {
                    pc = self.label_target(listing, ins)?;
                    continue;
                }
                Opcode::Call => {
                    let target = self.label_target(listing, ins)?;
                    self.return_stack.push(pc);
                    pc = target;
                    continue;
                }
                Opcode::Rtrn => {
                    let back = self
                        .return_stack
                        .pop()
                        .ok_or(RuntimeError::EmptyReturnStack { line })?;
                    pc = back + 1;
                    continue;
                }
                Opcode::Jpif => {
                    let value = self.pop(ins.op, line)?;
                    if !value.is_true() {
                        pc = self.label_target(listing, ins)?;
                        continue;
                    }
                }
                Opcode::Tabl => self.stack.push(Value::new_table()),
                Opcode::Pset => {
                    let value = self.pop(ins.op, line)?;
                    let index = self.pop(ins.op, line)?.as_text();
                    let table = self.pop(ins.op, line)?;
                    match table {
                        Value::Table(t) => t.borrow_mut().set(index, value),
                        Value::Nil => return Err(RuntimeError::IndexNil { line }),
                        other => {
                            return Err(RuntimeError::BadStringIndex {
                                value: other.as_text(),
                                index,
                                line,
                            });
                        }
                    }
                }
                Opcode::Pget => {
                    let index = self.pop(ins.op, line)?.as_text();
                    let target = self.pop(ins.op, line)?;
                    let value = match target {
                        Value::Table(t) => t.borrow().get(&index).cloned().unwrap_or(Value::Nil),
                        Value::Nil => return Err(RuntimeError::IndexNil { line }),
                        other => {
                            let text = other.as_text();
                            let idx = index.trim().parse::<i64>().map_err(|_| {
                                RuntimeError::BadStringIndex {
                                    value: text.clone(),
                                    index: index.clone(),
                                    line,
                                }
                            })?;
                            Value::Text(char_at(&text, idx))
                        }
                    };
                    self.stack.push(value);
                }
                Opcode::Pust => {
                    let index = self.pop(ins.op, line)?.as_text();
                    let table = self.pop(ins.op, line)?;
                    if let Value::Table(t) = table {
                        t.borrow_mut().remove(&index);
                    }
                }
                Opcode::Pist => {
                    let index = self.pop(ins.op, line)?.as_text();
                    let table = self.pop(ins.op, line)?;
                    let set = match table {
                        Value::Table(t) => t.borrow().contains(&index),
                        _ => false,
                    };
                    self.stack.push(Value::truth(set));
                }
                Opcode::Arrr => {
                    // Pop values down to the nil sentinel, then key them
                    // "1".."n" in push order.
                    let mut popped = Vec::new();
                    loop {
                        match self.pop(ins.op, line)? {
                            Value::Nil => break,
                            value => popped.push(value),
                        }
                    }
                    let table = Value::new_table();
                    if let Value::Table(t) = &table {
                        let mut t = t.borrow_mut();
                        for (i, value) in popped.into_iter().rev().enumerate() {
                            t.set((i + 1).to_string(), value);
                        }
                    }
                    self.stack.push(table);
                }
                Opcode::Dupl => {
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or(RuntimeError::StackUnderflow { op: ins.op, line })?;
                    self.stack.push(top);
                }
                Opcode::Nilq => {
                    let value = self.pop(ins.op, line)?;
                    self.stack.push(Value::truth(matches!(value, Value::Nil)));
                }
                Opcode::Disp => {
                    let value = self.pop(ins.op, line)?;
                    write!(self.output, "{}", value.as_text())
                        .and_then(|_| self.output.flush())
                        .map_err(|source| RuntimeError::Io { line, source })?;
                }
                Opcode::Accp => {
                    let mut buf = String::new();
                    let read = self
                        .input
                        .read_line(&mut buf)
                        .map_err(|source| RuntimeError::Io { line, source })?;
                    if read == 0 {
                        self.stack.push(Value::Nil);
                    } else {
                        while buf.ends_with('\n') || buf.ends_with('\r') {
                            buf.pop();
                        }
                        self.stack.push(Value::Text(buf));
                    }
                }
                Opcode::Popv => {
                    // Tolerates an empty stack: discarded call results may
                    // already be gone.
                    self.stack.pop();
                }
                Opcode::Exit => {
                    let code = self.pop_number(ins.op, line)?.as_i64();
                    return Ok(Outcome::Exit(code as i32));
                }
                Opcode::Rfil => {
                    let name = self.pop(ins.op, line)?.as_text();
                    let contents = std::fs::read_to_string(&name)
                        .map_err(|source| RuntimeError::FileRead { name, line, source })?;
                    self.stack.push(Value::Text(contents));
                }
                Opcode::Forw => self.open_file(ins.op, line, false)?,
                Opcode::Fora => self.open_file(ins.op, line, true)?,
                Opcode::Fcls => {
                    let name = self.pop(ins.op, line)?.as_text();
                    self.open_files.remove(&name);
                }
                Opcode::Rlne => {
                    let name = self.pop(ins.op, line)?.as_text();
                    let file = self
                        .open_files
                        .get_mut(&name)
                        .ok_or_else(|| RuntimeError::FileNotOpen { name: name.clone(), line })?;
                    let text = read_line_raw(file)
                        .map_err(|source| RuntimeError::FileIo { line, source })?;
                    self.stack.push(Value::Text(text));
                }
                Opcode::Fwrt => {
                    let name = self.pop(ins.op, line)?.as_text();
                    let contents = self.pop(ins.op, line)?.as_text();
                    let file = self
                        .open_files
                        .get_mut(&name)
                        .ok_or_else(|| RuntimeError::FileNotOpen { name: name.clone(), line })?;
                    file.write_all(contents.as_bytes())
                        .map_err(|source| RuntimeError::FileIo { line, source })?;
                }
                Opcode::Lnot => {
                    let value = self.pop(ins.op, line)?;
                    self.stack.push(Value::truth(!value.is_true()));
                }
                Opcode::Trim => {
                    let text = self.pop(ins.op, line)?.as_text();
                    self.stack.push(Value::Text(text.trim().to_string()));
                }
                Opcode::Slen => {
                    let value = self.pop(ins.op, line)?;
                    let len = match &value {
                        Value::Nil => return Err(RuntimeError::LenOfNil { line }),
                        Value::Table(t) => t.borrow().len(),
                        other => other.as_text().chars().count(),
                    };
                    self.stack.push(Value::Int(len as i64));
                }
                Opcode::Swap => {
                    let b = self.pop(ins.op, line)?;
                    let a = self.pop(ins.op, line)?;
                    self.stack.push(b);
                    self.stack.push(a);
                }
                Opcode::Land => {
                    let b = self.pop(ins.op, line)?;
                    let a = self.pop(ins.op, line)?;
                    self.stack.push(Value::truth(a.is_true() && b.is_true()));
                }
                Opcode::Lgor => {
                    let b = self.pop(ins.op, line)?;
                    let a = self.pop(ins.op, line)?;
                    self.stack.push(Value::truth(a.is_true() || b.is_true()));
                }
                Opcode::Isin => {
                    let container = self.pop(ins.op, line)?;
                    let needle = self.pop(ins.op, line)?.as_text();
                    let found = match &container {
                        Value::Table(t) => t.borrow().contains(&needle),
                        other => other.as_text().contains(&needle),
                    };
                    self.stack.push(Value::truth(found));
                }
                Opcode::Flor => {
                    let n = self.pop_number(ins.op, line)?;
                    self.stack.push(Value::Int(match n {
                        Num::Int(v) => v,
                        Num::Float(f) => f.floor() as i64,
                    }));
                }
                Opcode::Adsc => self.scopes.push(HashMap::new()),
                Opcode::Dlsc => {
                    // The global scope is never deleted.
                    if self.scopes.len() <= 1 {
                        return Err(RuntimeError::NoScopeToDelete { line });
                    }
                    self.scopes.pop();
                }
                Opcode::Exec => {
                    let command = self.pop(ins.op, line)?.as_text();
                    let result = std::process::Command::new("sh")
                        .arg("-c")
                        .arg(&command)
                        .output()
                        .map_err(|source| RuntimeError::Subprocess { line, source })?;
                    self.stack.push(Value::Int(result.status.code().unwrap_or(-1) as i64));
                    self.stack
                        .push(Value::Text(String::from_utf8_lossy(&result.stderr).into_owned()));
                    self.stack
                        .push(Value::Text(String::from_utf8_lossy(&result.stdout).into_owned()));
                }
                Opcode::Wait => {
                    let seconds = self.pop_number(ins.op, line)?.as_f64();
                    if seconds > 0.0 {
                        thread::sleep(Duration::from_secs_f64(seconds));
                    }
                }
                Opcode::Keys => {
                    let value = self.pop(ins.op, line)?;
                    let Value::Table(source) = value else {
                        return Err(RuntimeError::KeysOfNonTable { line });
                    };
                    let result = Value::new_table();
                    if let Value::Table(t) = &result {
                        let mut t = t.borrow_mut();
                        for (i, key) in source.borrow().keys().enumerate() {
                            t.set((i + 1).to_string(), Value::Text(key.clone()));
                        }
                    }
                    self.stack.push(result);
                }
                Opcode::Gitr => {
                    let value = self.pop(ins.op, line)?;
                    let keys: VecDeque<String> = match &value {
                        Value::Table(t) => t.borrow().keys().cloned().collect(),
                        Value::Text(_) | Value::Int(_) | Value::Float(_) => {
                            let len = value.as_text().chars().count();
                            (1..=len).map(|i| i.to_string()).collect()
                        }
                        _ => return Err(RuntimeError::NotIterable { line }),
                    };
                    self.stack.push(Value::Iter(Rc::new(RefCell::new(keys))));
                }
                Opcode::Next => {
                    let name = self.arg_text(ins)?;
                    let iter = match self.get_variable(name) {
                        Some(Value::Iter(it)) => Rc::clone(it),
                        Some(_) => {
                            return Err(RuntimeError::NotAnIterator {
                                name: name.to_string(),
                                line,
                            });
                        }
                        None => {
                            return Err(RuntimeError::MissingIterator {
                                name: name.to_string(),
                                line,
                            });
                        }
                    };
                    let next = iter.borrow_mut().pop_front();
                    self.stack.push(match next {
                        Some(key) => Value::Text(key),
                        None => Value::Nil,
                    });
                }
            }
            pc += 1;
        }
        Ok(Outcome::Finished)
    }

    fn arith(
        &mut self,
        op: Opcode,
        line: u32,
        float_op: fn(f64, f64) -> f64,
        int_op: fn(i64, i64) -> Option<i64>,
    ) -> Result<(), RuntimeError> {
        let b = self.pop_number(op, line)?;
        let a = self.pop_number(op, line)?;
        let value = match (a, b) {
            (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
                Some(n) => Value::Int(n),
                None => Value::Float(float_op(x as f64, y as f64)),
            },
            _ => Value::Float(float_op(a.as_f64(), b.as_f64())),
        };
        self.stack.push(value);
        Ok(())
    }

    fn compare(
        &mut self,
        op: Opcode,
        line: u32,
        test: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), RuntimeError> {
        let b = self.pop_number(op, line)?.as_f64();
        let a = self.pop_number(op, line)?.as_f64();
        let ordering = if approx_eq(a, b) {
            std::cmp::Ordering::Equal
        } else if a < b {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        };
        self.stack.push(Value::truth(test(ordering)));
        Ok(())
    }

    /// Equality: nil never equals anything (including nil), tables compare by
    /// identity, texts compare byte-wise, numbers compare after promotion.
    /// Mixed text/number operands fall back to numeric comparison.
    fn values_equal(&self, a: &Value, b: &Value, line: u32) -> Result<bool, RuntimeError> {
        Ok(match (a, b) {
            (Value::Nil, _) | (_, Value::Nil) => false,
            (Value::Table(x), Value::Table(y)) => Rc::ptr_eq(x, y),
            (Value::Iter(x), Value::Iter(y)) => Rc::ptr_eq(x, y),
            (Value::Text(x), Value::Text(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Table(_), _) | (_, Value::Table(_)) => false,
            (Value::Iter(_), _) | (_, Value::Iter(_)) => false,
            _ => {
                let x = self.number(a, line)?;
                let y = self.number(b, line)?;
                match (x, y) {
                    (Num::Int(m), Num::Int(n)) => m == n,
                    _ => approx_eq(x.as_f64(), y.as_f64()),
                }
            }
        })
    }

    /// `FORW` / `FORA`: replaces the filename on the stack with itself on
    /// success or nil on failure, so callers can branch on the result.
    fn open_file(&mut self, op: Opcode, line: u32, append: bool) -> Result<(), RuntimeError> {
        let filename = self.pop(op, line)?;
        let name = filename.as_text();
        self.open_files.remove(&name);
        let opened = if append {
            OpenOptions::new().read(true).append(true).create(true).open(&name)
        } else {
            OpenOptions::new().read(true).write(true).open(&name)
        };
        match opened {
            Ok(file) => {
                self.open_files.insert(name, file);
                self.stack.push(filename);
            }
            Err(_) => self.stack.push(Value::Nil),
        }
        Ok(())
    }
}

/// Reads up to and including the next newline, one byte at a time. The empty
/// string signals end of file.
fn read_line_raw(file: &mut File) -> io::Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte)? {
            0 => break,
            _ => {
                bytes.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Parses a numeric string: optional sign, digits, at most one period.
fn parse_number(text: &str) -> Option<Num> {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    let mut found_period = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => {}
            '.' if !found_period => found_period = true,
            _ => return None,
        }
    }
    if found_period {
        trimmed.parse::<f64>().ok().map(Num::Float)
    } else {
        trimmed.parse::<i64>().ok().map(Num::Int)
    }
}

/// Floor division, like the source language's `//`.
fn floored_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }
}

/// Modulo with the sign of the divisor.
fn floored_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

/// One-based string indexing; negative indexes count from the end; out of
/// range yields the empty string.
fn char_at(text: &str, index: i64) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let idx = if index > 0 { index - 1 } else { len + index };
    if idx < 0 || idx >= len {
        String::new()
    } else {
        chars[idx as usize].to_string()
    }
}

/// One-based substring with clamping, matching `char_at`'s index rules.
fn substring(text: &str, from: i64, count: i64) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let mut start = if from > 0 { from - 1 } else { from };
    if start < 0 {
        start += len;
    }
    if start < 0 || start >= len || count <= 0 {
        return String::new();
    }
    let end = (start + count).min(len);
    chars[start as usize..end as usize].iter().collect()
}
