//! The stack-based virtual machine.
//!
//! Executes chunks produced by the compiler: a fixed-capacity value stack,
//! up to 64 call frames, a side list of open upvalues kept sorted by
//! descending stack location, a globals table, and the garbage-collected
//! heap. Runtime errors bubble out of the dispatch helpers as `RuntimeError`
//! and are reported with a stack trace before the machine resets.

use std::fmt;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Instant;

use crate::compiler;
use crate::config::RuntimeConfig;
use super::disasm;
use super::heap::{GcStats, Heap, Roots};
use super::object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative, ObjRef,
    ObjUpvalue, StrRef, STRING_MAX_LEN,
};
use super::opcode::OpCode;
use super::table::Table;
use super::value::{values_equal, Value};

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Fixed size of the value stack, in slots.
pub const STACK_MAX: usize = 65536;

/// A runtime error: the message printed ahead of the stack trace.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
        }
    }

    /// An invariant violation inside the VM itself, not a user-level error.
    fn internal(detail: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: format!("internal error: {}", detail.into()),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Why `interpret` failed. The driver maps these onto exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for InterpretError {}

/// One call frame: the executing callable, its instruction pointer, and the
/// stack slot of the callee value (slot 0 of the frame).
#[derive(Debug, Clone, Copy)]
struct Frame {
    callable: ObjRef,
    ip: usize,
    base: usize,
}

/// What a callee turned out to be, extracted before dispatching the call so
/// the heap borrow does not outlive it.
enum Callee {
    Callable(usize),
    Native(NativeFn),
    Class,
    Bound(Value, ObjRef),
}

pub struct VM {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Open upvalues, sorted by descending stack location.
    open_upvalues: Vec<ObjRef>,
    globals: Table,
    heap: Heap,
    /// Pinned so initializer lookup never re-interns.
    init_string: StrRef,
    config: RuntimeConfig,
    /// Where `print` writes; swappable so tests can capture output.
    output: Box<dyn Write>,
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

fn clock_native(_args: &[Value]) -> Value {
    let start = PROCESS_START.get_or_init(Instant::now);
    Value::number(start.elapsed().as_secs_f64())
}

impl VM {
    pub fn new(config: RuntimeConfig) -> VM {
        VM::with_output(config, Box::new(io::stdout()))
    }

    /// A VM whose `print` output goes to `output` instead of stdout.
    pub fn with_output(config: RuntimeConfig, output: Box<dyn Write>) -> VM {
        PROCESS_START.get_or_init(Instant::now);
        let mut heap = if config.gc_stress {
            Heap::stress()
        } else {
            Heap::new()
        };
        let init_string = heap.intern("init");
        let mut vm = VM {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            heap,
            init_string,
            config,
            output,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    /// Compile and execute `source`. Compile errors have already been
    /// reported to stderr by the parser; runtime errors are reported here
    /// with a stack trace, after which the machine is reset so the caller
    /// (e.g. the REPL) can keep using it.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(source, &mut self.heap)
            .map_err(|_| InterpretError::Compile)?;

        if let Err(error) = self.run_script(Value::obj(function)) {
            self.report_runtime_error(&error);
            self.reset();
            return Err(InterpretError::Runtime);
        }
        Ok(())
    }

    fn run_script(&mut self, script: Value) -> Result<(), RuntimeError> {
        self.push(script)?;
        let function = script
            .as_obj()
            .ok_or_else(|| RuntimeError::internal("script is not an object"))?;
        self.call(function, 0, 0)?;
        self.run()
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(ObjNative { function }));
        self.globals.insert(name, Value::obj(native));
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::new("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    fn peek(&self, depth: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if depth < len {
            Ok(self.stack[len - 1 - depth])
        } else {
            Err(RuntimeError::internal("stack underflow"))
        }
    }

    // ------------------------------------------------------------------
    // Instruction stream
    // ------------------------------------------------------------------

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::internal("no active frame"))?;
        let chunk = &self.heap.callable_function(frame.callable).chunk;
        let byte = chunk
            .code
            .get(frame.ip)
            .copied()
            .ok_or_else(|| RuntimeError::internal("instruction pointer out of bounds"))?;
        frame.ip += 1;
        Ok(byte)
    }

    /// Read a 1-, 2-, or 3-byte little-endian index operand.
    fn read_index(&mut self, width: usize) -> Result<usize, RuntimeError> {
        let mut index = 0usize;
        for i in 0..width {
            index |= (self.read_byte()? as usize) << (8 * i);
        }
        Ok(index)
    }

    fn read_i16(&mut self) -> Result<i16, RuntimeError> {
        let lo = self.read_byte()?;
        let hi = self.read_byte()?;
        Ok(i16::from_le_bytes([lo, hi]))
    }

    fn read_constant(&mut self, op: OpCode) -> Result<Value, RuntimeError> {
        let width = op
            .index_width()
            .ok_or_else(|| RuntimeError::internal("opcode has no index operand"))?;
        let index = self.read_index(width)?;
        let frame = self
            .frames
            .last()
            .ok_or_else(|| RuntimeError::internal("no active frame"))?;
        let chunk = &self.heap.callable_function(frame.callable).chunk;
        chunk
            .constants
            .get(index)
            .copied()
            .ok_or_else(|| RuntimeError::internal("constant index out of bounds"))
    }

    fn read_string(&mut self, op: OpCode) -> Result<StrRef, RuntimeError> {
        let value = self.read_constant(op)?;
        value
            .as_obj()
            .and_then(|r| self.heap.str_ref(r))
            .ok_or_else(|| RuntimeError::internal("constant is not a string"))
    }

    fn offset_ip(&mut self, displacement: i16) -> Result<(), RuntimeError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::internal("no active frame"))?;
        frame.ip = (frame.ip as isize + displacement as isize) as usize;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        if self.config.trace_execution {
            eprintln!();
            eprintln!("== trace ==");
        }

        loop {
            if self.config.trace_execution {
                self.trace_instruction();
            }

            let byte = self.read_byte()?;
            let op = OpCode::from_u8(byte)
                .ok_or_else(|| RuntimeError::internal(format!("unknown opcode {}", byte)))?;

            match op {
                OpCode::Constant | OpCode::Constant16 | OpCode::Constant24 => {
                    let value = self.read_constant(op)?;
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::nil())?,
                OpCode::True => self.push(Value::bool(true))?,
                OpCode::False => self.push(Value::bool(false))?,

                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::PopN => {
                    let n = self.read_byte()? as usize;
                    if n > self.stack.len() {
                        return Err(RuntimeError::internal("stack underflow"));
                    }
                    self.stack.truncate(self.stack.len() - n);
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::bool(values_equal(a, b)))?;
                }
                OpCode::Greater => {
                    self.binary_number_op(|a, b| Value::bool(a > b), "Operands must be numbers.")?;
                }
                OpCode::Less => {
                    self.binary_number_op(|a, b| Value::bool(a < b), "Operands must be numbers.")?;
                }

                OpCode::Add => {
                    let b = self.peek(0)?;
                    let a = self.peek(1)?;
                    if self.heap.is_string(a) && self.heap.is_string(b) {
                        self.concatenate()?;
                    } else if a.is_number() && b.is_number() {
                        self.binary_number_op(
                            |a, b| Value::number(a + b),
                            "Operands must be numbers.",
                        )?;
                    } else {
                        return Err(RuntimeError::new(
                            "Operands must be two numbers or two strings.",
                        ));
                    }
                }
                OpCode::Subtract => {
                    self.binary_number_op(|a, b| Value::number(a - b), "Operands must be numbers.")?;
                }
                OpCode::Multiply => {
                    self.binary_number_op(|a, b| Value::number(a * b), "Operands must be numbers.")?;
                }
                OpCode::Divide => {
                    self.binary_number_op(|a, b| Value::number(a / b), "Operands must be numbers.")?;
                }

                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::bool(!value.is_truthy()))?;
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0)?.as_number() else {
                        return Err(RuntimeError::new("Operand must be a number."));
                    };
                    self.pop()?;
                    self.push(Value::number(-n))?;
                }

                OpCode::Print => {
                    let value = self.pop()?;
                    let _ = self.heap.write_value(value, &mut self.output);
                    let _ = writeln!(self.output);
                }

                OpCode::Jump => {
                    let displacement = self.read_i16()?;
                    self.offset_ip(displacement)?;
                }
                OpCode::JumpIfFalse => {
                    let displacement = self.read_i16()?;
                    if !self.peek(0)?.is_truthy() {
                        self.offset_ip(displacement)?;
                    }
                }
                OpCode::JumpIfTrue => {
                    let displacement = self.read_i16()?;
                    if self.peek(0)?.is_truthy() {
                        self.offset_ip(displacement)?;
                    }
                }

                OpCode::Call => {
                    let argc = self.read_byte()? as usize;
                    let callee = self.peek(argc)?;
                    self.call_value(callee, argc)?;
                }

                OpCode::Invoke | OpCode::Invoke16 | OpCode::Invoke24 => {
                    let name = self.read_string(op)?;
                    let argc = self.read_byte()? as usize;
                    self.invoke(name, argc)?;
                }

                OpCode::Closure | OpCode::Closure16 | OpCode::Closure24 => {
                    self.make_closure(op)?;
                }

                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop()?;
                }

                OpCode::Return => {
                    if self.op_return()? {
                        return Ok(());
                    }
                }

                OpCode::Class | OpCode::Class16 | OpCode::Class24 => {
                    let name = self.read_string(op)?;
                    self.maybe_collect();
                    let class = self.heap.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::obj(class))?;
                }

                OpCode::Method | OpCode::Method16 | OpCode::Method24 => {
                    let name = self.read_string(op)?;
                    let method = self.peek(0)?;
                    let class_value = self.peek(1)?;
                    let class = self
                        .as_class(class_value)
                        .ok_or_else(|| RuntimeError::internal("method outside class"))?;
                    if let Obj::Class(c) = self.heap.get_mut(class) {
                        c.methods.insert(name, method);
                    }
                    self.pop()?;
                }

                OpCode::Inherit => {
                    let superclass_value = self.peek(1)?;
                    let Some(superclass) = self.as_class(superclass_value) else {
                        return Err(RuntimeError::new("Superclass must be a class."));
                    };
                    let subclass = self
                        .peek(0)?
                        .as_obj()
                        .ok_or_else(|| RuntimeError::internal("inherit without subclass"))?;
                    let methods: Vec<(StrRef, Value)> = match self.heap.get(superclass) {
                        Obj::Class(c) => c.methods.iter().collect(),
                        _ => Vec::new(),
                    };
                    match self.heap.get_mut(subclass) {
                        Obj::Class(c) => {
                            for (key, value) in methods {
                                c.methods.insert(key, value);
                            }
                        }
                        _ => return Err(RuntimeError::internal("inherit without subclass")),
                    }
                    self.pop()?;
                }

                OpCode::DefineGlobal | OpCode::DefineGlobal16 | OpCode::DefineGlobal24 => {
                    let name = self.read_string(op)?;
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                OpCode::GetGlobal | OpCode::GetGlobal16 | OpCode::GetGlobal24 => {
                    let name = self.read_string(op)?;
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobal16 | OpCode::SetGlobal24 => {
                    let name = self.read_string(op)?;
                    let value = self.peek(0)?;
                    if !self.globals.set(name, value) {
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::GetLocal | OpCode::GetLocal16 | OpCode::GetLocal24 => {
                    let width = op.index_width().unwrap_or(1);
                    let slot = self.read_index(width)?;
                    let base = self.frame_base()?;
                    let value = self
                        .stack
                        .get(base + slot)
                        .copied()
                        .ok_or_else(|| RuntimeError::internal("local slot out of bounds"))?;
                    self.push(value)?;
                }
                OpCode::SetLocal | OpCode::SetLocal16 | OpCode::SetLocal24 => {
                    let width = op.index_width().unwrap_or(1);
                    let slot = self.read_index(width)?;
                    let base = self.frame_base()?;
                    let value = self.peek(0)?;
                    match self.stack.get_mut(base + slot) {
                        Some(target) => *target = value,
                        None => return Err(RuntimeError::internal("local slot out of bounds")),
                    }
                }

                OpCode::GetUpvalue | OpCode::GetUpvalue16 | OpCode::GetUpvalue24 => {
                    let width = op.index_width().unwrap_or(1);
                    let index = self.read_index(width)?;
                    let upvalue = self.frame_upvalue(index)?;
                    let value = match self.heap.get(upvalue) {
                        Obj::Upvalue(ObjUpvalue::Open(slot)) => self.stack[*slot],
                        Obj::Upvalue(ObjUpvalue::Closed(value)) => *value,
                        _ => return Err(RuntimeError::internal("not an upvalue")),
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue | OpCode::SetUpvalue16 | OpCode::SetUpvalue24 => {
                    let width = op.index_width().unwrap_or(1);
                    let index = self.read_index(width)?;
                    let upvalue = self.frame_upvalue(index)?;
                    let value = self.peek(0)?;
                    let open_slot = match self.heap.get(upvalue) {
                        Obj::Upvalue(ObjUpvalue::Open(slot)) => Some(*slot),
                        Obj::Upvalue(ObjUpvalue::Closed(_)) => None,
                        _ => return Err(RuntimeError::internal("not an upvalue")),
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = value,
                        None => {
                            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                                *u = ObjUpvalue::Closed(value);
                            }
                        }
                    }
                }

                OpCode::GetProperty | OpCode::GetProperty16 | OpCode::GetProperty24 => {
                    let name = self.read_string(op)?;
                    let receiver = self.peek(0)?;
                    let Some(instance) = self.as_instance(receiver) else {
                        return Err(RuntimeError::new("Only instances have properties."));
                    };
                    let (class, field) = match self.heap.get(instance) {
                        Obj::Instance(i) => (i.class, i.fields.get(name)),
                        _ => return Err(RuntimeError::internal("not an instance")),
                    };
                    match field {
                        Some(value) => {
                            self.pop()?;
                            self.push(value)?;
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::SetProperty | OpCode::SetProperty16 | OpCode::SetProperty24 => {
                    let name = self.read_string(op)?;
                    let receiver = self.peek(1)?;
                    let Some(instance) = self.as_instance(receiver) else {
                        return Err(RuntimeError::new("Only instances have fields."));
                    };
                    let value = self.peek(0)?;
                    if let Obj::Instance(i) = self.heap.get_mut(instance) {
                        i.fields.insert(name, value);
                    }
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value)?;
                }

                OpCode::GetSuper | OpCode::GetSuper16 | OpCode::GetSuper24 => {
                    let name = self.read_string(op)?;
                    let superclass_value = self.pop()?;
                    let superclass = self
                        .as_class(superclass_value)
                        .ok_or_else(|| RuntimeError::internal("super without superclass"))?;
                    self.bind_method(superclass, name)?;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let Some(r) = callee.as_obj() else {
            return Err(RuntimeError::new("Can only call functions and classes."));
        };
        let kind = match self.heap.get(r) {
            Obj::Function(f) => Callee::Callable(f.arity),
            Obj::Closure(c) => Callee::Callable(self.heap.function(c.function).arity),
            Obj::Native(n) => Callee::Native(n.function),
            Obj::Class(_) => Callee::Class,
            Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
            _ => return Err(RuntimeError::new("Can only call functions and classes.")),
        };

        match kind {
            Callee::Callable(arity) => self.call(r, arity, argc),
            Callee::Native(function) => {
                let first_arg = self.stack.len() - argc;
                let result = function(&self.stack[first_arg..]);
                self.stack.truncate(first_arg - 1);
                self.push(result)
            }
            Callee::Class => self.instantiate(r, argc),
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_value(Value::obj(method), argc)
            }
        }
    }

    fn call(&mut self, callable: ObjRef, arity: usize, argc: usize) -> Result<(), RuntimeError> {
        if argc != arity {
            return Err(RuntimeError::new(format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::new("Stack overflow."));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(Frame {
            callable,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn instantiate(&mut self, class: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        self.maybe_collect();
        let instance = self.heap.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::obj(instance);

        let initializer = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(self.init_string),
            _ => None,
        };
        match initializer {
            Some(init) => self.call_value(init, argc),
            None if argc != 0 => Err(RuntimeError::new(format!(
                "Expected 0 arguments but got {}.",
                argc
            ))),
            None => Ok(()),
        }
    }

    fn invoke(&mut self, name: StrRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc)?;
        let Some(instance) = self.as_instance(receiver) else {
            return Err(RuntimeError::new("Only instances have methods."));
        };
        let (class, field) = match self.heap.get(instance) {
            Obj::Instance(i) => (i.class, i.fields.get(name)),
            _ => return Err(RuntimeError::internal("not an instance")),
        };

        // A field shadows a method: call whatever the field holds.
        if let Some(value) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }

        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name),
            _ => None,
        };
        match method {
            Some(method) => self.call_value(method, argc),
            None => Err(self.undefined_property(name)),
        }
    }

    /// Pop the receiver and push a bound method for `name` from `class`.
    fn bind_method(&mut self, class: ObjRef, name: StrRef) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name),
            _ => None,
        };
        let Some(method) = method else {
            return Err(self.undefined_property(name));
        };
        let method = method
            .as_obj()
            .ok_or_else(|| RuntimeError::internal("method is not an object"))?;

        self.maybe_collect();
        let receiver = self.peek(0)?;
        let bound = self.heap.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver,
            method,
        }));
        self.pop()?;
        self.push(Value::obj(bound))
    }

    fn op_return(&mut self) -> Result<bool, RuntimeError> {
        let result = self.pop()?;
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::internal("no active frame"))?;
        self.close_upvalues(frame.base);

        if self.frames.is_empty() {
            // The script callee itself.
            self.pop()?;
            return Ok(true);
        }

        self.stack.truncate(frame.base);
        self.push(result)?;
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Closures and upvalues
    // ------------------------------------------------------------------

    fn make_closure(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let fn_value = self.read_constant(op)?;
        let function = fn_value
            .as_obj()
            .ok_or_else(|| RuntimeError::internal("closure constant is not a function"))?;
        let upvalue_count = self.heap.function(function).upvalue_count;

        // The closure goes on the stack immediately so the upvalues it
        // accumulates stay reachable while the rest are captured.
        self.maybe_collect();
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::obj(closure))?;

        for _ in 0..upvalue_count {
            let word = self.read_i16()? as u16;
            let is_local = word & 0x8000 != 0;
            let index = (word & 0x7FFF) as usize;
            let upvalue = if is_local {
                let base = self.frame_base()?;
                self.capture_upvalue(base + index)?
            } else {
                self.frame_upvalue(index)?
            };
            if let Obj::Closure(c) = self.heap.get_mut(closure) {
                c.upvalues.push(upvalue);
            }
        }
        Ok(())
    }

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted by descending location.
    fn capture_upvalue(&mut self, location: usize) -> Result<ObjRef, RuntimeError> {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(r) {
                Obj::Upvalue(ObjUpvalue::Open(slot)) if *slot > location => continue,
                Obj::Upvalue(ObjUpvalue::Open(slot)) if *slot == location => return Ok(r),
                _ => {
                    insert_at = i;
                    break;
                }
            }
        }

        self.maybe_collect();
        let created = self.heap.alloc(Obj::Upvalue(ObjUpvalue::Open(location)));
        self.open_upvalues.insert(insert_at, created);
        Ok(created)
    }

    /// Close every open upvalue at stack location `from` or above.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let Obj::Upvalue(ObjUpvalue::Open(slot)) = self.heap.get(r) else {
                break;
            };
            let slot = *slot;
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                *u = ObjUpvalue::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn binary_number_op(
        &mut self,
        make: impl Fn(f64, f64) -> Value,
        message: &str,
    ) -> Result<(), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0)?.as_number(), self.peek(1)?.as_number()) else {
            return Err(RuntimeError::new(message));
        };
        self.pop()?;
        self.pop()?;
        self.push(make(a, b))
    }

    fn concatenate(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;
        let (Some(a), Some(b)) = (a.as_obj(), b.as_obj()) else {
            return Err(RuntimeError::internal("concatenating non-objects"));
        };

        let mut text;
        {
            let a_text = self.heap.str_text(a);
            let b_text = self.heap.str_text(b);
            if a_text.len() + b_text.len() >= STRING_MAX_LEN {
                return Err(RuntimeError::new("String too long."));
            }
            text = String::with_capacity(a_text.len() + b_text.len());
            text.push_str(a_text);
            text.push_str(b_text);
        }

        // Operands stay on the stack across the collection point.
        self.maybe_collect();
        let interned = self.heap.intern(&text);
        self.pop()?;
        self.pop()?;
        self.push(Value::obj(interned.obj))
    }

    fn frame_base(&self) -> Result<usize, RuntimeError> {
        self.frames
            .last()
            .map(|f| f.base)
            .ok_or_else(|| RuntimeError::internal("no active frame"))
    }

    /// The upvalue cell at `index` of the currently executing closure.
    fn frame_upvalue(&self, index: usize) -> Result<ObjRef, RuntimeError> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| RuntimeError::internal("no active frame"))?;
        match self.heap.get(frame.callable) {
            Obj::Closure(c) => c.upvalues.get(index).copied().ok_or_else(|| {
                RuntimeError::internal("upvalue index out of bounds")
            }),
            _ => Err(RuntimeError::internal("upvalue access outside a closure")),
        }
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
    }

    fn as_class(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
    }

    fn undefined_variable(&self, name: StrRef) -> RuntimeError {
        RuntimeError::new(format!(
            "Undefined variable '{}'.",
            self.heap.str_text(name.obj)
        ))
    }

    fn undefined_property(&self, name: StrRef) -> RuntimeError {
        RuntimeError::new(format!(
            "Undefined property '{}'.",
            self.heap.str_text(name.obj)
        ))
    }

    // ------------------------------------------------------------------
    // GC and diagnostics
    // ------------------------------------------------------------------

    /// Run a collection if the heap asks for one. Called immediately before
    /// every runtime allocation, while operands are still rooted.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let frame_callables: Vec<ObjRef> = self.frames.iter().map(|f| f.callable).collect();
        self.heap.collect(Roots {
            stack: &self.stack,
            frames: &frame_callables,
            open_upvalues: &self.open_upvalues,
            globals: &self.globals,
            init_string: self.init_string,
        });
    }

    fn trace_instruction(&self) {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        let _ = write!(out, "          ");
        for value in &self.stack {
            let _ = write!(out, "[ ");
            let _ = self.heap.write_value(*value, &mut out);
            let _ = write!(out, " ]");
        }
        let _ = writeln!(out);

        if let Some(frame) = self.frames.last() {
            let chunk = &self.heap.callable_function(frame.callable).chunk;
            let _ = disasm::disassemble_instruction(&self.heap, chunk, frame.ip, &mut out);
        }
    }

    fn report_runtime_error(&self, error: &RuntimeError) {
        eprintln!("{}", error.message);
        for frame in self.frames.iter().rev() {
            let function = self.heap.callable_function(frame.callable);
            let offset = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(offset).copied().unwrap_or(0);
            match function.name {
                Some(name) => {
                    eprintln!("[line {}] in {}()", line, self.heap.str_text(name.obj))
                }
                None => eprintln!("[line {}] in script", line),
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}
