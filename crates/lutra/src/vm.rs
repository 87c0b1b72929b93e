//! Stack-based bytecode virtual machine.
//!
//! The [`Vm`] owns all runtime state: the object heap, the operand stack,
//! the call-frame stack, the open-upvalue list, the globals table, and the
//! output sinks. A single instance is meant to be reused across
//! [`Vm::interpret`] calls; globals persist between them, which is what
//! makes the REPL work.
//!
//! Execution is a fetch-decode-execute loop over the current frame's byte
//! stream. A runtime error prints the message and one stack-trace line per
//! active frame to the error sink, unwinds everything, and surfaces as
//! [`Error::Runtime`].
//!
//! The collector runs only from the allocation helpers ([`Vm::alloc`] and
//! [`Vm::intern`]), which check the heap's watermark before creating an
//! object. Any half-built object that must survive a subsequent allocation
//! is kept reachable by pushing it onto the operand stack first; the
//! closure, class, instance, and concatenation paths below all follow that
//! discipline.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::OpCode;
use crate::compiler::compile;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::object::{
    BoundMethod, Class, Closure, Instance, Native, NativeFn, ObjKind, ObjRef, Str, Upvalue,
    UpvalueState,
};
use crate::table::{hash_str, Table};
use crate::value::{render, Value};

const FRAME_MAX: usize = 64;
const STACK_MAX: usize = FRAME_MAX * 256;

/// One activation record: the closure being run, the instruction pointer
/// into its function's chunk, and the stack slot where its window begins
/// (slot 0 is the callee itself, or `this` for methods).
struct CallFrame {
    closure: ObjRef,
    /// The closure's function, cached at call time.
    function: ObjRef,
    ip: usize,
    base: usize,
}

/// Where a stream of lines goes: a real standard stream, or an in-memory
/// buffer the host can drain (the capturing mode the tests run under).
enum Sink {
    Stdout,
    Stderr,
    Capture(Vec<String>),
}

impl Sink {
    fn write_line(&mut self, line: &str) {
        match self {
            Sink::Stdout => println!("{}", line),
            Sink::Stderr => eprintln!("{}", line),
            Sink::Capture(lines) => lines.push(line.to_string()),
        }
    }

    fn take(&mut self) -> Vec<String> {
        match self {
            Sink::Capture(lines) => std::mem::take(lines),
            _ => Vec::new(),
        }
    }
}

/// The virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the list of open upvalues, sorted by descending stack slot.
    open_upvalues: Option<ObjRef>,
    globals: Table,
    /// In-progress functions on the compiler's context stack; they are GC
    /// roots for collections that land mid-compile.
    pub(crate) compiler_roots: Vec<ObjRef>,
    /// The interned name every initializer method is looked up by.
    init_string: ObjRef,
    out: Sink,
    err: Sink,
}

impl Vm {
    /// A VM printing to the process stdout/stderr.
    pub fn new() -> Vm {
        Vm::with_sinks(Sink::Stdout, Sink::Stderr)
    }

    /// A VM that buffers program output and diagnostics instead of
    /// printing them; drain with [`Vm::take_print_output`] and
    /// [`Vm::take_diagnostics`].
    pub fn with_capture() -> Vm {
        Vm::with_sinks(Sink::Capture(Vec::new()), Sink::Capture(Vec::new()))
    }

    fn with_sinks(out: Sink, err: Sink) -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAME_MAX),
            open_upvalues: None,
            globals: Table::new(),
            compiler_roots: Vec::new(),
            init_string,
            out,
            err,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Compile and run a source string.
    ///
    /// Returns [`Error::Compile`] without executing anything if the source
    /// does not compile, [`Error::Runtime`] if execution aborts. Globals
    /// survive into the next call either way.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = compile(self, source)?;

        // Keep the fresh script function reachable while its closure is
        // allocated.
        self.push(Value::Obj(function));
        let closure = self.alloc(ObjKind::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call(closure, 0)?;

        self.run()
    }

    /// Drain captured `print` output (capturing VMs only).
    pub fn take_print_output(&mut self) -> Vec<String> {
        self.out.take()
    }

    /// Drain captured diagnostics (capturing VMs only).
    pub fn take_diagnostics(&mut self) -> Vec<String> {
        self.err.take()
    }

    #[cfg(test)]
    pub(crate) fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    pub(crate) fn print_line(&mut self, line: &str) {
        self.out.write_line(line);
    }

    pub(crate) fn diag(&mut self, line: &str) {
        self.err.write_line(line);
    }

    // -----------------------------------------------------------------------
    // Allocation and garbage collection
    // -----------------------------------------------------------------------

    /// Allocate a heap object, collecting first if the watermark says so.
    /// The collection happens *before* the object exists, so a fresh
    /// object can never be swept by its own allocation.
    pub(crate) fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(kind)
    }

    /// Find or create the canonical string object for `text`.
    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        if let Some(existing) = self.heap.find_interned(text, hash) {
            return existing;
        }

        if self.heap.should_collect() {
            self.collect_garbage();
        }
        let string = self.heap.allocate(ObjKind::Str(Str {
            text: text.to_string(),
            hash,
        }));
        self.heap.intern_insert(string, hash);
        string
    }

    fn collect_garbage(&mut self) {
        #[cfg(feature = "log-gc")]
        let before = self.heap.bytes_allocated();
        #[cfg(feature = "log-gc")]
        eprintln!("gc: begin");

        // Roots: the operand stack, every frame's closure, the open
        // upvalues, the globals, whatever the compiler is mid-way through
        // building, and the interned `init` name.
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next_open;
        }
        self.heap.mark_table(&self.globals);
        for i in 0..self.compiler_roots.len() {
            let function = self.compiler_roots[i];
            self.heap.mark_object(function);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();

        #[cfg(feature = "log-gc")]
        eprintln!(
            "gc: end, {} -> {} bytes",
            before,
            self.heap.bytes_allocated()
        );
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        self.push(Value::Obj(name));
        let native = self.alloc(ObjKind::Native(Native { function }));
        self.push(Value::Obj(native));

        let hash = self.heap.str_hash(name);
        self.globals.set(name, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // -----------------------------------------------------------------------
    // Stack and frame plumbing
    // -----------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        self.heap.chunk(function).code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function = self.frame().function;
        self.heap.chunk(function).constants[index]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        self.read_constant().as_obj().unwrap()
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    /// Report a runtime error: the message, then one line per active call
    /// frame, innermost first. Unwinds the whole machine.
    fn runtime_error(&mut self, message: impl Into<String>) -> Error {
        let message = message.into();

        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // ip already advanced past the failing instruction.
            let instruction = frame.ip.saturating_sub(1).min(
                function.chunk.lines.len().saturating_sub(1),
            );
            let line = function.chunk.lines[instruction];
            let location = match function.name {
                Some(name) => format!("{}()", self.heap.str_text(name)),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, location));
        }

        self.diag(&message);
        for line in trace {
            self.diag(&line);
        }

        self.reset_stack();
        Error::Runtime(message)
    }

    fn undefined_variable(&mut self, name: ObjRef) -> Error {
        let text = self.heap.str_text(name).to_string();
        self.runtime_error(format!("Undefined variable '{}'.", text))
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r).kind, ObjKind::Instance(_)))
    }

    fn as_class(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r).kind, ObjKind::Class(_)))
    }

    // -----------------------------------------------------------------------
    // Calls and method dispatch
    // -----------------------------------------------------------------------

    fn call(&mut self, closure: ObjRef, arg_count: u8) -> Result<()> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }

        if self.frames.len() == FRAME_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<()> {
        let Some(r) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };

        enum Callee {
            Closure,
            Bound(Value, ObjRef),
            Class,
            Native(NativeFn),
            Other,
        }
        let callee = match &self.heap.get(r).kind {
            ObjKind::Closure(_) => Callee::Closure,
            ObjKind::Bound(b) => Callee::Bound(b.receiver, b.method),
            ObjKind::Class(_) => Callee::Class,
            ObjKind::Native(n) => Callee::Native(n.function),
            _ => Callee::Other,
        };

        match callee {
            Callee::Closure => self.call(r, arg_count),
            Callee::Bound(receiver, method) => {
                // The bound receiver takes over slot 0 of the callee window.
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call(method, arg_count)
            }
            Callee::Class => {
                let slot = self.stack.len() - arg_count as usize - 1;
                let instance = self.alloc(ObjKind::Instance(Instance {
                    class: r,
                    fields: Table::new(),
                }));
                self.stack[slot] = Value::Obj(instance);

                let hash = self.heap.str_hash(self.init_string);
                match self.heap.class(r).methods.get(self.init_string, hash) {
                    Some(initializer) => self.call(initializer.as_obj().unwrap(), arg_count),
                    None if arg_count != 0 => Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {}.",
                        arg_count
                    ))),
                    None => Ok(()),
                }
            }
            Callee::Native(function) => {
                let first = self.stack.len() - arg_count as usize;
                let result = function(&self.stack[first..]);
                self.stack.truncate(first - 1);
                self.push(result);
                Ok(())
            }
            Callee::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<()> {
        let receiver = self.peek(arg_count as usize);
        let Some(instance) = self.as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        // A field may shadow a method of the same name.
        let hash = self.heap.str_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, arg_count: u8) -> Result<()> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.str_text(name).to_string();
            return Err(self.runtime_error(format!("Undefined property '{}'.", text)));
        };
        self.call(method.as_obj().unwrap(), arg_count)
    }

    /// Look up `name` on `class` and replace the instance on top of the
    /// stack with a bound method pairing the two.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<()> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.str_text(name).to_string();
            return Err(self.runtime_error(format!("Undefined property '{}'.", text)));
        };

        let receiver = self.peek(0);
        let bound = self.alloc(ObjKind::Bound(BoundMethod {
            receiver,
            method: method.as_obj().unwrap(),
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------------

    /// Find the open upvalue for `slot`, or splice a new one into the
    /// sorted list. At most one open upvalue exists per stack slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let up = self.heap.upvalue(r);
            let location = match up.state {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if location <= slot {
                if location == slot {
                    return r;
                }
                break;
            }
            prev = Some(r);
            current = up.next_open;
        }

        let created = self.alloc(ObjKind::Upvalue(Upvalue {
            state: UpvalueState::Open(slot),
            next_open: current,
        }));
        match prev {
            Some(p) => self.heap.upvalue_mut(p).next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from`: hoist the stack value
    /// into the upvalue and unlink it. Reads and writes through the
    /// upvalue hit the heap copy from here on.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            let (location, next) = {
                let up = self.heap.upvalue(r);
                let location = match up.state {
                    UpvalueState::Open(s) => s,
                    UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
                };
                (location, up.next_open)
            };
            if location < from {
                break;
            }

            let value = self.stack[location];
            let up = self.heap.upvalue_mut(r);
            up.state = UpvalueState::Closed(value);
            up.next_open = None;
            self.open_upvalues = next;
        }
    }

    // -----------------------------------------------------------------------
    // The dispatch loop
    // -----------------------------------------------------------------------

    fn run(&mut self) -> Result<()> {
        loop {
            #[cfg(feature = "trace-execution")]
            {
                let mut repr = String::from("          ");
                for &value in &self.stack {
                    repr.push_str(&format!("[ {} ]", render(&self.heap, value)));
                }
                eprintln!("{}", repr);
                let frame = self.frame();
                crate::debug::disassemble_instruction(
                    &self.heap,
                    self.heap.chunk(frame.function),
                    frame.ip,
                );
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                unreachable!("invalid opcode {}", byte);
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    // Assignment must not create a global; undo if it did.
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let receiver = self.peek(0);
                    let Some(instance) = self.as_instance(receiver) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };

                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.as_instance(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };

                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);

                    // Leave the assigned value as the expression result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = self.pop().as_obj().unwrap();
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => self.numeric_binary(op)?,
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a).kind, ObjKind::Str(_))
                            && matches!(self.heap.get(b).kind, ObjKind::Str(_)) =>
                    {
                        // Operands stay on the stack until the interned
                        // result exists, so a collection here cannot free
                        // them.
                        let text = format!("{}{}", self.heap.str_text(a), self.heap.str_text(b));
                        let result = self.intern(&text);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                },
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = render(&self.heap, value);
                    self.print_line(&text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // Leaves the condition on the stack: the short-circuit
                    // operators read it as their result.
                    if self.peek(0).is_falsy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    let superclass = self.pop().as_obj().unwrap();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = self.read_constant().as_obj().unwrap();
                    let closure = self.alloc(ObjKind::Closure(Closure {
                        function,
                        upvalues: Vec::new(),
                    }));
                    // On the stack before the captures below can allocate.
                    self.push(Value::Obj(closure));

                    let upvalue_count = self.heap.function(function).upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frame().closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);

                    if self.frames.is_empty() {
                        // The outermost frame: discard the script closure
                        // and halt.
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class = self.alloc(ObjKind::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Some(superclass) = self.as_class(self.peek(1)) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = self.peek(0).as_obj().unwrap();

                    let methods: Vec<(ObjRef, u32, Value)> =
                        self.heap.class(superclass).methods.entries().collect();
                    for (key, hash, value) in methods {
                        self.heap.class_mut(subclass).methods.set(key, hash, value);
                    }
                    // Pop the subclass; the superclass stays for the
                    // `super` local to bind.
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().unwrap();
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    fn numeric_binary(&mut self, op: OpCode) -> Result<()> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!(),
        });
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

/// Seconds since the Unix epoch, as a double. The language only promises
/// "some fixed epoch", so elapsed-time measurements work.
fn native_clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
