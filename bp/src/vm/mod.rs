//! The bytecode interpreter.
//!
//! One `Vm` owns one module and executes it to completion on the
//! calling thread. Both bytecode formats are supported (a module is
//! uniform, enforced at load), each with two observationally equivalent
//! dispatch back-ends: a match-based loop and a jump-table loop over
//! per-opcode handler functions (`dispatch`).
//!
//! Calls feed the per-function profiler; a hot register-format callee
//! with an integer return is handed to the native tier, and afterwards
//! eligible call sites copy integer payloads into an `i64` window,
//! run the compiled body, and store the result without touching the
//! interpreter. Everything else, forever, interprets.

pub mod dispatch;
pub mod error;
mod exec_reg;
mod exec_stack;
pub(crate) mod frame;
pub mod gc;
pub mod profiler;
pub mod rng;
pub mod value;

use std::io::Write;

pub use error::VmFault;
pub use value::Value;

use frame::{Frame, Handler};
use gc::Gc;
use profiler::{FuncState, NativeFn, Profiler};
use rng::Rng;

use crate::builtins::{format_value, stdlib_call, BuiltinCtx};
use crate::bytecode::{BpModule, CodeFormat, LinkError};
use crate::ffi::FfiResolver;
use crate::jit::Jit;

/// Which dispatch back-end the run loop uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Switch,
    Table,
}

/// What a single instruction did to the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Halt,
}

/// Upper bound on simultaneously live frames.
const MAX_FRAMES: usize = 10_000;

pub struct Vm {
    module: BpModule,
    gc: Gc,
    globals: Vec<Value>,
    /// Operand stack + locals regions (stack format).
    stack: Vec<Value>,
    /// Register file (register format); grows by doubling.
    regs: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<Handler>,
    profiler: Profiler,
    jit: Option<Jit>,
    ffi: FfiResolver,
    rng: Rng,
    out: Box<dyn Write>,
    exit_code: i32,
    exiting: bool,
    dispatch: DispatchMode,
    format: CodeFormat,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vm({} functions, {} frames live)",
            self.module.funcs.len(),
            self.frames.len()
        )
    }
}

impl Vm {
    pub fn new(module: BpModule) -> Result<Vm, LinkError> {
        Vm::with_output(module, Box::new(std::io::stdout()))
    }

    /// Build a VM writing program output to `out` (tests capture it).
    pub fn with_output(module: BpModule, out: Box<dyn Write>) -> Result<Vm, LinkError> {
        module.validate()?;
        let format = module
            .funcs
            .get(module.entry as usize)
            .map(|f| f.format)
            .unwrap_or(CodeFormat::Stack);
        let func_count = module.funcs.len();
        let extern_count = module.extern_funcs.len();
        let global_count = module.global_count as usize;
        Ok(Vm {
            module,
            gc: Gc::new(),
            globals: vec![Value::Null; global_count],
            stack: Vec::with_capacity(256),
            regs: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            profiler: Profiler::new(func_count),
            jit: Jit::new(),
            ffi: FfiResolver::new(extern_count),
            rng: Rng::default(),
            out,
            exit_code: 0,
            exiting: false,
            dispatch: DispatchMode::default(),
            format,
        })
    }

    pub fn set_dispatch(&mut self, mode: DispatchMode) {
        self.dispatch = mode;
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn module(&self) -> &BpModule {
        &self.module
    }

    pub fn gc_stats(&self) -> (usize, u64) {
        (self.gc.bytes_allocated(), self.gc.collections())
    }

    /// Execute `main` to completion. The result is the process exit
    /// code: `main`'s return value truncated, or the `exit()` argument.
    pub fn run(&mut self) -> Result<i32, VmFault> {
        let entry = self.module.entry;
        match self.format {
            CodeFormat::Stack => {
                let locals = self.module.funcs[entry as usize].locals as usize;
                self.stack.resize(locals, Value::Null);
                self.frames.push(Frame {
                    func: entry,
                    ip: 0,
                    base: 0,
                    floor: locals,
                    dst: 0,
                    ctor_result: None,
                });
            }
            CodeFormat::Register => {
                let reg_count = self.module.funcs[entry as usize].reg_count as usize;
                self.grow_regs(reg_count);
                self.frames.push(Frame {
                    func: entry,
                    ip: 0,
                    base: 0,
                    floor: 0,
                    dst: 0,
                    ctor_result: None,
                });
            }
        }
        match (self.format, self.dispatch) {
            (CodeFormat::Stack, DispatchMode::Switch) => self.loop_stack_switch(),
            (CodeFormat::Stack, DispatchMode::Table) => self.loop_stack_table(),
            (CodeFormat::Register, DispatchMode::Switch) => self.loop_reg_switch(),
            (CodeFormat::Register, DispatchMode::Table) => self.loop_reg_table(),
        }
    }

    // --- frame and code access -----------------------------------------

    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("no live frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no live frame")
    }

    pub(crate) fn fetch_u8(&mut self) -> Result<u8, VmFault> {
        let frame = self.frames.last_mut().expect("no live frame");
        let code = &self.module.funcs[frame.func as usize].code;
        let byte = *code.get(frame.ip).ok_or(VmFault::CodeOutOfBounds)?;
        frame.ip += 1;
        Ok(byte)
    }

    pub(crate) fn fetch_u16(&mut self) -> Result<u16, VmFault> {
        let frame = self.frames.last_mut().expect("no live frame");
        let code = &self.module.funcs[frame.func as usize].code;
        let bytes = code
            .get(frame.ip..frame.ip + 2)
            .ok_or(VmFault::CodeOutOfBounds)?;
        frame.ip += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn fetch_u32(&mut self) -> Result<u32, VmFault> {
        let frame = self.frames.last_mut().expect("no live frame");
        let code = &self.module.funcs[frame.func as usize].code;
        let bytes = code
            .get(frame.ip..frame.ip + 4)
            .ok_or(VmFault::CodeOutOfBounds)?;
        frame.ip += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn fetch_i64(&mut self) -> Result<i64, VmFault> {
        let frame = self.frames.last_mut().expect("no live frame");
        let code = &self.module.funcs[frame.func as usize].code;
        let bytes = code
            .get(frame.ip..frame.ip + 8)
            .ok_or(VmFault::CodeOutOfBounds)?;
        frame.ip += 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    pub(crate) fn fetch_f64(&mut self) -> Result<f64, VmFault> {
        Ok(f64::from_bits(self.fetch_i64()? as u64))
    }

    pub(crate) fn jump(&mut self, target: u32) {
        self.frame_mut().ip = target as usize;
    }

    /// Pool string for a function-local string id.
    pub(crate) fn local_str(&self, local_id: u32) -> Result<&str, VmFault> {
        let frame = self.frame();
        let func = &self.module.funcs[frame.func as usize];
        let pool = func
            .str_pool_index(local_id)
            .ok_or_else(|| VmFault::Internal(format!("bad string ref {}", local_id)))?;
        self.module
            .strings
            .get(pool as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| VmFault::Internal(format!("bad pool index {}", pool)))
    }

    // --- garbage collection --------------------------------------------

    /// Collection point: run before an allocating instruction pops its
    /// operands, so everything live is still discoverable from roots.
    pub(crate) fn maybe_gc(&mut self) {
        if self.gc.should_collect() {
            self.gc
                .collect(&[&self.stack, &self.regs, &self.globals]);
        }
    }

    // --- operand stack (stack format) ----------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop an operand; popping into the current frame's locals region
    /// is an underflow.
    pub(crate) fn pop(&mut self) -> Result<Value, VmFault> {
        let floor = self.frames.last().map(|f| f.floor).unwrap_or(0);
        if self.stack.len() <= floor {
            return Err(VmFault::StackUnderflow);
        }
        self.stack.pop().ok_or(VmFault::StackUnderflow)
    }

    // --- registers (register format) -----------------------------------

    pub(crate) fn reg(&self, r: u8) -> Value {
        self.regs[self.frame().base + r as usize]
    }

    pub(crate) fn set_reg(&mut self, r: u8, value: Value) {
        let base = self.frame().base;
        self.regs[base + r as usize] = value;
    }

    fn grow_regs(&mut self, needed: usize) {
        if self.regs.len() < needed {
            let new_len = needed.max(self.regs.len() * 2).max(256);
            self.regs.resize(new_len, Value::Null);
        }
    }

    pub(crate) fn global_value(&self, slot: usize) -> Value {
        self.globals[slot]
    }

    pub(crate) fn set_global_value(&mut self, slot: usize, value: Value) {
        self.globals[slot] = value;
    }

    pub(crate) fn regs_slice(&self, base: usize, len: usize) -> Vec<Value> {
        self.regs[base..base + len].to_vec()
    }

    /// Open a register frame: the callee window sits directly above the
    /// caller's, null-initialized, with `self_val` (constructor/method
    /// receiver injection) ahead of the copied arguments.
    pub(crate) fn push_reg_frame(
        &mut self,
        fidx: u32,
        arg_base: u8,
        argc: usize,
        dst: u8,
        ctor: Option<Value>,
        self_val: Option<Value>,
    ) -> Result<(), VmFault> {
        self.check_frame_depth()?;
        let caller = self.frame();
        let caller_base = caller.base;
        let caller_rc = self.module.funcs[caller.func as usize].reg_count as usize;
        let func = &self.module.funcs[fidx as usize];
        let total_args = argc + usize::from(self_val.is_some());
        if total_args != func.arity as usize {
            return Err(VmFault::Internal(format!(
                "call to '{}' with {} arguments (arity {})",
                func.name, total_args, func.arity
            )));
        }
        let callee_rc = (func.reg_count as usize).max(total_args).max(1);
        let callee_base = caller_base + caller_rc;
        self.grow_regs(callee_base + callee_rc);
        for slot in self.regs[callee_base..callee_base + callee_rc].iter_mut() {
            *slot = Value::Null;
        }
        let mut at = callee_base;
        if let Some(receiver) = self_val {
            self.regs[at] = receiver;
            at += 1;
        }
        for i in 0..argc {
            self.regs[at + i] = self.regs[caller_base + arg_base as usize + i];
        }
        self.frames.push(Frame {
            func: fidx,
            ip: 0,
            base: callee_base,
            floor: 0,
            dst,
            ctor_result: ctor,
        });
        Ok(())
    }

    /// Null a popped frame's window so the root scan stays precise.
    pub(crate) fn null_window(&mut self, base: usize, func: u32) {
        let rc = self.module.funcs[func as usize].reg_count as usize;
        let end = (base + rc).min(self.regs.len());
        for slot in self.regs[base..end].iter_mut() {
            *slot = Value::Null;
        }
    }

    // --- calls ----------------------------------------------------------

    /// Count a call on the profiler and, on the HOT transition, hand the
    /// callee to the native tier.
    pub(crate) fn record_call(&mut self, fidx: usize) {
        let state = self.profiler.record_call(fidx);
        if state != FuncState::Hot {
            return;
        }
        let func = &self.module.funcs[fidx];
        let eligible =
            func.format == CodeFormat::Register && func.int_return && self.jit.is_some();
        if !eligible {
            self.profiler.set_failed(fidx);
            return;
        }
        self.profiler.set_compiling(fidx);
        let jit = self.jit.as_mut().expect("eligibility checked");
        match jit.compile(func) {
            Ok(native) => self.profiler.set_compiled(fidx, native),
            Err(_) => self.profiler.set_failed(fidx),
        }
    }

    pub(crate) fn native_entry(&self, fidx: usize) -> Option<NativeFn> {
        self.profiler.native(fidx)
    }

    /// Run a compiled body over an i64 mirror of its register window.
    pub(crate) fn call_native(&mut self, native: NativeFn, fidx: usize, args: &[Value]) -> Value {
        let reg_count = self.module.funcs[fidx].reg_count as usize;
        let mut window = vec![0i64; reg_count.max(args.len()).max(1)];
        for (i, arg) in args.iter().enumerate() {
            window[i] = arg.payload_i64();
        }
        let result = unsafe { native(window.as_mut_ptr()) };
        Value::Int(result)
    }

    pub(crate) fn check_frame_depth(&self) -> Result<(), VmFault> {
        if self.frames.len() >= MAX_FRAMES {
            Err(VmFault::CallStackOverflow)
        } else {
            Ok(())
        }
    }

    /// Dispatch a builtin: arguments were copied to a scratch buffer.
    pub(crate) fn builtin_call(&mut self, id: u16, args: &[Value]) -> Result<Value, VmFault> {
        let mut ctx = BuiltinCtx {
            gc: &mut self.gc,
            module: &self.module,
            out: &mut *self.out,
            exit_code: &mut self.exit_code,
            exiting: &mut self.exiting,
            rng: &mut self.rng,
        };
        stdlib_call(id, args, &mut ctx)
    }

    pub(crate) fn ffi_call(&mut self, ext: usize, args: &[Value]) -> Result<Value, VmFault> {
        let decl = self
            .module
            .extern_funcs
            .get(ext)
            .cloned()
            .ok_or_else(|| VmFault::Internal(format!("bad extern index {}", ext)))?;
        self.ffi.call(ext, &decl, args, &mut self.gc)
    }

    /// Function index a method id resolves to on the receiver's class.
    pub(crate) fn method_target(&self, obj: Value, method_id: u16) -> Result<u32, VmFault> {
        let Value::Class(r) = obj else {
            return Err(VmFault::TagMismatch {
                op: "METHOD_CALL",
                expected: "class instance",
                got: obj.tag(),
            });
        };
        let cid = self.gc.instance_class_id(r)? as usize;
        let class = self
            .module
            .class_types
            .get(cid)
            .ok_or_else(|| VmFault::Internal(format!("bad class id {}", cid)))?;
        class
            .methods
            .get(method_id as usize)
            .map(|(_, fidx)| *fidx)
            .ok_or_else(|| VmFault::Internal(format!("bad method id {}", method_id)))
    }

    /// Allocate a class instance and look up its constructor.
    pub(crate) fn instantiate(&mut self, class_id: u16) -> Result<(Value, Option<u32>), VmFault> {
        let class = self
            .module
            .class_types
            .get(class_id as usize)
            .ok_or_else(|| VmFault::Internal(format!("bad class id {}", class_id)))?;
        let field_count = class.fields.len();
        let init = class
            .methods
            .iter()
            .find(|(name, _)| name == "init")
            .map(|(_, fidx)| *fidx);
        let instance = self.gc.alloc(gc::HeapObj::Instance {
            class_id,
            fields: vec![Value::Null; field_count],
        });
        Ok((Value::Class(instance), init))
    }

    // --- exceptions ------------------------------------------------------

    /// Unwind to the innermost handler; without one the VM terminates
    /// with the thrown value's rendering.
    pub(crate) fn unwind(&mut self, exc: Value) -> Result<(), VmFault> {
        let Some(handler) = self.handlers.pop() else {
            let repr = format_value(exc, &self.gc, &self.module)?;
            return Err(VmFault::UncaughtException(repr));
        };
        match self.format {
            CodeFormat::Stack => {
                self.frames.truncate(handler.frame_idx + 1);
                self.stack.truncate(handler.stack_len);
                let frame = self.frames.last_mut().expect("handler frame alive");
                frame.ip = handler.catch_ip;
                let slot = frame.base + handler.slot as usize;
                self.stack[slot] = exc;
            }
            CodeFormat::Register => {
                if self.frames.len() > handler.frame_idx + 1 {
                    let keep = &self.frames[handler.frame_idx];
                    let keep_end = keep.base
                        + self.module.funcs[keep.func as usize].reg_count as usize;
                    for slot in self.regs[keep_end..].iter_mut() {
                        *slot = Value::Null;
                    }
                    self.frames.truncate(handler.frame_idx + 1);
                }
                let frame = self.frames.last_mut().expect("handler frame alive");
                frame.ip = handler.catch_ip;
                let idx = frame.base + handler.slot as usize;
                self.regs[idx] = exc;
            }
        }
        Ok(())
    }

    // --- small accessors shared by the exec back-ends --------------------

    pub(crate) fn gc_ref(&self) -> &Gc {
        &self.gc
    }

    pub(crate) fn gc_mut(&mut self) -> &mut Gc {
        &mut self.gc
    }

    pub(crate) fn gc_alloc_obj(&mut self, obj: gc::HeapObj) -> u32 {
        self.gc.alloc(obj)
    }

    pub(crate) fn gc_alloc_str(&mut self, s: String) -> u32 {
        self.gc.alloc_str(s)
    }

    pub(crate) fn values_equal(&self, a: Value, b: Value) -> Result<bool, VmFault> {
        self.gc.values_equal(a, b)
    }

    pub(crate) fn push_frame_record(
        &mut self,
        func: u32,
        base: usize,
        floor: usize,
        ctor: Option<Value>,
    ) {
        self.frames.push(Frame {
            func,
            ip: 0,
            base,
            floor,
            dst: 0,
            ctor_result: ctor,
        });
    }

    pub(crate) fn pop_frame_record(&mut self) -> Frame {
        self.frames.pop().expect("no live frame")
    }

    pub(crate) fn no_frames_left(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub(crate) fn exiting(&self) -> bool {
        self.exiting
    }

    pub(crate) fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub(crate) fn push_handler(&mut self, catch: u32, finally: u32, slot: u16) {
        self.handlers.push(Handler {
            catch_ip: catch as usize,
            finally_ip: if finally == crate::bytecode::opcode::NO_FINALLY {
                None
            } else {
                Some(finally as usize)
            },
            slot,
            frame_idx: self.frames.len() - 1,
            stack_len: self.stack.len(),
        });
    }

    pub(crate) fn pop_handler(&mut self) -> Result<(), VmFault> {
        self.handlers
            .pop()
            .map(|_| ())
            .ok_or_else(|| VmFault::Internal("TRY_END without a handler".to_string()))
    }
}

// --- value coercions shared by both exec back-ends -----------------------

pub(crate) fn as_int(value: Value, op: &'static str) -> Result<i64, VmFault> {
    match value {
        Value::Int(v) => Ok(v),
        other => Err(VmFault::TagMismatch {
            op,
            expected: "int",
            got: other.tag(),
        }),
    }
}

/// Integer payload: ints and bools (enum members are ints already).
pub(crate) fn as_int_like(value: Value, op: &'static str) -> Result<i64, VmFault> {
    match value {
        Value::Int(v) => Ok(v),
        Value::Bool(b) => Ok(b as i64),
        other => Err(VmFault::TagMismatch {
            op,
            expected: "int",
            got: other.tag(),
        }),
    }
}

pub(crate) fn as_float(value: Value, op: &'static str) -> Result<f64, VmFault> {
    match value {
        Value::Float(v) => Ok(v),
        other => Err(VmFault::TagMismatch {
            op,
            expected: "float",
            got: other.tag(),
        }),
    }
}

pub(crate) fn as_bool(value: Value, op: &'static str) -> Result<bool, VmFault> {
    match value {
        Value::Bool(b) => Ok(b),
        // Native-tier results carry truth as integers.
        Value::Int(v) => Ok(v != 0),
        other => Err(VmFault::TagMismatch {
            op,
            expected: "bool",
            got: other.tag(),
        }),
    }
}

pub(crate) fn as_func(value: Value, op: &'static str) -> Result<u32, VmFault> {
    match value {
        Value::Func(f) => Ok(f),
        other => Err(VmFault::TagMismatch {
            op,
            expected: "function",
            got: other.tag(),
        }),
    }
}

pub(crate) fn array_index(index: i64, len: usize) -> Result<usize, VmFault> {
    if index < 0 || index as usize >= len {
        Err(VmFault::IndexOutOfBounds { index, len })
    } else {
        Ok(index as usize)
    }
}
