//! Call frames and exception handler records.

use super::value::Value;

/// Per-call activation record. Stack-format frames own a locals region
/// plus an operand floor inside the shared operand stack; register
/// frames own a window of the shared register file.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub func: u32,
    pub ip: usize,
    /// Locals base (stack format) or register window base (register
    /// format).
    pub base: usize,
    /// First operand slot above the locals (stack format only).
    pub floor: usize,
    /// Caller register receiving the return value (register format).
    pub dst: u8,
    /// Set for constructor frames: the value returned to the caller
    /// regardless of what the init body returns.
    pub ctor_result: Option<Value>,
}

/// A try-context: where to land and where to put the thrown value.
#[derive(Debug, Clone)]
pub(crate) struct Handler {
    pub catch_ip: usize,
    /// The catch body falls through into the finally block, so the
    /// unwinder never jumps here; the field mirrors the instruction.
    #[allow(dead_code)]
    pub finally_ip: Option<usize>,
    /// Local slot (stack format) or register (register format) that
    /// receives the thrown value.
    pub slot: u16,
    /// Frame the handler belongs to.
    pub frame_idx: usize,
    /// Operand stack depth to restore (stack format).
    pub stack_len: usize,
}
