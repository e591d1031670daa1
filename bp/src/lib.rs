// Program output goes through the VM's output sink; nothing in library
// code writes to stdout/stderr directly. CLI binaries (bin/) may use
// eprintln!() for user-facing error messages.
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

//! Compiler, bytecode VM and x86-64 JIT for the BP language.
//!
//! BP source parses to a typed AST (`bp_parser` + `typecheck`), lowers
//! to a stack machine or a three-address register machine (`compile`),
//! persists to `.bpc` files (`bytecode::file`), and executes on an
//! interpreter with a mark-sweep heap, try/catch unwinding, and a
//! profiling tier that compiles hot integer functions to native x86-64
//! (`vm`, `jit`).

// Core modules
pub mod builtins;
pub mod bytecode;
pub mod compile;
pub mod ffi;
pub mod jit;
pub mod typecheck;
pub mod vm;

// Pipeline: parse, check and lower BP source
pub mod pipeline;
pub use pipeline::{compile_and_run, compile_source, run_source_capture, run_source_inspect};

pub use bytecode::{BpModule, CodeFormat};
pub use vm::{DispatchMode, Vm, VmFault};
