//! Compilation pipeline: source text -> AST -> typed AST -> bytecode.
//!
//! BP source -> Parser -> Module -> type check (annotates in place,
//! yields the program tables) -> stack or register lowering ->
//! `BpModule`, ready to run, persist, or both.

use bp_parser::error::ParseError;

use crate::bytecode::{BpModule, CodeFormat, LinkError};
use crate::compile::{compile_module, LoweringError};
use crate::typecheck::{check_module, TypeError};
use crate::vm::{DispatchMode, Vm, VmFault};

/// Error variants produced by compiling and running BP source.
#[derive(Debug)]
pub enum PipelineError {
    /// Source code failed to parse.
    Parse(ParseError),
    /// The program is not well typed.
    Check(TypeError),
    /// Lowering to bytecode failed.
    Lower(LoweringError),
    /// A produced or loaded module failed validation.
    Link(LinkError),
    /// The program faulted at runtime.
    Runtime(VmFault),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Parse(e) => write!(f, "parse error: {}", e),
            PipelineError::Check(e) => write!(f, "type error: {}", e),
            PipelineError::Lower(e) => write!(f, "lowering error: {}", e),
            PipelineError::Link(e) => write!(f, "link error: {}", e),
            PipelineError::Runtime(e) => write!(f, "runtime error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ParseError> for PipelineError {
    fn from(e: ParseError) -> Self {
        PipelineError::Parse(e)
    }
}

impl From<TypeError> for PipelineError {
    fn from(e: TypeError) -> Self {
        PipelineError::Check(e)
    }
}

impl From<LoweringError> for PipelineError {
    fn from(e: LoweringError) -> Self {
        PipelineError::Lower(e)
    }
}

impl From<LinkError> for PipelineError {
    fn from(e: LinkError) -> Self {
        PipelineError::Link(e)
    }
}

impl From<VmFault> for PipelineError {
    fn from(e: VmFault) -> Self {
        PipelineError::Runtime(e)
    }
}

/// Compile source text to a bytecode module in the chosen format.
pub fn compile_source(source: &str, format: CodeFormat) -> Result<BpModule, PipelineError> {
    let mut module = bp_parser::parse_module(source)?;
    let info = check_module(&mut module)?;
    let compiled = compile_module(&module, &info, format)?;
    compiled.validate()?;
    Ok(compiled)
}

/// Compile and immediately execute, writing program output to stdout.
pub fn compile_and_run(
    source: &str,
    format: CodeFormat,
    dispatch: DispatchMode,
) -> Result<i32, PipelineError> {
    let module = compile_source(source, format)?;
    let mut vm = Vm::new(module)?;
    vm.set_dispatch(dispatch);
    Ok(vm.run()?)
}

/// Clonable output sink for capturing program output (tests, tooling).
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_string(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl std::io::Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Compile, run with captured output, and return (stdout, exit code).
pub fn run_source_capture(
    source: &str,
    format: CodeFormat,
    dispatch: DispatchMode,
) -> Result<(String, i32), PipelineError> {
    let module = compile_source(source, format)?;
    let out = SharedOutput::new();
    let mut vm = Vm::with_output(module, Box::new(out.clone()))?;
    vm.set_dispatch(dispatch);
    let code = vm.run()?;
    Ok((out.take_string(), code))
}

/// Like `run_source_capture`, but also hands the finished VM to a
/// callback for post-run inspection (profiler state, GC counters).
pub fn run_source_inspect<T>(
    source: &str,
    format: CodeFormat,
    dispatch: DispatchMode,
    inspect: impl FnOnce(&Vm) -> T,
) -> Result<(String, i32, T), PipelineError> {
    let module = compile_source(source, format)?;
    let out = SharedOutput::new();
    let mut vm = Vm::with_output(module, Box::new(out.clone()))?;
    vm.set_dispatch(dispatch);
    let code = vm.run()?;
    let extra = inspect(&vm);
    Ok((out.take_string(), code, extra))
}
