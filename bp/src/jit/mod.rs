//! Native tier: template x86-64 compilation of hot register-format
//! functions.
//!
//! `Jit::new` maps the code cache once; `compile` runs the translator
//! and publishes the entry point. Any failure is reported to the caller
//! so the profiler can park the function as FAILED; the interpreter
//! remains the permanent fallback.

pub mod cache;
pub mod emitter;
pub mod translator;

use cache::CodeBuffer;
pub use emitter::JitError;

use crate::bytecode::BpFunction;
use crate::vm::profiler::NativeFn;

pub struct Jit {
    cache: CodeBuffer,
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Jit({:?})", self.cache)
    }
}

impl Jit {
    /// `None` when the host cannot execute generated code (wrong
    /// architecture or no W+X mapping available).
    pub fn new() -> Option<Jit> {
        if !cfg!(target_arch = "x86_64") {
            return None;
        }
        Some(Jit {
            cache: CodeBuffer::new()?,
        })
    }

    /// Translate and publish one function.
    pub fn compile(&mut self, func: &BpFunction) -> Result<NativeFn, JitError> {
        let code = translator::translate(func)?;
        let ptr = self.cache.alloc(&code).ok_or(JitError::CacheFull)?;
        // The region is mapped executable and the bytes are in place.
        Ok(unsafe { std::mem::transmute::<*const u8, NativeFn>(ptr) })
    }
}
