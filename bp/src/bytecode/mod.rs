//! In-memory bytecode module representation.
//!
//! A `BpModule` is what both compilers emit and what the VM executes:
//! functions (each a flat code blob in one of the two formats), the
//! deduplicated string pool, class and extern tables, and the global
//! slot count. String pool indices stored in bytecode are per-function
//! local ids that indirect through the function's `str_refs` table into
//! the module pool, so functions can be relocated independently.

pub mod file;
pub mod opcode;
pub mod verify;

use serde::{Deserialize, Serialize};

/// Which machine a function body targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeFormat {
    Stack,
    Register,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpFunction {
    pub name: String,
    pub arity: u16,
    /// Local slot count (stack format; zero for register functions).
    pub locals: u16,
    /// Register file size (register format; zero for stack functions).
    pub reg_count: u16,
    pub format: CodeFormat,
    /// Whether the declared return type is integer-valued. Gates the
    /// native tier, whose results come back as raw 64-bit integers.
    pub int_return: bool,
    /// Per-function local string id -> module pool index.
    pub str_refs: Vec<u32>,
    pub code: Vec<u8>,
}

impl BpFunction {
    /// Resolve a local string id to the module pool index.
    pub fn str_pool_index(&self, local_id: u32) -> Option<u32> {
        self.str_refs.get(local_id as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassType {
    pub name: String,
    pub parent: Option<String>,
    /// Field names, parent fields first.
    pub fields: Vec<String>,
    /// Method table: (name, function index), parent methods first with
    /// overrides replacing the parent entry in place.
    pub methods: Vec<(String, u32)>,
}

/// FFI type codes carried by extern declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FfiType {
    Void = 0,
    Int = 1,
    Float = 2,
    Str = 3,
    Ptr = 4,
}

impl FfiType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FfiType::Void),
            1 => Some(FfiType::Int),
            2 => Some(FfiType::Float),
            3 => Some(FfiType::Str),
            4 => Some(FfiType::Ptr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternFunc {
    pub bp_name: String,
    pub c_name: String,
    pub library: String,
    pub params: Vec<FfiType>,
    pub ret: FfiType,
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BpModule {
    pub funcs: Vec<BpFunction>,
    /// Deduplicated UTF-8 strings.
    pub strings: Vec<String>,
    /// Index of `main`.
    pub entry: u32,
    pub global_count: u32,
    pub class_types: Vec<ClassType>,
    pub extern_funcs: Vec<ExternFunc>,
}

/// Load-time linkage errors: the module refers to something that is not
/// there. Fatal on load.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    BadEntry(u32),
    BadFunctionIndex { func: String, index: u32 },
    BadStringRef { func: String, index: u32 },
    BadJumpTarget { func: String, target: u32 },
    BadRegister { func: String, reg: u8, reg_count: u16 },
    MixedFormats,
    Malformed { func: String, detail: String },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadEntry(i) => write!(f, "entry function index {} out of range", i),
            Self::BadFunctionIndex { func, index } => {
                write!(f, "{}: call target {} out of range", func, index)
            }
            Self::BadStringRef { func, index } => {
                write!(f, "{}: string pool reference {} out of range", func, index)
            }
            Self::BadJumpTarget { func, target } => {
                write!(f, "{}: jump target {} not on an instruction boundary", func, target)
            }
            Self::BadRegister { func, reg, reg_count } => {
                write!(f, "{}: register r{} outside file of {} registers", func, reg, reg_count)
            }
            Self::MixedFormats => write!(f, "module mixes stack and register functions"),
            Self::Malformed { func, detail } => write!(f, "{}: {}", func, detail),
        }
    }
}

impl std::error::Error for LinkError {}

impl BpModule {
    /// Validate module-level linkage plus every function body (see
    /// `verify`). Run on every load of a persisted module.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.entry as usize >= self.funcs.len() {
            return Err(LinkError::BadEntry(self.entry));
        }
        let mut formats = self.funcs.iter().map(|f| f.format);
        if let Some(first) = formats.next() {
            if formats.any(|f| f != first) {
                return Err(LinkError::MixedFormats);
            }
        }
        for func in &self.funcs {
            for &pool_idx in &func.str_refs {
                if pool_idx as usize >= self.strings.len() {
                    return Err(LinkError::BadStringRef {
                        func: func.name.clone(),
                        index: pool_idx,
                    });
                }
            }
        }
        for class in &self.class_types {
            for (mname, fidx) in &class.methods {
                if *fidx as usize >= self.funcs.len() {
                    return Err(LinkError::BadFunctionIndex {
                        func: format!("{}.{}", class.name, mname),
                        index: *fidx,
                    });
                }
            }
        }
        verify::verify_module(self)
    }
}
