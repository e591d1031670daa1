//! Lowering from the typed AST to bytecode.
//!
//! Two backends share this driver: the stack compiler (`stack`) and the
//! register compiler (`reg`) with its linear-scan allocator
//! (`regalloc`). Both consume the same checked AST plus `ProgramInfo`
//! and emit a `BpModule`; the driver assembles the shared pieces
//! (string pool, class table, extern table, globals) and dispatches
//! per-function lowering to the chosen backend.
//!
//! Global initializers compile into a preamble of the entry function,
//! so the module format carries nothing beyond the slot count.

pub mod reg;
pub mod regalloc;
pub mod stack;

use std::collections::HashMap;

use bp_parser::ast::{Expr, FuncDef, Module, Param, Stmt, Type};

use crate::bytecode::{BpFunction, BpModule, ClassType, CodeFormat, ExternFunc};
use crate::typecheck::{FuncBody, FuncInfo, ProgramInfo};

/// Lowering failure: a construction the bytecode cannot express
/// (register exhaustion, oversized literal windows). The checker has
/// already ruled out everything type-shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweringError {
    pub line: u32,
    pub message: String,
}

impl LoweringError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LoweringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LoweringError {}

pub type CResult<T> = Result<T, LoweringError>;

/// Module-wide deduplicating string pool.
#[derive(Debug, Default)]
pub struct StringPool {
    pub strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringPool {
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), id);
        id
    }
}

/// Per-function local string table: bytecode stores local ids that
/// indirect through `refs` into the module pool.
#[derive(Debug, Default)]
pub struct FuncStrings {
    pub refs: Vec<u32>,
    local_by_pool: HashMap<u32, u32>,
}

impl FuncStrings {
    pub fn local_id(&mut self, pool_index: u32) -> u32 {
        if let Some(&local) = self.local_by_pool.get(&pool_index) {
            return local;
        }
        let local = self.refs.len() as u32;
        self.refs.push(pool_index);
        self.local_by_pool.insert(pool_index, local);
        local
    }
}

/// The source of one compiled function's body.
pub(crate) enum BodySource<'a> {
    Stmts(&'a [Stmt]),
    /// Lambda body: a single expression returned implicitly.
    Lambda(&'a Expr),
}

impl std::fmt::Debug for BodySource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::Stmts(s) => write!(f, "Stmts({})", s.len()),
            BodySource::Lambda(_) => write!(f, "Lambda"),
        }
    }
}

pub(crate) struct FuncSource<'a> {
    pub info: &'a FuncInfo,
    pub params: &'a [Param],
    pub ret: &'a Type,
    pub body: BodySource<'a>,
    /// Global initializers to prepend (entry function only).
    pub global_inits: &'a [Stmt],
}

/// Locate the body of every function in index order.
pub(crate) fn func_sources<'a>(
    module: &'a Module,
    info: &'a ProgramInfo,
) -> Vec<FuncSource<'a>> {
    info.funcs
        .iter()
        .enumerate()
        .map(|(idx, finfo)| {
            let (params, ret, body) = match finfo.body {
                FuncBody::TopLevel(i) => {
                    let f: &FuncDef = &module.funcs[i];
                    (&f.params[..], &f.ret, BodySource::Stmts(&f.body))
                }
                FuncBody::Method { class, method } => {
                    let f: &FuncDef = &module.classes[class].methods[method];
                    (&f.params[..], &f.ret, BodySource::Stmts(&f.body))
                }
                FuncBody::Lambda(i) => {
                    let lambda = &info.lambdas[i];
                    (
                        &lambda.params[..],
                        &lambda.ret,
                        BodySource::Lambda(&lambda.body),
                    )
                }
            };
            let global_inits = if idx as u32 == info.entry {
                &module.globals[..]
            } else {
                &[][..]
            };
            FuncSource {
                info: finfo,
                params,
                ret,
                body,
                global_inits,
            }
        })
        .collect()
}

/// Assemble the module-level tables shared by both backends.
pub(crate) fn assemble(
    info: &ProgramInfo,
    funcs: Vec<BpFunction>,
    pool: StringPool,
) -> BpModule {
    let class_types = info
        .classes
        .iter()
        .map(|c| ClassType {
            name: c.name.clone(),
            parent: c
                .parent
                .map(|p| info.classes[p as usize].name.clone()),
            fields: c.fields.iter().map(|(n, _)| n.clone()).collect(),
            methods: c
                .methods
                .iter()
                .map(|m| (m.name.clone(), m.fn_index))
                .collect(),
        })
        .collect();
    let extern_funcs = info
        .externs
        .iter()
        .map(|e| ExternFunc {
            bp_name: e.bp_name.clone(),
            c_name: e.c_name.clone(),
            library: e.library.clone(),
            params: e.param_codes.clone(),
            ret: e.ret_code,
            variadic: e.variadic,
        })
        .collect();
    BpModule {
        funcs,
        strings: pool.strings,
        entry: info.entry,
        global_count: info.globals.len() as u32,
        class_types,
        extern_funcs,
    }
}

/// Compile a checked module with the chosen backend.
pub fn compile_module(
    module: &Module,
    info: &ProgramInfo,
    format: CodeFormat,
) -> CResult<BpModule> {
    match format {
        CodeFormat::Stack => stack::compile(module, info),
        CodeFormat::Register => reg::compile(module, info),
    }
}

/// Slot of a module global by name.
pub(crate) fn global_slot(info: &ProgramInfo, name: &str) -> Option<u16> {
    info.globals
        .iter()
        .find(|g| g.name == name)
        .map(|g| g.slot)
}

/// Resolved fn index of the parent method a super call targets, given
/// the function whose body contains the call.
pub(crate) fn super_target(
    info: &ProgramInfo,
    current_fn: &FuncInfo,
    method_id: u16,
) -> Option<u32> {
    let FuncBody::Method { class, .. } = current_fn.body else {
        return None;
    };
    let parent = info.classes[class].parent?;
    info.classes[parent as usize]
        .methods
        .get(method_id as usize)
        .map(|m| m.fn_index)
}
