//! Two-pass type checker.
//!
//! Pass 1 collects every nominal: struct/enum/class tables, the global
//! slot table, the function signature table (top-level functions plus
//! one entry per defined method), and the extern table. Pass 2 descends
//! each body with a lexical scope stack, annotating every expression's
//! `inferred` slot and resolving calls, fields, enum members and
//! instantiations in place. No module-level state: everything threads
//! through the `Checker`.
//!
//! Checking is idempotent: a second run over an already-annotated tree
//! resolves every rewrite to itself and leaves the AST bit-identical.

mod expr;
mod stmt;

use std::collections::HashMap;

use bp_parser::ast::{Expr, FuncDef, Module, Param, Type};

use crate::bytecode::FfiType;

/// Semantic error: fatal at compile time, keyed by source line.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeError {
    pub line: u32,
    pub message: String,
}

impl TypeError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for TypeError {}

pub type TcResult<T> = Result<T, TypeError>;

/// Where a function's body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncBody {
    /// `module.funcs[i]`
    TopLevel(usize),
    /// `module.classes[class].methods[method]`
    Method { class: usize, method: usize },
    /// `info.lambdas[i]`
    Lambda(usize),
}

#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub name: String,
    /// Parameter list; methods include `self` first.
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: FuncBody,
}

#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: String,
    pub members: Vec<String>,
}

/// One virtual-table entry. `params` excludes `self`.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub name: String,
    pub fn_index: u32,
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub parent: Option<u16>,
    /// Parent fields first, then own fields.
    pub fields: Vec<(String, Type)>,
    /// Virtual table: parent methods first, overrides replace in place.
    pub methods: Vec<MethodSig>,
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub name: String,
    pub ty: Type,
    pub slot: u16,
}

/// A lambda lifted to a synthetic function. The body is stored checked.
#[derive(Debug, Clone)]
pub struct LambdaInfo {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub struct ExternInfo {
    pub bp_name: String,
    pub c_name: String,
    pub library: String,
    /// Declared BP-level parameter types (for call checking).
    pub param_types: Vec<Type>,
    pub ret_type: Type,
    /// FFI type codes derived from the declared types.
    pub param_codes: Vec<FfiType>,
    pub ret_code: FfiType,
    pub variadic: bool,
}

/// Everything the compilers need besides the annotated AST.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    pub funcs: Vec<FuncInfo>,
    pub structs: Vec<StructInfo>,
    pub enums: Vec<EnumInfo>,
    pub classes: Vec<ClassInfo>,
    pub globals: Vec<GlobalInfo>,
    pub lambdas: Vec<LambdaInfo>,
    pub externs: Vec<ExternInfo>,
    /// Function index of `main`.
    pub entry: u32,
}

pub(crate) struct Checker {
    pub info: ProgramInfo,
    pub func_by_name: HashMap<String, u32>,
    pub struct_by_name: HashMap<String, u16>,
    pub enum_by_name: HashMap<String, u16>,
    pub class_by_name: HashMap<String, u16>,
    pub global_by_name: HashMap<String, u16>,
    pub extern_by_name: HashMap<String, u32>,
    /// Lexical scopes, innermost last.
    pub scopes: Vec<HashMap<String, Type>>,
    /// Return type of the function being checked.
    pub current_ret: Type,
    /// Class context while checking a method body (for `super`).
    pub current_class: Option<u16>,
    /// How many globals are in scope: initializers only see the globals
    /// declared before them; bodies see all of them.
    pub visible_globals: usize,
    /// Nesting depth of enclosing loops (break/continue validation).
    pub loop_depth: usize,
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checker({} functions)", self.info.funcs.len())
    }
}

/// Check a module: annotate the AST in place and return the program
/// tables. Any type error aborts with a line-tagged message.
pub fn check_module(module: &mut Module) -> TcResult<ProgramInfo> {
    let mut checker = Checker::collect(module)?;
    checker.check_bodies(module)?;
    Ok(checker.info)
}

impl Checker {
    /// Pass 1: build every table from declarations alone.
    fn collect(module: &Module) -> TcResult<Checker> {
        let mut checker = Checker {
            info: ProgramInfo::default(),
            func_by_name: HashMap::new(),
            struct_by_name: HashMap::new(),
            enum_by_name: HashMap::new(),
            class_by_name: HashMap::new(),
            global_by_name: HashMap::new(),
            extern_by_name: HashMap::new(),
            scopes: Vec::new(),
            current_ret: Type::Void,
            current_class: None,
            visible_globals: 0,
            loop_depth: 0,
        };

        // Record nominal names first so types can reference each other.
        for (i, def) in module.structs.iter().enumerate() {
            if checker.struct_by_name.insert(def.name.clone(), i as u16).is_some() {
                return Err(TypeError::new(def.line, format!("duplicate struct '{}'", def.name)));
            }
        }
        for (i, def) in module.enums.iter().enumerate() {
            if checker.enum_by_name.insert(def.name.clone(), i as u16).is_some() {
                return Err(TypeError::new(def.line, format!("duplicate enum '{}'", def.name)));
            }
        }
        for (i, def) in module.classes.iter().enumerate() {
            if checker.class_by_name.insert(def.name.clone(), i as u16).is_some() {
                return Err(TypeError::new(def.line, format!("duplicate class '{}'", def.name)));
            }
        }

        // Struct and enum tables.
        for def in &module.structs {
            let mut fields = Vec::with_capacity(def.fields.len());
            for field in &def.fields {
                let ty = checker.resolve_type(&field.ty, def.line)?;
                if fields.iter().any(|(n, _)| n == &field.name) {
                    return Err(TypeError::new(
                        def.line,
                        format!("duplicate field '{}' in struct '{}'", field.name, def.name),
                    ));
                }
                fields.push((field.name.clone(), ty));
            }
            checker.info.structs.push(StructInfo { name: def.name.clone(), fields });
        }
        for def in &module.enums {
            let mut seen = HashMap::new();
            for (i, member) in def.members.iter().enumerate() {
                if seen.insert(member.clone(), i).is_some() {
                    return Err(TypeError::new(
                        def.line,
                        format!("duplicate member '{}' in enum '{}'", member, def.name),
                    ));
                }
            }
            checker.info.enums.push(EnumInfo {
                name: def.name.clone(),
                members: def.members.clone(),
            });
        }

        // Top-level function signatures.
        for (i, func) in module.funcs.iter().enumerate() {
            if checker.func_by_name.contains_key(&func.name) {
                return Err(TypeError::new(func.line, format!("duplicate function '{}'", func.name)));
            }
            let params = checker.resolve_params(&func.params, func.line)?;
            let ret = checker.resolve_type(&func.ret, func.line)?;
            checker.func_by_name.insert(func.name.clone(), i as u32);
            checker.info.funcs.push(FuncInfo {
                name: func.name.clone(),
                params,
                ret,
                body: FuncBody::TopLevel(i),
            });
        }

        // Classes: fields and virtual tables, parents first. Parents
        // must be declared before children, which also rules out cycles.
        for (ci, def) in module.classes.iter().enumerate() {
            let parent = match &def.parent {
                Some(pname) => {
                    let pid = *checker.class_by_name.get(pname).ok_or_else(|| {
                        TypeError::new(def.line, format!("unknown parent class '{}'", pname))
                    })?;
                    if pid as usize >= ci {
                        return Err(TypeError::new(
                            def.line,
                            format!("class '{}' must be declared after its parent '{}'", def.name, pname),
                        ));
                    }
                    Some(pid)
                }
                None => None,
            };

            let mut fields: Vec<(String, Type)> = match parent {
                Some(pid) => checker.info.classes[pid as usize].fields.clone(),
                None => Vec::new(),
            };
            for field in &def.fields {
                if fields.iter().any(|(n, _)| n == &field.name) {
                    return Err(TypeError::new(
                        def.line,
                        format!("duplicate field '{}' in class '{}'", field.name, def.name),
                    ));
                }
                let ty = checker.resolve_type(&field.ty, def.line)?;
                fields.push((field.name.clone(), ty));
            }

            let mut methods: Vec<MethodSig> = match parent {
                Some(pid) => checker.info.classes[pid as usize].methods.clone(),
                None => Vec::new(),
            };
            for (mi, method) in def.methods.iter().enumerate() {
                let fn_index = checker.info.funcs.len() as u32;
                let params = checker.resolve_params(&method.params, method.line)?;
                let ret = checker.resolve_type(&method.ret, method.line)?;
                match params.first() {
                    Some(p) if p.name == "self" && p.ty == Type::Class(def.name.clone()) => {}
                    _ => {
                        return Err(TypeError::new(
                            method.line,
                            format!(
                                "method '{}.{}' must take 'self: {}' as its first parameter",
                                def.name, method.name, def.name
                            ),
                        ))
                    }
                }
                let sig = MethodSig {
                    name: method.name.clone(),
                    fn_index,
                    params: params[1..].iter().map(|p| p.ty.clone()).collect(),
                    ret: ret.clone(),
                };
                match methods.iter_mut().find(|m| m.name == method.name) {
                    Some(slot) => {
                        if slot.params != sig.params || slot.ret != sig.ret {
                            return Err(TypeError::new(
                                method.line,
                                format!(
                                    "override of '{}.{}' changes the method signature",
                                    def.name, method.name
                                ),
                            ));
                        }
                        *slot = sig;
                    }
                    None => methods.push(sig),
                }
                checker.info.funcs.push(FuncInfo {
                    name: format!("{}.{}", def.name, method.name),
                    params,
                    ret,
                    body: FuncBody::Method { class: ci, method: mi },
                });
            }

            checker.info.classes.push(ClassInfo {
                name: def.name.clone(),
                parent,
                fields,
                methods,
            });
        }

        // Globals.
        for stmt in &module.globals {
            let bp_parser::ast::StmtKind::Let { name, ty, .. } = &stmt.kind else {
                return Err(TypeError::new(stmt.line, "only let statements may appear at module level"));
            };
            if checker.global_by_name.contains_key(name) {
                return Err(TypeError::new(stmt.line, format!("duplicate global '{}'", name)));
            }
            let slot = checker.info.globals.len() as u16;
            let ty = checker.resolve_type(ty, stmt.line)?;
            checker.global_by_name.insert(name.clone(), slot);
            checker.info.globals.push(GlobalInfo { name: name.clone(), ty, slot });
        }

        // Externs.
        for (i, decl) in module.externs.iter().enumerate() {
            if checker.extern_by_name.contains_key(&decl.bp_name) {
                return Err(TypeError::new(
                    decl.line,
                    format!("duplicate extern '{}'", decl.bp_name),
                ));
            }
            let mut param_types = Vec::with_capacity(decl.params.len());
            let mut param_codes = Vec::with_capacity(decl.params.len());
            for ty in &decl.params {
                let ty = checker.resolve_type(ty, decl.line)?;
                param_codes.push(ffi_code(&ty, decl.line)?);
                param_types.push(ty);
            }
            let ret_type = checker.resolve_type(&decl.ret, decl.line)?;
            let ret_code = ffi_code(&ret_type, decl.line)?;
            checker.extern_by_name.insert(decl.bp_name.clone(), i as u32);
            checker.info.externs.push(ExternInfo {
                bp_name: decl.bp_name.clone(),
                c_name: decl.c_name.clone(),
                library: decl.library.clone(),
                param_types,
                ret_type,
                param_codes,
                ret_code,
                variadic: decl.variadic,
            });
        }

        // Entry point.
        match checker.func_by_name.get("main") {
            Some(&idx) => {
                let main = &checker.info.funcs[idx as usize];
                if !main.params.is_empty() || main.ret != Type::Int {
                    return Err(TypeError::new(
                        match main.body {
                            FuncBody::TopLevel(i) => module.funcs[i].line,
                            _ => 0,
                        },
                        "main must be 'def main() -> int'",
                    ));
                }
                checker.info.entry = idx;
            }
            None => return Err(TypeError::new(0, "no 'main' function defined")),
        }

        Ok(checker)
    }

    /// Pass 2: check global initializers, then every body.
    fn check_bodies(&mut self, module: &mut Module) -> TcResult<()> {
        // Globals are initialized in order; each initializer sees the
        // globals declared before it.
        for (i, stmt) in module.globals.iter_mut().enumerate() {
            let bp_parser::ast::StmtKind::Let { init, ty, .. } = &mut stmt.kind else {
                unreachable!("validated in pass 1");
            };
            let declared = self.info.globals[i].ty.clone();
            *ty = declared.clone();
            self.visible_globals = i;
            self.check_coerced(init, &declared, stmt.line)?;
        }
        self.visible_globals = self.info.globals.len();

        let mut funcs = std::mem::take(&mut module.funcs);
        for (i, func) in funcs.iter_mut().enumerate() {
            let sig = self.info.funcs[i].clone();
            self.check_function(func, &sig, None)?;
        }
        module.funcs = funcs;

        let mut classes = std::mem::take(&mut module.classes);
        for (ci, class) in classes.iter_mut().enumerate() {
            for (mi, method) in class.methods.iter_mut().enumerate() {
                let sig_index = self
                    .info
                    .funcs
                    .iter()
                    .position(|f| f.body == (FuncBody::Method { class: ci, method: mi }))
                    .expect("method registered in pass 1");
                let sig = self.info.funcs[sig_index].clone();
                self.check_function(method, &sig, Some(ci as u16))?;
            }
        }
        module.classes = classes;
        Ok(())
    }

    fn check_function(
        &mut self,
        func: &mut FuncDef,
        sig: &FuncInfo,
        class: Option<u16>,
    ) -> TcResult<()> {
        // Write the resolved types back so the AST carries no `Named`.
        for (param, resolved) in func.params.iter_mut().zip(sig.params.iter()) {
            param.ty = resolved.ty.clone();
        }
        func.ret = sig.ret.clone();

        self.scopes.clear();
        self.scopes.push(HashMap::new());
        for param in &sig.params {
            if self
                .scopes
                .last_mut()
                .expect("scope pushed above")
                .insert(param.name.clone(), param.ty.clone())
                .is_some()
            {
                return Err(TypeError::new(
                    func.line,
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
        }
        self.current_ret = sig.ret.clone();
        self.current_class = class;
        self.check_block(&mut func.body)?;
        self.current_class = None;
        Ok(())
    }

    fn resolve_params(&self, params: &[Param], line: u32) -> TcResult<Vec<Param>> {
        params
            .iter()
            .map(|p| {
                Ok(Param {
                    name: p.name.clone(),
                    ty: self.resolve_type(&p.ty, line)?,
                })
            })
            .collect()
    }

    /// Resolve `Named` references into struct/enum/class types; resolving
    /// an already-resolved type is the identity.
    pub(crate) fn resolve_type(&self, ty: &Type, line: u32) -> TcResult<Type> {
        Ok(match ty {
            Type::Named(name) => {
                if self.struct_by_name.contains_key(name) {
                    Type::Struct(name.clone())
                } else if self.enum_by_name.contains_key(name) {
                    Type::Enum(name.clone())
                } else if self.class_by_name.contains_key(name) {
                    Type::Class(name.clone())
                } else {
                    return Err(TypeError::new(line, format!("unknown type '{}'", name)));
                }
            }
            Type::Array(elem) => Type::Array(Box::new(self.resolve_type(elem, line)?)),
            Type::Map(k, v) => Type::Map(
                Box::new(self.resolve_type(k, line)?),
                Box::new(self.resolve_type(v, line)?),
            ),
            Type::Tuple(elems) => Type::Tuple(
                elems
                    .iter()
                    .map(|e| self.resolve_type(e, line))
                    .collect::<TcResult<_>>()?,
            ),
            Type::Function(params, ret) => Type::Function(
                params
                    .iter()
                    .map(|p| self.resolve_type(p, line))
                    .collect::<TcResult<_>>()?,
                Box::new(self.resolve_type(ret, line)?),
            ),
            Type::Ptr(elem) => Type::Ptr(Box::new(self.resolve_type(elem, line)?)),
            other => other.clone(),
        })
    }
}

/// Map a declared BP type to its FFI type code.
fn ffi_code(ty: &Type, line: u32) -> TcResult<FfiType> {
    Ok(match ty {
        Type::Void => FfiType::Void,
        Type::Float => FfiType::Float,
        Type::Str => FfiType::Str,
        Type::Ptr(_) => FfiType::Ptr,
        t if t.is_integer() => FfiType::Int,
        Type::Bool => FfiType::Int,
        other => {
            return Err(TypeError::new(
                line,
                format!("type '{}' cannot cross the FFI boundary", other),
            ))
        }
    })
}
