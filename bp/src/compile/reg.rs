//! Register-bytecode compiler.
//!
//! Every expression lowers to code leaving its result in some register,
//! which the emitter returns; callers free consumed temporaries.
//! Variables hold a stable register for the lifetime of their scope
//! (the allocator pins them under a scope-qualified key, so shadowing
//! gets a fresh register). Calls and aggregate literals assemble their
//! operands in a block-allocated window of consecutive registers.

use std::collections::HashMap;

use bp_parser::ast::{
    BinOp, CallTarget, Expr, ExprKind, FStringPart, Stmt, StmtKind, Type, UnOp,
};

use super::regalloc::RegAlloc;
use super::{
    assemble, func_sources, global_slot, super_target, BodySource, CResult, FuncSource,
    FuncStrings, LoweringError, StringPool,
};
use crate::builtins::BuiltinId;
use crate::bytecode::opcode::{CodeWriter, ROp, NO_FINALLY};
use crate::bytecode::{BpFunction, BpModule, CodeFormat};
use crate::typecheck::{FuncInfo, ProgramInfo};

pub fn compile(module: &bp_parser::ast::Module, info: &ProgramInfo) -> CResult<BpModule> {
    let mut pool = StringPool::default();
    let mut funcs = Vec::with_capacity(info.funcs.len());
    for src in func_sources(module, info) {
        funcs.push(FuncCompiler::run(&src, info, &mut pool)?);
    }
    Ok(assemble(info, funcs, pool))
}

struct LoopCtx {
    break_holes: Vec<usize>,
    continue_holes: Vec<usize>,
    continue_addr: Option<u32>,
    try_depth: usize,
}

struct TryCtx<'a> {
    handler_active: bool,
    finally: Option<&'a [Stmt]>,
}

struct FuncCompiler<'a, 'p> {
    info: &'a ProgramInfo,
    finfo: &'a FuncInfo,
    pool: &'p mut StringPool,
    w: CodeWriter,
    strs: FuncStrings,
    ra: RegAlloc,
    /// Source name -> allocator key, per scope. The key is qualified by
    /// a scope serial so shadowing pins a fresh register.
    scopes: Vec<HashMap<String, String>>,
    scope_serial: u32,
    loops: Vec<LoopCtx>,
    tries: Vec<TryCtx<'a>>,
}

impl<'a, 'p> FuncCompiler<'a, 'p> {
    fn run(
        src: &FuncSource<'a>,
        info: &'a ProgramInfo,
        pool: &'p mut StringPool,
    ) -> CResult<BpFunction> {
        let arity = src.params.len();
        let mut c = FuncCompiler {
            info,
            finfo: src.info,
            pool,
            w: CodeWriter::new(),
            strs: FuncStrings::default(),
            ra: RegAlloc::new(arity),
            scopes: vec![HashMap::new()],
            scope_serial: 0,
            loops: Vec::new(),
            tries: Vec::new(),
        };

        for (i, param) in src.params.iter().enumerate() {
            let key = format!("{}#0", param.name);
            c.ra.alloc_param(&key, i as u8);
            c.scopes[0].insert(param.name.clone(), key);
        }

        for stmt in src.global_inits {
            let StmtKind::Let { name, init, .. } = &stmt.kind else {
                return Err(LoweringError::new(stmt.line, "non-let global statement"));
            };
            let r = c.expr(init)?;
            let slot = global_slot(info, name).ok_or_else(|| {
                LoweringError::new(stmt.line, format!("global '{}' missing a slot", name))
            })?;
            c.w.rop(ROp::StoreGlobal);
            c.w.u16(slot);
            c.w.u8(r);
            c.ra.free_temp(r);
        }

        match &src.body {
            BodySource::Stmts(stmts) => c.block(*stmts)?,
            BodySource::Lambda(body) => {
                let r = c.expr(*body)?;
                c.w.rop(ROp::Ret);
                c.w.u8(r);
                c.ra.free_temp(r);
            }
        }

        // Implicit null return for fall-through paths.
        let line = 0;
        let r = c.ra.alloc_temp(line)?;
        c.w.rop(ROp::ConstNull);
        c.w.u8(r);
        c.w.rop(ROp::Ret);
        c.w.u8(r);
        c.ra.free_temp(r);

        Ok(BpFunction {
            name: src.info.name.clone(),
            arity: arity as u16,
            locals: 0,
            reg_count: c.ra.reg_count().max(arity as u16),
            format: CodeFormat::Register,
            int_return: src.ret.is_integer(),
            str_refs: c.strs.refs,
            code: c.w.code,
        })
    }

    // --- scopes --------------------------------------------------------

    fn push_scope(&mut self) {
        self.scope_serial += 1;
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            for key in scope.values() {
                self.ra.free_var(key);
            }
        }
    }

    fn declare_var(&mut self, name: &str, line: u32) -> CResult<u8> {
        let key = format!("{}#{}", name, self.scope_serial);
        let r = self.ra.alloc_var(&key, line)?;
        self.scopes
            .last_mut()
            .expect("function scope always present")
            .insert(name.to_string(), key);
        Ok(r)
    }

    fn lookup_var(&self, name: &str) -> Option<u8> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .and_then(|key| self.ra.lookup_var(key))
    }

    fn const_str(&mut self, s: &str, line: u32) -> CResult<u8> {
        let pool_idx = self.pool.intern(s);
        let local = self.strs.local_id(pool_idx);
        let dst = self.ra.alloc_temp(line)?;
        self.w.rop(ROp::ConstStr);
        self.w.u8(dst);
        self.w.u32(local);
        Ok(dst)
    }

    /// Evaluate `args` into a freshly block-allocated contiguous window,
    /// returning the window base. `extra_head` values are moved into the
    /// leading slots first (method receivers).
    fn arg_window(&mut self, head: &[u8], args: &'a [Expr], line: u32) -> CResult<u8> {
        let k = head.len() + args.len();
        let base = self.ra.alloc_block(k, line)?;
        for (i, &r) in head.iter().enumerate() {
            self.w.rop(ROp::Move);
            self.w.u8(base + i as u8);
            self.w.u8(r);
        }
        for (i, arg) in args.iter().enumerate() {
            let r = self.expr(arg)?;
            let slot = base + (head.len() + i) as u8;
            if r != slot {
                self.w.rop(ROp::Move);
                self.w.u8(slot);
                self.w.u8(r);
            }
            self.ra.free_temp(r);
        }
        Ok(base)
    }

    // --- statements ----------------------------------------------------

    fn block(&mut self, stmts: &'a [Stmt]) -> CResult<()> {
        self.push_scope();
        let result = stmts.iter().try_for_each(|s| self.stmt(s));
        self.pop_scope();
        result
    }

    fn stmt(&mut self, stmt: &'a Stmt) -> CResult<()> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, init, .. } => {
                let r = self.expr(init)?;
                let var = self.declare_var(name, line)?;
                if var != r {
                    self.w.rop(ROp::Move);
                    self.w.u8(var);
                    self.w.u8(r);
                }
                self.ra.free_temp(r);
            }
            StmtKind::Assign { name, value } => {
                let r = self.expr(value)?;
                if let Some(var) = self.lookup_var(name) {
                    if var != r {
                        self.w.rop(ROp::Move);
                        self.w.u8(var);
                        self.w.u8(r);
                    }
                } else if let Some(slot) = global_slot(self.info, name) {
                    self.w.rop(ROp::StoreGlobal);
                    self.w.u16(slot);
                    self.w.u8(r);
                } else {
                    return Err(LoweringError::new(line, format!("unresolved name '{}'", name)));
                }
                self.ra.free_temp(r);
            }
            StmtKind::IndexAssign { base, index, value } => {
                let arr = self.expr(base)?;
                let idx = self.expr(index)?;
                let val = self.expr(value)?;
                match base.inferred.as_ref() {
                    Some(Type::Map(_, _)) => self.w.rop(ROp::MapSet),
                    _ => self.w.rop(ROp::ArraySet),
                }
                self.w.u8(arr);
                self.w.u8(idx);
                self.w.u8(val);
                self.ra.free_temp(arr);
                self.ra.free_temp(idx);
                self.ra.free_temp(val);
            }
            StmtKind::FieldAssign { base, index, value, .. } => {
                let obj = self.expr(base)?;
                let val = self.expr(value)?;
                let field = index.expect("field resolved by the checker");
                match base.inferred.as_ref() {
                    Some(Type::Class(_)) => self.w.rop(ROp::ClassSet),
                    _ => self.w.rop(ROp::StructSet),
                }
                self.w.u8(obj);
                self.w.u16(field);
                self.w.u8(val);
                self.ra.free_temp(obj);
                self.ra.free_temp(val);
            }
            StmtKind::Expr(expr) => {
                let r = self.expr(expr)?;
                self.ra.free_temp(r);
            }
            StmtKind::If { cond, then_body, else_body } => {
                let c = self.expr(cond)?;
                self.w.rop(ROp::JmpIfFalse);
                self.w.u8(c);
                let else_hole = self.w.hole_u32();
                self.ra.free_temp(c);
                self.block(then_body)?;
                if else_body.is_empty() {
                    let end = self.w.here() as u32;
                    self.w.patch_u32(else_hole, end);
                } else {
                    self.w.rop(ROp::Jmp);
                    let end_hole = self.w.hole_u32();
                    let else_at = self.w.here() as u32;
                    self.w.patch_u32(else_hole, else_at);
                    self.block(else_body)?;
                    let end = self.w.here() as u32;
                    self.w.patch_u32(end_hole, end);
                }
            }
            StmtKind::While { cond, body } => {
                let loop_start = self.w.here() as u32;
                let c = self.expr(cond)?;
                self.w.rop(ROp::JmpIfFalse);
                self.w.u8(c);
                let exit_hole = self.w.hole_u32();
                self.ra.free_temp(c);
                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: Some(loop_start),
                    try_depth: self.tries.len(),
                });
                self.block(body)?;
                self.w.rop(ROp::Jmp);
                self.w.u32(loop_start);
                let exit = self.w.here() as u32;
                self.w.patch_u32(exit_hole, exit);
                let ctx = self.loops.pop().expect("pushed above");
                for hole in ctx.break_holes {
                    self.w.patch_u32(hole, exit);
                }
                debug_assert!(ctx.continue_holes.is_empty());
            }
            StmtKind::ForRange { var, start, end, body } => {
                self.push_scope();
                let start_r = self.expr(start)?;
                let var_r = self.declare_var(var, line)?;
                if var_r != start_r {
                    self.w.rop(ROp::Move);
                    self.w.u8(var_r);
                    self.w.u8(start_r);
                }
                self.ra.free_temp(start_r);
                let end_r = self.expr(end)?;
                // Keep the bound in a stable register across the body.
                let bound = self.declare_var("(range end)", line)?;
                if bound != end_r {
                    self.w.rop(ROp::Move);
                    self.w.u8(bound);
                    self.w.u8(end_r);
                }
                self.ra.free_temp(end_r);

                let loop_start = self.w.here() as u32;
                let cond = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::LtI64);
                self.w.u8(cond);
                self.w.u8(var_r);
                self.w.u8(bound);
                self.w.rop(ROp::JmpIfFalse);
                self.w.u8(cond);
                let exit_hole = self.w.hole_u32();
                self.ra.free_temp(cond);

                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: None,
                    try_depth: self.tries.len(),
                });
                self.block(body)?;

                let incr = self.w.here() as u32;
                let one = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstI64);
                self.w.u8(one);
                self.w.i64(1);
                self.w.rop(ROp::AddI64);
                self.w.u8(var_r);
                self.w.u8(var_r);
                self.w.u8(one);
                self.ra.free_temp(one);
                self.w.rop(ROp::Jmp);
                self.w.u32(loop_start);

                let exit = self.w.here() as u32;
                self.w.patch_u32(exit_hole, exit);
                let ctx = self.loops.pop().expect("pushed above");
                for hole in ctx.break_holes {
                    self.w.patch_u32(hole, exit);
                }
                for hole in ctx.continue_holes {
                    self.w.patch_u32(hole, incr);
                }
                self.pop_scope();
            }
            StmtKind::ForEach { var, iter, body } => {
                self.push_scope();
                let coll = self.expr(iter)?;
                let seq = self.declare_var("(iter)", line)?;
                if matches!(iter.inferred, Some(Type::Map(_, _))) {
                    let base = self.arg_window(&[coll], &[], line)?;
                    self.w.rop(ROp::CallBuiltin);
                    self.w.u8(seq);
                    self.w.u16(BuiltinId::Keys as u16);
                    self.w.u8(base);
                    self.w.u8(1);
                    self.ra.free_block(base, 1);
                } else if seq != coll {
                    self.w.rop(ROp::Move);
                    self.w.u8(seq);
                    self.w.u8(coll);
                }
                self.ra.free_temp(coll);

                let idx = self.declare_var("(iter index)", line)?;
                self.w.rop(ROp::ConstI64);
                self.w.u8(idx);
                self.w.i64(0);
                let var_r = self.declare_var(var, line)?;

                let loop_start = self.w.here() as u32;
                let len = self.ra.alloc_temp(line)?;
                let base = self.arg_window(&[seq], &[], line)?;
                self.w.rop(ROp::CallBuiltin);
                self.w.u8(len);
                self.w.u16(BuiltinId::ArrayLen as u16);
                self.w.u8(base);
                self.w.u8(1);
                self.ra.free_block(base, 1);
                let cond = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::LtI64);
                self.w.u8(cond);
                self.w.u8(idx);
                self.w.u8(len);
                self.w.rop(ROp::JmpIfFalse);
                self.w.u8(cond);
                let exit_hole = self.w.hole_u32();
                self.ra.free_temp(cond);
                self.ra.free_temp(len);

                self.w.rop(ROp::ArrayGet);
                self.w.u8(var_r);
                self.w.u8(seq);
                self.w.u8(idx);

                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: None,
                    try_depth: self.tries.len(),
                });
                self.block(body)?;

                let incr = self.w.here() as u32;
                let one = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstI64);
                self.w.u8(one);
                self.w.i64(1);
                self.w.rop(ROp::AddI64);
                self.w.u8(idx);
                self.w.u8(idx);
                self.w.u8(one);
                self.ra.free_temp(one);
                self.w.rop(ROp::Jmp);
                self.w.u32(loop_start);

                let exit = self.w.here() as u32;
                self.w.patch_u32(exit_hole, exit);
                let ctx = self.loops.pop().expect("pushed above");
                for hole in ctx.break_holes {
                    self.w.patch_u32(hole, exit);
                }
                for hole in ctx.continue_holes {
                    self.w.patch_u32(hole, incr);
                }
                self.pop_scope();
            }
            StmtKind::Break => {
                let Some(try_depth) = self.loops.last().map(|l| l.try_depth) else {
                    return Err(LoweringError::new(line, "break outside of a loop"));
                };
                self.unwind_tries(try_depth)?;
                self.w.rop(ROp::Jmp);
                let hole = self.w.hole_u32();
                self.loops
                    .last_mut()
                    .expect("checked above")
                    .break_holes
                    .push(hole);
            }
            StmtKind::Continue => {
                let Some((try_depth, continue_addr)) = self
                    .loops
                    .last()
                    .map(|l| (l.try_depth, l.continue_addr))
                else {
                    return Err(LoweringError::new(line, "continue outside of a loop"));
                };
                self.unwind_tries(try_depth)?;
                self.w.rop(ROp::Jmp);
                match continue_addr {
                    Some(addr) => self.w.u32(addr),
                    None => {
                        let hole = self.w.hole_u32();
                        self.loops
                            .last_mut()
                            .expect("checked above")
                            .continue_holes
                            .push(hole);
                    }
                }
            }
            StmtKind::Return(value) => {
                let r = match value {
                    Some(expr) => self.expr(expr)?,
                    None => {
                        let r = self.ra.alloc_temp(line)?;
                        self.w.rop(ROp::ConstNull);
                        self.w.u8(r);
                        r
                    }
                };
                self.unwind_tries(0)?;
                self.w.rop(ROp::Ret);
                self.w.u8(r);
                self.ra.free_temp(r);
            }
            StmtKind::Throw(expr) => {
                let r = self.expr(expr)?;
                self.w.rop(ROp::Throw);
                self.w.u8(r);
                self.ra.free_temp(r);
            }
            StmtKind::Try { body, catch, finally_body } => {
                self.try_stmt(line, body, catch, finally_body)?;
            }
            StmtKind::Match { subject, arms, default } => {
                self.push_scope();
                let subj_r = self.expr(subject)?;
                let subj = self.declare_var("(match subject)", line)?;
                if subj != subj_r {
                    self.w.rop(ROp::Move);
                    self.w.u8(subj);
                    self.w.u8(subj_r);
                }
                self.ra.free_temp(subj_r);

                let int_like = subject
                    .inferred
                    .as_ref()
                    .map(int_comparable)
                    .unwrap_or(false);
                let mut end_holes = Vec::new();
                for arm in arms {
                    let pat = self.expr(&arm.pattern)?;
                    let cond = self.ra.alloc_temp(arm.pattern.line)?;
                    self.w
                        .rop(if int_like { ROp::EqI64 } else { ROp::EqVal });
                    self.w.u8(cond);
                    self.w.u8(subj);
                    self.w.u8(pat);
                    self.w.rop(ROp::JmpIfFalse);
                    self.w.u8(cond);
                    let next_hole = self.w.hole_u32();
                    self.ra.free_temp(cond);
                    self.ra.free_temp(pat);
                    self.block(&arm.body)?;
                    self.w.rop(ROp::Jmp);
                    end_holes.push(self.w.hole_u32());
                    let next = self.w.here() as u32;
                    self.w.patch_u32(next_hole, next);
                }
                if let Some(default_body) = default {
                    self.block(default_body)?;
                }
                let end = self.w.here() as u32;
                for hole in end_holes {
                    self.w.patch_u32(hole, end);
                }
                self.pop_scope();
            }
        }
        Ok(())
    }

    /// Same layout as the stack backend: body, TRY_END, jump over the
    /// catch to the finally block; catch falls through into finally; a
    /// catch-less try synthesizes a rethrowing one.
    fn try_stmt(
        &mut self,
        line: u32,
        body: &'a [Stmt],
        catch: &'a Option<(String, Vec<Stmt>)>,
        finally_body: &'a [Stmt],
    ) -> CResult<()> {
        self.push_scope();
        let exc_reg = match catch {
            Some((name, _)) => self.declare_var(name, line)?,
            None => self.declare_var("(pending exception)", line)?,
        };

        self.w.rop(ROp::TryBegin);
        let catch_hole = self.w.hole_u32();
        let finally_hole = self.w.hole_u32();
        self.w.u8(exc_reg);

        self.tries.push(TryCtx {
            handler_active: true,
            finally: if finally_body.is_empty() {
                None
            } else {
                Some(finally_body)
            },
        });
        self.block(body)?;
        self.w.rop(ROp::TryEnd);
        self.tries
            .last_mut()
            .expect("pushed above")
            .handler_active = false;

        self.w.rop(ROp::Jmp);
        let skip_hole = self.w.hole_u32();

        let catch_at = self.w.here() as u32;
        self.w.patch_u32(catch_hole, catch_at);
        match catch {
            Some((_, catch_stmts)) => {
                self.block(catch_stmts)?;
            }
            None => {
                self.tries.pop();
                self.block(finally_body)?;
                self.tries.push(TryCtx {
                    handler_active: false,
                    finally: None,
                });
                self.w.rop(ROp::Throw);
                self.w.u8(exc_reg);
            }
        }

        self.tries.pop();
        let finally_at = self.w.here() as u32;
        if finally_body.is_empty() {
            self.w.patch_u32(finally_hole, NO_FINALLY);
        } else {
            self.w.patch_u32(finally_hole, finally_at);
        }
        self.w.patch_u32(skip_hole, finally_at);
        self.block(finally_body)?;
        self.pop_scope();
        Ok(())
    }

    fn unwind_tries(&mut self, depth: usize) -> CResult<()> {
        let pending: Vec<(bool, Option<&'a [Stmt]>)> = self.tries[depth..]
            .iter()
            .rev()
            .map(|t| (t.handler_active, t.finally))
            .collect();
        for (active, finally) in pending {
            if active {
                self.w.rop(ROp::TryEnd);
            }
            if let Some(stmts) = finally {
                self.block(stmts)?;
            }
        }
        Ok(())
    }

    // --- expressions ---------------------------------------------------

    fn expr(&mut self, e: &'a Expr) -> CResult<u8> {
        let line = e.line;
        match &e.kind {
            ExprKind::IntLit(v) => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstI64);
                self.w.u8(dst);
                self.w.i64(*v);
                Ok(dst)
            }
            ExprKind::FloatLit(v) => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstF64);
                self.w.u8(dst);
                self.w.f64(*v);
                Ok(dst)
            }
            ExprKind::BoolLit(b) => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstBool);
                self.w.u8(dst);
                self.w.u8(*b as u8);
                Ok(dst)
            }
            ExprKind::StrLit(s) => self.const_str(s, line),
            ExprKind::Null => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstNull);
                self.w.u8(dst);
                Ok(dst)
            }
            ExprKind::Var(name) => {
                if let Some(r) = self.lookup_var(name) {
                    return Ok(r);
                }
                if let Some(slot) = global_slot(self.info, name) {
                    let dst = self.ra.alloc_temp(line)?;
                    self.w.rop(ROp::LoadGlobal);
                    self.w.u8(dst);
                    self.w.u16(slot);
                    return Ok(dst);
                }
                Err(LoweringError::new(line, format!("unresolved name '{}'", name)))
            }
            ExprKind::FuncRef { fn_index, .. } => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstFunc);
                self.w.u8(dst);
                self.w.u32(fn_index.expect("function reference resolved"));
                Ok(dst)
            }
            ExprKind::Lambda { fn_index, .. } => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstFunc);
                self.w.u8(dst);
                self.w.u32(fn_index.expect("lambda lifted by the checker"));
                Ok(dst)
            }
            ExprKind::Unary { op, operand } => {
                let src = self.expr(operand)?;
                self.ra.free_temp(src);
                let dst = self.ra.alloc_temp(line)?;
                let float = matches!(operand.inferred, Some(Type::Float));
                let rop = match op {
                    UnOp::Neg if float => ROp::NegF64,
                    UnOp::Neg => ROp::NegI64,
                    UnOp::Not => ROp::Not,
                    UnOp::BitNot => ROp::BitNot,
                };
                self.w.rop(rop);
                self.w.u8(dst);
                self.w.u8(src);
                Ok(dst)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.expr(lhs)?;
                let b = self.expr(rhs)?;
                self.ra.free_temp(a);
                self.ra.free_temp(b);
                let dst = self.ra.alloc_temp(line)?;
                let rop = binary_rop(*op, lhs)?;
                self.w.rop(rop);
                self.w.u8(dst);
                self.w.u8(a);
                self.w.u8(b);
                Ok(dst)
            }
            ExprKind::ArrayLit(elems) | ExprKind::TupleLit(elems) => {
                let count = window_len(elems.len(), line)?;
                let base = self.arg_window(&[], elems, line)?;
                self.ra.free_block(base, elems.len());
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ArrayNew);
                self.w.u8(dst);
                self.w.u8(base);
                self.w.u8(count);
                Ok(dst)
            }
            ExprKind::MapLit(pairs) => {
                let count = window_len(pairs.len(), line)?;
                let base = self.ra.alloc_block(pairs.len() * 2, line)?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    let kr = self.expr(key)?;
                    let kslot = base + (2 * i) as u8;
                    if kr != kslot {
                        self.w.rop(ROp::Move);
                        self.w.u8(kslot);
                        self.w.u8(kr);
                    }
                    self.ra.free_temp(kr);
                    let vr = self.expr(value)?;
                    let vslot = base + (2 * i + 1) as u8;
                    if vr != vslot {
                        self.w.rop(ROp::Move);
                        self.w.u8(vslot);
                        self.w.u8(vr);
                    }
                    self.ra.free_temp(vr);
                }
                self.ra.free_block(base, pairs.len() * 2);
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::MapNew);
                self.w.u8(dst);
                self.w.u8(base);
                self.w.u8(count);
                Ok(dst)
            }
            ExprKind::Index { base, index } => {
                let arr = self.expr(base)?;
                let idx = self.expr(index)?;
                self.ra.free_temp(arr);
                self.ra.free_temp(idx);
                let dst = self.ra.alloc_temp(line)?;
                match base.inferred.as_ref() {
                    Some(Type::Map(_, _)) => self.w.rop(ROp::MapGet),
                    _ => self.w.rop(ROp::ArrayGet),
                }
                self.w.u8(dst);
                self.w.u8(arr);
                self.w.u8(idx);
                Ok(dst)
            }
            ExprKind::StructLit { fields, type_id, .. } => {
                let count = window_len(fields.len(), line)?;
                let base = self.ra.alloc_block(fields.len(), line)?;
                for (i, (_, value)) in fields.iter().enumerate() {
                    let r = self.expr(value)?;
                    let slot = base + i as u8;
                    if r != slot {
                        self.w.rop(ROp::Move);
                        self.w.u8(slot);
                        self.w.u8(r);
                    }
                    self.ra.free_temp(r);
                }
                self.ra.free_block(base, fields.len());
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::StructNew);
                self.w.u8(dst);
                self.w.u16(type_id.expect("struct resolved"));
                self.w.u8(base);
                self.w.u8(count);
                Ok(dst)
            }
            ExprKind::Field { base, index, .. } => {
                let obj = self.expr(base)?;
                self.ra.free_temp(obj);
                let dst = self.ra.alloc_temp(line)?;
                match base.inferred.as_ref() {
                    Some(Type::Class(_)) => self.w.rop(ROp::ClassGet),
                    _ => self.w.rop(ROp::StructGet),
                }
                self.w.u8(dst);
                self.w.u8(obj);
                self.w.u16(index.expect("field resolved"));
                Ok(dst)
            }
            ExprKind::EnumMember { value, .. } => {
                let dst = self.ra.alloc_temp(line)?;
                self.w.rop(ROp::ConstI64);
                self.w.u8(dst);
                self.w.i64(value.expect("enum member resolved"));
                Ok(dst)
            }
            ExprKind::FString(parts) => {
                if parts.is_empty() {
                    return self.const_str("", line);
                }
                let mut acc: Option<u8> = None;
                for part in parts {
                    let piece = match part {
                        FStringPart::Lit(s) => self.const_str(s, line)?,
                        FStringPart::Expr(inner) => {
                            let r = self.expr(inner)?;
                            if matches!(inner.inferred, Some(Type::Str)) {
                                r
                            } else {
                                let base = self.arg_window(&[r], &[], line)?;
                                self.ra.free_temp(r);
                                self.ra.free_block(base, 1);
                                let dst = self.ra.alloc_temp(line)?;
                                self.w.rop(ROp::CallBuiltin);
                                self.w.u8(dst);
                                self.w.u16(BuiltinId::ToStr as u16);
                                self.w.u8(base);
                                self.w.u8(1);
                                dst
                            }
                        }
                    };
                    acc = Some(match acc {
                        None => piece,
                        Some(prev) => {
                            self.ra.free_temp(prev);
                            self.ra.free_temp(piece);
                            let dst = self.ra.alloc_temp(line)?;
                            self.w.rop(ROp::AddStr);
                            self.w.u8(dst);
                            self.w.u8(prev);
                            self.w.u8(piece);
                            dst
                        }
                    });
                }
                Ok(acc.expect("parts checked non-empty"))
            }
            ExprKind::Call { args, target, .. } => {
                let dst = self.ra.alloc_temp(line)?;
                self.ra.pin_return(dst);
                let base = self.arg_window(&[], args, line)?;
                self.ra.free_block(base, args.len());
                self.ra.unpin_return(dst);
                match target {
                    CallTarget::User(idx) => {
                        self.w.rop(ROp::Call);
                        self.w.u8(dst);
                        self.w.u32(*idx);
                        self.w.u8(base);
                        self.w.u8(window_len(args.len(), line)?);
                    }
                    CallTarget::Builtin(id) => {
                        self.w.rop(ROp::CallBuiltin);
                        self.w.u8(dst);
                        self.w.u16(*id);
                        self.w.u8(base);
                        self.w.u8(window_len(args.len(), line)?);
                    }
                    CallTarget::Extern(ext) => {
                        self.w.rop(ROp::FfiCall);
                        self.w.u8(dst);
                        self.w.u16(*ext as u16);
                        self.w.u8(base);
                        self.w.u8(window_len(args.len(), line)?);
                    }
                    CallTarget::Unresolved => {
                        return Err(LoweringError::new(line, "unresolved call target"))
                    }
                }
                Ok(dst)
            }
            ExprKind::CallValue { callee, args } => {
                let f = self.expr(callee)?;
                let dst = self.ra.alloc_temp(line)?;
                self.ra.pin_return(dst);
                let base = self.arg_window(&[], args, line)?;
                self.ra.free_block(base, args.len());
                self.ra.unpin_return(dst);
                self.ra.free_temp(f);
                self.w.rop(ROp::CallValue);
                self.w.u8(dst);
                self.w.u8(f);
                self.w.u8(base);
                self.w.u8(window_len(args.len(), line)?);
                Ok(dst)
            }
            ExprKind::MethodCall { base, args, method_id, .. } => {
                let obj = self.expr(base)?;
                let dst = self.ra.alloc_temp(line)?;
                self.ra.pin_return(dst);
                let window = self.arg_window(&[obj], args, line)?;
                self.ra.free_block(window, args.len() + 1);
                self.ra.unpin_return(dst);
                self.ra.free_temp(obj);
                self.w.rop(ROp::MethodCall);
                self.w.u8(dst);
                self.w.u16(method_id.expect("method resolved"));
                self.w.u8(window);
                self.w.u8(window_len(args.len(), line)?);
                Ok(dst)
            }
            ExprKind::New { args, class_id, .. } => {
                let dst = self.ra.alloc_temp(line)?;
                self.ra.pin_return(dst);
                let base = self.arg_window(&[], args, line)?;
                self.ra.free_block(base, args.len());
                self.ra.unpin_return(dst);
                self.w.rop(ROp::ClassNew);
                self.w.u8(dst);
                self.w.u16(class_id.expect("class resolved"));
                self.w.u8(base);
                self.w.u8(window_len(args.len(), line)?);
                Ok(dst)
            }
            ExprKind::SuperCall { args, method_id, .. } => {
                let self_r = self.lookup_var("self").ok_or_else(|| {
                    LoweringError::new(line, "super call outside of a method body")
                })?;
                let dst = self.ra.alloc_temp(line)?;
                self.ra.pin_return(dst);
                let window = self.arg_window(&[self_r], args, line)?;
                self.ra.free_block(window, args.len() + 1);
                self.ra.unpin_return(dst);
                let target = super_target(
                    self.info,
                    self.finfo,
                    method_id.expect("super call resolved"),
                )
                .ok_or_else(|| LoweringError::new(line, "super target not found"))?;
                self.w.rop(ROp::SuperCall);
                self.w.u8(dst);
                self.w.u16(target as u16);
                self.w.u8(window);
                self.w.u8(window_len(args.len(), line)?);
                Ok(dst)
            }
        }
    }
}

fn window_len(n: usize, line: u32) -> CResult<u8> {
    u8::try_from(n).map_err(|_| {
        LoweringError::new(line, "too many operands for one instruction (limit 255)")
    })
}

fn int_comparable(ty: &Type) -> bool {
    ty.is_integer() || matches!(ty, Type::Bool | Type::Enum(_))
}

/// Select the typed register opcode for a binary operator.
fn binary_rop(op: BinOp, lhs: &Expr) -> CResult<ROp> {
    let lt = lhs.inferred.as_ref().ok_or_else(|| {
        LoweringError::new(lhs.line, "operand not annotated by the checker")
    })?;
    let float = *lt == Type::Float;
    let int_like = int_comparable(lt);
    Ok(match op {
        BinOp::Add if *lt == Type::Str => ROp::AddStr,
        BinOp::Add if float => ROp::AddF64,
        BinOp::Add => ROp::AddI64,
        BinOp::Sub if float => ROp::SubF64,
        BinOp::Sub => ROp::SubI64,
        BinOp::Mul if float => ROp::MulF64,
        BinOp::Mul => ROp::MulI64,
        BinOp::Div if float => ROp::DivF64,
        BinOp::Div => ROp::DivI64,
        BinOp::Mod if float => ROp::ModF64,
        BinOp::Mod => ROp::ModI64,
        BinOp::Eq if int_like => ROp::EqI64,
        BinOp::Eq => ROp::EqVal,
        BinOp::Ne if int_like => ROp::NeI64,
        BinOp::Ne => ROp::NeVal,
        BinOp::Lt if float => ROp::LtF64,
        BinOp::Lt => ROp::LtI64,
        BinOp::Le if float => ROp::LeF64,
        BinOp::Le => ROp::LeI64,
        BinOp::Gt if float => ROp::GtF64,
        BinOp::Gt => ROp::GtI64,
        BinOp::Ge if float => ROp::GeF64,
        BinOp::Ge => ROp::GeI64,
        BinOp::And => ROp::And,
        BinOp::Or => ROp::Or,
        BinOp::BitAnd => ROp::BitAnd,
        BinOp::BitOr => ROp::BitOr,
        BinOp::BitXor => ROp::BitXor,
        BinOp::Shl => ROp::Shl,
        BinOp::Shr => ROp::Shr,
    })
}
