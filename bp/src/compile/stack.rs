//! Stack-bytecode compiler.
//!
//! Expressions leave exactly one value on the operand stack (void calls
//! leave null); statements leave the stack where they found it. Locals
//! are compile-time slots scoped by a mark/reset discipline: a scope
//! records the slot watermark on entry and restores it on exit, so
//! sibling scopes reuse slots while `locals` publishes the high-water
//! count.

use std::collections::HashMap;

use bp_parser::ast::{
    BinOp, CallTarget, Expr, ExprKind, FStringPart, Stmt, StmtKind, Type, UnOp,
};

use super::{
    assemble, func_sources, global_slot, super_target, BodySource, CResult, FuncSource,
    FuncStrings, LoweringError, StringPool,
};
use crate::builtins::BuiltinId;
use crate::bytecode::opcode::{CodeWriter, SOp, NO_FINALLY};
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
    /// Known back-edge target (while loops); range loops patch the
    /// holes to the increment position instead.
    continue_addr: Option<u32>,
    try_depth: usize,
}

struct TryCtx<'a> {
    /// The handler is live while the protected body is being emitted;
    /// catch and finally bodies run with it already popped.
    handler_active: bool,
    finally: Option<&'a [Stmt]>,
}

struct FuncCompiler<'a, 'p> {
    info: &'a ProgramInfo,
    finfo: &'a FuncInfo,
    pool: &'p mut StringPool,
    w: CodeWriter,
    strs: FuncStrings,
    scopes: Vec<HashMap<String, u16>>,
    scope_marks: Vec<u16>,
    next_slot: u16,
    max_slots: u16,
    loops: Vec<LoopCtx>,
    tries: Vec<TryCtx<'a>>,
}

impl<'a, 'p> FuncCompiler<'a, 'p> {
    fn run(
        src: &FuncSource<'a>,
        info: &'a ProgramInfo,
        pool: &'p mut StringPool,
    ) -> CResult<BpFunction> {
        let mut c = FuncCompiler {
            info,
            finfo: src.info,
            pool,
            w: CodeWriter::new(),
            strs: FuncStrings::default(),
            scopes: vec![HashMap::new()],
            scope_marks: vec![0],
            next_slot: 0,
            max_slots: 0,
            loops: Vec::new(),
            tries: Vec::new(),
        };

        for param in src.params {
            c.alloc_named(&param.name, 0)?;
        }

        // Global initializers run as a preamble of the entry function.
        for stmt in src.global_inits {
            let StmtKind::Let { name, init, .. } = &stmt.kind else {
                return Err(LoweringError::new(stmt.line, "non-let global statement"));
            };
            c.expr(init)?;
            let slot = global_slot(info, name).ok_or_else(|| {
                LoweringError::new(stmt.line, format!("global '{}' missing a slot", name))
            })?;
            c.w.sop(SOp::StoreGlobal);
            c.w.u16(slot);
        }

        match &src.body {
            BodySource::Stmts(stmts) => c.block(*stmts)?,
            BodySource::Lambda(body) => {
                c.expr(*body)?;
                c.w.sop(SOp::Ret);
            }
        }

        // Implicit return for fall-through paths.
        c.w.sop(SOp::ConstNull);
        c.w.sop(SOp::Ret);

        Ok(BpFunction {
            name: src.info.name.clone(),
            arity: src.params.len() as u16,
            locals: c.max_slots,
            reg_count: 0,
            format: CodeFormat::Stack,
            int_return: src.ret.is_integer(),
            str_refs: c.strs.refs,
            code: c.w.code,
        })
    }

    // --- scope and slot management -------------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
        self.scope_marks.push(self.next_slot);
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
        if let Some(mark) = self.scope_marks.pop() {
            self.next_slot = mark;
        }
    }

    fn alloc_slot(&mut self, line: u32) -> CResult<u16> {
        if self.next_slot == u16::MAX {
            return Err(LoweringError::new(line, "too many locals"));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slots = self.max_slots.max(self.next_slot);
        Ok(slot)
    }

    fn alloc_named(&mut self, name: &str, line: u32) -> CResult<u16> {
        let slot = self.alloc_slot(line)?;
        self.scopes
            .last_mut()
            .expect("function scope always present")
            .insert(name.to_string(), slot);
        Ok(slot)
    }

    fn lookup_local(&self, name: &str) -> Option<u16> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn const_str(&mut self, s: &str) {
        let pool_idx = self.pool.intern(s);
        let local = self.strs.local_id(pool_idx);
        self.w.sop(SOp::ConstStr);
        self.w.u32(local);
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
                self.expr(init)?;
                let slot = self.alloc_named(name, line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(slot);
            }
            StmtKind::Assign { name, value } => {
                self.expr(value)?;
                if let Some(slot) = self.lookup_local(name) {
                    self.w.sop(SOp::StoreLocal);
                    self.w.u16(slot);
                } else if let Some(slot) = global_slot(self.info, name) {
                    self.w.sop(SOp::StoreGlobal);
                    self.w.u16(slot);
                } else {
                    return Err(LoweringError::new(line, format!("unresolved name '{}'", name)));
                }
            }
            StmtKind::IndexAssign { base, index, value } => {
                self.expr(base)?;
                self.expr(index)?;
                self.expr(value)?;
                match base.inferred.as_ref() {
                    Some(Type::Map(_, _)) => self.w.sop(SOp::MapSet),
                    _ => self.w.sop(SOp::ArraySet),
                }
            }
            StmtKind::FieldAssign { base, index, value, .. } => {
                self.expr(base)?;
                self.expr(value)?;
                let field = index.expect("field resolved by the checker");
                match base.inferred.as_ref() {
                    Some(Type::Class(_)) => self.w.sop(SOp::ClassSet),
                    _ => self.w.sop(SOp::StructSet),
                }
                self.w.u16(field);
            }
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.w.sop(SOp::Pop);
            }
            StmtKind::If { cond, then_body, else_body } => {
                self.expr(cond)?;
                self.w.sop(SOp::JmpIfFalse);
                let else_hole = self.w.hole_u32();
                self.block(then_body)?;
                if else_body.is_empty() {
                    let end = self.w.here() as u32;
                    self.w.patch_u32(else_hole, end);
                } else {
                    self.w.sop(SOp::Jmp);
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
                self.expr(cond)?;
                self.w.sop(SOp::JmpIfFalse);
                let exit_hole = self.w.hole_u32();
                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: Some(loop_start),
                    try_depth: self.tries.len(),
                });
                self.block(body)?;
                self.w.sop(SOp::Jmp);
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
                self.expr(start)?;
                let var_slot = self.alloc_named(var, line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(var_slot);
                self.expr(end)?;
                let end_slot = self.alloc_slot(line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(end_slot);

                let loop_start = self.w.here() as u32;
                self.w.sop(SOp::LoadLocal);
                self.w.u16(var_slot);
                self.w.sop(SOp::LoadLocal);
                self.w.u16(end_slot);
                self.w.sop(SOp::LtI64);
                self.w.sop(SOp::JmpIfFalse);
                let exit_hole = self.w.hole_u32();

                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: None,
                    try_depth: self.tries.len(),
                });
                self.block(body)?;

                // Increment position: continue lands here, not on the
                // condition.
                let incr = self.w.here() as u32;
                self.w.sop(SOp::LoadLocal);
                self.w.u16(var_slot);
                self.w.sop(SOp::ConstI64);
                self.w.i64(1);
                self.w.sop(SOp::AddI64);
                self.w.sop(SOp::StoreLocal);
                self.w.u16(var_slot);
                self.w.sop(SOp::Jmp);
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
                // Evaluate the collection once; maps iterate their keys.
                self.expr(iter)?;
                if matches!(iter.inferred, Some(Type::Map(_, _))) {
                    self.w.sop(SOp::CallBuiltin);
                    self.w.u16(BuiltinId::Keys as u16);
                    self.w.u16(1);
                }
                let iter_slot = self.alloc_slot(line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(iter_slot);
                self.w.sop(SOp::ConstI64);
                self.w.i64(0);
                let idx_slot = self.alloc_slot(line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(idx_slot);
                let var_slot = self.alloc_named(var, line)?;

                let loop_start = self.w.here() as u32;
                self.w.sop(SOp::LoadLocal);
                self.w.u16(idx_slot);
                self.w.sop(SOp::LoadLocal);
                self.w.u16(iter_slot);
                self.w.sop(SOp::CallBuiltin);
                self.w.u16(BuiltinId::ArrayLen as u16);
                self.w.u16(1);
                self.w.sop(SOp::LtI64);
                self.w.sop(SOp::JmpIfFalse);
                let exit_hole = self.w.hole_u32();

                self.w.sop(SOp::LoadLocal);
                self.w.u16(iter_slot);
                self.w.sop(SOp::LoadLocal);
                self.w.u16(idx_slot);
                self.w.sop(SOp::ArrayGet);
                self.w.sop(SOp::StoreLocal);
                self.w.u16(var_slot);

                self.loops.push(LoopCtx {
                    break_holes: Vec::new(),
                    continue_holes: Vec::new(),
                    continue_addr: None,
                    try_depth: self.tries.len(),
                });
                self.block(body)?;

                let incr = self.w.here() as u32;
                self.w.sop(SOp::LoadLocal);
                self.w.u16(idx_slot);
                self.w.sop(SOp::ConstI64);
                self.w.i64(1);
                self.w.sop(SOp::AddI64);
                self.w.sop(SOp::StoreLocal);
                self.w.u16(idx_slot);
                self.w.sop(SOp::Jmp);
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
                self.w.sop(SOp::Jmp);
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
                self.w.sop(SOp::Jmp);
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
                match value {
                    Some(expr) => self.expr(expr)?,
                    None => self.w.sop(SOp::ConstNull),
                }
                self.unwind_tries(0)?;
                self.w.sop(SOp::Ret);
            }
            StmtKind::Throw(expr) => {
                self.expr(expr)?;
                self.w.sop(SOp::Throw);
            }
            StmtKind::Try { body, catch, finally_body } => {
                self.try_stmt(line, body, catch, finally_body)?;
            }
            StmtKind::Match { subject, arms, default } => {
                self.push_scope();
                self.expr(subject)?;
                let subj_slot = self.alloc_slot(line)?;
                self.w.sop(SOp::StoreLocal);
                self.w.u16(subj_slot);

                let mut end_holes = Vec::new();
                for arm in arms {
                    self.w.sop(SOp::LoadLocal);
                    self.w.u16(subj_slot);
                    self.expr(&arm.pattern)?;
                    self.w.sop(SOp::Eq);
                    self.w.sop(SOp::JmpIfFalse);
                    let next_hole = self.w.hole_u32();
                    self.block(&arm.body)?;
                    self.w.sop(SOp::Jmp);
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

    /// Lowering of try/catch/finally. Layout:
    ///
    /// ```text
    ///   TRY_BEGIN(catch, finally, slot)
    ///   body
    ///   TRY_END
    ///   JMP -> finally (or end)
    /// catch:
    ///   catch body          (falls through)
    /// finally:
    ///   finally body
    /// end:
    /// ```
    ///
    /// A try without a catch synthesizes one that runs the finally body
    /// and rethrows, so the handler table always has a catch address.
    fn try_stmt(
        &mut self,
        line: u32,
        body: &'a [Stmt],
        catch: &'a Option<(String, Vec<Stmt>)>,
        finally_body: &'a [Stmt],
    ) -> CResult<()> {
        self.push_scope();
        let exc_slot = match catch {
            Some((name, _)) => self.alloc_named(name, line)?,
            None => self.alloc_slot(line)?,
        };

        self.w.sop(SOp::TryBegin);
        let catch_hole = self.w.hole_u32();
        let finally_hole = self.w.hole_u32();
        self.w.u16(exc_slot);

        self.tries.push(TryCtx {
            handler_active: true,
            finally: if finally_body.is_empty() {
                None
            } else {
                Some(finally_body)
            },
        });
        self.block(body)?;
        self.w.sop(SOp::TryEnd);
        self.tries
            .last_mut()
            .expect("pushed above")
            .handler_active = false;

        self.w.sop(SOp::Jmp);
        let skip_hole = self.w.hole_u32();

        let catch_at = self.w.here() as u32;
        self.w.patch_u32(catch_hole, catch_at);
        match catch {
            Some((_, catch_stmts)) => {
                self.block(catch_stmts)?;
                // Falls through into the finally block.
            }
            None => {
                // Synthesized catch: run the finally code, rethrow.
                self.tries.pop();
                self.block(finally_body)?;
                self.tries.push(TryCtx {
                    handler_active: false,
                    finally: None,
                });
                self.w.sop(SOp::LoadLocal);
                self.w.u16(exc_slot);
                self.w.sop(SOp::Throw);
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

    /// Early-exit unwinding: pop the live handlers and run the pending
    /// finally blocks for every try entered since `depth`.
    fn unwind_tries(&mut self, depth: usize) -> CResult<()> {
        let pending: Vec<(bool, Option<&'a [Stmt]>)> = self.tries[depth..]
            .iter()
            .rev()
            .map(|t| (t.handler_active, t.finally))
            .collect();
        for (active, finally) in pending {
            if active {
                self.w.sop(SOp::TryEnd);
            }
            if let Some(stmts) = finally {
                self.block(stmts)?;
            }
        }
        Ok(())
    }

    // --- expressions ---------------------------------------------------

    fn expr(&mut self, e: &'a Expr) -> CResult<()> {
        let line = e.line;
        match &e.kind {
            ExprKind::IntLit(v) => {
                self.w.sop(SOp::ConstI64);
                self.w.i64(*v);
            }
            ExprKind::FloatLit(v) => {
                self.w.sop(SOp::ConstF64);
                self.w.f64(*v);
            }
            ExprKind::BoolLit(b) => {
                self.w.sop(SOp::ConstBool);
                self.w.u8(*b as u8);
            }
            ExprKind::StrLit(s) => self.const_str(s),
            ExprKind::Null => self.w.sop(SOp::ConstNull),
            ExprKind::Var(name) => {
                if let Some(slot) = self.lookup_local(name) {
                    self.w.sop(SOp::LoadLocal);
                    self.w.u16(slot);
                } else if let Some(slot) = global_slot(self.info, name) {
                    self.w.sop(SOp::LoadGlobal);
                    self.w.u16(slot);
                } else {
                    return Err(LoweringError::new(line, format!("unresolved name '{}'", name)));
                }
            }
            ExprKind::FuncRef { fn_index, .. } => {
                self.w.sop(SOp::ConstFunc);
                self.w.u32(fn_index.expect("function reference resolved"));
            }
            ExprKind::Lambda { fn_index, .. } => {
                self.w.sop(SOp::ConstFunc);
                self.w.u32(fn_index.expect("lambda lifted by the checker"));
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand)?;
                let float = matches!(operand.inferred, Some(Type::Float));
                match op {
                    UnOp::Neg if float => self.w.sop(SOp::NegF64),
                    UnOp::Neg => self.w.sop(SOp::NegI64),
                    UnOp::Not => self.w.sop(SOp::Not),
                    UnOp::BitNot => self.w.sop(SOp::BitNot),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.binary_op(*op, lhs, line)?;
            }
            ExprKind::ArrayLit(elems) => {
                for elem in elems {
                    self.expr(elem)?;
                }
                self.w.sop(SOp::ArrayNew);
                self.w.u32(elems.len() as u32);
            }
            ExprKind::TupleLit(elems) => {
                for elem in elems {
                    self.expr(elem)?;
                }
                self.w.sop(SOp::ArrayNew);
                self.w.u32(elems.len() as u32);
            }
            ExprKind::MapLit(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.w.sop(SOp::MapNew);
                self.w.u32(pairs.len() as u32);
            }
            ExprKind::Index { base, index } => {
                self.expr(base)?;
                self.expr(index)?;
                match base.inferred.as_ref() {
                    Some(Type::Map(_, _)) => self.w.sop(SOp::MapGet),
                    _ => self.w.sop(SOp::ArrayGet),
                }
            }
            ExprKind::StructLit { fields, type_id, .. } => {
                for (_, value) in fields {
                    self.expr(value)?;
                }
                self.w.sop(SOp::StructNew);
                self.w.u16(type_id.expect("struct resolved"));
                self.w.u16(fields.len() as u16);
            }
            ExprKind::Field { base, index, .. } => {
                self.expr(base)?;
                let field = index.expect("field resolved");
                match base.inferred.as_ref() {
                    Some(Type::Class(_)) => self.w.sop(SOp::ClassGet),
                    _ => self.w.sop(SOp::StructGet),
                }
                self.w.u16(field);
            }
            ExprKind::EnumMember { value, .. } => {
                self.w.sop(SOp::ConstI64);
                self.w.i64(value.expect("enum member resolved"));
            }
            ExprKind::FString(parts) => {
                if parts.is_empty() {
                    self.const_str("");
                    return Ok(());
                }
                for (i, part) in parts.iter().enumerate() {
                    match part {
                        FStringPart::Lit(s) => self.const_str(s),
                        FStringPart::Expr(inner) => {
                            self.expr(inner)?;
                            if !matches!(inner.inferred, Some(Type::Str)) {
                                self.w.sop(SOp::CallBuiltin);
                                self.w.u16(BuiltinId::ToStr as u16);
                                self.w.u16(1);
                            }
                        }
                    }
                    if i > 0 {
                        self.w.sop(SOp::AddStr);
                    }
                }
            }
            ExprKind::Call { args, target, .. } => {
                for arg in args {
                    self.expr(arg)?;
                }
                match target {
                    CallTarget::User(idx) => {
                        self.w.sop(SOp::Call);
                        self.w.u32(*idx);
                        self.w.u16(args.len() as u16);
                    }
                    CallTarget::Builtin(id) => {
                        self.w.sop(SOp::CallBuiltin);
                        self.w.u16(*id);
                        self.w.u16(args.len() as u16);
                    }
                    CallTarget::Extern(ext) => {
                        self.w.sop(SOp::FfiCall);
                        self.w.u16(*ext as u16);
                        self.w.u8(args.len() as u8);
                    }
                    CallTarget::Unresolved => {
                        return Err(LoweringError::new(line, "unresolved call target"))
                    }
                }
            }
            ExprKind::CallValue { callee, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.expr(callee)?;
                self.w.sop(SOp::CallValue);
                self.w.u16(args.len() as u16);
            }
            ExprKind::MethodCall { base, args, method_id, .. } => {
                self.expr(base)?;
                for arg in args {
                    self.expr(arg)?;
                }
                self.w.sop(SOp::MethodCall);
                self.w.u16(method_id.expect("method resolved"));
                self.w.u8(args.len() as u8);
            }
            ExprKind::New { args, class_id, .. } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.w.sop(SOp::ClassNew);
                self.w.u16(class_id.expect("class resolved"));
                self.w.u8(args.len() as u8);
            }
            ExprKind::SuperCall { args, method_id, .. } => {
                let self_slot = self.lookup_local("self").ok_or_else(|| {
                    LoweringError::new(line, "super call outside of a method body")
                })?;
                self.w.sop(SOp::LoadLocal);
                self.w.u16(self_slot);
                for arg in args {
                    self.expr(arg)?;
                }
                let target = super_target(
                    self.info,
                    self.finfo,
                    method_id.expect("super call resolved"),
                )
                .ok_or_else(|| LoweringError::new(line, "super target not found"))?;
                self.w.sop(SOp::SuperCall);
                self.w.u16(target as u16);
                self.w.u8(args.len() as u8);
            }
        }
        Ok(())
    }

    /// Select the typed opcode for a binary operator whose operands are
    /// already on the stack.
    fn binary_op(&mut self, op: BinOp, lhs: &Expr, line: u32) -> CResult<()> {
        let lt = lhs.inferred.as_ref().ok_or_else(|| {
            LoweringError::new(line, "operand not annotated by the checker")
        })?;
        let float = *lt == Type::Float;
        let op = match op {
            BinOp::Add if *lt == Type::Str => SOp::AddStr,
            BinOp::Add if float => SOp::AddF64,
            BinOp::Add => SOp::AddI64,
            BinOp::Sub if float => SOp::SubF64,
            BinOp::Sub => SOp::SubI64,
            BinOp::Mul if float => SOp::MulF64,
            BinOp::Mul => SOp::MulI64,
            BinOp::Div if float => SOp::DivF64,
            BinOp::Div => SOp::DivI64,
            BinOp::Mod if float => SOp::ModF64,
            BinOp::Mod => SOp::ModI64,
            BinOp::Eq => SOp::Eq,
            BinOp::Ne => SOp::Ne,
            BinOp::Lt if float => SOp::LtF64,
            BinOp::Lt => SOp::LtI64,
            BinOp::Le if float => SOp::LeF64,
            BinOp::Le => SOp::LeI64,
            BinOp::Gt if float => SOp::GtF64,
            BinOp::Gt => SOp::GtI64,
            BinOp::Ge if float => SOp::GeF64,
            BinOp::Ge => SOp::GeI64,
            BinOp::And => SOp::And,
            BinOp::Or => SOp::Or,
            BinOp::BitAnd => SOp::BitAnd,
            BinOp::BitOr => SOp::BitOr,
            BinOp::BitXor => SOp::BitXor,
            BinOp::Shl => SOp::Shl,
            BinOp::Shr => SOp::Shr,
        };
        self.w.sop(op);
        Ok(())
    }
}
