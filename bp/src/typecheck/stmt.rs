//! Statement checking.

use bp_parser::ast::{Expr, Stmt, StmtKind, Type};

use super::{Checker, TcResult, TypeError};

impl Checker {
    /// Check a suite in a fresh lexical scope.
    pub(crate) fn check_block(&mut self, stmts: &mut [Stmt]) -> TcResult<()> {
        self.scopes.push(Default::default());
        let result = self.check_stmts(stmts);
        self.scopes.pop();
        result
    }

    fn check_stmts(&mut self, stmts: &mut [Stmt]) -> TcResult<()> {
        for stmt in stmts {
            self.check_stmt(stmt)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) -> TcResult<()> {
        let line = stmt.line;
        match &mut stmt.kind {
            StmtKind::Let { name, ty, init } => {
                let declared = self.resolve_type(ty, line)?;
                if declared == Type::Void {
                    return Err(TypeError::new(line, "cannot declare a void variable"));
                }
                *ty = declared.clone();
                self.check_coerced(init, &declared, line)?;
                let scope = self
                    .scopes
                    .last_mut()
                    .expect("check_stmt runs inside a scope");
                if scope.insert(name.clone(), declared).is_some() {
                    return Err(TypeError::new(
                        line,
                        format!("duplicate variable '{}' in this scope", name),
                    ));
                }
            }
            StmtKind::Assign { name, value } => {
                let target_ty = self.lookup_var(name).ok_or_else(|| {
                    TypeError::new(line, format!("unknown variable '{}'", name))
                })?;
                self.check_coerced(value, &target_ty, line)?;
            }
            StmtKind::IndexAssign { base, index, value } => {
                let base_ty = self.check_expr(base, None)?;
                match base_ty {
                    Type::Array(elem) => {
                        let idx_ty = self.check_expr(index, Some(&Type::Int))?;
                        if !idx_ty.is_integer() {
                            return Err(TypeError::new(
                                line,
                                format!("array index must be an integer, got {}", idx_ty),
                            ));
                        }
                        self.check_coerced(value, &elem, line)?;
                    }
                    Type::Map(key, val) => {
                        let key_ty = self.check_expr(index, Some(&key))?;
                        if key_ty != *key {
                            return Err(TypeError::new(
                                line,
                                format!("map key type mismatch: expected {}, got {}", key, key_ty),
                            ));
                        }
                        self.check_coerced(value, &val, line)?;
                    }
                    other => {
                        return Err(TypeError::new(
                            line,
                            format!("cannot index into {}", other),
                        ))
                    }
                }
            }
            StmtKind::FieldAssign { base, field, index, value } => {
                let base_ty = self.check_expr(base, None)?;
                let (resolved, field_ty) = self.resolve_field(&base_ty, field, line)?;
                *index = Some(resolved);
                self.check_coerced(value, &field_ty, line)?;
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr, None)?;
            }
            StmtKind::If { cond, then_body, else_body } => {
                self.check_bool_cond(cond, line)?;
                self.check_block(then_body)?;
                self.check_block(else_body)?;
            }
            StmtKind::While { cond, body } => {
                self.check_bool_cond(cond, line)?;
                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;
                result?;
            }
            StmtKind::ForRange { var, start, end, body } => {
                let start_ty = self.check_expr(start, Some(&Type::Int))?;
                let end_ty = self.check_expr(end, Some(&Type::Int))?;
                if start_ty != Type::Int || end_ty != Type::Int {
                    return Err(TypeError::new(line, "range bounds must be int"));
                }
                self.scopes.push(Default::default());
                self.scopes
                    .last_mut()
                    .expect("just pushed")
                    .insert(var.clone(), Type::Int);
                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;
                self.scopes.pop();
                result?;
            }
            StmtKind::ForEach { var, iter, body } => {
                let iter_ty = self.check_expr(iter, None)?;
                let var_ty = match &iter_ty {
                    Type::Array(elem) => (**elem).clone(),
                    Type::Map(key, _) => (**key).clone(),
                    other => {
                        return Err(TypeError::new(
                            line,
                            format!("cannot iterate over {}", other),
                        ))
                    }
                };
                self.scopes.push(Default::default());
                self.scopes
                    .last_mut()
                    .expect("just pushed")
                    .insert(var.clone(), var_ty);
                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;
                self.scopes.pop();
                result?;
            }
            StmtKind::Break => {
                if self.loop_depth == 0 {
                    return Err(TypeError::new(line, "break outside of a loop"));
                }
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(TypeError::new(line, "continue outside of a loop"));
                }
            }
            StmtKind::Return(value) => match (value, self.current_ret.clone()) {
                (None, Type::Void) => {}
                (None, other) => {
                    return Err(TypeError::new(
                        line,
                        format!("missing return value in function returning {}", other),
                    ))
                }
                (Some(_), Type::Void) => {
                    return Err(TypeError::new(line, "void function cannot return a value"))
                }
                (Some(expr), expected) => self.check_coerced(expr, &expected, line)?,
            },
            StmtKind::Try { body, catch, finally_body } => {
                self.check_block(body)?;
                if let Some((name, catch_body)) = catch {
                    self.scopes.push(Default::default());
                    self.scopes
                        .last_mut()
                        .expect("just pushed")
                        .insert(name.clone(), Type::Str);
                    let result = self.check_block(catch_body);
                    self.scopes.pop();
                    result?;
                }
                self.check_block(finally_body)?;
            }
            StmtKind::Throw(expr) => {
                let ty = self.check_expr(expr, Some(&Type::Str))?;
                if ty != Type::Str {
                    return Err(TypeError::new(
                        line,
                        format!("throw requires a str value, got {}", ty),
                    ));
                }
            }
            StmtKind::Match { subject, arms, default } => {
                let subject_ty = self.check_expr(subject, None)?;
                match subject_ty {
                    Type::Float | Type::Bool | Type::Str | Type::Enum(_) => {}
                    ref t if t.is_integer() => {}
                    other => {
                        return Err(TypeError::new(
                            line,
                            format!("cannot match on {}", other),
                        ))
                    }
                }
                for arm in arms.iter_mut() {
                    let pat_ty = self.check_expr(&mut arm.pattern, Some(&subject_ty))?;
                    if pat_ty != subject_ty {
                        return Err(TypeError::new(
                            arm.pattern.line,
                            format!(
                                "match arm type {} does not match subject type {}",
                                pat_ty, subject_ty
                            ),
                        ));
                    }
                    self.check_block(&mut arm.body)?;
                }
                if let Some(default_body) = default {
                    self.check_block(default_body)?;
                }
            }
        }
        Ok(())
    }

    fn check_bool_cond(&mut self, cond: &mut Expr, line: u32) -> TcResult<()> {
        let ty = self.check_expr(cond, Some(&Type::Bool))?;
        if ty != Type::Bool {
            return Err(TypeError::new(
                line,
                format!("condition must be bool, got {}", ty),
            ));
        }
        Ok(())
    }

    /// Resolve a field access on a struct or class type to its index.
    pub(crate) fn resolve_field(
        &self,
        base_ty: &Type,
        field: &str,
        line: u32,
    ) -> TcResult<(u16, Type)> {
        let fields = match base_ty {
            Type::Struct(name) => {
                let id = self.struct_by_name[name];
                &self.info.structs[id as usize].fields
            }
            Type::Class(name) => {
                let id = self.class_by_name[name];
                &self.info.classes[id as usize].fields
            }
            other => {
                return Err(TypeError::new(
                    line,
                    format!("{} has no fields", other),
                ))
            }
        };
        fields
            .iter()
            .position(|(n, _)| n == field)
            .map(|i| (i as u16, fields[i].1.clone()))
            .ok_or_else(|| {
                TypeError::new(line, format!("no field '{}' on {}", field, base_ty))
            })
    }

    /// Look up a variable: innermost scope outward, then globals.
    pub(crate) fn lookup_var(&self, name: &str) -> Option<Type> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.get(name) {
                return Some(ty.clone());
            }
        }
        self.global_by_name.get(name).and_then(|&slot| {
            if (slot as usize) < self.visible_globals {
                Some(self.info.globals[slot as usize].ty.clone())
            } else {
                None
            }
        })
    }

}
