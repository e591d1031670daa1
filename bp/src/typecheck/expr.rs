//! Expression checking and call resolution.
//!
//! Works on an owned `ExprKind` so resolution can rewrite nodes in
//! place: a call to a class becomes an instantiation, a call through a
//! function-typed variable becomes a value call, a bare function name
//! becomes a function reference, and `Enum.MEMBER` field syntax becomes
//! an enum member with its resolved integer value.

use bp_parser::ast::{
    BinOp, CallTarget, Expr, ExprKind, FStringPart, Param, Type, UnOp,
};

use super::{Checker, FuncBody, FuncInfo, LambdaInfo, TcResult, TypeError};
use crate::builtins::{BuiltinId, BuiltinSig, ParamSpec, RetSpec, BUILTINS_BY_NAME};

impl Checker {
    /// Check one expression, setting its `inferred` type. `expected` is
    /// a sink hint used for literal adoption (int literals in float or
    /// fixed-width context, `null`, empty container literals).
    pub(crate) fn check_expr(
        &mut self,
        expr: &mut Expr,
        expected: Option<&Type>,
    ) -> TcResult<Type> {
        let line = expr.line;
        let owned = std::mem::replace(&mut expr.kind, ExprKind::Null);
        let (kind, ty) = self.check_kind(owned, line, expected)?;
        expr.kind = kind;
        expr.inferred = Some(ty.clone());
        Ok(ty)
    }

    /// Check with a required type, inserting the int-to-float coercion
    /// the sink rules allow.
    pub(crate) fn check_coerced(
        &mut self,
        expr: &mut Expr,
        expected: &Type,
        line: u32,
    ) -> TcResult<()> {
        let ty = self.check_expr(expr, Some(expected))?;
        if &ty == expected {
            return Ok(());
        }
        if *expected == Type::Float && ty.is_integer() {
            wrap_to_float(expr);
            return Ok(());
        }
        Err(TypeError::new(
            line,
            format!("type mismatch: expected {}, got {}", expected, ty),
        ))
    }

    fn check_kind(
        &mut self,
        kind: ExprKind,
        line: u32,
        expected: Option<&Type>,
    ) -> TcResult<(ExprKind, Type)> {
        match kind {
            ExprKind::IntLit(v) => match expected {
                Some(Type::Float) => Ok((ExprKind::FloatLit(v as f64), Type::Float)),
                Some(t) if t.is_integer() && *t != Type::Int => {
                    check_int_width(v, t, line)?;
                    Ok((ExprKind::IntLit(v), t.clone()))
                }
                _ => Ok((ExprKind::IntLit(v), Type::Int)),
            },
            ExprKind::FloatLit(v) => Ok((ExprKind::FloatLit(v), Type::Float)),
            ExprKind::BoolLit(b) => Ok((ExprKind::BoolLit(b), Type::Bool)),
            ExprKind::StrLit(s) => Ok((ExprKind::StrLit(s), Type::Str)),
            ExprKind::Null => match expected {
                Some(t) if nullable(t) => Ok((ExprKind::Null, t.clone())),
                Some(t) => Err(TypeError::new(
                    line,
                    format!("null is not a valid {}", t),
                )),
                None => Err(TypeError::new(line, "cannot infer the type of null here")),
            },
            ExprKind::Var(name) => self.check_var(name, line),
            ExprKind::FuncRef { name, .. } => {
                // Re-resolution of an already rewritten reference.
                self.check_var(name, line)
            }
            ExprKind::Unary { op, mut operand } => {
                let ty = self.check_expr(&mut operand, None)?;
                let result = match op {
                    UnOp::Neg if ty.is_numeric() => ty,
                    UnOp::Not if ty == Type::Bool => Type::Bool,
                    UnOp::BitNot if ty.is_integer() => ty,
                    _ => {
                        return Err(TypeError::new(
                            line,
                            format!("operator {:?} cannot apply to {}", op, ty),
                        ))
                    }
                };
                Ok((ExprKind::Unary { op, operand }, result))
            }
            ExprKind::Binary { op, mut lhs, mut rhs } => {
                let ty = self.check_binary(op, &mut lhs, &mut rhs, line)?;
                Ok((ExprKind::Binary { op, lhs, rhs }, ty))
            }
            ExprKind::ArrayLit(mut elems) => {
                let expected_elem = match expected {
                    Some(Type::Array(elem)) => Some((**elem).clone()),
                    _ => None,
                };
                if elems.is_empty() {
                    let Some(elem) = expected_elem else {
                        return Err(TypeError::new(
                            line,
                            "cannot infer element type of an empty array literal",
                        ));
                    };
                    return Ok((ExprKind::ArrayLit(elems), Type::Array(Box::new(elem))));
                }
                let first = self.check_expr(&mut elems[0], expected_elem.as_ref())?;
                for elem in elems.iter_mut().skip(1) {
                    let ty = self.check_expr(elem, Some(&first))?;
                    if ty != first {
                        return Err(TypeError::new(
                            elem.line,
                            format!("array literal mixes {} and {}", first, ty),
                        ));
                    }
                }
                Ok((ExprKind::ArrayLit(elems), Type::Array(Box::new(first))))
            }
            ExprKind::MapLit(mut pairs) => {
                let (exp_key, exp_val) = match expected {
                    Some(Type::Map(k, v)) => (Some((**k).clone()), Some((**v).clone())),
                    _ => (None, None),
                };
                if pairs.is_empty() {
                    let (Some(k), Some(v)) = (exp_key, exp_val) else {
                        return Err(TypeError::new(
                            line,
                            "cannot infer key/value types of an empty map literal",
                        ));
                    };
                    return Ok((
                        ExprKind::MapLit(pairs),
                        Type::Map(Box::new(k), Box::new(v)),
                    ));
                }
                let key_ty = self.check_expr(&mut pairs[0].0, exp_key.as_ref())?;
                check_hashable(&key_ty, line)?;
                let val_ty = self.check_expr(&mut pairs[0].1, exp_val.as_ref())?;
                for (key, value) in pairs.iter_mut().skip(1) {
                    let kt = self.check_expr(key, Some(&key_ty))?;
                    if kt != key_ty {
                        return Err(TypeError::new(
                            key.line,
                            format!("map literal mixes {} and {} keys", key_ty, kt),
                        ));
                    }
                    let vt = self.check_expr(value, Some(&val_ty))?;
                    if vt != val_ty {
                        return Err(TypeError::new(
                            value.line,
                            format!("map literal mixes {} and {} values", val_ty, vt),
                        ));
                    }
                }
                Ok((
                    ExprKind::MapLit(pairs),
                    Type::Map(Box::new(key_ty), Box::new(val_ty)),
                ))
            }
            ExprKind::Index { mut base, mut index } => {
                let base_ty = self.check_expr(&mut base, None)?;
                let result = match &base_ty {
                    Type::Array(elem) => {
                        let idx = self.check_expr(&mut index, Some(&Type::Int))?;
                        if !idx.is_integer() {
                            return Err(TypeError::new(
                                line,
                                format!("array index must be an integer, got {}", idx),
                            ));
                        }
                        (**elem).clone()
                    }
                    Type::Map(key, value) => {
                        let kt = self.check_expr(&mut index, Some(key))?;
                        if kt != **key {
                            return Err(TypeError::new(
                                line,
                                format!("map key type mismatch: expected {}, got {}", key, kt),
                            ));
                        }
                        (**value).clone()
                    }
                    Type::Tuple(elems) => {
                        self.check_expr(&mut index, Some(&Type::Int))?;
                        let ExprKind::IntLit(i) = &index.kind else {
                            return Err(TypeError::new(
                                line,
                                "tuple index must be a constant integer",
                            ));
                        };
                        let i = *i;
                        if i < 0 || i as usize >= elems.len() {
                            return Err(TypeError::new(
                                line,
                                format!("tuple index {} out of range for {}", i, base_ty),
                            ));
                        }
                        elems[i as usize].clone()
                    }
                    other => {
                        return Err(TypeError::new(
                            line,
                            format!("cannot index into {}", other),
                        ))
                    }
                };
                Ok((ExprKind::Index { base, index }, result))
            }
            ExprKind::TupleLit(mut elems) => {
                let expected_elems = match expected {
                    Some(Type::Tuple(ts)) if ts.len() == elems.len() => Some(ts.clone()),
                    _ => None,
                };
                let mut types = Vec::with_capacity(elems.len());
                for (i, elem) in elems.iter_mut().enumerate() {
                    let hint = expected_elems.as_ref().map(|ts| &ts[i]);
                    types.push(self.check_expr(elem, hint)?);
                }
                Ok((ExprKind::TupleLit(elems), Type::Tuple(types)))
            }
            ExprKind::StructLit { name, mut fields, .. } => {
                let Some(&type_id) = self.struct_by_name.get(&name) else {
                    return Err(TypeError::new(line, format!("unknown struct '{}'", name)));
                };
                let decl_fields = self.info.structs[type_id as usize].fields.clone();
                if fields.len() != decl_fields.len() {
                    return Err(TypeError::new(
                        line,
                        format!(
                            "struct '{}' has {} fields, literal provides {}",
                            name,
                            decl_fields.len(),
                            fields.len()
                        ),
                    ));
                }
                for ((fname, value), (dname, dty)) in
                    fields.iter_mut().zip(decl_fields.iter())
                {
                    if fname != dname {
                        return Err(TypeError::new(
                            line,
                            format!(
                                "struct '{}' literal fields must appear in declaration order (expected '{}', got '{}')",
                                name, dname, fname
                            ),
                        ));
                    }
                    self.check_coerced(value, dty, line)?;
                }
                let ty = Type::Struct(name.clone());
                Ok((
                    ExprKind::StructLit {
                        name,
                        fields,
                        type_id: Some(type_id),
                    },
                    ty,
                ))
            }
            ExprKind::Field { mut base, name, .. } => {
                // `Enum.MEMBER` arrives as a field access on a bare name.
                if let ExprKind::Var(base_name) = &base.kind {
                    if self.lookup_var(base_name).is_none() {
                        if let Some(&eid) = self.enum_by_name.get(base_name) {
                            let info = &self.info.enums[eid as usize];
                            let Some(pos) =
                                info.members.iter().position(|m| m == &name)
                            else {
                                return Err(TypeError::new(
                                    line,
                                    format!("enum '{}' has no member '{}'", base_name, name),
                                ));
                            };
                            let ty = Type::Enum(base_name.clone());
                            return Ok((
                                ExprKind::EnumMember {
                                    enum_name: base_name.clone(),
                                    member: name,
                                    value: Some(pos as i64),
                                },
                                ty,
                            ));
                        }
                    }
                }
                let base_ty = self.check_expr(&mut base, None)?;
                let (index, field_ty) = self.resolve_field(&base_ty, &name, line)?;
                Ok((
                    ExprKind::Field {
                        base,
                        name,
                        index: Some(index),
                    },
                    field_ty,
                ))
            }
            ExprKind::EnumMember { enum_name, member, .. } => {
                let Some(&eid) = self.enum_by_name.get(&enum_name) else {
                    return Err(TypeError::new(line, format!("unknown enum '{}'", enum_name)));
                };
                let info = &self.info.enums[eid as usize];
                let Some(pos) = info.members.iter().position(|m| m == &member) else {
                    return Err(TypeError::new(
                        line,
                        format!("enum '{}' has no member '{}'", enum_name, member),
                    ));
                };
                let ty = Type::Enum(enum_name.clone());
                Ok((
                    ExprKind::EnumMember {
                        enum_name,
                        member,
                        value: Some(pos as i64),
                    },
                    ty,
                ))
            }
            ExprKind::FString(mut parts) => {
                for part in parts.iter_mut() {
                    if let FStringPart::Expr(expr) = part {
                        let ty = self.check_expr(expr, None)?;
                        if ty == Type::Void {
                            return Err(TypeError::new(
                                expr.line,
                                "cannot format a void expression",
                            ));
                        }
                    }
                }
                Ok((ExprKind::FString(parts), Type::Str))
            }
            ExprKind::Call { name, args, .. } => self.check_call(name, args, line),
            ExprKind::CallValue { mut callee, mut args } => {
                let callee_ty = self.check_expr(&mut callee, None)?;
                let Type::Function(params, ret) = callee_ty else {
                    return Err(TypeError::new(
                        line,
                        format!("{} is not callable", callee_ty),
                    ));
                };
                self.check_args(&mut args, &params, "function value", line)?;
                Ok((ExprKind::CallValue { callee, args }, *ret))
            }
            ExprKind::MethodCall { mut base, name, mut args, .. } => {
                let base_ty = self.check_expr(&mut base, None)?;
                let Type::Class(cname) = &base_ty else {
                    return Err(TypeError::new(
                        line,
                        format!("{} has no methods", base_ty),
                    ));
                };
                let cid = self.class_by_name[cname];
                let class = &self.info.classes[cid as usize];
                let Some(pos) = class.methods.iter().position(|m| m.name == name) else {
                    return Err(TypeError::new(
                        line,
                        format!("class '{}' has no method '{}'", cname, name),
                    ));
                };
                let sig = class.methods[pos].clone();
                self.check_args(&mut args, &sig.params, &name, line)?;
                Ok((
                    ExprKind::MethodCall {
                        base,
                        name,
                        args,
                        method_id: Some(pos as u16),
                    },
                    sig.ret,
                ))
            }
            ExprKind::SuperCall { name, mut args, .. } => {
                let Some(cid) = self.current_class else {
                    return Err(TypeError::new(line, "super used outside of a method"));
                };
                let Some(pid) = self.info.classes[cid as usize].parent else {
                    return Err(TypeError::new(
                        line,
                        format!(
                            "class '{}' has no parent",
                            self.info.classes[cid as usize].name
                        ),
                    ));
                };
                let parent = &self.info.classes[pid as usize];
                let Some(pos) = parent.methods.iter().position(|m| m.name == name) else {
                    return Err(TypeError::new(
                        line,
                        format!("class '{}' has no method '{}'", parent.name, name),
                    ));
                };
                let sig = parent.methods[pos].clone();
                self.check_args(&mut args, &sig.params, &name, line)?;
                Ok((
                    ExprKind::SuperCall {
                        name,
                        args,
                        method_id: Some(pos as u16),
                    },
                    sig.ret,
                ))
            }
            ExprKind::New { class, mut args, .. } => {
                let Some(&class_id) = self.class_by_name.get(&class) else {
                    return Err(TypeError::new(line, format!("unknown class '{}'", class)));
                };
                self.check_ctor_args(class_id, &mut args, line)?;
                let ty = Type::Class(class.clone());
                Ok((
                    ExprKind::New {
                        class,
                        args,
                        class_id: Some(class_id),
                    },
                    ty,
                ))
            }
            ExprKind::Lambda { params, ret, mut body, fn_index } => {
                let params = self.resolve_params(&params, line)?;
                let ret = self.resolve_type(&ret, line)?;

                // Lambdas do not capture locals: the body sees only its
                // own parameters and module globals.
                let saved_scopes = std::mem::take(&mut self.scopes);
                let saved_ret = self.current_ret.clone();
                let saved_class = self.current_class.take();
                self.scopes.push(Default::default());
                for param in &params {
                    self.scopes
                        .last_mut()
                        .expect("just pushed")
                        .insert(param.name.clone(), param.ty.clone());
                }
                self.current_ret = ret.clone();
                let body_result = self.check_coerced(&mut body, &ret, line);
                self.scopes = saved_scopes;
                self.current_ret = saved_ret;
                self.current_class = saved_class;
                body_result?;

                let index = fn_index.unwrap_or(self.info.funcs.len() as u32);
                let ordinal = self.info.lambdas.len();
                let name = format!("__lambda_{}", ordinal);
                if fn_index.is_none() || self.info.funcs.len() as u32 == index {
                    self.info.funcs.push(FuncInfo {
                        name: name.clone(),
                        params: params.clone(),
                        ret: ret.clone(),
                        body: FuncBody::Lambda(ordinal),
                    });
                    self.info.lambdas.push(LambdaInfo {
                        name,
                        params: params.clone(),
                        ret: ret.clone(),
                        body: (*body).clone(),
                    });
                }
                let ty = Type::Function(
                    params.iter().map(|p| p.ty.clone()).collect(),
                    Box::new(ret.clone()),
                );
                Ok((
                    ExprKind::Lambda {
                        params,
                        ret,
                        body,
                        fn_index: Some(index),
                    },
                    ty,
                ))
            }
        }
    }

    /// Resolve a bare name in expression position.
    fn check_var(&mut self, name: String, line: u32) -> TcResult<(ExprKind, Type)> {
        if let Some(ty) = self.lookup_var(&name) {
            return Ok((ExprKind::Var(name), ty));
        }
        if let Some(&idx) = self.func_by_name.get(&name) {
            let info = &self.info.funcs[idx as usize];
            let ty = Type::Function(
                info.params.iter().map(|p| p.ty.clone()).collect(),
                Box::new(info.ret.clone()),
            );
            return Ok((
                ExprKind::FuncRef {
                    name,
                    fn_index: Some(idx),
                },
                ty,
            ));
        }
        if self.enum_by_name.contains_key(&name) {
            return Err(TypeError::new(
                line,
                format!("enum '{}' used as a value", name),
            ));
        }
        Err(TypeError::new(line, format!("unknown variable '{}'", name)))
    }

    /// Resolve a named call: variable of function type, user function,
    /// class instantiation, extern, then builtin.
    fn check_call(
        &mut self,
        name: String,
        mut args: Vec<Expr>,
        line: u32,
    ) -> TcResult<(ExprKind, Type)> {
        if let Some(var_ty) = self.lookup_var(&name) {
            let Type::Function(params, ret) = var_ty else {
                return Err(TypeError::new(
                    line,
                    format!("'{}' is not callable (type {})", name, var_ty),
                ));
            };
            self.check_args(&mut args, &params, &name, line)?;
            let mut callee = Expr::new(ExprKind::Var(name), line);
            callee.inferred = Some(Type::Function(params, ret.clone()));
            return Ok((
                ExprKind::CallValue {
                    callee: Box::new(callee),
                    args,
                },
                *ret,
            ));
        }

        if let Some(&idx) = self.func_by_name.get(&name) {
            let info = self.info.funcs[idx as usize].clone();
            let params: Vec<Type> = info.params.iter().map(|p| p.ty.clone()).collect();
            self.check_args(&mut args, &params, &name, line)?;
            return Ok((
                ExprKind::Call {
                    name,
                    args,
                    target: CallTarget::User(idx),
                },
                info.ret,
            ));
        }

        if let Some(&class_id) = self.class_by_name.get(&name) {
            self.check_ctor_args(class_id, &mut args, line)?;
            let ty = Type::Class(name.clone());
            return Ok((
                ExprKind::New {
                    class: name,
                    args,
                    class_id: Some(class_id),
                },
                ty,
            ));
        }

        if let Some(&ext) = self.extern_by_name.get(&name) {
            let info = self.info.externs[ext as usize].clone();
            if info.variadic {
                if args.len() < info.param_types.len() {
                    return Err(TypeError::new(
                        line,
                        format!(
                            "extern '{}' needs at least {} arguments, got {}",
                            name,
                            info.param_types.len(),
                            args.len()
                        ),
                    ));
                }
                for (i, arg) in args.iter_mut().enumerate() {
                    let hint = info.param_types.get(i);
                    let ty = self.check_expr(arg, hint)?;
                    if let Some(want) = hint {
                        if &ty != want {
                            return Err(TypeError::new(
                                line,
                                format!(
                                    "extern '{}' argument {}: expected {}, got {}",
                                    name,
                                    i + 1,
                                    want,
                                    ty
                                ),
                            ));
                        }
                    } else if !ffi_passable(&ty) {
                        return Err(TypeError::new(
                            line,
                            format!("type {} cannot cross the FFI boundary", ty),
                        ));
                    }
                }
            } else {
                self.check_args(&mut args, &info.param_types, &name, line)?;
            }
            return Ok((
                ExprKind::Call {
                    name,
                    args,
                    target: CallTarget::Extern(ext),
                },
                info.ret_type,
            ));
        }

        if let Some(sig) = BUILTINS_BY_NAME.get(name.as_str()).copied() {
            let ret = self.check_builtin_call(sig, &mut args, line)?;
            return Ok((
                ExprKind::Call {
                    name,
                    args,
                    target: CallTarget::Builtin(sig.id as u16),
                },
                ret,
            ));
        }

        Err(TypeError::new(line, format!("unknown function '{}'", name)))
    }

    /// Fixed-arity argument checking with the sink coercion.
    fn check_args(
        &mut self,
        args: &mut [Expr],
        params: &[Type],
        what: &str,
        line: u32,
    ) -> TcResult<()> {
        if args.len() != params.len() {
            return Err(TypeError::new(
                line,
                format!(
                    "{} takes {} arguments, got {}",
                    what,
                    params.len(),
                    args.len()
                ),
            ));
        }
        for (arg, param) in args.iter_mut().zip(params.iter()) {
            let ty = self.check_expr(arg, Some(param))?;
            if &ty != param {
                return Err(TypeError::new(
                    arg.line,
                    format!("argument type mismatch: expected {}, got {}", param, ty),
                ));
            }
        }
        Ok(())
    }

    fn check_ctor_args(
        &mut self,
        class_id: u16,
        args: &mut [Expr],
        line: u32,
    ) -> TcResult<()> {
        let class = &self.info.classes[class_id as usize];
        let name = class.name.clone();
        match class.methods.iter().find(|m| m.name == "init") {
            Some(init) => {
                let params = init.params.clone();
                self.check_args(args, &params, &name, line)
            }
            None => {
                if args.is_empty() {
                    Ok(())
                } else {
                    Err(TypeError::new(
                        line,
                        format!("class '{}' has no init method and takes no arguments", name),
                    ))
                }
            }
        }
    }

    /// Check a builtin call against its signature table entry.
    fn check_builtin_call(
        &mut self,
        sig: &BuiltinSig,
        args: &mut [Expr],
        line: u32,
    ) -> TcResult<Type> {
        let name = sig.id.bp_name();
        if sig.variadic {
            for arg in args.iter_mut() {
                let ty = self.check_expr(arg, None)?;
                if ty == Type::Void {
                    return Err(TypeError::new(
                        arg.line,
                        format!("cannot pass a void value to {}", name),
                    ));
                }
            }
            return Ok(ret_type(sig.ret, &[]));
        }
        if args.len() != sig.params.len() {
            return Err(TypeError::new(
                line,
                format!(
                    "{} takes {} arguments, got {}",
                    name,
                    sig.params.len(),
                    args.len()
                ),
            ));
        }
        let mut arg_types: Vec<Type> = Vec::with_capacity(args.len());
        for (i, (arg, spec)) in args.iter_mut().zip(sig.params.iter()).enumerate() {
            let hint = param_hint(*spec, &arg_types);
            let ty = self.check_expr(arg, hint.as_ref())?;
            let ok = match spec {
                ParamSpec::Any => ty != Type::Void,
                ParamSpec::Int => ty.is_integer(),
                ParamSpec::Float => ty == Type::Float,
                ParamSpec::Bool => ty == Type::Bool,
                ParamSpec::Str => ty == Type::Str,
                ParamSpec::Numeric => ty.is_numeric(),
                ParamSpec::AnyArray => matches!(ty, Type::Array(_)),
                ParamSpec::AnyMap => matches!(ty, Type::Map(_, _)),
                ParamSpec::ElemOfArg0 => match arg_types.first() {
                    Some(Type::Array(elem)) => ty == **elem,
                    _ => false,
                },
                ParamSpec::KeyOfArg0 => match arg_types.first() {
                    Some(Type::Map(key, _)) => ty == **key,
                    _ => false,
                },
            };
            if !ok {
                return Err(TypeError::new(
                    arg.line,
                    format!("{}: argument {} has type {}", name, i + 1, ty),
                ));
            }
            arg_types.push(ty);
        }
        Ok(ret_type(sig.ret, &arg_types))
    }

    fn check_binary(
        &mut self,
        op: BinOp,
        lhs: &mut Expr,
        rhs: &mut Expr,
        line: u32,
    ) -> TcResult<Type> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let lt = self.check_expr(lhs, None)?;
                let rt = self.check_expr(rhs, Some(&lt))?;
                if op == BinOp::Add && lt == Type::Str && rt == Type::Str {
                    return Ok(Type::Str);
                }
                if lt == rt && lt.is_numeric() {
                    return Ok(lt);
                }
                // Division promotes the integer side when the other
                // operand is a float.
                if op == BinOp::Div {
                    if lt == Type::Float && rt.is_integer() {
                        wrap_to_float(rhs);
                        return Ok(Type::Float);
                    }
                    if rt == Type::Float && lt.is_integer() {
                        wrap_to_float(lhs);
                        return Ok(Type::Float);
                    }
                }
                Err(TypeError::new(
                    line,
                    format!("operator {:?} cannot apply to {} and {}", op, lt, rt),
                ))
            }
            BinOp::Eq | BinOp::Ne => {
                let lt = self.check_expr(lhs, None)?;
                let rt = self.check_expr(rhs, Some(&lt))?;
                if lt != rt {
                    return Err(TypeError::new(
                        line,
                        format!("== and != require identical types, got {} and {}", lt, rt),
                    ));
                }
                Ok(Type::Bool)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let lt = self.check_expr(lhs, None)?;
                let rt = self.check_expr(rhs, Some(&lt))?;
                if lt == rt && lt.is_numeric() {
                    Ok(Type::Bool)
                } else {
                    Err(TypeError::new(
                        line,
                        format!("ordering requires matching numeric types, got {} and {}", lt, rt),
                    ))
                }
            }
            BinOp::And | BinOp::Or => {
                let lt = self.check_expr(lhs, Some(&Type::Bool))?;
                let rt = self.check_expr(rhs, Some(&Type::Bool))?;
                if lt == Type::Bool && rt == Type::Bool {
                    Ok(Type::Bool)
                } else {
                    Err(TypeError::new(
                        line,
                        format!("and/or require bool operands, got {} and {}", lt, rt),
                    ))
                }
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                let lt = self.check_expr(lhs, None)?;
                let rt = self.check_expr(rhs, Some(&lt))?;
                if lt == rt && lt.is_integer() {
                    Ok(lt)
                } else {
                    Err(TypeError::new(
                        line,
                        format!(
                            "bitwise operator {:?} requires matching integer types, got {} and {}",
                            op, lt, rt
                        ),
                    ))
                }
            }
        }
    }
}

fn wrap_to_float(expr: &mut Expr) {
    let line = expr.line;
    let inner = std::mem::replace(expr, Expr::new(ExprKind::Null, line));
    let mut call = Expr::new(
        ExprKind::Call {
            name: "to_float".to_string(),
            args: vec![inner],
            target: CallTarget::Builtin(BuiltinId::ToFloat as u16),
        },
        line,
    );
    call.inferred = Some(Type::Float);
    *expr = call;
}

fn nullable(ty: &Type) -> bool {
    matches!(
        ty,
        Type::Str
            | Type::Array(_)
            | Type::Map(_, _)
            | Type::Struct(_)
            | Type::Class(_)
            | Type::Ptr(_)
            | Type::Function(_, _)
    )
}

fn check_hashable(ty: &Type, line: u32) -> TcResult<()> {
    if ty.is_integer() || matches!(ty, Type::Float | Type::Bool | Type::Str | Type::Enum(_)) {
        Ok(())
    } else {
        Err(TypeError::new(
            line,
            format!("{} cannot be a map key", ty),
        ))
    }
}

fn check_int_width(v: i64, ty: &Type, line: u32) -> TcResult<()> {
    let ok = match ty {
        Type::I8 => i8::try_from(v).is_ok(),
        Type::I16 => i16::try_from(v).is_ok(),
        Type::I32 => i32::try_from(v).is_ok(),
        Type::I64 | Type::Int => true,
        Type::U8 => u8::try_from(v).is_ok(),
        Type::U16 => u16::try_from(v).is_ok(),
        Type::U32 => u32::try_from(v).is_ok(),
        Type::U64 => v >= 0,
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(TypeError::new(
            line,
            format!("literal {} does not fit in {}", v, ty),
        ))
    }
}

fn param_hint(spec: ParamSpec, arg_types: &[Type]) -> Option<Type> {
    match spec {
        ParamSpec::Int => Some(Type::Int),
        ParamSpec::Float => Some(Type::Float),
        ParamSpec::Bool => Some(Type::Bool),
        ParamSpec::Str => Some(Type::Str),
        ParamSpec::ElemOfArg0 => match arg_types.first() {
            Some(Type::Array(elem)) => Some((**elem).clone()),
            _ => None,
        },
        ParamSpec::KeyOfArg0 => match arg_types.first() {
            Some(Type::Map(key, _)) => Some((**key).clone()),
            _ => None,
        },
        _ => None,
    }
}

fn ret_type(spec: RetSpec, arg_types: &[Type]) -> Type {
    match spec {
        RetSpec::Void => Type::Void,
        RetSpec::Int => Type::Int,
        RetSpec::Float => Type::Float,
        RetSpec::Bool => Type::Bool,
        RetSpec::Str => Type::Str,
        RetSpec::StrArray => Type::Array(Box::new(Type::Str)),
        RetSpec::SameAsArg0 => arg_types.first().cloned().unwrap_or(Type::Void),
        RetSpec::ElemOfArg0 => match arg_types.first() {
            Some(Type::Array(elem)) => (**elem).clone(),
            _ => Type::Void,
        },
        RetSpec::KeysOfArg0 => match arg_types.first() {
            Some(Type::Map(key, _)) => Type::Array(key.clone()),
            _ => Type::Void,
        },
        RetSpec::ValuesOfArg0 => match arg_types.first() {
            Some(Type::Map(_, value)) => Type::Array(value.clone()),
            _ => Type::Void,
        },
    }
}

fn ffi_passable(ty: &Type) -> bool {
    ty.is_integer()
        || matches!(ty, Type::Float | Type::Str | Type::Bool | Type::Ptr(_))
}
