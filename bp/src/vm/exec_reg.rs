//! Register-format opcode implementations.
//!
//! Mirrors the stack back-end semantics over a register window per
//! frame. Windows stack up in one shared register file that grows by
//! doubling; popped windows are nulled so the collector's root scan
//! stays tight.

use super::gc::HeapObj;
use super::value::Value;
use super::{as_bool, as_float, as_func, as_int, as_int_like, Flow, Vm, VmFault};
use crate::bytecode::opcode::ROp;

impl Vm {
    /// Match-based dispatch body shared with the table entries.
    pub(crate) fn exec_rop(&mut self, op: ROp) -> Result<Flow, VmFault> {
        match op {
            ROp::ConstI64 => self.r_const_i64(),
            ROp::ConstF64 => self.r_const_f64(),
            ROp::ConstBool => self.r_const_bool(),
            ROp::ConstStr => self.r_const_str(),
            ROp::ConstNull => self.r_const_null(),
            ROp::ConstFunc => self.r_const_func(),
            ROp::Move => self.r_move(),
            ROp::LoadGlobal => self.r_load_global(),
            ROp::StoreGlobal => self.r_store_global(),
            ROp::AddI64 => self.r_add_i64(),
            ROp::SubI64 => self.r_sub_i64(),
            ROp::MulI64 => self.r_mul_i64(),
            ROp::DivI64 => self.r_div_i64(),
            ROp::ModI64 => self.r_mod_i64(),
            ROp::AddF64 => self.r_add_f64(),
            ROp::SubF64 => self.r_sub_f64(),
            ROp::MulF64 => self.r_mul_f64(),
            ROp::DivF64 => self.r_div_f64(),
            ROp::ModF64 => self.r_mod_f64(),
            ROp::AddStr => self.r_add_str(),
            ROp::NegI64 => self.r_neg_i64(),
            ROp::NegF64 => self.r_neg_f64(),
            ROp::BitAnd => self.r_bit_and(),
            ROp::BitOr => self.r_bit_or(),
            ROp::BitXor => self.r_bit_xor(),
            ROp::Shl => self.r_shl(),
            ROp::Shr => self.r_shr(),
            ROp::BitNot => self.r_bit_not(),
            ROp::EqVal => self.r_eq_val(),
            ROp::NeVal => self.r_ne_val(),
            ROp::EqI64 => self.r_eq_i64(),
            ROp::NeI64 => self.r_ne_i64(),
            ROp::LtI64 => self.r_lt_i64(),
            ROp::LeI64 => self.r_le_i64(),
            ROp::GtI64 => self.r_gt_i64(),
            ROp::GeI64 => self.r_ge_i64(),
            ROp::LtF64 => self.r_lt_f64(),
            ROp::LeF64 => self.r_le_f64(),
            ROp::GtF64 => self.r_gt_f64(),
            ROp::GeF64 => self.r_ge_f64(),
            ROp::Not => self.r_not(),
            ROp::And => self.r_and(),
            ROp::Or => self.r_or(),
            ROp::Jmp => self.r_jmp(),
            ROp::JmpIfFalse => self.r_jmp_if_false(),
            ROp::JmpIfTrue => self.r_jmp_if_true(),
            ROp::Call => self.r_call(),
            ROp::CallBuiltin => self.r_call_builtin(),
            ROp::CallValue => self.r_call_value(),
            ROp::FfiCall => self.r_ffi_call(),
            ROp::Ret => self.r_ret(),
            ROp::ArrayNew => self.r_array_new(),
            ROp::ArrayGet => self.r_array_get(),
            ROp::ArraySet => self.r_array_set(),
            ROp::MapNew => self.r_map_new(),
            ROp::MapGet => self.r_map_get(),
            ROp::MapSet => self.r_map_set(),
            ROp::StructNew => self.r_struct_new(),
            ROp::StructGet => self.r_struct_get(),
            ROp::StructSet => self.r_struct_set(),
            ROp::ClassNew => self.r_class_new(),
            ROp::ClassGet => self.r_class_get(),
            ROp::ClassSet => self.r_class_set(),
            ROp::MethodCall => self.r_method_call(),
            ROp::SuperCall => self.r_super_call(),
            ROp::TryBegin => self.r_try_begin(),
            ROp::TryEnd => self.r_try_end(),
            ROp::Throw => self.r_throw(),
        }
    }

    // --- constants and moves ----------------------------------------------

    pub(crate) fn r_const_i64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let v = self.fetch_i64()?;
        self.set_reg(dst, Value::Int(v));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_const_f64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let v = self.fetch_f64()?;
        self.set_reg(dst, Value::Float(v));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_const_bool(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let v = self.fetch_u8()?;
        self.set_reg(dst, Value::Bool(v != 0));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_const_str(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let id = self.fetch_u32()?;
        let s = self.local_str(id)?.to_string();
        let r = self.gc_alloc_str(s);
        self.set_reg(dst, Value::Str(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_const_null(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        self.set_reg(dst, Value::Null);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_const_func(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let f = self.fetch_u32()?;
        self.set_reg(dst, Value::Func(f));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_move(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let src = self.fetch_u8()?;
        let value = self.reg(src);
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_load_global(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let slot = self.fetch_u16()? as usize;
        let value = self.global_value(slot);
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_store_global(&mut self) -> Result<Flow, VmFault> {
        let slot = self.fetch_u16()? as usize;
        let src = self.fetch_u8()?;
        let value = self.reg(src);
        self.set_global_value(slot, value);
        Ok(Flow::Continue)
    }

    // --- integer arithmetic -----------------------------------------------

    fn rbin_i64(&mut self, op: &'static str, f: fn(i64, i64) -> i64) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_int(self.reg(a), op)?;
        let y = as_int(self.reg(b), op)?;
        self.set_reg(dst, Value::Int(f(x, y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_add_i64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("ADD_I64", i64::wrapping_add)
    }

    pub(crate) fn r_sub_i64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("SUB_I64", i64::wrapping_sub)
    }

    pub(crate) fn r_mul_i64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("MUL_I64", i64::wrapping_mul)
    }

    pub(crate) fn r_div_i64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_int(self.reg(a), "DIV_I64")?;
        let y = as_int(self.reg(b), "DIV_I64")?;
        if y == 0 {
            return Err(VmFault::DivisionByZero);
        }
        self.set_reg(dst, Value::Int(x.wrapping_div(y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_mod_i64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_int(self.reg(a), "MOD_I64")?;
        let y = as_int(self.reg(b), "MOD_I64")?;
        if y == 0 {
            return Err(VmFault::DivisionByZero);
        }
        self.set_reg(dst, Value::Int(x.wrapping_rem(y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_neg_i64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let src = self.fetch_u8()?;
        let v = as_int(self.reg(src), "NEG_I64")?;
        self.set_reg(dst, Value::Int(v.wrapping_neg()));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_bit_and(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("BIT_AND", |a, b| a & b)
    }

    pub(crate) fn r_bit_or(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("BIT_OR", |a, b| a | b)
    }

    pub(crate) fn r_bit_xor(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("BIT_XOR", |a, b| a ^ b)
    }

    pub(crate) fn r_shl(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("SHL", |a, b| a.wrapping_shl((b & 63) as u32))
    }

    pub(crate) fn r_shr(&mut self) -> Result<Flow, VmFault> {
        self.rbin_i64("SHR", |a, b| a.wrapping_shr((b & 63) as u32))
    }

    pub(crate) fn r_bit_not(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let src = self.fetch_u8()?;
        let v = as_int(self.reg(src), "BIT_NOT")?;
        self.set_reg(dst, Value::Int(!v));
        Ok(Flow::Continue)
    }

    // --- float arithmetic -------------------------------------------------

    fn rbin_f64(&mut self, op: &'static str, f: fn(f64, f64) -> f64) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_float(self.reg(a), op)?;
        let y = as_float(self.reg(b), op)?;
        self.set_reg(dst, Value::Float(f(x, y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_add_f64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_f64("ADD_F64", |a, b| a + b)
    }

    pub(crate) fn r_sub_f64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_f64("SUB_F64", |a, b| a - b)
    }

    pub(crate) fn r_mul_f64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_f64("MUL_F64", |a, b| a * b)
    }

    pub(crate) fn r_div_f64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_f64("DIV_F64", |a, b| a / b)
    }

    pub(crate) fn r_mod_f64(&mut self) -> Result<Flow, VmFault> {
        self.rbin_f64("MOD_F64", |a, b| a % b)
    }

    pub(crate) fn r_neg_f64(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let src = self.fetch_u8()?;
        let v = as_float(self.reg(src), "NEG_F64")?;
        self.set_reg(dst, Value::Float(-v));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_add_str(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let joined = self.concat_strs(self.reg(a), self.reg(b))?;
        self.set_reg(dst, joined);
        Ok(Flow::Continue)
    }

    // --- comparisons --------------------------------------------------------

    pub(crate) fn r_eq_val(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let eq = self.values_equal(self.reg(a), self.reg(b))?;
        self.set_reg(dst, Value::Bool(eq));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_ne_val(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let eq = self.values_equal(self.reg(a), self.reg(b))?;
        self.set_reg(dst, Value::Bool(!eq));
        Ok(Flow::Continue)
    }

    /// Integer-payload comparison: ints and bools share the path so the
    /// native tier and the interpreter agree.
    fn rcmp_i64(&mut self, op: &'static str, f: fn(i64, i64) -> bool) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_int_like(self.reg(a), op)?;
        let y = as_int_like(self.reg(b), op)?;
        self.set_reg(dst, Value::Bool(f(x, y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_eq_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("EQ_I64", |a, b| a == b)
    }

    pub(crate) fn r_ne_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("NE_I64", |a, b| a != b)
    }

    pub(crate) fn r_lt_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("LT_I64", |a, b| a < b)
    }

    pub(crate) fn r_le_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("LE_I64", |a, b| a <= b)
    }

    pub(crate) fn r_gt_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("GT_I64", |a, b| a > b)
    }

    pub(crate) fn r_ge_i64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_i64("GE_I64", |a, b| a >= b)
    }

    fn rcmp_f64(&mut self, op: &'static str, f: fn(f64, f64) -> bool) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_float(self.reg(a), op)?;
        let y = as_float(self.reg(b), op)?;
        self.set_reg(dst, Value::Bool(f(x, y)));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_lt_f64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_f64("LT_F64", |a, b| a < b)
    }

    pub(crate) fn r_le_f64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_f64("LE_F64", |a, b| a <= b)
    }

    pub(crate) fn r_gt_f64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_f64("GT_F64", |a, b| a > b)
    }

    pub(crate) fn r_ge_f64(&mut self) -> Result<Flow, VmFault> {
        self.rcmp_f64("GE_F64", |a, b| a >= b)
    }

    // --- boolean logic -------------------------------------------------------

    pub(crate) fn r_not(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let src = self.fetch_u8()?;
        let v = as_bool(self.reg(src), "NOT")?;
        self.set_reg(dst, Value::Bool(!v));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_and(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_bool(self.reg(a), "AND")?;
        let y = as_bool(self.reg(b), "AND")?;
        self.set_reg(dst, Value::Bool(x && y));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_or(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let x = as_bool(self.reg(a), "OR")?;
        let y = as_bool(self.reg(b), "OR")?;
        self.set_reg(dst, Value::Bool(x || y));
        Ok(Flow::Continue)
    }

    // --- control flow ---------------------------------------------------------

    pub(crate) fn r_jmp(&mut self) -> Result<Flow, VmFault> {
        let target = self.fetch_u32()?;
        self.jump(target);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_jmp_if_false(&mut self) -> Result<Flow, VmFault> {
        let cond = self.fetch_u8()?;
        let target = self.fetch_u32()?;
        if !as_bool(self.reg(cond), "JMP_IF_FALSE")? {
            self.jump(target);
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn r_jmp_if_true(&mut self) -> Result<Flow, VmFault> {
        let cond = self.fetch_u8()?;
        let target = self.fetch_u32()?;
        if as_bool(self.reg(cond), "JMP_IF_TRUE")? {
            self.jump(target);
        }
        Ok(Flow::Continue)
    }

    // --- calls -------------------------------------------------------------------

    fn window_args(&self, arg_base: u8, argc: usize) -> Vec<Value> {
        let base = self.frame().base + arg_base as usize;
        self.regs_slice(base, argc)
    }

    /// Shared user-call path: profile, then run natively or push a frame.
    fn call_function_reg(
        &mut self,
        fidx: u32,
        arg_base: u8,
        argc: usize,
        dst: u8,
    ) -> Result<(), VmFault> {
        self.record_call(fidx as usize);
        if let Some(native) = self.native_entry(fidx as usize) {
            let args = self.window_args(arg_base, argc);
            let result = self.call_native(native, fidx as usize, &args);
            self.set_reg(dst, result);
            return Ok(());
        }
        self.push_reg_frame(fidx, arg_base, argc, dst, None, None)
    }

    pub(crate) fn r_call(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let fidx = self.fetch_u32()?;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        self.call_function_reg(fidx, base, argc, dst)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_call_value(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let fnreg = self.fetch_u8()?;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        let fidx = as_func(self.reg(fnreg), "CALL_VALUE")?;
        self.call_function_reg(fidx, base, argc, dst)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_call_builtin(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let id = self.fetch_u16()?;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        let args = self.window_args(base, argc);
        let result = self.builtin_call(id, &args)?;
        self.set_reg(dst, result);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_ffi_call(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let ext = self.fetch_u16()? as usize;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        let args = self.window_args(base, argc);
        let result = self.ffi_call(ext, &args)?;
        self.set_reg(dst, result);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_ret(&mut self) -> Result<Flow, VmFault> {
        let src = self.fetch_u8()?;
        let result = self.reg(src);
        let frame = self.pop_frame_record();
        let final_value = frame.ctor_result.unwrap_or(result);
        self.null_window(frame.base, frame.func);
        if self.no_frames_left() {
            if let Value::Int(v) = final_value {
                self.set_exit_code(v as i32);
            }
            return Ok(Flow::Halt);
        }
        self.set_reg(frame.dst, final_value);
        Ok(Flow::Continue)
    }

    // --- aggregates ----------------------------------------------------------------

    pub(crate) fn r_array_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let base = self.fetch_u8()?;
        let count = self.fetch_u8()? as usize;
        let items = self.window_args(base, count);
        let r = self.gc_alloc(HeapObj::Array(items));
        self.set_reg(dst, Value::Array(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_array_get(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let arr = self.fetch_u8()?;
        let idx = self.fetch_u8()?;
        let index = as_int(self.reg(idx), "ARRAY_GET")?;
        let value = self.array_load(self.reg(arr), index)?;
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_array_set(&mut self) -> Result<Flow, VmFault> {
        let arr = self.fetch_u8()?;
        let idx = self.fetch_u8()?;
        let val = self.fetch_u8()?;
        let index = as_int(self.reg(idx), "ARRAY_SET")?;
        self.array_store(self.reg(arr), index, self.reg(val))?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_map_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let base = self.fetch_u8()?;
        let count = self.fetch_u8()? as usize;
        let flat = self.window_args(base, count * 2);
        let r = self.build_map(&flat)?;
        self.set_reg(dst, Value::Map(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_map_get(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let map = self.fetch_u8()?;
        let key = self.fetch_u8()?;
        let value = self.map_load(self.reg(map), self.reg(key))?;
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_map_set(&mut self) -> Result<Flow, VmFault> {
        let map = self.fetch_u8()?;
        let key = self.fetch_u8()?;
        let val = self.fetch_u8()?;
        self.map_store(self.reg(map), self.reg(key), self.reg(val))?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_struct_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let type_id = self.fetch_u16()?;
        let base = self.fetch_u8()?;
        let count = self.fetch_u8()? as usize;
        let fields = self.window_args(base, count);
        let r = self.gc_alloc(HeapObj::Struct { type_id, fields });
        self.set_reg(dst, Value::Struct(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn r_struct_get(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let obj = self.fetch_u8()?;
        let field = self.fetch_u16()?;
        let value = self.field_load(self.reg(obj), field, "STRUCT_GET")?;
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_struct_set(&mut self) -> Result<Flow, VmFault> {
        let obj = self.fetch_u8()?;
        let field = self.fetch_u16()?;
        let val = self.fetch_u8()?;
        self.field_store(self.reg(obj), field, self.reg(val), "STRUCT_SET")?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_class_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let dst = self.fetch_u8()?;
        let class_id = self.fetch_u16()?;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        let (instance, init) = self.instantiate(class_id)?;
        match init {
            Some(init_fn) => {
                self.record_call(init_fn as usize);
                self.push_reg_frame(
                    init_fn,
                    base,
                    argc,
                    dst,
                    Some(instance),
                    Some(instance),
                )?;
            }
            None => {
                if argc != 0 {
                    return Err(VmFault::Internal(
                        "constructor arguments without an init method".to_string(),
                    ));
                }
                self.set_reg(dst, instance);
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn r_class_get(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let obj = self.fetch_u8()?;
        let field = self.fetch_u16()?;
        let value = self.field_load(self.reg(obj), field, "CLASS_GET")?;
        self.set_reg(dst, value);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_class_set(&mut self) -> Result<Flow, VmFault> {
        let obj = self.fetch_u8()?;
        let field = self.fetch_u16()?;
        let val = self.fetch_u8()?;
        self.field_store(self.reg(obj), field, self.reg(val), "CLASS_SET")?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_method_call(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let method_id = self.fetch_u16()?;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        let obj = self.reg(base);
        let fidx = self.method_target(obj, method_id)?;
        self.call_function_reg(fidx, base, argc + 1, dst)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_super_call(&mut self) -> Result<Flow, VmFault> {
        let dst = self.fetch_u8()?;
        let fidx = self.fetch_u16()? as u32;
        let base = self.fetch_u8()?;
        let argc = self.fetch_u8()? as usize;
        self.call_function_reg(fidx, base, argc + 1, dst)?;
        Ok(Flow::Continue)
    }

    // --- exceptions -------------------------------------------------------------

    pub(crate) fn r_try_begin(&mut self) -> Result<Flow, VmFault> {
        let catch = self.fetch_u32()?;
        let finally = self.fetch_u32()?;
        let reg = self.fetch_u8()?;
        self.push_handler(catch, finally, reg as u16);
        Ok(Flow::Continue)
    }

    pub(crate) fn r_try_end(&mut self) -> Result<Flow, VmFault> {
        self.pop_handler()?;
        Ok(Flow::Continue)
    }

    pub(crate) fn r_throw(&mut self) -> Result<Flow, VmFault> {
        let src = self.fetch_u8()?;
        let exc = self.reg(src);
        self.unwind(exc)?;
        Ok(Flow::Continue)
    }
}
