//! Stack-format opcode implementations.
//!
//! Each opcode is one handler method reading its own operands; the two
//! dispatch loops in `dispatch` funnel into the same methods, which is
//! what keeps them observationally equivalent.

use super::gc::{HeapObj, MapKey};
use super::value::Value;
use super::{array_index, as_bool, as_float, as_func, as_int, Flow, Vm, VmFault};
use crate::bytecode::opcode::SOp;

impl Vm {
    /// Match-based dispatch body shared with the table entries.
    pub(crate) fn exec_sop(&mut self, op: SOp) -> Result<Flow, VmFault> {
        match op {
            SOp::ConstI64 => self.s_const_i64(),
            SOp::ConstF64 => self.s_const_f64(),
            SOp::ConstBool => self.s_const_bool(),
            SOp::ConstStr => self.s_const_str(),
            SOp::ConstNull => self.s_const_null(),
            SOp::ConstFunc => self.s_const_func(),
            SOp::LoadLocal => self.s_load_local(),
            SOp::StoreLocal => self.s_store_local(),
            SOp::LoadGlobal => self.s_load_global(),
            SOp::StoreGlobal => self.s_store_global(),
            SOp::AddI64 => self.s_add_i64(),
            SOp::SubI64 => self.s_sub_i64(),
            SOp::MulI64 => self.s_mul_i64(),
            SOp::DivI64 => self.s_div_i64(),
            SOp::ModI64 => self.s_mod_i64(),
            SOp::AddF64 => self.s_add_f64(),
            SOp::SubF64 => self.s_sub_f64(),
            SOp::MulF64 => self.s_mul_f64(),
            SOp::DivF64 => self.s_div_f64(),
            SOp::ModF64 => self.s_mod_f64(),
            SOp::AddStr => self.s_add_str(),
            SOp::NegI64 => self.s_neg_i64(),
            SOp::NegF64 => self.s_neg_f64(),
            SOp::BitAnd => self.s_bit_and(),
            SOp::BitOr => self.s_bit_or(),
            SOp::BitXor => self.s_bit_xor(),
            SOp::Shl => self.s_shl(),
            SOp::Shr => self.s_shr(),
            SOp::BitNot => self.s_bit_not(),
            SOp::Eq => self.s_eq(),
            SOp::Ne => self.s_ne(),
            SOp::LtI64 => self.s_lt_i64(),
            SOp::LeI64 => self.s_le_i64(),
            SOp::GtI64 => self.s_gt_i64(),
            SOp::GeI64 => self.s_ge_i64(),
            SOp::LtF64 => self.s_lt_f64(),
            SOp::LeF64 => self.s_le_f64(),
            SOp::GtF64 => self.s_gt_f64(),
            SOp::GeF64 => self.s_ge_f64(),
            SOp::Not => self.s_not(),
            SOp::And => self.s_and(),
            SOp::Or => self.s_or(),
            SOp::Jmp => self.s_jmp(),
            SOp::JmpIfFalse => self.s_jmp_if_false(),
            SOp::JmpIfTrue => self.s_jmp_if_true(),
            SOp::Call => self.s_call(),
            SOp::CallBuiltin => self.s_call_builtin(),
            SOp::CallValue => self.s_call_value(),
            SOp::FfiCall => self.s_ffi_call(),
            SOp::Ret => self.s_ret(),
            SOp::Pop => self.s_pop(),
            SOp::ArrayNew => self.s_array_new(),
            SOp::ArrayGet => self.s_array_get(),
            SOp::ArraySet => self.s_array_set(),
            SOp::MapNew => self.s_map_new(),
            SOp::MapGet => self.s_map_get(),
            SOp::MapSet => self.s_map_set(),
            SOp::StructNew => self.s_struct_new(),
            SOp::StructGet => self.s_struct_get(),
            SOp::StructSet => self.s_struct_set(),
            SOp::ClassNew => self.s_class_new(),
            SOp::ClassGet => self.s_class_get(),
            SOp::ClassSet => self.s_class_set(),
            SOp::MethodCall => self.s_method_call(),
            SOp::SuperCall => self.s_super_call(),
            SOp::TryBegin => self.s_try_begin(),
            SOp::TryEnd => self.s_try_end(),
            SOp::Throw => self.s_throw(),
        }
    }

    // --- constants and slots --------------------------------------------

    pub(crate) fn s_const_i64(&mut self) -> Result<Flow, VmFault> {
        let v = self.fetch_i64()?;
        self.push(Value::Int(v));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_const_f64(&mut self) -> Result<Flow, VmFault> {
        let v = self.fetch_f64()?;
        self.push(Value::Float(v));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_const_bool(&mut self) -> Result<Flow, VmFault> {
        let v = self.fetch_u8()?;
        self.push(Value::Bool(v != 0));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_const_str(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let id = self.fetch_u32()?;
        let s = self.local_str(id)?.to_string();
        let r = self.gc_alloc_str(s);
        self.push(Value::Str(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_const_null(&mut self) -> Result<Flow, VmFault> {
        self.push(Value::Null);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_const_func(&mut self) -> Result<Flow, VmFault> {
        let f = self.fetch_u32()?;
        self.push(Value::Func(f));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_load_local(&mut self) -> Result<Flow, VmFault> {
        let slot = self.fetch_u16()? as usize;
        let value = self.stack[self.frame().base + slot];
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_store_local(&mut self) -> Result<Flow, VmFault> {
        let slot = self.fetch_u16()? as usize;
        let value = self.pop()?;
        let at = self.frame().base + slot;
        self.stack[at] = value;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_load_global(&mut self) -> Result<Flow, VmFault> {
        let slot = self.fetch_u16()? as usize;
        let value = self.globals[slot];
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_store_global(&mut self) -> Result<Flow, VmFault> {
        let slot = self.fetch_u16()? as usize;
        let value = self.pop()?;
        self.globals[slot] = value;
        Ok(Flow::Continue)
    }

    // --- integer arithmetic ---------------------------------------------

    fn bin_i64(&mut self, op: &'static str, f: fn(i64, i64) -> i64) -> Result<Flow, VmFault> {
        let b = as_int(self.pop()?, op)?;
        let a = as_int(self.pop()?, op)?;
        self.push(Value::Int(f(a, b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_add_i64(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("ADD_I64", i64::wrapping_add)
    }

    pub(crate) fn s_sub_i64(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("SUB_I64", i64::wrapping_sub)
    }

    pub(crate) fn s_mul_i64(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("MUL_I64", i64::wrapping_mul)
    }

    pub(crate) fn s_div_i64(&mut self) -> Result<Flow, VmFault> {
        let b = as_int(self.pop()?, "DIV_I64")?;
        let a = as_int(self.pop()?, "DIV_I64")?;
        if b == 0 {
            return Err(VmFault::DivisionByZero);
        }
        self.push(Value::Int(a.wrapping_div(b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_mod_i64(&mut self) -> Result<Flow, VmFault> {
        let b = as_int(self.pop()?, "MOD_I64")?;
        let a = as_int(self.pop()?, "MOD_I64")?;
        if b == 0 {
            return Err(VmFault::DivisionByZero);
        }
        self.push(Value::Int(a.wrapping_rem(b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_neg_i64(&mut self) -> Result<Flow, VmFault> {
        let v = as_int(self.pop()?, "NEG_I64")?;
        self.push(Value::Int(v.wrapping_neg()));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_bit_and(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("BIT_AND", |a, b| a & b)
    }

    pub(crate) fn s_bit_or(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("BIT_OR", |a, b| a | b)
    }

    pub(crate) fn s_bit_xor(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("BIT_XOR", |a, b| a ^ b)
    }

    pub(crate) fn s_shl(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("SHL", |a, b| a.wrapping_shl((b & 63) as u32))
    }

    pub(crate) fn s_shr(&mut self) -> Result<Flow, VmFault> {
        self.bin_i64("SHR", |a, b| a.wrapping_shr((b & 63) as u32))
    }

    pub(crate) fn s_bit_not(&mut self) -> Result<Flow, VmFault> {
        let v = as_int(self.pop()?, "BIT_NOT")?;
        self.push(Value::Int(!v));
        Ok(Flow::Continue)
    }

    // --- float arithmetic -----------------------------------------------

    fn bin_f64(&mut self, op: &'static str, f: fn(f64, f64) -> f64) -> Result<Flow, VmFault> {
        let b = as_float(self.pop()?, op)?;
        let a = as_float(self.pop()?, op)?;
        self.push(Value::Float(f(a, b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_add_f64(&mut self) -> Result<Flow, VmFault> {
        self.bin_f64("ADD_F64", |a, b| a + b)
    }

    pub(crate) fn s_sub_f64(&mut self) -> Result<Flow, VmFault> {
        self.bin_f64("SUB_F64", |a, b| a - b)
    }

    pub(crate) fn s_mul_f64(&mut self) -> Result<Flow, VmFault> {
        self.bin_f64("MUL_F64", |a, b| a * b)
    }

    pub(crate) fn s_div_f64(&mut self) -> Result<Flow, VmFault> {
        self.bin_f64("DIV_F64", |a, b| a / b)
    }

    pub(crate) fn s_mod_f64(&mut self) -> Result<Flow, VmFault> {
        self.bin_f64("MOD_F64", |a, b| a % b)
    }

    pub(crate) fn s_neg_f64(&mut self) -> Result<Flow, VmFault> {
        let v = as_float(self.pop()?, "NEG_F64")?;
        self.push(Value::Float(-v));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_add_str(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let b = self.pop()?;
        let a = self.pop()?;
        let joined = self.concat_strs(a, b)?;
        self.push(joined);
        Ok(Flow::Continue)
    }

    // --- comparisons ------------------------------------------------------

    pub(crate) fn s_eq(&mut self) -> Result<Flow, VmFault> {
        let b = self.pop()?;
        let a = self.pop()?;
        let eq = self.values_equal(a, b)?;
        self.push(Value::Bool(eq));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_ne(&mut self) -> Result<Flow, VmFault> {
        let b = self.pop()?;
        let a = self.pop()?;
        let eq = self.values_equal(a, b)?;
        self.push(Value::Bool(!eq));
        Ok(Flow::Continue)
    }

    fn cmp_i64(&mut self, op: &'static str, f: fn(i64, i64) -> bool) -> Result<Flow, VmFault> {
        let b = as_int(self.pop()?, op)?;
        let a = as_int(self.pop()?, op)?;
        self.push(Value::Bool(f(a, b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_lt_i64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_i64("LT_I64", |a, b| a < b)
    }

    pub(crate) fn s_le_i64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_i64("LE_I64", |a, b| a <= b)
    }

    pub(crate) fn s_gt_i64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_i64("GT_I64", |a, b| a > b)
    }

    pub(crate) fn s_ge_i64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_i64("GE_I64", |a, b| a >= b)
    }

    fn cmp_f64(&mut self, op: &'static str, f: fn(f64, f64) -> bool) -> Result<Flow, VmFault> {
        let b = as_float(self.pop()?, op)?;
        let a = as_float(self.pop()?, op)?;
        self.push(Value::Bool(f(a, b)));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_lt_f64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_f64("LT_F64", |a, b| a < b)
    }

    pub(crate) fn s_le_f64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_f64("LE_F64", |a, b| a <= b)
    }

    pub(crate) fn s_gt_f64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_f64("GT_F64", |a, b| a > b)
    }

    pub(crate) fn s_ge_f64(&mut self) -> Result<Flow, VmFault> {
        self.cmp_f64("GE_F64", |a, b| a >= b)
    }

    // --- boolean logic (eager) --------------------------------------------

    pub(crate) fn s_not(&mut self) -> Result<Flow, VmFault> {
        let v = as_bool(self.pop()?, "NOT")?;
        self.push(Value::Bool(!v));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_and(&mut self) -> Result<Flow, VmFault> {
        let b = as_bool(self.pop()?, "AND")?;
        let a = as_bool(self.pop()?, "AND")?;
        self.push(Value::Bool(a && b));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_or(&mut self) -> Result<Flow, VmFault> {
        let b = as_bool(self.pop()?, "OR")?;
        let a = as_bool(self.pop()?, "OR")?;
        self.push(Value::Bool(a || b));
        Ok(Flow::Continue)
    }

    // --- control flow -----------------------------------------------------

    pub(crate) fn s_jmp(&mut self) -> Result<Flow, VmFault> {
        let target = self.fetch_u32()?;
        self.jump(target);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_jmp_if_false(&mut self) -> Result<Flow, VmFault> {
        let target = self.fetch_u32()?;
        let cond = as_bool(self.pop()?, "JMP_IF_FALSE")?;
        if !cond {
            self.jump(target);
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn s_jmp_if_true(&mut self) -> Result<Flow, VmFault> {
        let target = self.fetch_u32()?;
        let cond = as_bool(self.pop()?, "JMP_IF_TRUE")?;
        if cond {
            self.jump(target);
        }
        Ok(Flow::Continue)
    }

    // --- calls -------------------------------------------------------------

    /// Shared user-call path: profile, then run natively or push a frame.
    fn call_function_stack(
        &mut self,
        fidx: u32,
        argc: usize,
        ctor: Option<Value>,
    ) -> Result<(), VmFault> {
        self.record_call(fidx as usize);
        if ctor.is_none() {
            if let Some(native) = self.native_entry(fidx as usize) {
                if self.stack.len() < argc {
                    return Err(VmFault::StackUnderflow);
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                let result = self.call_native(native, fidx as usize, &args);
                self.push(result);
                return Ok(());
            }
        }
        self.push_stack_frame(fidx, argc, ctor)
    }

    fn push_stack_frame(
        &mut self,
        fidx: u32,
        argc: usize,
        ctor: Option<Value>,
    ) -> Result<(), VmFault> {
        self.check_frame_depth()?;
        if self.stack.len() < argc {
            return Err(VmFault::StackUnderflow);
        }
        let func = &self.module().funcs[fidx as usize];
        if argc != func.arity as usize {
            return Err(VmFault::Internal(format!(
                "call to '{}' with {} arguments (arity {})",
                func.name, argc, func.arity
            )));
        }
        let locals = (func.locals as usize).max(argc);
        let base = self.stack.len() - argc;
        self.stack.resize(base + locals, Value::Null);
        self.push_frame_record(fidx, base, base + locals, ctor);
        Ok(())
    }

    pub(crate) fn s_call(&mut self) -> Result<Flow, VmFault> {
        let fidx = self.fetch_u32()?;
        let argc = self.fetch_u16()? as usize;
        self.call_function_stack(fidx, argc, None)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_call_value(&mut self) -> Result<Flow, VmFault> {
        let argc = self.fetch_u16()? as usize;
        let callee = as_func(self.pop()?, "CALL_VALUE")?;
        self.call_function_stack(callee, argc, None)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_call_builtin(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let id = self.fetch_u16()?;
        let argc = self.fetch_u16()? as usize;
        if self.stack.len() < argc {
            return Err(VmFault::StackUnderflow);
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let result = self.builtin_call(id, &args)?;
        self.push(result);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_ffi_call(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let ext = self.fetch_u16()? as usize;
        let argc = self.fetch_u8()? as usize;
        if self.stack.len() < argc {
            return Err(VmFault::StackUnderflow);
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let result = self.ffi_call(ext, &args)?;
        self.push(result);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_ret(&mut self) -> Result<Flow, VmFault> {
        let result = self.pop()?;
        let frame = self.pop_frame_record();
        let final_value = frame.ctor_result.unwrap_or(result);
        self.stack.truncate(frame.base);
        if self.no_frames_left() {
            if let Value::Int(v) = final_value {
                self.set_exit_code(v as i32);
            }
            return Ok(Flow::Halt);
        }
        self.push(final_value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_pop(&mut self) -> Result<Flow, VmFault> {
        self.pop()?;
        Ok(Flow::Continue)
    }

    // --- aggregates ----------------------------------------------------------

    pub(crate) fn s_array_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let count = self.fetch_u32()? as usize;
        if self.stack.len() < count {
            return Err(VmFault::StackUnderflow);
        }
        let items = self.stack.split_off(self.stack.len() - count);
        let r = self.gc_alloc(HeapObj::Array(items));
        self.push(Value::Array(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_array_get(&mut self) -> Result<Flow, VmFault> {
        let index = as_int(self.pop()?, "ARRAY_GET")?;
        let arr = self.pop()?;
        let value = self.array_load(arr, index)?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_array_set(&mut self) -> Result<Flow, VmFault> {
        let value = self.pop()?;
        let index = as_int(self.pop()?, "ARRAY_SET")?;
        let arr = self.pop()?;
        self.array_store(arr, index, value)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_map_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let count = self.fetch_u32()? as usize;
        if self.stack.len() < count * 2 {
            return Err(VmFault::StackUnderflow);
        }
        let flat = self.stack.split_off(self.stack.len() - count * 2);
        let r = self.build_map(&flat)?;
        self.push(Value::Map(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_map_get(&mut self) -> Result<Flow, VmFault> {
        let key = self.pop()?;
        let map = self.pop()?;
        let value = self.map_load(map, key)?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_map_set(&mut self) -> Result<Flow, VmFault> {
        let value = self.pop()?;
        let key = self.pop()?;
        let map = self.pop()?;
        self.map_store(map, key, value)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_struct_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let type_id = self.fetch_u16()?;
        let count = self.fetch_u16()? as usize;
        if self.stack.len() < count {
            return Err(VmFault::StackUnderflow);
        }
        let fields = self.stack.split_off(self.stack.len() - count);
        let r = self.gc_alloc(HeapObj::Struct { type_id, fields });
        self.push(Value::Struct(r));
        Ok(Flow::Continue)
    }

    pub(crate) fn s_struct_get(&mut self) -> Result<Flow, VmFault> {
        let field = self.fetch_u16()?;
        let obj = self.pop()?;
        let value = self.field_load(obj, field, "STRUCT_GET")?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_struct_set(&mut self) -> Result<Flow, VmFault> {
        let field = self.fetch_u16()?;
        let value = self.pop()?;
        let obj = self.pop()?;
        self.field_store(obj, field, value, "STRUCT_SET")?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_class_new(&mut self) -> Result<Flow, VmFault> {
        self.maybe_gc();
        let class_id = self.fetch_u16()?;
        let argc = self.fetch_u8()? as usize;
        if self.stack.len() < argc {
            return Err(VmFault::StackUnderflow);
        }
        let (instance, init) = self.instantiate(class_id)?;
        match init {
            Some(init_fn) => {
                let at = self.stack.len() - argc;
                self.stack.insert(at, instance);
                self.record_call(init_fn as usize);
                self.push_stack_frame(init_fn, argc + 1, Some(instance))?;
            }
            None => {
                if argc != 0 {
                    return Err(VmFault::Internal(
                        "constructor arguments without an init method".to_string(),
                    ));
                }
                self.push(instance);
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn s_class_get(&mut self) -> Result<Flow, VmFault> {
        let field = self.fetch_u16()?;
        let obj = self.pop()?;
        let value = self.field_load(obj, field, "CLASS_GET")?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_class_set(&mut self) -> Result<Flow, VmFault> {
        let field = self.fetch_u16()?;
        let value = self.pop()?;
        let obj = self.pop()?;
        self.field_store(obj, field, value, "CLASS_SET")?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_method_call(&mut self) -> Result<Flow, VmFault> {
        let method_id = self.fetch_u16()?;
        let argc = self.fetch_u8()? as usize;
        if self.stack.len() < argc + 1 {
            return Err(VmFault::StackUnderflow);
        }
        let obj = self.stack[self.stack.len() - 1 - argc];
        let fidx = self.method_target(obj, method_id)?;
        self.call_function_stack(fidx, argc + 1, None)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_super_call(&mut self) -> Result<Flow, VmFault> {
        let fidx = self.fetch_u16()? as u32;
        let argc = self.fetch_u8()? as usize;
        self.call_function_stack(fidx, argc + 1, None)?;
        Ok(Flow::Continue)
    }

    // --- exceptions -------------------------------------------------------

    pub(crate) fn s_try_begin(&mut self) -> Result<Flow, VmFault> {
        let catch = self.fetch_u32()?;
        let finally = self.fetch_u32()?;
        let slot = self.fetch_u16()?;
        self.push_handler(catch, finally, slot);
        Ok(Flow::Continue)
    }

    pub(crate) fn s_try_end(&mut self) -> Result<Flow, VmFault> {
        self.pop_handler()?;
        Ok(Flow::Continue)
    }

    pub(crate) fn s_throw(&mut self) -> Result<Flow, VmFault> {
        let exc = self.pop()?;
        self.unwind(exc)?;
        Ok(Flow::Continue)
    }

    // --- shared heap accessors (also used by the register back-end) -------

    pub(crate) fn gc_alloc(&mut self, obj: HeapObj) -> u32 {
        self.gc_alloc_obj(obj)
    }

    pub(crate) fn array_load(&self, arr: Value, index: i64) -> Result<Value, VmFault> {
        let Value::Array(r) = arr else {
            return Err(VmFault::TagMismatch {
                op: "ARRAY_GET",
                expected: "array",
                got: arr.tag(),
            });
        };
        let items = self.gc_ref().array(r)?;
        let i = array_index(index, items.len())?;
        Ok(items[i])
    }

    pub(crate) fn array_store(
        &mut self,
        arr: Value,
        index: i64,
        value: Value,
    ) -> Result<(), VmFault> {
        let Value::Array(r) = arr else {
            return Err(VmFault::TagMismatch {
                op: "ARRAY_SET",
                expected: "array",
                got: arr.tag(),
            });
        };
        let items = self.gc_mut().array_mut(r)?;
        let i = array_index(index, items.len())?;
        items[i] = value;
        Ok(())
    }

    pub(crate) fn build_map(&mut self, flat: &[Value]) -> Result<u32, VmFault> {
        let mut map = std::collections::HashMap::with_capacity(flat.len() / 2);
        for pair in flat.chunks_exact(2) {
            let key = MapKey::from_value(pair[0], self.gc_ref())?;
            map.insert(key, pair[1]);
        }
        Ok(self.gc_alloc(HeapObj::Map(map)))
    }

    pub(crate) fn map_load(&self, map: Value, key: Value) -> Result<Value, VmFault> {
        let Value::Map(r) = map else {
            return Err(VmFault::TagMismatch {
                op: "MAP_GET",
                expected: "map",
                got: map.tag(),
            });
        };
        let key = MapKey::from_value(key, self.gc_ref())?;
        self.gc_ref()
            .map(r)?
            .get(&key)
            .copied()
            .ok_or_else(|| VmFault::KeyMiss(key.describe()))
    }

    pub(crate) fn map_store(
        &mut self,
        map: Value,
        key: Value,
        value: Value,
    ) -> Result<(), VmFault> {
        let Value::Map(r) = map else {
            return Err(VmFault::TagMismatch {
                op: "MAP_SET",
                expected: "map",
                got: map.tag(),
            });
        };
        let key = MapKey::from_value(key, self.gc_ref())?;
        self.gc_mut().map_mut(r)?.insert(key, value);
        Ok(())
    }

    pub(crate) fn field_load(
        &self,
        obj: Value,
        field: u16,
        op: &'static str,
    ) -> Result<Value, VmFault> {
        let r = match obj {
            Value::Struct(r) | Value::Class(r) => r,
            other => {
                return Err(VmFault::TagMismatch {
                    op,
                    expected: "struct or class instance",
                    got: other.tag(),
                })
            }
        };
        let fields = self.gc_ref().fields(r)?;
        fields
            .get(field as usize)
            .copied()
            .ok_or_else(|| VmFault::Internal(format!("{}: field {} out of range", op, field)))
    }

    pub(crate) fn field_store(
        &mut self,
        obj: Value,
        field: u16,
        value: Value,
        op: &'static str,
    ) -> Result<(), VmFault> {
        let r = match obj {
            Value::Struct(r) | Value::Class(r) => r,
            other => {
                return Err(VmFault::TagMismatch {
                    op,
                    expected: "struct or class instance",
                    got: other.tag(),
                })
            }
        };
        let fields = self.gc_mut().fields_mut(r)?;
        let slot = fields
            .get_mut(field as usize)
            .ok_or_else(|| VmFault::Internal(format!("{}: field {} out of range", op, field)))?;
        *slot = value;
        Ok(())
    }

    pub(crate) fn concat_strs(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        let (Value::Str(ra), Value::Str(rb)) = (a, b) else {
            return Err(VmFault::TagMismatch {
                op: "ADD_STR",
                expected: "str",
                got: if matches!(a, Value::Str(_)) { b.tag() } else { a.tag() },
            });
        };
        let joined = format!("{}{}", self.gc_ref().str(ra)?, self.gc_ref().str(rb)?);
        Ok(Value::Str(self.gc_alloc_str(joined)))
    }
}
