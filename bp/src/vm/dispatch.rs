//! The two dispatch back-ends.
//!
//! `Switch` decodes the opcode and branches through one big `match`
//! (`exec_sop`/`exec_rop`); `Table` indexes an opcode-indexed array of
//! handler function pointers. Both funnel into the same per-opcode
//! handlers, which is what makes them observationally equivalent; the
//! integration tests check this by running whole programs under each
//! mode and comparing output.

use once_cell::sync::Lazy;

use super::{Flow, Vm, VmFault};
use crate::bytecode::opcode::{ROp, SOp};

pub(crate) type OpHandler = for<'a> fn(&'a mut Vm) -> Result<Flow, VmFault>;

fn op_invalid(vm: &mut Vm) -> Result<Flow, VmFault> {
    // The dispatch loop advanced past the opcode byte already.
    let ip = vm.frame().ip;
    let func = vm.frame().func as usize;
    let byte = vm
        .module()
        .funcs
        .get(func)
        .and_then(|f| f.code.get(ip.wrapping_sub(1)))
        .copied()
        .unwrap_or(0);
    Err(VmFault::InvalidOpcode(byte))
}

static STACK_TABLE: Lazy<[OpHandler; 256]> = Lazy::new(|| {
    let mut table: [OpHandler; 256] = [op_invalid; 256];
    table[SOp::ConstI64 as usize] = Vm::s_const_i64;
    table[SOp::ConstF64 as usize] = Vm::s_const_f64;
    table[SOp::ConstBool as usize] = Vm::s_const_bool;
    table[SOp::ConstStr as usize] = Vm::s_const_str;
    table[SOp::ConstNull as usize] = Vm::s_const_null;
    table[SOp::ConstFunc as usize] = Vm::s_const_func;
    table[SOp::LoadLocal as usize] = Vm::s_load_local;
    table[SOp::StoreLocal as usize] = Vm::s_store_local;
    table[SOp::LoadGlobal as usize] = Vm::s_load_global;
    table[SOp::StoreGlobal as usize] = Vm::s_store_global;
    table[SOp::AddI64 as usize] = Vm::s_add_i64;
    table[SOp::SubI64 as usize] = Vm::s_sub_i64;
    table[SOp::MulI64 as usize] = Vm::s_mul_i64;
    table[SOp::DivI64 as usize] = Vm::s_div_i64;
    table[SOp::ModI64 as usize] = Vm::s_mod_i64;
    table[SOp::AddF64 as usize] = Vm::s_add_f64;
    table[SOp::SubF64 as usize] = Vm::s_sub_f64;
    table[SOp::MulF64 as usize] = Vm::s_mul_f64;
    table[SOp::DivF64 as usize] = Vm::s_div_f64;
    table[SOp::ModF64 as usize] = Vm::s_mod_f64;
    table[SOp::AddStr as usize] = Vm::s_add_str;
    table[SOp::NegI64 as usize] = Vm::s_neg_i64;
    table[SOp::NegF64 as usize] = Vm::s_neg_f64;
    table[SOp::BitAnd as usize] = Vm::s_bit_and;
    table[SOp::BitOr as usize] = Vm::s_bit_or;
    table[SOp::BitXor as usize] = Vm::s_bit_xor;
    table[SOp::Shl as usize] = Vm::s_shl;
    table[SOp::Shr as usize] = Vm::s_shr;
    table[SOp::BitNot as usize] = Vm::s_bit_not;
    table[SOp::Eq as usize] = Vm::s_eq;
    table[SOp::Ne as usize] = Vm::s_ne;
    table[SOp::LtI64 as usize] = Vm::s_lt_i64;
    table[SOp::LeI64 as usize] = Vm::s_le_i64;
    table[SOp::GtI64 as usize] = Vm::s_gt_i64;
    table[SOp::GeI64 as usize] = Vm::s_ge_i64;
    table[SOp::LtF64 as usize] = Vm::s_lt_f64;
    table[SOp::LeF64 as usize] = Vm::s_le_f64;
    table[SOp::GtF64 as usize] = Vm::s_gt_f64;
    table[SOp::GeF64 as usize] = Vm::s_ge_f64;
    table[SOp::Not as usize] = Vm::s_not;
    table[SOp::And as usize] = Vm::s_and;
    table[SOp::Or as usize] = Vm::s_or;
    table[SOp::Jmp as usize] = Vm::s_jmp;
    table[SOp::JmpIfFalse as usize] = Vm::s_jmp_if_false;
    table[SOp::JmpIfTrue as usize] = Vm::s_jmp_if_true;
    table[SOp::Call as usize] = Vm::s_call;
    table[SOp::CallBuiltin as usize] = Vm::s_call_builtin;
    table[SOp::CallValue as usize] = Vm::s_call_value;
    table[SOp::FfiCall as usize] = Vm::s_ffi_call;
    table[SOp::Ret as usize] = Vm::s_ret;
    table[SOp::Pop as usize] = Vm::s_pop;
    table[SOp::ArrayNew as usize] = Vm::s_array_new;
    table[SOp::ArrayGet as usize] = Vm::s_array_get;
    table[SOp::ArraySet as usize] = Vm::s_array_set;
    table[SOp::MapNew as usize] = Vm::s_map_new;
    table[SOp::MapGet as usize] = Vm::s_map_get;
    table[SOp::MapSet as usize] = Vm::s_map_set;
    table[SOp::StructNew as usize] = Vm::s_struct_new;
    table[SOp::StructGet as usize] = Vm::s_struct_get;
    table[SOp::StructSet as usize] = Vm::s_struct_set;
    table[SOp::ClassNew as usize] = Vm::s_class_new;
    table[SOp::ClassGet as usize] = Vm::s_class_get;
    table[SOp::ClassSet as usize] = Vm::s_class_set;
    table[SOp::MethodCall as usize] = Vm::s_method_call;
    table[SOp::SuperCall as usize] = Vm::s_super_call;
    table[SOp::TryBegin as usize] = Vm::s_try_begin;
    table[SOp::TryEnd as usize] = Vm::s_try_end;
    table[SOp::Throw as usize] = Vm::s_throw;
    table
});

static REG_TABLE: Lazy<[OpHandler; 256]> = Lazy::new(|| {
    let mut table: [OpHandler; 256] = [op_invalid; 256];
    table[ROp::ConstI64 as usize] = Vm::r_const_i64;
    table[ROp::ConstF64 as usize] = Vm::r_const_f64;
    table[ROp::ConstBool as usize] = Vm::r_const_bool;
    table[ROp::ConstStr as usize] = Vm::r_const_str;
    table[ROp::ConstNull as usize] = Vm::r_const_null;
    table[ROp::ConstFunc as usize] = Vm::r_const_func;
    table[ROp::Move as usize] = Vm::r_move;
    table[ROp::LoadGlobal as usize] = Vm::r_load_global;
    table[ROp::StoreGlobal as usize] = Vm::r_store_global;
    table[ROp::AddI64 as usize] = Vm::r_add_i64;
    table[ROp::SubI64 as usize] = Vm::r_sub_i64;
    table[ROp::MulI64 as usize] = Vm::r_mul_i64;
    table[ROp::DivI64 as usize] = Vm::r_div_i64;
    table[ROp::ModI64 as usize] = Vm::r_mod_i64;
    table[ROp::AddF64 as usize] = Vm::r_add_f64;
    table[ROp::SubF64 as usize] = Vm::r_sub_f64;
    table[ROp::MulF64 as usize] = Vm::r_mul_f64;
    table[ROp::DivF64 as usize] = Vm::r_div_f64;
    table[ROp::ModF64 as usize] = Vm::r_mod_f64;
    table[ROp::AddStr as usize] = Vm::r_add_str;
    table[ROp::NegI64 as usize] = Vm::r_neg_i64;
    table[ROp::NegF64 as usize] = Vm::r_neg_f64;
    table[ROp::BitAnd as usize] = Vm::r_bit_and;
    table[ROp::BitOr as usize] = Vm::r_bit_or;
    table[ROp::BitXor as usize] = Vm::r_bit_xor;
    table[ROp::Shl as usize] = Vm::r_shl;
    table[ROp::Shr as usize] = Vm::r_shr;
    table[ROp::BitNot as usize] = Vm::r_bit_not;
    table[ROp::EqVal as usize] = Vm::r_eq_val;
    table[ROp::NeVal as usize] = Vm::r_ne_val;
    table[ROp::EqI64 as usize] = Vm::r_eq_i64;
    table[ROp::NeI64 as usize] = Vm::r_ne_i64;
    table[ROp::LtI64 as usize] = Vm::r_lt_i64;
    table[ROp::LeI64 as usize] = Vm::r_le_i64;
    table[ROp::GtI64 as usize] = Vm::r_gt_i64;
    table[ROp::GeI64 as usize] = Vm::r_ge_i64;
    table[ROp::LtF64 as usize] = Vm::r_lt_f64;
    table[ROp::LeF64 as usize] = Vm::r_le_f64;
    table[ROp::GtF64 as usize] = Vm::r_gt_f64;
    table[ROp::GeF64 as usize] = Vm::r_ge_f64;
    table[ROp::Not as usize] = Vm::r_not;
    table[ROp::And as usize] = Vm::r_and;
    table[ROp::Or as usize] = Vm::r_or;
    table[ROp::Jmp as usize] = Vm::r_jmp;
    table[ROp::JmpIfFalse as usize] = Vm::r_jmp_if_false;
    table[ROp::JmpIfTrue as usize] = Vm::r_jmp_if_true;
    table[ROp::Call as usize] = Vm::r_call;
    table[ROp::CallBuiltin as usize] = Vm::r_call_builtin;
    table[ROp::CallValue as usize] = Vm::r_call_value;
    table[ROp::FfiCall as usize] = Vm::r_ffi_call;
    table[ROp::Ret as usize] = Vm::r_ret;
    table[ROp::ArrayNew as usize] = Vm::r_array_new;
    table[ROp::ArrayGet as usize] = Vm::r_array_get;
    table[ROp::ArraySet as usize] = Vm::r_array_set;
    table[ROp::MapNew as usize] = Vm::r_map_new;
    table[ROp::MapGet as usize] = Vm::r_map_get;
    table[ROp::MapSet as usize] = Vm::r_map_set;
    table[ROp::StructNew as usize] = Vm::r_struct_new;
    table[ROp::StructGet as usize] = Vm::r_struct_get;
    table[ROp::StructSet as usize] = Vm::r_struct_set;
    table[ROp::ClassNew as usize] = Vm::r_class_new;
    table[ROp::ClassGet as usize] = Vm::r_class_get;
    table[ROp::ClassSet as usize] = Vm::r_class_set;
    table[ROp::MethodCall as usize] = Vm::r_method_call;
    table[ROp::SuperCall as usize] = Vm::r_super_call;
    table[ROp::TryBegin as usize] = Vm::r_try_begin;
    table[ROp::TryEnd as usize] = Vm::r_try_end;
    table[ROp::Throw as usize] = Vm::r_throw;
    table
});

impl Vm {
    pub(crate) fn loop_stack_switch(&mut self) -> Result<i32, VmFault> {
        loop {
            if self.exiting() {
                return Ok(self.exit_code());
            }
            let byte = self.fetch_u8()?;
            let Some(op) = SOp::from_u8(byte) else {
                return Err(VmFault::InvalidOpcode(byte));
            };
            match self.exec_sop(op)? {
                Flow::Continue => {}
                Flow::Halt => return Ok(self.exit_code()),
            }
        }
    }

    pub(crate) fn loop_stack_table(&mut self) -> Result<i32, VmFault> {
        let table = &*STACK_TABLE;
        loop {
            if self.exiting() {
                return Ok(self.exit_code());
            }
            let byte = self.fetch_u8()?;
            match table[byte as usize](self)? {
                Flow::Continue => {}
                Flow::Halt => return Ok(self.exit_code()),
            }
        }
    }

    pub(crate) fn loop_reg_switch(&mut self) -> Result<i32, VmFault> {
        loop {
            if self.exiting() {
                return Ok(self.exit_code());
            }
            let byte = self.fetch_u8()?;
            let Some(op) = ROp::from_u8(byte) else {
                return Err(VmFault::InvalidOpcode(byte));
            };
            match self.exec_rop(op)? {
                Flow::Continue => {}
                Flow::Halt => return Ok(self.exit_code()),
            }
        }
    }

    pub(crate) fn loop_reg_table(&mut self) -> Result<i32, VmFault> {
        let table = &*REG_TABLE;
        loop {
            if self.exiting() {
                return Ok(self.exit_code());
            }
            let byte = self.fetch_u8()?;
            match table[byte as usize](self)? {
                Flow::Continue => {}
                Flow::Halt => return Ok(self.exit_code()),
            }
        }
    }
}
