//! Bytecode verifier.
//!
//! Decodes every function body once, recording instruction boundaries
//! and jump targets, and checks the static invariants the interpreter
//! and JIT rely on: every jump lands on an instruction boundary inside
//! the body, every register operand is below the function's register
//! count, and every call/string/class/extern operand indexes into the
//! owning table.

use std::collections::HashSet;

use super::opcode::{CodeReader, ROp, SOp, NO_FINALLY};
use super::{BpFunction, BpModule, CodeFormat, LinkError};
use crate::vm::error::VmFault;

pub fn verify_module(module: &BpModule) -> Result<(), LinkError> {
    for func in &module.funcs {
        match func.format {
            CodeFormat::Stack => verify_stack_func(module, func)?,
            CodeFormat::Register => verify_register_func(module, func)?,
        }
    }
    Ok(())
}

fn malformed(func: &BpFunction, detail: impl Into<String>) -> LinkError {
    LinkError::Malformed {
        func: func.name.clone(),
        detail: detail.into(),
    }
}

fn decode_err(func: &BpFunction, fault: VmFault) -> LinkError {
    malformed(func, format!("truncated instruction: {}", fault))
}

fn check_jumps(
    func: &BpFunction,
    boundaries: &HashSet<u32>,
    targets: &[u32],
) -> Result<(), LinkError> {
    for &target in targets {
        if !boundaries.contains(&target) {
            return Err(LinkError::BadJumpTarget {
                func: func.name.clone(),
                target,
            });
        }
    }
    Ok(())
}

fn check_str(func: &BpFunction, local_id: u32) -> Result<(), LinkError> {
    if local_id as usize >= func.str_refs.len() {
        return Err(LinkError::BadStringRef {
            func: func.name.clone(),
            index: local_id,
        });
    }
    Ok(())
}

fn check_call(module: &BpModule, func: &BpFunction, index: u32) -> Result<(), LinkError> {
    if index as usize >= module.funcs.len() {
        return Err(LinkError::BadFunctionIndex {
            func: func.name.clone(),
            index,
        });
    }
    Ok(())
}

fn verify_stack_func(module: &BpModule, func: &BpFunction) -> Result<(), LinkError> {
    let mut reader = CodeReader::new(&func.code, 0);
    let mut boundaries: HashSet<u32> = HashSet::new();
    let mut targets: Vec<u32> = Vec::new();

    while !reader.at_end() {
        boundaries.insert(reader.ip as u32);
        let byte = reader.u8().map_err(|e| decode_err(func, e))?;
        let op = SOp::from_u8(byte)
            .ok_or_else(|| malformed(func, format!("invalid opcode 0x{:02x}", byte)))?;
        match op {
            SOp::ConstI64 | SOp::ConstF64 => {
                reader.i64().map_err(|e| decode_err(func, e))?;
            }
            SOp::ConstBool => {
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            SOp::ConstStr => {
                let id = reader.u32().map_err(|e| decode_err(func, e))?;
                check_str(func, id)?;
            }
            SOp::ConstFunc => {
                let fidx = reader.u32().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx)?;
            }
            SOp::LoadLocal | SOp::StoreLocal => {
                let slot = reader.u16().map_err(|e| decode_err(func, e))?;
                if slot >= func.locals {
                    return Err(malformed(
                        func,
                        format!("local slot {} outside {} locals", slot, func.locals),
                    ));
                }
            }
            SOp::LoadGlobal | SOp::StoreGlobal => {
                let slot = reader.u16().map_err(|e| decode_err(func, e))?;
                if slot as u32 >= module.global_count {
                    return Err(malformed(func, format!("global slot {} out of range", slot)));
                }
            }
            SOp::Jmp | SOp::JmpIfFalse | SOp::JmpIfTrue => {
                targets.push(reader.u32().map_err(|e| decode_err(func, e))?);
            }
            SOp::Call => {
                let fidx = reader.u32().map_err(|e| decode_err(func, e))?;
                reader.u16().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx)?;
            }
            SOp::CallBuiltin => {
                reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u16().map_err(|e| decode_err(func, e))?;
            }
            SOp::CallValue => {
                reader.u16().map_err(|e| decode_err(func, e))?;
            }
            SOp::FfiCall => {
                let ext = reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u8().map_err(|e| decode_err(func, e))?;
                if ext as usize >= module.extern_funcs.len() {
                    return Err(malformed(func, format!("extern id {} out of range", ext)));
                }
            }
            SOp::ArrayNew | SOp::MapNew => {
                reader.u32().map_err(|e| decode_err(func, e))?;
            }
            SOp::StructNew => {
                reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u16().map_err(|e| decode_err(func, e))?;
            }
            SOp::StructGet | SOp::StructSet | SOp::ClassGet | SOp::ClassSet => {
                reader.u16().map_err(|e| decode_err(func, e))?;
            }
            SOp::ClassNew => {
                let cid = reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u8().map_err(|e| decode_err(func, e))?;
                if cid as usize >= module.class_types.len() {
                    return Err(malformed(func, format!("class id {} out of range", cid)));
                }
            }
            SOp::MethodCall => {
                reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            SOp::SuperCall => {
                let fidx = reader.u16().map_err(|e| decode_err(func, e))?;
                reader.u8().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx as u32)?;
            }
            SOp::TryBegin => {
                let catch = reader.u32().map_err(|e| decode_err(func, e))?;
                let finally = reader.u32().map_err(|e| decode_err(func, e))?;
                reader.u16().map_err(|e| decode_err(func, e))?;
                targets.push(catch);
                if finally != NO_FINALLY {
                    targets.push(finally);
                }
            }
            // No operands.
            SOp::ConstNull
            | SOp::AddI64
            | SOp::SubI64
            | SOp::MulI64
            | SOp::DivI64
            | SOp::ModI64
            | SOp::AddF64
            | SOp::SubF64
            | SOp::MulF64
            | SOp::DivF64
            | SOp::ModF64
            | SOp::AddStr
            | SOp::NegI64
            | SOp::NegF64
            | SOp::BitAnd
            | SOp::BitOr
            | SOp::BitXor
            | SOp::Shl
            | SOp::Shr
            | SOp::BitNot
            | SOp::Eq
            | SOp::Ne
            | SOp::LtI64
            | SOp::LeI64
            | SOp::GtI64
            | SOp::GeI64
            | SOp::LtF64
            | SOp::LeF64
            | SOp::GtF64
            | SOp::GeF64
            | SOp::Not
            | SOp::And
            | SOp::Or
            | SOp::Ret
            | SOp::Pop
            | SOp::ArrayGet
            | SOp::ArraySet
            | SOp::MapGet
            | SOp::MapSet
            | SOp::TryEnd
            | SOp::Throw => {}
        }
    }

    check_jumps(func, &boundaries, &targets)
}

fn verify_register_func(module: &BpModule, func: &BpFunction) -> Result<(), LinkError> {
    let mut reader = CodeReader::new(&func.code, 0);
    let mut boundaries: HashSet<u32> = HashSet::new();
    let mut targets: Vec<u32> = Vec::new();
    let mut regs: Vec<u8> = Vec::new();

    macro_rules! reg {
        ($r:expr) => {
            regs.push($r)
        };
    }

    while !reader.at_end() {
        boundaries.insert(reader.ip as u32);
        regs.clear();
        let byte = reader.u8().map_err(|e| decode_err(func, e))?;
        let op = ROp::from_u8(byte)
            .ok_or_else(|| malformed(func, format!("invalid opcode 0x{:02x}", byte)))?;
        match op {
            ROp::ConstI64 | ROp::ConstF64 => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.i64().map_err(|e| decode_err(func, e))?;
            }
            ROp::ConstBool => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::ConstStr => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let id = reader.u32().map_err(|e| decode_err(func, e))?;
                check_str(func, id)?;
            }
            ROp::ConstNull => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
            }
            ROp::ConstFunc => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let fidx = reader.u32().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx)?;
            }
            ROp::Move
            | ROp::NegI64
            | ROp::NegF64
            | ROp::BitNot
            | ROp::Not => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
            }
            ROp::LoadGlobal => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let slot = reader.u16().map_err(|e| decode_err(func, e))?;
                if slot as u32 >= module.global_count {
                    return Err(malformed(func, format!("global slot {} out of range", slot)));
                }
            }
            ROp::StoreGlobal => {
                let slot = reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                if slot as u32 >= module.global_count {
                    return Err(malformed(func, format!("global slot {} out of range", slot)));
                }
            }
            ROp::AddI64
            | ROp::SubI64
            | ROp::MulI64
            | ROp::DivI64
            | ROp::ModI64
            | ROp::AddF64
            | ROp::SubF64
            | ROp::MulF64
            | ROp::DivF64
            | ROp::ModF64
            | ROp::AddStr
            | ROp::BitAnd
            | ROp::BitOr
            | ROp::BitXor
            | ROp::Shl
            | ROp::Shr
            | ROp::EqVal
            | ROp::NeVal
            | ROp::EqI64
            | ROp::NeI64
            | ROp::LtI64
            | ROp::LeI64
            | ROp::GtI64
            | ROp::GeI64
            | ROp::LtF64
            | ROp::LeF64
            | ROp::GtF64
            | ROp::GeF64
            | ROp::And
            | ROp::Or
            | ROp::ArrayGet
            | ROp::ArraySet
            | ROp::MapGet
            | ROp::MapSet => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
            }
            ROp::Jmp => {
                targets.push(reader.u32().map_err(|e| decode_err(func, e))?);
            }
            ROp::JmpIfFalse | ROp::JmpIfTrue => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                targets.push(reader.u32().map_err(|e| decode_err(func, e))?);
            }
            ROp::Call => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let fidx = reader.u32().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx)?;
            }
            ROp::CallBuiltin => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::CallValue => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::FfiCall => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let ext = reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
                if ext as usize >= module.extern_funcs.len() {
                    return Err(malformed(func, format!("extern id {} out of range", ext)));
                }
            }
            ROp::Ret | ROp::Throw => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
            }
            ROp::ArrayNew | ROp::MapNew => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::StructNew => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::StructGet | ROp::ClassGet => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u16().map_err(|e| decode_err(func, e))?;
            }
            ROp::StructSet | ROp::ClassSet => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
            }
            ROp::ClassNew => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let cid = reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
                if cid as usize >= module.class_types.len() {
                    return Err(malformed(func, format!("class id {} out of range", cid)));
                }
            }
            ROp::MethodCall => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
            }
            ROp::SuperCall => {
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                let fidx = reader.u16().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                reader.u8().map_err(|e| decode_err(func, e))?;
                check_call(module, func, fidx as u32)?;
            }
            ROp::TryBegin => {
                let catch = reader.u32().map_err(|e| decode_err(func, e))?;
                let finally = reader.u32().map_err(|e| decode_err(func, e))?;
                reg!(reader.u8().map_err(|e| decode_err(func, e))?);
                targets.push(catch);
                if finally != NO_FINALLY {
                    targets.push(finally);
                }
            }
            ROp::TryEnd => {}
        }
        for &r in &regs {
            if r as u16 >= func.reg_count {
                return Err(LinkError::BadRegister {
                    func: func.name.clone(),
                    reg: r,
                    reg_count: func.reg_count,
                });
            }
        }
    }

    check_jumps(func, &boundaries, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::CodeWriter;

    fn stack_func(code: Vec<u8>, locals: u16) -> BpModule {
        BpModule {
            funcs: vec![BpFunction {
                name: "f".to_string(),
                arity: 0,
                locals,
                reg_count: 0,
                format: CodeFormat::Stack,
                int_return: false,
                str_refs: vec![],
                code,
            }],
            strings: vec![],
            entry: 0,
            global_count: 0,
            class_types: vec![],
            extern_funcs: vec![],
        }
    }

    #[test]
    fn test_valid_stack_function_passes() {
        let mut w = CodeWriter::new();
        w.sop(SOp::ConstI64);
        w.i64(1);
        w.sop(SOp::Ret);
        assert!(stack_func(w.code, 0).validate().is_ok());
    }

    #[test]
    fn test_jump_into_operand_is_rejected() {
        let mut w = CodeWriter::new();
        w.sop(SOp::Jmp);
        w.u32(2); // middle of this very instruction's operand
        w.sop(SOp::Ret);
        let err = stack_func(w.code, 0).validate().unwrap_err();
        assert!(matches!(err, LinkError::BadJumpTarget { target: 2, .. }));
    }

    #[test]
    fn test_local_slot_out_of_range_is_rejected() {
        let mut w = CodeWriter::new();
        w.sop(SOp::LoadLocal);
        w.u16(3);
        w.sop(SOp::Ret);
        assert!(stack_func(w.code, 2).validate().is_err());
    }

    #[test]
    fn test_register_bound_is_enforced() {
        let mut w = CodeWriter::new();
        w.rop(ROp::ConstI64);
        w.u8(5);
        w.i64(0);
        w.rop(ROp::Ret);
        w.u8(5);
        let module = BpModule {
            funcs: vec![BpFunction {
                name: "f".to_string(),
                arity: 0,
                locals: 0,
                reg_count: 4,
                format: CodeFormat::Register,
                int_return: false,
                str_refs: vec![],
                code: w.code,
            }],
            ..Default::default()
        };
        let err = module.validate().unwrap_err();
        assert!(matches!(err, LinkError::BadRegister { reg: 5, .. }));
    }

    #[test]
    fn test_call_target_out_of_range() {
        let mut w = CodeWriter::new();
        w.sop(SOp::Call);
        w.u32(9);
        w.u16(0);
        w.sop(SOp::Ret);
        let err = stack_func(w.code, 0).validate().unwrap_err();
        assert!(matches!(err, LinkError::BadFunctionIndex { index: 9, .. }));
    }
}
