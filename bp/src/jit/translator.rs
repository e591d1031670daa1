//! Register-bytecode to x86-64 translation.
//!
//! Template compilation over the integer subset: constants, moves,
//! integer add/sub/mul and bitwise ops, integer comparisons, boolean
//! logic, jumps and returns. Division and remainder are NOT in the
//! subset: a zero divisor must raise the VM fault and `i64::MIN / -1`
//! must wrap, and raw IDIV does neither, so a function containing them
//! bails out and stays interpreted. Anything heap-shaped, any call,
//! floats and exception machinery bail the whole function out too.
//!
//! ABI: `extern "C" fn(regs: *mut i64) -> i64`. The caller materializes
//! the function's register window as an i64 array (integer payloads);
//! every virtual register access becomes `[rbx + vreg*8]` with the
//! window base cached in rbx. rax and rcx are the scratch pair.

use std::collections::HashMap;

use super::emitter::{Asm, Cc, JitError, Label, Reg};
use crate::bytecode::opcode::{CodeReader, ROp};
use crate::bytecode::{BpFunction, CodeFormat};

const SCRATCH_A: Reg = Reg::Rax;
const SCRATCH_B: Reg = Reg::Rcx;
/// Callee-saved home of the register-window base.
const WINDOW: Reg = Reg::Rbx;

fn vreg_disp(r: u8) -> i32 {
    r as i32 * 8
}

/// First pass: check every opcode is in the supported subset and
/// collect the set of jump targets.
fn scan(func: &BpFunction) -> Result<Vec<u32>, JitError> {
    let mut reader = CodeReader::new(&func.code, 0);
    let mut targets = Vec::new();
    let bad = |_| JitError::Unsupported("truncated code");
    while !reader.at_end() {
        let byte = reader.u8().map_err(bad)?;
        let Some(op) = ROp::from_u8(byte) else {
            return Err(JitError::Unsupported("invalid opcode"));
        };
        match op {
            ROp::ConstI64 => {
                reader.u8().map_err(bad)?;
                reader.i64().map_err(bad)?;
            }
            ROp::ConstBool => {
                reader.u8().map_err(bad)?;
                reader.u8().map_err(bad)?;
            }
            ROp::Move
            | ROp::NegI64
            | ROp::BitNot
            | ROp::Not => {
                reader.u8().map_err(bad)?;
                reader.u8().map_err(bad)?;
            }
            ROp::AddI64
            | ROp::SubI64
            | ROp::MulI64
            | ROp::BitAnd
            | ROp::BitOr
            | ROp::BitXor
            | ROp::Shl
            | ROp::Shr
            | ROp::EqI64
            | ROp::NeI64
            | ROp::LtI64
            | ROp::LeI64
            | ROp::GtI64
            | ROp::GeI64
            | ROp::And
            | ROp::Or => {
                reader.u8().map_err(bad)?;
                reader.u8().map_err(bad)?;
                reader.u8().map_err(bad)?;
            }
            ROp::Jmp => {
                targets.push(reader.u32().map_err(bad)?);
            }
            ROp::JmpIfFalse | ROp::JmpIfTrue => {
                reader.u8().map_err(bad)?;
                targets.push(reader.u32().map_err(bad)?);
            }
            ROp::Ret => {
                reader.u8().map_err(bad)?;
            }
            other => return Err(JitError::Unsupported(other.name())),
        }
    }
    Ok(targets)
}

/// Translate a register-format function into native code bytes.
pub fn translate(func: &BpFunction) -> Result<Vec<u8>, JitError> {
    if func.format != CodeFormat::Register {
        return Err(JitError::Unsupported("stack-format function"));
    }
    if !func.int_return {
        return Err(JitError::Unsupported("non-integer return"));
    }
    let targets = scan(func)?;

    let mut asm = Asm::new();
    let mut labels: HashMap<u32, Label> = HashMap::new();
    for &t in &targets {
        labels.entry(t).or_insert_with(|| asm.new_label());
    }
    let epilogue = asm.new_label();

    // Prologue: save callee-saved state, cache the window base.
    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    asm.push(WINDOW);
    asm.mov_rr(WINDOW, Reg::Rdi);

    let load = |asm: &mut Asm, dst: Reg, vreg: u8| {
        asm.mov_r_mem(dst, WINDOW, vreg_disp(vreg));
    };
    let store = |asm: &mut Asm, vreg: u8, src: Reg| {
        asm.mov_mem_r(WINDOW, vreg_disp(vreg), src);
    };

    let mut reader = CodeReader::new(&func.code, 0);
    let bad = |_| JitError::Unsupported("truncated code");
    while !reader.at_end() {
        if let Some(label) = labels.get(&(reader.ip as u32)) {
            asm.bind(*label);
        }
        let op = ROp::from_u8(reader.u8().map_err(bad)?)
            .ok_or(JitError::Unsupported("invalid opcode"))?;
        match op {
            ROp::ConstI64 => {
                let dst = reader.u8().map_err(bad)?;
                let imm = reader.i64().map_err(bad)?;
                asm.mov_ri(SCRATCH_A, imm);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::ConstBool => {
                let dst = reader.u8().map_err(bad)?;
                let v = reader.u8().map_err(bad)?;
                asm.mov_ri(SCRATCH_A, v as i64);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::Move => {
                let dst = reader.u8().map_err(bad)?;
                let src = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, src);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::AddI64 | ROp::SubI64 | ROp::MulI64 | ROp::BitAnd | ROp::BitOr
            | ROp::BitXor | ROp::And | ROp::Or => {
                let dst = reader.u8().map_err(bad)?;
                let a = reader.u8().map_err(bad)?;
                let b = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, a);
                load(&mut asm, SCRATCH_B, b);
                match op {
                    ROp::AddI64 => asm.add_rr(SCRATCH_A, SCRATCH_B),
                    ROp::SubI64 => asm.sub_rr(SCRATCH_A, SCRATCH_B),
                    ROp::MulI64 => asm.imul_rr(SCRATCH_A, SCRATCH_B),
                    ROp::BitAnd | ROp::And => asm.and_rr(SCRATCH_A, SCRATCH_B),
                    ROp::BitOr | ROp::Or => asm.or_rr(SCRATCH_A, SCRATCH_B),
                    ROp::BitXor => asm.xor_rr(SCRATCH_A, SCRATCH_B),
                    _ => unreachable!(),
                }
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::Shl | ROp::Shr => {
                let dst = reader.u8().map_err(bad)?;
                let a = reader.u8().map_err(bad)?;
                let b = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, a);
                load(&mut asm, SCRATCH_B, b);
                if op == ROp::Shl {
                    asm.shl_cl(SCRATCH_A);
                } else {
                    asm.sar_cl(SCRATCH_A);
                }
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::NegI64 => {
                let dst = reader.u8().map_err(bad)?;
                let src = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, src);
                asm.neg(SCRATCH_A);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::BitNot => {
                let dst = reader.u8().map_err(bad)?;
                let src = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, src);
                asm.not(SCRATCH_A);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::Not => {
                let dst = reader.u8().map_err(bad)?;
                let src = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, src);
                asm.xor_ri32(SCRATCH_A, 1);
                store(&mut asm, dst, SCRATCH_A);
            }
            ROp::EqI64 | ROp::NeI64 | ROp::LtI64 | ROp::LeI64 | ROp::GtI64
            | ROp::GeI64 => {
                let dst = reader.u8().map_err(bad)?;
                let a = reader.u8().map_err(bad)?;
                let b = reader.u8().map_err(bad)?;
                load(&mut asm, SCRATCH_A, a);
                load(&mut asm, SCRATCH_B, b);
                asm.cmp_rr(SCRATCH_A, SCRATCH_B);
                let cc = match op {
                    ROp::EqI64 => Cc::E,
                    ROp::NeI64 => Cc::Ne,
                    ROp::LtI64 => Cc::L,
                    ROp::LeI64 => Cc::Le,
                    ROp::GtI64 => Cc::G,
                    ROp::GeI64 => Cc::Ge,
                    _ => unreachable!(),
                };
                asm.setcc_al(cc);
                asm.movzx_rax_al();
                store(&mut asm, dst, Reg::Rax);
            }
            ROp::Jmp => {
                let target = reader.u32().map_err(bad)?;
                let label = labels[&target];
                asm.jmp(label);
            }
            ROp::JmpIfFalse | ROp::JmpIfTrue => {
                let cond = reader.u8().map_err(bad)?;
                let target = reader.u32().map_err(bad)?;
                let label = labels[&target];
                load(&mut asm, SCRATCH_A, cond);
                asm.test_rr(SCRATCH_A, SCRATCH_A);
                asm.jcc(
                    if op == ROp::JmpIfFalse { Cc::E } else { Cc::Ne },
                    label,
                );
            }
            ROp::Ret => {
                let src = reader.u8().map_err(bad)?;
                load(&mut asm, Reg::Rax, src);
                asm.jmp(epilogue);
            }
            other => return Err(JitError::Unsupported(other.name())),
        }
    }

    // Shared epilogue: every RET funnels here.
    asm.bind(epilogue);
    asm.pop(WINDOW);
    asm.pop(Reg::Rbp);
    asm.ret();

    asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::CodeWriter;

    fn reg_func(code: Vec<u8>, arity: u16, reg_count: u16) -> BpFunction {
        BpFunction {
            name: "f".to_string(),
            arity,
            locals: 0,
            reg_count,
            format: CodeFormat::Register,
            int_return: true,
            str_refs: vec![],
            code,
        }
    }

    #[test]
    fn test_supported_subset_translates() {
        // r2 = r0 + r1; return r2
        let mut w = CodeWriter::new();
        w.rop(ROp::AddI64);
        w.u8(2);
        w.u8(0);
        w.u8(1);
        w.rop(ROp::Ret);
        w.u8(2);
        let code = translate(&reg_func(w.code, 2, 3)).unwrap();
        assert!(!code.is_empty());
        // Prologue starts with push rbp.
        assert_eq!(code[0], 0x55);
        // Epilogue ends with ret.
        assert_eq!(*code.last().unwrap(), 0xc3);
    }

    #[test]
    fn test_heap_opcode_bails() {
        let mut w = CodeWriter::new();
        w.rop(ROp::ArrayNew);
        w.u8(0);
        w.u8(0);
        w.u8(0);
        w.rop(ROp::Ret);
        w.u8(0);
        let err = translate(&reg_func(w.code, 0, 1)).unwrap_err();
        assert!(matches!(err, JitError::Unsupported("ArrayNew")));
    }

    #[test]
    fn test_call_opcode_bails() {
        let mut w = CodeWriter::new();
        w.rop(ROp::Call);
        w.u8(0);
        w.u32(0);
        w.u8(0);
        w.u8(0);
        let err = translate(&reg_func(w.code, 0, 1)).unwrap_err();
        assert!(matches!(err, JitError::Unsupported("Call")));
    }

    #[test]
    fn test_float_opcode_bails() {
        let mut w = CodeWriter::new();
        w.rop(ROp::AddF64);
        w.u8(0);
        w.u8(0);
        w.u8(0);
        let err = translate(&reg_func(w.code, 0, 1)).unwrap_err();
        assert!(matches!(err, JitError::Unsupported("AddF64")));
    }

    #[test]
    fn test_division_and_remainder_bail() {
        // The interpreter faults on a zero divisor and wraps MIN / -1;
        // native IDIV would trap on both, so these opcodes stay out of
        // the supported subset.
        for (op, name) in [(ROp::DivI64, "DivI64"), (ROp::ModI64, "ModI64")] {
            let mut w = CodeWriter::new();
            w.rop(op);
            w.u8(2);
            w.u8(0);
            w.u8(1);
            w.rop(ROp::Ret);
            w.u8(2);
            let err = translate(&reg_func(w.code, 2, 3)).unwrap_err();
            assert_eq!(err, JitError::Unsupported(name));
        }
    }

    #[test]
    fn test_non_int_return_bails() {
        let mut w = CodeWriter::new();
        w.rop(ROp::Ret);
        w.u8(0);
        let mut func = reg_func(w.code, 0, 1);
        func.int_return = false;
        assert!(matches!(
            translate(&func),
            Err(JitError::Unsupported("non-integer return"))
        ));
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    mod native {
        use super::*;
        use crate::jit::cache::CodeBuffer;

        fn run_native(func: &BpFunction, regs: &mut [i64]) -> i64 {
            let code = translate(func).unwrap();
            let mut cache = CodeBuffer::with_size(64 * 1024).unwrap();
            let ptr = cache.alloc(&code).unwrap();
            let f: unsafe extern "C" fn(*mut i64) -> i64 =
                unsafe { std::mem::transmute(ptr) };
            unsafe { f(regs.as_mut_ptr()) }
        }

        #[test]
        fn test_native_add() {
            let mut w = CodeWriter::new();
            w.rop(ROp::AddI64);
            w.u8(2);
            w.u8(0);
            w.u8(1);
            w.rop(ROp::Ret);
            w.u8(2);
            let func = reg_func(w.code, 2, 3);
            let mut regs = [17, 25, 0];
            assert_eq!(run_native(&func, &mut regs), 42);
        }

        #[test]
        fn test_native_loop_sums() {
            // r1 = 0; r2 = 0;
            // loop: if !(r2 < r0) exit; r1 += r2; r2 += 1; jmp loop
            // return r1
            let mut w = CodeWriter::new();
            w.rop(ROp::ConstI64);
            w.u8(1);
            w.i64(0);
            w.rop(ROp::ConstI64);
            w.u8(2);
            w.i64(0);
            let loop_start = w.here() as u32;
            w.rop(ROp::LtI64);
            w.u8(3);
            w.u8(2);
            w.u8(0);
            w.rop(ROp::JmpIfFalse);
            w.u8(3);
            let exit_hole = w.hole_u32();
            w.rop(ROp::AddI64);
            w.u8(1);
            w.u8(1);
            w.u8(2);
            w.rop(ROp::ConstI64);
            w.u8(4);
            w.i64(1);
            w.rop(ROp::AddI64);
            w.u8(2);
            w.u8(2);
            w.u8(4);
            w.rop(ROp::Jmp);
            w.u32(loop_start);
            let exit = w.here() as u32;
            w.patch_u32(exit_hole, exit);
            w.rop(ROp::Ret);
            w.u8(1);
            let func = reg_func(w.code, 1, 5);
            let mut regs = [100, 0, 0, 0, 0];
            assert_eq!(run_native(&func, &mut regs), 4950);
        }

        #[test]
        fn test_native_bitwise_and_shifts() {
            // r3 = ((r0 & r1) << 2) ^ (r0 >> 1)
            let mut w = CodeWriter::new();
            w.rop(ROp::BitAnd);
            w.u8(3);
            w.u8(0);
            w.u8(1);
            w.rop(ROp::ConstI64);
            w.u8(4);
            w.i64(2);
            w.rop(ROp::Shl);
            w.u8(3);
            w.u8(3);
            w.u8(4);
            w.rop(ROp::ConstI64);
            w.u8(4);
            w.i64(1);
            w.rop(ROp::Shr);
            w.u8(4);
            w.u8(0);
            w.u8(4);
            w.rop(ROp::BitXor);
            w.u8(3);
            w.u8(3);
            w.u8(4);
            w.rop(ROp::Ret);
            w.u8(3);
            let func = reg_func(w.code, 2, 5);
            let mut regs = [0b1101, 0b1011, 0, 0, 0];
            assert_eq!(
                run_native(&func, &mut regs),
                ((0b1101i64 & 0b1011) << 2) ^ (0b1101 >> 1)
            );
        }
    }
}
