//! x86-64 instruction emitter.
//!
//! Assembles into a byte buffer with label-based jumps: forward
//! references record fixups that a second pass resolves to rel8 or
//! rel32 displacements once every label is bound. A rel8 fixup whose
//! target lands out of range fails the compilation rather than
//! silently widening.
//!
//! Memory operands are always `[base + disp32]`, which is all the
//! translator needs for its register-window loads and stores.

/// General-purpose registers, numbered as the hardware encodes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn low(self) -> u8 {
        self as u8 & 7
    }

    fn ext(self) -> bool {
        self as u8 >= 8
    }
}

/// SSE registers for the float opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

/// Condition codes (the low nibble of SETcc/Jcc encodings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
pub enum Cc {
    E = 0x4,
    Ne = 0x5,
    B = 0x2,
    Ae = 0x3,
    Be = 0x6,
    A = 0x7,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Rel8,
    Rel32,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the displacement field.
    at: usize,
    label: usize,
    kind: FixupKind,
}

/// Why a function could not be compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum JitError {
    Unsupported(&'static str),
    RelOverflow,
    CacheFull,
    UnboundLabel,
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::Unsupported(op) => write!(f, "unsupported opcode {}", op),
            JitError::RelOverflow => write!(f, "jump displacement out of range"),
            JitError::CacheFull => write!(f, "code cache exhausted"),
            JitError::UnboundLabel => write!(f, "jump to an unbound label"),
        }
    }
}

impl std::error::Error for JitError {}

#[derive(Debug, Default)]
pub struct Asm {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    // --- labels --------------------------------------------------------

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.buf.len());
    }

    /// Resolve all fixups and hand back the finished code.
    pub fn finish(mut self) -> Result<Vec<u8>, JitError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label].ok_or(JitError::UnboundLabel)?;
            match fixup.kind {
                FixupKind::Rel32 => {
                    let rel = target as i64 - (fixup.at as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| JitError::RelOverflow)?;
                    self.buf[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                FixupKind::Rel8 => {
                    let rel = target as i64 - (fixup.at as i64 + 1);
                    let rel = i8::try_from(rel).map_err(|_| JitError::RelOverflow)?;
                    self.buf[fixup.at] = rel as u8;
                }
            }
        }
        Ok(self.buf)
    }

    // --- encoding helpers ----------------------------------------------

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn rex_w(&mut self, reg: u8, rm: u8) {
        self.byte(0x48 | ((reg >> 3) << 2) | (rm >> 3));
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte((md << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM + optional SIB for `[base + disp32]`.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        self.modrm(0b10, reg & 7, base.low());
        if base.low() == 4 {
            // rsp/r12 as base needs a SIB byte.
            self.byte(0x24);
        }
        self.buf.extend_from_slice(&disp.to_le_bytes());
    }

    // --- moves ---------------------------------------------------------

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src as u8, dst as u8);
        self.byte(0x89);
        self.modrm(0b11, src.low(), dst.low());
    }

    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        self.byte(0x48 | if dst.ext() { 1 } else { 0 });
        self.byte(0xb8 + dst.low());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov dst, [base + disp]`
    pub fn mov_r_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst as u8, base as u8);
        self.byte(0x8b);
        self.mem(dst as u8, base, disp);
    }

    /// `mov [base + disp], src`
    pub fn mov_mem_r(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src as u8, base as u8);
        self.byte(0x89);
        self.mem(src as u8, base, disp);
    }

    // --- integer arithmetic ---------------------------------------------

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_w(src as u8, dst as u8);
        self.byte(opcode);
        self.modrm(0b11, src.low(), dst.low());
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst as u8, src as u8);
        self.byte(0x0f);
        self.byte(0xaf);
        self.modrm(0b11, dst.low(), src.low());
    }

    pub fn neg(&mut self, r: Reg) {
        self.rex_w(0, r as u8);
        self.byte(0xf7);
        self.modrm(0b11, 3, r.low());
    }

    pub fn not(&mut self, r: Reg) {
        self.rex_w(0, r as u8);
        self.byte(0xf7);
        self.modrm(0b11, 2, r.low());
    }

    /// Sign-extend rax into rdx:rax (pairs with idiv).
    pub fn cqo(&mut self) {
        self.byte(0x48);
        self.byte(0x99);
    }

    pub fn idiv(&mut self, r: Reg) {
        self.rex_w(0, r as u8);
        self.byte(0xf7);
        self.modrm(0b11, 7, r.low());
    }

    pub fn xor_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w(0, dst as u8);
        self.byte(0x81);
        self.modrm(0b11, 6, dst.low());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `shl r, cl`
    pub fn shl_cl(&mut self, r: Reg) {
        self.rex_w(0, r as u8);
        self.byte(0xd3);
        self.modrm(0b11, 4, r.low());
    }

    /// `sar r, cl` (arithmetic right shift)
    pub fn sar_cl(&mut self, r: Reg) {
        self.rex_w(0, r as u8);
        self.byte(0xd3);
        self.modrm(0b11, 7, r.low());
    }

    // --- compares --------------------------------------------------------

    pub fn cmp_rr(&mut self, lhs: Reg, rhs: Reg) {
        self.alu_rr(0x39, lhs, rhs);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.alu_rr(0x85, a, b);
    }

    /// `setcc al`
    pub fn setcc_al(&mut self, cc: Cc) {
        self.byte(0x0f);
        self.byte(0x90 | cc as u8);
        self.modrm(0b11, 0, 0);
    }

    /// `movzx eax, al` (zero-extends through rax)
    pub fn movzx_rax_al(&mut self) {
        self.byte(0x0f);
        self.byte(0xb6);
        self.modrm(0b11, 0, 0);
    }

    // --- control flow ----------------------------------------------------

    pub fn jmp(&mut self, label: Label) {
        self.byte(0xe9);
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup {
            at,
            label: label.0,
            kind: FixupKind::Rel32,
        });
    }

    /// Short-form jump; fails at `finish` if the target is too far.
    pub fn jmp_short(&mut self, label: Label) {
        self.byte(0xeb);
        let at = self.buf.len();
        self.byte(0);
        self.fixups.push(Fixup {
            at,
            label: label.0,
            kind: FixupKind::Rel8,
        });
    }

    pub fn jcc(&mut self, cc: Cc, label: Label) {
        self.byte(0x0f);
        self.byte(0x80 | cc as u8);
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup {
            at,
            label: label.0,
            kind: FixupKind::Rel32,
        });
    }

    pub fn call_reg(&mut self, r: Reg) {
        if r.ext() {
            self.byte(0x41);
        }
        self.byte(0xff);
        self.modrm(0b11, 2, r.low());
    }

    pub fn ret(&mut self) {
        self.byte(0xc3);
    }

    pub fn push(&mut self, r: Reg) {
        if r.ext() {
            self.byte(0x41);
        }
        self.byte(0x50 + r.low());
    }

    pub fn pop(&mut self, r: Reg) {
        if r.ext() {
            self.byte(0x41);
        }
        self.byte(0x58 + r.low());
    }

    // --- SSE2 -------------------------------------------------------------

    /// `movsd xmm, [base + disp]`
    pub fn movsd_x_mem(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.byte(0xf2);
        if base.ext() {
            self.byte(0x41);
        }
        self.byte(0x0f);
        self.byte(0x10);
        self.mem(dst as u8, base, disp);
    }

    /// `movsd [base + disp], xmm`
    pub fn movsd_mem_x(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.byte(0xf2);
        if base.ext() {
            self.byte(0x41);
        }
        self.byte(0x0f);
        self.byte(0x11);
        self.mem(src as u8, base, disp);
    }

    fn sse_arith(&mut self, opcode: u8, dst: Xmm, src: Xmm) {
        self.byte(0xf2);
        self.byte(0x0f);
        self.byte(opcode);
        self.modrm(0b11, dst as u8, src as u8);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_arith(0x58, dst, src);
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_arith(0x5c, dst, src);
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_arith(0x59, dst, src);
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_arith(0x5e, dst, src);
    }

    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.byte(0x66);
        self.byte(0x0f);
        self.byte(0x2e);
        self.modrm(0b11, a as u8, b as u8);
    }

    /// `cvtsi2sd xmm, r64`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.byte(0xf2);
        self.byte(0x48 | if src.ext() { 1 } else { 0 });
        self.byte(0x0f);
        self.byte(0x2a);
        self.modrm(0b11, dst as u8, src.low());
    }

    /// `cvttsd2si r64, xmm`
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) {
        self.byte(0xf2);
        self.byte(0x48 | if dst.ext() { 4 } else { 0 });
        self.byte(0x0f);
        self.byte(0x2c);
        self.modrm(0b11, dst.low(), src as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mov_ri_encoding() {
        let mut asm = Asm::new();
        asm.mov_ri(Reg::Rax, 7);
        let code = asm.finish().unwrap();
        assert_eq!(&code[..2], &[0x48, 0xb8]);
        assert_eq!(&code[2..10], &7i64.to_le_bytes());
    }

    #[test]
    fn test_mov_rr_encoding() {
        let mut asm = Asm::new();
        asm.mov_rr(Reg::Rbx, Reg::Rdi);
        assert_eq!(asm.finish().unwrap(), vec![0x48, 0x89, 0xfb]);
    }

    #[test]
    fn test_mem_access_uses_sib_for_rsp_class_bases(){
        let mut asm = Asm::new();
        asm.mov_r_mem(Reg::Rax, Reg::R12, 8);
        let code = asm.finish().unwrap();
        // REX.WB, 8B, ModRM(mod=10, rax, rm=100), SIB, disp32
        assert_eq!(&code[..4], &[0x49, 0x8b, 0x84, 0x24]);
    }

    #[test]
    fn test_cqo_idiv_encoding() {
        let mut asm = Asm::new();
        asm.cqo();
        asm.idiv(Reg::Rcx);
        assert_eq!(asm.finish().unwrap(), vec![0x48, 0x99, 0x48, 0xf7, 0xf9]);
    }

    #[test]
    fn test_backward_jump_resolves_negative() {
        let mut asm = Asm::new();
        let top = asm.new_label();
        asm.bind(top);
        asm.add_rr(Reg::Rax, Reg::Rcx);
        asm.jmp(top);
        let code = asm.finish().unwrap();
        let rel = i32::from_le_bytes([
            code[code.len() - 4],
            code[code.len() - 3],
            code[code.len() - 2],
            code[code.len() - 1],
        ]);
        assert_eq!(rel, -(code.len() as i32));
    }

    #[test]
    fn test_forward_jump_patched() {
        let mut asm = Asm::new();
        let end = asm.new_label();
        asm.jmp(end);
        asm.mov_ri(Reg::Rax, 1);
        asm.bind(end);
        asm.ret();
        let code = asm.finish().unwrap();
        let rel = i32::from_le_bytes([code[1], code[2], code[3], code[4]]);
        assert_eq!(rel as usize, code.len() - 1 - 5);
    }

    #[test]
    fn test_rel8_overflow_is_an_error() {
        let mut asm = Asm::new();
        let far = asm.new_label();
        asm.jmp_short(far);
        for _ in 0..200 {
            asm.ret();
        }
        asm.bind(far);
        assert_eq!(asm.finish().unwrap_err(), JitError::RelOverflow);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = Asm::new();
        let l = asm.new_label();
        asm.jmp(l);
        assert_eq!(asm.finish().unwrap_err(), JitError::UnboundLabel);
    }
}
