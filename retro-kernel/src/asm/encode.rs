//! Instruction encoders: the mnemonic table and the ModR/M + SIB machinery.

use super::operand::{MemRef, OpSize, Operand, Reg, SegReg};
use super::{lexer, AsmError, Assembler, ErrorKind, Value};
use alloc::vec::Vec;

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | (reg << 3) | rm
}

fn sib(ss: u8, index: u8, base: u8) -> u8 {
    (ss << 6) | (index << 3) | base
}

enum Disp {
    None,
    D8(i8),
    D32,
}

/// mod field and displacement kind for a based memory operand. `[EBP]` with
/// no displacement must take the disp8 form because mod=0,rm=5 means pure
/// `[disp32]`.
fn disp_mode(base: Reg, disp: i64, forced32: bool) -> (u8, Disp) {
    if forced32 {
        (2, Disp::D32)
    } else if disp == 0 && base.code != 5 {
        (0, Disp::None)
    } else if (-128..=127).contains(&disp) {
        (1, Disp::D8(disp as i8))
    } else {
        (2, Disp::D32)
    }
}

impl Assembler {
    fn op66(&mut self, size: OpSize) -> Result<(), AsmError> {
        if size == OpSize::Word {
            self.emit8(0x66)?;
        }
        Ok(())
    }

    fn emit_disp32(&mut self, mem: &MemRef) -> Result<(), AsmError> {
        match &mem.fixup_label {
            Some(label) => self.emit_placeholder_fixup(4, false, 0, label.clone()),
            None => {
                if !(-(1i64 << 31)..(1i64 << 32)).contains(&mem.disp) {
                    Err(self.error(ErrorKind::OutOfRange, "displacement"))?;
                }
                self.emit32(mem.disp as u32)
            }
        }
    }

    /// ModR/M (+ SIB + displacement) for a memory operand, with `reg_field`
    /// in the reg slot.
    fn emit_mem(&mut self, reg_field: u8, mem: &MemRef) -> Result<(), AsmError> {
        let forced32 = mem.fixup_label.is_some();
        match (mem.base, mem.index) {
            (None, None) => {
                // Pure displacement: mod=0, rm=5.
                self.emit8(modrm(0, reg_field, 5))?;
                self.emit_disp32(mem)
            }
            (Some(base), None) => {
                let (mode, disp) = disp_mode(base, mem.disp, forced32);
                if base.code == 4 {
                    // ESP always needs a SIB byte.
                    self.emit8(modrm(mode, reg_field, 4))?;
                    self.emit8(sib(0, 4, 4))?;
                } else {
                    self.emit8(modrm(mode, reg_field, base.code))?;
                }
                match disp {
                    Disp::None => Ok(()),
                    Disp::D8(d) => self.emit8(d as u8),
                    Disp::D32 => self.emit_disp32(mem),
                }
            }
            (None, Some((index, scale))) => {
                // Index without base: SIB base=5, mod=0, disp32 mandatory.
                self.emit8(modrm(0, reg_field, 4))?;
                self.emit8(sib(scale_bits(scale), index.code, 5))?;
                self.emit_disp32(mem)
            }
            (Some(base), Some((index, scale))) => {
                let (mode, disp) = disp_mode(base, mem.disp, forced32);
                self.emit8(modrm(mode, reg_field, 4))?;
                self.emit8(sib(scale_bits(scale), index.code, base.code))?;
                match disp {
                    Disp::None => Ok(()),
                    Disp::D8(d) => self.emit8(d as u8),
                    Disp::D32 => self.emit_disp32(mem),
                }
            }
        }
    }

    /// Immediate of the given width; an unresolved label becomes an absolute
    /// fixup.
    fn emit_imm(&mut self, value: &Value, size: OpSize) -> Result<(), AsmError> {
        if value.resolved {
            let v = value.value;
            let fits = match size {
                OpSize::Byte => (-128..=255).contains(&v),
                OpSize::Word => (-32768..=65535).contains(&v),
                OpSize::Dword => (-(1i64 << 31)..(1i64 << 32)).contains(&v),
            };
            if !fits {
                Err(self.error(ErrorKind::OutOfRange, "immediate"))?;
            }
            match size {
                OpSize::Byte => self.emit8(v as u8),
                OpSize::Word => self.emit16(v as u16),
                OpSize::Dword => self.emit32(v as u32),
            }
        } else {
            let label = value
                .label
                .clone()
                .ok_or_else(|| self.error(ErrorKind::UndefinedLabel, "complex forward reference"))?;
            self.emit_placeholder_fixup(size.bytes() as u8, false, 0, label)
        }
    }
}

fn scale_bits(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn wbit(size: OpSize) -> u8 {
    if size == OpSize::Byte {
        0
    } else {
        1
    }
}

/// The mnemonic's size, taking a hint from either operand.
fn pair_size(asm: &Assembler, a: &Operand, b: &Operand) -> Result<OpSize, AsmError> {
    match (a.size(), b.size()) {
        (Some(x), Some(y)) if x == y => Ok(x),
        (Some(x), None) | (None, Some(x)) => Ok(x),
        (Some(_), Some(_)) => Err(asm.error(ErrorKind::BadOperand, "operand size mismatch")),
        (None, None) => Err(asm.error(ErrorKind::BadOperand, "operand size unknown")),
    }
}

const ALU: [(&str, u8); 8] = [
    ("ADD", 0),
    ("OR", 1),
    ("ADC", 2),
    ("SBB", 3),
    ("AND", 4),
    ("SUB", 5),
    ("XOR", 6),
    ("CMP", 7),
];

const SHIFT: [(&str, u8); 8] = [
    ("ROL", 0),
    ("ROR", 1),
    ("RCL", 2),
    ("RCR", 3),
    ("SHL", 4),
    ("SAL", 4),
    ("SHR", 5),
    ("SAR", 7),
];

/// Condition-code suffixes in encoding order, with their aliases.
fn condition_code(mnemonic: &str) -> Option<u8> {
    let cc = match mnemonic {
        "JO" => 0,
        "JNO" => 1,
        "JB" | "JC" | "JNAE" => 2,
        "JAE" | "JNB" | "JNC" => 3,
        "JE" | "JZ" => 4,
        "JNE" | "JNZ" => 5,
        "JBE" | "JNA" => 6,
        "JA" | "JNBE" => 7,
        "JS" => 8,
        "JNS" => 9,
        "JP" | "JPE" => 10,
        "JNP" | "JPO" => 11,
        "JL" | "JNGE" => 12,
        "JGE" | "JNL" => 13,
        "JLE" | "JNG" => 14,
        "JG" | "JNLE" => 15,
        _ => return None,
    };
    Some(cc)
}

/// Opcode bytes for mnemonics with no operands.
fn no_operand_opcode(mnemonic: &str) -> Option<&'static [u8]> {
    let bytes: &[u8] = match mnemonic {
        "NOP" => &[0x90],
        "HLT" => &[0xf4],
        "CLI" => &[0xfa],
        "STI" => &[0xfb],
        "CLC" => &[0xf8],
        "STC" => &[0xf9],
        "CMC" => &[0xf5],
        "CLD" => &[0xfc],
        "STD" => &[0xfd],
        "PUSHA" | "PUSHAD" => &[0x60],
        "POPA" | "POPAD" => &[0x61],
        "PUSHF" | "PUSHFD" => &[0x9c],
        "POPF" | "POPFD" => &[0x9d],
        "LEAVE" => &[0xc9],
        "IRET" | "IRETD" => &[0xcf],
        "INT3" => &[0xcc],
        "CBW" => &[0x66, 0x98],
        "CWDE" => &[0x98],
        "CWD" => &[0x66, 0x99],
        "CDQ" => &[0x99],
        "MOVSB" => &[0xa4],
        "MOVSW" => &[0x66, 0xa5],
        "MOVSD" => &[0xa5],
        "STOSB" => &[0xaa],
        "STOSW" => &[0x66, 0xab],
        "STOSD" => &[0xab],
        "LODSB" => &[0xac],
        "LODSW" => &[0x66, 0xad],
        "LODSD" => &[0xad],
        "CMPSB" => &[0xa6],
        "CMPSW" => &[0x66, 0xa7],
        "CMPSD" => &[0xa7],
        "SCASB" => &[0xae],
        "SCASW" => &[0x66, 0xaf],
        "SCASD" => &[0xaf],
        _ => return None,
    };
    Some(bytes)
}

/// Encode one instruction. `mnemonic` arrives uppercased.
pub fn encode(asm: &mut Assembler, mnemonic: &str, operand_str: &str) -> Result<(), AsmError> {
    let ops = lexer::split_operands(operand_str)
        .map(|s| asm.parse_operand(s))
        .collect::<Result<Vec<Operand>, AsmError>>()?;

    if ops.is_empty() {
        if let Some(bytes) = no_operand_opcode(mnemonic) {
            for b in bytes {
                asm.emit8(*b)?;
            }
            return Ok(());
        }
        return match mnemonic {
            "RET" => asm.emit8(0xc3),
            _ => Err(asm.error(ErrorKind::UnknownMnemonic, mnemonic)),
        };
    }

    if let Some((_, index)) = ALU.iter().find(|(m, _)| *m == mnemonic) {
        return alu(asm, *index, &ops);
    }
    if let Some((_, index)) = SHIFT.iter().find(|(m, _)| *m == mnemonic) {
        return shift(asm, *index, &ops);
    }
    if let Some(cc) = condition_code(mnemonic) {
        return jcc(asm, cc, &ops);
    }

    match mnemonic {
        "MOV" => mov(asm, &ops),
        "TEST" => test(asm, &ops),
        "XCHG" => xchg(asm, &ops),
        "LEA" => lea(asm, &ops),
        "INC" => inc_dec(asm, 0, &ops),
        "DEC" => inc_dec(asm, 1, &ops),
        "NOT" => group3(asm, 2, &ops),
        "NEG" => group3(asm, 3, &ops),
        "MUL" => group3(asm, 4, &ops),
        "IMUL" => imul(asm, &ops),
        "DIV" => group3(asm, 6, &ops),
        "IDIV" => group3(asm, 7, &ops),
        "PUSH" => push(asm, &ops),
        "POP" => pop(asm, &ops),
        "JMP" => jmp(asm, &ops),
        "CALL" => call(asm, &ops),
        "RET" => match &ops[..] {
            [Operand::Imm(v)] => {
                asm.emit8(0xc2)?;
                asm.emit_imm(v, OpSize::Word)
            }
            _ => Err(asm.error(ErrorKind::BadOperand, "RET")),
        },
        "INT" => match &ops[..] {
            [Operand::Imm(v)] if v.resolved && v.value == 3 => asm.emit8(0xcc),
            [Operand::Imm(v)] => {
                asm.emit8(0xcd)?;
                asm.emit_imm(v, OpSize::Byte)
            }
            _ => Err(asm.error(ErrorKind::BadOperand, "INT")),
        },
        "LOOP" => loop_rel8(asm, 0xe2, &ops),
        "LOOPE" | "LOOPZ" => loop_rel8(asm, 0xe1, &ops),
        "LOOPNE" | "LOOPNZ" => loop_rel8(asm, 0xe0, &ops),
        "IN" => in_op(asm, &ops),
        "OUT" => out_op(asm, &ops),
        "MOVZX" => movx(asm, 0xb6, &ops),
        "MOVSX" => movx(asm, 0xbe, &ops),
        _ if no_operand_opcode(mnemonic).is_some() => {
            Err(asm.error(ErrorKind::BadOperand, "unexpected operands"))
        }
        _ => Err(asm.error(ErrorKind::UnknownMnemonic, mnemonic)),
    }
}

/// ADD/OR/ADC/SBB/AND/SUB/XOR/CMP.
fn alu(asm: &mut Assembler, index: u8, ops: &[Operand]) -> Result<(), AsmError> {
    let base = index * 8;
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            if dst.size != src.size {
                Err(asm.error(ErrorKind::BadOperand, "operand size mismatch"))?;
            }
            asm.op66(dst.size)?;
            asm.emit8(base + wbit(dst.size))?;
            asm.emit8(modrm(3, src.code, dst.code))
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            asm.op66(src.size)?;
            asm.emit8(base + wbit(src.size))?;
            asm.emit_mem(src.code, mem)
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            asm.op66(dst.size)?;
            asm.emit8(base + 2 + wbit(dst.size))?;
            asm.emit_mem(dst.code, mem)
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            asm.op66(dst.size)?;
            if dst.size != OpSize::Byte && imm.resolved && (-128..=127).contains(&imm.value) {
                // Sign-extended imm8 saves bytes.
                asm.emit8(0x83)?;
                asm.emit8(modrm(3, index, dst.code))?;
                asm.emit8(imm.value as u8)
            } else if dst.code == 0 {
                // Short form against AL/AX/EAX.
                asm.emit8(base + 4 + wbit(dst.size))?;
                asm.emit_imm(imm, dst.size)
            } else {
                asm.emit8(if dst.size == OpSize::Byte { 0x80 } else { 0x81 })?;
                asm.emit8(modrm(3, index, dst.code))?;
                asm.emit_imm(imm, dst.size)
            }
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?;
            asm.op66(size)?;
            if size != OpSize::Byte && imm.resolved && (-128..=127).contains(&imm.value) {
                asm.emit8(0x83)?;
                asm.emit_mem(index, mem)?;
                asm.emit8(imm.value as u8)
            } else {
                asm.emit8(if size == OpSize::Byte { 0x80 } else { 0x81 })?;
                asm.emit_mem(index, mem)?;
                asm.emit_imm(imm, size)
            }
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "ALU operands")),
    }
}

fn mov(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            if dst.size != src.size {
                Err(asm.error(ErrorKind::BadOperand, "operand size mismatch"))?;
            }
            asm.op66(dst.size)?;
            asm.emit8(0x88 + wbit(dst.size))?;
            asm.emit8(modrm(3, src.code, dst.code))
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            asm.op66(src.size)?;
            asm.emit8(0x88 + wbit(src.size))?;
            asm.emit_mem(src.code, mem)
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            asm.op66(dst.size)?;
            asm.emit8(0x8a + wbit(dst.size))?;
            asm.emit_mem(dst.code, mem)
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            asm.op66(dst.size)?;
            match dst.size {
                OpSize::Byte => {
                    asm.emit8(0xb0 + dst.code)?;
                    asm.emit_imm(imm, OpSize::Byte)
                }
                size => {
                    asm.emit8(0xb8 + dst.code)?;
                    asm.emit_imm(imm, size)
                }
            }
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?;
            asm.op66(size)?;
            asm.emit8(if size == OpSize::Byte { 0xc6 } else { 0xc7 })?;
            asm.emit_mem(0, mem)?;
            asm.emit_imm(imm, size)
        }
        [Operand::Seg(seg), Operand::Reg(src)] => {
            asm.emit8(0x8e)?;
            asm.emit8(modrm(3, *seg as u8, src.code))
        }
        [Operand::Reg(dst), Operand::Seg(seg)] => {
            asm.emit8(0x8c)?;
            asm.emit8(modrm(3, *seg as u8, dst.code))
        }
        [Operand::Seg(seg), Operand::Mem(mem)] => {
            asm.emit8(0x8e)?;
            asm.emit_mem(*seg as u8, mem)
        }
        [Operand::Mem(mem), Operand::Seg(seg)] => {
            asm.emit8(0x8c)?;
            asm.emit_mem(*seg as u8, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "MOV operands")),
    }
}

fn test(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            if dst.size != src.size {
                Err(asm.error(ErrorKind::BadOperand, "operand size mismatch"))?;
            }
            asm.op66(dst.size)?;
            asm.emit8(0x84 + wbit(dst.size))?;
            asm.emit8(modrm(3, src.code, dst.code))
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            asm.op66(src.size)?;
            asm.emit8(0x84 + wbit(src.size))?;
            asm.emit_mem(src.code, mem)
        }
        [Operand::Reg(dst), Operand::Imm(imm)] if dst.code == 0 => {
            asm.op66(dst.size)?;
            asm.emit8(0xa8 + wbit(dst.size))?;
            asm.emit_imm(imm, dst.size)
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            asm.op66(dst.size)?;
            asm.emit8(0xf6 + wbit(dst.size))?;
            asm.emit8(modrm(3, 0, dst.code))?;
            asm.emit_imm(imm, dst.size)
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?;
            asm.op66(size)?;
            asm.emit8(0xf6 + wbit(size))?;
            asm.emit_mem(0, mem)?;
            asm.emit_imm(imm, size)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "TEST operands")),
    }
}

fn xchg(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(a), Operand::Reg(b)] => {
            if a.size != b.size {
                Err(asm.error(ErrorKind::BadOperand, "operand size mismatch"))?;
            }
            if a.size != OpSize::Byte && (a.code == 0 || b.code == 0) {
                let other = if a.code == 0 { b } else { a };
                asm.op66(a.size)?;
                return asm.emit8(0x90 + other.code);
            }
            asm.op66(a.size)?;
            asm.emit8(0x86 + wbit(a.size))?;
            asm.emit8(modrm(3, b.code, a.code))
        }
        [Operand::Mem(mem), Operand::Reg(reg)] | [Operand::Reg(reg), Operand::Mem(mem)] => {
            asm.op66(reg.size)?;
            asm.emit8(0x86 + wbit(reg.size))?;
            asm.emit_mem(reg.code, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "XCHG operands")),
    }
}

fn lea(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(dst), Operand::Mem(mem)] if dst.size == OpSize::Dword => {
            asm.emit8(0x8d)?;
            asm.emit_mem(dst.code, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "LEA needs reg32, mem")),
    }
}

fn inc_dec(asm: &mut Assembler, index: u8, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(reg)] if reg.size == OpSize::Byte => {
            asm.emit8(0xfe)?;
            asm.emit8(modrm(3, index, reg.code))
        }
        [Operand::Reg(reg)] => {
            asm.op66(reg.size)?;
            asm.emit8(if index == 0 { 0x40 } else { 0x48 } + reg.code)
        }
        [Operand::Mem(mem)] => {
            let size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?;
            asm.op66(size)?;
            asm.emit8(0xfe + wbit(size))?;
            asm.emit_mem(index, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "INC/DEC operand")),
    }
}

/// NOT/NEG/MUL/DIV/IDIV (and one-operand IMUL): group 3, opcode 0xF6/0xF7.
fn group3(asm: &mut Assembler, index: u8, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(reg)] => {
            asm.op66(reg.size)?;
            asm.emit8(0xf6 + wbit(reg.size))?;
            asm.emit8(modrm(3, index, reg.code))
        }
        [Operand::Mem(mem)] => {
            let size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?;
            asm.op66(size)?;
            asm.emit8(0xf6 + wbit(size))?;
            asm.emit_mem(index, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "one operand expected")),
    }
}

fn imul(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [_] => group3(asm, 5, ops),
        [Operand::Reg(dst), Operand::Reg(src)] => {
            let size = pair_size(asm, &ops[0], &ops[1])?;
            asm.op66(size)?;
            asm.emit8(0x0f)?;
            asm.emit8(0xaf)?;
            asm.emit8(modrm(3, dst.code, src.code))
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            asm.op66(dst.size)?;
            asm.emit8(0x0f)?;
            asm.emit8(0xaf)?;
            asm.emit_mem(dst.code, mem)
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            // IMUL r, imm == IMUL r, r, imm.
            asm.op66(dst.size)?;
            if imm.resolved && (-128..=127).contains(&imm.value) {
                asm.emit8(0x6b)?;
                asm.emit8(modrm(3, dst.code, dst.code))?;
                asm.emit8(imm.value as u8)
            } else {
                asm.emit8(0x69)?;
                asm.emit8(modrm(3, dst.code, dst.code))?;
                asm.emit_imm(imm, dst.size)
            }
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "IMUL operands")),
    }
}

fn shift(asm: &mut Assembler, index: u8, ops: &[Operand]) -> Result<(), AsmError> {
    let (rm_size, emit_rm): (OpSize, _) = match &ops[..] {
        [Operand::Reg(reg), _] => (reg.size, None),
        [Operand::Mem(mem), _] => (
            mem.size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "operand size unknown"))?,
            Some(mem.clone()),
        ),
        _ => Err(asm.error(ErrorKind::BadOperand, "shift operands"))?,
    };

    let finish = |asm: &mut Assembler, opcode: u8| -> Result<(), AsmError> {
        asm.op66(rm_size)?;
        asm.emit8(opcode + wbit(rm_size))?;
        match (&ops[0], &emit_rm) {
            (Operand::Reg(reg), _) => asm.emit8(modrm(3, index, reg.code)),
            (_, Some(mem)) => asm.emit_mem(index, mem),
            _ => unreachable!(),
        }
    };

    match &ops[1] {
        Operand::Imm(v) if v.resolved && v.value == 1 => finish(asm, 0xd0),
        Operand::Imm(v) => {
            finish(asm, 0xc0)?;
            asm.emit_imm(v, OpSize::Byte)
        }
        Operand::Reg(cl) if cl.code == 1 && cl.size == OpSize::Byte => finish(asm, 0xd2),
        _ => Err(asm.error(ErrorKind::BadOperand, "shift count")),
    }
}

fn push(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(reg)] if reg.size != OpSize::Byte => {
            asm.op66(reg.size)?;
            asm.emit8(0x50 + reg.code)
        }
        [Operand::Seg(seg)] => {
            let bytes: &[u8] = match seg {
                SegReg::Es => &[0x06],
                SegReg::Cs => &[0x0e],
                SegReg::Ss => &[0x16],
                SegReg::Ds => &[0x1e],
                SegReg::Fs => &[0x0f, 0xa0],
                SegReg::Gs => &[0x0f, 0xa8],
            };
            for b in bytes {
                asm.emit8(*b)?;
            }
            Ok(())
        }
        [Operand::Imm(v)] => {
            if v.resolved && (-128..=127).contains(&v.value) {
                asm.emit8(0x6a)?;
                asm.emit8(v.value as u8)
            } else {
                asm.emit8(0x68)?;
                asm.emit_imm(v, OpSize::Dword)
            }
        }
        [Operand::Mem(mem)] => {
            asm.emit8(0xff)?;
            asm.emit_mem(6, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "PUSH operand")),
    }
}

fn pop(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(reg)] if reg.size != OpSize::Byte => {
            asm.op66(reg.size)?;
            asm.emit8(0x58 + reg.code)
        }
        [Operand::Seg(seg)] => {
            let bytes: &[u8] = match seg {
                SegReg::Es => &[0x07],
                SegReg::Ss => &[0x17],
                SegReg::Ds => &[0x1f],
                SegReg::Fs => &[0x0f, 0xa1],
                SegReg::Gs => &[0x0f, 0xa9],
                SegReg::Cs => Err(asm.error(ErrorKind::BadOperand, "POP CS"))?,
            };
            for b in bytes {
                asm.emit8(*b)?;
            }
            Ok(())
        }
        [Operand::Mem(mem)] => {
            asm.emit8(0x8f)?;
            asm.emit_mem(0, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "POP operand")),
    }
}

/// Short-vs-near selection for a jump target. A defined (backward) label
/// picks the form that fits; an undefined one is assumed short in both
/// passes, failing in the fixup pass if it turns out too far.
fn jcc(asm: &mut Assembler, cc: u8, ops: &[Operand]) -> Result<(), AsmError> {
    let target = match ops {
        [Operand::Imm(v)] => v,
        _ => Err(asm.error(ErrorKind::BadOperand, "jump target"))?,
    };

    if target.resolved {
        let short_rel = target.value - (asm.pc() as i64 + 2);
        if (-128..=127).contains(&short_rel) {
            asm.emit8(0x70 + cc)?;
            asm.emit8(short_rel as u8)
        } else {
            let near_rel = target.value - (asm.pc() as i64 + 6);
            asm.emit8(0x0f)?;
            asm.emit8(0x80 + cc)?;
            asm.emit32(near_rel as u32)
        }
    } else {
        let label = target
            .label
            .clone()
            .ok_or_else(|| asm.error(ErrorKind::UndefinedLabel, "jump target"))?;
        asm.emit8(0x70 + cc)?;
        let base = asm.pc() + 1;
        asm.emit_placeholder_fixup(1, true, base, label)
    }
}

fn jmp(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Imm(target)] => {
            if target.resolved {
                let short_rel = target.value - (asm.pc() as i64 + 2);
                if (-128..=127).contains(&short_rel) {
                    asm.emit8(0xeb)?;
                    asm.emit8(short_rel as u8)
                } else {
                    let near_rel = target.value - (asm.pc() as i64 + 5);
                    asm.emit8(0xe9)?;
                    asm.emit32(near_rel as u32)
                }
            } else {
                let label = target
                    .label
                    .clone()
                    .ok_or_else(|| asm.error(ErrorKind::UndefinedLabel, "jump target"))?;
                asm.emit8(0xeb)?;
                let base = asm.pc() + 1;
                asm.emit_placeholder_fixup(1, true, base, label)
            }
        }
        [Operand::Reg(reg)] if reg.size == OpSize::Dword => {
            asm.emit8(0xff)?;
            asm.emit8(modrm(3, 4, reg.code))
        }
        [Operand::Mem(mem)] => {
            asm.emit8(0xff)?;
            asm.emit_mem(4, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "JMP operand")),
    }
}

/// CALL always takes the rel32 form for labels.
fn call(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Imm(target)] => {
            asm.emit8(0xe8)?;
            if target.resolved {
                let rel = target.value - (asm.pc() as i64 + 4);
                asm.emit32(rel as u32)
            } else {
                let label = target
                    .label
                    .clone()
                    .ok_or_else(|| asm.error(ErrorKind::UndefinedLabel, "call target"))?;
                let base = asm.pc() + 4;
                asm.emit_placeholder_fixup(4, true, base, label)
            }
        }
        [Operand::Reg(reg)] if reg.size == OpSize::Dword => {
            asm.emit8(0xff)?;
            asm.emit8(modrm(3, 2, reg.code))
        }
        [Operand::Mem(mem)] => {
            asm.emit8(0xff)?;
            asm.emit_mem(2, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "CALL operand")),
    }
}

fn loop_rel8(asm: &mut Assembler, opcode: u8, ops: &[Operand]) -> Result<(), AsmError> {
    let target = match ops {
        [Operand::Imm(v)] => v,
        _ => Err(asm.error(ErrorKind::BadOperand, "loop target"))?,
    };
    asm.emit8(opcode)?;
    if target.resolved {
        let rel = target.value - (asm.pc() as i64 + 1);
        if !(-128..=127).contains(&rel) {
            Err(asm.error(ErrorKind::JumpTooFar, "loop target"))?;
        }
        asm.emit8(rel as u8)
    } else {
        let label = target
            .label
            .clone()
            .ok_or_else(|| asm.error(ErrorKind::UndefinedLabel, "loop target"))?;
        let base = asm.pc() + 1;
        asm.emit_placeholder_fixup(1, true, base, label)
    }
}

fn in_op(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(acc), Operand::Imm(port)] if acc.code == 0 => {
            asm.op66(acc.size)?;
            asm.emit8(0xe4 + wbit(acc.size))?;
            asm.emit_imm(port, OpSize::Byte)
        }
        [Operand::Reg(acc), Operand::Reg(dx)]
            if acc.code == 0 && dx.code == 2 && dx.size == OpSize::Word =>
        {
            asm.op66(acc.size)?;
            asm.emit8(0xec + wbit(acc.size))
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "IN operands")),
    }
}

fn out_op(asm: &mut Assembler, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Imm(port), Operand::Reg(acc)] if acc.code == 0 => {
            asm.op66(acc.size)?;
            asm.emit8(0xe6 + wbit(acc.size))?;
            asm.emit_imm(port, OpSize::Byte)
        }
        [Operand::Reg(dx), Operand::Reg(acc)]
            if acc.code == 0 && dx.code == 2 && dx.size == OpSize::Word =>
        {
            asm.op66(acc.size)?;
            asm.emit8(0xee + wbit(acc.size))
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "OUT operands")),
    }
}

/// MOVZX/MOVSX: `base` is the byte-source opcode; word sources use base+1.
fn movx(asm: &mut Assembler, base: u8, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] if src.size < dst.size => {
            asm.op66(dst.size)?;
            asm.emit8(0x0f)?;
            asm.emit8(base + if src.size == OpSize::Word { 1 } else { 0 })?;
            asm.emit8(modrm(3, dst.code, src.code))
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            let src_size = mem
                .size
                .ok_or_else(|| asm.error(ErrorKind::BadOperand, "source size unknown"))?;
            if src_size >= dst.size {
                Err(asm.error(ErrorKind::BadOperand, "source not narrower"))?;
            }
            asm.op66(dst.size)?;
            asm.emit8(0x0f)?;
            asm.emit8(base + if src_size == OpSize::Word { 1 } else { 0 })?;
            asm.emit_mem(dst.code, mem)
        }
        _ => Err(asm.error(ErrorKind::BadOperand, "MOVZX/MOVSX operands")),
    }
}
