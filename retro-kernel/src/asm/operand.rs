//! Operand parsing: registers, segment registers, immediates and memory
//! references with optional size hints.

use super::{AsmError, Assembler, ErrorKind, Value};

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum OpSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl OpSize {
    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// A general-purpose register: its ModR/M encoding and operand size.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Reg {
    pub code: u8,
    pub size: OpSize,
}

const REGS32: [&str; 8] = ["EAX", "ECX", "EDX", "EBX", "ESP", "EBP", "ESI", "EDI"];
const REGS16: [&str; 8] = ["AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI"];
const REGS8: [&str; 8] = ["AL", "CL", "DL", "BL", "AH", "CH", "DH", "BH"];

pub fn parse_register(s: &str) -> Option<Reg> {
    let mut buf = [0u8; 4];
    if s.len() > 3 || s.is_empty() {
        return None;
    }
    buf[..s.len()].copy_from_slice(s.as_bytes());
    buf[..s.len()].make_ascii_uppercase();
    let name = core::str::from_utf8(&buf[..s.len()]).ok()?;

    for (table, size) in [
        (&REGS32, OpSize::Dword),
        (&REGS16, OpSize::Word),
        (&REGS8, OpSize::Byte),
    ] {
        if let Some(code) = table.iter().position(|r| *r == name) {
            return Some(Reg {
                code: code as u8,
                size,
            });
        }
    }
    None
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

pub fn parse_segreg(s: &str) -> Option<SegReg> {
    let mut buf = [0u8; 2];
    if s.len() != 2 {
        return None;
    }
    buf.copy_from_slice(s.as_bytes());
    buf.make_ascii_uppercase();
    match &buf {
        b"ES" => Some(SegReg::Es),
        b"CS" => Some(SegReg::Cs),
        b"SS" => Some(SegReg::Ss),
        b"DS" => Some(SegReg::Ds),
        b"FS" => Some(SegReg::Fs),
        b"GS" => Some(SegReg::Gs),
        _ => None,
    }
}

/// A decoded memory reference. A resolved label folds into `disp`; an
/// unresolved one is carried by name and patched as a 32-bit displacement.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct MemRef {
    pub size: Option<OpSize>,
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    pub disp: i64,
    pub fixup_label: Option<heapless::String<32>>,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Operand {
    Reg(Reg),
    Seg(SegReg),
    Imm(Value),
    Mem(MemRef),
}

impl Operand {
    /// The size this operand pins down, if any.
    pub fn size(&self) -> Option<OpSize> {
        match self {
            Operand::Reg(r) => Some(r.size),
            Operand::Seg(_) => Some(OpSize::Word),
            Operand::Imm(_) => None,
            Operand::Mem(m) => m.size,
        }
    }
}

/// `BYTE`/`WORD`/`DWORD`, optionally followed by `PTR`.
fn strip_size_hint(s: &str) -> (Option<OpSize>, &str) {
    fn probe<'a>(prefix: &str, rest: &'a str) -> Option<&'a str> {
        let upper_matches = rest.len() >= prefix.len()
            && rest[..prefix.len()].eq_ignore_ascii_case(prefix)
            && rest[prefix.len()..]
                .chars()
                .next()
                .map_or(true, |c| c.is_ascii_whitespace() || c == '[');
        upper_matches.then(|| rest[prefix.len()..].trim_start())
    }

    for (name, size) in [
        ("BYTE", OpSize::Byte),
        ("WORD", OpSize::Word),
        ("DWORD", OpSize::Dword),
    ] {
        if let Some(rest) = probe(name, s) {
            let rest = probe("PTR", rest).unwrap_or(rest);
            return (Some(size), rest);
        }
    }
    (None, s)
}

impl Assembler {
    /// Classify one operand string.
    pub(super) fn parse_operand(&self, s: &str) -> Result<Operand, AsmError> {
        let s = s.trim();
        if s.is_empty() {
            Err(self.error(ErrorKind::BadOperand, "empty operand"))?;
        }

        let (size, rest) = strip_size_hint(s);
        if let Some(inner) = rest.strip_prefix('[') {
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| self.error(ErrorKind::Syntax, "unterminated memory operand"))?;
            return self.parse_memory(inner, size);
        }
        if size.is_some() {
            // A size hint is only meaningful before a memory operand.
            Err(self.error(ErrorKind::BadOperand, "size hint without memory operand"))?;
        }

        if let Some(reg) = parse_register(s) {
            return Ok(Operand::Reg(reg));
        }
        if let Some(seg) = parse_segreg(s) {
            return Ok(Operand::Seg(seg));
        }
        Ok(Operand::Imm(self.eval_expr(s)?))
    }

    /// Inside of `[...]`: `base`, `base+disp`, `base+index*scale+disp`,
    /// `disp`, `label`, in any additive order.
    fn parse_memory(&self, inner: &str, size: Option<OpSize>) -> Result<Operand, AsmError> {
        let mut mem = MemRef {
            size,
            base: None,
            index: None,
            disp: 0,
            fixup_label: None,
        };

        for (sign, term) in split_terms(inner) {
            let term = term.trim();
            if term.is_empty() {
                Err(self.error(ErrorKind::Syntax, "empty term in memory operand"))?;
            }

            // index*scale / scale*index
            if let Some((l, r)) = split_scale(term) {
                let (reg_str, scale_str) = if parse_register(l).is_some() {
                    (l, r)
                } else {
                    (r, l)
                };
                let reg = parse_register(reg_str)
                    .ok_or_else(|| self.error(ErrorKind::UnknownRegister, reg_str))?;
                let scale = super::lexer::parse_number(scale_str.trim())
                    .filter(|s| matches!(s, 1 | 2 | 4 | 8))
                    .ok_or_else(|| self.error(ErrorKind::BadOperand, "bad index scale"))?;
                if sign < 0 || mem.index.is_some() {
                    Err(self.error(ErrorKind::BadOperand, "bad index term"))?;
                }
                self.check_addr_reg(reg)?;
                mem.index = Some((reg, scale as u8));
                continue;
            }

            if let Some(reg) = parse_register(term) {
                if sign < 0 {
                    Err(self.error(ErrorKind::BadOperand, "register cannot be subtracted"))?;
                }
                self.check_addr_reg(reg)?;
                if mem.base.is_none() {
                    mem.base = Some(reg);
                } else if mem.index.is_none() {
                    mem.index = Some((reg, 1));
                } else {
                    Err(self.error(ErrorKind::BadOperand, "too many registers"))?;
                }
                continue;
            }

            let value = self.eval_expr(term)?;
            if value.resolved {
                mem.disp += sign as i64 * value.value;
            } else {
                let label = match (sign, value.label, &mem.fixup_label) {
                    (1, Some(label), None) => label,
                    _ => Err(self.error(ErrorKind::UndefinedLabel, term))?,
                };
                mem.fixup_label = Some(label);
            }
        }

        if let Some((index, _)) = mem.index {
            if index.code == 4 {
                // ESP cannot be an index.
                Err(self.error(ErrorKind::BadOperand, "ESP cannot be scaled"))?;
            }
        }
        Ok(Operand::Mem(mem))
    }

    fn check_addr_reg(&self, reg: Reg) -> Result<(), AsmError> {
        if reg.size != OpSize::Dword {
            Err(self.error(
                ErrorKind::BadOperand,
                "only 32-bit registers can address memory",
            ))?;
        }
        Ok(())
    }
}

/// Split `a+b-c` at top level into signed terms.
fn split_terms(s: &str) -> alloc::vec::Vec<(i32, &str)> {
    let mut terms = alloc::vec::Vec::new();
    let mut depth = 0usize;
    let mut sign = 1;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '+' | '-' if depth == 0 && i > start => {
                terms.push((sign, &s[start..i]));
                sign = if c == '-' { -1 } else { 1 };
                start = i + 1;
            }
            '-' if depth == 0 && i == start && start == 0 => {
                // leading sign belongs to the first term's expression
            }
            _ => {}
        }
    }
    terms.push((sign, &s[start..]));
    terms
}

/// Split `reg*scale` at a top-level `*`, if there is exactly one.
fn split_scale(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '*' if depth == 0 => {
                let (l, r) = (s[..i].trim(), s[i + 1..].trim());
                if parse_register(l).is_some() || parse_register(r).is_some() {
                    return Some((l, r));
                }
                return None;
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_tables() {
        assert_eq!(
            parse_register("eax"),
            Some(Reg {
                code: 0,
                size: OpSize::Dword
            })
        );
        assert_eq!(
            parse_register("EDI"),
            Some(Reg {
                code: 7,
                size: OpSize::Dword
            })
        );
        assert_eq!(
            parse_register("bx"),
            Some(Reg {
                code: 3,
                size: OpSize::Word
            })
        );
        assert_eq!(
            parse_register("ch"),
            Some(Reg {
                code: 5,
                size: OpSize::Byte
            })
        );
        assert_eq!(parse_register("xyz"), None);
        assert_eq!(parse_segreg("ds"), Some(SegReg::Ds));
        assert_eq!(parse_segreg("cs"), Some(SegReg::Cs));
    }

    #[test]
    fn term_splitting() {
        let terms = split_terms("ebx+esi*4+8");
        assert_eq!(terms, [(1, "ebx"), (1, "esi*4"), (1, "8")]);
        let terms = split_terms("ebp-4");
        assert_eq!(terms, [(1, "ebp"), (-1, "4")]);
        let terms = split_terms("(2+3)");
        assert_eq!(terms, [(1, "(2+3)")]);
    }
}
