//! Two-pass i386 assembler.
//!
//! Pass 1 walks the source counting bytes and collecting label addresses;
//! pass 2 walks again emitting real bytes, recording a fixup for every label
//! reference that is not yet resolvable (a forward reference at that point of
//! the walk). All fixups are drained after pass 2: absolute or PC-relative
//! values are patched into the output at their recorded width, and an 8-bit
//! relative that overflows ±127 fails the assembly — a forward jump assumed
//! short in pass 1 is never silently rewritten to the near form, since that
//! would move every later label.

use alloc::vec::Vec;
use core::fmt;
use derive_new::new;

pub mod encode;
pub mod lexer;
pub mod monitor;
pub mod operand;

pub const LABEL_CAP: usize = 256;
pub const FIXUP_CAP: usize = 256;
pub const NAME_CAP: usize = 32;
pub const DEFAULT_OUTPUT_CAP: usize = 4096;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorKind {
    Syntax,
    UnknownMnemonic,
    UnknownRegister,
    BadOperand,
    OutOfRange,
    UndefinedLabel,
    DuplicateLabel,
    JumpTooFar,
    TableFull,
    BufferFull,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Syntax => "syntax error",
            ErrorKind::UnknownMnemonic => "unknown mnemonic",
            ErrorKind::UnknownRegister => "unknown register",
            ErrorKind::BadOperand => "bad operand",
            ErrorKind::OutOfRange => "value out of range",
            ErrorKind::UndefinedLabel => "undefined label",
            ErrorKind::DuplicateLabel => "duplicate label",
            ErrorKind::JumpTooFar => "jump out of short range; rewrite with a near jump",
            ErrorKind::TableFull => "label or fixup table full",
            ErrorKind::BufferFull => "output buffer full",
        };
        f.write_str(s)
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct AsmError {
    pub kind: ErrorKind,
    pub message: heapless::String<64>,
    pub line: u32,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)?;
        if !self.message.is_empty() {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

/// An evaluated expression. `resolved` is false when the expression referred
/// to a label with no address yet; `label` survives only for a lone label
/// reference, which is the only form a fixup can patch.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Value {
    pub value: i64,
    pub resolved: bool,
    pub label: Option<heapless::String<NAME_CAP>>,
}

impl Value {
    pub fn known(value: i64) -> Self {
        Self {
            value,
            resolved: true,
            label: None,
        }
    }

    fn pending(label: heapless::String<NAME_CAP>) -> Self {
        Self {
            value: 0,
            resolved: false,
            label: Some(label),
        }
    }

    fn combine(a: Value, b: Value, f: fn(i64, i64) -> i64) -> Value {
        if a.resolved && b.resolved {
            Value::known(f(a.value, b.value))
        } else {
            // Arithmetic on an unresolved label loses the fixup contract.
            Value {
                value: 0,
                resolved: false,
                label: None,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Label {
    name: heapless::String<NAME_CAP>,
    addr: u32,
    defined_in_pass: u8,
}

/// A reference that could not be resolved while emitting; patched after
/// pass 2. `base` is the PC of the byte after the instruction for relative
/// patches.
#[derive(Debug, Clone, new)]
struct Fixup {
    offset: usize,
    label: heapless::String<NAME_CAP>,
    width: u8,
    relative: bool,
    base: u32,
    line: u32,
}

pub struct Assembler {
    out: Vec<u8>,
    size: usize,
    capacity: usize,
    initial_org: u32,
    org: u32,
    labels: heapless::Vec<Label, LABEL_CAP>,
    fixups: heapless::Vec<Fixup, FIXUP_CAP>,
    scope: heapless::String<NAME_CAP>,
    pass: u8,
    line: u32,
    instructions: u32,
}

impl Assembler {
    pub fn new(org: u32) -> Self {
        Self::with_capacity(org, DEFAULT_OUTPUT_CAP)
    }

    pub fn with_capacity(org: u32, capacity: usize) -> Self {
        Self {
            out: Vec::new(),
            size: 0,
            capacity,
            initial_org: org,
            org,
            labels: heapless::Vec::new(),
            fixups: heapless::Vec::new(),
            scope: heapless::String::new(),
            pass: 1,
            line: 0,
            instructions: 0,
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.out
    }

    pub fn org(&self) -> u32 {
        self.org
    }

    /// `org + bytes emitted so far` — the `$` of the current position.
    pub fn pc(&self) -> u32 {
        self.org + self.size as u32
    }

    pub fn instruction_count(&self) -> u32 {
        self.instructions
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, u32)> {
        self.labels.iter().map(|l| (l.name.as_str(), l.addr))
    }

    pub(crate) fn error(&self, kind: ErrorKind, message: &str) -> AsmError {
        let mut m: heapless::String<64> = heapless::String::new();
        for c in message.chars() {
            if m.push(c).is_err() {
                break;
            }
        }
        AsmError {
            kind,
            message: m,
            line: self.line,
        }
    }

    // ---- two-pass driver ----

    /// Assemble `source` from scratch: pass 1 sizes, pass 2 emits, then every
    /// fixup is patched. The output is in [`Assembler::output`].
    pub fn assemble(&mut self, source: &str) -> Result<(), AsmError> {
        self.labels.clear();
        self.fixups.clear();

        self.pass = 1;
        self.reset_position();
        self.run_pass(source)?;
        let pass1_pc = self.pc();

        self.pass = 2;
        self.reset_position();
        self.run_pass(source)?;
        self.apply_fixups()?;

        debug_assert_eq!(pass1_pc, self.pc(), "pass size disagreement");
        Ok(())
    }

    fn reset_position(&mut self) {
        self.out.clear();
        self.size = 0;
        self.org = self.initial_org;
        self.scope.clear();
        self.line = 0;
        self.instructions = 0;
    }

    fn run_pass(&mut self, source: &str) -> Result<(), AsmError> {
        for (index, raw) in source.lines().enumerate() {
            self.line = index as u32 + 1;
            let parsed = lexer::split_line(raw);
            let statement = lexer::split_mnemonic(parsed.rest);

            if let Some(label) = parsed.label {
                match statement {
                    Some((m, operand)) if m.eq_ignore_ascii_case("EQU") => {
                        let value = self.eval_expr(operand)?;
                        if !value.resolved {
                            Err(self.error(ErrorKind::UndefinedLabel, operand))?;
                        }
                        self.define_label(label, value.value as u32)?;
                        continue;
                    }
                    _ => {
                        let pc = self.pc();
                        self.define_label(label, pc)?;
                    }
                }
            }

            if let Some((mnemonic, operands)) = statement {
                self.handle_statement(mnemonic, operands)?;
            }
        }
        Ok(())
    }

    fn handle_statement(&mut self, mnemonic: &str, operands: &str) -> Result<(), AsmError> {
        let mut buf = [0u8; 8];
        if mnemonic.len() > buf.len() {
            Err(self.error(ErrorKind::UnknownMnemonic, mnemonic))?;
        }
        buf[..mnemonic.len()].copy_from_slice(mnemonic.as_bytes());
        buf[..mnemonic.len()].make_ascii_uppercase();
        let upper = core::str::from_utf8(&buf[..mnemonic.len()]).unwrap();

        match upper {
            "ORG" => {
                let value = self.eval_expr(operands)?;
                if !value.resolved {
                    Err(self.error(ErrorKind::UndefinedLabel, operands))?;
                }
                self.org = value.value as u32;
                Ok(())
            }
            "DB" => self.emit_data(operands, 1),
            "DW" => self.emit_data(operands, 2),
            "DD" => self.emit_data(operands, 4),
            "TIMES" => {
                let (count, rest) = self.eval_expr_prefix(operands)?;
                if !count.resolved || count.value < 0 {
                    Err(self.error(ErrorKind::BadOperand, "bad TIMES count"))?;
                }
                let (mnemonic, operands) = lexer::split_mnemonic(rest)
                    .ok_or_else(|| self.error(ErrorKind::Syntax, "TIMES needs a statement"))?;
                for _ in 0..count.value {
                    self.handle_statement(mnemonic, operands)?;
                }
                Ok(())
            }
            "EQU" => Err(self.error(ErrorKind::Syntax, "EQU requires a label")),
            "REP" | "REPE" | "REPZ" => self.prefixed(0xf3, operands),
            "REPNE" | "REPNZ" => self.prefixed(0xf2, operands),
            _ => {
                self.instructions += 1;
                encode::encode(self, upper, operands)
            }
        }
    }

    fn prefixed(&mut self, prefix: u8, rest: &str) -> Result<(), AsmError> {
        self.emit8(prefix)?;
        match lexer::split_mnemonic(rest) {
            Some((mnemonic, operands)) => self.handle_statement(mnemonic, operands),
            None => Ok(()),
        }
    }

    /// DB/DW/DD: numbers, char literals, labels, and (for DB) strings.
    fn emit_data(&mut self, operands: &str, width: u8) -> Result<(), AsmError> {
        if operands.trim().is_empty() {
            Err(self.error(ErrorKind::Syntax, "data directive needs operands"))?;
        }
        for op in lexer::split_operands(operands) {
            if width == 1 {
                if let Some(s) = lexer::parse_string_literal(op) {
                    for b in s.bytes() {
                        self.emit8(b)?;
                    }
                    continue;
                }
            }
            let value = self.eval_expr(op)?;
            if value.resolved {
                self.emit_ranged(value.value, width)?;
            } else {
                let label = value
                    .label
                    .ok_or_else(|| self.error(ErrorKind::UndefinedLabel, op))?;
                self.emit_placeholder_fixup(width, false, 0, label)?;
            }
        }
        Ok(())
    }

    fn emit_ranged(&mut self, value: i64, width: u8) -> Result<(), AsmError> {
        let fits = match width {
            1 => (-128..=255).contains(&value),
            2 => (-32768..=65535).contains(&value),
            _ => (-(1i64 << 31)..(1i64 << 32)).contains(&value),
        };
        if !fits {
            Err(self.error(ErrorKind::OutOfRange, "value does not fit"))?;
        }
        for i in 0..width {
            self.emit8((value >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    // ---- emission ----

    pub(crate) fn emit8(&mut self, byte: u8) -> Result<(), AsmError> {
        if self.size >= self.capacity {
            Err(self.error(ErrorKind::BufferFull, ""))?;
        }
        if self.pass == 2 {
            self.out.push(byte);
        }
        self.size += 1;
        Ok(())
    }

    pub(crate) fn emit16(&mut self, value: u16) -> Result<(), AsmError> {
        self.emit8(value as u8)?;
        self.emit8((value >> 8) as u8)
    }

    pub(crate) fn emit32(&mut self, value: u32) -> Result<(), AsmError> {
        for i in 0..4 {
            self.emit8((value >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    /// Emit `width` placeholder bytes and, in pass 2, record the fixup that
    /// will overwrite them.
    pub(crate) fn emit_placeholder_fixup(
        &mut self,
        width: u8,
        relative: bool,
        base: u32,
        label: heapless::String<NAME_CAP>,
    ) -> Result<(), AsmError> {
        if self.pass == 2 {
            let fixup = Fixup::new(self.size, label, width, relative, base, self.line);
            if self.fixups.push(fixup).is_err() {
                Err(self.error(ErrorKind::TableFull, "fixup table"))?;
            }
        }
        for _ in 0..width {
            self.emit8(0)?;
        }
        Ok(())
    }

    fn apply_fixups(&mut self) -> Result<(), AsmError> {
        for i in 0..self.fixups.len() {
            let fixup = self.fixups[i].clone();
            let addr = self
                .labels
                .iter()
                .find(|l| l.name == fixup.label)
                .map(|l| l.addr)
                .ok_or(AsmError {
                    kind: ErrorKind::UndefinedLabel,
                    message: fixup.label.as_str().into(),
                    line: fixup.line,
                })?;

            let value = if fixup.relative {
                addr as i64 - fixup.base as i64
            } else {
                addr as i64
            };

            let fits = match (fixup.width, fixup.relative) {
                (1, true) => (-128..=127).contains(&value),
                (1, false) => (0..=255).contains(&value),
                (2, _) => (-32768..=65535).contains(&value),
                _ => true,
            };
            if !fits {
                let kind = if fixup.relative {
                    ErrorKind::JumpTooFar
                } else {
                    ErrorKind::OutOfRange
                };
                return Err(AsmError {
                    kind,
                    message: fixup.label.as_str().into(),
                    line: fixup.line,
                });
            }

            for b in 0..fixup.width as usize {
                self.out[fixup.offset + b] = (value >> (8 * b)) as u8;
            }
        }
        Ok(())
    }

    // ---- labels ----

    fn qualify(&self, name: &str) -> Result<heapless::String<NAME_CAP>, AsmError> {
        let mut qualified: heapless::String<NAME_CAP> = heapless::String::new();
        if name.starts_with('.') {
            qualified.push_str(self.scope.as_str()).ok();
        }
        if qualified.push_str(name).is_err() {
            Err(self.error(ErrorKind::Syntax, "label name too long"))?;
        }
        Ok(qualified)
    }

    fn define_label(&mut self, name: &str, addr: u32) -> Result<(), AsmError> {
        let local = name.starts_with('.');
        let qualified = self.qualify(name)?;
        if !local {
            self.scope.clear();
            let _ = self.scope.push_str(name);
        }

        if let Some(existing) = self.labels.iter_mut().find(|l| l.name == qualified) {
            if self.pass == 1 && existing.defined_in_pass == 1 {
                return Err(AsmError {
                    kind: ErrorKind::DuplicateLabel,
                    message: qualified.as_str().into(),
                    line: self.line,
                });
            }
            existing.addr = addr;
            existing.defined_in_pass = self.pass;
            return Ok(());
        }

        let label = Label {
            name: qualified,
            addr,
            defined_in_pass: self.pass,
        };
        if self.labels.push(label).is_err() {
            Err(self.error(ErrorKind::TableFull, "label table"))?;
        }
        Ok(())
    }

    /// A label's address, visible only once its definition has been walked
    /// in the current pass. Forward references stay unresolved on purpose.
    fn lookup_current(&self, qualified: &str) -> Option<u32> {
        self.labels
            .iter()
            .find(|l| l.name == qualified && l.defined_in_pass == self.pass)
            .map(|l| l.addr)
    }

    // ---- expressions ----

    pub(crate) fn eval_expr(&self, s: &str) -> Result<Value, AsmError> {
        let (value, rest) = self.eval_expr_prefix(s)?;
        if !rest.trim().is_empty() {
            Err(self.error(ErrorKind::Syntax, rest))?;
        }
        Ok(value)
    }

    /// Parse the longest expression at the head of `s`; returns the value and
    /// whatever follows (used by TIMES).
    pub(crate) fn eval_expr_prefix<'a>(&self, s: &'a str) -> Result<(Value, &'a str), AsmError> {
        let mut cursor = Cursor { s, pos: 0 };
        let value = self.expr(&mut cursor)?;
        Ok((value, &s[cursor.pos..]))
    }

    fn expr(&self, c: &mut Cursor) -> Result<Value, AsmError> {
        let mut acc = self.term(c)?;
        loop {
            c.skip_ws();
            match c.peek() {
                Some('+') => {
                    c.bump();
                    let rhs = self.term(c)?;
                    acc = Value::combine(acc, rhs, |a, b| a.wrapping_add(b));
                }
                Some('-') => {
                    c.bump();
                    let rhs = self.term(c)?;
                    acc = Value::combine(acc, rhs, |a, b| a.wrapping_sub(b));
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&self, c: &mut Cursor) -> Result<Value, AsmError> {
        let mut acc = self.factor(c)?;
        loop {
            c.skip_ws();
            match c.peek() {
                Some('*') => {
                    c.bump();
                    let rhs = self.factor(c)?;
                    acc = Value::combine(acc, rhs, |a, b| a.wrapping_mul(b));
                }
                Some('/') => {
                    c.bump();
                    let rhs = self.factor(c)?;
                    if rhs.resolved && rhs.value == 0 {
                        Err(self.error(ErrorKind::BadOperand, "division by zero"))?;
                    }
                    acc = Value::combine(acc, rhs, |a, b| a.wrapping_div(b));
                }
                _ => return Ok(acc),
            }
        }
    }

    fn factor(&self, c: &mut Cursor) -> Result<Value, AsmError> {
        c.skip_ws();
        match c.peek() {
            Some('(') => {
                c.bump();
                let inner = self.expr(c)?;
                c.skip_ws();
                if c.peek() != Some(')') {
                    Err(self.error(ErrorKind::Syntax, "missing )"))?;
                }
                c.bump();
                Ok(inner)
            }
            Some('-') => {
                c.bump();
                let inner = self.factor(c)?;
                Ok(Value::combine(Value::known(0), inner, |_, b| {
                    0i64.wrapping_sub(b)
                }))
            }
            Some('+') => {
                c.bump();
                self.factor(c)
            }
            Some('$') => {
                c.bump();
                if c.peek() == Some('$') {
                    c.bump();
                    Ok(Value::known(self.org as i64))
                } else {
                    Ok(Value::known(self.pc() as i64))
                }
            }
            Some('\'') => {
                let start = c.pos;
                c.bump();
                while let Some(ch) = c.peek() {
                    c.bump();
                    if ch == '\\' {
                        c.bump();
                    } else if ch == '\'' {
                        break;
                    }
                }
                let literal = &c.s[start..c.pos];
                match lexer::parse_char_literal(literal) {
                    Some(b) => Ok(Value::known(b as i64)),
                    None => Err(self.error(ErrorKind::Syntax, literal)),
                }
            }
            Some(ch) if ch.is_ascii_digit() => {
                let start = c.pos;
                while let Some(ch) = c.peek() {
                    if ch.is_ascii_alphanumeric() {
                        c.bump();
                    } else {
                        break;
                    }
                }
                let token = &c.s[start..c.pos];
                match lexer::parse_number(token) {
                    Some(n) => Ok(Value::known(n)),
                    None => Err(self.error(ErrorKind::Syntax, token)),
                }
            }
            Some(ch) if lexer::is_ident_start(ch) => {
                let start = c.pos;
                while let Some(ch) = c.peek() {
                    if lexer::is_ident_char(ch) {
                        c.bump();
                    } else {
                        break;
                    }
                }
                let name = &c.s[start..c.pos];
                let qualified = self.qualify(name)?;
                match self.lookup_current(&qualified) {
                    Some(addr) => Ok(Value::known(addr as i64)),
                    None => Ok(Value::pending(qualified)),
                }
            }
            _ => Err(self.error(ErrorKind::Syntax, "expected expression")),
        }
    }
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.bump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(source: &str) -> Vec<u8> {
        let mut asm = Assembler::new(0);
        asm.assemble(source).unwrap();
        asm.output().to_vec()
    }

    fn assemble_err(source: &str) -> AsmError {
        let mut asm = Assembler::new(0);
        asm.assemble(source).unwrap_err()
    }

    #[test]
    fn empty_program() {
        let mut asm = Assembler::new(0);
        asm.assemble("").unwrap();
        assert!(asm.output().is_empty());
        assert_eq!(asm.labels().count(), 0);

        asm.assemble("; only comments\n\n   \n").unwrap();
        assert!(asm.output().is_empty());
    }

    #[test]
    fn mov_imm32() {
        assert_eq!(assemble("MOV EAX, 0x12345678"), [0xb8, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn xor_inc_dec() {
        assert_eq!(assemble("XOR EAX, EAX"), [0x31, 0xc0]);
        assert_eq!(assemble("INC EAX"), [0x40]);
        assert_eq!(assemble("DEC EBX"), [0x4b]);
    }

    #[test]
    fn backward_short_jump() {
        assert_eq!(assemble("start: NOP\n       JMP start"), [0x90, 0xeb, 0xfd]);
    }

    #[test]
    fn forward_short_jump() {
        assert_eq!(assemble("JMP end\nNOP\nend:"), [0xeb, 0x01, 0x90]);
    }

    #[test]
    fn times_pads_a_boot_sector() {
        let out = assemble("DB 0xEB, 0x3C\nTIMES 510-($-$$) DB 0\nDW 0xAA55");
        assert_eq!(out.len(), 512);
        assert_eq!(&out[0..2], &[0xeb, 0x3c]);
        assert!(out[2..510].iter().all(|b| *b == 0));
        assert_eq!(&out[510..512], &[0x55, 0xaa]);
    }

    #[test]
    fn assembly_is_deterministic() {
        let src = "start: MOV EAX, data\n.loop: DEC EAX\nJNZ .loop\nCALL start\ndata: DD 1234";
        assert_eq!(assemble(src), assemble(src));
    }

    #[test]
    fn alu_immediate_forms() {
        // Sign-extended imm8 form.
        assert_eq!(assemble("ADD EAX, 5"), [0x83, 0xc0, 0x05]);
        // Accumulator short form for a wide immediate.
        assert_eq!(assemble("ADD EAX, 0x12345678"), [0x05, 0x78, 0x56, 0x34, 0x12]);
        // Generic r/m form.
        assert_eq!(assemble("ADD ECX, 300"), [0x81, 0xc1, 0x2c, 0x01, 0x00, 0x00]);
        assert_eq!(assemble("ADD AL, 5"), [0x04, 0x05]);
        assert_eq!(assemble("ADD BL, 5"), [0x80, 0xc3, 0x05]);
        assert_eq!(assemble("CMP EBX, ECX"), [0x39, 0xcb]);
        assert_eq!(assemble("SUB EAX, EBX"), [0x29, 0xd8]);
    }

    #[test]
    fn memory_operand_encodings() {
        assert_eq!(assemble("MOV EAX, [EBX]"), [0x8b, 0x03]);
        // [EBP] requires the disp8 form.
        assert_eq!(assemble("MOV EAX, [EBP]"), [0x8b, 0x45, 0x00]);
        // [ESP] requires a SIB byte.
        assert_eq!(assemble("MOV [ESP], EAX"), [0x89, 0x04, 0x24]);
        // base + scaled index + disp8.
        assert_eq!(assemble("MOV [EBX+ESI*4+8], EAX"), [0x89, 0x44, 0xb3, 0x08]);
        // Pure displacement: mod=0, rm=5, disp32.
        assert_eq!(
            assemble("MOV EAX, [0x1234]"),
            [0x8b, 0x05, 0x34, 0x12, 0x00, 0x00]
        );
        // disp32 form when the displacement is wide.
        assert_eq!(
            assemble("MOV EAX, [EBX+0x200]"),
            [0x8b, 0x83, 0x00, 0x02, 0x00, 0x00]
        );
        // Negative disp8.
        assert_eq!(assemble("MOV EAX, [EBP-4]"), [0x8b, 0x45, 0xfc]);
    }

    #[test]
    fn memory_immediates_need_a_size() {
        assert_eq!(assemble("MOV BYTE [EBX], 1"), [0xc6, 0x03, 0x01]);
        assert_eq!(
            assemble("MOV DWORD [EBX], 1"),
            [0xc7, 0x03, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            assemble("MOV DWORD PTR [EBX], 1"),
            [0xc7, 0x03, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(assemble_err("MOV [EBX], 1").kind, ErrorKind::BadOperand);
    }

    #[test]
    fn sixteen_bit_operands_get_the_prefix() {
        assert_eq!(assemble("MOV AX, BX"), [0x66, 0x89, 0xd8]);
        assert_eq!(assemble("INC CX"), [0x66, 0x41]);
        assert_eq!(assemble("MOV AX, 7"), [0x66, 0xb8, 0x07, 0x00]);
    }

    #[test]
    fn push_pop_forms() {
        assert_eq!(assemble("PUSH EAX"), [0x50]);
        assert_eq!(assemble("POP EBX"), [0x5b]);
        assert_eq!(assemble("PUSH 5"), [0x6a, 0x05]);
        assert_eq!(assemble("PUSH 0x12345678"), [0x68, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(assemble("PUSH DS"), [0x1e]);
        assert_eq!(assemble("POP ES"), [0x07]);
        assert_eq!(assemble("PUSH FS"), [0x0f, 0xa0]);
        assert_eq!(assemble_err("POP CS").kind, ErrorKind::BadOperand);
    }

    #[test]
    fn call_is_always_rel32() {
        assert_eq!(assemble("CALL fn\nfn:"), [0xe8, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            assemble("fn: NOP\nCALL fn"),
            [0x90, 0xe8, 0xfa, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn shift_forms() {
        assert_eq!(assemble("SHL EAX, 1"), [0xd1, 0xe0]);
        assert_eq!(assemble("SHR EAX, 3"), [0xc1, 0xe8, 0x03]);
        assert_eq!(assemble("SAR EAX, CL"), [0xd3, 0xf8]);
        assert_eq!(assemble("ROL BL, 2"), [0xc0, 0xc3, 0x02]);
    }

    #[test]
    fn conditional_jumps_pick_short_or_near() {
        // Backward, in range: short.
        assert_eq!(assemble("top: NOP\nJNZ top"), [0x90, 0x75, 0xfd]);

        // Backward, out of short range: near with 0x0F prefix.
        let mut src = String::from("top: NOP\n");
        for _ in 0..200 {
            src.push_str("NOP\n");
        }
        src.push_str("JNZ top");
        let out = assemble(&src);
        assert_eq!(out.len(), 201 + 6);
        assert_eq!(&out[201..203], &[0x0f, 0x85]);
        let rel = i32::from_le_bytes(out[203..207].try_into().unwrap());
        assert_eq!(rel, -(201 + 6));
    }

    #[test]
    fn forward_jump_too_far_fails_instead_of_rewriting() {
        let mut src = String::from("JMP end\n");
        for _ in 0..200 {
            src.push_str("NOP\n");
        }
        src.push_str("end:");
        assert_eq!(assemble_err(&src).kind, ErrorKind::JumpTooFar);
    }

    #[test]
    fn local_labels_are_scoped() {
        let src = "first:\n.loop: DEC EAX\nJNZ .loop\nsecond:\n.loop: NOP\nJMP .loop";
        let out = assemble(src);
        // Both .loop definitions coexist under different scopes.
        assert_eq!(out.len(), 1 + 2 + 1 + 2);

        let mut asm = Assembler::new(0);
        asm.assemble(src).unwrap();
        let names: Vec<&str> = asm.labels().map(|(n, _)| n).collect();
        assert!(names.contains(&"first.loop"));
        assert!(names.contains(&"second.loop"));
    }

    #[test]
    fn duplicate_labels_fail() {
        assert_eq!(assemble_err("a:\na:").kind, ErrorKind::DuplicateLabel);
        assert_eq!(
            assemble_err("a:\n.l:\nb:\na:").kind,
            ErrorKind::DuplicateLabel
        );
    }

    #[test]
    fn equ_defines_constants() {
        assert_eq!(assemble("size EQU 42\nMOV EAX, size"), [0xb8, 42, 0, 0, 0]);
        assert_eq!(assemble("NOP\nNOP\nlen EQU $-$$\nDB len"), [0x90, 0x90, 2]);
        assert_eq!(assemble_err("EQU 5").kind, ErrorKind::Syntax);
    }

    #[test]
    fn org_moves_the_origin() {
        // With org 0x7C00, a self-jump still encodes rel -2.
        assert_eq!(assemble("ORG 0x7C00\nstart: JMP start"), [0xeb, 0xfe]);

        let mut asm = Assembler::new(0);
        asm.assemble("ORG 0x7C00\nhere: DD here").unwrap();
        assert_eq!(asm.output(), [0x00, 0x7c, 0x00, 0x00]);
    }

    #[test]
    fn data_directives() {
        assert_eq!(assemble("DB 1, 2, 'A'"), [1, 2, 0x41]);
        assert_eq!(assemble("DB \"AB\", 0"), [0x41, 0x42, 0]);
        assert_eq!(assemble("DW 0x1234"), [0x34, 0x12]);
        assert_eq!(assemble("DD 0xDEADBEEF"), [0xef, 0xbe, 0xad, 0xde]);
        // Forward label in data, patched by a fixup.
        assert_eq!(assemble("DW here\nhere:"), [0x02, 0x00]);
        assert_eq!(assemble("DD here\nNOP\nhere:"), [0x05, 0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn string_and_rep_prefixes() {
        assert_eq!(assemble("REP MOVSB"), [0xf3, 0xa4]);
        assert_eq!(assemble("REPNE SCASB"), [0xf2, 0xae]);
        assert_eq!(assemble("MOVSD"), [0xa5]);
        assert_eq!(assemble("STOSW"), [0x66, 0xab]);
    }

    #[test]
    fn io_and_misc() {
        assert_eq!(assemble("IN AL, 0x60"), [0xe4, 0x60]);
        assert_eq!(assemble("IN AL, DX"), [0xec]);
        assert_eq!(assemble("OUT DX, AL"), [0xee]);
        assert_eq!(assemble("OUT 0x80, AL"), [0xe6, 0x80]);
        assert_eq!(assemble("INT 0x10"), [0xcd, 0x10]);
        assert_eq!(assemble("INT 3"), [0xcc]);
        assert_eq!(assemble("RET"), [0xc3]);
        assert_eq!(assemble("RET 8"), [0xc2, 0x08, 0x00]);
        assert_eq!(assemble("HLT"), [0xf4]);
        assert_eq!(assemble("LEA EAX, [EBX+4]"), [0x8d, 0x43, 0x04]);
        assert_eq!(assemble("MOVZX EAX, AL"), [0x0f, 0xb6, 0xc0]);
        assert_eq!(assemble("IMUL EAX, EBX"), [0x0f, 0xaf, 0xc3]);
        assert_eq!(assemble("IMUL EAX, 10"), [0x6b, 0xc0, 0x0a]);
        assert_eq!(assemble("XCHG EAX, EBX"), [0x93]);
        assert_eq!(assemble("XCHG BL, CL"), [0x86, 0xcb]);
    }

    #[test]
    fn error_reporting() {
        let e = assemble_err("NOP\nFROB EAX");
        assert_eq!(e.kind, ErrorKind::UnknownMnemonic);
        assert_eq!(e.line, 2);

        assert_eq!(assemble_err("MOV AL, 999").kind, ErrorKind::OutOfRange);
        assert_eq!(assemble_err("JMP nowhere").kind, ErrorKind::UndefinedLabel);
        assert_eq!(assemble_err("MOV EAX, [QZX]").kind, ErrorKind::UndefinedLabel);
        assert_eq!(assemble_err("MOV EAX,").kind, ErrorKind::BadOperand);
        assert_eq!(assemble_err("ADD AX, EBX").kind, ErrorKind::BadOperand);
    }

    #[test]
    fn labels_as_absolute_data_references() {
        // MOV EAX, label loads the label's address.
        let out = assemble("ORG 0x100\nMOV EAX, data\ndata: DD 7");
        assert_eq!(&out[0..5], &[0xb8, 0x05, 0x01, 0x00, 0x00]);

        // [label] becomes a pure disp32.
        let out = assemble("ORG 0x100\nMOV EAX, [data]\ndata: DD 7");
        assert_eq!(&out[0..6], &[0x8b, 0x05, 0x06, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn instruction_counter_counts_real_instructions() {
        let mut asm = Assembler::new(0);
        asm.assemble("NOP\nDB 1\nMOV EAX, 1").unwrap();
        assert_eq!(asm.instruction_count(), 2);
    }

    #[test]
    fn output_capacity_is_enforced() {
        let mut asm = Assembler::with_capacity(0, 4);
        assert_eq!(
            asm.assemble("DD 1\nDB 2").unwrap_err().kind,
            ErrorKind::BufferFull
        );
    }
}
