//! Line-level lexing for the assembler: comment stripping, label/mnemonic
//! splitting, operand separation, and literal parsing. Everything here is
//! context-free; expression evaluation lives with the assembler state.

/// A source line reduced to its parts. `rest` still contains the mnemonic
/// and operands.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Line<'a> {
    pub label: Option<&'a str>,
    pub rest: &'a str,
}

pub fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '.'
}

pub fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Cut a `;` comment, respecting quoted literals.
pub fn strip_comment(line: &str) -> &str {
    let mut in_string: Option<char> = None;
    for (i, c) in line.char_indices() {
        match in_string {
            Some(q) => {
                if c == q {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                ';' => return &line[..i],
                _ => {}
            },
        }
    }
    line
}

/// Split an optional leading `label:` (identifier or `.local` followed by a
/// colon) from the rest of the line.
pub fn split_line(line: &str) -> Line<'_> {
    let line = strip_comment(line).trim();
    let mut chars = line.char_indices();
    if let Some((_, c)) = chars.next() {
        if is_ident_start(c) {
            let mut end = line.len();
            for (i, c) in line.char_indices().skip(1) {
                if !is_ident_char(c) {
                    end = i;
                    break;
                }
            }
            if line[end..].starts_with(':') {
                return Line {
                    label: Some(&line[..end]),
                    rest: line[end + 1..].trim(),
                };
            }
        }
    }
    Line { label: None, rest: line }
}

/// Split the mnemonic from its operand text.
pub fn split_mnemonic(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    match rest.find(|c: char| c.is_ascii_whitespace()) {
        Some(i) => Some((&rest[..i], rest[i..].trim())),
        None => Some((rest, "")),
    }
}

/// Iterate comma-separated operands, ignoring commas inside brackets and
/// quoted literals.
pub fn split_operands(s: &str) -> impl Iterator<Item = &str> {
    let mut parts = alloc::vec::Vec::new();
    let s = s.trim();
    if !s.is_empty() {
        let mut depth = 0usize;
        let mut in_string: Option<char> = None;
        let mut start = 0;
        for (i, c) in s.char_indices() {
            match in_string {
                Some(q) => {
                    if c == q {
                        in_string = None;
                    }
                }
                None => match c {
                    '\'' | '"' => in_string = Some(c),
                    '[' | '(' => depth += 1,
                    ']' | ')' => depth = depth.saturating_sub(1),
                    ',' if depth == 0 => {
                        parts.push(s[start..i].trim());
                        start = i + 1;
                    }
                    _ => {}
                },
            }
        }
        parts.push(s[start..].trim());
    }
    parts.into_iter()
}

/// Numeric literal: decimal, `0x…` hex, `0b…` binary, leading-0 octal,
/// trailing-`h` hex.
pub fn parse_number(s: &str) -> Option<i64> {
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if s.is_empty() {
        return None;
    }
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(hex) = s
        .strip_suffix('h')
        .or_else(|| s.strip_suffix('H'))
        .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_hexdigit()))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else if s.len() > 1 && s.starts_with('0') && s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        i64::from_str_radix(s, 8).ok()?
    } else if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()?
    } else {
        return None;
    };
    Some(if negative { -value } else { value })
}

/// `'c'` with the escapes `\n \r \t \0 \\ \'`.
pub fn parse_char_literal(s: &str) -> Option<u8> {
    let inner = s.strip_prefix('\'')?.strip_suffix('\'')?;
    match inner.as_bytes() {
        [c] if *c != b'\\' => Some(*c),
        [b'\\', esc] => match esc {
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'0' => Some(0),
            b'\\' => Some(b'\\'),
            b'\'' => Some(b'\''),
            _ => None,
        },
        _ => None,
    }
}

/// A `"…"` string literal (used by DB). No escape processing; bytes are
/// taken as-is.
pub fn parse_string_literal(s: &str) -> Option<&str> {
    s.strip_prefix('"')?.strip_suffix('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_labels_split_off() {
        let line = split_line("start: mov eax, 1 ; set up");
        assert_eq!(line.label, Some("start"));
        assert_eq!(line.rest, "mov eax, 1");

        let line = split_line(".loop: dec eax");
        assert_eq!(line.label, Some(".loop"));
        assert_eq!(line.rest, "dec eax");

        let line = split_line("   ; only a comment");
        assert_eq!(line.label, None);
        assert_eq!(line.rest, "");
    }

    #[test]
    fn a_semicolon_in_a_string_is_not_a_comment() {
        let line = split_line("db \"a;b\" ; trailing");
        assert_eq!(line.rest, "db \"a;b\"");
    }

    #[test]
    fn mnemonic_and_operands() {
        assert_eq!(split_mnemonic("mov eax, 1"), Some(("mov", "eax, 1")));
        assert_eq!(split_mnemonic("ret"), Some(("ret", "")));
        assert_eq!(split_mnemonic("  "), None);
    }

    #[test]
    fn operand_commas_respect_brackets_and_strings() {
        let ops: Vec<&str> = split_operands("eax, [ebx+4], 'x'").collect();
        assert_eq!(ops, ["eax", "[ebx+4]", "'x'"]);
        let ops: Vec<&str> = split_operands("\"a,b\", 1").collect();
        assert_eq!(ops, ["\"a,b\"", "1"]);
        assert_eq!(split_operands("").count(), 0);
    }

    #[test]
    fn number_bases() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x2A"), Some(42));
        assert_eq!(parse_number("2Ah"), Some(42));
        assert_eq!(parse_number("0b101010"), Some(42));
        assert_eq!(parse_number("052"), Some(42));
        assert_eq!(parse_number("-5"), Some(-5));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("12x"), None);
        assert_eq!(parse_number("abc"), None);
    }

    #[test]
    fn char_literals() {
        assert_eq!(parse_char_literal("'A'"), Some(65));
        assert_eq!(parse_char_literal("'\\n'"), Some(10));
        assert_eq!(parse_char_literal("'\\0'"), Some(0));
        assert_eq!(parse_char_literal("'\\''"), Some(39));
        assert_eq!(parse_char_literal("'ab'"), None);
    }
}
