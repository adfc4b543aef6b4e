/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Lexical analysis for the OVN logical action language.
//!
//! Numeric tokens cover plain integers as well as IPv4, IPv6 and Ethernet addresses, all
//! represented as a 128-bit value with an optional mask and a note of how the constant was
//! written, so that it can be printed back the same way.

use anyhow::Result;
use thiserror::Error;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::addresses::{ip_is_cidr, EthAddr};

#[derive(Error, Debug)]
#[error("{0}")]
pub struct LexError(pub String);

/// How a numeric constant was written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntFormat {
    Decimal,
    Hexadecimal,
    Ipv4,
    Ipv6,
    Ethernet,
}

impl IntFormat {
    fn max_bits(&self) -> u32 {
        match self {
            IntFormat::Decimal | IntFormat::Hexadecimal => 128,
            IntFormat::Ipv4 => 32,
            IntFormat::Ipv6 => 128,
            IntFormat::Ethernet => 48,
        }
    }
}

/// Formats `value` the way that `format` writes it.
pub fn format_int(value: u128, format: IntFormat) -> String {
    match format {
        IntFormat::Decimal => value.to_string(),
        IntFormat::Hexadecimal => format!("{:#x}", value),
        IntFormat::Ipv4 => Ipv4Addr::from(value as u32).to_string(),
        IntFormat::Ipv6 => Ipv6Addr::from(value).to_string(),
        IntFormat::Ethernet => EthAddr::from_u64(value as u64).to_string(),
    }
}

fn format_masked_int(value: u128, mask: Option<u128>, format: IntFormat) -> String {
    let mut s = format_int(value, format);
    match (mask, format) {
        (None, _) => (),
        (Some(mask), IntFormat::Ipv4) if ip_is_cidr(Ipv4Addr::from(mask as u32)) => {
            s += &format!("/{}", (mask as u32).leading_ones());
        },
        (Some(mask), IntFormat::Ipv6) if mask.leading_ones() + mask.trailing_zeros() == 128 => {
            s += &format!("/{}", mask.leading_ones());
        },
        (Some(mask), _) => {
            s.push('/');
            s += &format_int(mask, format);
        },
    }
    s
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    End,
    Id(String),
    String(String),
    Integer { value: u128, mask: Option<u128>, format: IntFormat },
    /// `$name`.
    MacroRef(String),

    LParen,
    RParen,
    LCurly,
    RCurly,
    LSquare,
    RSquare,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogNot,
    LogAnd,
    LogOr,

    Ellipsis,
    Comma,
    Semicolon,
    Equals,
    Exchange,
    Decrement,
    Colon,
}

impl Token {
    fn id(s: &str) -> Token {
        Token::Id(s.into())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::End => write!(f, "$"),
            Token::Id(s) => write!(f, "{}", s),
            Token::String(s) => write!(f, "{}", quote(s)),
            Token::Integer { value, mask, format } => write!(f, "{}", format_masked_int(*value, *mask, *format)),
            Token::MacroRef(s) => write!(f, "${}", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LCurly => write!(f, "{{"),
            Token::RCurly => write!(f, "}}"),
            Token::LSquare => write!(f, "["),
            Token::RSquare => write!(f, "]"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::LogNot => write!(f, "!"),
            Token::LogAnd => write!(f, "&&"),
            Token::LogOr => write!(f, "||"),
            Token::Ellipsis => write!(f, ".."),
            Token::Comma => write!(f, ","),
            Token::Semicolon => write!(f, ";"),
            Token::Equals => write!(f, "="),
            Token::Exchange => write!(f, "<->"),
            Token::Decrement => write!(f, "--"),
            Token::Colon => write!(f, ":"),
        }
    }
}

fn is_id1(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_idn(c: u8) -> bool {
    is_id1(c) || c.is_ascii_digit() || c == b'.'
}

/// A tokenizer with one token of lookahead.
pub struct Lexer<'a> {
    input: &'a str,
    /// Offset just past the current token.
    pos: usize,
    pub token: Token,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer for `input` positioned at its first token.
    pub fn new(input: &'a str) -> Result<Lexer<'a>> {
        let mut lexer = Lexer { input, pos: 0, token: Token::End };
        lexer.get()?;
        Ok(lexer)
    }

    /// Advances to the next token.
    pub fn get(&mut self) -> Result<()> {
        let (token, pos) = self.lex_at(self.pos)?;
        self.token = token;
        self.pos = pos;
        Ok(())
    }

    /// Returns the token after the current one, without advancing.
    pub fn lookahead(&self) -> Result<Token> {
        Ok(self.lex_at(self.pos)?.0)
    }

    /// Advances past the current token if it is `token`.
    pub fn match_(&mut self, token: &Token) -> Result<bool> {
        if self.token == *token {
            self.get()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn match_id(&mut self, id: &str) -> Result<bool> {
        if matches!(&self.token, Token::Id(s) if s == id) {
            self.get()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn is_id(&self, id: &str) -> bool {
        matches!(&self.token, Token::Id(s) if s == id)
    }

    /// Advances past `token` or fails with a syntax error.
    pub fn force_match(&mut self, token: &Token) -> Result<()> {
        if self.match_(token)? {
            Ok(())
        } else {
            Err(self.syntax_error(Some(&format!("expecting `{}'", token))))
        }
    }

    /// Parses a nonnegative integer written in decimal or hexadecimal.
    pub fn get_int(&mut self) -> Result<i64> {
        match self.token {
            Token::Integer { value, mask: None, format: IntFormat::Decimal | IntFormat::Hexadecimal }
                if value <= i64::MAX as u128 => {
                    self.get()?;
                    Ok(value as i64)
                },
            _ => Err(self.syntax_error(Some("expecting integer"))),
        }
    }

    /// An error that points at the current token.
    pub fn syntax_error(&self, message: Option<&str>) -> anyhow::Error {
        let at = match self.token {
            Token::End => "Syntax error at end of input".to_string(),
            _ => format!("Syntax error at `{}'", self.token),
        };
        LexError(match message {
            Some(message) => format!("{} {}.", at, message),
            None => format!("{}.", at),
        }).into()
    }

    fn skip_space(&self, mut pos: usize) -> Result<usize> {
        let bytes = self.input.as_bytes();
        loop {
            match bytes.get(pos) {
                Some(c) if c.is_ascii_whitespace() => pos += 1,
                Some(b'/') if bytes.get(pos + 1) == Some(&b'*') => {
                    match self.input[pos + 2..].find("*/") {
                        Some(end) => pos += end + 4,
                        None => Err(LexError("`/*' without matching `*/'".into()))?,
                    }
                },
                Some(b'/') if bytes.get(pos + 1) == Some(&b'/') => {
                    pos = self.input[pos..].find('\n').map_or(bytes.len(), |end| pos + end);
                },
                _ => return Ok(pos),
            }
        }
    }

    fn lex_at(&self, pos: usize) -> Result<(Token, usize)> {
        let bytes = self.input.as_bytes();
        let start = self.skip_space(pos)?;
        let c = match bytes.get(start) {
            Some(&c) => c,
            None => return Ok((Token::End, start)),
        };
        let next = bytes.get(start + 1).copied();
        let punct = |token: Token, len: usize| -> Result<(Token, usize)> { Ok((token, start + len)) };
        match c {
            b'(' => punct(Token::LParen, 1),
            b')' => punct(Token::RParen, 1),
            b'{' => punct(Token::LCurly, 1),
            b'}' => punct(Token::RCurly, 1),
            b'[' => punct(Token::LSquare, 1),
            b']' => punct(Token::RSquare, 1),
            b',' => punct(Token::Comma, 1),
            b';' => punct(Token::Semicolon, 1),
            b'=' if next == Some(b'=') => punct(Token::Eq, 2),
            b'=' => punct(Token::Equals, 1),
            b'!' if next == Some(b'=') => punct(Token::Ne, 2),
            b'!' => punct(Token::LogNot, 1),
            b'<' if self.input[start..].starts_with("<->") => punct(Token::Exchange, 3),
            b'<' if next == Some(b'=') => punct(Token::Le, 2),
            b'<' => punct(Token::Lt, 1),
            b'>' if next == Some(b'=') => punct(Token::Ge, 2),
            b'>' => punct(Token::Gt, 1),
            b'&' if next == Some(b'&') => punct(Token::LogAnd, 2),
            b'|' if next == Some(b'|') => punct(Token::LogOr, 2),
            b'-' if next == Some(b'-') => punct(Token::Decrement, 2),
            b'.' if next == Some(b'.') => punct(Token::Ellipsis, 2),
            b':' if next == Some(b':') => self.lex_number(start),
            b':' => punct(Token::Colon, 1),
            b'"' => self.lex_string(start),
            b'$' => {
                let end = self.scan_id(start + 1);
                if end == start + 1 {
                    Err(LexError("`$' must be followed by a valid identifier.".into()))?
                }
                Ok((Token::MacroRef(self.input[start + 1..end].into()), end))
            },
            c if c.is_ascii_digit() => self.lex_number(start),
            c if is_id1(c) => {
                let end = self.scan_id(start);
                let id = &self.input[start..end];
                // "aa:bb:..." and "fe80::1" start out looking like identifiers.
                if bytes.get(end) == Some(&b':') && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                    self.lex_number(start)
                } else {
                    Ok((Token::id(id), end))
                }
            },
            _ => {
                let ch = self.input[start..].chars().next().unwrap_or('?');
                Err(LexError(format!("Invalid character `{}' in input.", ch)))?
            }
        }
    }

    fn scan_id(&self, start: usize) -> usize {
        let bytes = self.input.as_bytes();
        let mut end = start;
        if end < bytes.len() && is_id1(bytes[end]) {
            while end < bytes.len() && is_idn(bytes[end]) {
                end += 1;
            }
        }
        end
    }

    fn lex_string(&self, start: usize) -> Result<(Token, usize)> {
        let mut s = String::new();
        let mut chars = self.input[start + 1..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => return Ok((Token::String(s), start + 1 + i + 1)),
                '\\' => match chars.next() {
                    Some((_, c)) => s.push(c),
                    None => break,
                },
                _ => s.push(c),
            }
        }
        Err(LexError("Input ends inside quoted string.".into()))?
    }

    /// Scans one numeric value without a mask.
    fn scan_number(&self, start: usize) -> Result<(u128, IntFormat, usize)> {
        let bytes = self.input.as_bytes();
        let mut end = start;
        while end < bytes.len() {
            let c = bytes[end];
            if c.is_ascii_alphanumeric() || c == b':' || (c == b'.' && bytes.get(end + 1) != Some(&b'.')) {
                end += 1;
            } else {
                break;
            }
        }
        let run = &self.input[start..end];
        if run.contains(':') {
            if let Ok(ea) = run.parse::<EthAddr>() {
                return Ok((ea.to_u64() as u128, IntFormat::Ethernet, end));
            }
            if let Ok(ip6) = run.parse::<Ipv6Addr>() {
                return Ok((u128::from(ip6), IntFormat::Ipv6, end));
            }
        }

        // Anything after a colon is a separate token, as in "10.0.0.2:80".
        let (run, end) = match run.find(':') {
            Some(colon) if colon > 0 => (&run[..colon], start + colon),
            _ => (run, end),
        };
        if run.bytes().filter(|&b| b == b'.').count() == 3 {
            if let Ok(ip4) = run.parse::<Ipv4Addr>() {
                return Ok((u32::from(ip4) as u128, IntFormat::Ipv4, end));
            }
        }
        let hex = run.strip_prefix("0x").or_else(|| run.strip_prefix("0X"));
        let parsed = match hex {
            Some(hex) => u128::from_str_radix(hex, 16).map(|v| (v, IntFormat::Hexadecimal)),
            None => run.parse::<u128>().map(|v| (v, IntFormat::Decimal)),
        };
        match parsed {
            Ok((value, format)) => Ok((value, format, end)),
            Err(_) => Err(LexError(format!("Invalid numeric constant `{}'.", run)))?,
        }
    }

    fn lex_number(&self, start: usize) -> Result<(Token, usize)> {
        let (value, format, end) = self.scan_number(start)?;
        if self.input.as_bytes().get(end) != Some(&b'/') {
            return Ok((Token::Integer { value, mask: None, format }, end));
        }

        let (mask, mask_format, end) = self.scan_number(end + 1)?;
        let mask = match (format, mask_format) {
            (IntFormat::Ipv4, IntFormat::Decimal) | (IntFormat::Ipv6, IntFormat::Decimal) => {
                let bits = format.max_bits();
                if mask > bits as u128 {
                    Err(LexError(format!("Prefix length {} is out of range.", mask)))?
                }
                let ones = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
                if mask == 0 { 0 } else { (ones << (bits - mask as u32)) & ones }
            },
            (IntFormat::Decimal, IntFormat::Hexadecimal) | (IntFormat::Hexadecimal, IntFormat::Decimal) => mask,
            (a, b) if a == b => mask,
            _ => Err(LexError("Value and mask have incompatible formats.".into()))?,
        };
        if value & !mask != 0 {
            Err(LexError("Value contains unmasked 1-bits.".into()))?
        }
        Ok((Token::Integer { value, mask: Some(mask), format }, end))
    }

    /// Parses a constant: an integer, an address, or a string.
    pub fn parse_constant(&mut self) -> Result<Constant> {
        let constant = match &self.token {
            Token::Integer { value, mask, format } => Constant::Integer { value: *value, mask: *mask, format: *format },
            Token::String(s) => Constant::String(s.clone()),
            _ => return Err(self.syntax_error(Some("expecting constant"))),
        };
        self.get()?;
        Ok(constant)
    }

    /// Parses a single constant or a `{...}` list of constants of the same type.
    pub fn parse_constant_set(&mut self) -> Result<ConstantSet> {
        if !self.match_(&Token::LCurly)? {
            let value = self.parse_constant()?;
            return Ok(ConstantSet { values: vec![value], in_curlies: false });
        }
        let mut values: Vec<Constant> = Vec::new();
        while !self.match_(&Token::RCurly)? {
            let is_string = matches!(self.token, Token::String(_));
            if let Some(first) = values.first() {
                if first.is_string() != is_string {
                    let expecting = if first.is_string() { "expecting string" } else { "expecting integer" };
                    return Err(self.syntax_error(Some(expecting)));
                }
            }
            values.push(self.parse_constant()?);
            self.match_(&Token::Comma)?;
        }
        Ok(ConstantSet { values, in_curlies: true })
    }
}

/// A constant in an action, such as the value assigned to a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constant {
    Integer { value: u128, mask: Option<u128>, format: IntFormat },
    String(String),
}

impl Constant {
    pub fn is_string(&self) -> bool {
        matches!(self, Constant::String(_))
    }

    /// The number of bits needed to represent the value.
    pub fn width(&self) -> u32 {
        match self {
            Constant::Integer { value, .. } => 128 - value.leading_zeros(),
            Constant::String(_) => 0,
        }
    }

    pub fn integer(&self) -> Option<u128> {
        match self {
            Constant::Integer { value, .. } => Some(*value),
            Constant::String(_) => None,
        }
    }

    pub fn mask(&self) -> Option<u128> {
        match self {
            Constant::Integer { mask, .. } => *mask,
            Constant::String(_) => None,
        }
    }

    /// The prefix length of an IPv4 constant: 32 without a mask.
    pub fn ipv4_plen(&self) -> u32 {
        match self.mask() {
            Some(mask) => (mask as u32).count_ones(),
            None => 32,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Integer { value, mask, format } => write!(f, "{}", format_masked_int(*value, *mask, *format)),
            Constant::String(s) => write!(f, "{}", quote(s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantSet {
    pub values: Vec<Constant>,
    pub in_curlies: bool,
}

impl ConstantSet {
    pub fn is_string(&self) -> bool {
        self.values.first().map_or(false, Constant::is_string)
    }
}

impl fmt::Display for ConstantSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.in_curlies && self.values.len() == 1 {
            return write!(f, "{}", self.values[0]);
        }
        write!(f, "{{")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Result<Vec<Token>> {
        let mut lexer = Lexer::new(s)?;
        let mut tokens = Vec::new();
        while lexer.token != Token::End {
            tokens.push(lexer.token.clone());
            lexer.get()?;
        }
        Ok(tokens)
    }

    fn token_strings(s: &str) -> Vec<String> {
        tokens(s).unwrap().iter().map(Token::to_string).collect()
    }

    #[test]
    fn punctuation_and_ids() {
        assert_eq!(token_strings("ip4.dst <-> ip4.src; ip.ttl--; reg0[0..15] == 1 && !ct.est"),
                   vec!["ip4.dst", "<->", "ip4.src", ";", "ip.ttl", "--", ";",
                        "reg0", "[", "0", "..", "15", "]", "==", "1", "&&", "!", "ct.est"]);
    }

    #[test]
    fn addresses() -> Result<()> {
        assert_eq!(tokens("aa:bb:cc:dd:ee:ff")?,
                   vec![Token::Integer { value: 0xaabbccddeeff, mask: None, format: IntFormat::Ethernet }]);
        assert_eq!(token_strings("fe80::1 ff02::1:2 :: 10.0.0.0/24 0x10/0xf0"),
                   vec!["fe80::1", "ff02::1:2", "::", "10.0.0.0/24", "0x10/0xf0"]);
        assert_eq!(token_strings("ct_lb(10.0.0.2:80,10.0.0.3);"),
                   vec!["ct_lb", "(", "10.0.0.2", ":", "80", ",", "10.0.0.3", ")", ";"]);
        Ok(())
    }

    #[test]
    fn strings_and_comments() -> Result<()> {
        assert_eq!(tokens(r#"outport = "lsp\"1"; /* comment */ output;"#)?,
                   vec![Token::id("outport"), Token::Equals, Token::String("lsp\"1".into()), Token::Semicolon,
                        Token::id("output"), Token::Semicolon]);
        assert_eq!(token_strings("$set1 // trailing"), vec!["$set1"]);
        Ok(())
    }

    #[test]
    fn errors() {
        assert_eq!(tokens("\"abc").unwrap_err().to_string(), "Input ends inside quoted string.");
        assert_eq!(tokens("10.0.0.1/24").unwrap_err().to_string(), "Value contains unmasked 1-bits.");
        assert_eq!(tokens("12ab").unwrap_err().to_string(), "Invalid numeric constant `12ab'.");
        assert!(tokens("a # b").is_err());
    }

    #[test]
    fn lookahead_and_errors() -> Result<()> {
        let mut lexer = Lexer::new("next(3);")?;
        assert_eq!(lexer.lookahead()?, Token::LParen);
        assert!(lexer.match_id("next")?);
        lexer.force_match(&Token::LParen)?;
        assert_eq!(lexer.get_int()?, 3);
        assert_eq!(lexer.force_match(&Token::Comma).unwrap_err().to_string(),
                   "Syntax error at `)' expecting `,'.");
        Ok(())
    }

    #[test]
    fn constant_sets() -> Result<()> {
        let mut lexer = Lexer::new("{10.0.0.1, 10.0.0.2} 8")?;
        let set = lexer.parse_constant_set()?;
        assert_eq!(set.to_string(), "{10.0.0.1, 10.0.0.2}");
        assert_eq!(lexer.parse_constant_set()?.values[0].width(), 4);

        let mut lexer = Lexer::new("{1, \"x\"}")?;
        assert_eq!(lexer.parse_constant_set().unwrap_err().to_string(),
                   "Syntax error at `\"x\"' expecting integer.");
        Ok(())
    }
}
