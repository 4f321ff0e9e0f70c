//! The scanner: turns a source buffer into an ordered list of [Token]s,
//! terminated by an EOF token. This is a hand-written byte-cursor scanner;
//! multi-character operators are matched greedily with rollback, and
//! keywords are recognized by re-typing identifier spellings after the fact.

use crate::{
    consts::MAX_IDENT_LENGTH,
    error::{LexError, SourceErrorWrapper, WithSource},
    token::{Token, TokenKind, TokenValue},
    util::Span,
    Compiler,
};
use bitflags::bitflags;
use std::iter;

bitflags! {
    /// Flags that alter what the scanner emits.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LexFlags: u32 {
        /// Emit `\n` as a token instead of discarding it as whitespace.
        const NEWLINE_TOKEN = 1;
        /// Emit `\` as a token instead of treating it as a line continuation.
        const BACKSLASH_TOKEN = 1 << 1;
        /// Never reinterpret identifier spellings as keywords or type names;
        /// every alphabetic word stays a plain identifier token.
        const FORCE_IDENT = 1 << 2;
    }
}

struct Lexer<'a> {
    buf: &'a [u8],
    pos: usize,
    /// 0-indexed; tokens report `lineno + 1`
    lineno: usize,
    savepos: usize,
    flags: LexFlags,
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'$' || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

/// Maps an identifier spelling to its keyword or type-name token kind, if
/// it has one.
fn keyword_kind(spelling: &str) -> TokenKind {
    match spelling {
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "return" => TokenKind::Return,
        "break" => TokenKind::Break,
        "char" => TokenKind::CharType,
        "short" => TokenKind::ShortType,
        "int" => TokenKind::IntType,
        "long" => TokenKind::LongType,
        "float" => TokenKind::FloatType,
        "double" => TokenKind::DoubleType,
        "void" => TokenKind::VoidType,
        "const" => TokenKind::Const,
        "unsigned" => TokenKind::Unsigned,
        "sizeof" => TokenKind::Sizeof,
        "__emit" => TokenKind::Emit,
        "struct" => TokenKind::Struct,
        "union" => TokenKind::Union,
        "typedef" => TokenKind::Typedef,
        "enum" => TokenKind::Enum,
        _ => TokenKind::Ident,
    }
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, flags: LexFlags) -> Self {
        Self {
            buf: source.as_bytes(),
            pos: 0,
            lineno: 0,
            savepos: 0,
            flags,
        }
    }

    fn next(&mut self) -> Option<u8> {
        let ch = self.buf.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn save(&mut self) {
        self.savepos = self.pos;
    }

    fn restore(&mut self) {
        self.pos = self.savepos;
    }

    /// Consumes the next byte only if it matches `want`.
    fn next_check(&mut self, want: u8) -> bool {
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err(
        &self,
        error: LexError,
        start: usize,
        line: usize,
    ) -> (LexError, Span) {
        (
            error,
            Span {
                start,
                end: self.pos,
                line,
            },
        )
    }

    fn make(
        &self,
        kind: TokenKind,
        value: TokenValue,
        start: usize,
        character_start: usize,
        line: usize,
    ) -> Token {
        Token {
            kind,
            value,
            line,
            start,
            end: self.pos,
            character_start,
        }
    }

    /// Scans the next token. `start` is the cursor position the scan began
    /// at; whitespace consumed on the way stays inside the token's
    /// `start..end` range while `character_start` points past it.
    fn token(&mut self, start: usize) -> Result<Token, (LexError, Span)> {
        loop {
            let character_start = self.pos;
            let line = self.lineno + 1;
            let ch = match self.next() {
                None => {
                    return Ok(self.make(
                        TokenKind::Eof,
                        TokenValue::None,
                        start,
                        character_start,
                        line,
                    ));
                }
                Some(ch) => ch,
            };

            let kind = match ch {
                b'\n' => {
                    self.lineno += 1;
                    if self.flags.contains(LexFlags::NEWLINE_TOKEN) {
                        TokenKind::Punct(b'\n')
                    } else {
                        continue;
                    }
                }
                b' ' | b'\t' | b'\r' => continue,

                b'/' => {
                    if self.next_check(b'/') {
                        self.line_comment();
                        continue;
                    } else if self.next_check(b'*') {
                        self.block_comment();
                        continue;
                    } else if self.next_check(b'=') {
                        TokenKind::DivAssign
                    } else {
                        TokenKind::Punct(b'/')
                    }
                }

                b'<' => {
                    if self.next_check(b'<') {
                        TokenKind::Shl
                    } else if self.next_check(b'=') {
                        TokenKind::LessEqual
                    } else {
                        TokenKind::Punct(b'<')
                    }
                }
                b'>' => {
                    if self.next_check(b'>') {
                        TokenKind::Shr
                    } else if self.next_check(b'=') {
                        TokenKind::GreaterEqual
                    } else {
                        TokenKind::Punct(b'>')
                    }
                }
                b'*' => {
                    if self.next_check(b'=') {
                        TokenKind::MulAssign
                    } else {
                        TokenKind::Punct(b'*')
                    }
                }
                b'^' => {
                    if self.next_check(b'=') {
                        TokenKind::XorAssign
                    } else {
                        TokenKind::Punct(b'^')
                    }
                }
                b'-' => {
                    if self.next_check(b'>') {
                        TokenKind::Arrow
                    } else if self.next_check(b'=') {
                        TokenKind::MinusAssign
                    } else if self.next_check(b'-') {
                        TokenKind::MinusMinus
                    } else {
                        TokenKind::Punct(b'-')
                    }
                }
                b'+' => {
                    if self.next_check(b'=') {
                        TokenKind::PlusAssign
                    } else if self.next_check(b'+') {
                        TokenKind::PlusPlus
                    } else {
                        TokenKind::Punct(b'+')
                    }
                }
                b'=' => {
                    if self.next_check(b'=') {
                        TokenKind::Equal
                    } else {
                        TokenKind::Punct(b'=')
                    }
                }
                b'|' => {
                    if self.next_check(b'=') {
                        TokenKind::OrAssign
                    } else {
                        TokenKind::Punct(b'|')
                    }
                }
                b'&' => {
                    if self.next_check(b'=') {
                        TokenKind::AndAssign
                    } else {
                        TokenKind::Punct(b'&')
                    }
                }
                b'%' => {
                    if self.next_check(b'=') {
                        TokenKind::ModAssign
                    } else {
                        TokenKind::Punct(b'%')
                    }
                }
                b'!' => {
                    if self.next_check(b'=') {
                        TokenKind::NotEqual
                    } else {
                        TokenKind::Punct(b'!')
                    }
                }

                b'.' => {
                    self.save();
                    if self.next() == Some(b'.') && self.next() == Some(b'.') {
                        TokenKind::Ellipsis
                    } else {
                        self.restore();
                        TokenKind::Punct(b'.')
                    }
                }

                b'"' => {
                    return self.string_literal(start, character_start, line);
                }
                b'\'' => {
                    return self.char_literal(start, character_start, line);
                }

                b'\\' => {
                    if self.flags.contains(LexFlags::BACKSLASH_TOKEN) {
                        TokenKind::Punct(b'\\')
                    } else if self.next_check(b'\n') {
                        // line continuation
                        self.lineno += 1;
                        continue;
                    } else {
                        return Err(self.err(
                            LexError::UnexpectedCharacter('\\'),
                            start,
                            line,
                        ));
                    }
                }

                b'0'..=b'9' => {
                    return self.number(ch, start, character_start, line);
                }
                ch if is_ident_start(ch) => {
                    return self.ident(ch, start, character_start, line);
                }
                // remaining printable punctuation passes through unchanged
                ch if (0x20..=0x7e).contains(&ch) => TokenKind::Punct(ch),
                ch => {
                    return Err(self.err(
                        LexError::UnexpectedCharacter(ch as char),
                        start,
                        line,
                    ));
                }
            };

            return Ok(self.make(
                kind,
                TokenValue::None,
                start,
                character_start,
                line,
            ));
        }
    }

    /// Consumes up to, but not including, the newline that terminates a `//`
    /// comment.
    fn line_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Consumes through the `*/` that terminates a block comment, or to the
    /// end of input. Not nested.
    fn block_comment(&mut self) {
        while let Some(ch) = self.next() {
            match ch {
                b'\n' => self.lineno += 1,
                b'*' if self.next_check(b'/') => return,
                _ => {}
            }
        }
    }

    fn string_literal(
        &mut self,
        start: usize,
        character_start: usize,
        line: usize,
    ) -> Result<Token, (LexError, Span)> {
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            let ch = match self.next() {
                None => {
                    return Err(self.err(
                        LexError::UnterminatedLiteral,
                        start,
                        line,
                    ));
                }
                Some(ch) => ch,
            };
            match ch {
                b'"' => break,
                b'\\' => {
                    let escaped = match self.next() {
                        None => {
                            return Err(self.err(
                                LexError::UnterminatedLiteral,
                                start,
                                line,
                            ));
                        }
                        Some(ch) => ch,
                    };
                    bytes.push(match escaped {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'\\' => b'\\',
                        // any other escape passes the byte through
                        other => other,
                    });
                }
                _ => {
                    if ch == b'\n' {
                        self.lineno += 1;
                    }
                    bytes.push(ch);
                }
            }
        }
        if bytes.len() > MAX_IDENT_LENGTH {
            return Err(self.err(LexError::IdentifierTooLong, start, line));
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(self.make(
            TokenKind::Str,
            TokenValue::Str(text),
            start,
            character_start,
            line,
        ))
    }

    /// A character constant is exactly one byte between single quotes and
    /// produces an integer token with that byte's value.
    fn char_literal(
        &mut self,
        start: usize,
        character_start: usize,
        line: usize,
    ) -> Result<Token, (LexError, Span)> {
        if self.next_check(b'\'') {
            return Err(self.err(
                LexError::EmptyCharacterConstant,
                start,
                line,
            ));
        }
        let ch = match self.next() {
            None => {
                return Err(self.err(LexError::UnterminatedLiteral, start, line));
            }
            Some(ch) => ch,
        };
        if !self.next_check(b'\'') {
            return Err(self.err(LexError::UnterminatedLiteral, start, line));
        }
        Ok(self.make(
            TokenKind::Integer,
            TokenValue::Integer(i32::from(ch)),
            start,
            character_start,
            line,
        ))
    }

    fn number(
        &mut self,
        first: u8,
        start: usize,
        character_start: usize,
        line: usize,
    ) -> Result<Token, (LexError, Span)> {
        if first == b'0' && self.next_check(b'x') {
            let mut value: u32 = 0;
            while let Some(ch) = self.peek() {
                if !ch.is_ascii_alphanumeric() {
                    break;
                }
                self.pos += 1;
                match (ch as char).to_digit(16) {
                    Some(digit) => value = (value << 4) | digit,
                    None => {
                        return Err(self.err(
                            LexError::MalformedNumber,
                            start,
                            line,
                        ));
                    }
                }
            }
            return Ok(self.make(
                TokenKind::Integer,
                TokenValue::Integer(value as i32),
                start,
                character_start,
                line,
            ));
        }

        let mut text = String::new();
        text.push(first as char);
        let mut is_int = true;
        loop {
            match self.peek() {
                Some(ch @ b'0'..=b'9') => {
                    self.pos += 1;
                    text.push(ch as char);
                }
                Some(b'.') => {
                    self.pos += 1;
                    // can't have more than one .
                    if !is_int {
                        return Err(self.err(
                            LexError::MalformedNumber,
                            start,
                            line,
                        ));
                    }
                    is_int = false;
                    text.push('.');
                }
                // trailing f terminates the literal and forces float type
                Some(b'f') => {
                    self.pos += 1;
                    is_int = false;
                    break;
                }
                _ => break,
            }
        }

        if is_int {
            match text.parse::<i32>() {
                Ok(value) => Ok(self.make(
                    TokenKind::Integer,
                    TokenValue::Integer(value),
                    start,
                    character_start,
                    line,
                )),
                Err(_) => {
                    Err(self.err(LexError::MalformedNumber, start, line))
                }
            }
        } else {
            match text.parse::<f32>() {
                Ok(value) => Ok(self.make(
                    TokenKind::Float,
                    TokenValue::Float(value),
                    start,
                    character_start,
                    line,
                )),
                Err(_) => {
                    Err(self.err(LexError::MalformedNumber, start, line))
                }
            }
        }
    }

    fn ident(
        &mut self,
        first: u8,
        start: usize,
        character_start: usize,
        line: usize,
    ) -> Result<Token, (LexError, Span)> {
        let mut text = String::new();
        text.push(first as char);
        while let Some(ch) = self.peek() {
            if !is_ident_continue(ch) {
                break;
            }
            self.pos += 1;
            text.push(ch as char);
        }
        if text.len() > MAX_IDENT_LENGTH {
            return Err(self.err(LexError::IdentifierTooLong, start, line));
        }

        let kind = if self.flags.contains(LexFlags::FORCE_IDENT) {
            TokenKind::Ident
        } else {
            keyword_kind(&text)
        };
        let value = if kind == TokenKind::Ident {
            TokenValue::Ident(text)
        } else {
            TokenValue::None
        };
        Ok(self.make(kind, value, start, character_start, line))
    }
}

/// Scans the whole buffer into a token list in source order, ending with an
/// EOF token whose `end` equals the input length.
pub(crate) fn tokenize(
    source: &str,
    flags: LexFlags,
) -> Result<Vec<Token>, (LexError, Span)> {
    let mut lexer = Lexer::new(source, flags);
    let mut tokens = Vec::new();
    loop {
        let start = lexer.pos;
        let token = lexer.token(start)?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

impl Compiler<()> {
    /// Scans the source into an ordered token list terminating in EOF.
    pub fn lex(self) -> Result<Compiler<Vec<Token>>, WithSource<LexError>> {
        match tokenize(&self.source, self.flags) {
            Ok(tokens) => Ok(Compiler {
                source: self.source,
                flags: self.flags,
                options: self.options,
                stage: tokens,
            }),
            Err((error, span)) => Err(WithSource::new(
                iter::once(SourceErrorWrapper::new(error, span, &self.source)),
                self.source,
            )),
        }
    }
}
