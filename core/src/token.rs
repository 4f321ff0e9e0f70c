//! The lexical token model: token kinds, payloads and source positions.
//! There is no behavior here beyond display formatting; the scanner that
//! produces tokens lives in [crate::lex].

use crate::util::Span;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// The kind of a token. Single-byte punctuation re-uses the byte itself
/// (`Punct`); everything that spans more than one byte or carries a payload
/// gets a named kind.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum TokenKind {
    /// A single printable-ASCII punctuation byte, e.g. `;` or `{`.
    Punct(u8),

    Ident,
    Integer,
    Float,
    Str,

    PlusAssign,
    MinusAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    XorAssign,
    OrAssign,
    AndAssign,
    LessEqual,
    GreaterEqual,
    Equal,
    NotEqual,
    Shl,
    Shr,
    Arrow,
    PlusPlus,
    MinusMinus,
    Ellipsis,

    If,
    Else,
    For,
    While,
    Do,
    Return,
    Break,
    Sizeof,
    Const,
    Struct,
    Union,
    Typedef,
    Enum,
    Emit,

    CharType,
    ShortType,
    IntType,
    LongType,
    FloatType,
    DoubleType,
    VoidType,
    Unsigned,

    Eof,
    Invalid,
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Punct(b) => return write!(f, "{}", *b as char),
            Self::Ident => "identifier",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Str => "string",
            Self::PlusAssign => "+=",
            Self::MinusAssign => "-=",
            Self::MulAssign => "*=",
            Self::DivAssign => "/=",
            Self::ModAssign => "%=",
            Self::XorAssign => "^=",
            Self::OrAssign => "|=",
            Self::AndAssign => "&=",
            Self::LessEqual => "<=",
            Self::GreaterEqual => ">=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Arrow => "->",
            Self::PlusPlus => "++",
            Self::MinusMinus => "--",
            Self::Ellipsis => "...",
            Self::If => "if",
            Self::Else => "else",
            Self::For => "for",
            Self::While => "while",
            Self::Do => "do",
            Self::Return => "return",
            Self::Break => "break",
            Self::Sizeof => "sizeof",
            Self::Const => "const",
            Self::Struct => "struct",
            Self::Union => "union",
            Self::Typedef => "typedef",
            Self::Enum => "enum",
            Self::Emit => "__emit",
            Self::CharType => "char",
            Self::ShortType => "short",
            Self::IntType => "int",
            Self::LongType => "long",
            Self::FloatType => "float",
            Self::DoubleType => "double",
            Self::VoidType => "void",
            Self::Unsigned => "unsigned",
            Self::Eof => "eof",
            Self::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

/// The payload carried by a token. Only literal and identifier tokens carry
/// one; everything else is `None`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TokenValue {
    None,
    Ident(String),
    Integer(i32),
    Float(f32),
    Str(String),
}

impl TokenValue {
    /// The identifier or string payload, if this token carries text.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Ident(s) | Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One lexical token. `start` is the byte position where scanning of this
/// token began (including any leading whitespace that was consumed on the
/// way), `character_start` the position of the first non-whitespace byte,
/// and `end` the position one past the last byte of the token.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: TokenValue,
    /// 1-indexed line the token starts on.
    pub line: usize,
    pub start: usize,
    pub end: usize,
    pub character_start: usize,
}

impl Token {
    /// The span of the token proper (leading whitespace excluded).
    pub fn span(&self) -> Span {
        Span {
            start: self.character_start,
            end: self.end,
            line: self.line,
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.value {
            TokenValue::None => write!(f, "{}", self.kind),
            TokenValue::Ident(s) => write!(f, "{} `{}`", self.kind, s),
            TokenValue::Integer(n) => write!(f, "{} {}", self.kind, n),
            TokenValue::Float(x) => write!(f, "{} {}", self.kind, x),
            TokenValue::Str(s) => write!(f, "{} {:?}", self.kind, s),
        }
    }
}
