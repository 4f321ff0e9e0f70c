//! All error-related minicc types.
//!
//! Errors here always describe a flaw in the program being compiled, _not_
//! an internal compiler error. Compiler bugs will always cause a panic.

use crate::util::{self, Span};
use failure::Fail;
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};

/// A trait for any error that originates in source code. [SourceError]s rely
/// on having source code present in order to display themselves.
pub trait SourceError: 'static + Send + Sync + Debug + Serialize {
    /// Format this error into a simple message. `spanned_src` is the slice of
    /// the source code that corresponds to this error's [Span]. This needs to
    /// be provided by the caller in order to create a proper error message.
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result;
}

/// An error that occurs while scanning source text into tokens.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum LexError {
    /// A string or character literal was not closed before end of input
    UnterminatedLiteral,
    /// A numeric literal with two decimal points, an invalid hex digit, or a
    /// value that doesn't fit the integer type
    MalformedNumber,
    /// `''`
    EmptyCharacterConstant,
    /// An identifier or string payload longer than the fixed bound
    IdentifierTooLong,
    /// A byte the scanner has no rule for
    UnexpectedCharacter(char),
}

impl SourceError for LexError {
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::UnterminatedLiteral => {
                write!(f, "Unterminated literal `{}`", spanned_src)
            }
            Self::MalformedNumber => {
                write!(f, "Malformed number `{}`", spanned_src)
            }
            Self::EmptyCharacterConstant => {
                write!(f, "Empty character constant")
            }
            Self::IdentifierTooLong => write!(
                f,
                "Identifier or string too long (max {} bytes): `{}`",
                crate::consts::MAX_IDENT_LENGTH,
                spanned_src
            ),
            Self::UnexpectedCharacter(c) => {
                write!(f, "Unexpected character `{}`", c.escape_default())
            }
        }
    }
}

/// An error that occurs while building the syntax tree from the token list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ParseError {
    /// A token that no grammar rule accepts at this point
    UnexpectedToken(String),
    /// A specific token was required but something else appeared
    ExpectedToken { expected: String, found: String },
    /// Array sizes must be positive
    InvalidArraySize(i32),
    /// More parameters than a function can declare
    TooManyParameters,
    /// More arguments than a call can pass
    TooManyArguments,
    /// More fields than a struct/union can declare
    TooManyFields,
    /// More enumerators than an enum can declare
    TooManyEnumValues,
    /// More children than a comma sequence can hold
    TooManyExpressions,
}

impl SourceError for ParseError {
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::UnexpectedToken(found) => {
                write!(f, "Unexpected {}", found)
            }
            Self::ExpectedToken { expected, found } => {
                write!(f, "Expected `{}`, found {}", expected, found)
            }
            Self::InvalidArraySize(size) => {
                write!(f, "Invalid array size {} in `{}`", size, spanned_src)
            }
            Self::TooManyParameters => write!(
                f,
                "Too many parameters (max {})",
                crate::consts::MAX_PARAMETERS
            ),
            Self::TooManyArguments => write!(
                f,
                "Too many arguments (max {})",
                crate::consts::MAX_ARGUMENTS
            ),
            Self::TooManyFields => {
                write!(f, "Too many fields (max {})", crate::consts::MAX_FIELDS)
            }
            Self::TooManyEnumValues => write!(
                f,
                "Too many enum values (max {})",
                crate::consts::MAX_ENUM_VALUES
            ),
            Self::TooManyExpressions => write!(
                f,
                "Too many expressions in sequence (max {})",
                crate::consts::MAX_SEQ_EXPRESSIONS
            ),
        }
    }
}

/// An error that occurs while emitting machine code from the syntax tree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum CodegenError {
    /// The generator reached a node kind it has no emission rule for
    UnhandledNode(String),
    /// An operator outside the emitted set
    UnhandledOperator(String),
    /// A literal variant the generator does not emit (floats)
    UnhandledLiteral,
    /// A size or store-width query on an unsupported data type
    UnhandledDataType(String),
    /// An identifier that names no variable in the current function
    UnknownVariable(String),
}

impl SourceError for CodegenError {
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::UnhandledNode(kind) => {
                write!(f, "Cannot generate code for {} `{}`", kind, spanned_src)
            }
            Self::UnhandledOperator(op) => {
                write!(f, "Cannot generate code for operator `{}`", op)
            }
            Self::UnhandledLiteral => {
                write!(f, "Cannot generate code for literal `{}`", spanned_src)
            }
            Self::UnhandledDataType(ty) => {
                write!(f, "Cannot size data type `{}`", ty)
            }
            Self::UnknownVariable(name) => {
                write!(f, "Unknown variable `{}`", name)
            }
        }
    }
}

/// A non-fatal diagnostic attached to otherwise successful output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Warning {
    /// A call expression named a function that was never defined. A
    /// three-byte breakpoint sentinel was emitted in its place.
    UnknownCallee { name: String, line: usize },
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCallee { name, line } => write!(
                f,
                "Warning on line {}: cannot find function `{}`",
                line, name
            ),
        }
    }
}

/// A wrapper around a [SourceError], that holds some extra data:
/// - The [Span] of the source code that caused the error
/// - The offending chunk of source code itself
///
/// This type on its own can be formatted, without any external data.
#[derive(Debug, Fail, Serialize)]
pub struct SourceErrorWrapper<E: SourceError> {
    error: E,
    span: Span,
    spanned_source: String,
}

impl<E: SourceError> SourceErrorWrapper<E> {
    pub fn new(error: E, span: Span, src: &str) -> Self {
        Self {
            error,
            span,
            spanned_source: span.get_source_slice(src).into(),
        }
    }

    /// The underlying error.
    pub fn error(&self) -> &E {
        &self.error
    }

    /// Where in the source the error occurred.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl<E: SourceError> Display for SourceErrorWrapper<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Error on line {}: ", self.span.line)?;
        self.error.fmt_msg(f, &self.spanned_source)?;
        Ok(())
    }
}

/// A wrapper around a collection of errors. This holds the errors as well as
/// the source code, and can be used to render associated source code with
/// each error.
#[derive(Debug, Fail, Serialize)]
pub struct WithSource<E: SourceError> {
    errors: Vec<SourceErrorWrapper<E>>,
    #[serde(skip)]
    source: String,
}

impl<E: SourceError> WithSource<E> {
    /// Wrap a collection of errors with its source code.
    pub(crate) fn new(
        errors: impl IntoIterator<Item = SourceErrorWrapper<E>>,
        source: String,
    ) -> Self {
        Self {
            errors: errors.into_iter().collect(),
            source,
        }
    }

    /// Get a reference to the errors wrapped by this type.
    pub fn errors(&self) -> &[SourceErrorWrapper<E>] {
        &self.errors
    }
}

impl<E: SourceError> Display for WithSource<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Write each error, separated by a newline
        for (i, error) in self.errors.iter().enumerate() {
            // Prefix with a newline for all errors but the first
            if i > 0 {
                writeln!(f)?;
            }

            write!(f, "{}", error)?;
            if f.alternate() {
                util::fmt_src_highlights(f, &error.span, &self.source)?;
            }
        }
        Ok(())
    }
}

/// Umbrella error for the one-call [compile](crate::compile) convenience:
/// whichever pipeline stage failed, with its errors and source attached.
#[derive(Debug, Fail, Serialize)]
pub enum CompileError {
    Lex(WithSource<LexError>),
    Parse(WithSource<ParseError>),
    Codegen(WithSource<CodegenError>),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // delegate with the same formatter so the alternate flag (source
        // highlights) carries through
        match self {
            Self::Lex(err) => Display::fmt(err, f),
            Self::Parse(err) => Display::fmt(err, f),
            Self::Codegen(err) => Display::fmt(err, f),
        }
    }
}

impl From<WithSource<LexError>> for CompileError {
    fn from(err: WithSource<LexError>) -> Self {
        Self::Lex(err)
    }
}

impl From<WithSource<ParseError>> for CompileError {
    fn from(err: WithSource<ParseError>) -> Self {
        Self::Parse(err)
    }
}

impl From<WithSource<CodegenError>> for CompileError {
    fn from(err: WithSource<CodegenError>) -> Self {
        Self::Codegen(err)
    }
}
