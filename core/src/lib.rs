//! Core implementation of the minicc language: a compiler for a C subset
//! that emits raw x86-32 machine code directly, with no textual assembly
//! stage and no external assembler or linker. The output is a buffer of
//! executable bytes plus a parallel data buffer and a relocation table,
//! ready to be wrapped by an ELF or flat-binary emitter.
//!
//! ```
//! use minicc::{compile, LexFlags, Options};
//!
//! let program = compile(
//!     "int main() { return 42; }",
//!     LexFlags::empty(),
//!     Options::default(),
//! )
//! .unwrap();
//!
//! assert!(!program.code.is_empty());
//! assert_ne!(program.entry, minicc::consts::ENTRY_UNRESOLVED);
//! ```

#![deny(clippy::all)]

pub mod ast;
pub mod consts;
mod compile;
mod error;
mod lex;
mod parse;
mod token;
mod util;
mod x86;

pub use compile::{
    CompileContext, CompiledProgram, Function, Options, Register, Relocation,
    RelocationKind, Variable,
};
pub use error::*;
pub use lex::LexFlags;
pub use token::{Token, TokenKind, TokenValue};
pub use util::Span;

use ast::Ast;
use std::fmt::Debug;

/// Compiles a source buffer down to machine code in one call. Returns the
/// compiled program, or the errors of whichever pipeline stage failed.
pub fn compile(
    source: &str,
    flags: LexFlags,
    options: Options,
) -> Result<CompiledProgram, CompileError> {
    Ok(Compiler::new(source, flags, options)
        .debug()
        .lex()?
        .debug()
        .parse()?
        .debug()
        .generate()?)
}

/// Struct to contain all compiler pipeline steps. By having this on a struct,
/// it makes it nice and easy to call functions in order with readability.
///
/// `T` is the current stage of the pipeline, which controls which operations
/// can be called next: a fresh compiler can only `.lex()`, a lexed one can
/// only `.parse()`, and so on. This leverages the type system to enforce the
/// assumptions each stage makes about its input.
#[derive(Debug)]
pub struct Compiler<T: Debug> {
    pub(crate) source: String,
    pub(crate) flags: LexFlags,
    pub(crate) options: Options,
    pub(crate) stage: T,
}

impl<T: Debug> Compiler<T> {
    /// Prints out the current state of this compiler, if debug mode is
    /// enabled. Takes in self and returns the same value, so that this can
    /// be used in the function call chain.
    pub fn debug(self) -> Self {
        crate::debug!(println!("{:?}", &self));
        self
    }

    /// The source code this compiler was created from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Compiler<()> {
    /// Constructs a new compiler with no internal state. This is how you
    /// start a fresh compiler pipeline.
    pub fn new(
        source: impl Into<String>,
        flags: LexFlags,
        options: Options,
    ) -> Self {
        Compiler {
            source: source.into(),
            flags,
            options,
            stage: (),
        }
    }
}

impl Compiler<Vec<Token>> {
    /// The scanned token list, in source order, ending with an EOF token.
    pub fn tokens(&self) -> &[Token] {
        &self.stage
    }

    /// Consumes the compiler, returning the token list.
    pub fn into_tokens(self) -> Vec<Token> {
        self.stage
    }
}

impl Compiler<Ast> {
    /// The parsed syntax tree.
    pub fn ast(&self) -> &Ast {
        &self.stage
    }
}
