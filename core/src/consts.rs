/// The maximum length of an identifier or string literal payload, in bytes.
/// Anything longer is a lex error.
pub const MAX_IDENT_LENGTH: usize = 31;

/// The maximum number of parameters a function can declare.
pub const MAX_PARAMETERS: usize = 32;

/// The maximum number of arguments a call expression can pass.
pub const MAX_ARGUMENTS: usize = 32;

/// The maximum number of fields a struct/union can declare.
pub const MAX_FIELDS: usize = 32;

/// The maximum number of enumerators an enum can declare.
pub const MAX_ENUM_VALUES: usize = 32;

/// The maximum number of children in a comma-sequence expression.
pub const MAX_SEQ_EXPRESSIONS: usize = 16;

/// Value of the entry-point offset before a `main` function is discovered.
pub const ENTRY_UNRESOLVED: u32 = 0xffff_ffff;
