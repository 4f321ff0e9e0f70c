//! Small helpers shared across the compiler: source spans and the `debug!`
//! macro.

use serde::Serialize;
use std::fmt::{self, Formatter};

/// Macro that can wrap any body, and only executes the body if we are running
/// in debug mode. Debug mode is enabled by setting the environment variable
/// DEBUG=true. This compiles away to nothing when --release is used.
///
/// Example:
/// ```
/// use minicc::debug;
/// debug!(println!("Hello!"));
/// ```
#[macro_export]
macro_rules! debug {
    ($arg:expr) => {
        #[cfg(debug_assertions)]
        {
            if let Ok(debug_val) = std::env::var("DEBUG") {
                if debug_val.to_lowercase().as_str() == "true" {
                    $arg
                }
            }
        }
    };
}

/// A range of bytes in the source buffer, together with the line the range
/// starts on. Lines are 1-indexed, byte positions 0-indexed. `start` is
/// inclusive, `end` exclusive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

impl Span {
    /// Get the slice of source code that this span covers. Out-of-range or
    /// non-boundary spans yield an empty slice rather than panicking.
    pub fn get_source_slice<'a>(&self, src: &'a str) -> &'a str {
        src.get(self.start..self.end.min(src.len())).unwrap_or("")
    }
}

/// Writes the source line a span starts on, with a marker line underneath
/// highlighting the spanned bytes. Used by the alternate (`{:#}`) error
/// format.
pub fn fmt_src_highlights(
    f: &mut Formatter<'_>,
    span: &Span,
    src: &str,
) -> fmt::Result {
    let line_start = src[..span.start.min(src.len())]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let line = src[line_start..].lines().next().unwrap_or("");
    let col = span.start.saturating_sub(line_start);
    let width = span.end.saturating_sub(span.start).max(1).min(
        line.len().saturating_sub(col).max(1),
    );

    writeln!(f)?;
    writeln!(f, " {} | {}", span.line, line)?;
    write!(
        f,
        " {} | {}{}",
        " ".repeat(span.line.to_string().len()),
        " ".repeat(col),
        "^".repeat(width)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_source_slice() {
        let span = Span {
            start: 4,
            end: 7,
            line: 1,
        };
        assert_eq!(span.get_source_slice("int x = 3;"), "x =");
    }

    #[test]
    fn test_get_source_slice_out_of_range() {
        let span = Span {
            start: 8,
            end: 100,
            line: 1,
        };
        assert_eq!(span.get_source_slice("int x;"), "");
    }
}
