//! Integration tests for programs that fail to compile. Each test checks
//! which stage rejected the input and how the error renders.

use minicc::{compile, CompileError, LexError, LexFlags, Options, ParseError};

fn compile_err(src: &str) -> CompileError {
    compile(src, LexFlags::empty(), Options::default())
        .expect_err("program compiled unexpectedly")
}

fn expect_lex_error(src: &str, expected: LexError) {
    match compile_err(src) {
        CompileError::Lex(err) => {
            assert_eq!(err.errors().len(), 1);
            assert_eq!(err.errors()[0].error(), &expected);
        }
        other => panic!("expected lex error, got: {}", other),
    }
}

fn expect_parse_error(src: &str, expected: ParseError) {
    match compile_err(src) {
        CompileError::Parse(err) => {
            assert_eq!(err.errors()[0].error(), &expected);
        }
        other => panic!("expected parse error, got: {}", other),
    }
}

#[test]
fn test_unterminated_string() {
    expect_lex_error(r#""hello"#, LexError::UnterminatedLiteral);
}

#[test]
fn test_unterminated_string_inside_function() {
    expect_lex_error(
        "int main() { return \"hello; }",
        LexError::UnterminatedLiteral,
    );
}

#[test]
fn test_two_decimal_points() {
    expect_lex_error(
        "int main() { return 1.2.3; }",
        LexError::MalformedNumber,
    );
}

#[test]
fn test_empty_character_constant() {
    expect_lex_error(
        "int main() { return ''; }",
        LexError::EmptyCharacterConstant,
    );
}

#[test]
fn test_overlong_identifier() {
    let name = "x".repeat(40);
    expect_lex_error(
        &format!("int main() {{ return {}; }}", name),
        LexError::IdentifierTooLong,
    );
}

#[test]
fn test_missing_semicolon() {
    expect_parse_error(
        "int main() { return 1 }",
        ParseError::ExpectedToken {
            expected: ";".to_string(),
            found: "}".to_string(),
        },
    );
}

#[test]
fn test_zero_length_array() {
    expect_parse_error(
        "int main() { int a[0]; }",
        ParseError::InvalidArraySize(0),
    );
}

#[test]
fn test_too_many_parameters() {
    let params = (0..33)
        .map(|i| format!("int p{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    expect_parse_error(
        &format!("int f({}) {{ return 0; }}", params),
        ParseError::TooManyParameters,
    );
}

#[test]
fn test_error_rendering_names_the_line() {
    let err = compile_err("int main() {\n    return 1.2.3;\n}");
    let message = format!("{}", err);
    assert!(
        message.starts_with("Error on line 2:"),
        "unexpected message: {}",
        message
    );
    assert!(message.contains("Malformed number"));
}

#[test]
fn test_alternate_rendering_highlights_source() {
    let err = compile_err("int main() { return novar; }");
    let message = format!("{:#}", err);
    // alternate mode appends the offending line with a marker
    assert!(message.contains("int main() { return novar; }"));
    assert!(message.contains('^'));
}

#[test]
fn test_codegen_error_reports_unknown_variable() {
    match compile_err("int main() { return novar; }") {
        CompileError::Codegen(err) => {
            let message = format!("{}", err);
            assert!(message.contains("Unknown variable `novar`"));
        }
        other => panic!("expected codegen error, got: {}", other),
    }
}

#[test]
fn test_break_outside_loop_is_rejected() {
    match compile_err("int main() { break; return 0; }") {
        CompileError::Codegen(_) => {}
        other => panic!("expected codegen error, got: {}", other),
    }
}
