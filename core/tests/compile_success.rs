//! Integration tests for programs that compile successfully, checking the
//! emitted machine code, data, and relocations through the public API.

use minicc::{
    compile, consts, Compiler, LexFlags, Options, RelocationKind, TokenKind,
};

/// Compiles the program with default flags and options, panicking on any
/// compile error.
fn assert_compiles(src: &str) -> minicc::CompiledProgram {
    match compile(src, LexFlags::empty(), Options::default()) {
        Ok(program) => program,
        Err(err) => panic!("compile failed:\n{:#}", err),
    }
}

/// Every relocation must point inside the buffer it targets.
fn assert_relocations_valid(program: &minicc::CompiledProgram) {
    for reloc in &program.relocations {
        match reloc.kind {
            RelocationKind::Code => {
                assert!(
                    reloc.from as usize + 4 <= program.code.len(),
                    "code relocation site out of range: {:?}",
                    reloc
                );
            }
            RelocationKind::Data => {
                assert!(
                    reloc.from as usize + 4 <= program.code.len(),
                    "data relocation site out of range: {:?}",
                    reloc
                );
                assert!(
                    (reloc.to + reloc.size) as usize <= program.data.len(),
                    "data relocation target out of range: {:?}",
                    reloc
                );
            }
        }
    }
}

#[test]
fn test_return_constant() {
    let program = assert_compiles("int main() { return 42; }");
    assert_ne!(program.entry, consts::ENTRY_UNRESOLVED);
    let entry = program.entry as usize;
    // prologue, then mov eax, 42
    assert_eq!(
        &program.code[entry + 9..entry + 14],
        &[0xb8, 42, 0, 0, 0]
    );
    assert!(program.warnings.is_empty());
    assert_relocations_valid(&program);
}

#[test]
fn test_two_functions_and_a_call() {
    let program = assert_compiles(
        "int f(int a, int b) { return a + b; }
         int main() { return f(20, 22); }",
    );
    assert!(program.warnings.is_empty());
    // one call instruction from main to f
    assert!(program.code.contains(&0xe8));
    assert_relocations_valid(&program);
}

#[test]
fn test_emit_places_byte_in_body() {
    let program = assert_compiles("int main() { __emit 0x90; return 0; }");
    let entry = program.entry as usize;
    // the nop lands right after the 9-byte prologue
    assert_eq!(program.code[entry + 9], 0x90);
}

#[test]
fn test_for_loop_jumps_line_up() {
    let program =
        assert_compiles("int main() { for (int i = 0; i < 10; i += 1) {} }");
    let code = &program.code;
    let jmp = code.iter().rposition(|&b| b == 0xe9).unwrap();
    let disp =
        i32::from_le_bytes([code[jmp + 1], code[jmp + 2], code[jmp + 3], code[jmp + 4]]);
    // backward, landing on the loop test (a load of `i`)
    assert!(disp < 0);
    let target = (jmp as i32 + 5 + disp) as usize;
    assert_eq!(&code[target..target + 3], &[0x8b, 0x45, 0xfc]);
}

#[test]
fn test_string_literal_lands_in_data() {
    let program =
        assert_compiles(r#"int main() { write(1, "hi", 2); return 0; }"#);
    assert_eq!(&program.data, b"hi\0");
    let reloc = program
        .relocations
        .iter()
        .find(|r| r.kind == RelocationKind::Data)
        .expect("no data relocation");
    assert_eq!(reloc.to, 0);
    assert_eq!(reloc.size, 3);
    assert_relocations_valid(&program);
}

#[test]
fn test_entry_matches_main_location() {
    let program = assert_compiles(
        "int pad() { return 9; }
         int main() { return 0; }
         int more() { return 1; }",
    );
    let entry = program.entry as usize;
    // the entry offset is main's prologue
    assert_eq!(&program.code[entry..entry + 3], &[0x55, 0x89, 0xe5]);
    assert_relocations_valid(&program);
}

#[test]
fn test_control_flow_kitchen_sink() {
    // everything the generator emits, in one program
    let program = assert_compiles(
        "int tally(int n) {
             int total;
             total = 0;
             while (n > 0) {
                 total += n;
                 n -= 1;
                 if (total > 100) {
                     break;
                 }
             }
             do {
                 total += 1;
             } while (total < 0);
             return total > 50 ? total : total + 7;
         }
         int main() {
             return tally(10) % 256;
         }",
    );
    assert!(program.warnings.is_empty());
    assert_relocations_valid(&program);
}

#[test]
fn test_unknown_callee_is_a_warning_not_an_error() {
    let program = assert_compiles("int main() { missing(7); return 0; }");
    assert_eq!(program.warnings.len(), 1);
    assert!(format!("{}", program.warnings[0]).contains("missing"));
    // the sentinel breakpoints are in the body
    let entry = program.entry as usize;
    assert_eq!(&program.code[entry + 9..entry + 12], &[0xcc, 0xcc, 0xcc]);
}

#[test]
fn test_staged_pipeline() {
    // the staged API exposes the intermediate products
    let lexed = Compiler::new(
        "int main() { return 1; }",
        LexFlags::empty(),
        Options::default(),
    )
    .lex()
    .unwrap();
    assert_eq!(lexed.tokens().first().unwrap().kind, TokenKind::IntType);
    assert_eq!(lexed.tokens().last().unwrap().kind, TokenKind::Eof);

    let parsed = lexed.parse().unwrap();
    assert_eq!(parsed.ast().root(), parsed.ast().root());

    let program = parsed.generate().unwrap();
    assert_ne!(program.entry, consts::ENTRY_UNRESOLVED);
}

#[test]
fn test_prototype_then_definition() {
    let program = assert_compiles(
        "int f(int a);
         int f(int a) { return a; }
         int main() { return f(5); }",
    );
    assert!(program.warnings.is_empty());
}

#[test]
fn test_call_before_definition_warns() {
    // functions must be emitted before their callers can find them
    let program = assert_compiles(
        "int main() { return late(); }
         int late() { return 3; }",
    );
    assert_eq!(program.warnings.len(), 1);
}

#[test]
fn test_locals_of_every_width() {
    let program = assert_compiles(
        "int main() {
             char c;
             int i;
             int arr[6];
             char *p;
             c = 1;
             i = 2;
             return i;
         }",
    );
    let entry = program.entry as usize;
    // frame: 1 + 4 + 6 + 4 = 15 bytes of locals
    assert_eq!(
        &program.code[entry + 3..entry + 9],
        &[0x81, 0xec, 0x0f, 0x00, 0x00, 0x00]
    );
}
