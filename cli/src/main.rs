#![deny(clippy::all)]

use anyhow::Context;
use minicc::{Compiler, LexFlags, Options};
use serde_json::json;
use std::{fs, path::PathBuf, process};
use structopt::StructOpt;

/// The sub-command to execute.
#[derive(Debug, StructOpt)]
enum Command {
    /// Scan source code and print the token list.
    #[structopt(name = "lex")]
    Lex {
        /// Path to the source code file
        #[structopt(parse(from_os_str), long = "source", short = "s")]
        source_path: PathBuf,
        /// Emit newline tokens instead of discarding them as whitespace
        #[structopt(long = "newline-tokens")]
        newline_tokens: bool,
        /// Keep keywords and type names as plain identifiers
        #[structopt(long = "force-ident")]
        force_ident: bool,
    },

    /// Compile source code to raw x86-32 machine code.
    #[structopt(name = "compile")]
    Compile {
        /// Path to the source code file
        #[structopt(parse(from_os_str), long = "source", short = "s")]
        source_path: PathBuf,
        /// Write the code bytes to this file
        #[structopt(parse(from_os_str), long = "out-code")]
        code_path: Option<PathBuf>,
        /// Write the data bytes to this file
        #[structopt(parse(from_os_str), long = "out-data")]
        data_path: Option<PathBuf>,
        /// Emit int3 breakpoints where the source asks for them
        #[structopt(long = "debug")]
        debug: bool,
    },
}

/// minicc executable, for scanning and compiling minicc programs
#[derive(Debug, StructOpt)]
#[structopt(name = "minicc")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

fn read_file(path: &PathBuf) -> anyhow::Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read file {:?}", path))
}

fn run(opt: Opt) -> anyhow::Result<()> {
    match opt.cmd {
        // Scan the source and print one token per line
        Command::Lex {
            source_path,
            newline_tokens,
            force_ident,
        } => {
            let source = read_file(&source_path)?;
            let mut flags = LexFlags::empty();
            if newline_tokens {
                flags |= LexFlags::NEWLINE_TOKEN;
            }
            if force_ident {
                flags |= LexFlags::FORCE_IDENT;
            }

            let lexed =
                match Compiler::new(source, flags, Options::default()).lex() {
                    Ok(lexed) => lexed,
                    Err(err) => {
                        eprintln!("{:#}", err);
                        process::exit(1);
                    }
                };
            for token in lexed.tokens() {
                println!(
                    "{}:{}..{}\t{}",
                    token.line, token.start, token.end, token
                );
            }
        }

        // Compile the source and report the output layout
        Command::Compile {
            source_path,
            code_path,
            data_path,
            debug,
        } => {
            let source = read_file(&source_path)?;
            let program = match minicc::compile(
                &source,
                LexFlags::empty(),
                Options { debug },
            ) {
                Ok(program) => program,
                Err(err) => {
                    eprintln!("{:#}", err);
                    process::exit(1);
                }
            };

            for warning in &program.warnings {
                eprintln!("{}", warning);
            }
            if let Some(path) = &code_path {
                fs::write(path, &program.code).with_context(|| {
                    format!("Failed to write file {:?}", path)
                })?;
            }
            if let Some(path) = &data_path {
                fs::write(path, &program.data).with_context(|| {
                    format!("Failed to write file {:?}", path)
                })?;
            }

            let report = json!({
                "entry": program.entry,
                "code_size": program.code.len(),
                "data_size": program.data.len(),
                "relocations": program.relocations,
                "warnings": program.warnings,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
