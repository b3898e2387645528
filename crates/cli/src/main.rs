//! `ember` — run a script file, disassemble it, or drop into a REPL.

mod disassemble;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ember_runtime::{Config, EmberError};

#[derive(Parser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember language interpreter", long_about = None)]
struct Args {
    /// Script to run. Omit to start the REPL.
    script: Option<PathBuf>,

    /// Print the compiled bytecode instead of running it.
    #[arg(short = 'd', long = "disassemble")]
    disassemble: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::WARN.into())
                .with_env_var("EMBER_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    match args.script {
        Some(path) => run_file(&path, args.disassemble, config),
        None => {
            if args.disassemble {
                eprintln!("--disassemble requires a script file");
                return ExitCode::from(64);
            }
            run_repl(config)
        }
    }
}

fn run_file(path: &PathBuf, disassemble: bool, config: Config) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: couldn't read {}: {e}", path.display());
            return ExitCode::from(74); // EX_IOERR
        }
    };

    if disassemble {
        return disassemble_source(&source);
    }

    match ember_runtime::run_source(&source, config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}

fn disassemble_source(source: &str) -> ExitCode {
    let mut heap = ember_runtime::heap::Heap::new(Config::from_env());
    match ember_compiler::compile_source(source, &mut heap) {
        Ok(script) => {
            disassemble::disassemble_script(script);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprint!("{e}");
            ExitCode::from(65)
        }
    }
}

fn report_error(e: &EmberError) -> ExitCode {
    eprint!("{e}");
    ExitCode::from(e.exit_code() as u8)
}

/// Reads lines until braces balance, mirroring the original REPL's
/// accumulate-until-balanced behavior for multi-line blocks.
fn run_repl(config: Config) -> ExitCode {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("error: couldn't start line editor: {e}");
            return ExitCode::from(70);
        }
    };

    println!("Ember {} — Ctrl-D to exit", env!("CARGO_PKG_VERSION"));
    loop {
        let mut buffer = String::new();
        let mut depth: i32 = 0;
        let mut prompt = "> ";
        loop {
            match editor.readline(prompt) {
                Ok(line) => {
                    depth += brace_delta(&line);
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(&line);
                    let _ = editor.add_history_entry(line.as_str());
                    if depth <= 0 {
                        break;
                    }
                    prompt = ".. ";
                }
                Err(rustyline::error::ReadlineError::Eof) => {
                    println!();
                    return ExitCode::SUCCESS;
                }
                Err(rustyline::error::ReadlineError::Interrupted) => {
                    buffer.clear();
                    break;
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(70);
                }
            }
        }

        if buffer.trim().is_empty() {
            continue;
        }

        match ember_runtime::run_source(&buffer, config.clone()) {
            Ok(value) => {
                if !value.is_nil() {
                    println!("{value:?}");
                }
            }
            Err(e) => eprint!("{e}"),
        }
        let _ = std::io::stdout().flush();
    }
}

fn brace_delta(line: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_string = !in_string,
            '\\' if in_string => {
                chars.next();
            }
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth
}
