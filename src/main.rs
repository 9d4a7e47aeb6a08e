#![warn(clippy::all)]

mod analyzer;
mod ast;
mod diagnostic;
mod emitter;
mod lexer;
mod parser;
mod value;
mod vm;

use diagnostic::{ansi::AnsiRenderer, json, Diagnostic};
use value::Mode;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Ansi,
    Text,
    Json,
}

/// Scan args for --json/-j, --text/-t, --ansi/-a. Return (mode, remaining).
/// Multiple format flags → error + exit(1).
fn detect_output_mode(args: Vec<String>) -> (OutputMode, Vec<String>) {
    let mut mode: Option<OutputMode> = None;
    let mut remaining = Vec::with_capacity(args.len());
    let mut conflict = false;

    for arg in args {
        match arg.as_str() {
            "--json" | "-j" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Json); }
            }
            "--text" | "-t" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Text); }
            }
            "--ansi" | "-a" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Ansi); }
            }
            _ => remaining.push(arg),
        }
    }

    if conflict {
        eprintln!("error: --json, --text, and --ansi are mutually exclusive");
        std::process::exit(1);
    }

    let resolved = mode.unwrap_or_else(|| {
        // Auto-detect: isatty(stderr) && !NO_COLOR → Ansi; isatty && NO_COLOR → Text; !isatty → Json
        // SAFETY: isatty(2) is always safe to call with any fd value; it returns 0 on
        // error or if the fd is not a terminal. STDERR_FILENO is a well-known constant.
        let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } != 0;
        let no_color = std::env::var("NO_COLOR").is_ok();
        if is_tty && !no_color {
            OutputMode::Ansi
        } else if is_tty {
            OutputMode::Text
        } else {
            OutputMode::Json
        }
    });

    (resolved, remaining)
}

fn report_diagnostic(d: &Diagnostic, mode: OutputMode) {
    let s = match mode {
        OutputMode::Ansi => AnsiRenderer { use_color: true }.render(d),
        OutputMode::Text => AnsiRenderer { use_color: false }.render(d),
        // JSON mode: one object per line (NDJSON) so multiple errors are parseable.
        OutputMode::Json => format!("{}\n", json::render(d)),
    };
    eprint!("{}", s);
}

fn usage() {
    eprintln!("Usage: knight (-e <expr> | [-f] <path>) [options]");
    eprintln!();
    eprintln!("  -e <expr>         Evaluate a program given as a string");
    eprintln!("  -f <path>         Run a program from a file (the -f is optional)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --lenient         Coerce on type misuse instead of failing");
    eprintln!("  --dump-ast        Print the parsed tree as JSON and exit");
    eprintln!("  --dump-bytecode   Print the compiled program and exit");
    eprintln!("  --ansi / -a       Force ANSI colour errors (default on a TTY)");
    eprintln!("  --text / -t       Force plain text errors (no colour)");
    eprintln!("  --json / -j       Force JSON errors (default off a TTY)");
    eprintln!();
    eprintln!("Exit status is QUIT's argument, 0 when the program finishes");
    eprintln!("without QUIT, and 1 on any error.");
}

fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let (mode, args) = detect_output_mode(raw_args);

    let mut lenient = false;
    let mut dump_ast = false;
    let mut dump_bytecode = false;
    let mut expr: Option<String> = None;
    let mut path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-e" => {
                if i + 1 >= args.len() {
                    eprintln!("error: -e expects a program string");
                    std::process::exit(1);
                }
                expr = Some(args[i + 1].clone());
                i += 1;
            }
            "-f" => {
                if i + 1 >= args.len() {
                    eprintln!("error: -f expects a file path");
                    std::process::exit(1);
                }
                path = Some(args[i + 1].clone());
                i += 1;
            }
            "--lenient" => lenient = true,
            "--dump-ast" => dump_ast = true,
            "--dump-bytecode" => dump_bytecode = true,
            "--version" | "-V" => {
                println!("knight {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" | "help" => {
                usage();
                std::process::exit(0);
            }
            other if path.is_none() && expr.is_none() && !other.starts_with('-') => {
                path = Some(other.to_string());
            }
            other => {
                eprintln!("error: unrecognized argument '{}'", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let source = match (expr, path) {
        (Some(_), Some(_)) => {
            eprintln!("error: give either -e <expr> or a file, not both");
            std::process::exit(1);
        }
        (Some(expr), None) => expr,
        (None, Some(path)) => match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading {}: {}", path, e);
                std::process::exit(1);
            }
        },
        (None, None) => {
            usage();
            std::process::exit(1);
        }
    };

    let tokens = match lexer::lex(&source) {
        Ok(t) => t,
        Err(e) => {
            report_diagnostic(&Diagnostic::from(&e).with_source(source.clone()), mode);
            std::process::exit(1);
        }
    };

    let ast = match parser::parse(source.clone(), tokens) {
        Ok(ast) => ast,
        Err(e) => {
            report_diagnostic(&Diagnostic::from(&e).with_source(source.clone()), mode);
            std::process::exit(1);
        }
    };

    if dump_ast {
        match serde_json::to_string_pretty(&ast) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => {
                eprintln!("Serialization error: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let analysis = analyzer::analyze(&ast);
    let program = match emitter::emit(&ast, &analysis) {
        Ok(p) => p,
        Err(e) => {
            report_diagnostic(&Diagnostic::from(&e).with_source(source.clone()), mode);
            std::process::exit(1);
        }
    };

    if dump_bytecode {
        print!("{}", program.disassemble());
        return;
    }

    let exec_mode = if lenient { Mode::Lenient } else { Mode::Sanitize };
    let stdout = std::io::stdout();
    let stdin = std::io::stdin();
    match vm::execute(&program, exec_mode, stdout.lock(), stdin.lock()) {
        Ok(Some(code)) => std::process::exit(code as i32),
        Ok(None) => {}
        Err(e) => {
            report_diagnostic(&Diagnostic::from(&e), mode);
            std::process::exit(1);
        }
    }
}
