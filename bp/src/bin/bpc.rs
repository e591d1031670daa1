//! BP compile-only driver: writes a `.bpc` artifact.
//!
//! Usage:
//!   bpc file.bp -o out.bpc [--stack]

use std::env;
use std::fs;
use std::process::ExitCode;

use bp::bytecode::{file as bcfile, CodeFormat};
use bp::compile_source;

fn main() -> ExitCode {
    let mut source_path = None;
    let mut output = None;
    let mut format = CodeFormat::Register;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" => output = args.next(),
            "--stack" => format = CodeFormat::Stack,
            "--help" | "-h" => {
                eprintln!("usage: bpc <file.bp> -o <out.bpc> [--stack]");
                return ExitCode::SUCCESS;
            }
            path if !path.starts_with('-') => source_path = Some(path.to_string()),
            other => {
                eprintln!("bpc: unknown option '{}'", other);
                return ExitCode::FAILURE;
            }
        }
    }
    let Some(source_path) = source_path else {
        eprintln!("bpc: no input file");
        return ExitCode::FAILURE;
    };
    let output = output.unwrap_or_else(|| {
        let stem = source_path.trim_end_matches(".bp");
        format!("{}.bpc", stem)
    });

    let source = match fs::read_to_string(&source_path) {
        Ok(src) => src,
        Err(e) => {
            eprintln!("bpc: cannot read {}: {}", source_path, e);
            return ExitCode::FAILURE;
        }
    };
    let module = match compile_source(&source, format) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("bpc: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = bcfile::save(&module, &output) {
        eprintln!("bpc: cannot write {}: {}", output, e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
