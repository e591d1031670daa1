//! BP compile-and-run driver.
//!
//! Usage:
//!   bp file.bp                    # compile and run
//!   bp file.bp -o out.bpc        # also write the bytecode artifact
//!   bp -e "code"                  # run a source string
//!   bp file.bp --stack            # stack backend (default: register)
//!   bp file.bp --table            # jump-table dispatch
//!   bp file.bp --dump-ast         # print the checked AST as JSON
//!   bp file.bp --dump-module      # print the bytecode module as JSON
//!   bp file.bp --profile          # print profiler states on exit

use std::env;
use std::fs;
use std::process::ExitCode;

use bp::bytecode::{file as bcfile, CodeFormat};
use bp::compile::compile_module;
use bp::typecheck::check_module;
use bp::vm::{DispatchMode, Vm};

struct Options {
    source_path: Option<String>,
    inline_code: Option<String>,
    output: Option<String>,
    format: CodeFormat,
    dispatch: DispatchMode,
    dump_ast: bool,
    dump_module: bool,
    profile: bool,
}

fn parse_args() -> Result<Options, String> {
    let mut opts = Options {
        source_path: None,
        inline_code: None,
        output: None,
        format: CodeFormat::Register,
        dispatch: DispatchMode::Switch,
        dump_ast: false,
        dump_module: false,
        profile: false,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-e" => {
                opts.inline_code = Some(args.next().ok_or("-e needs a code string")?);
            }
            "-o" => {
                opts.output = Some(args.next().ok_or("-o needs an output path")?);
            }
            "--stack" => opts.format = CodeFormat::Stack,
            "--table" => opts.dispatch = DispatchMode::Table,
            "--dump-ast" => opts.dump_ast = true,
            "--dump-module" => opts.dump_module = true,
            "--profile" => opts.profile = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            path if !path.starts_with('-') => opts.source_path = Some(path.to_string()),
            other => return Err(format!("unknown option '{}'", other)),
        }
    }
    if opts.source_path.is_none() && opts.inline_code.is_none() {
        return Err("no input (source file or -e)".to_string());
    }
    Ok(opts)
}

fn print_usage() {
    eprintln!("usage: bp <file.bp> [-o out.bpc] [-e code] [--stack] [--table] [--dump-ast] [--dump-module] [--profile]");
}

fn main() -> ExitCode {
    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("bp: {}", msg);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let source = match (&opts.inline_code, &opts.source_path) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => match fs::read_to_string(path) {
            Ok(src) => src,
            Err(e) => {
                eprintln!("bp: cannot read {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        (None, None) => unreachable!("validated in parse_args"),
    };

    let mut ast = match bp_parser::parse_module(&source) {
        Ok(ast) => ast,
        Err(e) => {
            eprintln!("bp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let info = match check_module(&mut ast) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("bp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if opts.dump_ast {
        match serde_json::to_string_pretty(&ast) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("bp: cannot serialize AST: {}", e),
        }
        return ExitCode::SUCCESS;
    }

    let module = match compile_module(&ast, &info, opts.format) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("bp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if opts.dump_module {
        match serde_json::to_string_pretty(&module) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("bp: cannot serialize module: {}", e),
        }
        return ExitCode::SUCCESS;
    }
    if let Some(out_path) = &opts.output {
        if let Err(e) = bcfile::save(&module, out_path) {
            eprintln!("bp: cannot write {}: {}", out_path, e);
            return ExitCode::FAILURE;
        }
    }

    let mut vm = match Vm::new(module) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("bp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    vm.set_dispatch(opts.dispatch);
    let result = vm.run();
    if opts.profile {
        for (i, func) in vm.module().funcs.iter().enumerate() {
            eprintln!(
                "{:<24} calls {:<8} state {}",
                func.name,
                vm.profiler().calls(i),
                vm.profiler().state(i) as u8
            );
        }
    }
    match result {
        Ok(code) => ExitCode::from(code.rem_euclid(256) as u8),
        Err(fault) => {
            eprintln!("bp: runtime error: {}", fault);
            ExitCode::FAILURE
        }
    }
}
