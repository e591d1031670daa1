//! BP bytecode runner: loads a `.bpc` and executes it.
//!
//! Usage:
//!   bpvm file.bpc [--table] [--profile]

use std::env;
use std::process::ExitCode;

use bp::bytecode::file as bcfile;
use bp::vm::{DispatchMode, Vm};

fn main() -> ExitCode {
    let mut path = None;
    let mut dispatch = DispatchMode::Switch;
    let mut profile = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--table" => dispatch = DispatchMode::Table,
            "--profile" => profile = true,
            "--help" | "-h" => {
                eprintln!("usage: bpvm <file.bpc> [--table] [--profile]");
                return ExitCode::SUCCESS;
            }
            p if !p.starts_with('-') => path = Some(p.to_string()),
            other => {
                eprintln!("bpvm: unknown option '{}'", other);
                return ExitCode::FAILURE;
            }
        }
    }
    let Some(path) = path else {
        eprintln!("bpvm: no input file");
        return ExitCode::FAILURE;
    };

    let module = match bcfile::load(&path) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("bpvm: cannot load {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };
    let mut vm = match Vm::new(module) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("bpvm: {}", e);
            return ExitCode::FAILURE;
        }
    };
    vm.set_dispatch(dispatch);
    let result = vm.run();
    if profile {
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
            eprintln!("bpvm: runtime error: {}", fault);
            ExitCode::FAILURE
        }
    }
}
