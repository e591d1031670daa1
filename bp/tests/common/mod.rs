//! Shared helpers for the integration tests.
//!
//! Each test binary uses its own subset of these.
#![allow(dead_code)]

use bp::pipeline::{run_source_capture, run_source_inspect};
use bp::{CodeFormat, DispatchMode};

/// Run a program on the register backend with switch dispatch and
/// return its stdout.
pub fn run(source: &str) -> String {
    let (out, code) = run_source_capture(source, CodeFormat::Register, DispatchMode::Switch)
        .expect("program should run");
    assert_eq!(code, 0, "non-zero exit: {}", out);
    out
}

/// Run a program under every backend/dispatcher combination, assert
/// they all agree, and return the common stdout.
pub fn run_everywhere(source: &str) -> String {
    let mut outputs = Vec::new();
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        for dispatch in [DispatchMode::Switch, DispatchMode::Table] {
            let (out, code) = run_source_capture(source, format, dispatch)
                .unwrap_or_else(|e| panic!("{:?}/{:?} failed: {}", format, dispatch, e));
            outputs.push(((format, dispatch), out, code));
        }
    }
    let (_, first_out, first_code) = outputs[0].clone();
    for (combo, out, code) in &outputs {
        assert_eq!(out, &first_out, "output differs under {:?}", combo);
        assert_eq!(code, &first_code, "exit code differs under {:?}", combo);
    }
    first_out
}

/// Run and return (stdout, exit code, profiler state of `func_name`).
pub fn run_with_profile(
    source: &str,
    format: CodeFormat,
    func_name: &str,
) -> (String, i32, u8) {
    let name = func_name.to_string();
    let (out, code, state) =
        run_source_inspect(source, format, DispatchMode::Switch, move |vm| {
            let idx = vm
                .module()
                .funcs
                .iter()
                .position(|f| f.name == name)
                .expect("function exists");
            vm.profiler().state(idx) as u8
        })
        .expect("program should run");
    (out, code, state)
}
