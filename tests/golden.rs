#![cfg(feature = "ir-parse")]

use callhook::{
    irparse::parse_module,
    irprint::IRPrint,
    verify::verify_module,
    ComposeFunction, InstrumentConfig, InstrumentPass, TargetInstrumentation,
};

fn check_golden(tools: &[&str], target: TargetInstrumentation, compose: ComposeFunction, input: &str, expected: &str) {
    let mut module = parse_module("input.ir", input).unwrap();
    let pass = InstrumentPass::new(InstrumentConfig::new(tools.iter().copied(), target, compose));
    pass.process(&mut module).unwrap();
    verify_module(&module).unwrap();

    let mut printed = String::new();
    module.ir_print(&mut printed).unwrap();
    assert_eq!(printed.trim_end(), expected.trim_end(), "Instrumented module differs:\n{}", printed);
}

include!(concat!(env!("OUT_DIR"), "/golden_tests.rs"));
