use std::{env, io::Write, path::Path};

/// Generates one test per `tests/golden/<name>.conf`.
///
/// The test instruments `<name>.ir` with the configuration and compares
/// the printed result with `<name>.expected.ir`.
fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=tests/golden");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let golden_dir = Path::new(&manifest_dir).join("tests").join("golden");
    let mut output = std::fs::File::create(Path::new(&out_dir).join("golden_tests.rs"))?;

    if !golden_dir.is_dir() {
        return Ok(());
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(&golden_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() { continue }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(test_name) = file_name.strip_suffix(".conf") {
            names.push(test_name.to_owned());
        }
    }
    // read_dir order isn't stable
    names.sort();

    for test_name in names {
        let conf = std::fs::read_to_string(golden_dir.join(format!("{}.conf", test_name)))?;
        generate_test_function(&mut output, &golden_dir, &test_name, &conf)?;
    }

    Ok(())
}

/// The configuration is a list of `key: value` lines, e.g.
/// ```text
/// tools: time.ir log.ir
/// target: multiplex
/// compose: chained
/// ```
fn generate_test_function(w: &mut impl Write, dir: &Path, test_name: &str, conf: &str) -> std::io::Result<()> {
    let mut tools = Vec::new();
    let mut target = "FirstToolOnly";
    let mut compose = "DontCompose";

    for line in conf.lines() {
        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => continue,
        };
        match (key, value) {
            ("tools", tools_list) => tools.extend(tools_list.split_whitespace().map(|t| format!("{:?}", t))),
            ("target", "first-tool-only") => target = "FirstToolOnly",
            ("target", "multiplex") => target = "Multiplex",
            ("compose", "dont-compose") => compose = "DontCompose",
            ("compose", "chained") => compose = "Chained",
            _ => panic!("{}.conf: unknown setting `{}`", test_name, line),
        }
    }

    let input = dir.join(format!("{}.ir", test_name));
    let expected = dir.join(format!("{}.expected.ir", test_name));
    write!(w, r#"
#[test]
fn golden_{}() {{
    check_golden(
        &[{}],
        TargetInstrumentation::{},
        ComposeFunction::{},
        include_str!({:?}),
        include_str!({:?}),
    );
}}
"#, test_name.replace(|c: char| !c.is_ascii_alphanumeric(), "_"), tools.join(", "), target, compose, input, expected)
}
