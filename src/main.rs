use std::{fs, path::{Path, PathBuf}};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{info, warn};

use callhook::{
    irparse::parse_module,
    irprint::IRPrint,
    link::link_modules,
    module::Module,
    verify::verify_module,
    ComposeFunction, InstrumentConfig, InstrumentPass, TargetInstrumentation,
};

/// Bracket every call of IR modules with calls to instrumentation hooks
#[derive(Parser, Debug)]
#[command(name = "callhook", version)]
struct Cli {
    /// An instrumentation tool, given by its module name. May be repeated, the order matters
    #[arg(long = "instrument-tools", value_name = "TOOL")]
    tools: Vec<String>,

    /// Which tools observe the target program
    #[arg(long, value_enum, default_value_t = TargetInstrumentation::FirstToolOnly)]
    target_instrumentation: TargetInstrumentation,

    /// Whether the tools observe each other
    #[arg(long, value_enum, default_value_t = ComposeFunction::DontCompose)]
    compose_function: ComposeFunction,

    /// Write `<stem>.instrumented.ir` files here instead of printing to stdout
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Also link all instrumented modules into this file
    #[arg(long, value_name = "FILE")]
    link: Option<PathBuf>,

    /// Don't verify the instrumented modules
    #[arg(long)]
    no_verify: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// The modules to instrument, in the text format
    #[arg(required = true, value_name = "FILES")]
    files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // info+ on stderr, --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("callhook", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let pass = InstrumentPass::new(InstrumentConfig::new(
        cli.tools.iter().cloned(),
        cli.target_instrumentation,
        cli.compose_function,
    ));

    if let Some(dir) = &cli.output_dir {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let mut modules = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let mut module = read_module(path)?;
        pass.instrument(&mut module)
            .with_context(|| format!("failed to instrument {}", path.display()))?;
        if !cli.no_verify {
            check(&module)?;
        }

        let printed = print_module(&module)?;
        match &cli.output_dir {
            Some(dir) => {
                let out_path = dir.join(output_file_name(path));
                fs::write(&out_path, printed).with_context(|| format!("failed to write {}", out_path.display()))?;
                info!("wrote {}", out_path.display());
            }
            None => print!("{}", printed),
        }
        modules.push(module);
    }

    if let Some(link_path) = &cli.link {
        let linked = link_modules(link_path.display().to_string(), modules)
            .context("failed to link the instrumented modules")?;
        let unresolved = linked.unresolved_symbols();
        if !unresolved.is_empty() {
            warn!("unresolved symbols after linking: {}", unresolved.join(", "));
        }
        if !cli.no_verify {
            check(&linked)?;
        }
        fs::write(link_path, print_module(&linked)?)
            .with_context(|| format!("failed to write {}", link_path.display()))?;
        info!("linked {} modules into {}", cli.files.len(), link_path.display());
    }

    Ok(())
}

/// The module is named by its `module` header, or by the path as given
fn read_module<'ctx>(path: &Path) -> anyhow::Result<Module<'ctx>> {
    let source = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_module(&path.display().to_string(), &source)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn check(module: &Module<'_>) -> anyhow::Result<()> {
    // the verifier's errors borrow the module's types
    verify_module(module).map_err(|e| anyhow!("{} doesn't verify: {}", module.name(), e))
}

fn print_module(module: &Module<'_>) -> anyhow::Result<String> {
    let mut out = String::new();
    module.ir_print(&mut out).map_err(|_| anyhow!("failed to print {}", module.name()))?;
    Ok(out)
}

fn output_file_name(path: &Path) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "module".to_string());
    format!("{}.instrumented.ir", stem)
}
