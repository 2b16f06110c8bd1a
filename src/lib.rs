pub mod ty;
pub mod instr;
pub mod module;
pub mod pass;
pub mod verify;
pub mod builder;
pub mod irprint;
#[cfg(feature = "ir-parse")]
pub mod irparse;
pub mod config;
pub mod passes;
pub mod link;
#[cfg(feature = "c-api")]
pub mod c_api;

pub use config::{ComposeFunction, InstrumentConfig, ModuleRole, TargetInstrumentation};
pub use passes::{InstrumentError, InstrumentOutcome, InstrumentPass};

/// Instrument every module with the same configuration and verify the results.
///
/// Stops at the first module which fails. Returns the outcome for every module, in order.
pub fn instrument_modules<'ctx>(
    config: &InstrumentConfig,
    modules: &mut [module::Module<'ctx>]) -> Result<Vec<InstrumentOutcome>, PipelineError<'ctx>> {

    let pass = InstrumentPass::new(config.clone());
    let mut outcomes = Vec::with_capacity(modules.len());
    for module in modules.iter_mut() {
        outcomes.push(pass.instrument(module)?);
        verify::verify_module(module).map_err(PipelineError::Verify)?;
    }
    Ok(outcomes)
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError<'ctx> {
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
    #[error("instrumented module doesn't verify: {0}")]
    Verify(verify::VerifyError<'ctx>),
}
