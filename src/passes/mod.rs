mod instr_rewrite;
mod instrument;

pub use instr_rewrite::{InstrRewritePass, BlobRewriteData, RewriteError};
pub use instrument::{call_site_identifier, hook_type, Hook, HookPair, InstrumentError, InstrumentOutcome, InstrumentPass};
