//! The call instrumentation pass.
//!
//! Every call of a module is bracketed with a call to a "before" and an "after" hook.
//! Both hooks get a pointer to a NUL-terminated string `[<module>]<callee>`
//! which identifies the call site. Which hooks are called depends on the module
//! (the target program or one of the tools) and on the [`InstrumentConfig`].

use std::collections::HashMap;

use log::{debug, info};

use crate::{
    builder::{FunctionBuilder, InstrBuilder},
    config::{ComposeFunction, InstrumentConfig, ModuleRole, TargetInstrumentation},
    instr::{BlockId, CallTarget, Instr, InstrK, Linkage},
    module::{Module, ModuleError},
    pass::ModulePass,
    ty::{Ty, Type},
};

use super::instr_rewrite::{BlobRewriteData, InstrRewritePass, RewriteError};

/// One of the two instrumentation hooks
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Hook {
    Before,
    After,
}

impl Hook {
    pub const ALL: [Hook; 2] = [Hook::Before, Hook::After];

    /// The name the tools define their hook under
    pub fn generic_name(self) -> &'static str {
        match self {
            Hook::Before => "__instrument_before_call",
            Hook::After => "__instrument_after_call",
        }
    }

    /// The hook of a particular tool
    pub fn tool_name(self, tool: &str) -> String {
        format!("{}_{}", self.generic_name(), tool)
    }

    /// The hook which calls the hooks of every tool
    pub fn multiplex_name(self) -> String {
        self.tool_name("multiplex")
    }
}

/// The functions called before and after every call site
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct HookPair {
    pub before: String,
    pub after: String,
}

impl HookPair {
    pub fn get(&self, hook: Hook) -> &str {
        match hook {
            Hook::Before => &self.before,
            Hook::After => &self.after,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.before == name || self.after == name
    }
}

/// What happened to a module
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum InstrumentOutcome {
    /// No tools are configured, the module wasn't touched
    Untouched,
    /// The module is a tool which isn't instrumented, only its hooks were renamed
    Renamed { hooks: HookPair },
    /// The call sites of the module were instrumented with `hooks`
    Rewritten { hooks: HookPair, call_sites: usize },
}

impl InstrumentOutcome {
    pub fn modified(&self) -> bool {
        !matches!(self, InstrumentOutcome::Untouched)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("hook `{name}` must have the type (ptr) -> ()")]
    HookSignature { name: String },
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

/// A call instruction found by the first phase of the pass
#[derive(PartialEq, Eq, Clone, Debug)]
struct CallSite {
    function: usize,
    block: BlockId,
    instr: usize,
    callee: String,
}

/// The identifier passed to the hooks of a call site.
///
/// Neither name is escaped, brackets in a module name end up in the identifier as they are.
pub fn call_site_identifier(module_name: &str, callee: &str) -> String {
    format!("[{}]{}", module_name, callee)
}

/// The type of every hook: `(ptr) -> ()`
pub fn hook_type<'ctx>(module: &mut Module<'ctx>) -> Ty<'ctx> {
    let ptr = module.ptr_t();
    module.intern_type(Type::Func { args: vec![ptr], ret: vec![] })
}

pub struct InstrumentPass {
    config: InstrumentConfig,
}

impl InstrumentPass {
    pub fn new(config: InstrumentConfig) -> Self {
        InstrumentPass { config }
    }

    /// Instrument a module. Returns false only if there are no tools to instrument with.
    pub fn process(&self, module: &mut Module<'_>) -> Result<bool, InstrumentError> {
        Ok(self.instrument(module)?.modified())
    }

    pub fn instrument<'ctx>(&self, module: &mut Module<'ctx>) -> Result<InstrumentOutcome, InstrumentError> {
        let tools = self.config.tools();
        if tools.is_empty() {
            info!("{}: no instrumentation tools, skipping", module.name());
            return Ok(InstrumentOutcome::Untouched);
        }

        let hook_ty = hook_type(module);
        let role = self.config.role_of(module.name());
        debug!("{}: instrumenting as {:?}", module.name(), role);

        let generic = HookPair {
            before: resolve_hook(module, Hook::Before.generic_name(), hook_ty)?,
            after: resolve_hook(module, Hook::After.generic_name(), hook_ty)?,
        };

        let hooks = match role {
            ModuleRole::Target => match self.config.target_instrumentation() {
                TargetInstrumentation::FirstToolOnly => rename_hooks(module, &generic, &tools[0])?,
                TargetInstrumentation::Multiplex => {
                    for hook in Hook::ALL {
                        // stray uses of the generic hook go through the multiplexer as well
                        if module.get_function(generic.get(hook)).map_or(false, |f| f.is_extern()) {
                            module.rename_function(generic.get(hook), &hook.multiplex_name())?;
                        }
                    }
                    HookPair {
                        before: self.define_multiplexer(module, Hook::Before, hook_ty)?,
                        after: self.define_multiplexer(module, Hook::After, hook_ty)?,
                    }
                }
            },
            ModuleRole::Tool(idx) => {
                let own = rename_hooks(module, &generic, &tools[idx])?;
                let next = match self.config.compose_function() {
                    ComposeFunction::DontCompose => None,
                    ComposeFunction::Chained => self.config.next_tool(idx),
                };
                match next {
                    None => {
                        check_hook_types(module, &own, hook_ty)?;
                        info!("{}: tool hooks renamed to `{}` and `{}`", module.name(), own.before, own.after);
                        return Ok(InstrumentOutcome::Renamed { hooks: own });
                    }
                    Some(next) => HookPair {
                        before: resolve_hook(module, &Hook::Before.tool_name(next), hook_ty)?,
                        after: resolve_hook(module, &Hook::After.tool_name(next), hook_ty)?,
                    },
                }
            }
        };
        check_hook_types(module, &hooks, hook_ty)?;

        // Only the target program must not instrument its own hooks,
        // a chained tool is instrumented by a different tool.
        let call_sites = collect_call_sites(module, &hooks, role == ModuleRole::Target);
        let count = call_sites.len();
        rewrite_call_sites(module, &hooks, call_sites)?;

        info!("{}: instrumented {} call sites with `{}` and `{}`", module.name(), count, hooks.before, hooks.after);
        Ok(InstrumentOutcome::Rewritten { hooks, call_sites: count })
    }

    /// Define the multiplexer of `hook`, which calls the hook of every tool in order.
    ///
    /// An already defined multiplexer is left as it is.
    fn define_multiplexer<'ctx>(&self, module: &mut Module<'ctx>, hook: Hook, hook_ty: Ty<'ctx>) -> Result<String, InstrumentError> {
        let name = resolve_hook(module, &hook.multiplex_name(), hook_ty)?;
        let existing = module.get_function(&name)
            .ok_or_else(|| ModuleError::UnknownFunction { name: name.clone() })?;
        if existing.ty() != hook_ty {
            return Err(InstrumentError::HookSignature { name });
        }
        if !existing.is_extern() {
            debug!("{}: multiplexer `{}` is already defined", module.name(), name);
            return Ok(name);
        }

        let tool_hooks: Vec<String> = self.config.tools().iter().map(|tool| hook.tool_name(tool)).collect();
        for tool_hook in &tool_hooks {
            module.get_or_insert_function(tool_hook, hook_ty)?;
        }

        let mut builder = FunctionBuilder::new(name.clone(), [module.ptr_t()], []);
        builder.set_linkage(Linkage::LinkOnceOdr);
        let call_site = builder.get_arg(0);
        for tool_hook in tool_hooks {
            builder.i_ld_local(call_site);
            builder.i_call(tool_hook);
        }
        builder.i_return();
        // the definition takes the place of the declaration
        builder.finish(module)?;

        debug!("{}: defined multiplexer `{}`", module.name(), name);
        Ok(name)
    }
}

impl<'ctx> ModulePass<'ctx> for InstrumentPass {
    type Error = InstrumentError;

    fn run_on_module(&mut self, module: &mut Module<'ctx>) -> Result<bool, Self::Error> {
        self.process(module)
    }
}

/// Look up (or declare) a hook and return the name of the function behind it
fn resolve_hook<'ctx>(module: &mut Module<'ctx>, name: &str, hook_ty: Ty<'ctx>) -> Result<String, InstrumentError> {
    let symbol = module.get_or_insert_function(name, hook_ty)?;
    match module.strip_pointer_casts(&symbol) {
        Some(function) => Ok(function.to_owned()),
        None => Err(ModuleError::DanglingAlias { name: symbol }.into()),
    }
}

/// Give the functions behind the generic hooks the names of the hooks of `tool`
fn rename_hooks(module: &mut Module<'_>, generic: &HookPair, tool: &str) -> Result<HookPair, InstrumentError> {
    for hook in Hook::ALL {
        module.rename_function(generic.get(hook), &hook.tool_name(tool))?;
    }
    Ok(HookPair { before: Hook::Before.tool_name(tool), after: Hook::After.tool_name(tool) })
}

fn check_hook_types<'ctx>(module: &Module<'ctx>, hooks: &HookPair, hook_ty: Ty<'ctx>) -> Result<(), InstrumentError> {
    for hook in Hook::ALL {
        let name = hooks.get(hook);
        match module.get_function(name) {
            Some(f) if f.ty() == hook_ty => {}
            Some(_) => return Err(InstrumentError::HookSignature { name: name.to_owned() }),
            None => return Err(ModuleError::UnknownFunction { name: name.to_owned() }.into()),
        }
    }
    Ok(())
}

/// Find every direct call in the module, in function, block and instruction order.
///
/// With `skip_hooks` the bodies of the hooks and calls to the hooks are left out.
fn collect_call_sites(module: &Module<'_>, hooks: &HookPair, skip_hooks: bool) -> Vec<CallSite> {
    let mut call_sites = Vec::new();

    for function in module.local_functions_iter() {
        if skip_hooks && hooks.contains(function.name()) {
            debug!("{}: not instrumenting hook `{}`", module.name(), function.name());
            continue;
        }

        for block in function.blocks_iter() {
            for (instr_idx, instr) in block.body.iter().enumerate() {
                let callee = match instr.as_call() {
                    Some(CallTarget::Direct(callee)) => callee,
                    Some(CallTarget::Indirect) => {
                        debug!("{}: skipping indirect call in `{}`", module.name(), function.name());
                        continue;
                    }
                    None => continue,
                };
                if skip_hooks && hooks.contains(module.strip_pointer_casts(callee).unwrap_or(callee)) {
                    debug!("{}: skipping call to hook `{}` in `{}`", module.name(), callee, function.name());
                    continue;
                }

                call_sites.push(CallSite {
                    function: function.idx(),
                    block: block.id(),
                    instr: instr_idx,
                    callee: callee.to_owned(),
                });
            }
        }
    }

    call_sites
}

/// Bracket every call site with the hooks.
///
/// A call `call "g"` becomes
/// ```text
/// alloca [N x int8]
/// st.loc #k
/// ld.loc #k
/// ld.bytes "[m]g\00"
/// write [N x int8]
/// ld.loc #k
/// call "<before>"
/// call "g"
/// ld.loc #k
/// call "<after>"
/// ```
/// where `#k` is a fresh pointer local.
fn rewrite_call_sites<'ctx>(module: &mut Module<'ctx>, hooks: &HookPair, call_sites: Vec<CallSite>) -> Result<(), InstrumentError> {
    let ptr = module.ptr_t();
    let int8 = module.int8t();
    let mut modifications: HashMap<usize, HashMap<BlockId, Vec<BlobRewriteData<'ctx>>>> = HashMap::new();

    for site in call_sites {
        let mut identifier = call_site_identifier(module.name(), &site.callee).into_bytes();
        identifier.push(0);
        debug!("{}: instrumenting call to `{}`", module.name(), site.callee);

        let str_ty = module.intern_type(Type::Array { elem: int8, len: identifier.len() });
        let function = module.function_get_mut_by_idx(site.function).unwrap_local_mut();
        let local = function.new_local(ptr);
        let call = function.get_block(site.block)
            .and_then(|block| block.body.get(site.instr))
            .cloned()
            .ok_or(RewriteError::OutOfBounds { function: site.function, block: site.block, range: site.instr..site.instr + 1 })?;

        let instrs = vec![
            Instr::new(InstrK::Alloca { ty: str_ty }),
            Instr::new(InstrK::StLocal { idx: local }),
            Instr::new(InstrK::LdLocal { idx: local }),
            Instr::new(InstrK::LdBytes(identifier, str_ty)),
            Instr::new(InstrK::Write { ty: str_ty }),
            Instr::new(InstrK::LdLocal { idx: local }),
            Instr::new(InstrK::CallDirect { func_name: hooks.before.clone() }),
            call,
            Instr::new(InstrK::LdLocal { idx: local }),
            Instr::new(InstrK::CallDirect { func_name: hooks.after.clone() }),
        ];

        modifications
            .entry(site.function)
            .or_default()
            .entry(site.block)
            .or_default()
            .push((site.instr..site.instr + 1, instrs));
    }

    let mut rewrite = InstrRewritePass::new(modifications)?;
    module.do_mut_pass(&mut rewrite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        builder::{FunctionBuilder, InstrBuilder},
        config::{ComposeFunction, InstrumentConfig, TargetInstrumentation},
        instr::{InstrK, Linkage},
        module::{ExternFunction, Module},
        verify::verify_module,
    };

    use super::{call_site_identifier, hook_type, Hook, InstrumentError, InstrumentOutcome, InstrumentPass};

    fn config(tools: &[&str], target: TargetInstrumentation, compose: ComposeFunction) -> InstrumentConfig {
        InstrumentConfig::new(tools.iter().copied(), target, compose)
    }

    /// `main` calls `work` twice, `work` is external
    fn target_module<'ctx>() -> Module<'ctx> {
        let mut m = Module::new("main.c");
        let work_ty = m.intern_type(crate::ty::Type::Func { args: vec![], ret: vec![] });
        m.add_extern_function(ExternFunction::new("work".to_string(), work_ty)).unwrap();

        let mut builder = FunctionBuilder::new("main".to_string(), [], []);
        builder.i_call("work".to_string());
        builder.i_call("work".to_string());
        builder.i_return();
        builder.finish(&mut m).unwrap();
        m
    }

    fn call_names(m: &Module<'_>, func: &str) -> Vec<String> {
        m.get_function(func).unwrap().unwrap_local()
            .instrs_iter()
            .filter_map(|i| match &i.kind {
                InstrK::CallDirect { func_name } => Some(func_name.clone()),
                _ => None
            })
            .collect()
    }

    #[test]
    fn identifier_format() {
        assert_eq!(call_site_identifier("m", "g"), "[m]g");
        assert_eq!(Hook::Before.tool_name("time.cpp"), "__instrument_before_call_time.cpp");
        assert_eq!(Hook::After.multiplex_name(), "__instrument_after_call_multiplex");
    }

    #[test]
    fn no_tools_is_a_no_op() {
        let mut m = target_module();
        let mut pass = InstrumentPass::new(InstrumentConfig::default());
        assert!(!m.do_module_pass(&mut pass).unwrap());
        assert_eq!(m.function_count(), 2);
    }

    #[test]
    fn target_uses_first_tool() {
        let mut m = target_module();
        let pass = InstrumentPass::new(config(&["t1", "t2"], TargetInstrumentation::FirstToolOnly, ComposeFunction::DontCompose));
        let outcome = pass.instrument(&mut m).unwrap();
        assert!(matches!(outcome, InstrumentOutcome::Rewritten { call_sites: 2, .. }));

        assert_eq!(call_names(&m, "main"), vec![
            "__instrument_before_call_t1", "work", "__instrument_after_call_t1",
            "__instrument_before_call_t1", "work", "__instrument_after_call_t1",
        ]);
        // the generic declarations were renamed, not duplicated
        assert!(m.get_function("__instrument_before_call").is_none());
        assert!(m.get_function("__instrument_before_call_t1").unwrap().is_extern());
        // every call site gets its own local
        assert_eq!(m.get_function("main").unwrap().unwrap_local().all_local_count(), 2);
        verify_module(&m).unwrap();
    }

    #[test]
    fn multiplexer_calls_every_tool() {
        let mut m = target_module();
        let pass = InstrumentPass::new(config(&["t1", "t2"], TargetInstrumentation::Multiplex, ComposeFunction::DontCompose));
        pass.instrument(&mut m).unwrap();

        let mux = m.get_function("__instrument_before_call_multiplex").unwrap().unwrap_local();
        assert_eq!(mux.linkage(), Linkage::LinkOnceOdr);
        assert_eq!(call_names(&m, "__instrument_before_call_multiplex"), vec![
            "__instrument_before_call_t1", "__instrument_before_call_t2"
        ]);
        assert_eq!(call_names(&m, "main")[0], "__instrument_before_call_multiplex");
        verify_module(&m).unwrap();
    }

    #[test]
    fn leaf_tool_is_only_renamed() {
        let mut m = Module::new("t1");
        let ty = hook_type(&mut m);
        for hook in Hook::ALL {
            let mut builder = FunctionBuilder::new(hook.generic_name().to_string(), [m.ptr_t()], []);
            builder.i_call("log".to_string());
            builder.i_return();
            builder.finish(&mut m).unwrap();
        }
        m.add_extern_function(ExternFunction::new("log".to_string(), ty)).unwrap();

        let pass = InstrumentPass::new(config(&["t1"], TargetInstrumentation::FirstToolOnly, ComposeFunction::Chained));
        let outcome = pass.instrument(&mut m).unwrap();
        assert!(matches!(outcome, InstrumentOutcome::Renamed { .. }));
        assert_eq!(call_names(&m, "__instrument_before_call_t1"), vec!["log"]);
    }

    #[test]
    fn hook_with_wrong_type_is_rejected() {
        let mut m = target_module();
        let wrong = m.intern_type(crate::ty::Type::Func { args: vec![], ret: vec![] });
        m.add_extern_function(ExternFunction::new("__instrument_before_call_t1".to_string(), wrong)).unwrap();

        let pass = InstrumentPass::new(config(&["t1"], TargetInstrumentation::FirstToolOnly, ComposeFunction::DontCompose));
        assert!(matches!(pass.instrument(&mut m), Err(InstrumentError::Module(_))));
    }
}
