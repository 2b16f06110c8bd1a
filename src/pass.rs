use crate::{instr::Function, module::Module};

/// A read-only pass over every local function of a module,
/// e.g. the verifier.
pub trait FunctionPass<'ctx> {
    type Error;

    /// Called once before the first function.
    fn visit_module(&mut self, _module: &Module<'ctx>) -> Result<(), Self::Error> { Ok(()) }

    fn visit_function(
        &mut self,
        module: &Module<'ctx>,
        function: &Function<'ctx>) -> Result<(), Self::Error>;

    /// Called once after the last function.
    fn end_module(&mut self, _module: &Module<'ctx>) -> Result<(), Self::Error> { Ok(()) }
}

/// A pass which rewrites function bodies in two steps.
///
/// [`visit_function`](MutableFunctionPass::visit_function) sees the whole
/// module and decides what to change, [`mutate_function`](MutableFunctionPass::mutate_function)
/// then applies it with only the function borrowed mutably.
pub trait MutableFunctionPass<'ctx> {
    type Error;
    /// What `visit_function` hands over to `mutate_function`
    type MutationInfo;

    fn visit_module(&mut self, _module: &Module<'ctx>) -> Result<(), Self::Error> { Ok(()) }

    fn visit_function(
        &mut self,
        module: &Module<'ctx>,
        function: &Function<'ctx>) -> Result<Self::MutationInfo, Self::Error>;

    fn mutate_function(
        &mut self,
        function: &mut Function<'ctx>,
        info: Self::MutationInfo) -> Result<(), Self::Error>;
}

/// A pass which works on the module as a whole, e.g. because it
/// adds, removes or renames functions.
pub trait ModulePass<'ctx> {
    type Error;

    /// Run the pass. Returns true if the module was modified.
    fn run_on_module(&mut self, module: &mut Module<'ctx>) -> Result<bool, Self::Error>;
}
