//! Merging several modules into one.
//!
//! Declarations resolve against definitions of the same name, link-once
//! definitions collapse into the first one seen.

use indexmap::IndexMap;
use log::{debug, warn};

use crate::{
    instr::{Function, InstrBlock, Linkage},
    irprint::IRPrint,
    module::{ExternFunction, Functional, Module, ModuleError},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("`{name}` from module `{module}` is already defined")]
    DuplicateDefinition { name: String, module: String },
    #[error("`{name}` from module `{module}` doesn't match the signature of an earlier declaration")]
    SignatureMismatch { name: String, module: String },
    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl LinkError {
    fn in_module(error: ModuleError, module: &str) -> Self {
        match error {
            ModuleError::DuplicateSymbol { name } => LinkError::DuplicateDefinition { name, module: module.to_owned() },
            ModuleError::SignatureMismatch { name } => LinkError::SignatureMismatch { name, module: module.to_owned() },
            other => LinkError::Module(other),
        }
    }
}

/// Link `modules` into a new module called `name`.
///
/// The modules are consumed in order, the functions of the output are ordered
/// by where they first appear.
pub fn link_modules<'ctx>(name: impl Into<String>, modules: impl IntoIterator<Item = Module<'ctx>>) -> Result<Module<'ctx>, LinkError> {
    let mut out = Module::new(name);

    for module in modules {
        debug!("linking `{}` into `{}`", module.name(), out.name());

        for function in module.functions_iter() {
            let imported = import_function(&mut out, function);

            if let Some(existing) = out.get_function(imported.name()) {
                match (existing, &imported) {
                    (Functional::Local(a), Functional::Local(b))
                        if a.linkage() == Linkage::LinkOnceOdr && b.linkage() == Linkage::LinkOnceOdr => {
                        if printed(existing) != printed(&imported) {
                            warn!("link-once function `{}` from `{}` differs from an earlier definition, keeping the first one",
                                imported.name(), module.name());
                        }
                    }
                    _ => {}
                }
            } else if imported.is_extern() && out.get_alias(imported.name()).is_some() {
                // the declaration resolves to an alias
                continue;
            }

            out.add_function(imported).map_err(|e| LinkError::in_module(e, module.name()))?;
        }

        for (alias_name, alias) in module.aliases_iter() {
            let ty = out.import_type(alias.ty());
            if let Some(existing) = out.get_alias(alias_name) {
                if existing.aliasee() == alias.aliasee() && existing.ty() == ty {
                    continue;
                }
            }
            out.add_alias(alias_name.clone(), alias.aliasee().to_owned(), ty)
                .map_err(|e| LinkError::in_module(e, module.name()))?;
        }
    }

    Ok(out)
}

fn printed(function: &Functional<'_>) -> String {
    let mut s = String::new();
    // writing into a String can't fail
    let _ = function.ir_print(&mut s);
    s
}

/// Copy a function into `out`, re-interning all of its types
fn import_function<'ctx>(out: &mut Module<'ctx>, function: &Functional<'ctx>) -> Functional<'ctx> {
    match function {
        Functional::Extern(f) => {
            Functional::Extern(ExternFunction::new(f.name().to_owned(), out.import_type(f.ty())))
        }
        Functional::Local(f) => {
            let blocks: IndexMap<_, _> = f.blocks_iter()
                .map(|block| {
                    let returns = block.returns().iter().map(|ty| out.import_type(*ty)).collect();
                    let mut imported = InstrBlock::new(block.id(), returns, block.tag());
                    imported.body = block.body.iter()
                        .map(|instr| instr.map_types(|ty| out.import_type(ty)))
                        .collect();
                    (block.id(), imported)
                })
                .collect();
            let locals = f.all_locals_ty().iter().map(|ty| out.import_type(*ty)).collect();

            let mut imported = Function::new(f.name().to_owned(), out.import_type(f.ty()), blocks, locals);
            imported.set_linkage(f.linkage());
            Functional::Local(imported)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        builder::{FunctionBuilder, InstrBuilder},
        instr::Linkage,
        module::{ExternFunction, Module},
        ty::Type,
        verify::verify_module,
    };

    use super::{link_modules, LinkError};

    fn define<'ctx>(m: &mut Module<'ctx>, name: &str, linkage: Linkage, value: u32) {
        let int32 = m.int32t();
        let mut builder = FunctionBuilder::new(name.to_string(), [], [int32]);
        builder.set_linkage(linkage);
        builder.i_ld_int(value, int32);
        builder.i_return();
        builder.finish(m).unwrap();
    }

    #[test]
    fn declarations_resolve_against_definitions() {
        let mut main = Module::new("main.c");
        let ty = main.intern_type(Type::Func { args: vec![], ret: vec![main.int32t()] });
        main.add_extern_function(ExternFunction::new("answer".to_string(), ty)).unwrap();
        let mut builder = FunctionBuilder::new("main".to_string(), [], [main.int32t()]);
        builder.i_call("answer".to_string());
        builder.i_return();
        builder.finish(&mut main).unwrap();

        let mut lib = Module::new("lib.c");
        define(&mut lib, "answer", Linkage::External, 42);

        let linked = link_modules("a.out", [main, lib]).unwrap();
        assert!(linked.unresolved_symbols().is_empty());
        assert!(!linked.get_function("answer").unwrap().is_extern());
        // the definition took the place of the declaration
        assert_eq!(linked.functions_iter().map(|f| f.name()).collect::<Vec<_>>(), vec!["answer", "main"]);
        verify_module(&linked).unwrap();
    }

    #[test]
    fn link_once_duplicates_collapse() {
        let mut a = Module::new("a.c");
        define(&mut a, "shared", Linkage::LinkOnceOdr, 1);
        let mut b = Module::new("b.c");
        define(&mut b, "shared", Linkage::LinkOnceOdr, 1);

        let linked = link_modules("a.out", [a, b]).unwrap();
        assert_eq!(linked.function_count(), 1);
    }

    #[test]
    fn strong_duplicates_fail() {
        let mut a = Module::new("a.c");
        define(&mut a, "f", Linkage::External, 1);
        let mut b = Module::new("b.c");
        define(&mut b, "f", Linkage::External, 2);

        assert_eq!(
            link_modules("a.out", [a, b]).err(),
            Some(LinkError::DuplicateDefinition { name: "f".to_string(), module: "b.c".to_string() })
        );
    }

    #[test]
    fn mismatched_declaration_fails() {
        let mut a = Module::new("a.c");
        define(&mut a, "f", Linkage::External, 1);
        let mut b = Module::new("b.c");
        let ty = b.intern_type(Type::Func { args: vec![b.ptr_t()], ret: vec![] });
        b.add_extern_function(ExternFunction::new("f".to_string(), ty)).unwrap();

        assert_eq!(
            link_modules("a.out", [a, b]).err(),
            Some(LinkError::SignatureMismatch { name: "f".to_string(), module: "b.c".to_string() })
        );
    }
}
