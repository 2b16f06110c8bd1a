use std::collections::HashMap;

use indexmap::IndexMap;
use libintern::Interner;

use crate::{instr::{Function, Linkage}, pass::{FunctionPass, ModulePass, MutableFunctionPass}, ty::{Ty, Type}};

pub struct Module<'ctx> {
    /// The module identifier, usually the path of the source file it was compiled from
    name: String,
    type_ctx: Interner<'ctx, Type<'ctx>>,
    // The functions are in a vector to make sure they have an ordering which does not change
    functions: Vec<Functional<'ctx>>,
    // This is for fast lookup by name
    function_registry: HashMap<String, usize>,
    /// Pointer-cast wrappers, ordered by definition
    aliases: IndexMap<String, Alias<'ctx>>,
    /// We cache Ty<'ctx> of primitive types for faster access
    primitive_types_cache: PrimitiveTypeCache<'ctx>,
}

struct PrimitiveTypeCache<'ctx> {
    int32: Ty<'ctx>,
    uint32: Ty<'ctx>,
    int16: Ty<'ctx>,
    uint16: Ty<'ctx>,
    int8: Ty<'ctx>,
    uint8: Ty<'ctx>,
    float32: Ty<'ctx>,
    ptr: Ty<'ctx>
}

/// Either a function defined in this module or a declaration
/// of a function defined elsewhere.
#[derive(Clone)]
pub enum Functional<'ctx> {
    Local(Function<'ctx>),
    Extern(ExternFunction<'ctx>)
}

impl<'ctx> Functional<'ctx> {
    pub fn name(&self) -> &str {
        match self {
            Functional::Local(f) => f.name(),
            Functional::Extern(f) => f.name(),
        }
    }

    pub fn ty(&self) -> Ty<'ctx> {
        match self {
            Functional::Local(f) => f.ty(),
            Functional::Extern(f) => f.ty(),
        }
    }

    pub fn idx(&self) -> usize {
        match self {
            Functional::Local(f) => f.idx,
            Functional::Extern(f) => f.idx,
        }
    }

    fn set_idx(&mut self, idx: usize) {
        match self {
            Functional::Local(f) => f.idx = idx,
            Functional::Extern(f) => f.idx = idx,
        }
    }

    fn set_name(&mut self, name: String) {
        match self {
            Functional::Local(f) => f.set_name(name),
            Functional::Extern(f) => f.name = name,
        }
    }

    pub fn is_extern(&self) -> bool {
        matches!(self, Functional::Extern(_))
    }

    pub fn as_local(&self) -> Option<&Function<'ctx>> {
        match self {
            Functional::Local(f) => Some(f),
            Functional::Extern(_) => None,
        }
    }

    pub fn unwrap_local(&self) -> &Function<'ctx> {
        self.as_local().expect("Expected a local function")
    }

    pub fn unwrap_local_mut(&mut self) -> &mut Function<'ctx> {
        match self {
            Functional::Local(f) => f,
            Functional::Extern(_) => panic!("Expected a local function"),
        }
    }

    fn is_link_once(&self) -> bool {
        matches!(self, Functional::Local(f) if f.linkage() == Linkage::LinkOnceOdr)
    }
}

/// A declaration of a function whose body lives in another module
#[derive(Clone)]
pub struct ExternFunction<'ctx> {
    name: String,
    ty: Ty<'ctx>,
    pub(crate) idx: usize
}

impl<'ctx> ExternFunction<'ctx> {
    pub fn new(name: String, ty: Ty<'ctx>) -> Self {
        assert!(ty.is_func(), "The type of an ExternFunction must be a function type");
        ExternFunction { name, ty, idx: usize::MAX }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Ty<'ctx> {
        self.ty
    }
}

/// A symbol which refers to another function viewed through a (possibly) different type.
///
/// Calling an alias calls the aliasee.
#[derive(Clone)]
pub struct Alias<'ctx> {
    pub(crate) aliasee: String,
    pub(crate) ty: Ty<'ctx>
}

impl<'ctx> Alias<'ctx> {
    pub fn aliasee(&self) -> &str {
        &self.aliasee
    }

    pub fn ty(&self) -> Ty<'ctx> {
        self.ty
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("symbol `{name}` is defined more than once")]
    DuplicateSymbol { name: String },
    #[error("symbol `{name}` already exists with a different signature")]
    SignatureMismatch { name: String },
    #[error("no function named `{name}`")]
    UnknownFunction { name: String },
    #[error("alias `{name}` does not resolve to a function")]
    DanglingAlias { name: String },
}

impl<'ctx> Module<'ctx> {
    pub fn new(name: impl Into<String>) -> Self {
        let mut type_ctx = Interner::new();
        let cache = PrimitiveTypeCache {
            int32: type_ctx.intern(Type::Int32),
            uint32: type_ctx.intern(Type::UInt32),
            int16: type_ctx.intern(Type::Int16),
            uint16: type_ctx.intern(Type::UInt16),
            int8: type_ctx.intern(Type::Int8),
            uint8: type_ctx.intern(Type::UInt8),
            float32: type_ctx.intern(Type::Float32),
            ptr: type_ctx.intern(Type::Ptr)
        };
        Module {
            name: name.into(),
            type_ctx,
            functions: Vec::new(),
            function_registry: HashMap::new(),
            aliases: IndexMap::new(),
            primitive_types_cache: cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn intern_type(&mut self, ty: Type<'ctx>) -> Ty<'ctx> {
        self.type_ctx.intern(ty)
    }

    /// Re-intern a type which may come from another module
    pub fn import_type(&mut self, ty: Ty<'ctx>) -> Ty<'ctx> {
        let imported = match &*ty {
            Type::Int8 => return self.int8t(),
            Type::UInt8 => return self.uint8t(),
            Type::Int16 => return self.int16t(),
            Type::UInt16 => return self.uint16t(),
            Type::Int32 => return self.int32t(),
            Type::UInt32 => return self.uint32t(),
            Type::Float32 => return self.float32t(),
            Type::Ptr => return self.ptr_t(),
            Type::Func { args, ret } => Type::Func {
                args: args.iter().map(|t| self.import_type(*t)).collect(),
                ret: ret.iter().map(|t| self.import_type(*t)).collect()
            },
            Type::Struct { fields } => Type::Struct {
                fields: fields.iter().map(|t| self.import_type(*t)).collect()
            },
            Type::Array { elem, len } => Type::Array { elem: self.import_type(*elem), len: *len },
        };
        self.intern_type(imported)
    }

    /// Add a function to the module and return its index.
    ///
    /// Adding a definition of a function which is only declared replaces the declaration
    /// in place. Declaring an already existing function is a no-op as long as the signatures match.
    /// Two link-once definitions collapse into the first one.
    pub fn add_function(&mut self, function: Functional<'ctx>) -> Result<usize, ModuleError> {
        if self.aliases.contains_key(function.name()) {
            return Err(ModuleError::DuplicateSymbol { name: function.name().to_owned() });
        }

        let idx = match self.function_registry.get(function.name()).copied() {
            None => {
                let idx = self.functions.len();
                self.function_registry.insert(function.name().to_owned(), idx);
                self.functions.push(function);
                idx
            }
            Some(idx) => {
                let existing = &self.functions[idx];
                if existing.ty() != function.ty() {
                    return Err(ModuleError::SignatureMismatch { name: function.name().to_owned() });
                }
                match (existing.is_extern(), function.is_extern()) {
                    // a new declaration of something we already know about
                    (_, true) => return Ok(idx),
                    (true, false) => self.functions[idx] = function,
                    (false, false) => {
                        if existing.is_link_once() && function.is_link_once() {
                            return Ok(idx);
                        }
                        return Err(ModuleError::DuplicateSymbol { name: function.name().to_owned() });
                    }
                }
                idx
            }
        };
        self.functions[idx].set_idx(idx);
        Ok(idx)
    }

    /// Declare an external function
    pub fn add_extern_function(&mut self, function: ExternFunction<'ctx>) -> Result<usize, ModuleError> {
        self.add_function(Functional::Extern(function))
    }

    /// Return an immutable reference to a Function.
    /// Returns None if the function doesn't exist.
    pub fn get_function(&self, name: &str) -> Option<&Functional<'ctx>> {
        let idx = *self.function_registry.get(name)?;
        Some(&self.functions[idx])
    }

    pub fn functions_iter(&self) -> std::slice::Iter<'_, Functional<'ctx>> {
        self.functions.iter()
    }

    /// Iterate only the functions which have a body
    pub fn local_functions_iter(&self) -> impl Iterator<Item = &Function<'ctx>> {
        self.functions.iter().filter_map(Functional::as_local)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn function_get_mut_by_idx(&mut self, idx: usize) -> &mut Functional<'ctx> {
        self.functions.get_mut(idx).unwrap()
    }

    /// Names of functions which are declared but not defined in this module
    pub fn unresolved_symbols(&self) -> Vec<&str> {
        self.functions.iter().filter(|f| f.is_extern()).map(|f| f.name()).collect()
    }

    /// Define an alias `name` which refers to `aliasee` viewed as `ty`.
    pub fn add_alias(&mut self, name: String, aliasee: String, ty: Ty<'ctx>) -> Result<(), ModuleError> {
        if self.function_registry.contains_key(&name) || self.aliases.contains_key(&name) {
            return Err(ModuleError::DuplicateSymbol { name });
        }
        self.aliases.insert(name, Alias { aliasee, ty });
        Ok(())
    }

    pub fn get_alias(&self, name: &str) -> Option<&Alias<'ctx>> {
        self.aliases.get(name)
    }

    pub fn aliases_iter(&self) -> indexmap::map::Iter<'_, String, Alias<'ctx>> {
        self.aliases.iter()
    }

    /// The type under which a symbol is called, for both functions and aliases
    pub fn symbol_ty(&self, name: &str) -> Option<Ty<'ctx>> {
        match self.get_function(name) {
            Some(f) => Some(f.ty()),
            None => self.aliases.get(name).map(|a| a.ty)
        }
    }

    /// Look up a symbol by name, declaring it as an external function of type `ty`
    /// if the module doesn't know it.
    ///
    /// Returns the name of the symbol. It may be an alias or a function
    /// of a different type; use [`Module::strip_pointer_casts`] to get to the function.
    pub fn get_or_insert_function(&mut self, name: &str, ty: Ty<'ctx>) -> Result<String, ModuleError> {
        if self.get_function(name).is_none() && self.get_alias(name).is_none() {
            self.add_extern_function(ExternFunction::new(name.to_owned(), ty))?;
        }
        Ok(name.to_owned())
    }

    /// Follow aliases until a function is reached and return its name.
    ///
    /// Returns None if the chain ends in an unknown symbol or loops.
    pub fn strip_pointer_casts<'a>(&'a self, mut name: &'a str) -> Option<&'a str> {
        // a chain can't be longer than the number of aliases without looping
        for _ in 0..=self.aliases.len() {
            if self.function_registry.contains_key(name) {
                return Some(name);
            }
            name = self.aliases.get(name)?.aliasee.as_str();
        }
        None
    }

    /// Give a function a new name, updating every reference to it.
    ///
    /// If a function called `new_name` already exists, the two are merged:
    /// the signatures must match and at most one of them may be a definition
    /// (unless both are link-once). The declaration is dropped.
    pub fn rename_function(&mut self, old_name: &str, new_name: &str) -> Result<(), ModuleError> {
        if old_name == new_name {
            return Ok(());
        }
        let old_idx = *self.function_registry.get(old_name)
            .ok_or_else(|| ModuleError::UnknownFunction { name: old_name.to_owned() })?;
        if self.aliases.contains_key(new_name) {
            return Err(ModuleError::DuplicateSymbol { name: new_name.to_owned() });
        }

        match self.function_registry.get(new_name).copied() {
            None => {
                self.functions[old_idx].set_name(new_name.to_owned());
                self.function_registry.remove(old_name);
                self.function_registry.insert(new_name.to_owned(), old_idx);
            }
            Some(new_idx) => {
                let (old, new) = (&self.functions[old_idx], &self.functions[new_idx]);
                if old.ty() != new.ty() {
                    return Err(ModuleError::SignatureMismatch { name: new_name.to_owned() });
                }
                let keep_old_body = match (old.is_extern(), new.is_extern()) {
                    (false, true) => true,
                    (true, _) => false,
                    (false, false) if old.is_link_once() && new.is_link_once() => false,
                    (false, false) => return Err(ModuleError::DuplicateSymbol { name: new_name.to_owned() })
                };
                if keep_old_body {
                    // the definition takes over the declaration's slot
                    let mut def = self.functions[old_idx].clone();
                    def.set_name(new_name.to_owned());
                    self.functions[new_idx] = def;
                }
                self.functions.remove(old_idx);
                self.reindex();
            }
        }

        self.replace_references(old_name, new_name);
        Ok(())
    }

    /// Rebuild the registry and function indexes after a removal
    fn reindex(&mut self) {
        self.function_registry.clear();
        for (i, f) in self.functions.iter_mut().enumerate() {
            f.set_idx(i);
            self.function_registry.insert(f.name().to_owned(), i);
        }
    }

    fn replace_references(&mut self, old_name: &str, new_name: &str) {
        for f in self.functions.iter_mut() {
            if let Functional::Local(f) = f {
                for instr in f.instrs_iter_mut() {
                    if let Some(referenced) = instr.referenced_function_mut() {
                        if *referenced == old_name {
                            *referenced = new_name.to_owned();
                        }
                    }
                }
            }
        }
        for alias in self.aliases.values_mut() {
            if alias.aliasee == old_name {
                alias.aliasee = new_name.to_owned();
            }
        }
    }

    pub fn int32t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.int32
    }

    pub fn uint32t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.uint32
    }

    pub fn int16t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.int16
    }

    pub fn uint16t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.uint16
    }

    pub fn int8t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.int8
    }

    pub fn uint8t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.uint8
    }

    pub fn float32t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.float32
    }

    pub fn ptr_t(&self) -> Ty<'ctx> {
        self.primitive_types_cache.ptr
    }

    pub fn do_pass<P: FunctionPass<'ctx>>(&self, passer: &mut P) -> Result<(), P::Error> {
        passer.visit_module(self)?;
        for func in self.local_functions_iter() {
            passer.visit_function(self, func)?;
        }
        passer.end_module(self)?;
        Ok(())
    }

    pub fn do_mut_pass<P: MutableFunctionPass<'ctx>>(&mut self, passer: &mut P) -> Result<(), P::Error> {
        passer.visit_module(self)?;
        for i in 0..self.functions.len() {
            let info = match &self.functions[i] {
                Functional::Local(func) => passer.visit_function(self, func)?,
                Functional::Extern(_) => continue,
            };
            passer.mutate_function(self.functions[i].unwrap_local_mut(), info)?;
        }
        Ok(())
    }

    /// Run a whole-module pass. Returns whether the module was modified.
    pub fn do_module_pass<P: ModulePass<'ctx>>(&mut self, passer: &mut P) -> Result<bool, P::Error> {
        passer.run_on_module(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::{builder::{FunctionBuilder, InstrBuilder}, instr::{InstrK, Linkage}, ty::Type};

    use super::{ExternFunction, Functional, Module, ModuleError};

    fn hook_ty<'ctx>(m: &mut Module<'ctx>) -> crate::ty::Ty<'ctx> {
        let ptr = m.ptr_t();
        m.intern_type(Type::Func { args: vec![ptr], ret: vec![] })
    }

    fn calls_of<'a>(m: &'a Module<'_>, func: &str) -> Vec<&'a str> {
        m.get_function(func).unwrap().unwrap_local()
            .instrs_iter()
            .filter_map(|i| match &i.kind {
                InstrK::CallDirect { func_name } => Some(func_name.as_str()),
                _ => None
            })
            .collect()
    }

    #[test]
    fn get_or_insert_declares_missing_function() {
        let mut m = Module::new("m");
        let ty = hook_ty(&mut m);

        let name = m.get_or_insert_function("hook", ty).unwrap();
        assert_eq!(name, "hook");
        assert!(m.get_function("hook").unwrap().is_extern());

        // a second lookup doesn't add anything
        m.get_or_insert_function("hook", ty).unwrap();
        assert_eq!(m.function_count(), 1);
    }

    #[test]
    fn rename_updates_all_references() {
        let mut m = Module::new("m");
        let ty = hook_ty(&mut m);
        m.add_extern_function(ExternFunction::new("old".to_string(), ty)).unwrap();
        m.add_alias("view".to_string(), "old".to_string(), ty).unwrap();

        let mut builder = FunctionBuilder::new("caller".to_string(), [m.ptr_t()], []);
        let arg0 = builder.get_arg(0);
        builder.i_ld_local(arg0);
        builder.i_call("old".to_string());
        builder.i_return();
        builder.finish(&mut m).unwrap();

        m.rename_function("old", "new").unwrap();

        assert!(m.get_function("old").is_none());
        assert!(m.get_function("new").is_some());
        assert_eq!(calls_of(&m, "caller"), vec!["new"]);
        assert_eq!(m.get_alias("view").unwrap().aliasee(), "new");
    }

    #[test]
    fn rename_merges_into_existing_declaration() {
        let mut m = Module::new("m");
        let ty = hook_ty(&mut m);

        let mut builder = FunctionBuilder::new("impl".to_string(), [m.ptr_t()], []);
        builder.i_return();
        builder.finish(&mut m).unwrap();
        m.add_extern_function(ExternFunction::new("public".to_string(), ty)).unwrap();

        m.rename_function("impl", "public").unwrap();

        assert_eq!(m.function_count(), 1);
        let f = m.get_function("public").unwrap();
        assert!(!f.is_extern());
        assert_eq!(f.idx(), 0);
    }

    #[test]
    fn rename_onto_other_definition_fails() {
        let mut m = Module::new("m");
        for name in ["a", "b"] {
            let mut builder = FunctionBuilder::new(name.to_string(), [m.ptr_t()], []);
            builder.i_return();
            builder.finish(&mut m).unwrap();
        }

        assert_eq!(
            m.rename_function("a", "b"),
            Err(ModuleError::DuplicateSymbol { name: "b".to_string() })
        );
    }

    #[test]
    fn rename_with_different_signature_fails() {
        let mut m = Module::new("m");
        let ty = hook_ty(&mut m);
        let other_ty = m.intern_type(Type::Func { args: vec![], ret: vec![] });
        m.add_extern_function(ExternFunction::new("a".to_string(), ty)).unwrap();
        m.add_extern_function(ExternFunction::new("b".to_string(), other_ty)).unwrap();

        assert_eq!(
            m.rename_function("a", "b"),
            Err(ModuleError::SignatureMismatch { name: "b".to_string() })
        );
    }

    #[test]
    fn strip_pointer_casts_follows_aliases() {
        let mut m = Module::new("m");
        let ty = hook_ty(&mut m);
        m.add_extern_function(ExternFunction::new("real".to_string(), ty)).unwrap();
        m.add_alias("cast1".to_string(), "real".to_string(), ty).unwrap();
        m.add_alias("cast2".to_string(), "cast1".to_string(), ty).unwrap();
        m.add_alias("loop1".to_string(), "loop2".to_string(), ty).unwrap();
        m.add_alias("loop2".to_string(), "loop1".to_string(), ty).unwrap();

        assert_eq!(m.strip_pointer_casts("cast2"), Some("real"));
        assert_eq!(m.strip_pointer_casts("real"), Some("real"));
        assert_eq!(m.strip_pointer_casts("loop1"), None);
        assert_eq!(m.strip_pointer_casts("missing"), None);
    }

    #[test]
    fn link_once_definitions_collapse() {
        let mut m = Module::new("m");
        for _ in 0..2 {
            let mut builder = FunctionBuilder::new("shared".to_string(), [m.ptr_t()], []);
            builder.i_return();
            let mut f = builder.build(&mut m);
            f.set_linkage(Linkage::LinkOnceOdr);
            m.add_function(Functional::Local(f)).unwrap();
        }
        assert_eq!(m.function_count(), 1);
    }
}
