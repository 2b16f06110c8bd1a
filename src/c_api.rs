//! Offers C bindings to the library
#![allow(clippy::missing_safety_doc)]

use std::{ffi::CStr, os::raw::c_char, panic::catch_unwind, ptr::null};

use log::error;

use crate::{
    builder::{self, FunctionBuilder, InstrBuilder},
    config::{ComposeFunction, InstrumentConfig, TargetInstrumentation},
    instr::{self, BlockTag, Cmp},
    irprint::IRPrint,
    module::{ExternFunction, Module},
    passes::InstrumentPass,
    ty::{Ty, Type},
};

#[inline]
fn c_alloc<T>(x: T) -> *mut () { Box::leak(Box::new(x)) as *mut T as *mut () }

#[inline]
unsafe fn c_dealloc<T>(x: *mut ()) {
    if !x.is_null() {
        std::mem::drop(Box::from_raw(x as *mut T))
    }
}

#[inline]
unsafe fn slice_of<T>(ptr: *const T, len: usize) -> &'static [T] {
    if len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(ptr, len)
}

/// Names which aren't valid UTF-8 are converted lossily
#[inline]
unsafe fn string_of(ptr: *const c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[inline]
unsafe fn ty_of<'ctx>(type_ref: TypeRef) -> Ty<'ctx> {
    Ty::from_raw(type_ref as *const Type)
}

/// Run `f` on the builder behind `builder`, or return `on_null` for a null builder
#[inline]
unsafe fn with_builder<R>(builder: FunctionBuilderRef, on_null: R, f: impl FnOnce(&mut FunctionBuilder<'static>) -> R) -> R {
    match (builder as *mut FunctionBuilder).as_mut() {
        Some(builder) => f(builder),
        None => on_null,
    }
}

/// Returned in place of a local or block index when the builder is null
const INVALID_INDEX: usize = usize::MAX;

//
//--- HERE STARTS THE PUBLIC API ---
//

pub type ModuleRef = *mut ();

#[no_mangle]
pub unsafe extern "C" fn create_module(module_name: *const c_char) -> ModuleRef {
    c_alloc(Module::new(string_of(module_name)))
}

#[no_mangle]
pub unsafe extern "C" fn free_module(module: ModuleRef) {
    c_dealloc::<Module>(module);
}

#[no_mangle]
pub unsafe extern "C" fn dump_module(module: ModuleRef) {
    if let Some(module) = (module as *const Module).as_ref() {
        let mut s = String::new();
        if IRPrint::ir_print(module, &mut s).is_ok() {
            eprint!("{}", s);
        }
    }
}

pub type TypeRef = *const ();

macro_rules! primitive_type_getter {
    ( $( $out_name:ident : $getter:ident )* ) => {
        $(
#[no_mangle]
pub unsafe extern "C" fn $out_name(module: ModuleRef) -> TypeRef {
    (module as *const Module).as_ref()
        .map(|m| m.$getter().as_ref() as *const Type as *const ())
        .unwrap_or(null())
}
        )*
    };
}

primitive_type_getter!(
    module_get_int32_type : int32t
    module_get_uint32_type : uint32t
    module_get_int16_type : int16t
    module_get_uint16_type : uint16t
    module_get_int8_type : int8t
    module_get_uint8_type : uint8t
    module_get_float32_type : float32t
    module_get_ptr_type : ptr_t
);

#[no_mangle]
pub unsafe extern "C" fn module_get_func_type(module: ModuleRef, arg_types: *const TypeRef, argc: usize, ret_types: *const TypeRef, retc: usize) -> TypeRef {
    let args = slice_of(arg_types, argc).iter().map(|type_ref| ty_of(*type_ref));
    let rets = slice_of(ret_types, retc).iter().map(|type_ref| ty_of(*type_ref));
    (module as *mut Module).as_mut()
        .map(|m| m.intern_type(Type::Func {
            args: args.collect(),
            ret: rets.collect()
        }).as_ref() as *const Type as *const ())
        .unwrap_or(null())
}

#[no_mangle]
pub unsafe extern "C" fn module_get_array_type(module: ModuleRef, elem_type: TypeRef, len: usize) -> TypeRef {
    (module as *mut Module).as_mut()
        .map(|m| m.intern_type(Type::Array { elem: ty_of(elem_type), len }).as_ref() as *const Type as *const ())
        .unwrap_or(null())
}

/// Declare an external function. Returns false if the declaration conflicts
/// with an existing symbol.
#[no_mangle]
pub unsafe extern "C" fn module_new_extern_function(
    module: ModuleRef,
    function_name: *const c_char,
    function_type: TypeRef) -> bool {

    let func_name = string_of(function_name);
    let func_ty = ty_of(function_type);
    match (module as *mut Module).as_mut() {
        Some(m) => m.add_extern_function(ExternFunction::new(func_name, func_ty)).is_ok(),
        None => false
    }
}

pub type FunctionBuilderRef = *mut ();

#[no_mangle]
pub unsafe extern "C" fn create_function_builder(
    function_name: *const c_char,
    function_type: TypeRef
) -> FunctionBuilderRef {
    let func_name = string_of(function_name);
    let func_ty = ty_of(function_type);
    match &*func_ty {
        Type::Func { args, ret } => c_alloc(FunctionBuilder::new(func_name, args.clone(), ret.clone())),
        _ => std::ptr::null_mut()
    }
}

/// Add the built function to the module. Returns false if the function
/// conflicts with an existing symbol.
#[no_mangle]
pub unsafe extern "C" fn finish_function_builder(module: ModuleRef, builder: FunctionBuilderRef) -> bool {
    if builder.is_null() {
        return false;
    }
    let builder = *Box::from_raw(builder as *mut FunctionBuilder);
    match (module as *mut Module).as_mut() {
        Some(m) => builder.finish(m).is_ok(),
        None => false
    }
}

pub type LocalRef = builder::LocalRef;

#[no_mangle]
pub unsafe extern "C" fn builder_get_arg(builder: FunctionBuilderRef, arg_index: usize) -> LocalRef {
    with_builder(builder, INVALID_INDEX.into(), |b| b.get_arg(arg_index))
}

#[no_mangle]
pub unsafe extern "C" fn builder_new_local(builder: FunctionBuilderRef, ty: TypeRef) -> LocalRef {
    with_builder(builder, INVALID_INDEX.into(), |b| b.new_local(ty_of(ty)))
}

pub type BlockId = instr::BlockId;

#[no_mangle]
pub unsafe extern "C" fn builder_new_block(builder: FunctionBuilderRef, block_returns: *const TypeRef, block_returnc: usize, block_tag: BlockTag) -> BlockId {
    let returns = slice_of(block_returns, block_returnc).iter().map(|type_ref| ty_of(*type_ref));
    with_builder(builder, INVALID_INDEX.into(), |b| b.new_block(returns, block_tag))
}

#[no_mangle]
pub unsafe extern "C" fn builder_switch_block(builder: FunctionBuilderRef, new_block: BlockId) {
    with_builder(builder, (), |b| b.switch_block(new_block))
}

#[no_mangle]
pub unsafe extern "C" fn builder_get_current_block(builder: FunctionBuilderRef) -> BlockId {
    with_builder(builder, INVALID_INDEX.into(), |b| b.current_block())
}

// INSTRUCTIONS

#[no_mangle]
pub unsafe extern "C" fn builder_i_ld_int(builder: FunctionBuilderRef, val: u32, int_type: TypeRef) {
    with_builder(builder, (), |b| b.i_ld_int(val, ty_of(int_type)))
}

#[no_mangle]
pub unsafe extern "C" fn builder_i_ld_float(builder: FunctionBuilderRef, val: f32) { with_builder(builder, (), |b| b.i_ld_float(val)) }

macro_rules! argless_instr {
    ( $( $out_name:ident : $instr_name:ident )* ) => {
        $(
#[no_mangle]
pub unsafe extern "C" fn $out_name(builder: FunctionBuilderRef) {
    with_builder(builder, (), |b| b.$instr_name())
}
        )*
    };
}

argless_instr!(
    builder_i_iadd : i_iadd
    builder_i_isub : i_isub
    builder_i_imul : i_imul
    builder_i_idiv : i_idiv
    builder_i_fadd : i_fadd
    builder_i_fsub : i_fsub
    builder_i_fmul : i_fmul
    builder_i_fdiv : i_fdiv
    builder_i_itof : i_itof
    builder_i_not : i_not
    builder_i_bit_and : i_bit_and
    builder_i_bit_or : i_bit_or
    builder_i_call_indirect : i_call_indirect
    builder_i_break : i_break
    builder_i_discard : i_discard
    builder_i_return : i_return
    builder_i_fail : i_fail
);

macro_rules! typed_instr {
    ( $( $out_name:ident : $instr_name:ident )* ) => {
        $(
#[no_mangle]
pub unsafe extern "C" fn $out_name(builder: FunctionBuilderRef, ty: TypeRef) {
    with_builder(builder, (), |b| b.$instr_name(ty_of(ty)))
}
        )*
    };
}

typed_instr!(
    builder_i_ftoi : i_ftoi
    builder_i_iconv : i_iconv
    builder_i_bitcast : i_bitcast
    builder_i_read : i_read
    builder_i_write : i_write
    builder_i_offset : i_offset
    builder_i_alloca : i_alloca
);

#[no_mangle]
pub unsafe extern "C" fn builder_i_icmp(builder: FunctionBuilderRef, cmp: Cmp) { with_builder(builder, (), |b| b.i_icmp(cmp)) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_fcmp(builder: FunctionBuilderRef, cmp: Cmp) { with_builder(builder, (), |b| b.i_fcmp(cmp)) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_call(builder: FunctionBuilderRef, func_name: *const c_char) { with_builder(builder, (), |b| b.i_call(string_of(func_name))) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_ld_local(builder: FunctionBuilderRef, loc: LocalRef) { with_builder(builder, (), |b| b.i_ld_local(loc)) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_st_local(builder: FunctionBuilderRef, loc: LocalRef) { with_builder(builder, (), |b| b.i_st_local(loc)) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_ld_global_func(builder: FunctionBuilderRef, func_name: *const c_char) { with_builder(builder, (), |b| b.i_ld_global_func(string_of(func_name))) }

#[no_mangle]
pub unsafe extern "C" fn builder_i_if(builder: FunctionBuilderRef, then_block: BlockId) {
    with_builder(builder, (), |b| b.i_if_else(then_block, None))
}

#[no_mangle]
pub unsafe extern "C" fn builder_i_if_else(builder: FunctionBuilderRef, then_block: BlockId, else_block: BlockId) {
    with_builder(builder, (), |b| b.i_if_else(then_block, Some(else_block)))
}

#[no_mangle]
pub unsafe extern "C" fn builder_i_loop(builder: FunctionBuilderRef, body: BlockId) {
    with_builder(builder, (), |b| b.i_loop(body))
}

#[no_mangle]
pub unsafe extern "C" fn builder_i_get_field_ptr(builder: FunctionBuilderRef, struct_ty: TypeRef, field_idx: usize) {
    with_builder(builder, (), |b| b.i_get_field_ptr(ty_of(struct_ty), field_idx))
}

// INSTRUMENTATION

/// The tools and modes collected before the configuration is frozen
#[derive(Default)]
struct ConfigDraft {
    tools: Vec<String>,
    target_instrumentation: TargetInstrumentation,
    compose_function: ComposeFunction,
}

pub type ConfigRef = *mut ();

#[no_mangle]
pub extern "C" fn create_instrument_config() -> ConfigRef {
    c_alloc(ConfigDraft::default())
}

#[no_mangle]
pub unsafe extern "C" fn free_instrument_config(config: ConfigRef) {
    c_dealloc::<ConfigDraft>(config);
}

#[no_mangle]
pub unsafe extern "C" fn config_add_tool(config: ConfigRef, tool_name: *const c_char) {
    if let Some(config) = (config as *mut ConfigDraft).as_mut() {
        config.tools.push(string_of(tool_name));
    }
}

#[no_mangle]
pub unsafe extern "C" fn config_set_target_instrumentation(config: ConfigRef, mode: TargetInstrumentation) {
    if let Some(config) = (config as *mut ConfigDraft).as_mut() {
        config.target_instrumentation = mode;
    }
}

#[no_mangle]
pub unsafe extern "C" fn config_set_compose_function(config: ConfigRef, mode: ComposeFunction) {
    if let Some(config) = (config as *mut ConfigDraft).as_mut() {
        config.compose_function = mode;
    }
}

/// Run the instrumentation pass on a module.
///
/// Returns 1 if the module was modified, 0 if it wasn't and -1 on error.
/// The module may be partially rewritten after an error.
#[no_mangle]
pub unsafe extern "C" fn instrument_module(module: ModuleRef, config: ConfigRef) -> i32 {
    let (module, draft) = match ((module as *mut Module).as_mut(), (config as *const ConfigDraft).as_ref()) {
        (Some(module), Some(draft)) => (module, draft),
        _ => return -1
    };
    let pass = InstrumentPass::new(InstrumentConfig::new(
        draft.tools.iter().cloned(),
        draft.target_instrumentation,
        draft.compose_function
    ));

    let result = catch_unwind(std::panic::AssertUnwindSafe(|| pass.process(module)));
    match result {
        Ok(Ok(modified)) => modified as i32,
        Ok(Err(e)) => {
            error!("{}: {}", module.name(), e);
            -1
        }
        Err(_) => -1
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::CString, ptr::{null, null_mut}};

    use crate::instr::InstrK;

    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    /// `main.c` with `func "main" () -> ()` calling the extern `work` once
    unsafe fn build_target() -> ModuleRef {
        let module = create_module(c("main.c").as_ptr());
        let unit_fn = module_get_func_type(module, null(), 0, null(), 0);
        assert!(module_new_extern_function(module, c("work").as_ptr(), unit_fn));

        let builder = create_function_builder(c("main").as_ptr(), unit_fn);
        assert!(!builder.is_null());
        builder_i_call(builder, c("work").as_ptr());
        builder_i_return(builder);
        assert!(finish_function_builder(module, builder));
        module
    }

    unsafe fn call_names(module: ModuleRef, func: &str) -> Vec<String> {
        let module = (module as *const Module).as_ref().unwrap();
        module.get_function(func).unwrap().unwrap_local()
            .instrs_iter()
            .filter_map(|i| match &i.kind {
                InstrK::CallDirect { func_name } => Some(func_name.clone()),
                _ => None
            })
            .collect()
    }

    #[test]
    fn no_tools_leaves_the_module_alone() {
        unsafe {
            let module = build_target();
            let config = create_instrument_config();
            assert_eq!(instrument_module(module, config), 0);
            assert_eq!(call_names(module, "main"), vec!["work"]);
            free_instrument_config(config);
            free_module(module);
        }
    }

    #[test]
    fn one_tool_brackets_the_call() {
        unsafe {
            let module = build_target();
            let config = create_instrument_config();
            config_add_tool(config, c("t1").as_ptr());
            // a single tool collapses to first-tool-only
            config_set_target_instrumentation(config, TargetInstrumentation::Multiplex);
            config_set_compose_function(config, ComposeFunction::Chained);

            assert_eq!(instrument_module(module, config), 1);
            assert_eq!(call_names(module, "main"), vec![
                "__instrument_before_call_t1", "work", "__instrument_after_call_t1",
            ]);
            free_instrument_config(config);
            free_module(module);
        }
    }

    #[test]
    fn hook_with_wrong_type_is_an_error() {
        unsafe {
            let module = build_target();
            let unit_fn = module_get_func_type(module, null(), 0, null(), 0);
            assert!(module_new_extern_function(module, c("__instrument_before_call_t1").as_ptr(), unit_fn));

            let config = create_instrument_config();
            config_add_tool(config, c("t1").as_ptr());
            assert_eq!(instrument_module(module, config), -1);
            free_instrument_config(config);
            free_module(module);
        }
    }

    #[test]
    fn null_handles_are_rejected() {
        unsafe {
            let module = build_target();
            assert_eq!(instrument_module(module, null_mut()), -1);

            let config = create_instrument_config();
            assert_eq!(instrument_module(null_mut(), config), -1);
            // setters ignore a null config
            config_add_tool(null_mut(), c("t1").as_ptr());
            free_instrument_config(config);
            free_instrument_config(null_mut());
            free_module(module);
        }
    }

    #[test]
    fn null_builder_is_ignored() {
        unsafe {
            let module = create_module(c("m").as_ptr());
            let int32 = module_get_int32_type(module);

            assert_eq!(usize::from(builder_new_local(null_mut(), int32)), usize::MAX);
            assert_eq!(builder_get_current_block(null_mut()).id(), usize::MAX);
            builder_i_ld_int(null_mut(), 1, int32);
            builder_i_return(null_mut());
            assert!(!finish_function_builder(module, null_mut()));

            // not a function type
            assert!(create_function_builder(c("f").as_ptr(), int32).is_null());
            free_module(module);
        }
    }
}
