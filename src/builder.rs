//! Function builder helps with creating valid IR.

use indexmap::IndexMap;

use crate::{instr::{BlockId, BlockTag, Cmp, Function, Instr, InstrBlock, InstrK, Linkage}, module::{Functional, Module, ModuleError}, ty::{Ty, Type}};

pub struct FunctionBuilder<'ctx> {
    blocks: IndexMap<BlockId, InstrBlock<'ctx>>,
    next_block_id: usize,
    /// The index of the block currently being modified
    current_block: usize,
    /// A vector of locals INCLUDING the arguments
    locals: Vec<Ty<'ctx>>,
    /// Argument count
    argc: usize,
    /// Return types
    ret: Vec<Ty<'ctx>>,
    /// The function name
    fname: String,
    linkage: Linkage
}

impl<'ctx> FunctionBuilder<'ctx> {
    pub fn new(
        func_name: String,
        arguments: impl IntoIterator<Item = Ty<'ctx>>,
        returns: impl IntoIterator<Item = Ty<'ctx>>) -> Self {

        let locals: Vec<_> = arguments.into_iter().collect();
        let ret: Vec<_> = returns.into_iter().collect();

        let entry_block = InstrBlock::new(BlockId::entry_block_id(), ret.clone(), BlockTag::Main);

        FunctionBuilder {
            blocks: {
                let mut h = IndexMap::new();
                h.insert(BlockId::entry_block_id(), entry_block);
                h
            },
            next_block_id: 1,
            current_block: 0,
            argc: locals.len(),
            locals,
            ret,
            fname: func_name,
            linkage: Linkage::External
        }
    }

    /// Get reference to an Nth argument
    pub fn get_arg(&self, arg_index: usize) -> LocalRef {
        assert!(arg_index < self.argc);
        LocalRef(arg_index)
    }

    pub fn new_local(&mut self, ty: Ty<'ctx>) -> LocalRef {
        self.locals.push(ty);
        LocalRef(self.locals.len() - 1)
    }

    pub fn new_block(&mut self, returns: impl IntoIterator<Item = Ty<'ctx>>, tag: BlockTag) -> BlockId {
        let new_block_id = self.next_block_id.into();
        let new_block = InstrBlock::new(new_block_id, returns.into_iter().collect(), tag);
        self.blocks.insert(new_block_id, new_block);
        self.next_block_id += 1;
        new_block_id
    }

    pub fn switch_block(&mut self, new_current_block: BlockId) {
        assert!(self.blocks.contains_key(&new_current_block));
        self.current_block = new_current_block.into();
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block.into()
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        self.linkage = linkage;
    }

    /// Finish building the function without adding it to the module
    pub fn build(self, module: &mut Module<'ctx>) -> Function<'ctx> {
        let func_ty = module.intern_type(
            Type::Func { args: self.locals[0..self.argc].to_vec(), ret: self.ret }
        );
        let mut func = Function::new(
            self.fname,
            func_ty,
            self.blocks,
            self.locals
        );
        func.set_linkage(self.linkage);
        func
    }

    /// Finish building the current function and add it to the module
    pub fn finish(self, module: &mut Module<'ctx>) -> Result<usize, ModuleError> {
        let func = self.build(module);
        module.add_function(Functional::Local(func))
    }
}

impl<'ctx> InstrBuilder<'ctx> for FunctionBuilder<'ctx> {
    fn instr(&mut self, i: InstrK<'ctx>) {
        let curr_block = self.current_block.into();
        self.blocks.get_mut(&curr_block).unwrap().body.push(Instr::new(i));
    }
}

pub trait InstrBuilder<'ctx> {
    fn instr(&mut self, i: InstrK<'ctx>);

    fn i_ld_int(&mut self, val: u32, ty: Ty<'ctx>) { self.instr(InstrK::LdInt(val, ty)) }
    fn i_ld_float(&mut self, val: f32) { self.instr(InstrK::LdFloat(val)) }
    fn i_ld_bytes(&mut self, bytes: Vec<u8>, ty: Ty<'ctx>) { self.instr(InstrK::LdBytes(bytes, ty)) }
    fn i_iadd(&mut self) { self.instr(InstrK::IAdd) }
    fn i_isub(&mut self) { self.instr(InstrK::ISub) }
    fn i_imul(&mut self) { self.instr(InstrK::IMul) }
    fn i_idiv(&mut self) { self.instr(InstrK::IDiv) }
    fn i_fadd(&mut self) { self.instr(InstrK::FAdd) }
    fn i_fsub(&mut self) { self.instr(InstrK::FSub) }
    fn i_fmul(&mut self) { self.instr(InstrK::FMul) }
    fn i_fdiv(&mut self) { self.instr(InstrK::FDiv) }
    fn i_itof(&mut self) { self.instr(InstrK::Itof) }
    fn i_ftoi(&mut self, int_ty: Ty<'ctx>) { self.instr(InstrK::Ftoi { int_ty }) }
    fn i_iconv(&mut self, target: Ty<'ctx>) { self.instr(InstrK::IConv { target }) }
    fn i_not(&mut self) { self.instr(InstrK::Not) }
    fn i_bit_and(&mut self) { self.instr(InstrK::BitAnd) }
    fn i_bit_or(&mut self) { self.instr(InstrK::BitOr) }
    fn i_icmp(&mut self, cmp: Cmp) { self.instr(InstrK::ICmp(cmp)) }
    fn i_fcmp(&mut self, cmp: Cmp) { self.instr(InstrK::FCmp(cmp)) }
    fn i_call(&mut self, func_name: String) { self.instr(InstrK::CallDirect { func_name }) }
    fn i_ld_local(&mut self, loc: LocalRef) { self.instr(InstrK::LdLocal { idx: loc.into() }) }
    fn i_st_local(&mut self, loc: LocalRef) { self.instr(InstrK::StLocal { idx: loc.into() }) }
    fn i_ld_global_func(&mut self, func_name: String) { self.instr(InstrK::LdGlobalFunc { func_name }) }
    fn i_call_indirect(&mut self) { self.instr(InstrK::CallIndirect) }
    fn i_bitcast(&mut self, target: Ty<'ctx>) { self.instr(InstrK::Bitcast { target }) }
    fn i_if_else(&mut self, then: BlockId, r#else: Option<BlockId>) { self.instr(InstrK::IfElse { then, r#else }) }
    fn i_loop(&mut self, body: BlockId) { self.instr(InstrK::Loop(body)) }
    fn i_break(&mut self) { self.instr(InstrK::Break) }
    fn i_read(&mut self, ty: Ty<'ctx>) { self.instr(InstrK::Read { ty }) }
    fn i_write(&mut self, ty: Ty<'ctx>) { self.instr(InstrK::Write { ty }) }
    fn i_offset(&mut self, ty: Ty<'ctx>) { self.instr(InstrK::Offset { ty }) }
    fn i_get_field_ptr(&mut self, struct_ty: Ty<'ctx>, field_idx: usize) { self.instr(InstrK::GetFieldPtr { struct_ty, field_idx }) }
    fn i_alloca(&mut self, ty: Ty<'ctx>) { self.instr(InstrK::Alloca { ty }) }
    fn i_discard(&mut self) { self.instr(InstrK::Discard) }
    fn i_return(&mut self) { self.instr(InstrK::Return) }
    fn i_fail(&mut self) { self.instr(InstrK::Fail) }
}

/// A wrapper which acts as a reference to a local.
#[repr(transparent)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct LocalRef(usize);

impl From<LocalRef> for usize {
    fn from(r: LocalRef) -> Self {
        r.0
    }
}

impl From<usize> for LocalRef {
    fn from(idx: usize) -> Self {
        LocalRef(idx)
    }
}
