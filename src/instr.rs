use indexmap::IndexMap;

use crate::ty::{Ty, Type};

#[derive(PartialEq, Debug, Clone)]
pub enum InstrK<'ctx> {
    /// Load a constant integer value onto the stack
    LdInt(u32, Ty<'ctx>),
    /// Load a constant floating-point value onto the stack
    LdFloat(f32),
    /// Load a constant byte array onto the stack.
    ///
    /// The type is always `[N x int8]` where N is the number of bytes.
    LdBytes(Vec<u8>, Ty<'ctx>),
    /// Add two integers
    IAdd,
    /// Subtract two integers
    ISub,
    /// Multiply two integers
    IMul,
    /// Signed divide two integers. The result is undefined if the divisor is zero
    IDiv,
    /// Add two floating-point numbers.
    FAdd,
    /// Subtract two floating-point numbers.
    FSub,
    /// Multiply two floating-point numbers.
    FMul,
    /// Divide two floating-point numbers.
    FDiv,
    /// Convert a signed integer to a floating-point number.
    Itof,
    /// Convert a floating-point number to an integer of the given type.
    Ftoi { int_ty: Ty<'ctx> },
    /// Compare two integers. The result is an integer.
    ICmp(Cmp),
    /// Compare two floating-point values. The result is an integer.
    FCmp(Cmp),
    /// A boolean not operation on integers.
    /// Returns 1 if the value is 0 and 0 otherwise.
    Not,
    /// Bitwise and.
    BitAnd,
    /// Bitwise or.
    BitOr,
    /// Convert an integer to another integer type.
    IConv { target: Ty<'ctx> },
    /// Call a global function by name.
    /// Pop arguments off the stack.
    CallDirect { func_name: String },
    /// Load the value of a local onto the stack
    LdLocal { idx: usize },
    /// Store the value on top of the stack into a local.
    ///
    /// The local must not be an argument, as argument locals are immutable
    StLocal { idx: usize },
    /// Load a pointer to a global function onto the stack
    LdGlobalFunc { func_name: String },
    /// Call a function pointer on top of the stack.
    /// Pop arguments off the stack.
    CallIndirect,
    /// Cast a value to another type without any value conversions.
    /// equivalent to `*((T*)&expr)` in C.
    Bitcast { target: Ty<'ctx> },
    /// Pop a value off the stack. If the value is non-zero, jump
    /// to the `then` block, otherwise jump to the `else` block (if there's one)
    IfElse { then: BlockId, r#else: Option<BlockId> },
    /// Pop a pointer off the stack and read a value of this type at the address of the pointer
    Read { ty: Ty<'ctx> },
    /// Pop a value and a pointer off the stack and write the value
    /// into memory at the address of the pointer
    Write { ty: Ty<'ctx> },
    /// An operation to offset a pointer by an index as if it pointed to an array.
    /// Pops an integer `n` off the stack  and a pointer `ptr` and pushes a pointer
    /// whose address is equal to `(int)ptr + n * sizeof(T)`
    Offset { ty: Ty<'ctx> },
    /// Pop a pointer off the stack which points to `struct_ty`
    /// and push back a pointer which points to the Nth field of the struct
    GetFieldPtr { struct_ty: Ty<'ctx>, field_idx: usize },
    /// Reserve memory for a value of this type in the current function's
    /// stack frame and push a pointer to it.
    ///
    /// The memory lives until the function returns.
    Alloca { ty: Ty<'ctx> },
    /// Pop a value off the stack and discard it
    Discard,
    /// Return immediately from the current function.
    ///
    /// The stack must contain _exactly_ the number of values the function returns.
    Return,
    /// Fail.
    ///
    /// All instructions in a block following this one are unreachable.
    Fail,
    /// Repeatedly execute a block of code.
    ///
    /// The block must have a void type ([] -> [])
    Loop(BlockId),
    /// Break from the innermost loop.
    Break,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge
}

/// The target of a call instruction
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum CallTarget<'a> {
    /// The callee is statically known by name
    Direct(&'a str),
    /// The callee is a function pointer computed at runtime
    Indirect
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instr<'ctx> {
    pub kind: InstrK<'ctx>
}

impl<'ctx> Instr<'ctx> {
    pub fn new(kind: InstrK<'ctx>) -> Self {
        Self { kind }
    }

    /// Returns the call target if this is a call instruction
    /// and None for every other instruction.
    pub fn as_call(&self) -> Option<CallTarget<'_>> {
        match &self.kind {
            InstrK::CallDirect { func_name } => Some(CallTarget::Direct(func_name)),
            InstrK::CallIndirect => Some(CallTarget::Indirect),
            _ => None
        }
    }

    /// The name of the global function this instruction refers to, if any
    pub(crate) fn referenced_function_mut(&mut self) -> Option<&mut String> {
        match &mut self.kind {
            InstrK::CallDirect { func_name } | InstrK::LdGlobalFunc { func_name } => Some(func_name),
            _ => None
        }
    }

    /// Rebuild the instruction with every type replaced by `f(type)`.
    pub fn map_types<'b>(&self, mut f: impl FnMut(Ty<'ctx>) -> Ty<'b>) -> Instr<'b> {
        let kind = match &self.kind {
            InstrK::LdInt(n, ty) => InstrK::LdInt(*n, f(*ty)),
            InstrK::LdFloat(x) => InstrK::LdFloat(*x),
            InstrK::LdBytes(bytes, ty) => InstrK::LdBytes(bytes.clone(), f(*ty)),
            InstrK::IAdd => InstrK::IAdd,
            InstrK::ISub => InstrK::ISub,
            InstrK::IMul => InstrK::IMul,
            InstrK::IDiv => InstrK::IDiv,
            InstrK::FAdd => InstrK::FAdd,
            InstrK::FSub => InstrK::FSub,
            InstrK::FMul => InstrK::FMul,
            InstrK::FDiv => InstrK::FDiv,
            InstrK::Itof => InstrK::Itof,
            InstrK::Ftoi { int_ty } => InstrK::Ftoi { int_ty: f(*int_ty) },
            InstrK::ICmp(cmp) => InstrK::ICmp(cmp.clone()),
            InstrK::FCmp(cmp) => InstrK::FCmp(cmp.clone()),
            InstrK::Not => InstrK::Not,
            InstrK::BitAnd => InstrK::BitAnd,
            InstrK::BitOr => InstrK::BitOr,
            InstrK::IConv { target } => InstrK::IConv { target: f(*target) },
            InstrK::CallDirect { func_name } => InstrK::CallDirect { func_name: func_name.clone() },
            InstrK::LdLocal { idx } => InstrK::LdLocal { idx: *idx },
            InstrK::StLocal { idx } => InstrK::StLocal { idx: *idx },
            InstrK::LdGlobalFunc { func_name } => InstrK::LdGlobalFunc { func_name: func_name.clone() },
            InstrK::CallIndirect => InstrK::CallIndirect,
            InstrK::Bitcast { target } => InstrK::Bitcast { target: f(*target) },
            InstrK::IfElse { then, r#else } => InstrK::IfElse { then: *then, r#else: *r#else },
            InstrK::Read { ty } => InstrK::Read { ty: f(*ty) },
            InstrK::Write { ty } => InstrK::Write { ty: f(*ty) },
            InstrK::Offset { ty } => InstrK::Offset { ty: f(*ty) },
            InstrK::GetFieldPtr { struct_ty, field_idx } => InstrK::GetFieldPtr { struct_ty: f(*struct_ty), field_idx: *field_idx },
            InstrK::Alloca { ty } => InstrK::Alloca { ty: f(*ty) },
            InstrK::Discard => InstrK::Discard,
            InstrK::Return => InstrK::Return,
            InstrK::Fail => InstrK::Fail,
            InstrK::Loop(block) => InstrK::Loop(*block),
            InstrK::Break => InstrK::Break,
        };
        Instr::new(kind)
    }
}

#[repr(transparent)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct BlockId(usize);

impl BlockId {
    #[inline]
    pub fn id(&self) -> usize {
        self.0
    }

    pub fn entry_block_id() -> Self { Self(0) }
}

impl From<usize> for BlockId {
    fn from(n: usize) -> Self { BlockId(n) }
}

impl From<BlockId> for usize {
    fn from(id: BlockId) -> Self { id.0 }
}

impl Default for BlockId {
    fn default() -> Self { BlockId(usize::MAX) }
}

/// Defines how the block is used
#[repr(C)]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum BlockTag {
    Undefined,
    /// The "main" block of the function
    Main,
    /// A block which is used as one of the branches of an IfElse instruction
    IfElse,
    /// A block which is used as the body of a Loop instruction
    Loop,
}

/// A block is a series of instructions
/// which are guaranteed to be executed in order they're defined.
///
/// At the end of a block's execution, the behavior depends on the tag:
/// * If tag = *main*, then the function returns
/// * If tag = *ifelse*, then the execution jumps to the instruction one after the corresponding `if_else` instruction
/// * If tag = *loop*, then the execution jumps to the start of the loop block
/// Otherwise, the behavior is not specified.
#[derive(Clone)]
pub struct InstrBlock<'ctx> {
    /// A unique index of the block inside a function.
    /// It's assigned by the builder and shouldn't be touched by the user
    pub(crate) idx: BlockId,
    pub(crate) tag: BlockTag,
    pub body: Vec<Instr<'ctx>>,
    /// The types left on the stack once the block is exited.
    /// Blocks never take any arguments.
    returns: Vec<Ty<'ctx>>
}

impl<'ctx> InstrBlock<'ctx> {
    pub fn new(idx: BlockId, returns: Vec<Ty<'ctx>>, tag: BlockTag) -> Self {
        InstrBlock { idx, tag, body: Vec::new(), returns }
    }

    /// A helper function to avoid doing `block.body.push(Instr::new(SMTH))`.
    /// Instead you can just do block.add(SMTH)
    pub fn add(&mut self, instr_k: InstrK<'ctx>) {
        self.body.push(Instr::new(instr_k))
    }

    pub fn returns(&self) -> &Vec<Ty<'ctx>> {
        &self.returns
    }

    #[inline]
    pub fn id(&self) -> BlockId { self.idx }

    #[inline]
    pub fn tag(&self) -> BlockTag { self.tag }
}

/// How duplicate definitions of a function are treated when modules are linked together
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Linkage {
    /// A single strong definition, defining it twice is an error
    External,
    /// Every definition is assumed to be equivalent and all but one are discarded
    LinkOnceOdr
}

/// A function defined in the module
#[derive(Clone)]
pub struct Function<'ctx> {
    name: String,
    ty: Ty<'ctx>,
    linkage: Linkage,
    /// Blocks in the order they were created, the entry block is always the first one (index zero)
    blocks: IndexMap<BlockId, InstrBlock<'ctx>>,
    /// Types of the locals, including the arguments
    all_locals_types: Vec<Ty<'ctx>>,
    /// The function index inside the module. Should not be modified by anyone else than the module
    pub(crate) idx: usize
}

impl<'ctx> Function<'ctx> {
    pub(crate) fn new(
        name: String,
        ty: Ty<'ctx>,
        blocks: IndexMap<BlockId, InstrBlock<'ctx>>,
        all_locals_types: Vec<Ty<'ctx>>) -> Self {

        assert!(ty.is_func(), "The type of a Function must be a function type");

        #[cfg(debug_assertions)]
        {
            if let Type::Func { args, ret: _ } = &*ty {
                debug_assert!(args.as_slice() == &all_locals_types[0..args.len()])
            }
        }

        Function {
            name, ty, linkage: Linkage::External, blocks, all_locals_types, idx: usize::MAX
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        self.linkage = linkage;
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn entry_block(&self) -> &InstrBlock<'ctx> {
        self.blocks.get(&BlockId::entry_block_id()).unwrap()
    }

    /// Iterate the blocks in their definition order
    pub fn blocks_iter(&self) -> indexmap::map::Values<'_, BlockId, InstrBlock<'ctx>> {
        self.blocks.values()
    }

    pub fn get_block(&self, id: BlockId) -> Option<&InstrBlock<'ctx>> {
        self.blocks.get(&id)
    }

    pub fn get_block_mut(&mut self, id: BlockId) -> Option<&mut InstrBlock<'ctx>> {
        self.blocks.get_mut(&id)
    }

    pub fn ret_tys(&self) -> &Vec<Ty<'ctx>> {
        match &*self.ty {
            Type::Func { args: _, ret } => ret,
            _ => unreachable!()
        }
    }

    pub fn arg_tys(&self) -> &Vec<Ty<'ctx>> {
        match &*self.ty {
            Type::Func { args, ret: _ } => args,
            _ => unreachable!()
        }
    }

    pub fn ty(&self) -> Ty<'ctx> {
        self.ty
    }

    pub fn all_locals_ty(&self) -> &Vec<Ty<'ctx>> {
        &self.all_locals_types
    }

    pub fn local_ty(&self, idx: usize) -> Option<Ty<'ctx>> {
        self.all_locals_types.get(idx).copied()
    }

    pub fn all_local_count(&self) -> usize {
        self.all_locals_types.len()
    }

    /// Append a new (non-argument) local and return its index
    pub fn new_local(&mut self, ty: Ty<'ctx>) -> usize {
        self.all_locals_types.push(ty);
        self.all_locals_types.len() - 1
    }

    pub fn arg_count(&self) -> usize {
        self.arg_tys().len()
    }

    /// Returns true if the Nth local is actually an argument to the function
    pub fn is_local_an_arg(&self, n: usize) -> bool {
        n < self.arg_count()
    }

    /// Every instruction of the function in block order
    pub fn instrs_iter(&self) -> impl Iterator<Item = &Instr<'ctx>> {
        self.blocks.values().flat_map(|b| b.body.iter())
    }

    pub(crate) fn instrs_iter_mut(&mut self) -> impl Iterator<Item = &mut Instr<'ctx>> {
        self.blocks.values_mut().flat_map(|b| b.body.iter_mut())
    }
}
