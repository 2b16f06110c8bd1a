use bit_set::BitSet;

use crate::{instr::{BlockId, Function, InstrK}, module::Module, pass::FunctionPass, ty::{Ty, Type}};

/// Type-checks functions by simulating the types on the value stack.
pub struct Verifier {}

impl<'ctx> FunctionPass<'ctx> for Verifier {
    type Error = VerifyError<'ctx>;

    fn visit_module(&mut self, module: &Module<'ctx>) -> Result<(), Self::Error> {
        for (name, _) in module.aliases_iter() {
            if module.strip_pointer_casts(name).is_none() {
                return Err(VerifyError::DanglingAlias { name: name.to_owned() });
            }
        }
        Ok(())
    }

    fn visit_function(
        &mut self,
        module: &Module<'ctx>,
        function: &Function<'ctx>) -> Result<(), Self::Error> {

        let mut checker = BlockChecker { module, function, in_progress: BitSet::new() };
        checker.check_block(BlockId::entry_block_id(), false)
            .map_err(|error| VerifyError::InFunction { function: function.name().to_owned(), error: Box::new(error) })
    }
}

/// Verify the whole module
pub fn verify_module<'ctx>(module: &Module<'ctx>) -> Result<(), VerifyError<'ctx>> {
    module.do_pass(&mut Verifier {})
}

struct BlockChecker<'m, 'ctx> {
    module: &'m Module<'ctx>,
    function: &'m Function<'ctx>,
    /// Blocks which are being checked right now, a block can't (transitively) contain itself
    in_progress: BitSet
}

impl<'m, 'ctx> BlockChecker<'m, 'ctx> {
    fn pop(stack: &mut Vec<Ty<'ctx>>) -> Result<Ty<'ctx>, VerifyError<'ctx>> {
        stack.pop().ok_or(VerifyError::StackUnderflow)
    }

    fn pop_expect(stack: &mut Vec<Ty<'ctx>>, expected: Ty<'ctx>, reason: &'static str) -> Result<(), VerifyError<'ctx>> {
        let actual = Self::pop(stack)?;
        if actual != expected {
            return Err(VerifyError::InvalidType { expected, actual, reason });
        }
        Ok(())
    }

    /// Pop two operands of the same type which satisfies `accept`
    fn pop_binary(&self, stack: &mut Vec<Ty<'ctx>>, accept: fn(&Type<'ctx>) -> bool, reason: &'static str) -> Result<Ty<'ctx>, VerifyError<'ctx>> {
        let rhs = Self::pop(stack)?;
        let lhs = Self::pop(stack)?;
        if !accept(&lhs) {
            return Err(VerifyError::UnexpectedType { actual: lhs, reason });
        }
        if lhs != rhs {
            return Err(VerifyError::InvalidType { expected: lhs, actual: rhs, reason });
        }
        Ok(lhs)
    }

    fn pop_call_args(stack: &mut Vec<Ty<'ctx>>, func_ty: Ty<'ctx>, reason: &'static str) -> Result<Vec<Ty<'ctx>>, VerifyError<'ctx>> {
        match &*func_ty {
            Type::Func { args, ret } => {
                // the last argument is on top of the stack
                for &arg in args.iter().rev() {
                    Self::pop_expect(stack, arg, reason)?;
                }
                Ok(ret.clone())
            }
            _ => Err(VerifyError::InvalidTypeCallIndirect)
        }
    }

    /// Check a block and return the types it leaves on the stack.
    fn check_block(&mut self, id: BlockId, in_loop: bool) -> Result<(), VerifyError<'ctx>> {
        let block = self.function.get_block(id).ok_or(VerifyError::UnknownBlock(id))?;
        if !self.in_progress.insert(id.id()) {
            return Err(VerifyError::RecursiveBlock(id));
        }

        let module = self.module;
        let mut stack: Vec<Ty<'ctx>> = Vec::new();

        for instr in &block.body {
            match &instr.kind {
                InstrK::LdInt(_, ty) => {
                    if !ty.is_int() {
                        return Err(VerifyError::UnexpectedType { actual: *ty, reason: "Integer constant" });
                    }
                    stack.push(*ty)
                }
                InstrK::LdFloat(_) => stack.push(module.float32t()),
                InstrK::LdBytes(bytes, ty) => {
                    match &**ty {
                        Type::Array { elem, len } if *elem == module.int8t() && *len == bytes.len() => stack.push(*ty),
                        _ => return Err(VerifyError::UnexpectedType { actual: *ty, reason: "Byte string constant" })
                    }
                }
                InstrK::IAdd | InstrK::ISub | InstrK::IMul | InstrK::IDiv | InstrK::BitAnd | InstrK::BitOr => {
                    let ty = self.pop_binary(&mut stack, Type::is_int, "Integer arithmetic operation")?;
                    stack.push(ty);
                }
                InstrK::ICmp(_) => {
                    self.pop_binary(&mut stack, Type::is_int, "Integer comparison")?;
                    stack.push(module.int32t());
                }
                InstrK::FAdd | InstrK::FSub | InstrK::FMul | InstrK::FDiv => {
                    let ty = self.pop_binary(&mut stack, Type::is_float, "Floating-point arithmetic operation")?;
                    stack.push(ty);
                }
                /* FCmp is different, because its result is an integer, not a floating point */
                InstrK::FCmp(_) => {
                    self.pop_binary(&mut stack, Type::is_float, "Floating-point comparison")?;
                    stack.push(module.int32t());
                }
                InstrK::Not => {
                    let val = Self::pop(&mut stack)?;
                    if !val.is_int() {
                        return Err(VerifyError::UnexpectedType { actual: val, reason: "Not instruction" });
                    }
                    stack.push(module.int32t());
                }
                InstrK::Itof => {
                    let val = Self::pop(&mut stack)?;
                    if !val.is_int() {
                        return Err(VerifyError::UnexpectedType { actual: val, reason: "Itof instruction" });
                    }
                    stack.push(module.float32t())
                }
                InstrK::Ftoi { int_ty } => {
                    Self::pop_expect(&mut stack, module.float32t(), "Ftoi instruction")?;
                    stack.push(*int_ty);
                }
                InstrK::IConv { target } => {
                    let val = Self::pop(&mut stack)?;
                    if !val.is_int() || !target.is_int() {
                        return Err(VerifyError::UnexpectedType { actual: val, reason: "Integer conversion" });
                    }
                    stack.push(*target);
                }
                InstrK::CallDirect { func_name } => {
                    let func_ty = module.symbol_ty(func_name)
                        .ok_or_else(|| VerifyError::UndefinedFunctionCall { func_name: func_name.to_owned() })?;
                    let rets = Self::pop_call_args(&mut stack, func_ty, "Function call argument")?;
                    stack.extend(rets);
                }
                InstrK::LdLocal { idx } => {
                    let loc_ty = self.function.local_ty(*idx).ok_or(VerifyError::OutOfBoundsLocalIndex)?;
                    stack.push(loc_ty);
                },
                InstrK::StLocal { idx } => {
                    let loc_ty = self.function.local_ty(*idx).ok_or(VerifyError::OutOfBoundsLocalIndex)?;
                    if self.function.is_local_an_arg(*idx) {
                        return Err(VerifyError::ArgumentStore);
                    }
                    Self::pop_expect(&mut stack, loc_ty, "Local store")?;
                },
                InstrK::LdGlobalFunc { func_name } => {
                    let func_ty = module.symbol_ty(func_name)
                        .ok_or_else(|| VerifyError::UndefinedFunctionCall { func_name: func_name.to_owned() })?;
                    stack.push(func_ty);
                },
                InstrK::CallIndirect => {
                    let func = Self::pop(&mut stack)?;
                    let rets = Self::pop_call_args(&mut stack, func, "Indirect function call argument")?;
                    stack.extend(rets);
                },
                InstrK::Bitcast { target } => {
                    Self::pop(&mut stack)?;
                    stack.push(*target);
                }
                InstrK::IfElse { then, r#else } => {
                    Self::pop_expect(&mut stack, module.int32t(), "If condition")?;
                    let then_block = self.function.get_block(*then).ok_or(VerifyError::UnknownBlock(*then))?;
                    self.check_block(*then, in_loop)?;
                    match r#else {
                        Some(else_id) => {
                            let else_block = self.function.get_block(*else_id).ok_or(VerifyError::UnknownBlock(*else_id))?;
                            self.check_block(*else_id, in_loop)?;
                            if then_block.returns() != else_block.returns() {
                                return Err(VerifyError::MismatchedBranches);
                            }
                        }
                        None if !then_block.returns().is_empty() => return Err(VerifyError::MismatchedBranches),
                        None => {}
                    }
                    stack.extend(then_block.returns().iter().copied());
                }
                InstrK::Loop(body) => {
                    let body_block = self.function.get_block(*body).ok_or(VerifyError::UnknownBlock(*body))?;
                    if !body_block.returns().is_empty() {
                        return Err(VerifyError::NonVoidLoop(*body));
                    }
                    self.check_block(*body, true)?;
                }
                InstrK::Read { ty } => {
                    Self::pop_expect(&mut stack, module.ptr_t(), "Memory read address")?;
                    stack.push(*ty);
                }
                InstrK::Write { ty } => {
                    Self::pop_expect(&mut stack, *ty, "Memory write value")?;
                    Self::pop_expect(&mut stack, module.ptr_t(), "Memory write address")?;
                }
                InstrK::Offset { ty: _ } => {
                    let idx = Self::pop(&mut stack)?;
                    if !idx.is_int() {
                        return Err(VerifyError::UnexpectedType { actual: idx, reason: "Pointer offset" });
                    }
                    Self::pop_expect(&mut stack, module.ptr_t(), "Pointer offset")?;
                    stack.push(module.ptr_t());
                }
                InstrK::GetFieldPtr { struct_ty, field_idx } => {
                    match &**struct_ty {
                        Type::Struct { fields } if *field_idx < fields.len() => {}
                        _ => return Err(VerifyError::UnexpectedType { actual: *struct_ty, reason: "Struct field access" })
                    }
                    Self::pop_expect(&mut stack, module.ptr_t(), "Struct field access")?;
                    stack.push(module.ptr_t());
                }
                InstrK::Alloca { ty: _ } => stack.push(module.ptr_t()),
                InstrK::Discard => {
                    Self::pop(&mut stack)?;
                }
                InstrK::Return => {
                    if self.function.ret_tys() != &stack {
                        return Err(VerifyError::ReturnMismatch);
                    }
                    // the rest of the block is unreachable
                    self.in_progress.remove(id.id());
                    return Ok(());
                }
                InstrK::Break => {
                    if !in_loop {
                        return Err(VerifyError::BreakOutsideLoop);
                    }
                    self.in_progress.remove(id.id());
                    return Ok(());
                }
                InstrK::Fail => {
                    self.in_progress.remove(id.id());
                    return Ok(());
                }
            }
        }

        if &stack != block.returns() {
            return Err(VerifyError::BlockResultMismatch(id));
        }

        self.in_progress.remove(id.id());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError<'ctx> {
    #[error("in function `{function}`: {error}")]
    InFunction { function: String, error: Box<VerifyError<'ctx>> },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("{reason}: expected {expected:?}, got {actual:?}")]
    InvalidType { expected: Ty<'ctx>, actual: Ty<'ctx>, reason: &'static str },
    #[error("{reason}: unexpected operand of type {actual:?}")]
    UnexpectedType { actual: Ty<'ctx>, reason: &'static str },
    #[error("values left on the stack don't match the return type")]
    ReturnMismatch,
    #[error("values left on the stack don't match the type of block {0:?}")]
    BlockResultMismatch(BlockId),
    #[error("branches of an if instruction produce different values")]
    MismatchedBranches,
    #[error("loop body {0:?} must not produce values")]
    NonVoidLoop(BlockId),
    #[error("break outside of a loop")]
    BreakOutsideLoop,
    #[error("unknown block {0:?}")]
    UnknownBlock(BlockId),
    #[error("block {0:?} contains itself")]
    RecursiveBlock(BlockId),
    #[error("call to undefined function `{func_name}`")]
    UndefinedFunctionCall { func_name: String },
    #[error("local index out of bounds")]
    OutOfBoundsLocalIndex,
    #[error("arguments can't be assigned to")]
    ArgumentStore,
    #[error("indirect call of a value which isn't a function")]
    InvalidTypeCallIndirect,
    #[error("alias `{name}` does not resolve to a function")]
    DanglingAlias { name: String },
}

#[cfg(test)]
mod tests {
    use crate::{builder::{FunctionBuilder, InstrBuilder}, instr::BlockTag, module::Module};

    use super::{verify_module, VerifyError};

    #[test]
    fn well_typed_function_verifies() {
        let mut m = Module::new("m");
        let int32 = m.int32t();

        let mut builder = FunctionBuilder::new("add_one".to_string(), [int32], [int32]);
        let arg0 = builder.get_arg(0);
        builder.i_ld_local(arg0);
        builder.i_ld_int(1, int32);
        builder.i_iadd();
        builder.i_return();
        builder.finish(&mut m).unwrap();

        let mut builder = FunctionBuilder::new("main".to_string(), [], [int32]);
        let then = builder.new_block([int32], BlockTag::IfElse);
        let r#else = builder.new_block([int32], BlockTag::IfElse);
        builder.i_ld_int(1, int32);
        builder.i_if_else(then, Some(r#else));
        builder.i_return();
        builder.switch_block(then);
        builder.i_ld_int(20, int32);
        builder.i_call("add_one".to_string());
        builder.switch_block(r#else);
        builder.i_ld_int(0, int32);
        builder.finish(&mut m).unwrap();

        verify_module(&m).unwrap();
    }

    #[test]
    fn call_to_unknown_function_fails() {
        let mut m = Module::new("m");
        let mut builder = FunctionBuilder::new("main".to_string(), [], []);
        builder.i_call("nowhere".to_string());
        builder.i_return();
        builder.finish(&mut m).unwrap();

        match verify_module(&m) {
            Err(VerifyError::InFunction { function, error }) => {
                assert_eq!(function, "main");
                assert!(matches!(*error, VerifyError::UndefinedFunctionCall { .. }));
            }
            _ => panic!("Expected a verification error"),
        }
    }

    #[test]
    fn stack_underflow_is_detected() {
        let mut m = Module::new("m");
        let mut builder = FunctionBuilder::new("main".to_string(), [], []);
        builder.i_discard();
        builder.i_return();
        builder.finish(&mut m).unwrap();

        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::InFunction { error, .. }) if matches!(*error, VerifyError::StackUnderflow)
        ));
    }
}
