use std::{collections::HashMap, ops::Range};

use bit_set::BitSet;

use crate::{instr::{BlockId, Function, Instr}, module::Module, pass::MutableFunctionPass};

/// An instruction rewrite pass.
///
/// As a parameter it takes in data about which instructions to replace
/// and how and does the heavylifting of modyfying instruction offsets etc.
pub struct InstrRewritePass<'ctx> {
    /// The instruction modifications, keyed by the function index.
    /// For every block, there's a list of what instruction ranges
    /// to replace and with what.
    ///
    /// The instruction ranges may NOT overlap.
    modifications: HashMap<usize, HashMap<BlockId, Vec<BlobRewriteData<'ctx>>>>
}

/// The Range is a range of indexes of instructions which will be replaced
/// by the instructions in the second field
pub type BlobRewriteData<'ctx> = (Range<usize>, Vec<Instr<'ctx>>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("overlapping rewrite ranges in block {block:?} of function #{function}")]
    OverlappingRanges { function: usize, block: BlockId },
    #[error("function #{function} has no block {block:?}")]
    UnknownBlock { function: usize, block: BlockId },
    #[error("rewrite range {range:?} is out of bounds of block {block:?} in function #{function}")]
    OutOfBounds { function: usize, block: BlockId, range: Range<usize> },
}

impl<'ctx> InstrRewritePass<'ctx> {
    /// Create a new Instruction Rewrite Pass.
    ///
    /// Fails if the instruction ranges of a block overlap.
    /// Two empty ranges (insertions) at the same index are overlapping too.
    pub fn new(modifications: HashMap<usize, HashMap<BlockId, Vec<BlobRewriteData<'ctx>>>>) -> Result<Self, RewriteError> {
        for (&function, blocks) in &modifications {
            for (&block, changes) in blocks {
                // Mark every index a range covers, an insertion marks its position
                let mut bit_set = BitSet::new();
                for (range, _) in changes {
                    let covered = if range.is_empty() { range.start..range.start + 1 } else { range.clone() };
                    for idx in covered {
                        if !bit_set.insert(idx) {
                            return Err(RewriteError::OverlappingRanges { function, block });
                        }
                    }
                }
            }
        }
        // We sort the ranges in opposite order, e.g. 7..10, 3..6, 1..2
        let mut modifications = modifications;
        for changes in modifications.values_mut().flat_map(|blocks| blocks.values_mut()) {
            changes.sort_by(|(r1, _), (r2, _)| Ord::cmp(&r1.start, &r2.start).reverse())
        }

        Ok(InstrRewritePass { modifications })
    }
}

impl<'ctx> MutableFunctionPass<'ctx> for InstrRewritePass<'ctx> {
    type Error = RewriteError;

    type MutationInfo = ();

    fn visit_function(
        &mut self,
        _module: &Module<'ctx>,
        function: &Function<'ctx>) -> Result<Self::MutationInfo, Self::Error> {

        /* Here, we only validate that the blocks exist and the ranges fit */
        if let Some(blocks) = self.modifications.get(&function.idx()) {
            for (&block_id, changes) in blocks {
                let block = function.get_block(block_id)
                    .ok_or(RewriteError::UnknownBlock { function: function.idx(), block: block_id })?;
                for (range, _) in changes {
                    if range.start > range.end || range.end > block.body.len() {
                        return Err(RewriteError::OutOfBounds { function: function.idx(), block: block_id, range: range.clone() });
                    }
                }
            }
        }
        Ok(())
    }

    fn mutate_function(
        &mut self,
        function: &mut Function<'ctx>,
        _info: Self::MutationInfo) -> Result<(), Self::Error> {

        let function_idx = function.idx();
        let blocks = match self.modifications.remove(&function_idx) {
            Some(blocks) => blocks,
            None => return Ok(())
        };

        for (block_id, modifications) in blocks {
            let block = function.get_block_mut(block_id)
                .ok_or(RewriteError::UnknownBlock { function: function_idx, block: block_id })?;
            // The modifications are sorted from the last range to the first one,
            // so splicing one never shifts the indexes of the ones still to be applied
            for (range, new_instrs) in modifications {
                block.body.splice(range, new_instrs);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::{builder::{FunctionBuilder, InstrBuilder}, instr::{BlockId, Instr, InstrK}, module::Module};

    use super::{InstrRewritePass, RewriteError};

    #[test]
    fn instr_rewrite_pass_test() {
        let mut top = Module::new("m");

        let mut builder = FunctionBuilder::new(
            "func".to_string(),
            [top.int32t()],
            [top.int32t()]
        );
        let arg0 = builder.get_arg(0);
        builder.i_ld_local(arg0);
        builder.i_ld_int(1, top.int32t());
        builder.i_iadd();

        builder.finish(&mut top).unwrap();

        // Now the function is: LdLocal 0, LdInt 1, IAdd

        let func_idx = top.get_function("func").unwrap().idx();
        let mut blocks = HashMap::new();
        blocks.insert(BlockId::entry_block_id(), vec![
            // replace the first two instructions with LdInt 3, LdLocal 0
            (0..2, vec![
                Instr::new(InstrK::LdInt(3, top.int32t())),
                Instr::new(InstrK::LdLocal { idx: 0 })
            ]),
            // insert LdInt 4, ISub after the IAdd instruction
            (3..3, vec![
                Instr::new(InstrK::LdInt(4, top.int32t())),
                Instr::new(InstrK::ISub)
            ])
        ]);
        let mut rewrite_pass = InstrRewritePass::new(HashMap::from([(func_idx, blocks)])).unwrap();

        top.do_mut_pass(&mut rewrite_pass).unwrap();

        let instr_kinds: Vec<InstrK<'_>> = top.get_function("func").unwrap().unwrap_local().entry_block().body.iter().map(|i| i.kind.clone()).collect();
        assert_eq!(instr_kinds, vec![
            InstrK::LdInt(3, top.int32t()),
            InstrK::LdLocal { idx: 0 },
            InstrK::IAdd,
            InstrK::LdInt(4, top.int32t()),
            InstrK::ISub,
        ]);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let blocks = HashMap::from([(BlockId::entry_block_id(), vec![
            (0..2, vec![]),
            (1..3, vec![]),
        ])]);
        assert_eq!(
            InstrRewritePass::new(HashMap::from([(0, blocks)])).err(),
            Some(RewriteError::OverlappingRanges { function: 0, block: BlockId::entry_block_id() })
        );
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let mut top = Module::new("m");
        let mut builder = FunctionBuilder::new("func".to_string(), [], []);
        builder.i_return();
        builder.finish(&mut top).unwrap();

        let blocks = HashMap::from([(BlockId::entry_block_id(), vec![(4..5, vec![])])]);
        let mut rewrite_pass = InstrRewritePass::new(HashMap::from([(0, blocks)])).unwrap();
        assert!(matches!(top.do_mut_pass(&mut rewrite_pass), Err(RewriteError::OutOfBounds { .. })));
    }
}
