//! Branch distance instrumentation.
//!
//! A block ending in `icmp` + conditional branch reports `lhs ^ rhs`, which is zero
//! exactly when the operands are equal. A block ending in a `switch` reports the same
//! measure for every case, under a label shared by all cases with the same value, plus
//! the number of matched cases under the default label 0.

use distafl_bolts::Error;
use hashbrown::HashMap;

use crate::{
    ir::{
        BlockId, ConstantInt, Function, InsertPoint, InstId, InstKind, IntPredicate, IrBuilder,
        Terminator, Type, Value,
    },
    report::DistanceKind,
    RuntimeSymbols,
};

/// Operands wider than this are not instrumented.
///
/// Distances are cast to `i32`, so operands of 33 to 64 bits that differ only in their
/// upper half report a distance of 0.
pub const MAX_DISTANCE_OPERAND_BITS: u32 = 64;

/// Blocks with fewer operations, terminator included, are not instrumented
pub const MIN_DISTANCE_BLOCK_SIZE: usize = 3;

/// The label of the default arm of a dispatch
pub const DEFAULT_LABEL: u32 = 0;

/// Labels for the cases of one `switch`: equal case values share a label,
/// new values get the next one, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchLabelTable {
    labels: Vec<u32>,
    distinct: u32,
}

impl DispatchLabelTable {
    /// Builds the table in one pass over `cases`, in order.
    #[must_use]
    pub fn build(cases: &[ConstantInt]) -> Self {
        let mut seen: HashMap<u128, u32> = HashMap::with_capacity(cases.len());
        let mut distinct = 0;
        let labels = cases
            .iter()
            .map(|case| {
                *seen.entry(case.value()).or_insert_with(|| {
                    distinct += 1;
                    distinct
                })
            })
            .collect();
        Self { labels, distinct }
    }

    /// The label of every case, in case order
    #[must_use]
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// The label of the `idx`-th case
    #[must_use]
    pub fn label(&self, idx: usize) -> Option<u32> {
        self.labels.get(idx).copied()
    }

    /// The number of distinct non-default labels
    #[must_use]
    pub fn distinct_labels(&self) -> u32 {
        self.distinct
    }
}

/// A branch worth reporting distances for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistanceSite {
    /// An `icmp` right before a conditional branch
    Compare {
        /// The comparison
        icmp: InstId,
        /// Its left operand
        lhs: Value,
        /// Its right operand
        rhs: Value,
    },
    /// A `switch`
    Dispatch {
        /// The dispatched value
        cond: Value,
        /// The case values, in order
        cases: Vec<ConstantInt>,
    },
}

/// Finds and instruments [`DistanceSite`]s.
#[derive(Debug, Copy, Clone, Default)]
pub struct BranchDistanceAnalyzer;

impl BranchDistanceAnalyzer {
    /// Creates a new analyzer
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Looks at how `block` ends. Must run before anything is inserted into the block.
    ///
    /// For a conditional branch only the instruction right before the terminator is
    /// considered, whether or not it feeds the branch.
    #[must_use]
    pub fn analyze(&self, func: &Function, block: BlockId) -> Option<DistanceSite> {
        let bb = func.block(block);
        if bb.size() < MIN_DISTANCE_BLOCK_SIZE {
            return None;
        }

        match &bb.terminator {
            Terminator::Switch { cond, cases, .. } => {
                let ty = func.value_type(*cond);
                (ty.is_integer() && ty.scalar_size_in_bits() <= MAX_DISTANCE_OPERAND_BITS).then(
                    || DistanceSite::Dispatch {
                        cond: *cond,
                        cases: cases.iter().map(|(case, _)| *case).collect(),
                    },
                )
            }
            Terminator::CondBr { .. } => {
                let icmp = *bb.insts.last()?;
                let InstKind::ICmp { lhs, rhs, .. } = func.inst(icmp).kind else {
                    return None;
                };
                let ty = func.value_type(lhs);
                (ty.is_integer() && ty.scalar_size_in_bits() <= MAX_DISTANCE_OPERAND_BITS)
                    .then_some(DistanceSite::Compare { icmp, lhs, rhs })
            }
            _ => None,
        }
    }

    /// Emits the distance reports of `site` for the block identified by `id`.
    pub fn instrument(
        &self,
        func: &mut Function,
        block: BlockId,
        site: &DistanceSite,
        symbols: &RuntimeSymbols,
        id: u32,
    ) -> Result<DistanceKind, Error> {
        let id = Value::from(ConstantInt::i32(id));
        match site {
            DistanceSite::Compare { icmp, lhs, rhs } => {
                let mut builder = IrBuilder::new(func, block, InsertPoint::Before(*icmp))?;
                let distance = builder.create_xor(*lhs, *rhs);
                let distance = builder.create_int_cast(distance, Type::I32);
                builder.create_call(
                    symbols.insert_distance,
                    Type::Void,
                    vec![id, ConstantInt::i32(DEFAULT_LABEL).into(), distance],
                );
                Ok(DistanceKind::Compare)
            }
            DistanceSite::Dispatch { cond, cases } => {
                let table = DispatchLabelTable::build(cases);
                let mut builder = IrBuilder::at_end(func, block)?;
                let zero = Value::from(ConstantInt::i32(0));

                let mut unmatched = zero;
                for (case, label) in cases.iter().zip(table.labels()) {
                    let distance = builder.create_xor(*cond, (*case).into());
                    let distance = builder.create_int_cast(distance, Type::I32);
                    builder.create_call(
                        symbols.insert_distance,
                        Type::Void,
                        vec![id, ConstantInt::i32(*label).into(), distance],
                    );
                    let missed = builder.create_icmp(IntPredicate::Ne, distance, zero);
                    let missed = builder.create_zext(missed, Type::I32);
                    unmatched = builder.create_add(unmatched, missed);
                }

                let num_cases = u32::try_from(cases.len())?;
                let default = builder.create_sub(ConstantInt::i32(num_cases).into(), unmatched);
                builder.create_call(
                    symbols.insert_distance,
                    Type::Void,
                    vec![id, ConstantInt::i32(DEFAULT_LABEL).into(), default],
                );

                Ok(DistanceKind::Dispatch {
                    cases: num_cases,
                    labels: table.distinct_labels(),
                })
            }
        }
    }
}
