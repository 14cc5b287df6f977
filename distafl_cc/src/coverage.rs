//! AFL-style edge coverage.
//!
//! Each instrumented block gets a random location. At runtime the block bumps the map
//! byte at `prev_loc ^ cur_loc` and leaves `cur_loc >> 1` as the previous location, so
//! that `A -> B` and `B -> A` as well as tight self loops land on different bytes.

use distafl_bolts::rands::Rand;

use crate::{
    ir::{ConstantInt, IrBuilder, Type, Value},
    RuntimeSymbols, MAP_SIZE,
};

/// The map index for the edge from `prev_loc` to `cur_loc`.
#[must_use]
#[inline]
pub fn edge_key(prev_loc: u32, cur_loc: u32) -> u32 {
    prev_loc ^ cur_loc
}

/// What a block at `cur_loc` leaves behind as the previous location.
#[must_use]
#[inline]
pub fn next_prev_loc(cur_loc: u32) -> u32 {
    cur_loc >> 1
}

/// Emits the coverage map update of an instrumented block.
#[derive(Debug, Copy, Clone, Default)]
pub struct EdgeCoverageRecorder;

impl EdgeCoverageRecorder {
    /// Creates a new recorder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Draws the location value of the next instrumented block, in `0..MAP_SIZE`.
    pub fn next_location<R: Rand>(&self, rand: &mut R) -> u32 {
        rand.below(MAP_SIZE as u64) as u32
    }

    /// Emits, at the builder's position:
    ///
    /// ```text
    /// prev = load i32 __afl_prev_loc
    /// map  = load ptr __afl_area_ptr
    /// slot = gep map, (prev ^ cur_loc)
    /// store (load slot) + 1, slot
    /// store cur_loc >> 1, __afl_prev_loc
    /// ```
    ///
    /// Every load and store is tagged `nosanitize`.
    pub fn emit(&self, builder: &mut IrBuilder<'_>, symbols: &RuntimeSymbols, cur_loc: u32) {
        let prev_loc_ptr = Value::Global(symbols.prev_loc);
        let area_ptr = Value::Global(symbols.area_ptr);

        let prev_loc = builder.create_load(Type::I32, prev_loc_ptr);
        let prev_loc = builder.create_zext(prev_loc, Type::I32);

        let map = builder.create_load(Type::Ptr, area_ptr);
        let key = builder.create_xor(prev_loc, ConstantInt::i32(cur_loc).into());
        let slot = builder.create_gep(map, key);

        let counter = builder.create_load(Type::I8, slot);
        let incr = builder.create_add(counter, ConstantInt::new(8, 1).into());
        builder.create_store(incr, slot);

        builder.create_store(ConstantInt::i32(next_prev_loc(cur_loc)).into(), prev_loc_ptr);
    }
}

#[cfg(test)]
mod tests {
    use distafl_bolts::rands::{StdRand, XkcdRand};

    use super::{edge_key, next_prev_loc, EdgeCoverageRecorder};
    use crate::{
        ir::{BinOp, ConstantInt, Function, InstKind, IrBuilder, Module, Terminator, Type, Value},
        RuntimeSymbols, MAP_SIZE,
    };

    #[test]
    fn test_keys_stay_in_map() {
        let recorder = EdgeCoverageRecorder::new();
        let mut rand = StdRand::with_seed(3);
        let mut prev = 0;
        for _ in 0..1000 {
            let cur = recorder.next_location(&mut rand);
            assert!((cur as usize) < MAP_SIZE);
            assert!((edge_key(prev, cur) as usize) < MAP_SIZE);
            prev = next_prev_loc(cur);
        }
        let top = recorder.next_location(&mut XkcdRand::with_value(u64::MAX));
        assert_eq!(top as usize, MAP_SIZE - 1);
    }

    #[test]
    fn test_direction_matters() {
        let (a, b) = (0x1234, 0x0f0f);
        assert_ne!(
            edge_key(next_prev_loc(a), b),
            edge_key(next_prev_loc(b), a)
        );
        assert_ne!(edge_key(next_prev_loc(a), a), 0);
    }

    #[test]
    fn test_emitted_sequence() {
        let mut module = Module::new("m.c");
        let (symbols, _) = RuntimeSymbols::declare(&mut module);
        let mut f = Function::new("f", vec![], Type::Void);
        let entry = f.add_block("entry");
        f.set_terminator(entry, Terminator::Ret { value: None });

        let mut builder = IrBuilder::at_end(&mut f, entry).unwrap().nosanitize();
        EdgeCoverageRecorder::new().emit(&mut builder, &symbols, 0x42);

        let insts: Vec<_> = f.block_insts(entry).map(|(_, i)| i.clone()).collect();
        assert_eq!(insts.len(), 8);
        assert!(insts.iter().all(|i| i.nosanitize));
        assert!(matches!(
            insts[0].kind,
            InstKind::Load { ty: Type::I32, ptr: Value::Global(g) } if g == symbols.prev_loc
        ));
        assert!(matches!(
            insts[2].kind,
            InstKind::Binary { op: BinOp::Xor, rhs: Value::Const(c), .. } if c.value() == 0x42
        ));
        assert_eq!(
            insts[7].kind,
            InstKind::Store {
                value: ConstantInt::i32(0x21).into(),
                ptr: Value::Global(symbols.prev_loc),
            }
        );

        module.add_function(f);
        module.verify().unwrap();
    }
}
