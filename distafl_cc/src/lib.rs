//! Compile-time instrumentation for distance-guided fuzzing.
//!
//! `distafl_cc` rewrites every function of a [`ir::Module`] so that, at runtime, each
//! executed basic block:
//!
//! * updates an AFL-style edge coverage map (`map[prev_loc ^ cur_loc]++`),
//! * reports its build-wide identity to `insert_block`,
//! * and, when it ends in an integer comparison or a `switch`, reports how far the
//!   operands are from each outcome to `insert_distance`.
//!
//! The entry point is [`pass::DistanceCoveragePass`], usually run through a
//! [`pipeline::PassPipeline`].
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
    //unused_results
))]

use core::fmt::Debug;

pub use distafl_bolts::Error;

pub mod config;
pub mod coverage;
pub mod distance;
pub mod ids;
pub mod ir;
pub mod pass;
pub mod pipeline;
pub mod report;
pub mod sampling;

use ir::{FuncId, GlobalId, Module, Type};

/// log2 of [`MAP_SIZE`]
pub const MAP_SIZE_POW2: u32 = 16;

/// The size of the edge coverage map. Always a power of two, so that
/// `prev_loc ^ cur_loc` of two locations below it stays below it.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

const _: () = assert!(MAP_SIZE.is_power_of_two() && MAP_SIZE <= 1 << 31);

/// The process-wide pointer to the coverage map, owned by the runtime
pub const AREA_PTR_SYMBOL: &str = "__afl_area_ptr";

/// The thread-local previous location, owned by the runtime
pub const PREV_LOC_SYMBOL: &str = "__afl_prev_loc";

/// `void insert_block(u32 id)`
pub const INSERT_BLOCK_SYMBOL: &str = "insert_block";

/// `void insert_distance(u32 id, u32 label, u32 distance)`
pub const INSERT_DISTANCE_SYMBOL: &str = "insert_distance";

/// The version of this crate, shown in the banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A transformation over one module at a time.
///
/// The host decides how and when passes run; a pass only sees the module it is handed.
pub trait ModulePass: Debug {
    /// A name for diagnostics
    fn name(&self) -> &'static str;

    /// Transform `module`, returning whether anything changed
    fn run_on_module(&mut self, module: &mut Module) -> Result<bool, Error>;
}

/// The runtime symbols the instrumentation refers to, declared in the module being
/// instrumented.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeSymbols {
    /// `__afl_area_ptr`
    pub area_ptr: GlobalId,
    /// `__afl_prev_loc`
    pub prev_loc: GlobalId,
    /// `insert_block`
    pub insert_block: FuncId,
    /// `insert_distance`
    pub insert_distance: FuncId,
}

impl RuntimeSymbols {
    /// Declares (or finds) all runtime symbols in `module`.
    /// The flag tells whether any declaration had to be added.
    pub fn declare(module: &mut Module) -> (Self, bool) {
        let (area_ptr, new_area) = module.get_or_insert_global(AREA_PTR_SYMBOL, Type::Ptr, false);
        let (prev_loc, new_prev) = module.get_or_insert_global(PREV_LOC_SYMBOL, Type::I32, true);
        let (insert_block, new_block) =
            module.get_or_insert_function(INSERT_BLOCK_SYMBOL, Type::Void, &[Type::I32]);
        let (insert_distance, new_distance) = module.get_or_insert_function(
            INSERT_DISTANCE_SYMBOL,
            Type::Void,
            &[Type::I32, Type::I32, Type::I32],
        );
        (
            Self {
                area_ptr,
                prev_loc,
                insert_block,
                insert_distance,
            },
            new_area || new_prev || new_block || new_distance,
        )
    }
}
