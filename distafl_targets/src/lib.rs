//! `distafl_targets` is the runtime side of `distafl_cc`: the coverage map behind
//! `__afl_area_ptr`, the per-thread `__afl_prev_loc`, receivers for `insert_block` and
//! `insert_distance`, and an [`executor::Executor`] that runs instrumented modules
//! against them.
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
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
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
    //unused_results
))]

pub mod coverage;
pub use coverage::*;

pub mod hooks;
pub use hooks::*;

pub mod executor;
pub use executor::{Executor, RtValue, DEFAULT_STEP_LIMIT};
