//! Many threads, one coverage map.

use std::thread;

use distafl_cc::{
    config::InstrumentationConfig,
    coverage::edge_key,
    ir::{Function, Module, Terminator, Type},
    pass::DistanceCoveragePass,
    ModulePass,
};
use distafl_targets::{prev_loc, CoverageMap, DistanceLog, Executor};

const THREADS: usize = 4;
const RUNS: usize = 60;

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_hits_never_overcount() {
    let map = CoverageMap::new();
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..RUNS {
                    map.hit(42);
                }
            });
        }
    });
    let hits = usize::from(map.get(42).unwrap());
    assert!((1..=THREADS * RUNS).contains(&hits), "{hits}");
    assert_eq!(map.count_nonzero(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_instrumented_threads_share_the_map() {
    let dir = tempfile::tempdir().unwrap();
    let mut module = Module::new("tick.c");
    let mut f = Function::new("tick", vec![], Type::Void);
    let entry = f.add_block("entry");
    f.set_terminator(entry, Terminator::Ret { value: None });
    module.add_function(f);

    let mut pass = DistanceCoveragePass::new(
        InstrumentationConfig::builder()
            .quiet(true)
            .id_file(dir.path().join(".cur_id"))
            .seed(99)
            .build(),
    );
    pass.run_on_module(&mut module).unwrap();
    let location = pass.last_report().unwrap().join_points[0].location;

    let map = CoverageMap::new();
    let log = DistanceLog::new();
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let exec = Executor::new(&module, &map, &log).unwrap();
                for _ in 0..RUNS {
                    exec.run("tick", &[]).unwrap();
                }
                // each thread has its own previous location
                assert_eq!(prev_loc(), location >> 1);
            });
        }
    });

    // every run starts from a previous location of 0
    let hits = usize::from(map.get(edge_key(0, location) as usize).unwrap());
    assert!((1..=THREADS * RUNS).contains(&hits), "{hits}");
    assert_eq!(map.count_nonzero(), 1);
    // hooks are synchronized, so none of their calls get lost
    assert_eq!(log.blocks().len(), THREADS * RUNS);
    assert_eq!(prev_loc(), 0);
}
