//! Explicit pass registration.
//!
//! A host compiler calls [`PassPipeline::run`] at its extension points, or
//! [`PassPipeline::run_for_opt_level`] to pick the point from the optimization level.

use core::fmt;

use distafl_bolts::Error;
use hashbrown::HashMap;

use crate::{config::InstrumentationConfig, ir::Module, pass::DistanceCoveragePass, ModulePass};

/// Where in the host's optimization pipeline passes run
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExtensionPoint {
    /// Early in the module optimizer, when optimizing
    ModuleOptimizerEarly,
    /// The pipeline used at `-O0`
    EnabledOnOptLevel0,
}

impl ExtensionPoint {
    /// The point a host with the given optimization level goes through
    #[must_use]
    pub fn for_opt_level(level: u8) -> Self {
        if level == 0 {
            ExtensionPoint::EnabledOnOptLevel0
        } else {
            ExtensionPoint::ModuleOptimizerEarly
        }
    }
}

/// Creates a fresh pass for each run
pub type PassFactory = Box<dyn Fn() -> Result<Box<dyn ModulePass>, Error>>;

/// Pass factories by extension point, run in registration order.
#[derive(Default)]
pub struct PassPipeline {
    factories: HashMap<ExtensionPoint, Vec<PassFactory>>,
}

impl fmt::Debug for PassPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (point, factories) in &self.factories {
            map.entry(point, &factories.len());
        }
        map.finish()
    }
}

impl PassPipeline {
    /// Creates an empty pipeline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pass factory at `point`
    pub fn register<F>(&mut self, point: ExtensionPoint, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Box<dyn ModulePass>, Error> + 'static,
    {
        self.factories
            .entry(point)
            .or_default()
            .push(Box::new(factory));
        self
    }

    /// Registers [`DistanceCoveragePass`] with `config` at both extension points,
    /// so it runs whatever the optimization level.
    pub fn register_distance_coverage(&mut self, config: &InstrumentationConfig) -> &mut Self {
        for point in [
            ExtensionPoint::ModuleOptimizerEarly,
            ExtensionPoint::EnabledOnOptLevel0,
        ] {
            let config = config.clone();
            self.register(point, move || {
                Ok(Box::new(DistanceCoveragePass::new(config.clone())) as Box<dyn ModulePass>)
            });
        }
        self
    }

    /// Registers [`DistanceCoveragePass`] at both extension points, configured from the
    /// environment each time it runs.
    pub fn register_distance_coverage_from_env(&mut self) -> &mut Self {
        for point in [
            ExtensionPoint::ModuleOptimizerEarly,
            ExtensionPoint::EnabledOnOptLevel0,
        ] {
            self.register(point, || {
                Ok(Box::new(DistanceCoveragePass::from_env()?) as Box<dyn ModulePass>)
            });
        }
        self
    }

    /// The number of passes registered at `point`
    #[must_use]
    pub fn passes_at(&self, point: ExtensionPoint) -> usize {
        self.factories.get(&point).map_or(0, Vec::len)
    }

    /// Runs the passes registered at `point` on `module`.
    /// Returns whether any of them changed it.
    pub fn run(&self, point: ExtensionPoint, module: &mut Module) -> Result<bool, Error> {
        let mut changed = false;
        for factory in self.factories.get(&point).into_iter().flatten() {
            let mut pass = factory()?;
            log::debug!("Running {} on {}", pass.name(), module.name);
            changed |= pass.run_on_module(module)?;
        }
        Ok(changed)
    }

    /// Runs the passes a host at optimization `level` would run
    pub fn run_for_opt_level(&self, level: u8, module: &mut Module) -> Result<bool, Error> {
        self.run(ExtensionPoint::for_opt_level(level), module)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use distafl_bolts::Error;

    use super::{ExtensionPoint, PassPipeline};
    use crate::{
        config::InstrumentationConfig,
        ir::{Function, Module, Terminator, Type},
        ModulePass, INSERT_BLOCK_SYMBOL,
    };

    #[derive(Debug)]
    struct Tracer {
        tag: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl ModulePass for Tracer {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn run_on_module(&mut self, _module: &mut Module) -> Result<bool, Error> {
            self.log.borrow_mut().push(self.tag);
            Ok(self.tag == "changes")
        }
    }

    #[test]
    fn test_points_and_order() {
        let log = Rc::new(RefCell::new(vec![]));
        let mut pipeline = PassPipeline::new();
        for tag in ["first", "changes"] {
            let log = log.clone();
            pipeline.register(ExtensionPoint::ModuleOptimizerEarly, move || {
                Ok(Box::new(Tracer {
                    tag,
                    log: log.clone(),
                }) as Box<dyn ModulePass>)
            });
        }

        let mut module = Module::new("m.c");
        assert!(!pipeline.run_for_opt_level(0, &mut module).unwrap());
        assert!(log.borrow().is_empty());

        assert!(pipeline.run_for_opt_level(2, &mut module).unwrap());
        assert_eq!(*log.borrow(), vec!["first", "changes"]);
        assert_eq!(pipeline.passes_at(ExtensionPoint::EnabledOnOptLevel0), 0);
    }

    #[test]
    fn test_distance_coverage_runs_at_any_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstrumentationConfig::builder()
            .quiet(true)
            .id_file(dir.path().join(".cur_id"))
            .seed(5)
            .build();
        let mut pipeline = PassPipeline::new();
        pipeline.register_distance_coverage(&config);
        assert_eq!(pipeline.passes_at(ExtensionPoint::ModuleOptimizerEarly), 1);
        assert_eq!(pipeline.passes_at(ExtensionPoint::EnabledOnOptLevel0), 1);

        for level in [0, 3] {
            let mut module = Module::new("m.c");
            let mut f = Function::new("main", vec![], Type::Void);
            let entry = f.add_block("entry");
            f.set_terminator(entry, Terminator::Ret { value: None });
            module.add_function(f);

            assert!(pipeline.run_for_opt_level(level, &mut module).unwrap());
            assert!(module.function_by_name(INSERT_BLOCK_SYMBOL).is_some());
            module.verify().unwrap();
        }
        assert!(format!("{pipeline:?}").contains("EnabledOnOptLevel0"));
    }
}
