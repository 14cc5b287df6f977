//! The module pass: visits every block once and instruments the ones sampling picks.

use distafl_bolts::{
    rands::{Rand, RandomSeed, StdRand},
    Error,
};

use crate::{
    config::InstrumentationConfig,
    coverage::EdgeCoverageRecorder,
    distance::BranchDistanceAnalyzer,
    ids::PersistentIdAllocator,
    ir::{BlockId, ConstantInt, IrBuilder, Module, Type},
    report::{DistanceKind, InstrumentationReport, JoinPointRecord},
    sampling::SamplingPolicy,
    ModulePass, RuntimeSymbols, VERSION,
};

/// Edge coverage plus branch distance instrumentation.
///
/// Per instrumented block, the coverage map update followed by `insert_block(id)` go
/// in front of the first non-phi instruction. Distance reports for a comparison sit
/// right before the `icmp`, those for a `switch` right before the terminator.
/// If the `icmp` is the first non-phi instruction, its reports end up between the
/// coverage update and `insert_block`.
#[derive(Debug)]
pub struct DistanceCoveragePass<R = StdRand> {
    config: InstrumentationConfig,
    rand: R,
    sampling: SamplingPolicy,
    coverage: EdgeCoverageRecorder,
    distance: BranchDistanceAnalyzer,
    last_report: Option<InstrumentationReport>,
}

impl DistanceCoveragePass<StdRand> {
    /// Creates the pass. The rng is seeded from the config, or from the clock.
    #[must_use]
    pub fn new(config: InstrumentationConfig) -> Self {
        let rand = config.seed.map_or_else(StdRand::new, StdRand::with_seed);
        Self::with_rand(config, rand)
    }

    /// Creates the pass configured from the environment
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(InstrumentationConfig::from_env()?))
    }
}

impl<R> DistanceCoveragePass<R>
where
    R: Rand,
{
    /// Creates the pass drawing sampling decisions and locations from `rand`
    pub fn with_rand(config: InstrumentationConfig, rand: R) -> Self {
        Self {
            sampling: SamplingPolicy::new(config.ratio),
            config,
            rand,
            coverage: EdgeCoverageRecorder::new(),
            distance: BranchDistanceAnalyzer::new(),
            last_report: None,
        }
    }

    /// The configuration
    #[must_use]
    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    /// The report of the last [`ModulePass::run_on_module`]
    #[must_use]
    pub fn last_report(&self) -> Option<&InstrumentationReport> {
        self.last_report.as_ref()
    }

    /// Instruments `module`, taking identities from `ids`.
    ///
    /// The caller owns `ids` and decides when to persist it.
    pub fn instrument_module(
        &mut self,
        module: &mut Module,
        ids: &mut PersistentIdAllocator,
    ) -> Result<InstrumentationReport, Error> {
        let (symbols, _) = RuntimeSymbols::declare(module);
        let mut report =
            InstrumentationReport::new(&module.name, self.config.ratio, self.config.mode);

        for func in &mut module.functions {
            // Declarations have no blocks. Blocks are never added while iterating.
            for idx in 0..func.blocks.len() {
                let block = BlockId(idx);
                report.considered += 1;

                if !self.sampling.should_instrument(&mut self.rand) {
                    report.skipped += 1;
                    continue;
                }
                let location = self.coverage.next_location(&mut self.rand);

                let site = self.distance.analyze(func, block);
                let anchor = func.first_insertion_point(block);
                let id = ids.acquire_next_id()?;

                let mut builder = IrBuilder::new(func, block, anchor)?.nosanitize();
                self.coverage.emit(&mut builder, &symbols, location);

                let distance = match &site {
                    Some(site) => self
                        .distance
                        .instrument(func, block, site, &symbols, id)?,
                    None => DistanceKind::None,
                };

                IrBuilder::new(func, block, anchor)?.create_call(
                    symbols.insert_block,
                    Type::Void,
                    vec![ConstantInt::i32(id).into()],
                );

                report.record(JoinPointRecord {
                    id,
                    function: func.name.clone(),
                    block: func.block(block).name.clone(),
                    location,
                    distance,
                });
            }
        }

        log::debug!(
            "{}: {} of {} blocks instrumented, {} compares, {} dispatches",
            report.module,
            report.instrumented(),
            report.considered,
            report.compares,
            report.dispatches
        );
        Ok(report)
    }
}

impl<R> ModulePass for DistanceCoveragePass<R>
where
    R: Rand,
{
    fn name(&self) -> &'static str {
        "distafl-distance-coverage"
    }

    fn run_on_module(&mut self, module: &mut Module) -> Result<bool, Error> {
        if !self.config.quiet {
            log::info!("distafl-cc {VERSION} (edge coverage and branch distance)");
        }

        let mut ids = PersistentIdAllocator::open(&self.config.id_file, self.config.lock_id_file)?;
        let (_, declared) = RuntimeSymbols::declare(module);
        let report = self.instrument_module(module, &mut ids)?;
        ids.finish()?;

        if !self.config.quiet {
            if report.instrumented() == 0 {
                log::warn!("{}", report.summary());
            } else {
                log::info!("{}", report.summary());
            }
        }

        if let Some(path) = &self.config.report_path {
            report.write_json(path)?;
        }

        let changed = declared || report.instrumented() > 0;
        self.last_report = Some(report);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use distafl_bolts::{rands::XkcdRand, Error};

    use super::DistanceCoveragePass;
    use crate::{
        config::InstrumentationConfig,
        ids::PersistentIdAllocator,
        ir::{
            BinOp, BlockId, ConstantInt, Function, InstKind, IntPredicate, IrBuilder, Module,
            Terminator, Type, Value,
        },
        report::{DistanceKind, InstrumentationReport},
        sampling::InstRatio,
        ModulePass, INSERT_BLOCK_SYMBOL,
    };

    fn config(dir: &Path, ratio: u32) -> InstrumentationConfig {
        InstrumentationConfig::builder()
            .ratio(InstRatio::try_from(ratio).unwrap())
            .quiet(true)
            .id_file(dir.join(".cur_id"))
            .seed(0xD157)
            .build()
    }

    /// `entry -> loop`, where `loop: i = phi [a, entry], [n, loop]; n = i + 1;
    /// c = icmp ult n, a; br c, loop, exit`
    fn counting_module() -> Module {
        let mut module = Module::new("count.c");
        let mut f = Function::new("count", vec![Type::I32], Type::Void);
        let entry = f.add_block("entry");
        let body = f.add_block("loop");
        let exit = f.add_block("exit");
        f.set_terminator(entry, Terminator::Br { dest: body });

        let mut b = IrBuilder::at_end(&mut f, body).unwrap();
        let Value::Inst(phi_id) = b.create_phi(Type::I32, vec![(Value::Arg(0), entry)]) else {
            unreachable!()
        };
        let next = b.create_add(Value::Inst(phi_id), ConstantInt::i32(1).into());
        let c = b.create_icmp(IntPredicate::Ult, next, Value::Arg(0));
        f.set_terminator(body, Terminator::CondBr {
            cond: c,
            then_dest: body,
            else_dest: exit,
        });
        f.set_terminator(exit, Terminator::Ret { value: None });
        if let InstKind::Phi { incoming, .. } = &mut f.inst_mut(phi_id).kind {
            incoming.push((next, body));
        }
        module.add_function(f);
        module
    }

    #[test]
    fn test_every_block_at_full_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = counting_module();
        let mut pass = DistanceCoveragePass::new(config(dir.path(), 100));

        assert!(pass.run_on_module(&mut module).unwrap());
        module.verify().unwrap();

        let report = pass.last_report().unwrap();
        assert_eq!(report.considered, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.instrumented(), 3);
        assert_eq!(report.id_range(), Some(1..=3));
        assert_eq!(report.compares, 1);
        assert_eq!(
            report.summary(),
            "Instrumented 3 locations (non-hardened mode, ratio 100%)."
        );
    }

    #[test]
    fn test_code_placement() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = counting_module();
        let mut pass = DistanceCoveragePass::new(config(dir.path(), 100));
        pass.run_on_module(&mut module).unwrap();

        let f = &module.functions[0];
        let insert_block = module.function_by_name(INSERT_BLOCK_SYMBOL).unwrap();
        let kinds: Vec<&InstKind> = f.block_insts(BlockId(1)).map(|(_, i)| &i.kind).collect();

        // phi, 8 coverage instructions, insert_block, add, xor, insert_distance, icmp
        assert_eq!(kinds.len(), 14);
        assert!(matches!(kinds[0], InstKind::Phi { .. }));
        assert!(f.block_insts(BlockId(1)).skip(1).take(8).all(|(_, i)| i.nosanitize));
        assert!(matches!(
            kinds[9],
            InstKind::Call { callee, args, .. }
                if *callee == insert_block && args[0] == Value::from(ConstantInt::i32(2))
        ));
        assert!(matches!(kinds[10], InstKind::Binary { op: BinOp::Add, .. }));
        assert!(matches!(kinds[11], InstKind::Binary { op: BinOp::Xor, .. }));
        assert!(matches!(kinds[12], InstKind::Call { .. }));
        assert!(!f.block_insts(BlockId(1)).nth(12).unwrap().1.nosanitize);
        assert!(matches!(kinds[13], InstKind::ICmp { .. }));
    }

    #[test]
    fn test_sampling_skips_whole_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = counting_module();
        let before = module.clone();

        // every draw is 99, so a ratio of 99% skips everything
        let mut pass = DistanceCoveragePass::with_rand(
            config(dir.path(), 99),
            XkcdRand::with_value(u64::MAX),
        );
        pass.run_on_module(&mut module).unwrap();

        let report = pass.last_report().unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(report.instrumented(), 0);
        assert_eq!(report.summary(), "No instrumentation targets found.");
        assert_eq!(module.functions[0], before.functions[0]);
    }

    #[test]
    fn test_modules_share_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = counting_module();
        let mut second = counting_module();

        let mut pass = DistanceCoveragePass::new(config(dir.path(), 100));
        pass.run_on_module(&mut first).unwrap();
        let a = pass.last_report().unwrap().id_range().unwrap();
        pass.run_on_module(&mut second).unwrap();
        let b = pass.last_report().unwrap().id_range().unwrap();

        assert!(a.end() < b.start());
        assert_eq!(*b.end(), 6);
    }

    #[test]
    fn test_exhausted_ids_abort_the_module() {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join(".cur_id");
        fs::write(&id_file, (u32::MAX - 1).to_ne_bytes()).unwrap();

        // three blocks, but only one id left
        let mut pass = DistanceCoveragePass::new(config(dir.path(), 100));
        assert!(matches!(
            pass.run_on_module(&mut counting_module()),
            Err(Error::IllegalState(..))
        ));
        assert_eq!(fs::read(&id_file).unwrap(), (u32::MAX - 1).to_ne_bytes());
    }

    #[test]
    fn test_caller_owned_ids_and_report_file() -> Result<(), Error> {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");
        let config = InstrumentationConfig::builder()
            .quiet(true)
            .id_file(dir.path().join(".cur_id"))
            .report_path(report_path.clone())
            .seed(1)
            .build();

        let mut ids = PersistentIdAllocator::open(&config.id_file, false)?;
        let mut pass = DistanceCoveragePass::new(config.clone());
        let report = pass.instrument_module(&mut counting_module(), &mut ids)?;
        assert_eq!(ids.issued(), 3);
        // never finished, so the pass continues from 0 again
        drop(ids);

        pass.run_on_module(&mut counting_module())?;
        let written = InstrumentationReport::read_json(&report_path)?;
        assert_eq!(written.id_range(), report.id_range());
        assert!(written
            .join_points
            .iter()
            .any(|jp| jp.distance == DistanceKind::Compare && jp.block == "loop"));
        Ok(())
    }
}
