//! Runs instrumented modules.
//!
//! The [`Executor`] interprets a [`Module`] and binds the runtime symbols the
//! instrumentation refers to: `__afl_area_ptr` to a [`CoverageMap`], `__afl_prev_loc`
//! to this thread's [`prev_loc`], and the `insert_block` / `insert_distance`
//! declarations to a [`DistanceHooks`] implementation.

use core::cell::{Cell, RefCell};

use distafl_bolts::Error;
use distafl_cc::{
    ir::{
        mask_to_width, BinOp, BlockId, CastOp, FuncId, Function, GlobalId, InstKind,
        IntPredicate, Module, Terminator, Type, Value,
    },
    AREA_PTR_SYMBOL, INSERT_BLOCK_SYMBOL, INSERT_DISTANCE_SYMBOL, PREV_LOC_SYMBOL,
};
use hashbrown::HashMap;

use crate::{
    coverage::{prev_loc, reset_prev_loc, set_prev_loc, CoverageMap},
    hooks::DistanceHooks,
};

/// Instructions and terminators an [`Executor::run`] may execute by default
pub const DEFAULT_STEP_LIMIT: usize = 1 << 20;

/// Where a runtime pointer points
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pointer {
    /// The start of a global
    Global(GlobalId),
    /// A byte offset into the coverage map
    Map(usize),
}

/// A value at runtime
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RtValue {
    /// The result of instructions without one
    Void,
    /// An integer, masked to its width
    Int {
        /// Width in bits
        bits: u32,
        /// The zero-extended value
        value: u128,
    },
    /// A pointer
    Ptr(Pointer),
}

impl RtValue {
    /// An integer of width `bits`, truncating `value` if needed
    #[must_use]
    pub fn int(bits: u32, value: u128) -> Self {
        RtValue::Int {
            bits,
            value: mask_to_width(value, bits),
        }
    }
}

fn to_signed(value: u128, bits: u32) -> i128 {
    if bits >= 128 {
        value as i128
    } else {
        let shift = 128 - bits;
        ((value << shift) as i128) >> shift
    }
}

#[derive(Debug, Default)]
struct RuntimeBindings {
    area_ptr: Option<GlobalId>,
    prev_loc: Option<GlobalId>,
    insert_block: Option<FuncId>,
    insert_distance: Option<FuncId>,
}

impl RuntimeBindings {
    fn resolve(module: &Module) -> Self {
        let external = |name: &str| {
            module
                .function_by_name(name)
                .filter(|id| module.function(*id).is_declaration())
        };
        Self {
            area_ptr: module.global_by_name(AREA_PTR_SYMBOL),
            prev_loc: module.global_by_name(PREV_LOC_SYMBOL),
            insert_block: external(INSERT_BLOCK_SYMBOL),
            insert_distance: external(INSERT_DISTANCE_SYMBOL),
        }
    }
}

/// An interpreter for verified modules.
///
/// Other globals of the module live in the executor and start at their initializer,
/// or zero.
#[derive(Debug)]
pub struct Executor<'a, H> {
    module: &'a Module,
    map: &'a CoverageMap,
    hooks: &'a H,
    bindings: RuntimeBindings,
    step_limit: usize,
    steps: Cell<usize>,
    memory: RefCell<HashMap<GlobalId, RtValue>>,
}

impl<'a, H> Executor<'a, H>
where
    H: DistanceHooks,
{
    /// Creates an executor for `module`, which must pass [`Module::verify`].
    pub fn new(module: &'a Module, map: &'a CoverageMap, hooks: &'a H) -> Result<Self, Error> {
        module.verify()?;
        Ok(Self {
            module,
            map,
            hooks,
            bindings: RuntimeBindings::resolve(module),
            step_limit: DEFAULT_STEP_LIMIT,
            steps: Cell::new(0),
            memory: RefCell::new(HashMap::new()),
        })
    }

    /// Sets how many steps a single [`Executor::run`] may take
    #[must_use]
    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// The steps taken by the last run
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps.get()
    }

    /// Runs `function` as a fresh execution: this thread's previous location is reset
    /// first. Integer parameters take `args`, truncated to their width.
    ///
    /// Returns the integer result, if the function has one.
    pub fn run(&self, function: &str, args: &[u64]) -> Result<Option<u128>, Error> {
        let id = self
            .module
            .function_by_name(function)
            .ok_or_else(|| Error::key_not_found(format!("function {function}")))?;
        let func = self.module.function(id);
        if func.params.len() != args.len() {
            return Err(Error::illegal_argument(format!(
                "{function} takes {} arguments, got {}",
                func.params.len(),
                args.len()
            )));
        }
        let args = func
            .params
            .iter()
            .zip(args)
            .map(|(ty, arg)| match ty {
                Type::Int(bits) => Ok(RtValue::int(*bits, u128::from(*arg))),
                _ => Err(Error::unsupported(format!(
                    "parameter of type {ty} for {function}"
                ))),
            })
            .collect::<Result<Vec<_>, Error>>()?;

        reset_prev_loc();
        self.steps.set(0);
        log::trace!("running {function}({args:?})");
        let ret = self.call(id, &args)?;
        log::trace!("{function} returned after {} steps", self.steps.get());
        match ret {
            RtValue::Void => Ok(None),
            RtValue::Int { value, .. } => Ok(Some(value)),
            RtValue::Ptr(_) => Err(Error::unsupported(format!(
                "{function} returns a pointer"
            ))),
        }
    }

    fn tick(&self) -> Result<(), Error> {
        let steps = self.steps.get() + 1;
        if steps > self.step_limit {
            return Err(Error::runtime(format!(
                "step limit of {} exceeded",
                self.step_limit
            )));
        }
        self.steps.set(steps);
        Ok(())
    }

    fn call(&self, id: FuncId, args: &[RtValue]) -> Result<RtValue, Error> {
        let func = self.module.function(id);
        if func.is_declaration() {
            return self.call_external(id, func, args);
        }

        let mut frame: Vec<Option<RtValue>> = vec![None; func.inst_count()];
        let mut pred: Option<BlockId> = None;
        let mut block = BlockId(0);

        loop {
            // all phis of a block read their inputs before any of them is written
            let mut phis = vec![];
            for (id, inst) in func.block_insts(block) {
                let InstKind::Phi { incoming, .. } = &inst.kind else {
                    break;
                };
                let from = pred.ok_or_else(|| {
                    Error::runtime(format!("phi in the entry block of {}", func.name))
                })?;
                let (value, _) = incoming
                    .iter()
                    .find(|(_, b)| *b == from)
                    .ok_or_else(|| {
                        Error::runtime(format!(
                            "phi in {} has no value for {}",
                            func.block(block).name,
                            func.block(from).name
                        ))
                    })?;
                phis.push((id, eval(&frame, args, *value)?));
            }
            for (id, value) in phis {
                frame[id.0] = Some(value);
            }

            for (id, inst) in func.block_insts(block).filter(|(_, i)| !i.is_phi()) {
                self.tick()?;
                frame[id.0] = Some(self.execute(&frame, args, &inst.kind)?);
            }

            self.tick()?;
            let next = match &func.block(block).terminator {
                Terminator::Br { dest } => *dest,
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    if eval_int(&frame, args, *cond)?.1 == 0 {
                        *else_dest
                    } else {
                        *then_dest
                    }
                }
                Terminator::Switch {
                    cond,
                    default,
                    cases,
                } => {
                    let (_, value) = eval_int(&frame, args, *cond)?;
                    cases
                        .iter()
                        .find(|(case, _)| case.value() == value)
                        .map_or(*default, |(_, dest)| *dest)
                }
                Terminator::Ret { value: None } => return Ok(RtValue::Void),
                Terminator::Ret { value: Some(value) } => return eval(&frame, args, *value),
                Terminator::Unreachable => {
                    return Err(Error::runtime(format!(
                        "reached unreachable in {}:{}",
                        func.name,
                        func.block(block).name
                    )))
                }
            };
            pred = Some(block);
            block = next;
        }
    }

    fn call_external(
        &self,
        id: FuncId,
        func: &Function,
        args: &[RtValue],
    ) -> Result<RtValue, Error> {
        let arg = |n: usize| -> Result<u32, Error> {
            match args.get(n) {
                Some(RtValue::Int { value, .. }) => Ok(*value as u32),
                _ => Err(Error::runtime(format!(
                    "argument {n} of {} is not an integer",
                    func.name
                ))),
            }
        };

        if Some(id) == self.bindings.insert_block {
            self.hooks.insert_block(arg(0)?);
        } else if Some(id) == self.bindings.insert_distance {
            self.hooks.insert_distance(arg(0)?, arg(1)?, arg(2)?);
        } else {
            return Err(Error::unsupported(format!(
                "call to unknown external {}",
                func.name
            )));
        }
        Ok(RtValue::Void)
    }

    fn execute(
        &self,
        frame: &[Option<RtValue>],
        args: &[RtValue],
        kind: &InstKind,
    ) -> Result<RtValue, Error> {
        match kind {
            InstKind::Phi { .. } => Err(Error::runtime("phi after a non-phi instruction")),
            InstKind::Binary { op, lhs, rhs } => {
                let (bits, a) = eval_int(frame, args, *lhs)?;
                let (_, b) = eval_int(frame, args, *rhs)?;
                let value = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl | BinOp::LShr if b >= u128::from(bits) => {
                        return Err(Error::runtime(format!(
                            "shift by {b} of an i{bits}"
                        )))
                    }
                    BinOp::Shl => a << b,
                    BinOp::LShr => a >> b,
                };
                Ok(RtValue::int(bits, value))
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let (bits, a) = eval_int(frame, args, *lhs)?;
                let (_, b) = eval_int(frame, args, *rhs)?;
                let (sa, sb) = (to_signed(a, bits), to_signed(b, bits));
                let res = match pred {
                    IntPredicate::Eq => a == b,
                    IntPredicate::Ne => a != b,
                    IntPredicate::Ugt => a > b,
                    IntPredicate::Uge => a >= b,
                    IntPredicate::Ult => a < b,
                    IntPredicate::Ule => a <= b,
                    IntPredicate::Sgt => sa > sb,
                    IntPredicate::Sge => sa >= sb,
                    IntPredicate::Slt => sa < sb,
                    IntPredicate::Sle => sa <= sb,
                };
                Ok(RtValue::int(1, u128::from(res)))
            }
            InstKind::Cast { op, value, to } => {
                let (bits, v) = eval_int(frame, args, *value)?;
                let to_bits = to.scalar_size_in_bits();
                Ok(match op {
                    CastOp::ZExt | CastOp::Trunc => RtValue::int(to_bits, v),
                    CastOp::SExt => RtValue::int(to_bits, to_signed(v, bits) as u128),
                })
            }
            InstKind::Load { ty, ptr } => self.load(*ty, eval_ptr(frame, args, *ptr)?),
            InstKind::Store { value, ptr } => {
                let value = eval(frame, args, *value)?;
                self.store(value, eval_ptr(frame, args, *ptr)?)?;
                Ok(RtValue::Void)
            }
            InstKind::GetElementPtr { base, index } => {
                let (_, index) = eval_int(frame, args, *index)?;
                let index = usize::try_from(index)?;
                match eval_ptr(frame, args, *base)? {
                    Pointer::Map(offset) => Ok(RtValue::Ptr(Pointer::Map(offset + index))),
                    global @ Pointer::Global(_) if index == 0 => Ok(RtValue::Ptr(global)),
                    Pointer::Global(g) => Err(Error::unsupported(format!(
                        "offset {index} into global {}",
                        self.module.global(g).name
                    ))),
                }
            }
            InstKind::Call { callee, args: call_args, .. } => {
                let values = call_args
                    .iter()
                    .map(|v| eval(frame, args, *v))
                    .collect::<Result<Vec<_>, Error>>()?;
                self.call(*callee, &values)
            }
        }
    }

    fn load(&self, ty: Type, ptr: Pointer) -> Result<RtValue, Error> {
        match ptr {
            Pointer::Global(g) if Some(g) == self.bindings.area_ptr => {
                Ok(RtValue::Ptr(Pointer::Map(0)))
            }
            Pointer::Global(g) if Some(g) == self.bindings.prev_loc => {
                Ok(RtValue::int(32, u128::from(prev_loc())))
            }
            Pointer::Global(g) => {
                if let Some(value) = self.memory.borrow().get(&g) {
                    return Ok(*value);
                }
                let global = self.module.global(g);
                match ty {
                    Type::Int(bits) => Ok(RtValue::int(
                        bits,
                        global.initializer.map_or(0, |init| init.value()),
                    )),
                    _ => Err(Error::unsupported(format!(
                        "load of {ty} from {}",
                        global.name
                    ))),
                }
            }
            Pointer::Map(offset) => {
                if ty != Type::I8 {
                    return Err(Error::unsupported(format!("load of {ty} from the map")));
                }
                let value = self.map.get(offset).ok_or_else(|| {
                    Error::runtime(format!("map read out of bounds at {offset}"))
                })?;
                Ok(RtValue::int(8, u128::from(value)))
            }
        }
    }

    fn store(&self, value: RtValue, ptr: Pointer) -> Result<(), Error> {
        match (ptr, value) {
            (Pointer::Global(g), RtValue::Int { value, .. })
                if Some(g) == self.bindings.prev_loc =>
            {
                set_prev_loc(value as u32);
                Ok(())
            }
            (Pointer::Global(g), _) if Some(g) == self.bindings.area_ptr => Err(
                Error::unsupported(format!("store to {AREA_PTR_SYMBOL}")),
            ),
            (Pointer::Global(g), value) => {
                self.memory.borrow_mut().insert(g, value);
                Ok(())
            }
            (Pointer::Map(offset), RtValue::Int { value, .. }) => {
                if self.map.set(offset, value as u8) {
                    Ok(())
                } else {
                    Err(Error::runtime(format!(
                        "map write out of bounds at {offset}"
                    )))
                }
            }
            (Pointer::Map(_), value) => Err(Error::unsupported(format!(
                "store of {value:?} to the map"
            ))),
        }
    }
}

fn eval(frame: &[Option<RtValue>], args: &[RtValue], value: Value) -> Result<RtValue, Error> {
    match value {
        Value::Const(constant) => Ok(RtValue::int(constant.bits(), constant.value())),
        Value::Arg(n) => args
            .get(n)
            .copied()
            .ok_or_else(|| Error::runtime(format!("missing argument {n}"))),
        Value::Inst(id) => frame
            .get(id.0)
            .copied()
            .flatten()
            .ok_or_else(|| Error::runtime(format!("instruction {} used before it ran", id.0))),
        Value::Global(g) => Ok(RtValue::Ptr(Pointer::Global(g))),
    }
}

fn eval_int(
    frame: &[Option<RtValue>],
    args: &[RtValue],
    value: Value,
) -> Result<(u32, u128), Error> {
    match eval(frame, args, value)? {
        RtValue::Int { bits, value } => Ok((bits, value)),
        other => Err(Error::runtime(format!("expected an integer, got {other:?}"))),
    }
}

fn eval_ptr(frame: &[Option<RtValue>], args: &[RtValue], value: Value) -> Result<Pointer, Error> {
    match eval(frame, args, value)? {
        RtValue::Ptr(ptr) => Ok(ptr),
        other => Err(Error::runtime(format!("expected a pointer, got {other:?}"))),
    }
}
