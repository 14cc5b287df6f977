//! A small SSA-style program representation, modeled after the parts of LLVM IR the
//! instrumentation needs: modules of functions, functions of basic blocks, and blocks
//! of instructions closed by a terminator.
//!
//! Instructions live in a per-function arena and blocks refer to them by [`InstId`], so
//! inserting code into a block never invalidates references held elsewhere.

use core::fmt::{self, Display};

use distafl_bolts::Error;
use serde::{Deserialize, Serialize};

/// The type of a value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// No value
    Void,
    /// An integer of the given width in bits (`1..=128`)
    Int(u32),
    /// An opaque pointer
    Ptr,
    /// A floating point number of the given width in bits
    Float(u32),
}

impl Type {
    /// `i1`
    pub const I1: Type = Type::Int(1);
    /// `i8`
    pub const I8: Type = Type::Int(8);
    /// `i16`
    pub const I16: Type = Type::Int(16);
    /// `i32`
    pub const I32: Type = Type::Int(32);
    /// `i64`
    pub const I64: Type = Type::Int(64);

    /// Returns `true` for integer types.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    /// The width of this type in bits. Pointers are 64 bits wide.
    #[must_use]
    pub fn scalar_size_in_bits(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Int(bits) | Type::Float(bits) => *bits,
            Type::Ptr => 64,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Ptr => write!(f, "ptr"),
            Type::Float(bits) => write!(f, "f{bits}"),
        }
    }
}

/// Masks `value` to its low `bits` bits.
#[must_use]
#[inline]
pub fn mask_to_width(value: u128, bits: u32) -> u128 {
    if bits >= 128 {
        value
    } else {
        value & ((1u128 << bits) - 1)
    }
}

/// An integer constant. The value is always kept masked to the width.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstantInt {
    bits: u32,
    value: u128,
}

impl ConstantInt {
    /// Creates a new constant of width `bits`, truncating `value` if needed.
    #[must_use]
    pub fn new(bits: u32, value: u128) -> Self {
        debug_assert!((1..=128).contains(&bits), "invalid integer width {bits}");
        Self {
            bits,
            value: mask_to_width(value, bits),
        }
    }

    /// An `i32` constant
    #[must_use]
    pub fn i32(value: u32) -> Self {
        Self::new(32, u128::from(value))
    }

    /// An `i64` constant
    #[must_use]
    pub fn i64(value: u64) -> Self {
        Self::new(64, u128::from(value))
    }

    /// The width in bits
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// The zero-extended value
    #[must_use]
    pub fn value(&self) -> u128 {
        self.value
    }

    /// The integer type of this constant
    #[must_use]
    pub fn ty(&self) -> Type {
        Type::Int(self.bits)
    }
}

/// Index of a [`Function`] inside its [`Module`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub usize);

/// Index of a [`GlobalVariable`] inside its [`Module`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub usize);

/// Index of a [`Block`] inside its [`Function`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

/// Index of an [`Instruction`] inside its [`Function`]'s arena
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstId(pub usize);

/// An operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// An integer constant
    Const(ConstantInt),
    /// The n-th argument of the enclosing function
    Arg(usize),
    /// The result of an instruction of the enclosing function
    Inst(InstId),
    /// The address of a global variable
    Global(GlobalId),
}

impl From<ConstantInt> for Value {
    fn from(constant: ConstantInt) -> Self {
        Value::Const(constant)
    }
}

/// Integer binary operators
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    /// Wrapping addition
    Add,
    /// Wrapping subtraction
    Sub,
    /// Wrapping multiplication
    Mul,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Logical shift right
    LShr,
}

/// Integer comparison predicates
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntPredicate {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// unsigned `>`
    Ugt,
    /// unsigned `>=`
    Uge,
    /// unsigned `<`
    Ult,
    /// unsigned `<=`
    Ule,
    /// signed `>`
    Sgt,
    /// signed `>=`
    Sge,
    /// signed `<`
    Slt,
    /// signed `<=`
    Sle,
}

/// Integer casts
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    /// Zero extension
    ZExt,
    /// Sign extension
    SExt,
    /// Truncation
    Trunc,
}

/// What an instruction computes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstKind {
    /// Selects a value depending on the predecessor block
    Phi {
        /// The type of the result
        ty: Type,
        /// `(value, predecessor)` pairs
        incoming: Vec<(Value, BlockId)>,
    },
    /// Integer arithmetic, the result has the type of `lhs`
    Binary {
        /// The operator
        op: BinOp,
        /// Left operand
        lhs: Value,
        /// Right operand
        rhs: Value,
    },
    /// Integer comparison producing an `i1`
    ICmp {
        /// The predicate
        pred: IntPredicate,
        /// Left operand
        lhs: Value,
        /// Right operand
        rhs: Value,
    },
    /// Integer cast
    Cast {
        /// The cast operation
        op: CastOp,
        /// The casted value
        value: Value,
        /// The destination type
        to: Type,
    },
    /// Load a value of type `ty` from `ptr`
    Load {
        /// The loaded type
        ty: Type,
        /// The address
        ptr: Value,
    },
    /// Store `value` to `ptr`
    Store {
        /// The stored value
        value: Value,
        /// The address
        ptr: Value,
    },
    /// Byte-granular pointer arithmetic
    GetElementPtr {
        /// The base pointer
        base: Value,
        /// The offset in bytes
        index: Value,
    },
    /// Call a function of the module
    Call {
        /// The callee
        callee: FuncId,
        /// The return type of the callee
        ret: Type,
        /// The arguments
        args: Vec<Value>,
    },
}

/// An instruction: what it computes plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// What this instruction computes
    pub kind: InstKind,
    /// Set on instrumentation loads and stores that sanitizers must not check
    pub nosanitize: bool,
}

impl Instruction {
    /// Creates a new instruction without metadata.
    #[must_use]
    pub fn new(kind: InstKind) -> Self {
        Self {
            kind,
            nosanitize: false,
        }
    }

    /// Returns `true` for phi nodes
    #[must_use]
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }
}

/// How control leaves a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional branch
    Br {
        /// Destination
        dest: BlockId,
    },
    /// Two-way branch on an `i1`
    CondBr {
        /// The condition
        cond: Value,
        /// Taken if `cond` is true
        then_dest: BlockId,
        /// Taken otherwise
        else_dest: BlockId,
    },
    /// Multi-way dispatch on an integer
    Switch {
        /// The dispatched value
        cond: Value,
        /// Taken if no case matches
        default: BlockId,
        /// The cases, in order. The first matching case wins.
        cases: Vec<(ConstantInt, BlockId)>,
    },
    /// Return from the function
    Ret {
        /// The returned value, if any
        value: Option<Value>,
    },
    /// Control never reaches here
    Unreachable,
}

impl Terminator {
    /// Blocks this terminator may transfer control to
    #[must_use]
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br { dest } => vec![*dest],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Terminator::Switch { default, cases, .. } => core::iter::once(*default)
                .chain(cases.iter().map(|(_, dest)| *dest))
                .collect(),
            Terminator::Ret { .. } | Terminator::Unreachable => vec![],
        }
    }
}

/// A basic block: the unit of instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// A name for diagnostics
    pub name: String,
    /// The instructions, in order
    pub insts: Vec<InstId>,
    /// How control leaves this block
    pub terminator: Terminator,
}

impl Block {
    /// The number of operations in this block, including the terminator.
    #[must_use]
    pub fn size(&self) -> usize {
        self.insts.len() + 1
    }
}

/// Where an [`IrBuilder`] inserts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertPoint {
    /// Right before the given instruction
    Before(InstId),
    /// Right before the terminator
    End,
}

/// A function. Functions without blocks are declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// The symbol name
    pub name: String,
    /// Parameter types
    pub params: Vec<Type>,
    /// Return type
    pub ret: Type,
    /// The blocks, the first one is the entry
    pub blocks: Vec<Block>,
    insts: Vec<Instruction>,
}

impl Function {
    /// Creates a function without body
    #[must_use]
    pub fn new(name: &str, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            blocks: vec![],
            insts: vec![],
        }
    }

    /// Returns `true` if this function has no body
    #[must_use]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Appends an empty block ending in `unreachable`
    pub fn add_block(&mut self, name: &str) -> BlockId {
        self.blocks.push(Block {
            name: name.to_string(),
            insts: vec![],
            terminator: Terminator::Unreachable,
        });
        BlockId(self.blocks.len() - 1)
    }

    /// Gets a block
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// Gets a block mutably
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    /// Replaces the terminator of a block
    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) {
        self.blocks[block.0].terminator = terminator;
    }

    /// Gets an instruction
    #[must_use]
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0]
    }

    /// Gets an instruction mutably, e.g. to add incoming edges to a phi
    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.0]
    }

    /// The number of instructions ever created in this function
    #[must_use]
    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Iterates over the instructions of a block, in order
    pub fn block_insts(&self, block: BlockId) -> impl Iterator<Item = (InstId, &Instruction)> {
        self.blocks[block.0]
            .insts
            .iter()
            .map(move |id| (*id, &self.insts[id.0]))
    }

    /// The first instruction that is not a phi node, or [`InsertPoint::End`] if there is none.
    #[must_use]
    pub fn first_insertion_point(&self, block: BlockId) -> InsertPoint {
        self.block_insts(block)
            .find(|(_, inst)| !inst.is_phi())
            .map_or(InsertPoint::End, |(id, _)| InsertPoint::Before(id))
    }

    /// The type of an operand
    #[must_use]
    pub fn value_type(&self, value: Value) -> Type {
        match value {
            Value::Const(constant) => constant.ty(),
            Value::Arg(n) => self.params.get(n).copied().unwrap_or(Type::Void),
            Value::Inst(id) => self.inst_type(id),
            Value::Global(_) => Type::Ptr,
        }
    }

    /// The type of the value an instruction produces
    #[must_use]
    pub fn inst_type(&self, id: InstId) -> Type {
        match &self.insts[id.0].kind {
            InstKind::Phi { ty, .. } | InstKind::Load { ty, .. } => *ty,
            InstKind::Binary { lhs, .. } => self.value_type(*lhs),
            InstKind::ICmp { .. } => Type::I1,
            InstKind::Cast { to, .. } => *to,
            InstKind::Store { .. } => Type::Void,
            InstKind::GetElementPtr { .. } => Type::Ptr,
            InstKind::Call { ret, .. } => *ret,
        }
    }

    fn insert(&mut self, block: BlockId, index: usize, inst: Instruction) -> InstId {
        let id = InstId(self.insts.len());
        self.insts.push(inst);
        self.blocks[block.0].insts.insert(index, id);
        id
    }

    fn resolve(&self, block: BlockId, point: InsertPoint) -> Result<usize, Error> {
        let insts = &self.blocks[block.0].insts;
        match point {
            InsertPoint::End => Ok(insts.len()),
            InsertPoint::Before(id) => insts.iter().position(|i| *i == id).ok_or_else(|| {
                Error::illegal_argument(format!(
                    "instruction {} is not part of block {} of {}",
                    id.0, self.blocks[block.0].name, self.name
                ))
            }),
        }
    }

    fn verify(&self, module: &Module) -> Result<(), Error> {
        let fail = |msg: String| Err(Error::illegal_state(format!("{}: {msg}", self.name)));

        let check_block = |id: BlockId| id.0 < self.blocks.len();
        let check_value = |value: &Value| match value {
            Value::Const(_) => true,
            Value::Arg(n) => *n < self.params.len(),
            Value::Inst(id) => id.0 < self.insts.len(),
            Value::Global(id) => id.0 < module.globals.len(),
        };

        let mut placed = vec![false; self.insts.len()];
        for block in &self.blocks {
            let mut seen_non_phi = false;
            for id in &block.insts {
                let Some(inst) = self.insts.get(id.0) else {
                    return fail(format!("block {} refers to unknown instruction", block.name));
                };
                if core::mem::replace(&mut placed[id.0], true) {
                    return fail(format!("instruction {} placed twice", id.0));
                }
                if inst.is_phi() {
                    if seen_non_phi {
                        return fail(format!("phi after non-phi in block {}", block.name));
                    }
                } else {
                    seen_non_phi = true;
                }
                let operands_ok = match &inst.kind {
                    InstKind::Phi { incoming, .. } => incoming
                        .iter()
                        .all(|(value, pred)| check_value(value) && check_block(*pred)),
                    InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                        check_value(lhs) && check_value(rhs)
                    }
                    InstKind::Cast { value, .. } => check_value(value),
                    InstKind::Load { ptr, .. } => check_value(ptr),
                    InstKind::Store { value, ptr } => check_value(value) && check_value(ptr),
                    InstKind::GetElementPtr { base, index } => {
                        check_value(base) && check_value(index)
                    }
                    InstKind::Call { callee, args, .. } => {
                        let Some(target) = module.functions.get(callee.0) else {
                            return fail(format!("call to unknown function {}", callee.0));
                        };
                        target.params.len() == args.len() && args.iter().all(check_value)
                    }
                };
                if !operands_ok {
                    return fail(format!("bad operand in block {}", block.name));
                }
            }

            let terminator_ok = match &block.terminator {
                Terminator::Br { dest } => check_block(*dest),
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => check_value(cond) && check_block(*then_dest) && check_block(*else_dest),
                Terminator::Switch {
                    cond,
                    default,
                    cases,
                } => {
                    let ty = self.value_type(*cond);
                    check_value(cond)
                        && ty.is_integer()
                        && check_block(*default)
                        && cases
                            .iter()
                            .all(|(case, dest)| case.ty() == ty && check_block(*dest))
                }
                Terminator::Ret { value } => value.as_ref().map_or(true, check_value),
                Terminator::Unreachable => true,
            };
            if !terminator_ok {
                return fail(format!("bad terminator in block {}", block.name));
            }
        }
        Ok(())
    }
}

/// Linkage of a global symbol
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    /// Defined elsewhere, or visible to other modules
    External,
    /// Private to this module
    Internal,
}

/// A global variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVariable {
    /// The symbol name
    pub name: String,
    /// The type of the stored value
    pub ty: Type,
    /// The linkage
    pub linkage: Linkage,
    /// One instance per thread
    pub thread_local: bool,
    /// The initial value. External declarations have none.
    pub initializer: Option<ConstantInt>,
}

/// A translation unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// The module identifier, usually the source file
    pub name: String,
    /// The functions, definitions and declarations
    pub functions: Vec<Function>,
    /// The global variables
    pub globals: Vec<GlobalVariable>,
}

impl Module {
    /// Creates an empty module
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: vec![],
            globals: vec![],
        }
    }

    /// Adds a function
    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(function);
        FuncId(self.functions.len() - 1)
    }

    /// Gets a function
    #[must_use]
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0]
    }

    /// Gets a function mutably
    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0]
    }

    /// Looks up a function by name
    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(FuncId)
    }

    /// Looks up a global by name
    #[must_use]
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().position(|g| g.name == name).map(GlobalId)
    }

    /// Gets a global
    #[must_use]
    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.0]
    }

    /// Adds a global
    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() - 1)
    }

    /// Returns the global named `name`, or declares an external one.
    /// The flag tells whether a declaration was inserted.
    pub fn get_or_insert_global(
        &mut self,
        name: &str,
        ty: Type,
        thread_local: bool,
    ) -> (GlobalId, bool) {
        if let Some(id) = self.global_by_name(name) {
            return (id, false);
        }
        let id = self.add_global(GlobalVariable {
            name: name.to_string(),
            ty,
            linkage: Linkage::External,
            thread_local,
            initializer: None,
        });
        (id, true)
    }

    /// Returns the function named `name`, or declares it.
    /// The flag tells whether a declaration was inserted.
    pub fn get_or_insert_function(
        &mut self,
        name: &str,
        ret: Type,
        params: &[Type],
    ) -> (FuncId, bool) {
        if let Some(id) = self.function_by_name(name) {
            return (id, false);
        }
        let id = self.add_function(Function::new(name, params.to_vec(), ret));
        (id, true)
    }

    /// Checks that all references inside the module are in range.
    pub fn verify(&self) -> Result<(), Error> {
        self.functions.iter().try_for_each(|f| f.verify(self))
    }
}

/// Inserts instructions into a block, LLVM `IRBuilder` style: every created instruction
/// lands right before the insert point, so consecutive calls keep program order.
#[derive(Debug)]
pub struct IrBuilder<'f> {
    func: &'f mut Function,
    block: BlockId,
    index: usize,
    nosanitize: bool,
}

impl<'f> IrBuilder<'f> {
    /// Creates a builder inserting at `point` in `block`
    pub fn new(func: &'f mut Function, block: BlockId, point: InsertPoint) -> Result<Self, Error> {
        if block.0 >= func.blocks.len() {
            return Err(Error::illegal_argument(format!(
                "block {} out of range in {}",
                block.0, func.name
            )));
        }
        let index = func.resolve(block, point)?;
        Ok(Self {
            func,
            block,
            index,
            nosanitize: false,
        })
    }

    /// Creates a builder appending to `block`, before its terminator
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Result<Self, Error> {
        Self::new(func, block, InsertPoint::End)
    }

    /// Tag every instruction created from now on as `nosanitize`
    #[must_use]
    pub fn nosanitize(mut self) -> Self {
        self.nosanitize = true;
        self
    }

    /// The function being built
    #[must_use]
    pub fn function(&self) -> &Function {
        &*self.func
    }

    /// Inserts an instruction and returns its result.
    pub fn insert(&mut self, kind: InstKind) -> Value {
        let inst = Instruction {
            kind,
            nosanitize: self.nosanitize,
        };
        let id = self.func.insert(self.block, self.index, inst);
        self.index += 1;
        Value::Inst(id)
    }

    /// `load ty, ptr`
    pub fn create_load(&mut self, ty: Type, ptr: Value) -> Value {
        self.insert(InstKind::Load { ty, ptr })
    }

    /// `store value, ptr`
    pub fn create_store(&mut self, value: Value, ptr: Value) -> Value {
        self.insert(InstKind::Store { value, ptr })
    }

    /// Any binary operator
    pub fn create_binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.insert(InstKind::Binary { op, lhs, rhs })
    }

    /// `add lhs, rhs`
    pub fn create_add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.create_binary(BinOp::Add, lhs, rhs)
    }

    /// `sub lhs, rhs`
    pub fn create_sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.create_binary(BinOp::Sub, lhs, rhs)
    }

    /// `xor lhs, rhs`
    pub fn create_xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.create_binary(BinOp::Xor, lhs, rhs)
    }

    /// `icmp pred lhs, rhs`
    pub fn create_icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        self.insert(InstKind::ICmp { pred, lhs, rhs })
    }

    /// `getelementptr i8, base, index`
    pub fn create_gep(&mut self, base: Value, index: Value) -> Value {
        self.insert(InstKind::GetElementPtr { base, index })
    }

    /// Zero extends `value` to `to`, or returns it unchanged if it already has that type.
    pub fn create_zext(&mut self, value: Value, to: Type) -> Value {
        if self.func.value_type(value) == to {
            return value;
        }
        self.insert(InstKind::Cast {
            op: CastOp::ZExt,
            value,
            to,
        })
    }

    /// Unsigned integer cast: zero extends to wider types, truncates to narrower ones.
    pub fn create_int_cast(&mut self, value: Value, to: Type) -> Value {
        let from = self.func.value_type(value).scalar_size_in_bits();
        let to_bits = to.scalar_size_in_bits();
        let op = match from.cmp(&to_bits) {
            core::cmp::Ordering::Equal => return value,
            core::cmp::Ordering::Less => CastOp::ZExt,
            core::cmp::Ordering::Greater => CastOp::Trunc,
        };
        self.insert(InstKind::Cast { op, value, to })
    }

    /// `call ret callee(args)`
    pub fn create_call(&mut self, callee: FuncId, ret: Type, args: Vec<Value>) -> Value {
        self.insert(InstKind::Call { callee, ret, args })
    }

    /// `phi ty [value, pred], ...`
    pub fn create_phi(&mut self, ty: Type, incoming: Vec<(Value, BlockId)>) -> Value {
        self.insert(InstKind::Phi { ty, incoming })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConstantInt, Function, IntPredicate, InsertPoint, IrBuilder, Module, Terminator, Type,
        Value,
    };

    #[test]
    fn test_constant_masking() {
        assert_eq!(ConstantInt::new(8, 0x1ff).value(), 0xff);
        assert_eq!(ConstantInt::new(1, 3).value(), 1);
        assert_eq!(ConstantInt::new(128, u128::MAX).value(), u128::MAX);
        assert_eq!(ConstantInt::i32(7).ty(), Type::I32);
    }

    #[test]
    fn test_builder_keeps_order() {
        let mut f = Function::new("f", vec![Type::I32, Type::I32], Type::Void);
        let entry = f.add_block("entry");
        let mut b = IrBuilder::at_end(&mut f, entry).unwrap();
        let x = b.create_xor(Value::Arg(0), Value::Arg(1));
        let c = b.create_icmp(IntPredicate::Eq, x, ConstantInt::i32(0).into());
        f.set_terminator(entry, Terminator::Ret { value: None });

        let Value::Inst(cmp_id) = c else {
            panic!("expected instruction")
        };
        assert_eq!(f.inst_type(cmp_id), Type::I1);
        assert_eq!(f.block(entry).size(), 3);

        // insert before the comparison, after the xor
        let mut b = IrBuilder::new(&mut f, entry, InsertPoint::Before(cmp_id)).unwrap();
        let z = b.create_zext(x, Type::I64);
        assert_eq!(f.value_type(z), Type::I64);
        let order: Vec<_> = f.block(entry).insts.iter().map(|i| i.0).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn test_first_insertion_point_skips_phis() {
        let mut f = Function::new("f", vec![Type::I32], Type::I32);
        let entry = f.add_block("entry");
        let join = f.add_block("join");
        f.set_terminator(entry, Terminator::Br { dest: join });
        assert_eq!(f.first_insertion_point(join), InsertPoint::End);

        let mut b = IrBuilder::at_end(&mut f, join).unwrap();
        let phi = b.create_phi(Type::I32, vec![(Value::Arg(0), entry)]);
        let add = b.create_add(phi, ConstantInt::i32(1).into());
        f.set_terminator(join, Terminator::Ret { value: Some(add) });

        let Value::Inst(add_id) = add else {
            panic!("expected instruction")
        };
        assert_eq!(f.first_insertion_point(join), InsertPoint::Before(add_id));
    }

    #[test]
    fn test_int_cast_directions() {
        let mut f = Function::new("f", vec![Type::I8, Type::I64, Type::I32], Type::Void);
        let entry = f.add_block("entry");
        let mut b = IrBuilder::at_end(&mut f, entry).unwrap();
        let same = b.create_int_cast(Value::Arg(2), Type::I32);
        assert_eq!(same, Value::Arg(2));
        let wide = b.create_int_cast(Value::Arg(0), Type::I32);
        let narrow = b.create_int_cast(Value::Arg(1), Type::I32);
        assert_eq!(f.block(entry).insts.len(), 2);
        assert_eq!(f.value_type(wide), Type::I32);
        assert_eq!(f.value_type(narrow), Type::I32);
    }

    #[test]
    fn test_get_or_insert_and_verify() {
        let mut m = Module::new("m.c");
        let (g0, new0) = m.get_or_insert_global("__afl_prev_loc", Type::I32, true);
        let (g1, new1) = m.get_or_insert_global("__afl_prev_loc", Type::I32, true);
        assert!(new0 && !new1);
        assert_eq!(g0, g1);
        assert!(m.global(g0).thread_local);

        let (hook, _) = m.get_or_insert_function("insert_block", Type::Void, &[Type::I32]);
        let mut f = Function::new("main", vec![], Type::Void);
        let entry = f.add_block("entry");
        IrBuilder::at_end(&mut f, entry)
            .unwrap()
            .create_call(hook, Type::Void, vec![ConstantInt::i32(1).into()]);
        f.set_terminator(entry, Terminator::Ret { value: None });
        m.add_function(f);
        assert!(m.verify().is_ok());

        m.functions[1].set_terminator(entry, Terminator::Br {
            dest: super::BlockId(7),
        });
        assert!(m.verify().is_err());
    }
}
