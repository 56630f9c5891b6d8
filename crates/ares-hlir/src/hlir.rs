//! HLIR data structures.
//!
//! HLIR is a small construct-level IR: straight-line instruction lists with
//! structured counted loops, plus three parallel constructs (task launch,
//! parallel-for, parallel-reduce) carried as first-class instructions until
//! the lowering pass rewrites them into runtime ABI calls.
//!
//! Loop and task bodies are outlined functions; a body takes the iteration
//! index and a pointer to its captured-environment structure. Mechanical
//! outlining is the frontend's job, not this crate's.

use std::fmt;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// SSA-style value defined by an instruction or a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

// ============================================================================
// Values and operands
// ============================================================================

/// An operand: a defined value, an immediate, or a function reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Ref(ValueId),
    Int(i64),
    Func(FunctionId),
}

impl Value {
    /// The value id this operand reads, if any.
    pub fn ref_id(self) -> Option<ValueId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }
}

/// Binary operators needed for index bookkeeping and reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Min,
    Max,
}

// ============================================================================
// Instructions
// ============================================================================

/// Callee of a `Call` instruction: a function in this module or an external
/// symbol (the runtime ABI entry points are symbols).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Function(FunctionId),
    Symbol(SmolStr),
}

impl Callee {
    pub fn symbol(name: &str) -> Self {
        Callee::Symbol(SmolStr::new(name))
    }
}

/// One HLIR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// `dest = op(lhs, rhs)`
    BinOp {
        dest: ValueId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    /// `dest = base[slot]`, a word-sized field load through a struct
    /// pointer.
    Load {
        dest: ValueId,
        base: Value,
        slot: Value,
    },
    /// `base[slot] = value`
    Store {
        base: Value,
        slot: Value,
        value: Value,
    },
    /// `dest = callee(args...)`; `dest` is absent for void calls.
    Call {
        dest: Option<ValueId>,
        callee: Callee,
        args: Vec<Value>,
    },
    /// Structured counted loop: `for var in [start, end) { body }`.
    Loop {
        var: ValueId,
        start: Value,
        end: Value,
        body: Vec<Instr>,
    },
    /// `return value?`
    Return(Option<Value>),

    /// Parallel construct: launch `callee(args...)` as a task; `dest` is
    /// the future result. Rewritten away by lowering.
    TaskLaunch {
        dest: ValueId,
        callee: FunctionId,
        args: Vec<Value>,
    },
    /// Parallel construct: run `body(index, env)` for each index in
    /// `[start, end)` with `captures` packed into `env`. Rewritten away by
    /// lowering.
    ParallelFor {
        start: Value,
        end: Value,
        body: FunctionId,
        captures: Vec<Value>,
    },
    /// Parallel construct: like `ParallelFor`, but each `body(index, env)`
    /// returns a partial and `combine` folds the partials into `dest`.
    /// Rewritten away by lowering. The range must be non-empty: the
    /// combine fold seeds from the first partial.
    ParallelReduce {
        dest: ValueId,
        start: Value,
        end: Value,
        body: FunctionId,
        captures: Vec<Value>,
        combine: BinOp,
    },
}

impl Instr {
    /// Whether this is one of the parallel constructs the lowering pass
    /// rewrites.
    pub fn is_parallel_construct(&self) -> bool {
        matches!(
            self,
            Instr::TaskLaunch { .. } | Instr::ParallelFor { .. } | Instr::ParallelReduce { .. }
        )
    }
}

// ============================================================================
// Functions and modules
// ============================================================================

/// An HLIR function: named, with positional value-id parameters and a
/// straight-line body.
#[derive(Debug, Clone)]
pub struct HlirFunction {
    pub name: SmolStr,
    pub params: Vec<ValueId>,
    pub body: Vec<Instr>,
}

impl HlirFunction {
    pub fn new(name: impl Into<SmolStr>, params: Vec<ValueId>, body: Vec<Instr>) -> Self {
        Self {
            name: name.into(),
            params,
            body,
        }
    }
}

/// A complete HLIR module.
#[derive(Debug, Clone, Default)]
pub struct HlirModule {
    /// All functions, in registration order.
    functions: IndexMap<FunctionId, HlirFunction>,
    /// Name lookup.
    fn_name_to_id: FxHashMap<SmolStr, FunctionId>,
    next_fn_id: u32,
    next_value_id: u32,
}

impl HlirModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh function id.
    pub fn alloc_fn_id(&mut self) -> FunctionId {
        let id = FunctionId(self.next_fn_id);
        self.next_fn_id += 1;
        id
    }

    /// Allocate a fresh value id.
    pub fn alloc_value_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    /// Register a function under a fresh id.
    pub fn add_function(&mut self, func: HlirFunction) -> FunctionId {
        let id = self.alloc_fn_id();
        self.fn_name_to_id.insert(func.name.clone(), id);
        self.functions.insert(id, func);
        id
    }

    pub fn function(&self, id: FunctionId) -> Option<&HlirFunction> {
        self.functions.get(&id)
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut HlirFunction> {
        self.functions.get_mut(&id)
    }

    /// Look up a function by name.
    pub fn function_by_name(&self, name: &str) -> Option<(FunctionId, &HlirFunction)> {
        let id = *self.fn_name_to_id.get(name)?;
        self.functions.get(&id).map(|f| (id, f))
    }

    /// Iterate functions in registration order.
    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &HlirFunction)> {
        self.functions.iter().map(|(id, f)| (*id, f))
    }

    /// Ids of all functions, in registration order.
    pub fn function_ids(&self) -> Vec<FunctionId> {
        self.functions.keys().copied().collect()
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ref(ValueId(id)) => write!(f, "%{}", id),
            Value::Int(n) => write!(f, "{}", n),
            Value::Func(FunctionId(id)) => write!(f, "@fn{}", id),
        }
    }
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Function(FunctionId(id)) => write!(f, "@fn{}", id),
            Callee::Symbol(name) => write!(f, "@{}", name),
        }
    }
}

impl Instr {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Instr::BinOp { dest, op, lhs, rhs } => {
                writeln!(f, "{}%{} = {:?}({}, {})", pad, dest.0, op, lhs, rhs)
            }
            Instr::Load { dest, base, slot } => {
                writeln!(f, "{}%{} = load {}[{}]", pad, dest.0, base, slot)
            }
            Instr::Store { base, slot, value } => {
                writeln!(f, "{}store {}[{}] = {}", pad, base, slot, value)
            }
            Instr::Call { dest, callee, args } => {
                write!(f, "{}", pad)?;
                if let Some(dest) = dest {
                    write!(f, "%{} = ", dest.0)?;
                }
                write!(f, "call {}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                writeln!(f, ")")
            }
            Instr::Loop {
                var,
                start,
                end,
                body,
            } => {
                writeln!(f, "{}for %{} in [{}, {}) {{", pad, var.0, start, end)?;
                for instr in body {
                    instr.fmt_indented(f, indent + 1)?;
                }
                writeln!(f, "{}}}", pad)
            }
            Instr::Return(value) => match value {
                Some(v) => writeln!(f, "{}ret {}", pad, v),
                None => writeln!(f, "{}ret", pad),
            },
            Instr::TaskLaunch { dest, callee, args } => {
                write!(f, "{}%{} = task_launch @fn{}(", pad, dest.0, callee.0)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                writeln!(f, ")")
            }
            Instr::ParallelFor {
                start, end, body, ..
            } => writeln!(
                f,
                "{}parallel_for [{}, {}) body=@fn{}",
                pad, start, end, body.0
            ),
            Instr::ParallelReduce {
                dest,
                start,
                end,
                body,
                combine,
                ..
            } => writeln!(
                f,
                "{}%{} = parallel_reduce {:?} [{}, {}) body=@fn{}",
                pad, dest.0, combine, start, end, body.0
            ),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl fmt::Display for HlirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}", p.0)?;
        }
        writeln!(f, ") {{")?;
        for instr in &self.body {
            instr.fmt_indented(f, 1)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for HlirModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, func) in self.functions() {
            writeln!(f, "{}", func)?;
        }
        Ok(())
    }
}
