//! Lowering passes: rewrite parallel constructs into runtime ABI calls.
//!
//! Each construct becomes a sequence of calls against the `__ares_*` entry
//! points, plus a generated trampoline function that bridges the runtime's
//! envelope layout to the user-written body:
//!
//! - **Task launch**: allocate an argument/return structure, queue a
//!   generated wrapper, and at the first use of the result insert an await
//!   followed by a load of the stored return value.
//! - **Parallel-for**: pack captures into a heap environment, create a
//!   latch sized to the iteration count, queue the body trampoline once per
//!   index, then await the latch before the merge point.
//! - **Parallel-reduce**: dispatch like parallel-for, but each trampoline
//!   stores its body's partial result into a per-construct partials array;
//!   after the await, a sequential combine loop folds the partials into the
//!   final value.
//!
//! Lowered code reads shared captured state only before dispatch or after
//! the await point; the latch is the only ordering primitive.

use smol_str::{format_smolstr, SmolStr};
use thiserror::Error;

use crate::hlir::{BinOp, Callee, FunctionId, HlirFunction, HlirModule, Instr, Value, ValueId};

/// Runtime ABI symbols the lowered code calls into.
pub mod abi {
    pub const CREATE_SYNCH: &str = "__ares_create_synch";
    pub const QUEUE_FUNC: &str = "__ares_queue_func";
    pub const FINISH_FUNC: &str = "__ares_finish_func";
    pub const AWAIT_SYNCH: &str = "__ares_await_synch";
    pub const ALLOC: &str = "__ares_alloc";
    pub const TASK_QUEUE: &str = "__ares_task_queue";
    pub const TASK_AWAIT_FUTURE: &str = "__ares_task_await_future";
    pub const TASK_RELEASE_FUTURE: &str = "__ares_task_release_future";
}

/// Every struct slot is one machine word.
const WORD: i64 = 8;

// Work envelope slots (latch ptr, index, captured-args ptr).
const ENV_INDEX_SLOT: i64 = 1;
const ENV_ARGS_SLOT: i64 = 2;

// Task argument structure slots: latch ptr, depth, return value, then the
// actual parameters.
const TASK_DEPTH_SLOT: i64 = 1;
const TASK_RET_SLOT: i64 = 2;
const TASK_PARAMS_BASE: i64 = 3;

/// Priority lane for parallel loop bodies.
const LOOP_BODY_PRIORITY: i64 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    /// A construct names a body or callee the module does not define.
    #[error("parallel construct references unknown function @fn{}", (.0).0)]
    UnknownFunction(FunctionId),

    /// A parallel-reduce over a range known to be empty at lowering time;
    /// the combine step would fold uninitialized partials.
    #[error("parallel-reduce over statically empty range [{start}, {end})")]
    EmptyReduceRange { start: i64, end: i64 },
}

/// Counts of constructs rewritten by one `lower_module` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowerReport {
    pub task_launches: usize,
    pub parallel_fors: usize,
    pub parallel_reduces: usize,
}

impl LowerReport {
    pub fn total(&self) -> usize {
        self.task_launches + self.parallel_fors + self.parallel_reduces
    }
}

/// Rewrite every parallel construct in the module into runtime ABI calls.
///
/// Generated trampolines and wrappers are appended to the module. After a
/// successful run no construct instruction remains.
pub fn lower_module(module: &mut HlirModule) -> Result<LowerReport, LowerError> {
    let mut report = LowerReport::default();
    for id in module.function_ids() {
        let body = match module.function_mut(id) {
            Some(func) => std::mem::take(&mut func.body),
            None => continue,
        };
        let lowered = lower_instrs(module, body, &mut report)?;
        if let Some(func) = module.function_mut(id) {
            func.body = lowered;
        }
    }
    Ok(report)
}

/// A queued task whose await point has not been placed yet.
struct PendingAwait {
    /// The construct's result value.
    result: ValueId,
    /// The argument/return structure passed to `task_queue`.
    args_struct: ValueId,
}

fn lower_instrs(
    module: &mut HlirModule,
    instrs: Vec<Instr>,
    report: &mut LowerReport,
) -> Result<Vec<Instr>, LowerError> {
    let mut out = Vec::with_capacity(instrs.len());
    let mut pending: Vec<PendingAwait> = Vec::new();

    for instr in instrs {
        // A use of a pending task result anywhere in this instruction
        // (operands, captures, loop bodies) forces the task here. For
        // loops that means before the loop, never inside it, since
        // awaiting is once-only.
        flush_awaits_before(&mut out, &mut pending, &instr);
        match instr {
            Instr::TaskLaunch { dest, callee, args } => {
                let args_struct = emit_task_launch(module, &mut out, callee, args)?;
                report.task_launches += 1;
                pending.push(PendingAwait {
                    result: dest,
                    args_struct,
                });
            }
            Instr::ParallelFor {
                start,
                end,
                body,
                captures,
            } => {
                emit_parallel_loop(module, &mut out, start, end, body, captures, None)?;
                report.parallel_fors += 1;
            }
            Instr::ParallelReduce {
                dest,
                start,
                end,
                body,
                captures,
                combine,
            } => {
                emit_parallel_loop(
                    module,
                    &mut out,
                    start,
                    end,
                    body,
                    captures,
                    Some((dest, combine)),
                )?;
                report.parallel_reduces += 1;
            }
            Instr::Loop {
                var,
                start,
                end,
                body,
            } => {
                let body = lower_instrs(module, body, report)?;
                out.push(Instr::Loop {
                    var,
                    start,
                    end,
                    body,
                });
            }
            other => out.push(other),
        }
    }

    // Unused futures are still awaited at the end of the list, so the
    // argument structure is not freed out from under a running task. A
    // trailing return stays last.
    if !pending.is_empty() {
        let tail = match out.last() {
            Some(Instr::Return(_)) => out.pop(),
            _ => None,
        };
        for p in pending.drain(..) {
            push_await(&mut out, &p);
        }
        if let Some(ret) = tail {
            out.push(ret);
        }
    }

    Ok(out)
}

/// Emit the await + result load for any pending task whose result `instr`
/// reads.
fn flush_awaits_before(out: &mut Vec<Instr>, pending: &mut Vec<PendingAwait>, instr: &Instr) {
    let mut i = 0;
    while i < pending.len() {
        if instr_uses(instr, pending[i].result) {
            let p = pending.remove(i);
            push_await(out, &p);
        } else {
            i += 1;
        }
    }
}

fn push_await(out: &mut Vec<Instr>, p: &PendingAwait) {
    out.push(Instr::Call {
        dest: None,
        callee: Callee::symbol(abi::TASK_AWAIT_FUTURE),
        args: vec![Value::Ref(p.args_struct)],
    });
    // Loading into the construct's own result id keeps every existing use
    // valid without renaming.
    out.push(Instr::Load {
        dest: p.result,
        base: Value::Ref(p.args_struct),
        slot: Value::Int(TASK_RET_SLOT),
    });
}

/// Does `instr` (recursively) read `value`?
fn instr_uses(instr: &Instr, value: ValueId) -> bool {
    let reads = |v: &Value| v.ref_id() == Some(value);
    match instr {
        Instr::BinOp { lhs, rhs, .. } => reads(lhs) || reads(rhs),
        Instr::Load { base, slot, .. } => reads(base) || reads(slot),
        Instr::Store {
            base,
            slot,
            value: v,
        } => reads(base) || reads(slot) || reads(v),
        Instr::Call { args, .. } => args.iter().any(reads),
        Instr::Loop {
            start, end, body, ..
        } => reads(start) || reads(end) || body.iter().any(|i| instr_uses(i, value)),
        Instr::Return(v) => v.as_ref().is_some_and(|v| reads(v)),
        Instr::TaskLaunch { args, .. } => args.iter().any(reads),
        Instr::ParallelFor {
            start,
            end,
            captures,
            ..
        } => reads(start) || reads(end) || captures.iter().any(reads),
        Instr::ParallelReduce {
            start,
            end,
            captures,
            ..
        } => reads(start) || reads(end) || captures.iter().any(reads),
    }
}

/// Emit the dispatch side of a task launch; returns the argument structure
/// value for the later await.
fn emit_task_launch(
    module: &mut HlirModule,
    out: &mut Vec<Instr>,
    callee: FunctionId,
    args: Vec<Value>,
) -> Result<ValueId, LowerError> {
    let callee_name = module
        .function(callee)
        .map(|f| f.name.clone())
        .ok_or(LowerError::UnknownFunction(callee))?;

    let args_struct = module.alloc_value_id();
    out.push(Instr::Call {
        dest: Some(args_struct),
        callee: Callee::symbol(abi::ALLOC),
        args: vec![Value::Int((TASK_PARAMS_BASE + args.len() as i64) * WORD)],
    });
    out.push(Instr::Store {
        base: Value::Ref(args_struct),
        slot: Value::Int(TASK_DEPTH_SLOT),
        value: Value::Int(0),
    });
    for (i, arg) in args.iter().enumerate() {
        out.push(Instr::Store {
            base: Value::Ref(args_struct),
            slot: Value::Int(TASK_PARAMS_BASE + i as i64),
            value: *arg,
        });
    }

    let wrapper = generate_task_wrapper(module, callee, &callee_name, args.len());
    out.push(Instr::Call {
        dest: None,
        callee: Callee::symbol(abi::TASK_QUEUE),
        args: vec![Value::Func(wrapper), Value::Ref(args_struct)],
    });
    Ok(args_struct)
}

/// Generate `wrapper(args_struct)`: unpack parameters, call the task body,
/// store the return value, release the future.
fn generate_task_wrapper(
    module: &mut HlirModule,
    callee: FunctionId,
    callee_name: &SmolStr,
    arity: usize,
) -> FunctionId {
    let env = module.alloc_value_id();
    let mut body = Vec::with_capacity(arity + 4);

    let mut params = Vec::with_capacity(arity);
    for i in 0..arity {
        let v = module.alloc_value_id();
        body.push(Instr::Load {
            dest: v,
            base: Value::Ref(env),
            slot: Value::Int(TASK_PARAMS_BASE + i as i64),
        });
        params.push(Value::Ref(v));
    }

    let ret = module.alloc_value_id();
    body.push(Instr::Call {
        dest: Some(ret),
        callee: Callee::Function(callee),
        args: params,
    });
    body.push(Instr::Store {
        base: Value::Ref(env),
        slot: Value::Int(TASK_RET_SLOT),
        value: Value::Ref(ret),
    });
    body.push(Instr::Call {
        dest: None,
        callee: Callee::symbol(abi::TASK_RELEASE_FUTURE),
        args: vec![Value::Ref(env)],
    });
    body.push(Instr::Return(None));

    module.add_function(HlirFunction::new(
        format_smolstr!("__ares_task_wrap_{}", callee_name),
        vec![env],
        body,
    ))
}

// Environment layout for reduce bodies: partials array pointer, range
// start, then the captures. Plain parallel-for packs captures from slot 0.
const REDUCE_ENV_PARTIALS_SLOT: i64 = 0;
const REDUCE_ENV_START_SLOT: i64 = 1;
const REDUCE_ENV_CAPTURES_BASE: i64 = 2;

/// Emit dispatch + await for parallel-for, and additionally the partials
/// array and combine loop when `reduce` is present.
#[allow(clippy::too_many_arguments)]
fn emit_parallel_loop(
    module: &mut HlirModule,
    out: &mut Vec<Instr>,
    start: Value,
    end: Value,
    body_fn: FunctionId,
    captures: Vec<Value>,
    reduce: Option<(ValueId, BinOp)>,
) -> Result<(), LowerError> {
    let body_name = module
        .function(body_fn)
        .map(|f| f.name.clone())
        .ok_or(LowerError::UnknownFunction(body_fn))?;

    // The combine loop seeds its accumulator from partials[0], so a reduce
    // needs at least one iteration. Constant bounds are checked here;
    // runtime bounds are the frontend's precondition.
    if reduce.is_some() {
        if let (Value::Int(s), Value::Int(e)) = (start, end) {
            if e <= s {
                return Err(LowerError::EmptyReduceRange { start: s, end: e });
            }
        }
    }

    let n = module.alloc_value_id();
    out.push(Instr::BinOp {
        dest: n,
        op: BinOp::Sub,
        lhs: end,
        rhs: start,
    });

    // Reduce bodies write their partial into a word-per-iteration array.
    let partials = match reduce {
        Some(_) => {
            let bytes = module.alloc_value_id();
            out.push(Instr::BinOp {
                dest: bytes,
                op: BinOp::Mul,
                lhs: Value::Ref(n),
                rhs: Value::Int(WORD),
            });
            let partials = module.alloc_value_id();
            out.push(Instr::Call {
                dest: Some(partials),
                callee: Callee::symbol(abi::ALLOC),
                args: vec![Value::Ref(bytes)],
            });
            Some(partials)
        }
        None => None,
    };

    // Captured outer-scope values move into a heap environment; the body
    // reads them back through its envelope's args pointer.
    let captures_base = if reduce.is_some() {
        REDUCE_ENV_CAPTURES_BASE
    } else {
        0
    };
    let env = module.alloc_value_id();
    out.push(Instr::Call {
        dest: Some(env),
        callee: Callee::symbol(abi::ALLOC),
        args: vec![Value::Int((captures_base + captures.len() as i64) * WORD)],
    });
    if let Some(partials) = partials {
        out.push(Instr::Store {
            base: Value::Ref(env),
            slot: Value::Int(REDUCE_ENV_PARTIALS_SLOT),
            value: Value::Ref(partials),
        });
        out.push(Instr::Store {
            base: Value::Ref(env),
            slot: Value::Int(REDUCE_ENV_START_SLOT),
            value: start,
        });
    }
    for (i, capture) in captures.iter().enumerate() {
        out.push(Instr::Store {
            base: Value::Ref(env),
            slot: Value::Int(captures_base + i as i64),
            value: *capture,
        });
    }

    let synch = module.alloc_value_id();
    out.push(Instr::Call {
        dest: Some(synch),
        callee: Callee::symbol(abi::CREATE_SYNCH),
        args: vec![Value::Ref(n)],
    });

    let trampoline = match reduce {
        Some(_) => generate_reduce_trampoline(module, body_fn, &body_name),
        None => generate_for_trampoline(module, body_fn, &body_name),
    };

    let idx = module.alloc_value_id();
    out.push(Instr::Loop {
        var: idx,
        start,
        end,
        body: vec![Instr::Call {
            dest: None,
            callee: Callee::symbol(abi::QUEUE_FUNC),
            args: vec![
                Value::Ref(synch),
                Value::Func(trampoline),
                Value::Ref(env),
                Value::Ref(idx),
                Value::Int(LOOP_BODY_PRIORITY),
            ],
        }],
    });

    out.push(Instr::Call {
        dest: None,
        callee: Callee::symbol(abi::AWAIT_SYNCH),
        args: vec![Value::Ref(synch)],
    });

    if let (Some((dest, combine)), Some(partials)) = (reduce, partials) {
        emit_combine_loop(module, out, dest, combine, partials, n);
    }
    Ok(())
}

/// Generate the parallel-for trampoline: unpack the work envelope, run the
/// body, count down the latch.
fn generate_for_trampoline(
    module: &mut HlirModule,
    body_fn: FunctionId,
    body_name: &SmolStr,
) -> FunctionId {
    let envelope = module.alloc_value_id();
    let idx = module.alloc_value_id();
    let args = module.alloc_value_id();

    let body = vec![
        Instr::Load {
            dest: idx,
            base: Value::Ref(envelope),
            slot: Value::Int(ENV_INDEX_SLOT),
        },
        Instr::Load {
            dest: args,
            base: Value::Ref(envelope),
            slot: Value::Int(ENV_ARGS_SLOT),
        },
        Instr::Call {
            dest: None,
            callee: Callee::Function(body_fn),
            args: vec![Value::Ref(idx), Value::Ref(args)],
        },
        Instr::Call {
            dest: None,
            callee: Callee::symbol(abi::FINISH_FUNC),
            args: vec![Value::Ref(envelope)],
        },
        Instr::Return(None),
    ];

    module.add_function(HlirFunction::new(
        format_smolstr!("__ares_par_body_{}", body_name),
        vec![envelope],
        body,
    ))
}

/// Reduce variant of the trampoline: also stores the body's partial result
/// into `partials[index - start]` before counting down.
fn generate_reduce_trampoline(
    module: &mut HlirModule,
    body_fn: FunctionId,
    body_name: &SmolStr,
) -> FunctionId {
    let envelope = module.alloc_value_id();
    let idx = module.alloc_value_id();
    let args = module.alloc_value_id();
    let partials = module.alloc_value_id();
    let range_start = module.alloc_value_id();
    let rel = module.alloc_value_id();
    let partial = module.alloc_value_id();

    let body = vec![
        Instr::Load {
            dest: idx,
            base: Value::Ref(envelope),
            slot: Value::Int(ENV_INDEX_SLOT),
        },
        Instr::Load {
            dest: args,
            base: Value::Ref(envelope),
            slot: Value::Int(ENV_ARGS_SLOT),
        },
        Instr::Load {
            dest: partials,
            base: Value::Ref(args),
            slot: Value::Int(REDUCE_ENV_PARTIALS_SLOT),
        },
        Instr::Load {
            dest: range_start,
            base: Value::Ref(args),
            slot: Value::Int(REDUCE_ENV_START_SLOT),
        },
        Instr::Call {
            dest: Some(partial),
            callee: Callee::Function(body_fn),
            args: vec![Value::Ref(idx), Value::Ref(args)],
        },
        Instr::BinOp {
            dest: rel,
            op: BinOp::Sub,
            lhs: Value::Ref(idx),
            rhs: Value::Ref(range_start),
        },
        Instr::Store {
            base: Value::Ref(partials),
            slot: Value::Ref(rel),
            value: Value::Ref(partial),
        },
        Instr::Call {
            dest: None,
            callee: Callee::symbol(abi::FINISH_FUNC),
            args: vec![Value::Ref(envelope)],
        },
        Instr::Return(None),
    ];

    module.add_function(HlirFunction::new(
        format_smolstr!("__ares_reduce_body_{}", body_name),
        vec![envelope],
        body,
    ))
}

/// Sequential fold of the partials array into the construct's result, run
/// by the awaiting thread after latch satisfaction.
fn emit_combine_loop(
    module: &mut HlirModule,
    out: &mut Vec<Instr>,
    dest: ValueId,
    combine: BinOp,
    partials: ValueId,
    n: ValueId,
) {
    // A one-word accumulator cell carries the running value across loop
    // iterations.
    let cell = module.alloc_value_id();
    out.push(Instr::Call {
        dest: Some(cell),
        callee: Callee::symbol(abi::ALLOC),
        args: vec![Value::Int(WORD)],
    });
    let first = module.alloc_value_id();
    out.push(Instr::Load {
        dest: first,
        base: Value::Ref(partials),
        slot: Value::Int(0),
    });
    out.push(Instr::Store {
        base: Value::Ref(cell),
        slot: Value::Int(0),
        value: Value::Ref(first),
    });

    let j = module.alloc_value_id();
    let acc = module.alloc_value_id();
    let pj = module.alloc_value_id();
    let folded = module.alloc_value_id();
    out.push(Instr::Loop {
        var: j,
        start: Value::Int(1),
        end: Value::Ref(n),
        body: vec![
            Instr::Load {
                dest: acc,
                base: Value::Ref(cell),
                slot: Value::Int(0),
            },
            Instr::Load {
                dest: pj,
                base: Value::Ref(partials),
                slot: Value::Ref(j),
            },
            Instr::BinOp {
                dest: folded,
                op: combine,
                lhs: Value::Ref(acc),
                rhs: Value::Ref(pj),
            },
            Instr::Store {
                base: Value::Ref(cell),
                slot: Value::Int(0),
                value: Value::Ref(folded),
            },
        ],
    });

    out.push(Instr::Load {
        dest,
        base: Value::Ref(cell),
        slot: Value::Int(0),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call_symbols(instrs: &[Instr]) -> Vec<String> {
        let mut symbols = Vec::new();
        collect_symbols(instrs, &mut symbols);
        symbols
    }

    fn collect_symbols(instrs: &[Instr], symbols: &mut Vec<String>) {
        for instr in instrs {
            match instr {
                Instr::Call {
                    callee: Callee::Symbol(name),
                    ..
                } => symbols.push(name.to_string()),
                Instr::Loop { body, .. } => collect_symbols(body, symbols),
                _ => {}
            }
        }
    }

    /// `fn double(x) { ret x }` as a stand-in task body.
    fn add_leaf(module: &mut HlirModule, name: &str) -> FunctionId {
        let x = module.alloc_value_id();
        module.add_function(HlirFunction::new(
            name,
            vec![x],
            vec![Instr::Return(Some(Value::Ref(x)))],
        ))
    }

    #[test]
    fn test_task_launch_emits_protocol_sequence() {
        let mut module = HlirModule::new();
        let double = add_leaf(&mut module, "double");

        let result = module.alloc_value_id();
        let main = module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![
                Instr::TaskLaunch {
                    dest: result,
                    callee: double,
                    args: vec![Value::Int(21)],
                },
                Instr::Return(Some(Value::Ref(result))),
            ],
        ));

        let report = lower_module(&mut module).unwrap();
        assert_eq!(report.task_launches, 1);

        let body = &module.function(main).unwrap().body;
        assert_eq!(
            call_symbols(body),
            vec![abi::ALLOC, abi::TASK_QUEUE, abi::TASK_AWAIT_FUTURE]
        );
        assert!(body.iter().all(|i| !i.is_parallel_construct()));

        // The await/load pair sits right before the use of the result.
        match &body[body.len() - 2] {
            Instr::Load { dest, slot, .. } => {
                assert_eq!(*dest, result);
                assert_eq!(*slot, Value::Int(TASK_RET_SLOT));
            }
            other => panic!("expected result load before return, got {:?}", other),
        }
    }

    #[test]
    fn test_task_wrapper_releases_future() {
        let mut module = HlirModule::new();
        let double = add_leaf(&mut module, "double");
        let result = module.alloc_value_id();
        module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::TaskLaunch {
                dest: result,
                callee: double,
                args: vec![Value::Int(21)],
            }],
        ));

        lower_module(&mut module).unwrap();

        let (_, wrapper) = module.function_by_name("__ares_task_wrap_double").unwrap();
        let symbols = call_symbols(&wrapper.body);
        assert_eq!(symbols, vec![abi::TASK_RELEASE_FUTURE]);
        // Parameter load, callee call, return store, release, ret.
        assert_eq!(wrapper.body.len(), 5);
    }

    #[test]
    fn test_unused_task_result_still_awaited() {
        let mut module = HlirModule::new();
        let double = add_leaf(&mut module, "double");
        let result = module.alloc_value_id();
        let main = module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![
                Instr::TaskLaunch {
                    dest: result,
                    callee: double,
                    args: vec![Value::Int(1)],
                },
                Instr::Return(None),
            ],
        ));

        lower_module(&mut module).unwrap();

        let body = &module.function(main).unwrap().body;
        assert!(call_symbols(body).contains(&abi::TASK_AWAIT_FUTURE.to_string()));
        assert!(matches!(body.last(), Some(Instr::Return(None))));
    }

    #[test]
    fn test_parallel_for_emits_latch_protocol() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "body");
        let capture = module.alloc_value_id();
        let main = module.add_function(HlirFunction::new(
            "main",
            vec![capture],
            vec![
                Instr::ParallelFor {
                    start: Value::Int(0),
                    end: Value::Int(8),
                    body: body_fn,
                    captures: vec![Value::Ref(capture)],
                },
                Instr::Return(None),
            ],
        ));

        let report = lower_module(&mut module).unwrap();
        assert_eq!(report.parallel_fors, 1);

        let body = &module.function(main).unwrap().body;
        assert_eq!(
            call_symbols(body),
            vec![abi::ALLOC, abi::CREATE_SYNCH, abi::QUEUE_FUNC, abi::AWAIT_SYNCH]
        );

        // Dispatch happens inside a counted loop at the loop-body priority.
        let queue_call = body.iter().find_map(|i| match i {
            Instr::Loop { body, .. } => body.first(),
            _ => None,
        });
        match queue_call {
            Some(Instr::Call { args, .. }) => {
                assert_eq!(args.len(), 5);
                assert_eq!(args[4], Value::Int(LOOP_BODY_PRIORITY));
            }
            other => panic!("expected queue call in dispatch loop, got {:?}", other),
        }
    }

    #[test]
    fn test_for_trampoline_finishes_envelope() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "body");
        module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::ParallelFor {
                start: Value::Int(0),
                end: Value::Int(2),
                body: body_fn,
                captures: vec![],
            }],
        ));

        lower_module(&mut module).unwrap();

        let (_, tramp) = module.function_by_name("__ares_par_body_body").unwrap();
        assert_eq!(call_symbols(&tramp.body), vec![abi::FINISH_FUNC]);
    }

    #[test]
    fn test_parallel_reduce_emits_partials_and_combine() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "square");
        let result = module.alloc_value_id();
        let main = module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![
                Instr::ParallelReduce {
                    dest: result,
                    start: Value::Int(0),
                    end: Value::Int(4),
                    body: body_fn,
                    captures: vec![],
                    combine: BinOp::Add,
                },
                Instr::Return(Some(Value::Ref(result))),
            ],
        ));

        let report = lower_module(&mut module).unwrap();
        assert_eq!(report.parallel_reduces, 1);

        let body = &module.function(main).unwrap().body;
        // Two allocations before dispatch (partials, env), one after the
        // await (the combine accumulator cell).
        assert_eq!(
            call_symbols(body),
            vec![
                abi::ALLOC,
                abi::ALLOC,
                abi::CREATE_SYNCH,
                abi::QUEUE_FUNC,
                abi::AWAIT_SYNCH,
                abi::ALLOC
            ]
        );

        // The combine loop folds with the construct's operator and the
        // result is defined by the final load.
        let combine_loop = body
            .iter()
            .skip_while(|i| !matches!(i, Instr::Call { callee: Callee::Symbol(s), .. } if s.as_str() == abi::AWAIT_SYNCH))
            .find_map(|i| match i {
                Instr::Loop { body, .. } => Some(body),
                _ => None,
            })
            .unwrap();
        assert!(combine_loop
            .iter()
            .any(|i| matches!(i, Instr::BinOp { op: BinOp::Add, .. })));
        assert!(matches!(
            &body[body.len() - 2],
            Instr::Load { dest, .. } if *dest == result
        ));
    }

    #[test]
    fn test_reduce_trampoline_stores_partial_before_countdown() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "square");
        let result = module.alloc_value_id();
        module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::ParallelReduce {
                dest: result,
                start: Value::Int(0),
                end: Value::Int(4),
                body: body_fn,
                captures: vec![],
                combine: BinOp::Add,
            }],
        ));

        lower_module(&mut module).unwrap();

        let (_, tramp) = module.function_by_name("__ares_reduce_body_square").unwrap();
        let store_pos = tramp
            .body
            .iter()
            .position(|i| matches!(i, Instr::Store { .. }))
            .unwrap();
        let finish_pos = tramp
            .body
            .iter()
            .position(
                |i| matches!(i, Instr::Call { callee: Callee::Symbol(s), .. } if s.as_str() == abi::FINISH_FUNC),
            )
            .unwrap();
        assert!(store_pos < finish_pos);
    }

    #[test]
    fn test_statically_empty_reduce_rejected() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "square");
        let result = module.alloc_value_id();
        module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::ParallelReduce {
                dest: result,
                start: Value::Int(4),
                end: Value::Int(4),
                body: body_fn,
                captures: vec![],
                combine: BinOp::Add,
            }],
        ));

        assert_eq!(
            lower_module(&mut module),
            Err(LowerError::EmptyReduceRange { start: 4, end: 4 })
        );
    }

    #[test]
    fn test_unknown_body_function_rejected() {
        let mut module = HlirModule::new();
        module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::ParallelFor {
                start: Value::Int(0),
                end: Value::Int(4),
                body: FunctionId(99),
                captures: vec![],
            }],
        ));

        assert_eq!(
            lower_module(&mut module),
            Err(LowerError::UnknownFunction(FunctionId(99)))
        );
    }

    #[test]
    fn test_constructs_inside_loops_are_lowered() {
        let mut module = HlirModule::new();
        let body_fn = add_leaf(&mut module, "body");
        let i = module.alloc_value_id();
        let main = module.add_function(HlirFunction::new(
            "main",
            vec![],
            vec![Instr::Loop {
                var: i,
                start: Value::Int(0),
                end: Value::Int(3),
                body: vec![Instr::ParallelFor {
                    start: Value::Int(0),
                    end: Value::Int(4),
                    body: body_fn,
                    captures: vec![],
                }],
            }],
        ));

        let report = lower_module(&mut module).unwrap();
        assert_eq!(report.parallel_fors, 1);

        fn no_constructs(instrs: &[Instr]) -> bool {
            instrs.iter().all(|i| match i {
                Instr::Loop { body, .. } => no_constructs(body),
                other => !other.is_parallel_construct(),
            })
        }
        assert!(no_constructs(&module.function(main).unwrap().body));
    }
}
