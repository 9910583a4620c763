use log::debug;

use crate::argument::Argument;
use crate::config::CONFIG;
use crate::error::{Error, Result};
use crate::ops::Operator;
use crate::program::{Parameters, Program};

/// Checks that `params` supplies every declared parameter with exactly its shape.
pub fn check_parameters(program: &Program, params: &Parameters) -> Result<()> {
    for (name, shape) in program.get_parameter_shapes() {
        let arg = params
            .get(name)
            .ok_or_else(|| Error::parameter(name.clone(), "missing"))?;
        if arg.shape() != shape {
            return Err(Error::parameter(
                name.clone(),
                format!("expected {shape}, got {}", arg.shape()),
            ));
        }
        if arg.is_absent() {
            return Err(Error::parameter(name.clone(), "argument has no storage"));
        }
    }
    Ok(())
}

/// Index of the last instruction reading each value, `None` when nothing does.
fn last_uses(program: &Program) -> Vec<Option<usize>> {
    let mut last = vec![None; program.len()];
    for (i, ins) in program.instructions().iter().enumerate() {
        for r in ins.inputs() {
            last[r.index()] = Some(i);
        }
    }
    last
}

/// Executes a compiled program in instruction order and returns the value of the
/// last instruction. Intermediate values are dropped right after their last use,
/// which releases their storage unless a later value shares it.
pub fn run(program: &Program, params: &Parameters) -> Result<Argument> {
    if !program.is_compiled() {
        return Err(Error::UncompiledProgram);
    }
    check_parameters(program, params)?;
    let output = program.output().ok_or(Error::InvalidReference { index: 0, len: 0 })?;
    let last = last_uses(program);
    let mut values: Vec<Option<Argument>> = vec![None; program.len()];
    for (i, ins) in program.instructions().iter().enumerate() {
        let value = match ins.op() {
            Operator::Parameter { name, .. } => params
                .get(name)
                .cloned()
                .ok_or_else(|| Error::parameter(name.clone(), "missing"))?,
            op => {
                let kernel = ins.kernel().ok_or_else(|| Error::Lowering {
                    op: op.name().into(),
                    target: "unbound".into(),
                    reason: format!("instruction @{i} was added after compile"),
                })?;
                let inputs = ins
                    .inputs()
                    .iter()
                    .map(|r| {
                        values[r.index()].clone().ok_or(Error::InvalidReference {
                            index: r.index(),
                            len: i,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                kernel.compute(ins.shape(), &inputs)?
            }
        };
        if CONFIG.trace_eval {
            debug!("@{i} = {} -> {value:?}", ins.op());
        }
        if last[i].is_some() || i == output.index() {
            values[i] = Some(value);
        }
        for r in ins.inputs() {
            if last[r.index()] == Some(i) {
                values[r.index()] = None;
            }
        }
    }
    values[output.index()]
        .take()
        .ok_or(Error::InvalidReference {
            index: output.index(),
            len: program.len(),
        })
}
