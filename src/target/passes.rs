use log::debug;

use super::Pass;
use crate::error::Result;
use crate::ops::Operator;
use crate::program::Program;

/// Drops instructions the output does not depend on. Parameters stay declared.
#[derive(Clone, Copy, Debug, Default)]
pub struct EliminateDeadCode;

impl Pass for EliminateDeadCode {
    fn name(&self) -> &'static str {
        "eliminate_dead_code"
    }

    fn apply(&self, program: &mut Program) -> Result<()> {
        let Some(output) = program.output() else {
            return Ok(());
        };
        let mut live = vec![false; program.len()];
        live[output.index()] = true;
        for (i, ins) in program.instructions().iter().enumerate().rev() {
            if live[i] {
                for r in ins.inputs() {
                    live[r.index()] = true;
                }
            }
        }
        let before = program.len();
        program.rebuild(|p, old, ins| {
            if live[old.index()] || ins.is_parameter() {
                Ok(Some(p.push(ins)))
            } else {
                Ok(None)
            }
        })?;
        debug!("{}: removed {}", self.name(), before - program.len());
        Ok(())
    }
}

/// Inserts `contiguous` ahead of every non-standard input of the operators selected
/// by `needs`. Reshape always gets a standard input, since it only reinterprets
/// row-major storage.
#[derive(Clone, Copy, Debug)]
pub struct InsertContiguous {
    pub needs: fn(&Operator) -> bool,
}

impl InsertContiguous {
    pub fn new(needs: fn(&Operator) -> bool) -> Self {
        Self { needs }
    }
}

impl Pass for InsertContiguous {
    fn name(&self) -> &'static str {
        "insert_contiguous"
    }

    fn apply(&self, program: &mut Program) -> Result<()> {
        let needs = self.needs;
        program.rebuild(|p, _, ins| {
            if !needs(ins.op()) && !matches!(ins.op(), Operator::Reshape { .. }) {
                return Ok(Some(p.push(ins)));
            }
            let mut inputs = Vec::with_capacity(ins.inputs().len());
            for &r in ins.inputs() {
                if p.get(r)?.shape().standard() {
                    inputs.push(r);
                } else {
                    inputs.push(p.add_instruction(Operator::Contiguous, &[r])?);
                }
            }
            Ok(Some(p.push(ins.with_inputs(inputs))))
        })
    }
}

/// Moves literals and parameters to the device right after they are produced,
/// and, with `offload_copy`, brings the output back to the host at the end.
#[derive(Clone, Copy, Debug)]
pub struct InsertTransfers {
    pub offload_copy: bool,
}

impl Pass for InsertTransfers {
    fn name(&self) -> &'static str {
        "insert_transfers"
    }

    fn apply(&self, program: &mut Program) -> Result<()> {
        program.rebuild(|p, _, ins| {
            let host = matches!(ins.op(), Operator::Literal(_) | Operator::Parameter { .. });
            let r = p.push(ins);
            if host {
                Ok(Some(p.add_instruction(Operator::HostToDevice, &[r])?))
            } else {
                Ok(Some(r))
            }
        })?;
        if let (true, Some(output)) = (self.offload_copy, program.output()) {
            program.add_instruction(Operator::DeviceToHost, &[output])?;
        }
        Ok(())
    }
}
