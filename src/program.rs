use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, error};

use crate::argument::Argument;
use crate::config::CONFIG;
use crate::error::{Error, Result};
use crate::literal::Literal;
use crate::ops::Operator;
use crate::shape::Shape;
use crate::target::{Kernel, Target};

/// Runtime values for a program's parameters, by name.
pub type Parameters = HashMap<String, Argument>;

/// Position of an instruction in its program. Inputs always point backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionRef(usize);

impl InstructionRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl core::fmt::Display for InstructionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    op: Operator,
    inputs: Vec<InstructionRef>,
    shape: Shape,
    kernel: Option<Box<dyn Kernel>>,
}

impl Instruction {
    pub fn op(&self) -> &Operator {
        &self.op
    }

    pub fn inputs(&self) -> &[InstructionRef] {
        &self.inputs
    }

    /// Output shape, fixed when the instruction was added.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Kernel bound by the target, once compiled. Parameters have none.
    pub fn kernel(&self) -> Option<&dyn Kernel> {
        self.kernel.as_deref()
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.op, Operator::Parameter { .. })
    }

    pub(crate) fn with_inputs(mut self, inputs: Vec<InstructionRef>) -> Self {
        self.inputs = inputs;
        self
    }
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.inputs == other.inputs
            && self.shape == other.shape
            && self.kernel.as_ref().map(|k| k.name()) == other.kernel.as_ref().map(|k| k.name())
    }
}

/// Instruction graph. Instructions live in an arena in insertion order, which is
/// also a topological order; the last instruction is the output.
#[derive(Clone, Debug, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
    parameters: BTreeMap<String, Shape>,
    target: Option<Arc<dyn Target>>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a constant. On a compiled program the literal is bound to the
    /// target's kernel right away, so it evaluates like any other output.
    pub fn add_literal(&mut self, literal: Literal) -> InstructionRef {
        let shape = literal.shape().clone();
        let r = self.push(Instruction {
            op: Operator::Literal(literal),
            inputs: vec![],
            shape,
            kernel: None,
        });
        if let Some(target) = self.target.clone() {
            match target.bind(self, r) {
                Ok(kernel) => self.instructions[r.0].kernel = Some(kernel),
                Err(e) => error!("binding literal {r} for {}: {e}", target.name()),
            }
        }
        r
    }

    pub fn add_parameter<S: Into<String>>(&mut self, name: S, shape: Shape) -> Result<InstructionRef> {
        let name = name.into();
        self.check_open("@param")?;
        if self.parameters.contains_key(&name) {
            return Err(Error::parameter(name, "declared twice"));
        }
        self.parameters.insert(name.clone(), shape.clone());
        Ok(self.push(Instruction {
            op: Operator::Parameter {
                name,
                shape: shape.clone(),
            },
            inputs: vec![],
            shape,
            kernel: None,
        }))
    }

    /// Appends `op` applied to `inputs`. The output shape is inferred here, and a
    /// rejected instruction leaves the program unchanged.
    pub fn add_instruction(&mut self, op: Operator, inputs: &[InstructionRef]) -> Result<InstructionRef> {
        if let Operator::Parameter { name, .. } = &op {
            return Err(Error::parameter(
                name.clone(),
                "parameters are declared with add_parameter",
            ));
        }
        self.check_open(op.name())?;
        let shapes = inputs
            .iter()
            .map(|r| self.get(*r).map(|i| i.shape.clone()))
            .collect::<Result<Vec<_>>>()?;
        let shape = op.compute_shape(&shapes)?;
        Ok(self.push(Instruction {
            op,
            inputs: inputs.to_vec(),
            shape,
            kernel: None,
        }))
    }

    pub fn get(&self, r: InstructionRef) -> Result<&Instruction> {
        self.instructions.get(r.0).ok_or(Error::InvalidReference {
            index: r.0,
            len: self.instructions.len(),
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn output(&self) -> Option<InstructionRef> {
        self.instructions.len().checked_sub(1).map(InstructionRef)
    }

    pub fn get_parameter_shapes(&self) -> &BTreeMap<String, Shape> {
        &self.parameters
    }

    pub fn is_compiled(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&Arc<dyn Target>> {
        self.target.as_ref()
    }

    /// Lowers the program for `target`: runs its passes, then binds a kernel to
    /// every instruction. On failure the program is left as it was.
    pub fn compile<T: Target + 'static>(&mut self, target: T) -> Result<()> {
        if let Some(current) = &self.target {
            return Err(Error::Lowering {
                op: "program".into(),
                target: target.name().into(),
                reason: format!("already compiled for {}", current.name()),
            });
        }
        let mut lowered = self.clone();
        for pass in target.passes() {
            pass.apply(&mut lowered)?;
            if CONFIG.trace_compile {
                debug!("after {} for {}:\n{lowered}", pass.name(), target.name());
            }
        }
        for i in 0..lowered.instructions.len() {
            if lowered.instructions[i].is_parameter() {
                continue;
            }
            let kernel = target.bind(&lowered, InstructionRef(i))?;
            lowered.instructions[i].kernel = Some(kernel);
        }
        debug!(
            "compiled {} instructions for {}",
            lowered.instructions.len(),
            target.name()
        );
        lowered.target = Some(Arc::new(target));
        *self = lowered;
        Ok(())
    }

    /// Evaluates the compiled program with `params` and returns the output.
    pub fn eval(&self, params: &Parameters) -> Result<Argument> {
        match &self.target {
            Some(target) => target.eval(self, params),
            None => Err(Error::UncompiledProgram),
        }
    }

    /// A compiled graph is lowered for its target and takes no new instructions.
    fn check_open(&self, op: &str) -> Result<()> {
        match &self.target {
            Some(target) => Err(Error::Lowering {
                op: op.into(),
                target: target.name().into(),
                reason: "the program is already compiled".into(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn push(&mut self, ins: Instruction) -> InstructionRef {
        self.instructions.push(ins);
        InstructionRef(self.instructions.len() - 1)
    }

    /// Rebuilds the instruction list in order. `f` receives the rebuilt program so
    /// far, the old position and the old instruction with inputs already remapped,
    /// and returns what now stands for it, or `None` to drop it.
    pub(crate) fn rebuild<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Program, InstructionRef, Instruction) -> Result<Option<InstructionRef>>,
    {
        let old = std::mem::take(&mut self.instructions);
        let mut map: Vec<Option<InstructionRef>> = Vec::with_capacity(old.len());
        for (i, mut ins) in old.into_iter().enumerate() {
            ins.inputs = ins
                .inputs
                .iter()
                .map(|r| {
                    map.get(r.0).copied().flatten().ok_or(Error::InvalidReference {
                        index: r.0,
                        len: map.len(),
                    })
                })
                .collect::<Result<_>>()?;
            let new = f(self, InstructionRef(i), ins)?;
            map.push(new);
        }
        Ok(())
    }
}

impl core::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, ins) in self.instructions.iter().enumerate() {
            write!(f, "@{i} = {}", ins.op)?;
            if !ins.inputs.is_empty() {
                write!(f, "({})", ins.inputs.iter().join(", "))?;
            }
            writeln!(f, " -> {}", ins.shape)?;
        }
        Ok(())
    }
}
