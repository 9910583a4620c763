use rtg::prelude::*;

fn main() -> anyhow::Result<()> {
    let mut program = Program::new();
    let x = program.add_parameter("x", Shape::new(Dtype::Float, vec![1, 3, 8, 8]))?;
    let w = program.add_literal(Literal::generate(Shape::new(Dtype::Float, vec![4, 3, 3, 3]), 0));
    let conv = program.add_instruction(Operator::convolution([1, 1], [1, 1]), &[x, w])?;
    program.add_instruction(Operator::softmax(), &[conv])?;

    let input = Literal::generate(Shape::new(Dtype::Float, vec![1, 3, 8, 8]), 1).argument();
    let params = Parameters::from([("x".to_string(), input)]);

    let mut cpu = program.clone();
    cpu.compile(CpuTarget)?;
    let mut gpu = program;
    gpu.compile(GpuTarget::sim().offload_copy(true))?;
    print!("{gpu}");

    let expected = cpu.eval(&params)?.to_vec::<f32>()?;
    let actual = gpu.eval(&params)?.to_vec::<f32>()?;
    let diff = expected
        .iter()
        .zip(&actual)
        .map(|(a, b)| (a - b).abs())
        .fold(0f32, f32::max);
    println!("{} outputs, max difference {diff}", actual.len());
    Ok(())
}
