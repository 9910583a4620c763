mod common;

use std::sync::Arc;

use common::{close, float, literal};
use rtg::prelude::*;

fn generated(lens: &[usize], seed: u64) -> Literal {
    Literal::generate(float(lens), seed)
}

/// Evaluates the program built by `build` on the host and on the simulated device
/// and checks both agree.
fn parity<F>(build: F, params: &Parameters) -> anyhow::Result<Vec<f32>>
where
    F: Fn(&mut Program) -> anyhow::Result<()>,
{
    let mut p = Program::new();
    build(&mut p)?;
    let (mut cpu, mut gpu) = (p.clone(), p);
    cpu.compile(CpuTarget)?;
    gpu.compile(GpuTarget::sim().offload_copy(true))?;
    let expected = cpu.eval(params)?.to_vec::<f32>()?;
    let actual = gpu.eval(params)?;
    assert_eq!(actual.location(), Some(Location::Host));
    let actual = actual.to_vec::<f32>()?;
    assert!(close(&actual, &expected));
    Ok(actual)
}

#[test]
fn elementwise_parity() -> anyhow::Result<()> {
    let params = Parameters::from([("x".to_string(), generated(&[4, 6], 3).argument())]);
    parity(
        |p| {
            let x = p.add_parameter("x", float(&[4, 6]))?;
            let t = p.add_instruction(Operator::transpose(&[1, 0]), &[x])?;
            let e = p.add_instruction(Operator::Exp, &[t])?;
            let s = p.add_instruction(Operator::Sin, &[e])?;
            let c = p.add_instruction(Operator::Cos, &[e])?;
            let a = p.add_instruction(Operator::Add, &[s, c])?;
            let n = p.add_instruction(Operator::Tan, &[a])?;
            p.add_instruction(Operator::Mul, &[n, s, c])?;
            Ok(())
        },
        &params,
    )?;
    Ok(())
}

#[test]
fn gemm_softmax_parity() -> anyhow::Result<()> {
    let params = Parameters::from([("a".to_string(), generated(&[5, 4], 11).argument())]);
    let out = parity(
        |p| {
            let a = p.add_parameter("a", float(&[5, 4]))?;
            let b = p.add_literal(generated(&[5, 3], 12));
            let t = p.add_instruction(Operator::transpose(&[1, 0]), &[a])?;
            let g = p.add_instruction(Operator::Gemm { alpha: 0.5 }, &[t, b])?;
            p.add_instruction(Operator::softmax(), &[g])?;
            Ok(())
        },
        &params,
    )?;
    for row in out.chunks(3) {
        assert!(close(&[row.iter().sum::<f32>()], &[1.0]));
    }
    Ok(())
}

#[test]
fn convolution_parity() -> anyhow::Result<()> {
    let params = Parameters::from([("x".to_string(), generated(&[2, 3, 6, 6], 5).argument())]);
    for conv in [
        Convolution::new([0, 0], [1, 1]),
        Convolution::new([1, 1], [2, 2]),
        Convolution::new([2, 1], [1, 2]).with_dilation([2, 1]),
    ] {
        parity(
            |p| {
                let x = p.add_parameter("x", float(&[2, 3, 6, 6]))?;
                let w = p.add_literal(generated(&[4, 3, 3, 3], 6));
                let y = p.add_instruction(Operator::Convolution(conv), &[x, w])?;
                p.add_instruction(Operator::reshape(&[0, -1]), &[y])?;
                Ok(())
            },
            &params,
        )?;
    }
    Ok(())
}

#[test]
fn device_allocation_released_exactly_once() -> anyhow::Result<()> {
    let sim = SimDevice::new();
    let mut p = Program::new();
    let x = p.add_parameter("x", float(&[3]))?;
    let l = p.add_literal(literal(&[3], &[1.0, 2.0, 3.0]));
    p.add_instruction(Operator::Add, &[x, l])?;
    p.compile(GpuTarget::new(sim.clone()).offload_copy(false))?;
    // The literal is uploaded once, at compile time.
    assert_eq!(sim.stats().allocations, 1);
    assert_eq!(sim.stats().live, 1);

    let params = Parameters::from([(
        "x".to_string(),
        Argument::from_vec(float(&[3]), &[1.0f32, 1.0, 1.0])?,
    )]);
    let out = p.eval(&params)?;
    assert_eq!(out.location(), Some(Location::Device));
    let stats = sim.stats();
    assert_eq!((stats.allocations, stats.frees, stats.live), (3, 1, 2));

    let copies: Vec<Argument> = (0..3).map(|_| out.clone()).collect();
    drop(out);
    assert_eq!(sim.stats().live, 2);
    let host = to_host(&copies[1])?;
    drop(copies);
    assert_eq!(sim.stats().live, 1);
    assert_eq!(host.to_vec::<f32>()?, vec![2.0, 3.0, 4.0]);

    drop(p);
    let stats = sim.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.frees, stats.allocations);
    assert_eq!(stats.invalid_frees, 0);
    Ok(())
}

#[test]
fn boundary_crossings_copy() -> anyhow::Result<()> {
    let sim = SimDevice::new();
    let device: Arc<dyn Device> = sim.clone();
    let host = Argument::from_vec(float(&[2, 3]), &[0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0])?;
    let transposed = host.with_shape(Shape::with_strides(Dtype::Float, vec![3, 2], vec![1, 3])?)?;

    let on_device = to_device(&device, &transposed)?;
    assert_eq!(on_device.location(), Some(Location::Device));
    assert_eq!(on_device.shape(), transposed.shape());
    assert_eq!(on_device.to_vec::<f32>().unwrap_err().kind(), ErrorKind::Storage);
    assert_eq!(on_device.buffer_info().unwrap_err().kind(), ErrorKind::Storage);

    let back = to_host(&on_device)?;
    assert!(!back.shares_storage(&host));
    assert_eq!(back.to_vec::<f32>()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    assert_eq!(host.to_vec::<f32>()?, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(back.buffer_info()?.strides, vec![4, 12]);

    drop(on_device);
    assert_eq!(sim.stats().live, 0);
    assert!(to_host(&Argument::absent(float(&[1]))).is_err());
    Ok(())
}

#[test]
fn device_output_synchronizes_on_read() -> anyhow::Result<()> {
    let sim = SimDevice::new();
    let mut p = Program::new();
    let x = p.add_parameter("x", float(&[4]))?;
    p.add_instruction(Operator::Exp, &[x])?;
    p.compile(GpuTarget::new(sim.clone()).offload_copy(false))?;
    assert!(!p.to_string().contains("device_to_host"));

    let params = Parameters::from([(
        "x".to_string(),
        Argument::from_vec(float(&[4]), &[0.0f32, 0.0, 0.0, 0.0])?,
    )]);
    let out = p.eval(&params)?;
    let syncs = sim.stats().syncs;
    let host = to_host(&out)?;
    assert_eq!(sim.stats().syncs, syncs + 1);
    assert_eq!(sim.stats().launches, 1);
    assert_eq!(host.to_vec::<f32>()?, vec![1.0; 4]);
    Ok(())
}

#[test]
fn failed_evaluation_releases_its_allocations() -> anyhow::Result<()> {
    // 256 floats take 1 KiB; the literal, the uploaded input and one result fit.
    let sim = SimDevice::with_capacity(3072);
    let mut p = Program::new();
    let x = p.add_parameter("x", float(&[256]))?;
    let l = p.add_literal(generated(&[256], 1));
    let e = p.add_instruction(Operator::Exp, &[x])?;
    let s = p.add_instruction(Operator::Add, &[e, x])?;
    p.add_instruction(Operator::Mul, &[s, l])?;
    p.compile(GpuTarget::new(sim.clone()))?;
    assert_eq!(sim.stats().live_bytes, 1024);

    let params = Parameters::from([("x".to_string(), generated(&[256], 2).argument())]);
    let err = p.eval(&params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert!(err.is_environment());
    let stats = sim.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.live_bytes, 1024);
    assert_eq!(stats.invalid_frees, 0);
    Ok(())
}

#[test]
fn missing_kernel_fails_compilation() -> anyhow::Result<()> {
    let half = Shape::new(Dtype::Half, vec![2]);
    let mut p = Program::new();
    let x = p.add_parameter("x", half.clone())?;
    p.add_instruction(Operator::Exp, &[x])?;

    let err = p
        .compile(GpuTarget::new(SimDevice::without_dtype(Dtype::Half)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lowering);
    assert!(!p.is_compiled());

    p.compile(GpuTarget::sim().offload_copy(true))?;
    let params = Parameters::from([(
        "x".to_string(),
        Argument::from_vec(half, &[f16::from_f32(0.0), f16::from_f32(1.0)])?,
    )]);
    let out = p.eval(&params)?;
    let values = out.to_vec::<f16>()?;
    assert_eq!(values[0], f16::from_f32(1.0));
    assert!((values[1].to_f32() - 1.0f32.exp()).abs() < 1e-2);

    let err = out.buffer_info().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedType);
    assert_eq!(err.to_string(), "unsupported type: half not supported");
    Ok(())
}
