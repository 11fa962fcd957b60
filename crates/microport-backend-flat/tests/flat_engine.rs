use std::cell::Cell;

use anyhow::{Context, Result};
use microport_backend_flat::{demo_classifier, FlatEngine, FlatModel, ModelBuilder, SCHEMA_VERSION};
use microport_core::{DType, EngineModel, ErrorKind, Hwc};
use microport_runtime::{Pipeline, PipelineConfig};

fn pipeline() -> Pipeline<FlatEngine> {
    Pipeline::new(FlatEngine::new())
}

#[test]
fn demo_classifier_end_to_end() -> Result<()> {
    let model = demo_classifier()?;
    let mut arena = vec![0u8; 64 * 1024];
    let p = pipeline();

    assert_eq!(p.get_input_shape(&model, &mut arena)?, Hwc::new(96, 96, 1));
    assert_eq!(p.get_output_shape(&model, &mut arena)?, Hwc::new(1, 1, 10));

    let mut input_hwc = None;
    let mut probs = Vec::new();
    p.invoke(
        &model,
        &mut arena,
        |buf, hwc| {
            input_hwc = Some(hwc);
            buf.fill(1.0);
        },
        |buf, hwc| {
            assert_eq!(hwc, Hwc::new(1, 1, 10));
            probs.extend_from_slice(buf);
        },
    )?;

    assert_eq!(input_hwc, Some(Hwc::new(96, 96, 1)));
    assert_eq!(probs.len(), 10);
    let total: f32 = probs.iter().sum();
    assert!((total - 1.0).abs() < 1e-5, "softmax sums to {total}");
    let best = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .context("empty output")?;
    assert_eq!(best, 9);
    Ok(())
}

#[test]
fn dense_layer_computes_exact_values() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[1, 2])?;
    let y = b.tensor(DType::F32, &[3])?;
    b.input(x).output(y).dense(
        x,
        y,
        &[1.0, 0.0, 0.0, 1.0, 2.0, -1.0],
        &[0.5, 0.0, -0.5],
    );
    let model = b.build()?;

    let mut arena = vec![0u8; 256];
    let mut out = Vec::new();
    pipeline().invoke(
        &model,
        &mut arena,
        |buf, hwc| {
            assert_eq!(hwc, Hwc::new(1, 2, 1));
            buf.copy_from_slice(&[3.0, 4.0]);
        },
        |buf, hwc| {
            assert_eq!(hwc, Hwc::new(1, 1, 3));
            out = buf.to_vec();
        },
    )?;
    assert_eq!(out, vec![3.5, 4.0, 1.5]);
    Ok(())
}

#[test]
fn affine_then_relu_over_a_feature_map() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[2, 2])?;
    let scaled = b.tensor(DType::F32, &[4])?;
    let y = b.tensor(DType::F32, &[1, 2, 2, 1])?;
    b.input(x)
        .output(y)
        .affine(x, scaled, 2.0, -3.0)
        .relu(scaled, y);
    let model = b.build()?;

    let mut arena = vec![0u8; 256];
    let mut out = Vec::new();
    pipeline().invoke(
        &model,
        &mut arena,
        |buf, _| buf.copy_from_slice(&[0.0, 1.0, 2.0, 3.0]),
        |buf, hwc| {
            assert_eq!(hwc, Hwc::new(2, 2, 1));
            out = buf.to_vec();
        },
    )?;
    assert_eq!(out, vec![0.0, 0.0, 1.0, 3.0]);
    Ok(())
}

#[test]
fn misaligned_arena_start_still_works() -> Result<()> {
    let model = demo_classifier()?;
    let mut backing = vec![0u8; 64 * 1024 + 3];
    let geometry = pipeline().inspect(&model, &mut backing[3..])?;
    assert_eq!(geometry.input, Hwc::new(96, 96, 1));
    assert_eq!(geometry.output, Hwc::new(1, 1, 10));
    assert_eq!(geometry.operator_count, 3);
    assert!(geometry.arena_used >= (96 * 96 + 1 + 10 + 10) * 4);
    Ok(())
}

#[test]
fn small_arena_fails_allocation_without_callbacks() -> Result<()> {
    let model = demo_classifier()?;
    let mut arena = vec![0u8; 1024];
    let called = Cell::new(false);

    let err = pipeline()
        .invoke(&model, &mut arena, |_, _| called.set(true), |_, _| called.set(true))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    assert!(!called.get());
    let source = std::error::Error::source(&err).map(|s| s.to_string());
    assert!(source.is_some_and(|s| s.contains("allocating tensor 0")));
    Ok(())
}

#[test]
fn other_schema_versions_are_refused() -> Result<()> {
    let mut b = ModelBuilder::new();
    b.schema_version(SCHEMA_VERSION - 1);
    let mut blob = b.build()?.to_vec();
    // The body of an unknown version is never read.
    blob.extend_from_slice(&[0xff; 7]);

    let mut arena = vec![0u8; 256];
    let p = pipeline();
    for err in [
        p.get_input_shape(&blob, &mut arena).unwrap_err(),
        p.get_output_shape(&blob, &mut arena).unwrap_err(),
        p.invoke(&blob, &mut arena, |_, _| {}, |_, _| {}).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::SchemaVersionMismatch);
    }
    Ok(())
}

#[test]
fn corrupt_blobs_are_malformed() -> Result<()> {
    let mut arena = vec![0u8; 256];
    let p = pipeline();

    let err = p.get_input_shape(b"NOPE\x03\0\0\0", &mut arena).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModel);

    let model = demo_classifier()?;
    let truncated = &model[..model.len() - 4];
    let err = p.get_input_shape(truncated, &mut arena).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModel);

    let err = p.get_input_shape(b"MP", &mut arena).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModel);
    Ok(())
}

#[test]
fn four_channel_input_is_rejected() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[1, 64, 64, 4])?;
    let y = b.tensor(DType::F32, &[4])?;
    b.input(x).output(y).global_average_pool(x, y);
    let model = b.build()?;

    let mut arena = vec![0u8; 80 * 1024];
    let called = Cell::new(false);
    let p = pipeline();
    assert_eq!(
        p.get_input_shape(&model, &mut arena).unwrap_err().kind(),
        ErrorKind::InvalidChannelCount
    );
    let err = p
        .invoke(&model, &mut arena, |_, _| called.set(true), |_, _| called.set(true))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChannelCount);
    assert!(!called.get());
    Ok(())
}

#[test]
fn non_f32_tensors_do_not_bind() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::U8, &[8, 8])?;
    let y = b.tensor(DType::F32, &[64])?;
    b.input(x).output(y).relu(x, y);
    let model = b.build()?;

    let mut arena = vec![0u8; 1024];
    let err = pipeline().get_input_shape(&model, &mut arena).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    Ok(())
}

#[test]
fn dtype_policy_accepts_matching_tensors() -> Result<()> {
    let model = demo_classifier()?;
    let mut arena = vec![0u8; 64 * 1024];

    let strict = Pipeline::with_config(
        FlatEngine::new(),
        PipelineConfig::default().with_required_dtype(DType::F32),
    );
    assert_eq!(strict.get_input_shape(&model, &mut arena)?, Hwc::new(96, 96, 1));

    let quantized = Pipeline::with_config(
        FlatEngine::new(),
        PipelineConfig::default().with_required_dtype(DType::U8),
    );
    let err = quantized.get_input_shape(&model, &mut arena).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedDType);
    Ok(())
}

#[test]
fn arena_is_rezeroed_for_every_call() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[2, 2])?;
    let y = b.tensor(DType::F32, &[4])?;
    b.input(x).output(y).affine(x, y, 1.0, 0.0);
    let model = b.build()?;

    let mut arena = vec![0u8; 128];
    let p = pipeline();
    p.invoke(&model, &mut arena, |buf, _| buf.fill(7.0), |_, _| {})?;

    let mut leftover = Vec::new();
    p.invoke(&model, &mut arena, |buf, _| leftover = buf.to_vec(), |_, _| {})?;
    assert_eq!(leftover, vec![0.0; 4]);
    Ok(())
}

#[test]
fn parse_rejects_inconsistent_graphs() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[4, 4, 3])?;
    let y = b.tensor(DType::F32, &[5])?;
    b.input(x).output(y).global_average_pool(x, y);
    let err = FlatModel::parse(&b.build()?).unwrap_err();
    assert!(format!("{err:#}").contains("global average pool"));

    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[4])?;
    b.input(x).output(x).relu(x, x);
    let err = FlatModel::parse(&b.build()?).unwrap_err();
    assert!(format!("{err:#}").contains("reads and writes tensor 0"));
    Ok(())
}

#[test]
fn parse_reports_schema_and_operator_count() -> Result<()> {
    let model = demo_classifier()?;
    let parsed = FlatModel::parse(&model)?;
    assert_eq!(parsed.schema_version(), SCHEMA_VERSION);
    assert_eq!(parsed.operator_count(), 3);
    let graph = parsed.graph.context("graph decoded")?;
    assert_eq!(graph.inputs, vec![0]);
    assert_eq!(graph.outputs, vec![3]);
    Ok(())
}

#[test]
fn shapes_overflowing_usize_are_malformed() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[2, 2])?;
    let y = b.tensor(DType::F32, &[1 << 22, 1 << 21, 1 << 21])?;
    b.input(x).output(y).affine(x, y, 1.0, 0.0);
    let model = b.build()?;

    let mut arena = vec![0u8; 256];
    let seen = Cell::new(None);
    let p = pipeline();
    let err = p
        .invoke(&model, &mut arena, |buf, _| seen.set(Some(buf.len())), |buf, _| seen.set(Some(buf.len())))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModel);
    assert_eq!(seen.get(), None);
    assert_eq!(p.get_output_shape(&model, &mut arena).unwrap_err().kind(), ErrorKind::MalformedModel);
    assert_eq!(p.get_input_shape(&model, &mut arena).unwrap_err().kind(), ErrorKind::MalformedModel);
    Ok(())
}

#[test]
fn byte_size_overflow_is_malformed() -> Result<()> {
    // Element count fits in usize; the f32 byte size does not.
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[1 << 31, 1 << 31])?;
    b.input(x).output(x);
    let err = FlatModel::parse(&b.build()?).unwrap_err();
    assert!(format!("{err:#}").contains("does not fit in the address space"));
    Ok(())
}

#[test]
fn dense_weight_size_overflow_is_malformed() -> Result<()> {
    let mut b = ModelBuilder::new();
    let x = b.tensor(DType::F32, &[1 << 30, 4])?;
    let y = b.tensor(DType::F32, &[1 << 30, 4])?;
    b.input(x).output(y).dense(x, y, &[], &[]);
    let err = FlatModel::parse(&b.build()?).unwrap_err();
    assert!(format!("{err:#}").contains("weights overflow usize"));
    Ok(())
}
