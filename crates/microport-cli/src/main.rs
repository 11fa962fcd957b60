mod cli;

use std::path::Path;

use anyhow::{ensure, Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use clap::Parser;
use cli::{Cli, Command, ModelArgs};
use microport_backend_flat::{demo_classifier, FlatEngine};
use microport_core::Hwc;
use microport_runtime::{Pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log).with_context(|| format!("invalid log filter {:?}", cli.log))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { model } => inspect(&model),
        Command::Run { model, input, output } => run(&model, input.as_deref(), output.as_deref()),
        Command::Demo { out } => demo(&out),
    }
}

struct Loaded {
    pipeline: Pipeline<FlatEngine>,
    blob: Vec<u8>,
    arena: Vec<u8>,
}

fn load(args: &ModelArgs) -> Result<Loaded> {
    let blob = std::fs::read(&args.model).with_context(|| format!("reading {}", args.model.display()))?;
    let mut config = PipelineConfig::default();
    if let Some(dtype) = args.require_dtype {
        config = config.with_required_dtype(dtype);
    }
    info!(model = %args.model.display(), bytes = blob.len(), arena = args.arena_size, "model loaded");
    Ok(Loaded {
        pipeline: Pipeline::with_config(FlatEngine::new(), config),
        blob,
        arena: vec![0u8; args.arena_size],
    })
}

fn inspect(args: &ModelArgs) -> Result<()> {
    let mut loaded = load(args)?;
    let geometry = loaded
        .pipeline
        .inspect(&loaded.blob, &mut loaded.arena)
        .context("inspecting model")?;

    println!("input     {}", geometry.input);
    println!("output    {}", geometry.output);
    println!("operators {}", geometry.operator_count);
    println!("arena     {} / {} bytes", geometry.arena_used, args.arena_size);
    Ok(())
}

fn run(args: &ModelArgs, input: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let mut loaded = load(args)?;
    let expected = loaded
        .pipeline
        .get_input_shape(&loaded.blob, &mut loaded.arena)
        .context("querying input shape")?;

    let values = match input {
        Some(path) => {
            let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            decode_f32(&raw, expected).with_context(|| format!("decoding {}", path.display()))?
        }
        None => vec![0.0; element_count(expected)?],
    };

    let mut result = Vec::new();
    let mut output_hwc = None;
    let started = std::time::Instant::now();
    loaded
        .pipeline
        .invoke(
            &loaded.blob,
            &mut loaded.arena,
            |buf, _| buf.copy_from_slice(&values),
            |buf, hwc| {
                output_hwc = Some(hwc);
                result.extend_from_slice(buf);
            },
        )
        .context("running inference")?;
    info!(elapsed_us = started.elapsed().as_micros() as u64, "inference complete");

    let hwc = output_hwc.context("output callback was not called")?;
    match output {
        Some(path) => {
            let mut out = BytesMut::with_capacity(result.len() * 4);
            for v in &result {
                out.put_f32_le(*v);
            }
            std::fs::write(path, &out).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), %hwc, "output written");
        }
        None => {
            println!("output {hwc}");
            for (i, v) in result.iter().enumerate() {
                println!("{i:>6} {v:.6}");
            }
        }
    }
    Ok(())
}

fn demo(out: &Path) -> Result<()> {
    let blob = demo_classifier()?;
    std::fs::write(out, &blob).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), bytes = blob.len(), "demo model written");
    Ok(())
}

fn decode_f32(mut raw: &[u8], hwc: Hwc) -> Result<Vec<f32>> {
    let count = element_count(hwc)?;
    let want = count
        .checked_mul(4)
        .with_context(|| format!("{hwc} f32 values overflow usize bytes"))?;
    ensure!(
        raw.len() == want,
        "input holds {} bytes, model expects {want} ({hwc} f32 values)",
        raw.len()
    );
    let mut values = Vec::with_capacity(count);
    while raw.has_remaining() {
        values.push(raw.get_f32_le());
    }
    Ok(values)
}

fn element_count(hwc: Hwc) -> Result<usize> {
    hwc.checked_numel()
        .with_context(|| format!("{hwc} element count overflows usize"))
}
