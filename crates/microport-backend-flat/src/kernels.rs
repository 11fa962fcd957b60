use anyhow::{ensure, Result};
use microport_core::Shape;

use crate::format::Op;

/// Evaluates one operator from `input` into `output`. Shapes were checked
/// when the blob was parsed.
pub(crate) fn eval(op: &Op<'_>, input: &[f32], input_shape: &Shape, output: &mut [f32]) -> Result<()> {
    match op {
        Op::Affine { scale, offset } => {
            for (dst, src) in output.iter_mut().zip(input) {
                *dst = src * scale + offset;
            }
        }
        Op::Relu => {
            for (dst, src) in output.iter_mut().zip(input) {
                *dst = src.max(0.0);
            }
        }
        Op::Softmax => softmax(input, output),
        Op::GlobalAveragePool => {
            let channels = input_shape.dims().last().copied().unwrap_or(1);
            global_average_pool(input, channels, output);
        }
        Op::Dense { weights, bias } => dense(input, weights, bias, output)?,
    }
    Ok(())
}

fn softmax(input: &[f32], output: &mut [f32]) {
    let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for (dst, src) in output.iter_mut().zip(input) {
        *dst = (src - max).exp();
        sum += *dst;
    }
    if sum > 0.0 {
        output.iter_mut().for_each(|v| *v /= sum);
    }
}

fn global_average_pool(input: &[f32], channels: usize, output: &mut [f32]) {
    output.fill(0.0);
    if channels == 0 {
        return;
    }
    for (i, v) in input.iter().enumerate() {
        output[i % channels] += v;
    }
    let positions = (input.len() / channels).max(1) as f32;
    output.iter_mut().for_each(|v| *v /= positions);
}

fn dense(input: &[f32], weights: &[u8], bias: &[u8], output: &mut [f32]) -> Result<()> {
    let in_features = input.len();
    ensure!(
        in_features.checked_mul(output.len()).and_then(|n| n.checked_mul(4)) == Some(weights.len())
            && output.len().checked_mul(4) == Some(bias.len()),
        "dense parameters do not match {in_features} -> {} features",
        output.len()
    );
    if in_features == 0 {
        for (dst, b) in output.iter_mut().zip(bias.chunks_exact(4)) {
            *dst = le_f32(b);
        }
        return Ok(());
    }

    let rows = weights.chunks_exact(in_features * 4);
    for ((dst, row), b) in output.iter_mut().zip(rows).zip(bias.chunks_exact(4)) {
        let acc: f32 = row
            .chunks_exact(4)
            .zip(input)
            .map(|(w, x)| le_f32(w) * x)
            .sum();
        *dst = acc + le_f32(b);
    }
    Ok(())
}

#[inline(always)]
fn le_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
