use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use microport_core::DType;

use crate::format::{OpCode, MAGIC, SCHEMA_VERSION};

/// Serializes flat model blobs.
///
/// Values that do not fit the blob's integer widths are refused. Consistency
/// between tensors and operators is checked when the blob is parsed.
#[derive(Clone, Debug)]
pub struct ModelBuilder {
    schema_version: u32,
    tensors: Vec<(DType, Vec<u32>)>,
    inputs: Vec<u16>,
    outputs: Vec<u16>,
    ops: BytesMut,
    op_count: usize,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tensors: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            ops: BytesMut::new(),
            op_count: 0,
        }
    }

    pub fn schema_version(&mut self, version: u32) -> &mut Self {
        self.schema_version = version;
        self
    }

    /// Declares a tensor and returns its index.
    pub fn tensor(&mut self, dtype: DType, dims: &[usize]) -> Result<u16> {
        let index = u16::try_from(self.tensors.len()).context("more than 65535 tensors")?;
        u8::try_from(dims.len()).with_context(|| format!("rank {} does not fit in u8", dims.len()))?;
        let dims = dims
            .iter()
            .map(|&d| u32::try_from(d).with_context(|| format!("dimension {d} does not fit in u32")))
            .collect::<Result<Vec<_>>>()?;
        self.tensors.push((dtype, dims));
        Ok(index)
    }

    pub fn input(&mut self, tensor: u16) -> &mut Self {
        self.inputs.push(tensor);
        self
    }

    pub fn output(&mut self, tensor: u16) -> &mut Self {
        self.outputs.push(tensor);
        self
    }

    pub fn affine(&mut self, input: u16, output: u16, scale: f32, offset: f32) -> &mut Self {
        self.op_header(OpCode::Affine, input, output);
        self.ops.put_f32_le(scale);
        self.ops.put_f32_le(offset);
        self
    }

    pub fn relu(&mut self, input: u16, output: u16) -> &mut Self {
        self.op_header(OpCode::Relu, input, output);
        self
    }

    pub fn softmax(&mut self, input: u16, output: u16) -> &mut Self {
        self.op_header(OpCode::Softmax, input, output);
        self
    }

    pub fn global_average_pool(&mut self, input: u16, output: u16) -> &mut Self {
        self.op_header(OpCode::GlobalAveragePool, input, output);
        self
    }

    /// `weights` is row-major `[out][in]`.
    pub fn dense(&mut self, input: u16, output: u16, weights: &[f32], bias: &[f32]) -> &mut Self {
        self.op_header(OpCode::Dense, input, output);
        for w in weights.iter().chain(bias) {
            self.ops.put_f32_le(*w);
        }
        self
    }

    pub fn build(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(64 + self.ops.len());
        out.put_slice(&MAGIC);
        out.put_u32_le(self.schema_version);

        out.put_u16_le(u16::try_from(self.tensors.len()).context("tensor count does not fit in u16")?);
        for (dtype, dims) in &self.tensors {
            out.put_u8(dtype.code());
            out.put_u8(u8::try_from(dims.len()).context("rank does not fit in u8")?);
            for d in dims {
                out.put_u32_le(*d);
            }
        }

        for (what, list) in [("input", &self.inputs), ("output", &self.outputs)] {
            let count = u8::try_from(list.len()).with_context(|| format!("{} {what}s do not fit in u8", list.len()))?;
            out.put_u8(count);
            for idx in list {
                out.put_u16_le(*idx);
            }
        }

        out.put_u16_le(u16::try_from(self.op_count).with_context(|| format!("{} ops do not fit in u16", self.op_count))?);
        out.put_slice(&self.ops);
        Ok(out.freeze())
    }

    fn op_header(&mut self, code: OpCode, input: u16, output: u16) {
        self.ops.put_u8(code as u8);
        self.ops.put_u16_le(input);
        self.ops.put_u16_le(output);
        self.op_count += 1;
    }
}

/// Grayscale 96x96 classifier with ten classes:
/// `[1,96,96,1] -> pool -> [1,1] -> dense -> [1,10] -> softmax -> [1,10]`.
pub fn demo_classifier() -> Result<Bytes> {
    let mut b = ModelBuilder::new();
    let image = b.tensor(DType::F32, &[1, 96, 96, 1])?;
    let pooled = b.tensor(DType::F32, &[1, 1])?;
    let logits = b.tensor(DType::F32, &[1, 10])?;
    let probs = b.tensor(DType::F32, &[1, 10])?;

    let weights: Vec<f32> = (0..10).map(|i| i as f32 - 4.5).collect();
    let bias = [0.0f32; 10];
    b.input(image)
        .output(probs)
        .global_average_pool(image, pooled)
        .dense(pooled, logits, &weights, &bias)
        .softmax(logits, probs);
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_wider_than_the_format_are_refused() {
        let mut b = ModelBuilder::new();
        let err = b.tensor(DType::F32, &[1, 1 << 32, 1, 1]).unwrap_err();
        assert!(err.to_string().contains("dimension 4294967296"));

        let err = b.tensor(DType::F32, &[1; 256]).unwrap_err();
        assert!(err.to_string().contains("rank 256"));

        for _ in 0..256 {
            b.input(0);
        }
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("256 inputs"));
    }

    #[test]
    fn refused_tensors_are_not_recorded() {
        let mut b = ModelBuilder::new();
        assert!(b.tensor(DType::F32, &[usize::MAX]).is_err());
        assert_eq!(b.tensor(DType::F32, &[4]).unwrap(), 0);
    }
}
