//! Flat model blob layout. All integers and floats are little-endian.
//!
//! ```text
//! magic            b"MPFB"
//! schema_version   u32
//! tensor_count     u16
//!   dtype          u8      (DType::code)
//!   rank           u8
//!   dims           u32 * rank
//! input_count      u8,  tensor index u16 * input_count
//! output_count     u8,  tensor index u16 * output_count
//! op_count         u16
//!   opcode         u8
//!   input          u16
//!   output         u16
//!   payload        Affine: scale f32, offset f32
//!                  Dense:  weights f32 * (out * in), bias f32 * out
//! ```
//!
//! Only the header is read when the schema version is not the supported one;
//! the body layout of other versions is unknown.

use anyhow::{bail, ensure, Context, Result};
use bytes::Buf;
use microport_core::{DType, EngineModel, Shape};

pub const MAGIC: [u8; 4] = *b"MPFB";
pub const SCHEMA_VERSION: u32 = 3;

const MAX_RANK: usize = 8;
const F32_BYTES: usize = std::mem::size_of::<f32>();

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Affine = 0,
    Relu = 1,
    Softmax = 2,
    GlobalAveragePool = 3,
    Dense = 4,
}

impl OpCode {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(OpCode::Affine),
            1 => Some(OpCode::Relu),
            2 => Some(OpCode::Softmax),
            3 => Some(OpCode::GlobalAveragePool),
            4 => Some(OpCode::Dense),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op<'m> {
    Affine { scale: f32, offset: f32 },
    Relu,
    Softmax,
    /// Averages every position of the last (channel) axis.
    GlobalAveragePool,
    /// Raw little-endian weights `[out][in]` and bias `[out]`, borrowed from
    /// the blob.
    Dense { weights: &'m [u8], bias: &'m [u8] },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node<'m> {
    pub op: Op<'m>,
    pub input: usize,
    pub output: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Graph<'m> {
    pub tensors: Vec<TensorDesc>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub nodes: Vec<Node<'m>>,
}

/// A parsed blob. `graph` is only present for the supported schema version.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatModel<'m> {
    pub schema_version: u32,
    pub graph: Option<Graph<'m>>,
}

impl<'m> FlatModel<'m> {
    pub fn parse(blob: &'m [u8]) -> Result<Self> {
        let mut buf = blob;
        need(buf, 8, "header")?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        ensure!(magic == MAGIC, "bad magic {magic:02x?}, not a flat model blob");

        let schema_version = buf.get_u32_le();
        if schema_version != SCHEMA_VERSION {
            return Ok(Self {
                schema_version,
                graph: None,
            });
        }

        let graph = decode_graph(&mut buf).context("failed to decode model graph")?;
        ensure!(
            !buf.has_remaining(),
            "{} trailing bytes after model graph",
            buf.remaining()
        );

        Ok(Self {
            schema_version,
            graph: Some(graph),
        })
    }
}

impl EngineModel for FlatModel<'_> {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn operator_count(&self) -> usize {
        self.graph.as_ref().map_or(0, |g| g.nodes.len())
    }
}

fn decode_graph<'m>(buf: &mut &'m [u8]) -> Result<Graph<'m>> {
    need(buf, 2, "tensor count")?;
    let tensor_count = buf.get_u16_le() as usize;
    let mut tensors = Vec::with_capacity(tensor_count);
    for idx in 0..tensor_count {
        tensors.push(decode_tensor(buf).with_context(|| format!("tensor {idx}"))?);
    }

    let inputs = decode_indices(buf, tensor_count, "input")?;
    let outputs = decode_indices(buf, tensor_count, "output")?;

    need(buf, 2, "op count")?;
    let op_count = buf.get_u16_le() as usize;
    let mut nodes = Vec::with_capacity(op_count);
    for idx in 0..op_count {
        nodes.push(decode_node(buf, &tensors).with_context(|| format!("op {idx}"))?);
    }

    Ok(Graph {
        tensors,
        inputs,
        outputs,
        nodes,
    })
}

fn decode_tensor(buf: &mut &[u8]) -> Result<TensorDesc> {
    need(buf, 2, "tensor header")?;
    let code = buf.get_u8();
    let dtype = DType::from_code(code).with_context(|| format!("unknown dtype code {code}"))?;
    let rank = buf.get_u8() as usize;
    ensure!(rank <= MAX_RANK, "rank {rank} exceeds {MAX_RANK}");

    need(buf, rank * 4, "dims")?;
    let dims: Vec<usize> = (0..rank).map(|_| buf.get_u32_le() as usize).collect();
    let shape = Shape::from_slice(&dims);
    ensure!(
        byte_len(&shape).is_some(),
        "shape {shape} does not fit in the address space"
    );
    Ok(TensorDesc { dtype, shape })
}

fn decode_indices(buf: &mut &[u8], tensor_count: usize, what: &str) -> Result<Vec<usize>> {
    need(buf, 1, what)?;
    let count = buf.get_u8() as usize;
    need(buf, count * 2, what)?;
    (0..count)
        .map(|_| {
            let idx = buf.get_u16_le() as usize;
            ensure!(idx < tensor_count, "{what} refers to tensor {idx} of {tensor_count}");
            Ok(idx)
        })
        .collect()
}

fn decode_node<'m>(buf: &mut &'m [u8], tensors: &[TensorDesc]) -> Result<Node<'m>> {
    need(buf, 5, "op header")?;
    let raw = buf.get_u8();
    let code = OpCode::from_u8(raw).with_context(|| format!("unknown opcode {raw}"))?;
    let input = buf.get_u16_le() as usize;
    let output = buf.get_u16_le() as usize;
    ensure!(
        input < tensors.len() && output < tensors.len(),
        "op refers to tensors {input} -> {output} of {}",
        tensors.len()
    );
    ensure!(input != output, "op reads and writes tensor {input}");

    let in_shape = &tensors[input].shape;
    let in_numel = element_count(in_shape)?;
    let out_numel = element_count(&tensors[output].shape)?;

    let op = match code {
        OpCode::Affine => {
            need(buf, 8, "affine params")?;
            Op::Affine {
                scale: buf.get_f32_le(),
                offset: buf.get_f32_le(),
            }
        }
        OpCode::Relu => Op::Relu,
        OpCode::Softmax => Op::Softmax,
        OpCode::GlobalAveragePool => {
            let channels = in_shape.dims().last().copied().unwrap_or(1);
            ensure!(
                out_numel == channels,
                "global average pool over {in_shape} yields {channels} values, output holds {out_numel}"
            );
            Op::GlobalAveragePool
        }
        OpCode::Dense => {
            let weight_bytes = in_numel
                .checked_mul(out_numel)
                .and_then(|n| n.checked_mul(F32_BYTES))
                .with_context(|| format!("dense {in_numel} -> {out_numel} weights overflow usize"))?;
            let bias_bytes = out_numel
                .checked_mul(F32_BYTES)
                .with_context(|| format!("dense bias of {out_numel} overflows usize"))?;
            let weights = take(buf, weight_bytes, "dense weights")?;
            let bias = take(buf, bias_bytes, "dense bias")?;
            Op::Dense { weights, bias }
        }
    };

    if matches!(code, OpCode::Affine | OpCode::Relu | OpCode::Softmax) {
        ensure!(
            in_numel == out_numel,
            "{code:?} maps {in_numel} elements onto {out_numel}"
        );
    }

    Ok(Node { op, input, output })
}

/// Bytes a tensor of `shape` occupies once planned as f32.
pub(crate) fn byte_len(shape: &Shape) -> Option<usize> {
    shape.checked_numel()?.checked_mul(F32_BYTES)
}

fn element_count(shape: &Shape) -> Result<usize> {
    shape
        .checked_numel()
        .with_context(|| format!("element count of {shape} overflows usize"))
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        bail!(
            "truncated blob reading {what}: need {n} bytes, {} left",
            buf.remaining()
        );
    }
    Ok(())
}

fn take<'m>(buf: &mut &'m [u8], n: usize, what: &str) -> Result<&'m [u8]> {
    need(buf, n, what)?;
    let data: &'m [u8] = *buf;
    let (head, rest) = data.split_at(n);
    *buf = rest;
    Ok(head)
}
