use std::ops::Range;

use anyhow::{bail, ensure, Context, Result};
use microport_core::{BoundInterpreter, DType, TensorView};
use tracing::debug;

use crate::arena::BumpPlanner;
use crate::format::{byte_len, FlatModel, Graph};
use crate::kernels;

/// A flat model bound to a caller arena. Every tensor, including
/// intermediates, gets its own f32 region in the arena.
pub struct FlatInterpreter<'a> {
    graph: Graph<'a>,
    arena: &'a mut [u8],
    placements: Vec<Range<usize>>,
    used: usize,
}

impl<'a> FlatInterpreter<'a> {
    pub fn new(model: FlatModel<'a>, arena: &'a mut [u8]) -> Result<Self> {
        let graph = model.graph.with_context(|| {
            format!("schema version {} has no decodable graph", model.schema_version)
        })?;
        for (idx, tensor) in graph.tensors.iter().enumerate() {
            if tensor.dtype != DType::F32 {
                bail!(
                    "tensor {idx} has element type {:?}; the flat engine executes f32 only",
                    tensor.dtype
                );
            }
        }
        Ok(Self {
            graph,
            arena,
            placements: Vec::new(),
            used: 0,
        })
    }

    fn is_allocated(&self) -> bool {
        self.placements.len() == self.graph.tensors.len()
    }

    fn view(&mut self, tensor: usize) -> Option<TensorView<'_>> {
        let range = self.placements.get(tensor)?.clone();
        let desc = &self.graph.tensors[tensor];
        let data: &mut [f32] = bytemuck::try_cast_slice_mut(&mut self.arena[range]).ok()?;
        Some(TensorView {
            dtype: desc.dtype,
            shape: desc.shape.clone(),
            data,
        })
    }
}

impl BoundInterpreter for FlatInterpreter<'_> {
    fn allocate_tensors(&mut self) -> Result<()> {
        if self.is_allocated() {
            return Ok(());
        }
        let mut planner = BumpPlanner::new(self.arena);
        let mut placements = Vec::with_capacity(self.graph.tensors.len());
        for (idx, tensor) in self.graph.tensors.iter().enumerate() {
            let bytes = byte_len(&tensor.shape)
                .with_context(|| format!("tensor {idx} {} overflows usize bytes", tensor.shape))?;
            let range = planner
                .alloc(bytes, std::mem::align_of::<f32>())
                .with_context(|| format!("allocating tensor {idx} {}", tensor.shape))?;
            placements.push(range);
        }
        for range in &placements {
            self.arena[range.clone()].fill(0);
        }
        self.used = planner.used();
        self.placements = placements;
        debug!(
            tensors = self.placements.len(),
            used = self.used,
            capacity = self.arena.len(),
            "flat arena planned"
        );
        Ok(())
    }

    fn input_count(&self) -> usize {
        self.graph.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.graph.outputs.len()
    }

    fn input(&mut self, index: usize) -> Option<TensorView<'_>> {
        let tensor = *self.graph.inputs.get(index)?;
        self.view(tensor)
    }

    fn output(&mut self, index: usize) -> Option<TensorView<'_>> {
        let tensor = *self.graph.outputs.get(index)?;
        self.view(tensor)
    }

    fn invoke(&mut self) -> Result<()> {
        ensure!(self.is_allocated(), "tensors have not been allocated");
        for (idx, node) in self.graph.nodes.iter().enumerate() {
            let src = self.placements[node.input].clone();
            let dst = self.placements[node.output].clone();
            let (src, dst) = split_pair(self.arena, src, dst)?;
            let input: &[f32] = bytemuck::try_cast_slice(src)
                .map_err(|e| anyhow::anyhow!("op {idx} input: {e:?}"))?;
            let output: &mut [f32] = bytemuck::try_cast_slice_mut(dst)
                .map_err(|e| anyhow::anyhow!("op {idx} output: {e:?}"))?;
            let input_shape = &self.graph.tensors[node.input].shape;
            kernels::eval(&node.op, input, input_shape, output)
                .with_context(|| format!("op {idx}"))?;
        }
        Ok(())
    }

    fn arena_used(&self) -> usize {
        self.used
    }
}

/// Borrows two disjoint byte ranges of the arena, one shared and one unique.
fn split_pair(arena: &mut [u8], src: Range<usize>, dst: Range<usize>) -> Result<(&[u8], &mut [u8])> {
    if src.end <= dst.start {
        let (head, tail) = arena.split_at_mut(dst.start);
        Ok((&head[src], &mut tail[..dst.len()]))
    } else if dst.end <= src.start {
        let src_len = src.len();
        let (head, tail) = arena.split_at_mut(src.start);
        Ok((&tail[..src_len], &mut head[dst]))
    } else {
        bail!("tensor regions {src:?} and {dst:?} overlap")
    }
}
