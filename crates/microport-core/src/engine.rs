use anyhow::Result;

use crate::{DType, Shape};

/// An inference engine that can parse model blobs and bind them to a
/// caller-owned tensor arena.
///
/// Engine methods report failures through `anyhow`; the pipeline translates
/// them into [`crate::PipelineError`] before they reach a caller.
pub trait Engine {
    type Model<'m>: EngineModel;
    type Interpreter<'a>: BoundInterpreter;

    fn name(&self) -> &'static str;

    /// Schema version this engine reads. Models carrying any other version
    /// are refused before binding.
    fn schema_version(&self) -> u32;

    fn parse<'m>(&self, blob: &'m [u8]) -> Result<Self::Model<'m>>;

    /// Pairs a parsed model with `arena`. The arena's length is its size.
    fn bind<'a>(&self, model: Self::Model<'a>, arena: &'a mut [u8])
        -> Result<Self::Interpreter<'a>>;
}

pub trait EngineModel {
    fn schema_version(&self) -> u32;
    fn operator_count(&self) -> usize;
}

/// A model bound to an arena. Lives for exactly one pipeline call.
pub trait BoundInterpreter {
    fn allocate_tensors(&mut self) -> Result<()>;

    fn input_count(&self) -> usize;
    fn output_count(&self) -> usize;

    /// Borrow an input tensor. Only meaningful after allocation.
    fn input(&mut self, index: usize) -> Option<TensorView<'_>>;
    fn output(&mut self, index: usize) -> Option<TensorView<'_>>;

    /// Run one forward pass over the current input buffers.
    fn invoke(&mut self) -> Result<()>;

    /// Bytes of the arena claimed by allocation so far.
    fn arena_used(&self) -> usize;
}

/// Borrowed view of a tensor living in the arena.
#[derive(Debug)]
pub struct TensorView<'t> {
    pub dtype: DType,
    pub shape: Shape,
    pub data: &'t mut [f32],
}
