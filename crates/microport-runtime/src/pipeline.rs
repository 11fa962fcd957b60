//! Public entry points: two shape queries and one full invocation.
//!
//! Every call parses the model, checks its schema version, binds it to the
//! caller's arena and allocates tensors from scratch. Nothing is cached
//! between calls, so two calls must never share one arena concurrently; the
//! caller owns that discipline.

use microport_core::{Engine, Hwc, PipelineResult};
use tracing::debug;

use crate::session::Session;
use crate::PipelineConfig;

/// Canonical geometry of a model's configured input and output, gathered in
/// a single session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelGeometry {
    pub input: Hwc,
    pub output: Hwc,
    pub arena_used: usize,
    pub operator_count: usize,
}

pub struct Pipeline<E> {
    engine: E,
    config: PipelineConfig,
}

impl<E: Engine> Pipeline<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, PipelineConfig::default())
    }

    pub fn with_config(engine: E, config: PipelineConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Canonical shape of the input buffer `invoke` would hand to its fill
    /// callback.
    pub fn get_input_shape(&self, model: &[u8], arena: &mut [u8]) -> PipelineResult<Hwc> {
        let mut session = Session::open(&self.engine, model, arena)?;
        let hwc = session.bind_input(&self.config, |_, _| {})?;
        Ok(hwc)
    }

    /// Canonical shape of the output buffer `invoke` would hand to its read
    /// callback. No inference pass is run.
    pub fn get_output_shape(&self, model: &[u8], arena: &mut [u8]) -> PipelineResult<Hwc> {
        let mut session = Session::open(&self.engine, model, arena)?;
        let hwc = session.bind_output(&self.config, |_, _| {})?;
        Ok(hwc)
    }

    /// Both canonical shapes plus arena usage, without running inference.
    pub fn inspect(&self, model: &[u8], arena: &mut [u8]) -> PipelineResult<ModelGeometry> {
        let mut session = Session::open(&self.engine, model, arena)?;
        let input = session.bind_input(&self.config, |_, _| {})?;
        let output = session.bind_output(&self.config, |_, _| {})?;
        Ok(ModelGeometry {
            input,
            output,
            arena_used: session.arena_used(),
            operator_count: session.operator_count(),
        })
    }

    /// Runs one inference pass.
    ///
    /// `fill` writes the input in place and `read` consumes the output in
    /// place; both buffers live in `arena`. Each callback runs at most once,
    /// and only after its tensor's shape has been accepted.
    pub fn invoke<I, O>(&self, model: &[u8], arena: &mut [u8], fill: I, read: O) -> PipelineResult<()>
    where
        I: FnOnce(&mut [f32], Hwc),
        O: FnOnce(&[f32], Hwc),
    {
        let mut session = Session::open(&self.engine, model, arena)?;
        let input = session.bind_input(&self.config, fill)?;
        session.run()?;
        let output = session.bind_output(&self.config, read)?;
        session.finish();

        debug!(engine = self.engine.name(), %input, %output, "invocation complete");
        Ok(())
    }
}
