use microport_core::{
    canonicalize, BoundInterpreter, Engine, EngineModel, Hwc, PipelineError, PipelineResult,
    Stage, TensorRole, TensorView,
};
use tracing::{debug, warn};

use crate::PipelineConfig;

/// A parsed, validated model bound to one arena with its tensors allocated.
///
/// Opened fresh by every public operation and dropped before it returns, so
/// no engine state outlives the call that built it.
pub(crate) struct Session<'a, E: Engine> {
    interpreter: E::Interpreter<'a>,
    engine: &'static str,
    operator_count: usize,
    stage: Stage,
}

impl<'a, E: Engine> Session<'a, E> {
    /// Runs `Unloaded -> Validated -> Allocated`.
    pub(crate) fn open(engine: &E, blob: &'a [u8], arena: &'a mut [u8]) -> PipelineResult<Self> {
        let name = engine.name();
        let model = engine.parse(blob).map_err(|err| {
            warn!(engine = name, error = ?err, "model blob rejected by engine");
            PipelineError::from_parse(err)
        })?;

        let found = model.schema_version();
        let expected = engine.schema_version();
        if found != expected {
            warn!(engine = name, found, expected, "model schema version is not supported");
            return Err(PipelineError::SchemaVersionMismatch { found, expected });
        }
        let operator_count = model.operator_count();
        debug!(engine = name, stage = %Stage::Validated, operator_count, "model validated");

        let arena_size = arena.len();
        let mut interpreter = engine.bind(model, arena).map_err(|err| {
            warn!(engine = name, arena_size, error = ?err, "failed to bind model to arena");
            PipelineError::from_allocation(err)
        })?;
        interpreter.allocate_tensors().map_err(|err| {
            warn!(engine = name, arena_size, error = ?err, "tensor allocation failed");
            PipelineError::from_allocation(err)
        })?;
        debug!(
            engine = name,
            stage = %Stage::Allocated,
            arena_size,
            arena_used = interpreter.arena_used(),
            inputs = interpreter.input_count(),
            outputs = interpreter.output_count(),
            "tensors allocated"
        );

        Ok(Self {
            interpreter,
            engine: name,
            operator_count,
            stage: Stage::Allocated,
        })
    }

    /// Canonicalizes the configured input and lends its buffer to `fill`.
    /// `fill` is never called if the tensor is rejected.
    pub(crate) fn bind_input<F>(&mut self, config: &PipelineConfig, fill: F) -> PipelineResult<Hwc>
    where
        F: FnOnce(&mut [f32], Hwc),
    {
        let hwc = self.bind_tensor(TensorRole::Input, config, fill)?;
        self.advance(Stage::InputBound);
        Ok(hwc)
    }

    pub(crate) fn run(&mut self) -> PipelineResult<()> {
        if let Err(err) = self.interpreter.invoke() {
            warn!(engine = self.engine, error = ?err, "inference pass failed");
            return Err(self.fail(PipelineError::from_invoke(err)));
        }
        self.advance(Stage::Invoked);
        Ok(())
    }

    /// Canonicalizes the configured output and lends its buffer to `read`.
    /// `read` is never called if the tensor is rejected.
    pub(crate) fn bind_output<F>(&mut self, config: &PipelineConfig, read: F) -> PipelineResult<Hwc>
    where
        F: FnOnce(&[f32], Hwc),
    {
        let hwc = self.bind_tensor(TensorRole::Output, config, |data, hwc| read(data, hwc))?;
        self.advance(Stage::OutputBound);
        Ok(hwc)
    }

    pub(crate) fn finish(mut self) {
        self.advance(Stage::Done);
    }

    pub(crate) fn arena_used(&self) -> usize {
        self.interpreter.arena_used()
    }

    pub(crate) fn operator_count(&self) -> usize {
        self.operator_count
    }

    fn bind_tensor<F>(&mut self, role: TensorRole, config: &PipelineConfig, visit: F) -> PipelineResult<Hwc>
    where
        F: FnOnce(&mut [f32], Hwc),
    {
        let engine = self.engine;
        let index = match role {
            TensorRole::Input => config.input_index,
            TensorRole::Output => config.output_index,
        };
        let view = match role {
            TensorRole::Input => self.interpreter.input(index),
            TensorRole::Output => self.interpreter.output(index),
        };
        let Some(view) = view else {
            warn!(engine, %role, index, "tensor index out of range");
            return Err(self.fail(PipelineError::MissingTensor { role, index }));
        };

        let hwc = match check_tensor(role, &view, config) {
            Ok(hwc) => hwc,
            Err(err) => {
                warn!(engine, %role, dims = ?view.shape.dims(), error = %err, "tensor shape rejected");
                return Err(self.fail(err));
            }
        };
        debug!(engine, %role, dims = ?view.shape.dims(), %hwc, "tensor canonicalized");

        visit(view.data, hwc);
        Ok(hwc)
    }

    /// Moves to the absorbing error state and hands `err` back.
    fn fail(&mut self, err: PipelineError) -> PipelineError {
        debug!(engine = self.engine, failed_in = %err.stage(), kind = ?err.kind(), "pipeline failed");
        self.stage = Stage::Error;
        err
    }

    #[cfg(test)]
    fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        if self.stage == Stage::Error {
            return;
        }
        debug!(engine = self.engine, from = %self.stage, to = %next, "pipeline stage");
        self.stage = next;
    }
}

impl<E: Engine> Drop for Session<'_, E> {
    fn drop(&mut self) {
        if self.stage == Stage::Error {
            debug!(engine = self.engine, "releasing bound interpreter after failure");
        } else {
            debug!(engine = self.engine, stage = %self.stage, "releasing bound interpreter");
        }
    }
}

fn check_tensor(role: TensorRole, view: &TensorView<'_>, config: &PipelineConfig) -> PipelineResult<Hwc> {
    if let Some(expected) = config.required_dtype {
        if view.dtype != expected {
            return Err(PipelineError::UnexpectedDType {
                role,
                found: view.dtype,
                expected,
            });
        }
    }
    canonicalize(role, view.shape.dims())
}
