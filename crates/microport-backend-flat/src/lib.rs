//! Reference engine for microport.
//!
//! Models are flat little-endian blobs (see [`format`]) describing f32
//! tensors and a straight-line list of operators. Binding a model plans every
//! tensor into the caller's arena; nothing is heap-allocated for tensor data.

mod arena;
pub mod builder;
pub mod format;
mod interpreter;
mod kernels;

use anyhow::Result;
use microport_core::Engine;

pub use builder::{demo_classifier, ModelBuilder};
pub use format::{FlatModel, MAGIC, SCHEMA_VERSION};
pub use interpreter::FlatInterpreter;

#[derive(Clone, Copy, Debug, Default)]
pub struct FlatEngine;

impl FlatEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for FlatEngine {
    type Model<'m> = FlatModel<'m>;
    type Interpreter<'a> = FlatInterpreter<'a>;

    fn name(&self) -> &'static str {
        "flat"
    }

    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }

    fn parse<'m>(&self, blob: &'m [u8]) -> Result<Self::Model<'m>> {
        FlatModel::parse(blob)
    }

    fn bind<'a>(&self, model: Self::Model<'a>, arena: &'a mut [u8]) -> Result<Self::Interpreter<'a>> {
        FlatInterpreter::new(model, arena)
    }
}
