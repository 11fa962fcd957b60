use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use microport_core::DType;

#[derive(Parser, Debug)]
#[command(name = "microport", version, about = "Arena-bound inference over flat model blobs")]
pub struct Cli {
    /// Log filter (EnvFilter syntax)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the canonical input and output geometry of a model
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Run one inference pass
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Raw little-endian f32 input; zeros when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Write the output as raw little-endian f32 instead of printing it
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Write the 96x96x1 -> 10 demo classifier
    Demo {
        #[arg(long, default_value = "demo.mpfb")]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Path to a flat model blob
    #[arg(long)]
    pub model: PathBuf,

    /// Tensor arena size in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub arena_size: usize,

    /// Require every bound tensor to have this element type (f32, f16, i32, i8, u8)
    #[arg(long)]
    pub require_dtype: Option<DType>,
}
