use std::fmt;

/// States of one pipeline call. Calls only move forward. Any failure moves
/// the call to the absorbing `Error` state; the state it failed in is
/// reported through [`crate::PipelineError::stage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Unloaded,
    Validated,
    Allocated,
    InputBound,
    Invoked,
    OutputBound,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Unloaded => "unloaded",
            Stage::Validated => "validated",
            Stage::Allocated => "allocated",
            Stage::InputBound => "input-bound",
            Stage::Invoked => "invoked",
            Stage::OutputBound => "output-bound",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
