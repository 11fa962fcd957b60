use microport_core::DType;

/// Per-pipeline settings. The defaults drive the first input and first
/// output with no element-type restriction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Index of the tensor handed to the input-fill callback.
    pub input_index: usize,
    /// Index of the tensor handed to the output-read callback.
    pub output_index: usize,
    /// When set, both tensors must carry this element type.
    pub required_dtype: Option<DType>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_index: 0,
            output_index: 0,
            required_dtype: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_required_dtype(mut self, dtype: DType) -> Self {
        self.required_dtype = Some(dtype);
        self
    }
}
