pub mod canonical;
pub mod engine;
pub mod error;
pub mod stage;
pub mod tensor;

pub use canonical::*;
pub use engine::*;
pub use error::*;
pub use stage::*;
pub use tensor::*;
