pub mod backend;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod options;
pub mod preflight;
pub mod sse;

pub use backend::{Backend, BackendKind, Chunk, TokenizeResult};
pub use coordinator::{Coordinator, Generation, GenerationContext, GenerationState};
pub use error::QuillError;
pub use options::{CompletionRequest, MirostatMode, SamplingOptions};
