pub mod align;
pub mod assembler;
pub mod audio;
pub mod compositor;
pub mod config;
pub mod error;
pub mod images;
pub mod media;
pub mod script;
pub mod subtitle;
pub mod timeline;
pub mod tts;
pub mod workspace;

pub use assembler::{AssemblyReport, Stage, VideoAssembler};
pub use error::{PipelineError, Result};
