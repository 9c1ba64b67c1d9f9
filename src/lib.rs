pub mod declaration;
pub mod error;
pub mod jobs;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod resources;
pub mod security;
pub mod synth;
pub mod validation;

pub use declaration::{ResolutionContext, StackDeclaration};
pub use error::{StackError, StackResult};
pub use pipeline::{PipelineExecutor, PipelineRun, PipelineStatus};
pub use synth::{ResourceGraph, synthesize};
