pub mod definition;
pub mod error;
pub mod listener;
pub mod lockfile;
pub mod naming;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod quality;
pub mod run;
pub mod stages;
pub mod templates;
pub mod validation;

pub use definition::PipelineDefinition;
pub use error::StageError;
pub use pipeline::{PipelineExecutor, StageRegistry, build_pipeline};
pub use run::{PipelineRun, RunStatus};
