mod process;
mod types;

pub use process::ProcessEngine;
pub use types::{
    ArtifactDescriptor, EngineError, EngineRequest, ExecutionEngine, Phase, StrategyArtifact,
};
#[cfg(test)]
pub use types::EngineOutput;
