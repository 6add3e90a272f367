mod store;

pub use store::{join_key, ArtifactError, ArtifactStore};
