pub mod lifecycle;
pub mod paths;

pub use lifecycle::{Lifecycle, LifecyclePolicy};
pub use paths::{PathMapping, RecordingPaths, ResolveError};
