//! Lazily constructed application dependencies: typed keys, per-resource handles that
//! enforce singleton/transient construction and close-once semantics, and a container
//! that tears everything down in reverse order of first successful access.

mod container;
mod error;
mod handle;
mod options;

pub use container::Container;
pub use error::{CloseFailure, DepError};
pub use handle::{Close, CloseWithContext, Dep, DepKey, HealthFn, ResolveFn};
pub use options::{DepOptions, Env, ParseEnvError};
