pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod lock;
pub mod metadata;
pub mod models;
pub mod registry;
pub mod renderer;
pub mod request;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use error::{AppError, RegistryError, RenderError};
pub use events::{Event, EventKind, Frame};
pub use job::Job;
pub use registry::JobRegistry;
