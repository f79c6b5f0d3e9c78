pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod token_bucket;

pub use background::BackgroundTaskTracker;
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use registry::{ClientRegistry, RateLimit};
pub use server::{create_app, Server};
pub use shutdown::{ShutdownCoordinator, ShutdownState, ShutdownTrigger};
