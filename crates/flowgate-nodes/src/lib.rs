pub mod builtin;
pub mod command;
pub mod discovery;
pub mod manifest;
pub mod registry;

pub use command::CommandHandler;
pub use discovery::DiscoveryReport;
pub use manifest::HandlerManifest;
pub use registry::{HandlerBinding, NodeRegistry};
