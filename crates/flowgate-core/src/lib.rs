pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
