pub mod config;
pub mod connection;
pub mod creation;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod messaging;
pub mod presence;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::SyncError;
pub use hub::Hub;
