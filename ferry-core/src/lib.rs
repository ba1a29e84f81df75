pub mod address;
pub mod config;
pub mod error;
pub mod relocate;
pub mod uri;

pub use address::ResourceAddress;
pub use config::GatewayConfig;
pub use error::FerryError;
