pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod extract;
pub mod library;
pub mod models;
pub mod mosaic;
pub mod preview;
pub mod processor;
pub mod scanner;
pub mod smart;

pub use config::Config;
pub use coordinator::{DiscoveryListener, DiscoveryOptions, LibraryCoordinator};
pub use db::Catalog;
pub use models::{DiscoveryResult, SmartCriteria, Video};
