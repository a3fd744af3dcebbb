mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::{Database, StoreTx, WritePolicy};
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use models::*;
