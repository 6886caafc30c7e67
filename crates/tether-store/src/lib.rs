pub mod database;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identities;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod vault;

pub use database::Database;
pub use error::StoreError;
pub use gateway::SqliteGateway;
pub use vault::Vault;
