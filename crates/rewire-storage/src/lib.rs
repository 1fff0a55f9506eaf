pub mod db;
pub mod migrations;
pub mod models;
pub mod store;

pub use db::Database;
pub use models::{BudgetState, EndReason, SessionRecord, Settings};
pub use store::{BudgetStore, MemoryStore, StoreError};
