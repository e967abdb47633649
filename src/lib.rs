pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod graph_store;
pub mod loader;
pub mod retry;
pub mod schema;
pub mod table;
