pub mod connection;
pub mod entity;
pub mod repository;
pub mod run_store;

pub use connection::establish_connection;
pub use run_store::RunStore;
