pub mod connection;
pub mod engine;
