pub mod codec;
pub mod connection;
pub mod constants;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod types;
