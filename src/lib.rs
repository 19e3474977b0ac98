pub mod common;
pub mod configs;
pub mod monitoring;
pub mod protocol;
pub mod server;
pub mod sources;
pub mod transport;
pub mod worker;
