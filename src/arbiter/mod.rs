pub mod client;
pub mod protocol;
pub mod scheduler;
pub mod server;

pub use client::ArbiterClient;
pub use protocol::{JobRequest, StatusAnswer, DEFAULT_PORT};
pub use server::Server;
