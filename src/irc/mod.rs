pub mod connection;
pub mod flood;
pub mod message;

pub use connection::Connection;
pub use message::{format_line, Message, Prefix};
