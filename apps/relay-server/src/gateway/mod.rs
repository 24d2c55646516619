pub mod connection;
pub mod fanout;
pub mod handler;
pub mod notify;
pub mod presence;
pub mod relay;
pub mod rooms;
pub mod server;
