pub mod config;
pub mod config_writer;
pub mod events;
pub mod message;
pub mod msg_dispatcher;
pub mod relpath;
