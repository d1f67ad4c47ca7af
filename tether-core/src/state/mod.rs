pub mod connection;
mod log;

pub use connection::ConnectionState;
pub use log::{StatusEvent, TransitionLog};
