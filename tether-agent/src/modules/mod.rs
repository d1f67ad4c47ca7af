//! Built-in producer modules.

pub mod system;
