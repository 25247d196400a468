pub mod config;
pub mod emitter;
pub mod probe;
pub mod registry;
pub mod template;
