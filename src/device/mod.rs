pub mod codec;
pub mod command;
pub mod constants;
pub mod manager;
pub mod recorder;
pub mod types;
