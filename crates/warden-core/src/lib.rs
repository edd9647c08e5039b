pub mod assemble;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod fragment;
pub mod gate;
pub mod history;
pub mod hooks;
pub mod io;
pub mod layer;
pub mod patterns;
pub mod phase;
pub mod registry;
pub mod storage;
pub mod token;
pub mod trigger;

pub use error::{Result, WardenError};
