pub mod config;
pub mod key;

pub use config::EdgeConfig;
pub use key::{FunctionKey, KeyError};
