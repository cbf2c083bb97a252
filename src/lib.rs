pub mod args;
pub mod batch;
pub mod cmd;
mod error;
pub mod formats;
pub mod history;
pub mod job;
pub mod locate;
pub mod paths;
pub mod process;
pub mod progress;
pub mod request;
pub mod settings;

pub use error::{Error, Result};
