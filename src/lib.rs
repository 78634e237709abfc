//! exambox - sandboxed code previews, autosave and environment checks for
//! an online assessment platform, plus a proxy to its backend API.

pub mod autosave;
pub mod config;
pub mod error;
pub mod http_server;
pub mod output;
pub mod proctor;
pub mod proxy;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod tree;

pub use error::{Error, Result};
