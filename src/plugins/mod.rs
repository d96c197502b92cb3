//! Plugin support
//!
//! Only the install-path boundary lives here; loading and running plugins is
//! the plugin loader's job.

pub mod install;

pub use install::{resolve_install_path, InstallTarget, PathRejected};
