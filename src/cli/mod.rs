//! CLI-specific utilities for rongyok-dl
//!
//! This module contains code specific to the command-line interface,
//! separate from the core library functionality.

pub mod progress;

pub use progress::{create_merge_bar, ProgressManager};
