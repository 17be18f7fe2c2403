//! Core library modules for rongyok-dl
//!
//! This module contains the internal implementation details of the rongyok-dl library.

pub mod control;
pub mod downloader;
pub mod error;
pub mod merger;
pub mod selection;
pub mod session;
pub mod source;
pub mod state;
pub mod stream;

// Re-export main types for internal use
pub use downloader::Downloader;
pub use source::{RongyokResolver, SourceConfig};
