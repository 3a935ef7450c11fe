//! Podview — Live Camera Stream Viewer
//!
//! Keeps live MJPEG camera feeds on screen: retry with backoff, visibility
//! handling, stall detection, and backend health checks.
//!
//! ## Quick start
//!
//! ```no_run
//! use podview::viewer::{EngineOptions, ViewerEngine};
//!
//! let options = EngineOptions::new(vec!["http://camera.local/stream".to_string()]);
//! let engine = ViewerEngine::new(options)?;
//! # Ok::<(), podview::error::ViewerError>(())
//! ```

pub mod config;
pub mod error;
pub mod settings;
pub mod stream;
pub mod viewer;
