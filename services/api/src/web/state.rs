//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler.

use crate::config::Config;
use std::sync::Arc;
use tutor_core::LearningEngine;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LearningEngine>,
    pub config: Arc<Config>,
}
