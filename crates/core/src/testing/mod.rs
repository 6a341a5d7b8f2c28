//! Shared test utilities for vlm-core.
//!
//! This module provides a scripted mock model whose decoder reads its history
//! back out of the KV cache, and tiny model configurations for integration
//! testing.

mod mock_model;
mod tiny_config;

pub use mock_model::{Script, ScriptedModel};
pub use tiny_config::{tiny_florence_config, tiny_generation_config};
