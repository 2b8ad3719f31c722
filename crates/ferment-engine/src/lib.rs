//! Ferment Engine
//!
//! Local implementations of the `ferment-training` engine traits:
//! - `BigramEngine`: CPU bigram model with a trainable low-rank adapter
//! - `ByteTokenizer`: one token per UTF-8 byte
//! - A metadata-only GGUF writer for the interchange export

pub mod bigram;
pub mod checkpoint;
pub mod gguf;
pub mod tokenizer;

pub use bigram::{BigramEngine, BigramModel};
pub use checkpoint::CheckpointConfig;
pub use tokenizer::ByteTokenizer;

use ferment_training::TrainingEngine;
use std::sync::Arc;

/// Names accepted for `model.engine`.
pub const ENGINES: &[&str] = &[BigramEngine::ID];

/// Engine registered under `name`.
pub fn engine_for(name: &str) -> Option<Arc<dyn TrainingEngine>> {
    match name {
        BigramEngine::ID => Some(Arc::new(BigramEngine::new())),
        _ => None,
    }
}
