//! Concrete collaborator adapters.
//!
//! The controller only knows the stage traits; these adapters bind them to
//! real backends: an OpenAI-compatible chat endpoint for rewrites, a
//! streaming speech endpoint for synthesis, and a whisper.cpp style CLI
//! for recognition.

pub mod recognize;
pub mod rewrite;
pub mod synth;

pub use recognize::CommandRecognizer;
pub use rewrite::HttpRewriter;
pub use synth::HttpSynthesizer;
