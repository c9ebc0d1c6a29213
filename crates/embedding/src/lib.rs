//! Positional encoding providers.
//!
//! * [`RotaryEmbeddings`] rotates query/key features by position-dependent
//!   angles, with linear, two-segment and frequency-band scaling.
//! * [`Alibi`] produces the per-head distance bias added to attention scores.
//! * [`SinusoidalPositionEncoder`] and [`LearnedPositionEmbedding`] add
//!   absolute encodings to embeddings.
//!
//! Rotary and ALiBi tables grow lazily: when a larger position is requested
//! the whole table is recomputed at the new size, so rows that were already
//! valid never change.

pub mod positional;

pub use positional::*;
