//! Portable, exact scaled dot-product attention.
//!
//! This path favours clarity over absolute performance and materialises the
//! full score matrix, so attention weights can always be returned.

pub mod exact;

pub use exact::ExactAttention;
