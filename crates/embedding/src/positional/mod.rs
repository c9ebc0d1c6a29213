pub mod alibi;
pub mod rope;
pub mod sinusoidal;

pub use alibi::{alibi_slopes, Alibi, AlibiConfig};
pub use rope::{RotaryConfig, RotaryEmbeddings, RotaryScaling};
pub use sinusoidal::{LearnedPositionEmbedding, SinusoidalPositionEncoder};
