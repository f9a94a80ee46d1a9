pub mod ma_crossover;

pub use ma_crossover::{MaCrossoverConfig, MaCrossoverStrategy};
