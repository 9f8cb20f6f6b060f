// EvoFlow reference components
// A PSO algorithm and dense benchmark problems for driving workflows

pub mod problems;
pub mod pso;

pub use problems::{Ackley, Sphere};
pub use pso::Pso;
