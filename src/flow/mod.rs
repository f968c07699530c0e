pub mod evaluator;
pub mod ifelse;
pub mod looping;
pub mod replicate;
pub mod target;
