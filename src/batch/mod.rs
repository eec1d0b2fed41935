pub mod expect;
pub mod runner;

pub use expect::{discover_problems, find_expect, ExpectSource};
pub use runner::{run_batch, BatchOptions, BatchOutcome};
