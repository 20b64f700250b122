// ABOUTME: Command module aggregator for the conveyor CLI.
// ABOUTME: Re-exports push, plan, run inspection, abort, and resume handlers.

mod connection;
mod push;
mod resume;
mod runs;

pub use push::{plan, push};
pub use resume::resume;
pub use runs::{abort, runs, status};
