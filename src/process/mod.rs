//! External process supervision: typed command lines and a non-blocking runner.

pub mod command;
pub mod runner;

pub use command::{Arg, CommandSpec};
pub use runner::{ProcessOutcome, ProcessRunner};
