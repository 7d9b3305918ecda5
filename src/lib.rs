#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

pub mod config;
#[cfg(unix)]
pub mod control;
#[cfg(unix)]
pub mod daemon;
pub mod health;
pub mod irc;
pub mod plugins;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use runtime::{Bot, Instruction};
