//! Core domain models
//!
//! Definition schema, expression language, trigger rules, the parsed
//! definition graph and the result records produced by a run.

pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod pipeline;
pub mod settings;
pub mod state;
pub mod step;
pub mod trigger;

pub use context::*;
pub use error::*;
pub use pipeline::*;
pub use settings::*;
pub use state::*;
pub use step::*;
pub use trigger::*;
