//! Message routing pipeline.
//!
//! Every inbound event flows through:
//! 1. `instance::normalize()`: validated instances (at startup)
//! 2. `Classifier::classify()`: word rules, then the optional LLM gate
//! 3. `Router::on_message()`: forward dispatch, Forward Records, stats
//! 4. `Router::on_reaction()`: at-most-once feedback routing

pub mod classifier;
pub mod feedback;
pub mod instance;
pub mod processor;
pub mod rules;
pub mod types;

pub use classifier::{Classifier, ResolvedInstance};
pub use feedback::FeedbackTracker;
pub use instance::{Instance, normalize};
pub use processor::{Router, resolve_routes};
