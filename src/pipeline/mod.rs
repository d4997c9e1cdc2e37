//! The three consumers that turn the event log into approval state and
//! notifications.

pub mod actions;
pub mod materializer;
pub mod notifier;

pub use actions::ActionProcessor;
pub use materializer::Materializer;
pub use notifier::Dispatcher;
