//! Outbound delivery channels.

pub mod email;
pub mod fanout;
pub mod webhook;
