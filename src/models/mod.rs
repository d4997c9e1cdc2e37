pub mod approval;
pub mod audit;
pub mod channel;
pub mod envelope;
pub mod event;
