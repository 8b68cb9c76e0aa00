pub mod controller_handler;
pub mod participant_runner;

pub use controller_handler::{Controller, ParticipateOptions};
pub use participant_runner::ParticipantRunner;
