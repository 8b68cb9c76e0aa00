pub mod backend;
pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod error_handling;
pub mod session_management;
pub mod storage;
pub mod web_interface;

pub use session_management::SessionStatus;

#[cfg(test)]
mod test_support;
