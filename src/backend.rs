//! Client-side view of the study server.
//!
//! - `backend_trait`: the [`StudyBackend`] seam used by recorders and the submitter.
//! - `http_backend`: reqwest client speaking the study server's JSON/HTTP API.
//! - `store_backend`: in-process backend writing straight to a [`Storage`](crate::storage::storage_trait::Storage);
//!   the web routes delegate to it as well.

pub mod backend_trait;
pub mod http_backend;
pub mod store_backend;

pub use backend_trait::StudyBackend;
pub use http_backend::HttpBackend;
pub use store_backend::StoreBackend;
