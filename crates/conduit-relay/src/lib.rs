#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod adaptor;
pub mod controller;
pub mod openai;

pub use adaptor::{AdaptorRegistry, ProviderAdaptor, UpstreamResponse, UpstreamTarget};
pub use controller::{ChatOutcome, RelayController};
pub use openai::OpenAiAdaptor;
