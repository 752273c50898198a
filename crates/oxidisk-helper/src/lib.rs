//! Privileged helper: JSON request in, JSON-line event stream and a final
//! JSON response out. The desktop shell talks to the engine through this
//! binary only.

pub mod cli;
pub mod request;

pub use request::{dispatch, HelperRequest, HelperResponse};
