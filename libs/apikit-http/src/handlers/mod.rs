//! Built-in handlers.
//!
//! Each handler takes its options at construction and lets a value of the
//! same option type in the request's [`OptionsBag`](crate::OptionsBag)
//! override them for a single call.

mod authorization;
mod chaos;
mod headers_inspection;
mod parameters_name_decoding;
mod redirect;
mod retry;
mod telemetry;
mod user_agent;

pub use authorization::AuthorizationHandler;
pub use chaos::ChaosHandler;
pub use headers_inspection::HeadersInspectionHandler;
pub use parameters_name_decoding::{ParametersNameDecodingHandler, decode_parameter_name};
pub use redirect::{RedirectHandler, is_redirect};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryHandler, calculate_backoff};
pub use telemetry::TelemetryHandler;
pub use user_agent::UserAgentHandler;
