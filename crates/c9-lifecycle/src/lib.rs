//! c9-lifecycle: CloudFormation custom-resource handler
//!
//! Receives custom-resource events, runs the provisioning workflow on
//! `Create` and reports the outcome back through the event's pre-signed
//! response URL.

pub mod error;
pub mod event;
pub mod fakes;
pub mod handler;
pub mod response;

pub use error::{LifecycleError, Result};
pub use event::{LifecycleEvent, RequestType, ResourceProperties};
pub use handler::LifecycleHandler;
pub use response::{HttpResponseSender, ResponseDocument, ResponseSender, ResponseStatus};
