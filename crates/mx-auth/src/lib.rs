//! Multi-stage interactive-authentication (UIA) state machine.
//!
//! The server answers an otherwise-legitimate request with HTTP 401 and a
//! body describing remaining stages; [`InteractiveAuth`] negotiates those
//! stages against a caller-supplied [`StageCallback`] until the protected
//! request finally succeeds or a non-UIA error terminates the negotiation.

pub mod challenge;
pub mod driver;

pub use challenge::{DoRequestError, StageError, UiaChallenge};
pub use driver::{AuthRequester, InteractiveAuth, StageCallback};
