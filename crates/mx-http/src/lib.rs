//! A thin, uniform HTTP surface over `reqwest`. Requests are cancellable and
//! carry an optional local timeout; retry policy is deliberately absent here
//! and lives one layer up, in `mx-scheduler` and `mx-sync`'s keep-alive loop.

pub mod gateway;
pub mod pending;
pub mod upload;

pub use gateway::{GatewayConfig, HttpGateway, Reply};
pub use pending::PendingResult;
pub use upload::{UploadOptions, UploadReply};
