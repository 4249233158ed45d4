pub mod alertmanager;
pub mod dispatch;
pub mod format;
pub mod gateway;
pub mod metrics;
pub mod rate_limiter;
pub mod twilio;

pub use gateway::{Gateway, GatewayConfig};
pub use twilio::{SmsTransport, TwilioClient, TwilioError};
