//! Client side of the SMTP wire protocol.
//!
//! [`SmtpClient`] owns one TCP transport and speaks plain command/response
//! text over it. It makes no decisions about what a reply means for a
//! message; callers classify [`Response`]s by their leading digit.

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, TransferEncoding, encode_body};
