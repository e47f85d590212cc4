//! Test support for end-to-end runs of a whole postern instance.

pub mod harness;
#[path = "../../../postern-delivery/tests/support/mock_server.rs"]
pub mod mock_server;

pub use harness::E2ETestHarness;
pub use mock_server::SmtpCommand;
