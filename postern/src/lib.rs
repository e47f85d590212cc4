pub mod controller;

pub use controller::{Postern, SHUTDOWN_BROADCAST, Services};
