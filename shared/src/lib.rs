pub mod protocol;
pub mod types;

pub use protocol::{Notification, RegistrationService};
pub use types::{Record, ServiceEntry};
