pub mod hash;
pub mod store;

pub use store::{Diff, Registry};
