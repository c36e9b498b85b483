pub mod platform;
pub mod streams;

pub use streams::*;
