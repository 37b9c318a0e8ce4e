pub mod mock;
#[cfg(feature = "host")]
pub mod scripted;
