pub mod config;
#[cfg(feature = "jni-bridge")]
pub mod jni_bridge;
pub mod notify;

pub use config::Config;
