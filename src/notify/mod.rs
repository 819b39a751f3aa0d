//! Notification channel to the sfdroid renderer
//!
//! The Android system service reports application component starts and
//! closes to the renderer over a Unix Domain Socket. The sending half lives
//! in [`client`]; [`server`] implements the receiving half for tooling and
//! tests.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{send_notification, Connector, NotificationClient, SharedClient, UnixConnector};
pub use error::{NotifyError, WriteStage};
pub use protocol::{AppEvent, Frame, NotifyKind};
pub use server::run_listener;

/// Runtime directory shared with the renderer
pub const SFDROID_ROOT: &str = "/tmp/sfdroid";

/// Socket the renderer listens on for app helper notifications
pub const APP_HELPERS_HANDLE_FILE: &str = "/tmp/sfdroid/app_helpers_handle";

/// Default socket path for the renderer's notification handle
pub fn socket_path() -> std::path::PathBuf {
    std::path::PathBuf::from(APP_HELPERS_HANDLE_FILE)
}
