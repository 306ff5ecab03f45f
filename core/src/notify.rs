// Notification surface
//
// User-visible notices for proxy lifecycle changes and newly served clients.
// Delivery is best effort; callers log and drop failures.

use tracing::info;

/// Callback interface for user notifications
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> Result<(), String>;
}

/// Writes notifications to the log instead of a desktop surface
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<(), String> {
        info!(target: "flurry::notify", "{}: {}", title, body);
        Ok(())
    }
}

pub(crate) mod notices {
    pub const TITLE_STARTED: &str = "Proxy Started";
    pub const BODY_STARTED: &str = "Now helping censored users connect";
    pub const TITLE_STOPPED: &str = "Proxy Stopped";
    pub const BODY_STOPPED: &str = "No longer volunteering";
    pub const TITLE_NEW_CONNECTION: &str = "New Connection";
    pub const TITLE_UNAVAILABLE: &str = "Broker Unavailable";
    pub const TITLE_ERROR: &str = "Proxy Error";
    pub const BODY_START_FAILED: &str = "Failed to start proxy";
    pub const BODY_UNAVAILABLE: &str = "Broker unreachable, gave up reconnecting";

    pub fn serving_client(n: u64) -> String {
        format!("Now serving client #{}", n)
    }
}
