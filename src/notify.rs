//! User-visible notifications (toasts).
//!
//! SYSTEM CONTEXT
//! ==============
//! The session manager reports outcomes of background operations (sign-out,
//! profile writes) only through this sink, so delivery is fire-and-forget:
//! sinks never fail and never block the caller.

use tokio::sync::mpsc;

/// Visual treatment of a notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Variant {
    #[default]
    Default,
    Destructive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: Option<String>,
    pub variant: Variant,
}

impl Notification {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), description: None, variant: Variant::Default }
    }

    /// Shorthand for a destructive notification carrying an error message.
    #[must_use]
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(title).description(description).destructive()
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn destructive(mut self) -> Self {
        self.variant = Variant::Destructive;
        self
    }
}

/// Destination for notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let description = notification.description.as_deref().unwrap_or("");
        match notification.variant {
            Variant::Default => tracing::info!(title = %notification.title, description, "notification"),
            Variant::Destructive => tracing::warn!(title = %notification.title, description, "notification"),
        }
    }
}

/// Forwards notifications to a UI task over an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("notification receiver closed; dropping notification");
        }
    }
}

#[cfg(test)]
#[path = "notify_test.rs"]
mod tests;
