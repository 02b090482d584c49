//! Outbound email hand-off.
//!
//! The core never waits on delivery. `Notifier::dispatch` spawns the send on
//! its own task under a timeout; failures are logged and dropped so a broken
//! mail path can never undo a committed account or token change.
//!
//! The default dispatcher for local dev is `LogEmailDispatcher`, which logs and
//! returns `Ok(())`. `ChannelEmailDispatcher` forwards messages to a delivery
//! task of the embedder's choosing.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmailTemplate {
    VerifyEmail,
    PasswordReset,
    PasswordChanged,
}

impl EmailTemplate {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerifyEmail => "verify_email",
            Self::PasswordReset => "password_reset",
            Self::PasswordChanged => "password_changed",
        }
    }
}

impl fmt::Display for EmailTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: EmailTemplate,
    pub parameters: Value,
}

/// Email delivery abstraction.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    /// Deliver a message or report why it could not be delivered.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Logs instead of sending. Parameters carry live links, so they only show up
/// at debug level.
#[derive(Clone, Debug)]
pub struct LogEmailDispatcher;

#[async_trait]
impl EmailDispatcher for LogEmailDispatcher {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            "email send stub"
        );
        debug!(parameters = %message.parameters, "email send stub parameters");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ChannelEmailDispatcher {
    sender: mpsc::UnboundedSender<EmailMessage>,
}

impl ChannelEmailDispatcher {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmailMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EmailDispatcher for ChannelEmailDispatcher {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sender
            .send(message.clone())
            .map_err(|_| anyhow!("email delivery channel closed"))
    }
}

/// Fire-and-forget wrapper around an `EmailDispatcher`.
#[derive(Clone)]
pub struct Notifier {
    dispatcher: Arc<dyn EmailDispatcher>,
    timeout: Duration,
}

impl Notifier {
    #[must_use]
    pub fn new(dispatcher: Arc<dyn EmailDispatcher>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
        }
    }

    /// Send `message` in the background. The handle is only useful to tests;
    /// callers normally drop it.
    pub fn dispatch(&self, message: EmailMessage) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let template = message.template;
            match tokio::time::timeout(timeout, dispatcher.send(&message)).await {
                Ok(Ok(())) => debug!(%template, "Email dispatched"),
                Ok(Err(err)) => error!(%template, "Email dispatch failed: {err:#}"),
                Err(_) => error!(%template, "Email dispatch timed out after {timeout:?}"),
            }
        })
    }
}
