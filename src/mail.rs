//! Poison-message notifications over SMTP.
//!
//! When a preprocess or wipe job fails, the failure is almost always
//! deterministic (a corrupt scan, an image the binarizer cannot read), so
//! the message is deleted rather than left to stall the queue — and someone
//! needs to hear about it. Mail settings are optional; without them the
//! failure is only logged.

use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    transport::smtp::authentication::Credentials,
};

use crate::prelude::*;

/// SMTP settings for failure notifications, read from
/// `$HOME/.config/bindery/mailsettings`: six whitespace-separated fields —
/// server, port, user, pass, from, to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub to: String,
}

impl MailSettings {
    /// Read settings from the conventional location.
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let path = Path::new(&home)
            .join(".config")
            .join("bindery")
            .join("mailsettings");
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read mailsettings from {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("failed to parse mailsettings from {}", path.display()))
    }

    fn parse(contents: &str) -> Result<Self> {
        let fields: Vec<&str> = contents.split_whitespace().collect();
        let [server, port, user, pass, from, to] = fields[..] else {
            return Err(anyhow!(
                "need 6 whitespace-separated fields, got {}",
                fields.len()
            ));
        };
        Ok(Self {
            server: server.to_owned(),
            port: port.parse().context("port is not a number")?,
            user: user.to_owned(),
            pass: pass.to_owned(),
            from: from.to_owned(),
            to: to.to_owned(),
        })
    }

    /// Send a notification mail.
    pub async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let email = Message::builder()
            .from(self.from.parse().context("bad from address")?)
            .to(self.to.parse().context("bad to address")?)
            .subject(subject)
            .body(body.to_owned())
            .context("failed to build notification mail")?;
        let transport: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.server)
                .context("failed to configure SMTP transport")?
                .port(self.port)
                .credentials(Credentials::new(self.user.clone(), self.pass.clone()))
                .build();
        transport
            .send(email)
            .await
            .with_context(|| format!("failed to send notification via {}", self.server))?;
        Ok(())
    }
}

/// Best-effort poison notification: look up mail settings and send the
/// failure report with recent logs attached. Failures here are logged and
/// swallowed; notification must never mask the original error.
pub async fn notify_poison(queue: &str, bookname: &str, err: &anyhow::Error, logs: &str) {
    let settings = match MailSettings::load() {
        Ok(settings) => settings,
        Err(load_err) => {
            warn!("Not sending poison notification: {:#}", load_err);
            return;
        }
    };
    let subject = format!("[bindery] Error in {queue} queue with {bookname}");
    let body = format!("Fail message: {err:#}\n\nFull log:\n{logs}\n");
    if let Err(send_err) = settings.send(&subject, &body).await {
        warn!("Error sending poison notification: {:#}", send_err);
    }
}
