//! Alert mail boundary.
//!
//! The failure monitor only needs "deliver this text to an operator"; the
//! transport is injected so tests never touch a real MTA.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use crate::core::errors::{CrawlerError, Result};

/// Outbound alert transport.
pub trait Mailer: Send + Sync {
    /// Deliver `body` with `subject` to `to`.
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Delivers through the system sendmail binary (`sendmail -t`).
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    program: PathBuf,
}

impl SendmailMailer {
    /// Mailer pointed at the conventional sendmail location.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("/usr/sbin/sendmail"),
        }
    }

    /// Override the sendmail binary location.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SendmailMailer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CrawlerError::Mail {
                details: format!("spawn {}: {e}", self.program.display()),
            })?;

        let message = format!("To: {to}\nSubject: {subject}\n\n{body}\n");
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(message.as_bytes())
                .map_err(|e| CrawlerError::Mail {
                    details: format!("write message: {e}"),
                })?;
        }
        let status = child.wait().map_err(|e| CrawlerError::Mail {
            details: format!("wait: {e}"),
        })?;
        if !status.success() {
            return Err(CrawlerError::Mail {
                details: format!("sendmail exited with {status}"),
            });
        }
        Ok(())
    }
}

/// One delivered message, as recorded by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// In-memory transport for tests; records instead of delivering.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl MemoryMailer {
    /// Empty capture buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.sent.lock().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
