//! Core campaign types.
//!
//! This module provides:
//! - Address type with validation
//! - Sender, attachment and campaign definitions
//! - Per-recipient delivery results and the campaign report

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::Credentials;
use crate::errors::{ErrorCategory, MailerError, MailerErrorKind, MailerResult};
use crate::recipients::Recipient;

/// Format accepted by [`parse_schedule`].
pub const SCHEDULE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> MailerResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    ///
    /// An empty name is treated as no name.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> MailerResult<Self> {
        let name = name.into();
        let email = email.into();
        Self::validate_email(&email)?;
        if name.contains(['\r', '\n']) {
            return Err(MailerError::new(
                MailerErrorKind::InvalidHeader,
                "Display name cannot contain line breaks",
            ));
        }
        let name = name.trim();
        Ok(Self {
            name: (!name.is_empty()).then(|| name.to_string()),
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> MailerResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    /// Checks the `local@domain` shape required for delivery.
    pub fn validate_email(email: &str) -> MailerResult<()> {
        if email.is_empty() {
            return Err(MailerError::invalid_address("Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(MailerError::invalid_address(
                "Email address too long (max 254 characters)",
            ));
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(MailerError::invalid_address(format!(
                "Email address cannot contain whitespace or control characters: {:?}",
                email
            )));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => {
                return Err(MailerError::invalid_address(format!(
                    "Email address must contain exactly one @: {}",
                    email
                )))
            }
        };

        if local.is_empty() || local.len() > 64 {
            return Err(MailerError::invalid_address(format!(
                "Local part must be 1-64 characters: {}",
                email
            )));
        }

        if domain.is_empty() {
            return Err(MailerError::invalid_address(format!(
                "Domain cannot be empty: {}",
                email
            )));
        }

        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(MailerError::invalid_address(format!(
                "Domain must be a dotted name: {}",
                email
            )));
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the domain part.
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Formats the address for MAIL FROM/RCPT TO.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

impl TryFrom<&str> for Address {
    type Error = MailerError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = MailerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// The mailbox a campaign is sent from.
#[derive(Debug, Clone)]
pub struct Sender {
    /// Envelope and `From` address.
    pub address: Address,
    /// Relay login, when the relay requires one.
    pub credentials: Option<Credentials>,
}

impl Sender {
    /// Creates a sender without credentials.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            credentials: None,
        }
    }

    /// Attaches relay credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Creates a sender that logs into the relay as its own address.
    pub fn authenticated(address: Address, password: impl Into<String>) -> Self {
        let credentials = Credentials::new(address.email.clone(), password);
        Self::new(address).with_credentials(credentials)
    }
}

/// Opaque file attached to every message of a campaign.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename presented to recipients.
    pub filename: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }

    /// Reads an attachment from disk, named after the file.
    pub fn from_path(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MailerError::validation(
                    MailerErrorKind::InvalidHeader,
                    format!("Attachment path has no usable file name: {}", path.display()),
                )
            })?
            .to_string();
        let data = std::fs::read(path).map_err(|e| {
            MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Ok(Self::new(filename, data))
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Parses a `YYYY-MM-DD HH:MM` schedule in the local timezone.
pub fn parse_schedule(s: &str) -> MailerResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), SCHEDULE_FORMAT).map_err(|e| {
        MailerError::configuration(format!(
            "Invalid schedule {:?}, expected {}: {}",
            s, SCHEDULE_FORMAT, e
        ))
    })?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            MailerError::configuration(format!(
                "Schedule {:?} is ambiguous or skipped in the local timezone",
                s
            ))
        })
}

/// A send request: what to send, from whom, and how fast.
#[derive(Debug, Clone)]
pub struct Campaign {
    id: Uuid,
    subject: String,
    body_template: String,
    attachment: Option<Attachment>,
    sender: Sender,
    pacing_delay: Duration,
    scheduled_at: Option<DateTime<Utc>>,
    variables: BTreeMap<String, String>,
}

impl Campaign {
    /// Creates a new campaign builder.
    pub fn builder() -> CampaignBuilder {
        CampaignBuilder::default()
    }

    /// Returns the campaign identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the subject template.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the body template.
    pub fn body_template(&self) -> &str {
        &self.body_template
    }

    /// Returns the attachment, if any.
    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Returns the sender.
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Returns the pause between successive sends.
    pub fn pacing_delay(&self) -> Duration {
        self.pacing_delay
    }

    /// Returns the scheduled start time.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    /// Returns the campaign-wide template variables.
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

/// Builder for campaigns.
#[derive(Debug, Default)]
pub struct CampaignBuilder {
    subject: String,
    body_template: String,
    attachment: Option<Attachment>,
    sender: Option<Sender>,
    pacing_delay: Duration,
    scheduled_at: Option<DateTime<Utc>>,
    variables: BTreeMap<String, String>,
}

impl CampaignBuilder {
    /// Sets the subject template.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the body template.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body_template = body.into();
        self
    }

    /// Sets the attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Sets the sender.
    pub fn sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Sets the pause between successive sends.
    pub fn pacing_delay(mut self, delay: Duration) -> Self {
        self.pacing_delay = delay;
        self
    }

    /// Sets the start time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Sets a campaign-wide template variable.
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Builds the campaign.
    pub fn build(self) -> MailerResult<Campaign> {
        if self.subject.trim().is_empty() {
            return Err(MailerError::validation(
                MailerErrorKind::EmptyTemplate,
                "Subject is required",
            ));
        }

        if self.body_template.trim().is_empty() {
            return Err(MailerError::validation(
                MailerErrorKind::EmptyTemplate,
                "Body template is required",
            ));
        }

        let sender = self
            .sender
            .ok_or_else(|| MailerError::invalid_address("Sender address is required"))?;

        if let Some(attachment) = &self.attachment {
            if attachment.filename.trim().is_empty()
                || attachment.filename.contains(['\r', '\n', '"'])
            {
                return Err(MailerError::validation(
                    MailerErrorKind::InvalidHeader,
                    format!("Invalid attachment filename: {:?}", attachment.filename),
                ));
            }
        }

        Ok(Campaign {
            id: Uuid::new_v4(),
            subject: self.subject,
            body_template: self.body_template,
            attachment: self.attachment,
            sender,
            pacing_delay: self.pacing_delay,
            scheduled_at: self.scheduled_at,
            variables: self.variables,
        })
    }
}

/// Why one recipient did not receive the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Failure bucket.
    pub category: ErrorCategory,
    /// Precise cause.
    pub kind: MailerErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// SMTP reply code, when the server answered.
    pub smtp_code: Option<u16>,
    /// True if a later attempt could succeed.
    pub temporary: bool,
}

impl From<&MailerError> for DeliveryFailure {
    fn from(err: &MailerError) -> Self {
        Self {
            category: err.category(),
            kind: err.kind(),
            message: err.to_string(),
            smtp_code: err.smtp_code(),
            temporary: err.is_temporary(),
        }
    }
}

impl From<MailerError> for DeliveryFailure {
    fn from(err: MailerError) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Outcome for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Accepted by the server.
    Sent {
        /// `Message-ID` of the accepted message.
        message_id: String,
    },
    /// Not delivered.
    Failed(DeliveryFailure),
}

impl DeliveryResult {
    /// Returns true for `Sent`.
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryResult::Sent { .. })
    }

    /// Returns the failure, if any.
    pub fn failure(&self) -> Option<&DeliveryFailure> {
        match self {
            DeliveryResult::Failed(failure) => Some(failure),
            DeliveryResult::Sent { .. } => None,
        }
    }
}

/// A recipient paired with its result.
#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    /// The recipient.
    pub recipient: Recipient,
    /// What happened.
    pub result: DeliveryResult,
}

/// A recipient that was not delivered to.
#[derive(Debug, Clone)]
pub struct FailedRecipient {
    /// The recipient.
    pub recipient: Recipient,
    /// Why delivery failed.
    pub failure: DeliveryFailure,
}

/// How a campaign ended.
#[derive(Debug)]
pub enum CampaignOutcome {
    /// Every recipient was attempted.
    Completed,
    /// The campaign stopped before the send loop.
    Aborted(MailerError),
}

impl CampaignOutcome {
    /// Returns true for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, CampaignOutcome::Completed)
    }
}

/// Summary of one campaign run.
#[derive(Debug)]
pub struct CampaignReport {
    /// Campaign identifier.
    pub campaign_id: Uuid,
    /// Number of recipients in the set.
    pub total: usize,
    /// Messages accepted.
    pub sent: usize,
    /// Recipients not delivered to, in set order.
    pub failed: Vec<FailedRecipient>,
    /// Every attempted recipient, in set order.
    pub results: Vec<RecipientOutcome>,
    /// How the run ended.
    pub outcome: CampaignOutcome,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration, including any scheduled wait.
    pub duration: Duration,
}

impl CampaignReport {
    /// Returns the number of recipients attempted.
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    /// Returns true if the campaign ran to completion.
    pub fn is_completed(&self) -> bool {
        self.outcome.is_completed()
    }

    /// Returns the abort error, if the campaign was aborted.
    pub fn abort_error(&self) -> Option<&MailerError> {
        match &self.outcome {
            CampaignOutcome::Aborted(err) => Some(err),
            CampaignOutcome::Completed => None,
        }
    }

    /// Returns failures that are worth retrying.
    pub fn temporary_failures(&self) -> impl Iterator<Item = &FailedRecipient> {
        self.failed.iter().filter(|f| f.failure.temporary)
    }

    /// Converts an aborted report into its error.
    pub fn into_result(mut self) -> MailerResult<Self> {
        match std::mem::replace(&mut self.outcome, CampaignOutcome::Completed) {
            CampaignOutcome::Aborted(err) => Err(err),
            CampaignOutcome::Completed => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Sender {
        Sender::new(Address::with_name("Campaigns", "news@example.com").unwrap())
    }

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email, "test@example.com");
        assert!(addr.name.is_none());

        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name, Some("John Doe".to_string()));

        let addr = Address::parse("\"John, Doe\" <john@example.com>").unwrap();
        assert_eq!(addr.name, Some("John, Doe".to_string()));
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("test@example.com").is_ok());
        assert!(Address::new("test.name@sub.example.com").is_ok());

        for bad in ["", "no-at-sign", "two@@signs.com", "@no-local.com", "no-domain@", "user@localhost", "a b@example.com"] {
            let err = Address::new(bad).unwrap_err();
            assert_eq!(err.kind(), MailerErrorKind::InvalidAddress, "{}", bad);
            assert_eq!(err.category(), ErrorCategory::Validation);
        }
    }

    #[test]
    fn test_address_rejects_header_injection_in_name() {
        let err = Address::with_name("Eve\r\nBcc: x@evil.com", "eve@example.com").unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::InvalidHeader);
        assert!(Address::with_name("  ", "a@example.com").unwrap().name.is_none());
    }

    #[test]
    fn test_campaign_builder() {
        let campaign = Campaign::builder()
            .subject("Hello {Name}")
            .body("Dear {Name},\n{Signature}")
            .sender(sender())
            .variable("Signature", "The Team")
            .pacing_delay(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(campaign.subject(), "Hello {Name}");
        assert_eq!(campaign.pacing_delay(), Duration::from_secs(1));
        assert_eq!(campaign.variables().get("Signature").map(String::as_str), Some("The Team"));
        assert!(campaign.scheduled_at().is_none());
    }

    #[test]
    fn test_campaign_builder_validation() {
        let err = Campaign::builder().body("x").sender(sender()).build().unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::EmptyTemplate);

        let err = Campaign::builder().subject("x").body("  ").sender(sender()).build().unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::EmptyTemplate);

        let err = Campaign::builder().subject("x").body("y").build().unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::InvalidAddress);

        let err = Campaign::builder()
            .subject("x")
            .body("y")
            .sender(sender())
            .attachment(Attachment::new("bad\r\nname.pdf", vec![1]))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::InvalidHeader);
    }

    #[test]
    fn test_parse_schedule() {
        let at = parse_schedule("2030-01-15 09:30").unwrap();
        let local = at.with_timezone(&Local);
        assert_eq!(local.format(SCHEDULE_FORMAT).to_string(), "2030-01-15 09:30");

        assert!(parse_schedule("tomorrow").is_err());
        assert!(parse_schedule("2030-13-01 00:00").is_err());
    }

    #[test]
    fn test_attachment_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brochure.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let attachment = Attachment::from_path(&path).unwrap();
        assert_eq!(attachment.filename, "brochure.pdf");
        assert_eq!(attachment.data, b"%PDF-1.4");
        assert!(!format!("{:?}", attachment).contains("PDF"));

        assert!(Attachment::from_path(dir.path().join("missing.pdf")).is_err());
    }

    #[test]
    fn test_delivery_failure_from_error() {
        let err = MailerError::from_smtp_reply(crate::errors::SmtpPhase::Recipient, 450, "Mailbox busy");
        let failure = DeliveryFailure::from(&err);
        assert_eq!(failure.category, ErrorCategory::Transport);
        assert_eq!(failure.kind, MailerErrorKind::RecipientRejected);
        assert_eq!(failure.smtp_code, Some(450));
        assert!(failure.temporary);
    }
}
