//! Mock implementations for testing.
//!
//! [`MockTransport`] and [`StaticMxLookup`] stand in for the network so a
//! [`crate::engine::DeliveryEngine`] can run whole campaigns in-process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::auth::Credentials;
use crate::errors::{MailerError, MailerErrorKind, MailerResult, SmtpPhase};
use crate::mime::Message;
use crate::recipients::{Recipient, RecipientSet};
use crate::resolver::{MxLookup, MxRecord, TransportEndpoint};
use crate::transport::{MailSession, MailTransport};
use crate::types::{Address, Campaign, Sender};

#[derive(Debug, Default)]
struct TransportState {
    fail_open: Option<MailerErrorKind>,
    fail_open_hosts: HashMap<String, MailerErrorKind>,
    rejected: HashMap<String, u16>,
    dropped: Vec<String>,
    fail_close: bool,
    opened: Vec<TransportEndpoint>,
    usernames: Vec<Option<String>>,
    sent: Vec<Message>,
    resets: usize,
    closes: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted in-memory transport.
///
/// Clones share state, so a test can keep one handle and give another to the
/// engine.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    /// Creates a transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `open` fail with `kind`.
    pub fn fail_open(&self, kind: MailerErrorKind) -> &Self {
        lock(&self.state).fail_open = Some(kind);
        self
    }

    /// Makes `open` fail with `kind` for one host.
    pub fn fail_open_for(&self, host: &str, kind: MailerErrorKind) -> &Self {
        lock(&self.state)
            .fail_open_hosts
            .insert(host.to_ascii_lowercase(), kind);
        self
    }

    /// Makes RCPT for `email` fail with `code`.
    pub fn reject_recipient(&self, email: &str, code: u16) -> &Self {
        lock(&self.state).rejected.insert(email.to_string(), code);
        self
    }

    /// Makes the connection drop while sending to `email`.
    pub fn drop_connection_for(&self, email: &str) -> &Self {
        lock(&self.state).dropped.push(email.to_string());
        self
    }

    /// Makes QUIT fail on every session.
    pub fn fail_close(&self) -> &Self {
        lock(&self.state).fail_close = true;
        self
    }

    /// Returns messages accepted so far, in order.
    pub fn sent_messages(&self) -> Vec<Message> {
        lock(&self.state).sent.clone()
    }

    /// Returns every endpoint a session was opened to, in order.
    pub fn opened_endpoints(&self) -> Vec<TransportEndpoint> {
        lock(&self.state).opened.clone()
    }

    /// Returns the username presented on each successful open.
    pub fn authenticated_users(&self) -> Vec<Option<String>> {
        lock(&self.state).usernames.clone()
    }

    /// Returns how many times RSET was issued.
    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }

    /// Returns how many sessions were closed.
    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn open(
        &self,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
    ) -> MailerResult<Box<dyn MailSession>> {
        let mut state = lock(&self.state);
        let failure = state
            .fail_open
            .or_else(|| state.fail_open_hosts.get(&endpoint.host().to_ascii_lowercase()).copied());

        if let Some(kind) = failure {
            return Err(MailerError::new(kind, format!("Mock open failure for {}", endpoint)));
        }

        state.opened.push(endpoint.clone());
        state
            .usernames
            .push(credentials.map(|c| c.username().to_string()));

        Ok(Box::new(MockSession {
            state: self.state.clone(),
            endpoint: endpoint.clone(),
            usable: true,
            in_transaction: false,
        }))
    }
}

/// Session handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockSession {
    state: Arc<Mutex<TransportState>>,
    endpoint: TransportEndpoint,
    usable: bool,
    in_transaction: bool,
}

#[async_trait]
impl MailSession for MockSession {
    async fn send(&mut self, message: &Message) -> MailerResult<()> {
        if !self.usable {
            return Err(MailerError::new(MailerErrorKind::SessionClosed, "Session is closed"));
        }

        let mut state = lock(&self.state);
        if state.dropped.contains(&message.envelope_to) {
            self.usable = false;
            return Err(MailerError::new(
                MailerErrorKind::ConnectionReset,
                format!("Connection to {} reset", self.endpoint),
            ));
        }

        if let Some(code) = state.rejected.get(&message.envelope_to).copied() {
            self.in_transaction = true;
            return Err(MailerError::from_smtp_reply(
                SmtpPhase::Recipient,
                code,
                format!("Recipient {} rejected", message.envelope_to),
            ));
        }

        state.sent.push(message.clone());
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn reset(&mut self) -> MailerResult<()> {
        if self.in_transaction {
            lock(&self.state).resets += 1;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn close(&mut self) -> MailerResult<()> {
        let mut state = lock(&self.state);
        state.closes += 1;
        self.usable = false;
        if state.fail_close {
            return Err(MailerError::new(
                MailerErrorKind::ConnectionReset,
                format!("QUIT to {} failed", self.endpoint),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MxAnswer {
    Records(Vec<MxRecord>),
    Failure,
}

/// MX lookup answering from a fixed table.
///
/// Domains not in the table have no MX records.
#[derive(Debug, Clone, Default)]
pub struct StaticMxLookup {
    answers: HashMap<String, MxAnswer>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StaticMxLookup {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `domain` with `records`.
    pub fn with_records(mut self, domain: &str, records: Vec<MxRecord>) -> Self {
        self.answers
            .insert(domain.to_ascii_lowercase(), MxAnswer::Records(records));
        self
    }

    /// Answers `domain` with a single exchange.
    pub fn with_exchange(self, domain: &str, exchange: &str) -> Self {
        self.with_records(domain, vec![MxRecord::new(exchange, 10)])
    }

    /// Makes lookups of `domain` fail.
    pub fn with_failure(mut self, domain: &str) -> Self {
        self.answers
            .insert(domain.to_ascii_lowercase(), MxAnswer::Failure);
        self
    }

    /// Returns how many times `domain` was looked up.
    pub fn lookups_for(&self, domain: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|d| d.eq_ignore_ascii_case(domain))
            .count()
    }
}

#[async_trait]
impl MxLookup for StaticMxLookup {
    async fn lookup_mx(&self, domain: &str) -> MailerResult<Vec<MxRecord>> {
        lock(&self.calls).push(domain.to_string());

        match self.answers.get(&domain.to_ascii_lowercase()) {
            Some(MxAnswer::Records(records)) => Ok(records.clone()),
            Some(MxAnswer::Failure) => Err(MailerError::resolution(
                MailerErrorKind::DnsLookupFailed,
                format!("Mock DNS failure for {}", domain),
            )),
            None => Ok(Vec::new()),
        }
    }
}

/// Creates a test sender.
pub fn test_sender() -> Sender {
    let address = Address {
        name: Some("Acme News".to_string()),
        email: "news@acme.example".to_string(),
    };
    Sender::authenticated(address, "app-password")
}

/// Creates a test campaign personalised with `{Name}`.
pub fn test_campaign() -> MailerResult<Campaign> {
    Campaign::builder()
        .subject("Hello {Name}")
        .body("Dear {Name},\n\nOur spring catalogue is out.\n\n{Signature}")
        .sender(test_sender())
        .variable("Signature", "The Acme Team")
        .build()
}

/// Creates `count` recipients at `domain`.
pub fn test_recipients(count: usize, domain: &str) -> RecipientSet {
    (0..count)
        .map(|i| Recipient::new(format!("User {}", i), format!("user{}@{}", i, domain)))
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsMode;

    fn endpoint(host: &str) -> TransportEndpoint {
        TransportEndpoint::DomainMx {
            resolved_host: host.to_string(),
            port: 25,
            tls_mode: TlsMode::StartTls,
        }
    }

    fn message(to: &str) -> Message {
        Message {
            envelope_from: "news@acme.example".to_string(),
            envelope_to: to.to_string(),
            message_id: "1@acme.example".to_string(),
            subject: "Hi".to_string(),
            content: b"Subject: Hi\r\n\r\nBody\r\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let transport = MockTransport::new();
        transport.reject_recipient("bob@example.com", 550);

        let mut session = transport.open(&endpoint("mx.example.com"), None).await.unwrap();
        session.send(&message("alice@example.com")).await.unwrap();

        let err = session.send(&message("bob@example.com")).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::RecipientRejected);
        session.reset().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(transport.sent_messages().len(), 1);
        assert_eq!(transport.reset_count(), 1);
        assert_eq!(transport.close_count(), 1);
        assert_eq!(transport.authenticated_users(), vec![None]);
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let transport = MockTransport::new();
        transport.fail_open_for("down.example.com", MailerErrorKind::ConnectionRefused);

        let err = transport.open(&endpoint("DOWN.example.com"), None).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::ConnectionRefused);
        assert!(transport.open(&endpoint("up.example.com"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_connection_poisons_session() {
        let transport = MockTransport::new();
        transport.drop_connection_for("carol@example.com");

        let mut session = transport.open(&endpoint("mx.example.com"), None).await.unwrap();
        let err = session.send(&message("carol@example.com")).await.unwrap_err();
        assert!(err.kind().poisons_session());
        assert!(!session.is_usable());
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let lookup = StaticMxLookup::new()
            .with_exchange("example.com", "mx.example.com.")
            .with_failure("broken.example");

        assert_eq!(lookup.lookup_mx("EXAMPLE.com").await.unwrap().len(), 1);
        assert!(lookup.lookup_mx("unknown.example").await.unwrap().is_empty());
        let err = lookup.lookup_mx("broken.example").await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::DnsLookupFailed);
        assert_eq!(lookup.lookups_for("example.com"), 1);
    }

    #[test]
    fn test_fixtures() {
        let campaign = test_campaign().unwrap();
        assert!(campaign.sender().credentials.is_some());
        assert_eq!(test_recipients(3, "example.com").len(), 3);
    }
}
