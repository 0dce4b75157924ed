//! # Bulk Mail Integration Library
//!
//! Personalized email campaigns delivered one message per recipient:
//! - Contact lists from tables or CSV, with `{Key}` subject/body templates
//! - Delivery through an authenticated relay or directly to each domain's MX
//! - Transport security (STARTTLS, implicit TLS) and AUTH PLAIN, LOGIN, CRAM-MD5
//! - MIME messages with an optional attachment
//! - Scheduled start and pacing between sends
//! - Per-recipient results, never a silent drop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_bulk_mail::{
//!     Address, Campaign, ContactTable, DeliveryEngine, MailerConfig, RecipientSet, Sender,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MailerConfig::builder()
//!         .relay("smtp.example.com", 587)
//!         .build()?;
//!     let engine = DeliveryEngine::new(config)?;
//!
//!     let table = ContactTable::from_path("contacts.csv")?;
//!     let recipients = RecipientSet::load(&table)?;
//!
//!     let sender = Sender::authenticated(Address::new("news@example.com")?, "app-password");
//!     let campaign = Campaign::builder()
//!         .subject("Hello {Name}")
//!         .body("Dear {Name},\n\nThanks for subscribing.")
//!         .sender(sender)
//!         .build()?;
//!
//!     let report = engine.deliver(campaign, recipients).await.into_result()?;
//!     println!("sent {} of {}", report.sent, report.total);
//!     for failed in &report.failed {
//!         println!("{}: {}", failed.recipient.email, failed.failure);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Campaign inputs
pub mod recipients;
pub mod template;

// Protocol layer
pub mod protocol;

// Authentication
pub mod auth;

// Routing
pub mod resolver;

// Transport layer
pub mod transport;

// MIME encoding
pub mod mime;

// Delivery
pub mod engine;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use config::{
    DeliveryMode, MailerConfig, MailerConfigBuilder, MxConfig, RelayConfig, TlsConfig, TlsMode,
    TlsVersion,
};
pub use engine::{DeliveryEngine, DeliveryObserver, EngineState};
pub use errors::{ErrorCategory, MailerError, MailerErrorKind, MailerResult};
pub use mime::{Message, MessageBuilder};
pub use observability::{CampaignMetrics, MetricsSnapshot};
pub use recipients::{ContactTable, CsvLayout, Recipient, RecipientSet};
pub use resolver::{DnsMxLookup, MxLookup, MxRecord, TransportEndpoint, TransportResolver};
pub use template::{render, Template, TemplateCatalog, TemplateEntry, TemplateVariables};
pub use transport::{MailSession, MailTransport, SmtpTransport};
pub use types::{
    parse_schedule, Address, Attachment, Campaign, CampaignBuilder, CampaignOutcome,
    CampaignReport, DeliveryFailure, DeliveryResult, FailedRecipient, RecipientOutcome, Sender,
};
