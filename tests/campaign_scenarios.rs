//! End-to-end campaign scenarios against the in-memory transport.

use integrations_bulk_mail::config::MxConfig;
use integrations_bulk_mail::mocks::{test_sender, MockTransport, StaticMxLookup};
use integrations_bulk_mail::{
    Attachment, Campaign, ContactTable, CsvLayout, DeliveryEngine, DeliveryMode, ErrorCategory,
    MailerConfig, MailerErrorKind, MxRecord, Recipient, RecipientSet, TlsMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn relay_engine(transport: &MockTransport) -> DeliveryEngine {
    let config = assert_ok!(MailerConfig::builder()
        .relay("smtp.relay.example", 587)
        .tls_mode(TlsMode::StartTlsRequired)
        .build());
    assert_ok!(DeliveryEngine::with_components(
        config,
        Arc::new(transport.clone()),
        Arc::new(StaticMxLookup::new()),
    ))
}

fn mx_engine(transport: &MockTransport, lookup: StaticMxLookup) -> DeliveryEngine {
    let config = assert_ok!(MailerConfig::builder()
        .delivery(DeliveryMode::DirectMx(MxConfig::default()))
        .build());
    assert_ok!(DeliveryEngine::with_components(
        config,
        Arc::new(transport.clone()),
        Arc::new(lookup),
    ))
}

fn campaign(subject: &str, body: &str) -> Campaign {
    assert_ok!(Campaign::builder()
        .subject(subject)
        .body(body)
        .sender(test_sender())
        .build())
}

#[tokio::test]
async fn test_mixed_mx_batch() {
    let transport = MockTransport::new();
    transport.fail_open_for("mx.down.example", MailerErrorKind::ConnectionRefused);
    let lookup = StaticMxLookup::new()
        .with_records(
            "good.example",
            vec![MxRecord::new("backup.good.example.", 20), MxRecord::new("mx.good.example.", 10)],
        )
        .with_exchange("down.example", "mx.down.example")
        .with_failure("flaky.example");
    let engine = mx_engine(&transport, lookup.clone());

    let recipients: RecipientSet = vec![
        Recipient::new("Ann", "ann@good.example"),
        Recipient::new("Ben", "ben@nomx.example"),
        Recipient::new("Cat", "cat@down.example"),
        Recipient::new("Dan", "dan@good.example"),
        Recipient::new("Eve", "eve@flaky.example"),
        Recipient::new("Fay", "fay@nomx.example"),
        Recipient::new("Gus", "gus"),
    ]
    .into();

    let report = engine.deliver(campaign("Hi {Name}", "Hello {Name}"), recipients).await;

    assert!(report.is_completed());
    assert_eq!(report.total, 7);
    assert_eq!(report.sent, 2);
    assert_eq!(report.sent + report.failed.len(), report.total);

    let failed: Vec<(&str, MailerErrorKind)> = report
        .failed
        .iter()
        .map(|f| (f.recipient.email.as_str(), f.failure.kind))
        .collect();
    assert_eq!(
        failed,
        vec![
            ("ben@nomx.example", MailerErrorKind::NoMxRecords),
            ("cat@down.example", MailerErrorKind::ConnectionRefused),
            ("eve@flaky.example", MailerErrorKind::DnsLookupFailed),
            ("fay@nomx.example", MailerErrorKind::NoMxRecords),
            ("gus", MailerErrorKind::MissingDomain),
        ]
    );
    assert_eq!(report.failed[0].failure.category, ErrorCategory::Resolution);
    assert_eq!(report.failed[1].failure.category, ErrorCategory::Transport);

    // One session for good.example, reached through its preferred exchange.
    let opened = transport.opened_endpoints();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].host(), "mx.good.example");
    assert_eq!(opened[0].port(), 25);
    assert!(opened[0].use_starttls());

    assert_eq!(lookup.lookups_for("good.example"), 1);
    assert_eq!(lookup.lookups_for("nomx.example"), 1);

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.emails_sent, 2);
    assert_eq!(snapshot.resolution_failures, 4);
    assert_eq!(snapshot.transport_failures, 1);
}

#[tokio::test]
async fn test_fatal_auth_failure() {
    let transport = MockTransport::new();
    transport.fail_open(MailerErrorKind::CredentialsInvalid);
    let engine = relay_engine(&transport);

    let recipients: RecipientSet = (0..10)
        .map(|i| Recipient::new(format!("R{}", i), format!("r{}@example.com", i)))
        .collect::<Vec<_>>()
        .into();

    let report = engine.deliver(campaign("Hi {Name}", "Body"), recipients).await;

    assert!(!report.is_completed());
    assert_eq!(report.total, 10);
    assert_eq!(report.sent, 0);
    assert_eq!(report.attempted(), 0);
    assert!(transport.sent_messages().is_empty());

    let err = assert_err!(report.into_result());
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert_eq!(err.kind(), MailerErrorKind::CredentialsInvalid);
}

#[tokio::test]
async fn test_preflight_template_error() {
    let transport = MockTransport::new();
    let engine = relay_engine(&transport);
    let recipients: RecipientSet = vec![Recipient::new("Ann", "ann@example.com")].into();

    let report = engine.deliver(campaign("Hello {Name", "Body"), recipients).await;

    let err = assert_err!(report.into_result());
    assert_eq!(err.kind(), MailerErrorKind::MalformedTemplate);
    assert_eq!(err.category(), ErrorCategory::Template);
    assert!(transport.opened_endpoints().is_empty());
}

#[tokio::test]
async fn test_csv_contacts_with_extra_fields() {
    let csv = "Name,Email,Company\n Ann , ann@example.com ,Acme\nBen,ben@example.com,Globex\n";
    let table = assert_ok!(ContactTable::from_csv_str(csv, CsvLayout::WithHeaders));
    let recipients = assert_ok!(RecipientSet::load(&table));
    assert_eq!(recipients.len(), 2);

    let transport = MockTransport::new();
    let engine = relay_engine(&transport);
    let report = engine
        .deliver(campaign("{Name} at {Company}", "Hi {Name}"), recipients)
        .await;

    assert_eq!(report.sent, 2);
    let subjects: Vec<String> = transport
        .sent_messages()
        .into_iter()
        .map(|m| m.subject)
        .collect();
    assert_eq!(subjects, vec!["Ann at Acme", "Ben at Globex"]);
}

#[test]
fn test_missing_email_column() {
    let table = assert_ok!(ContactTable::from_csv_str(
        "Name,Mail\nAnn,ann@example.com\n",
        CsvLayout::WithHeaders
    ));
    let err = assert_err!(RecipientSet::load(&table));
    assert_eq!(err.kind(), MailerErrorKind::MissingField);
    assert_eq!(err.message(), "missing required field: Email");
}

#[tokio::test]
async fn test_attachment_round_trip() {
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let campaign = assert_ok!(Campaign::builder()
        .subject("Your report, {Name}")
        .body("Hi {Name},\nplease find the report attached.")
        .attachment(Attachment::new("Q3 report.pdf", data.clone()))
        .sender(test_sender())
        .build());

    let transport = MockTransport::new();
    let engine = relay_engine(&transport);
    let recipients: RecipientSet = vec![Recipient::new("Ann", "ann@example.com")].into();
    let report = engine.deliver(campaign, recipients).await;
    assert_eq!(report.sent, 1);

    let sent = transport.sent_messages();
    let parsed = assert_ok!(mailparse::parse_mail(&sent[0].content));
    assert_eq!(parsed.subparts.len(), 2);

    let body = assert_ok!(parsed.subparts[0].get_body());
    assert!(body.contains("Hi Ann,"));

    let part = &parsed.subparts[1];
    let disposition = part.get_content_disposition();
    assert_eq!(
        disposition.params.get("filename").map(String::as_str),
        Some("Q3 report.pdf")
    );
    assert_eq!(assert_ok!(part.get_body_raw()), data);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_delay() {
    let transport = MockTransport::new();
    let engine = relay_engine(&transport);
    let campaign = assert_ok!(Campaign::builder()
        .subject("Hi {Name}")
        .body("Body")
        .sender(test_sender())
        .pacing_delay(Duration::from_millis(1500))
        .build());
    let recipients: RecipientSet = (0..5)
        .map(|i| Recipient::new(format!("R{}", i), format!("r{}@example.com", i)))
        .collect::<Vec<_>>()
        .into();

    let start = tokio::time::Instant::now();
    let report = engine.deliver(campaign, recipients).await;

    assert_eq!(report.sent, 5);
    assert!(start.elapsed() >= Duration::from_millis(4 * 1500));
    assert!(report.duration >= Duration::from_millis(4 * 1500));
}
