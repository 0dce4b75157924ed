//! Message assembly.
//!
//! Builds the RFC 5322 message sent to one recipient:
//! - Header encoding (RFC 2047) and folding
//! - Quoted-printable text body
//! - Base64 attachment part inside `multipart/mixed`
//! - Dot-stuffed DATA payload

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::recipients::Recipient;
use crate::types::{Address, Attachment, Campaign};

/// Content type of the body part.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Content type of the attachment part.
pub const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

// Characters that force a MIME parameter value into quotes (RFC 2045 tspecials).
const TSPECIALS: &[char] = &['(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '='];

/// A message ready for submission to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `MAIL FROM` mailbox.
    pub envelope_from: String,
    /// `RCPT TO` mailbox.
    pub envelope_to: String,
    /// `Message-ID` without angle brackets.
    pub message_id: String,
    /// Rendered subject.
    pub subject: String,
    /// Encoded RFC 5322 message.
    pub content: Vec<u8>,
}

impl Message {
    /// Returns the encoded size in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Returns the DATA payload, dot-stuffed and terminated.
    pub fn data_content(&self) -> Vec<u8> {
        prepare_data_content(&self.content)
    }
}

/// Assembles per-recipient messages for a campaign.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    max_size: usize,
}

impl MessageBuilder {
    /// Creates a builder enforcing `max_size` bytes per message.
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Builds the message for `recipient` from an already rendered subject and body.
    pub fn build(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        subject: &str,
        body: &str,
    ) -> MailerResult<Message> {
        self.build_at(campaign, recipient, subject, body, Utc::now())
    }

    fn build_at(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        subject: &str,
        body: &str,
        date: DateTime<Utc>,
    ) -> MailerResult<Message> {
        let to = recipient.address()?;
        check_header_value("Subject", subject)?;
        let from = &campaign.sender().address;
        let message_id = generate_message_id(from.domain(), date);
        let boundary = generate_boundary();

        let mut output = Vec::with_capacity(body.len() + 1024);
        write_header(&mut output, "Date", &format_date(date))?;
        write_header(&mut output, "From", &address_header(from))?;
        write_header(&mut output, "To", &address_header(&to))?;
        write_header(&mut output, "Subject", &encode_header(subject))?;
        write_header(&mut output, "Message-ID", &format!("<{}>", message_id))?;
        write_header(&mut output, "MIME-Version", "1.0")?;
        write_header(
            &mut output,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        )?;
        output.extend_from_slice(b"\r\n");

        output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        write_header(&mut output, "Content-Type", TEXT_CONTENT_TYPE)?;
        write_header(&mut output, "Content-Transfer-Encoding", "quoted-printable")?;
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&quoted_printable::encode(normalize_newlines(body).as_bytes()));
        output.extend_from_slice(b"\r\n");

        if let Some(attachment) = campaign.attachment() {
            output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            write_attachment(&mut output, attachment)?;
        }

        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        if output.len() > self.max_size {
            return Err(MailerError::validation(
                MailerErrorKind::MessageTooLarge,
                format!(
                    "message for {} is {} bytes, limit is {}",
                    to.email,
                    output.len(),
                    self.max_size
                ),
            ));
        }

        Ok(Message {
            envelope_from: from.email.clone(),
            envelope_to: to.email,
            message_id,
            subject: subject.to_string(),
            content: output,
        })
    }
}

fn check_header_value(name: &str, value: &str) -> MailerResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(MailerError::validation(
            MailerErrorKind::InvalidHeader,
            format!("{} header cannot contain line breaks", name),
        ));
    }
    Ok(())
}

fn write_header(output: &mut Vec<u8>, name: &str, value: &str) -> MailerResult<()> {
    check_header_value(name, value)?;

    let header = format!("{}: {}", name, value);
    output.extend_from_slice(fold_header(&header).as_bytes());
    output.extend_from_slice(b"\r\n");
    Ok(())
}

/// Folds a header line at whitespace so lines stay within 78 columns where possible.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= 76 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Encodes a header value using RFC 2047 when it is not plain ASCII.
///
/// Long values are split into several encoded words so the header can fold.
pub fn encode_header(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    // 45 bytes of UTF-8 become 60 base64 chars, keeping each word under 75.
    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > 45 {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
    }
    words.join(" ")
}

fn address_header(address: &Address) -> String {
    match address.name() {
        Some(name) if !name.is_ascii() => format!("{} <{}>", encode_header(name), address.email),
        Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
            format!("\"{}\" <{}>", name.replace('\\', "\\\\").replace('"', "\\\""), address.email)
        }
        Some(name) => format!("{} <{}>", name, address.email),
        None => address.email.clone(),
    }
}

/// Formats a MIME parameter, quoting or RFC 2231-encoding the value as needed.
fn mime_param(name: &str, value: &str) -> String {
    if !value.is_ascii() {
        let encoded: String = value
            .bytes()
            .map(|b| {
                if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                    (b as char).to_string()
                } else {
                    format!("%{:02X}", b)
                }
            })
            .collect();
        format!("{}*=utf-8''{}", name, encoded)
    } else if value.contains(|c: char| c == ' ' || TSPECIALS.contains(&c)) {
        format!("{}=\"{}\"", name, value)
    } else {
        format!("{}={}", name, value)
    }
}

fn write_attachment(output: &mut Vec<u8>, attachment: &Attachment) -> MailerResult<()> {
    write_header(
        output,
        "Content-Type",
        &format!("{}; {}", ATTACHMENT_CONTENT_TYPE, mime_param("name", &attachment.filename)),
    )?;
    write_header(output, "Content-Transfer-Encoding", "base64")?;
    write_header(
        output,
        "Content-Disposition",
        &format!("attachment; {}", mime_param("filename", &attachment.filename)),
    )?;
    output.extend_from_slice(b"\r\n");

    let encoded = BASE64.encode(&attachment.data);
    for chunk in encoded.as_bytes().chunks(76) {
        output.extend_from_slice(chunk);
        output.extend_from_slice(b"\r\n");
    }

    Ok(())
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn generate_message_id(domain: &str, date: DateTime<Utc>) -> String {
    format!("{}.{}@{}", Uuid::new_v4().simple(), date.timestamp(), domain)
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

/// Prepares the DATA payload with dot-stuffing and the terminating `.` line.
pub fn prepare_data_content(encoded: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(encoded.len() + 100);
    let mut at_line_start = true;

    for &byte in encoded {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }

        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        if output.ends_with(b"\n") {
            output.pop();
        }
        output.extend_from_slice(b"\r\n");
    }

    output.extend_from_slice(b".\r\n");
    output
}
