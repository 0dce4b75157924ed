//! Recipient sets.
//!
//! A [`ContactTable`] is raw contact data: a header row and data rows.
//! [`RecipientSet::load`] turns it into the ordered list of recipients a
//! campaign is sent to. The `Name` and `Email` columns are required; every
//! other column is kept as an extra template variable.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::template::TemplateVariables;
use crate::types::Address;

/// Column holding the recipient's display name.
pub const NAME_COLUMN: &str = "Name";

/// Column holding the recipient's email address.
pub const EMAIL_COLUMN: &str = "Email";

/// One contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Display name.
    pub name: String,
    /// Email address, not yet validated.
    pub email: String,
    /// Additional contact columns.
    pub fields: BTreeMap<String, String>,
}

impl Recipient {
    /// Creates a recipient.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds an extra column value.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Validates the email and returns the `To` address.
    pub fn address(&self) -> MailerResult<Address> {
        Address::with_name(self.name.as_str(), self.email.as_str())
    }

    /// Returns this recipient's template variables.
    ///
    /// Extra columns come first so `Name` and `Email` always reflect the
    /// recipient itself. An empty name leaves `Name` unbound.
    pub fn variables(&self) -> TemplateVariables {
        let mut vars = TemplateVariables::new();
        for (key, value) in &self.fields {
            vars.insert(key.clone(), value.clone());
        }
        if !self.name.is_empty() {
            vars.insert(NAME_COLUMN, self.name.clone());
        }
        vars.insert(EMAIL_COLUMN, self.email.clone());
        vars
    }
}

/// How raw CSV text is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvLayout {
    /// First record is a header row.
    WithHeaders,
    /// No header; every record is `Name,Email`.
    NameEmailPairs,
}

/// Header row plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactTable {
    /// Column names.
    pub headers: Vec<String>,
    /// Data rows, one value per column.
    pub rows: Vec<Vec<String>>,
}

impl ContactTable {
    /// Creates a table from headers and rows.
    pub fn new<H, R, V>(headers: H, rows: R) -> Self
    where
        H: IntoIterator,
        H::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        }
    }

    /// Reads CSV contact data.
    pub fn from_csv_reader<R: Read>(reader: R, layout: CsvLayout) -> MailerResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(layout == CsvLayout::WithHeaders)
            .flexible(layout == CsvLayout::NameEmailPairs)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = match layout {
            CsvLayout::WithHeaders => csv_reader
                .headers()
                .map_err(malformed)?
                .iter()
                .map(str::to_string)
                .collect(),
            CsvLayout::NameEmailPairs => vec![NAME_COLUMN.to_string(), EMAIL_COLUMN.to_string()],
        };

        let mut rows = Vec::new();
        for (line, record) in csv_reader.records().enumerate() {
            let record = record.map_err(malformed)?;
            if layout == CsvLayout::NameEmailPairs && record.len() != 2 {
                return Err(MailerError::validation(
                    MailerErrorKind::MalformedContacts,
                    format!(
                        "contact {} must be \"Name,Email\", found {} fields",
                        line + 1,
                        record.len()
                    ),
                ));
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    /// Parses CSV contact data from a string.
    pub fn from_csv_str(text: &str, layout: CsvLayout) -> MailerResult<Self> {
        Self::from_csv_reader(text.as_bytes(), layout)
    }

    /// Reads a CSV file with a header row.
    pub fn from_path(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            MailerError::validation(
                MailerErrorKind::MalformedContacts,
                format!("Cannot open {}: {}", path.display(), e),
            )
            .with_cause(e)
        })?;
        Self::from_csv_reader(file, CsvLayout::WithHeaders)
    }

    fn column(&self, name: &str) -> MailerResult<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| MailerError::missing_field(name))
    }
}

fn malformed(err: csv::Error) -> MailerError {
    MailerError::validation(
        MailerErrorKind::MalformedContacts,
        format!("malformed contact data: {}", err),
    )
    .with_cause(err)
}

/// Validated, ordered recipients for one campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    recipients: Vec<Recipient>,
}

impl RecipientSet {
    /// Builds a set from a contact table.
    ///
    /// Fails if the `Name` or `Email` column is missing. Row order is kept.
    /// Email values are not validated here.
    pub fn load(table: &ContactTable) -> MailerResult<Self> {
        let name_idx = table.column(NAME_COLUMN)?;
        let email_idx = table.column(EMAIL_COLUMN)?;

        let cell = |row: &[String], idx: usize| -> String {
            row.get(idx).map(|v| v.trim().to_string()).unwrap_or_default()
        };

        let recipients = table
            .rows
            .iter()
            .map(|row| {
                let fields = table
                    .headers
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| *idx != name_idx && *idx != email_idx)
                    .map(|(idx, header)| (header.clone(), cell(row, idx)))
                    .collect();
                Recipient {
                    name: cell(row, name_idx),
                    email: cell(row, email_idx),
                    fields,
                }
            })
            .collect();

        Ok(Self { recipients })
    }

    /// Returns the recipients in send order.
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Returns the first recipient.
    pub fn first(&self) -> Option<&Recipient> {
        self.recipients.first()
    }

    /// Returns the number of recipients.
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    /// Returns true if there are no recipients.
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Iterates in send order.
    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.recipients.iter()
    }
}

impl From<Vec<Recipient>> for RecipientSet {
    fn from(recipients: Vec<Recipient>) -> Self {
        Self { recipients }
    }
}

impl IntoIterator for RecipientSet {
    type Item = Recipient;
    type IntoIter = std::vec::IntoIter<Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.recipients.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecipientSet {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.recipients.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use std::io::Write;

    #[test]
    fn test_load_preserves_order_and_trims() {
        let table = ContactTable::new(
            ["Email", "Name", "Company"],
            [
                ["  alice@example.com ", " Alice ", "Acme"],
                ["bob@example.org", "Bob", ""],
            ],
        );

        let set = RecipientSet::load(&table).unwrap();
        assert_eq!(set.len(), 2);
        let alice = &set.recipients()[0];
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.email, "alice@example.com");
        assert_eq!(alice.fields.get("Company").map(String::as_str), Some("Acme"));
        assert_eq!(set.recipients()[1].name, "Bob");
    }

    #[test]
    fn test_missing_columns() {
        let table = ContactTable::new(["name", "Email"], [["a", "a@example.com"]]);
        let err = RecipientSet::load(&table).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MissingField);
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.message(), "missing required field: Name");

        let table = ContactTable::new(["Name"], Vec::<Vec<String>>::new());
        let err = RecipientSet::load(&table).unwrap_err();
        assert_eq!(err.message(), "missing required field: Email");
    }

    #[test]
    fn test_invalid_email_is_kept_for_send_time() {
        let table = ContactTable::new(["Name", "Email"], [["Carol", "not-an-address"]]);
        let set = RecipientSet::load(&table).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.recipients()[0].address().is_err());
    }

    #[test]
    fn test_short_rows_yield_empty_values() {
        let table = ContactTable::new(["Name", "Email", "City"], [vec!["Dan"]]);
        let set = RecipientSet::load(&table).unwrap();
        let dan = &set.recipients()[0];
        assert_eq!(dan.email, "");
        assert_eq!(dan.fields.get("City").map(String::as_str), Some(""));
    }

    #[test]
    fn test_variables() {
        let recipient = Recipient::new("Alice", "alice@example.com")
            .with_field("Name", "Overridden")
            .with_field("Plan", "Gold");
        let vars = recipient.variables();
        assert_eq!(vars.get("Name"), Some("Alice"));
        assert_eq!(vars.get("Plan"), Some("Gold"));
        assert_eq!(vars.get("Email"), Some("alice@example.com"));

        let nameless = Recipient::new("", "x@example.com").variables();
        assert_eq!(nameless.get("Name"), None);
    }

    #[test]
    fn test_csv_with_headers() {
        let csv = "Name,Email,Company\nAlice,alice@example.com,Acme\n\"Doe, John\",john@example.com,\n";
        let table = ContactTable::from_csv_str(csv, CsvLayout::WithHeaders).unwrap();
        assert_eq!(table.headers, vec!["Name", "Email", "Company"]);
        let set = RecipientSet::load(&table).unwrap();
        assert_eq!(set.recipients()[1].name, "Doe, John");
    }

    #[test]
    fn test_csv_name_email_pairs() {
        let text = "Alice, alice@example.com\n\nBob,bob@example.com\n";
        let table = ContactTable::from_csv_str(text, CsvLayout::NameEmailPairs).unwrap();
        let set = RecipientSet::load(&table).unwrap();
        let emails: Vec<_> = set.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, ["alice@example.com", "bob@example.com"]);

        let err = ContactTable::from_csv_str("Alice\n", CsvLayout::NameEmailPairs).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MalformedContacts);
    }

    #[test]
    fn test_csv_unequal_rows_are_malformed() {
        let csv = "Name,Email\nAlice,alice@example.com,extra\n";
        let err = ContactTable::from_csv_str(csv, CsvLayout::WithHeaders).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MalformedContacts);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name,Email").unwrap();
        writeln!(file, "Alice,alice@example.com").unwrap();

        let table = ContactTable::from_path(file.path()).unwrap();
        assert_eq!(RecipientSet::load(&table).unwrap().len(), 1);
    }
}
