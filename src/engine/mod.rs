//! Campaign delivery.
//!
//! [`DeliveryEngine`] runs one campaign at a time per call:
//! pre-flight template check, optional scheduled wait, session setup, then
//! one send per recipient in set order with optional pacing.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{sleep, Instant};

use crate::auth::Credentials;
use crate::config::MailerConfig;
use crate::errors::MailerResult;
use crate::mime::MessageBuilder;
use crate::observability::CampaignMetrics;
use crate::recipients::{Recipient, RecipientSet, NAME_COLUMN};
use crate::resolver::{DnsMxLookup, MxLookup, TransportEndpoint, TransportResolver};
use crate::template::{Template, TemplateVariables};
use crate::transport::{MailSession, MailTransport, SmtpTransport};
use crate::types::{
    Campaign, CampaignOutcome, CampaignReport, DeliveryFailure, DeliveryResult, FailedRecipient,
    RecipientOutcome,
};

/// Engine states for one campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started.
    Idle,
    /// Waiting for the scheduled start time.
    ScheduledWait,
    /// Establishing the relay session.
    Authenticating,
    /// Sending to recipients.
    Sending,
    /// Every recipient was attempted.
    Completed,
    /// Stopped by a fatal error.
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::ScheduledWait => "scheduled_wait",
            EngineState::Authenticating => "authenticating",
            EngineState::Sending => "sending",
            EngineState::Completed => "completed",
            EngineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Receives progress while a campaign runs.
pub trait DeliveryObserver: Send + Sync {
    /// Called on every state transition.
    fn on_state_change(&self, _state: EngineState) {}

    /// Called after each recipient is attempted, with its position in the set.
    fn on_result(&self, _index: usize, _outcome: &RecipientOutcome) {}
}

struct NoopObserver;

impl DeliveryObserver for NoopObserver {}

type Sessions = HashMap<TransportEndpoint, Box<dyn MailSession>>;

/// Drives campaigns through a transport.
pub struct DeliveryEngine {
    config: Arc<MailerConfig>,
    transport: Arc<dyn MailTransport>,
    lookup: Arc<dyn MxLookup>,
    builder: MessageBuilder,
    metrics: Arc<CampaignMetrics>,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("delivery", &self.config.delivery)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl DeliveryEngine {
    /// Creates an engine using SMTP over TCP and the system DNS resolver.
    pub fn new(config: MailerConfig) -> MailerResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let lookup = match DnsMxLookup::from_system_conf(config.dns_timeout) {
            Ok(lookup) => lookup,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "Falling back to default DNS resolver");
                DnsMxLookup::new(config.dns_timeout)
            }
        };
        let transport = SmtpTransport::new(config.clone())?;

        Ok(Self::from_parts(config, Arc::new(transport), Arc::new(lookup)))
    }

    /// Creates an engine with caller-supplied transport and MX lookup.
    pub fn with_components(
        config: MailerConfig,
        transport: Arc<dyn MailTransport>,
        lookup: Arc<dyn MxLookup>,
    ) -> MailerResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(Arc::new(config), transport, lookup))
    }

    fn from_parts(
        config: Arc<MailerConfig>,
        transport: Arc<dyn MailTransport>,
        lookup: Arc<dyn MxLookup>,
    ) -> Self {
        Self {
            builder: MessageBuilder::new(config.max_message_size),
            config,
            transport,
            lookup,
            metrics: Arc::new(CampaignMetrics::new()),
        }
    }

    /// Returns the engine's counters.
    pub fn metrics(&self) -> &CampaignMetrics {
        &self.metrics
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Delivers `campaign` to every recipient.
    pub async fn deliver(&self, campaign: Campaign, recipients: RecipientSet) -> CampaignReport {
        self.deliver_with_observer(campaign, recipients, &NoopObserver)
            .await
    }

    /// Delivers `campaign`, reporting progress to `observer`.
    ///
    /// Always returns a report. Only an invalid template or a failed relay
    /// session aborts the run; everything else is recorded per recipient.
    pub async fn deliver_with_observer(
        &self,
        campaign: Campaign,
        recipients: RecipientSet,
        observer: &dyn DeliveryObserver,
    ) -> CampaignReport {
        let started_at = Utc::now();
        let start = Instant::now();
        self.metrics.record_campaign_started();
        observer.on_state_change(EngineState::Idle);

        #[cfg(feature = "tracing")]
        tracing::info!(
            campaign_id = %campaign.id(),
            recipients = recipients.len(),
            relay = self.config.delivery.is_relay(),
            "Starting campaign"
        );

        let mut results = Vec::with_capacity(recipients.len());
        let outcome = match self.run(&campaign, &recipients, observer, &mut results).await {
            Ok(()) => CampaignOutcome::Completed,
            Err(err) => CampaignOutcome::Aborted(err),
        };

        let completed = outcome.is_completed();
        self.metrics.record_campaign_finished(completed);
        observer.on_state_change(if completed {
            EngineState::Completed
        } else {
            EngineState::Aborted
        });

        let failed: Vec<FailedRecipient> = results
            .iter()
            .filter_map(|outcome| {
                outcome.result.failure().map(|failure| FailedRecipient {
                    recipient: outcome.recipient.clone(),
                    failure: failure.clone(),
                })
            })
            .collect();

        let report = CampaignReport {
            campaign_id: campaign.id(),
            total: recipients.len(),
            sent: results.len() - failed.len(),
            failed,
            results,
            outcome,
            started_at,
            finished_at: Utc::now(),
            duration: start.elapsed(),
        };

        #[cfg(feature = "tracing")]
        match report.abort_error() {
            None => tracing::info!(
                campaign_id = %report.campaign_id,
                sent = report.sent,
                failed = report.failed.len(),
                duration_ms = report.duration.as_millis(),
                "Campaign completed"
            ),
            Some(err) => tracing::warn!(
                campaign_id = %report.campaign_id,
                error = %err,
                "Campaign aborted"
            ),
        }

        report
    }

    async fn run(
        &self,
        campaign: &Campaign,
        recipients: &RecipientSet,
        observer: &dyn DeliveryObserver,
        results: &mut Vec<RecipientOutcome>,
    ) -> MailerResult<()> {
        let subject = Template::parse(campaign.subject())?;
        let body = Template::parse(campaign.body_template())?;
        preflight(campaign, recipients.first(), &subject, &body)?;

        if let Some(at) = campaign.scheduled_at() {
            if let Ok(wait) = (at - Utc::now()).to_std() {
                if !wait.is_zero() {
                    observer.on_state_change(EngineState::ScheduledWait);

                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        campaign_id = %campaign.id(),
                        scheduled_at = %at,
                        "Waiting for scheduled start"
                    );

                    sleep(wait).await;
                }
            }
        }

        let mut resolver = TransportResolver::new(self.config.delivery.clone(), self.lookup.clone());
        let mut sessions = Sessions::new();

        if self.config.delivery.is_relay() && !recipients.is_empty() {
            observer.on_state_change(EngineState::Authenticating);
            let endpoint = resolver.resolve(&campaign.sender().address.email).await?;
            let session = self
                .open_session(&endpoint, campaign.sender().credentials.as_ref())
                .await?;
            sessions.insert(endpoint, session);
        }

        observer.on_state_change(EngineState::Sending);
        let pacing = campaign.pacing_delay();

        for (index, recipient) in recipients.iter().enumerate() {
            let result = match self
                .deliver_one(campaign, recipient, &subject, &body, &mut resolver, &mut sessions)
                .await
            {
                Ok(message_id) => {
                    self.metrics.record_sent();
                    DeliveryResult::Sent { message_id }
                }
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        recipient = %recipient.email,
                        category = %err.category(),
                        error = %err,
                        "Delivery failed"
                    );

                    self.metrics.record_failure(err.category());
                    DeliveryResult::Failed(DeliveryFailure::from(err))
                }
            };

            let sent = result.is_sent();
            let outcome = RecipientOutcome {
                recipient: recipient.clone(),
                result,
            };
            observer.on_result(index, &outcome);
            results.push(outcome);

            if sent && !pacing.is_zero() && index + 1 < recipients.len() {
                sleep(pacing).await;
            }
        }

        self.metrics.record_mx_lookups(resolver.lookups());
        for (_endpoint, mut session) in sessions.drain() {
            if let Err(_err) = session.close().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %_endpoint, error = %_err, "Session close failed");
            }
        }

        Ok(())
    }

    async fn deliver_one(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        subject: &Template,
        body: &Template,
        resolver: &mut TransportResolver,
        sessions: &mut Sessions,
    ) -> MailerResult<String> {
        let variables = recipient.variables().with_defaults(campaign.variables());
        let subject = subject.render(&variables)?;
        let body = body.render(&variables)?;

        let endpoint = resolver.resolve(&recipient.email).await?;
        let message = self.builder.build(campaign, recipient, &subject, &body)?;

        let credentials = if endpoint.is_relay() {
            campaign.sender().credentials.as_ref()
        } else {
            None
        };
        let session = self.session_for(&endpoint, credentials, sessions).await?;

        match session.send(&message).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    recipient = %recipient.email,
                    message_id = %message.message_id,
                    endpoint = %endpoint,
                    "Message accepted"
                );
                Ok(message.message_id)
            }
            Err(err) => {
                if session.is_usable() {
                    let _ = session.reset().await;
                } else {
                    sessions.remove(&endpoint);
                }
                Err(err)
            }
        }
    }

    async fn session_for<'s>(
        &self,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
        sessions: &'s mut Sessions,
    ) -> MailerResult<&'s mut Box<dyn MailSession>> {
        let stale = sessions
            .get(endpoint)
            .map_or(false, |session| !session.is_usable());
        if stale {
            sessions.remove(endpoint);
        }

        match sessions.entry(endpoint.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let session = self.open_session(endpoint, credentials).await?;
                Ok(entry.insert(session))
            }
        }
    }

    async fn open_session(
        &self,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
    ) -> MailerResult<Box<dyn MailSession>> {
        let result = self.transport.open(endpoint, credentials).await;
        self.metrics.record_session_open(result.is_ok());

        #[cfg(feature = "tracing")]
        match &result {
            Ok(_) => tracing::debug!(endpoint = %endpoint, "Session opened"),
            Err(err) => tracing::warn!(endpoint = %endpoint, error = %err, "Session open failed"),
        }

        result
    }
}

/// Checks that both templates render before anything is sent.
///
/// Every column the preview row carries is bound, even when its value is
/// empty, so only unknown keys and bad syntax fail here. With no recipients
/// every placeholder is bound and only syntax is checked.
fn preflight(
    campaign: &Campaign,
    preview: Option<&Recipient>,
    subject: &Template,
    body: &Template,
) -> MailerResult<()> {
    let variables = match preview {
        Some(recipient) => {
            let mut variables = recipient.variables();
            if variables.get(NAME_COLUMN).is_none() {
                variables.insert(NAME_COLUMN, NAME_COLUMN);
            }
            variables.with_defaults(campaign.variables())
        }
        None => subject
            .placeholders()
            .into_iter()
            .chain(body.placeholders())
            .map(|key| (key, key))
            .collect::<TemplateVariables>(),
    };

    subject.render(&variables)?;
    body.render(&variables)?;
    Ok(())
}
