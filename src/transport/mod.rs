//! Transport layer for SMTP sessions.
//!
//! A [`MailTransport`] opens authenticated [`MailSession`]s to a resolved
//! endpoint. [`SmtpTransport`] is the TCP implementation with optional TLS.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{DeliveryMode, MailerConfig, TlsMode};
use crate::errors::{MailerError, MailerErrorKind, MailerResult, SmtpPhase};
use crate::mime::Message;
use crate::protocol::{codes, Capabilities, Command, Reply, SessionState};
use crate::resolver::TransportEndpoint;

/// Opens sessions to mail servers.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Connects to `endpoint`, completes the handshake and authenticates
    /// when `credentials` are given.
    async fn open(
        &self,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
    ) -> MailerResult<Box<dyn MailSession>>;
}

/// An open, ready SMTP session.
#[async_trait]
pub trait MailSession: Send + fmt::Debug {
    /// Runs one mail transaction for `message`.
    async fn send(&mut self, message: &Message) -> MailerResult<()>;

    /// Returns true if another transaction may be attempted.
    fn is_usable(&self) -> bool;

    /// Aborts any open transaction.
    async fn reset(&mut self) -> MailerResult<()>;

    /// Sends QUIT and closes the connection.
    async fn close(&mut self) -> MailerResult<()>;
}

/// SMTP over TCP, with STARTTLS or implicit TLS.
pub struct SmtpTransport {
    config: Arc<MailerConfig>,
    #[cfg(feature = "rustls-tls")]
    tls: Arc<rustls::ClientConfig>,
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("client_id", &self.config.client_id())
            .field("relay", &self.config.delivery.is_relay())
            .finish()
    }
}

impl SmtpTransport {
    /// Creates a transport, loading TLS trust roots.
    pub fn new(config: Arc<MailerConfig>) -> MailerResult<Self> {
        #[cfg(feature = "rustls-tls")]
        let tls = tls::client_config(&config.tls)?;

        Ok(Self {
            config,
            #[cfg(feature = "rustls-tls")]
            tls,
        })
    }

    fn preferred_auth(&self) -> Option<AuthMethod> {
        match &self.config.delivery {
            DeliveryMode::Relay(relay) => relay.auth_method,
            DeliveryMode::DirectMx(_) => None,
        }
    }

    fn server_name<'a>(&'a self, endpoint: &'a TransportEndpoint) -> &'a str {
        match (&self.config.tls.sni_override, endpoint.is_relay()) {
            (Some(name), true) => name,
            _ => endpoint.host(),
        }
    }

    async fn handshake(
        &self,
        session: &mut SmtpSession,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
    ) -> MailerResult<()> {
        if endpoint.tls_mode() == TlsMode::Implicit {
            session.upgrade_tls(self, self.server_name(endpoint)).await?;
        }

        let greeting = session.read_reply().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error(SmtpPhase::Greeting));
        }
        session.state = SessionState::Connected;

        session.greet(self.config.client_id()).await?;

        if endpoint.use_starttls() && !session.tls_enabled {
            let required = endpoint.tls_mode() == TlsMode::StartTlsRequired;
            if session.capabilities.starttls {
                let reply = session.command(&Command::StartTls).await?;
                if reply.code == codes::SERVICE_READY {
                    session.upgrade_tls(self, self.server_name(endpoint)).await?;
                    session.greet(self.config.client_id()).await?;
                } else if required {
                    return Err(MailerError::new(
                        MailerErrorKind::StarttlsNotSupported,
                        format!("STARTTLS refused by {}: {}", endpoint, reply),
                    )
                    .with_smtp_code(reply.code));
                }
            } else if required {
                return Err(MailerError::new(
                    MailerErrorKind::StarttlsNotSupported,
                    format!("{} does not offer STARTTLS", endpoint),
                ));
            } else {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %endpoint, "STARTTLS not offered, continuing in plaintext");
            }
        }

        if let Some(credentials) = credentials {
            session.authenticate(credentials, self.preferred_auth()).await?;
        }

        session.state = SessionState::Ready;
        Ok(())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn open(
        &self,
        endpoint: &TransportEndpoint,
        credentials: Option<&Credentials>,
    ) -> MailerResult<Box<dyn MailSession>> {
        let address = endpoint.address();

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %endpoint, tls_mode = ?endpoint.tls_mode(), "Opening SMTP session");

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                MailerError::new(
                    MailerErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", address),
                )
            })?
            .map_err(|e| map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut session = SmtpSession {
            stream: Some(Stream::Plain(BufReader::new(stream))),
            state: SessionState::Connected,
            capabilities: Capabilities::default(),
            tls_enabled: false,
            host: endpoint.host().to_string(),
            command_timeout: self.config.command_timeout,
        };

        if let Err(err) = self.handshake(&mut session, endpoint, credentials).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %endpoint, error = %err, "SMTP handshake failed");

            if session.stream.is_some() && !err.kind().poisons_session() {
                let _ = session.close().await;
            }
            return Err(err);
        }

        Ok(Box::new(session))
    }
}

fn map_io_error(error: io::Error, address: &str) -> MailerError {
    let kind = match error.kind() {
        io::ErrorKind::ConnectionRefused => MailerErrorKind::ConnectionRefused,
        io::ErrorKind::TimedOut => MailerErrorKind::ConnectTimeout,
        io::ErrorKind::ConnectionReset => MailerErrorKind::ConnectionReset,
        _ => MailerErrorKind::ConnectionRefused,
    };
    MailerError::new(kind, format!("Cannot connect to {}: {}", address, error)).with_cause(error)
}

trait Io: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> Io for T {}

enum Stream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl Stream {
    fn io(&mut self) -> &mut dyn Io {
        match self {
            Stream::Plain(stream) => stream,
            #[cfg(feature = "rustls-tls")]
            Stream::Tls(stream) => stream.as_mut(),
        }
    }
}

/// One SMTP connection.
pub struct SmtpSession {
    stream: Option<Stream>,
    state: SessionState,
    capabilities: Capabilities,
    tls_enabled: bool,
    host: String,
    command_timeout: Duration,
}

impl fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSession")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl SmtpSession {
    /// Returns the server's advertised capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns true once the connection is encrypted.
    pub fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    /// Returns the dialog state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn stream(&mut self) -> MailerResult<&mut dyn Io> {
        self.stream
            .as_mut()
            .map(Stream::io)
            .ok_or_else(|| MailerError::new(MailerErrorKind::SessionClosed, "Session is closed"))
    }

    async fn write_all(&mut self, data: &[u8]) -> MailerResult<()> {
        let command_timeout = self.command_timeout;
        let writer = self.stream()?;

        timeout(command_timeout, writer.write_all(data))
            .await
            .map_err(|_| MailerError::new(MailerErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| {
                MailerError::new(MailerErrorKind::ConnectionReset, format!("Write error: {}", e))
                    .with_cause(e)
            })?;

        timeout(command_timeout, writer.flush())
            .await
            .map_err(|_| MailerError::new(MailerErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| {
                MailerError::new(MailerErrorKind::ConnectionReset, format!("Flush error: {}", e))
                    .with_cause(e)
            })?;

        Ok(())
    }

    async fn read_reply(&mut self) -> MailerResult<Reply> {
        let command_timeout = self.command_timeout;
        let reader = self.stream()?;
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(command_timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| MailerError::new(MailerErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| {
                    MailerError::new(MailerErrorKind::ConnectionReset, format!("Read error: {}", e))
                        .with_cause(e)
                })?;

            if read == 0 {
                return Err(MailerError::new(
                    MailerErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            let line = line.trim_end().to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        let reply = Reply::parse(&lines)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(code = reply.code, message = %reply.first_line(), "Received SMTP reply");

        Ok(reply)
    }

    async fn command(&mut self, command: &Command) -> MailerResult<Reply> {
        #[cfg(feature = "tracing")]
        tracing::debug!(command = %command, "Sending SMTP command");

        let line = format!("{}\r\n", command.to_wire());
        self.write_all(line.as_bytes()).await?;
        let reply = self.read_reply().await?;

        if reply.code == codes::SERVICE_UNAVAILABLE {
            return Err(reply.to_error(SmtpPhase::Handshake));
        }
        Ok(reply)
    }

    async fn greet(&mut self, client_id: &str) -> MailerResult<()> {
        let reply = self.command(&Command::Ehlo(client_id.to_string())).await?;
        if reply.is_success() {
            self.capabilities = Capabilities::from_ehlo_reply(&reply);
        } else {
            let reply = self.command(&Command::Helo(client_id.to_string())).await?;
            if !reply.is_success() {
                return Err(reply.to_error(SmtpPhase::Handshake));
            }
            self.capabilities = Capabilities::default();
        }
        self.state = SessionState::Greeted;
        Ok(())
    }

    #[cfg(feature = "rustls-tls")]
    async fn upgrade_tls(&mut self, transport: &SmtpTransport, server_name: &str) -> MailerResult<()> {
        use rustls::pki_types::ServerName;

        if self.tls_enabled {
            return Ok(());
        }

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| MailerError::tls(format!("Invalid server name: {}", server_name)))?;

        let tcp = match self.stream.take() {
            Some(Stream::Plain(reader)) => reader.into_inner(),
            Some(tls @ Stream::Tls(_)) => {
                self.stream = Some(tls);
                return Err(MailerError::tls("Already using TLS"));
            }
            None => {
                return Err(MailerError::new(MailerErrorKind::SessionClosed, "Session is closed"))
            }
        };

        let connector = tokio_rustls::TlsConnector::from(transport.tls.clone());
        let tls_stream = timeout(transport.config.connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| {
                MailerError::new(MailerErrorKind::ConnectTimeout, "TLS handshake timed out")
            })?
            .map_err(|e| MailerError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        self.stream = Some(Stream::Tls(Box::new(BufReader::new(tls_stream))));
        self.tls_enabled = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(host = %self.host, "TLS established");

        Ok(())
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn upgrade_tls(&mut self, _transport: &SmtpTransport, _server_name: &str) -> MailerResult<()> {
        Err(MailerError::configuration("No TLS implementation available"))
    }

    async fn authenticate(
        &mut self,
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
    ) -> MailerResult<()> {
        let available = self.capabilities.auth_methods();
        if available.is_empty() {
            return Err(MailerError::new(
                MailerErrorKind::AuthMethodNotSupported,
                format!("{} does not offer authentication", self.host),
            ));
        }

        let method = Authenticator::select_method(&available, preferred, self.tls_enabled)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %method, username = %credentials.username(), "Authenticating");

        let reply = match method {
            AuthMethod::Plain => {
                self.command(&Command::Auth {
                    method,
                    initial_response: Some(Authenticator::plain_initial_response(credentials)),
                })
                .await?
            }
            AuthMethod::Login => {
                let reply = self.command(&Command::Auth { method, initial_response: None }).await?;
                if reply.code != codes::AUTH_CONTINUE {
                    return Err(reply.to_error(SmtpPhase::Auth));
                }
                let reply = self
                    .command(&Command::AuthResponse(Authenticator::login_username(credentials)))
                    .await?;
                if reply.code != codes::AUTH_CONTINUE {
                    return Err(reply.to_error(SmtpPhase::Auth));
                }
                self.command(&Command::AuthResponse(Authenticator::login_password(credentials)))
                    .await?
            }
            AuthMethod::CramMd5 => {
                let reply = self.command(&Command::Auth { method, initial_response: None }).await?;
                if reply.code != codes::AUTH_CONTINUE {
                    return Err(reply.to_error(SmtpPhase::Auth));
                }
                let response = Authenticator::cram_md5_response(reply.first_line(), credentials)?;
                self.command(&Command::AuthResponse(response)).await?
            }
        };

        if reply.code == codes::AUTH_SUCCESS {
            Ok(())
        } else {
            Err(reply.to_error(SmtpPhase::Auth))
        }
    }

    async fn transaction(&mut self, message: &Message) -> MailerResult<()> {
        let data = message.data_content();

        if let Some(limit) = self.capabilities.size {
            if message.size() > limit {
                return Err(MailerError::validation(
                    MailerErrorKind::MessageTooLarge,
                    format!("message is {} bytes, {} accepts {}", message.size(), self.host, limit),
                ));
            }
        }

        let mail_from = Command::MailFrom {
            address: format!("<{}>", message.envelope_from),
            size: self.capabilities.size.map(|_| message.size()),
        };
        let reply = self.command(&mail_from).await?;
        if !reply.is_success() {
            return Err(reply.to_error(SmtpPhase::Sender));
        }
        self.state = SessionState::InTransaction;

        let reply = self
            .command(&Command::RcptTo(format!("<{}>", message.envelope_to)))
            .await?;
        if reply.code != codes::OK && reply.code != codes::WILL_FORWARD {
            return Err(reply.to_error(SmtpPhase::Recipient));
        }

        let reply = self.command(&Command::Data).await?;
        if reply.code != codes::START_MAIL_INPUT {
            return Err(reply.to_error(SmtpPhase::Data));
        }

        self.write_all(&data).await?;
        let reply = self.read_reply().await?;
        self.state = SessionState::Ready;

        if reply.is_success() {
            Ok(())
        } else {
            Err(reply.to_error(SmtpPhase::Data))
        }
    }
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn send(&mut self, message: &Message) -> MailerResult<()> {
        if !self.state.can_start_mail() {
            return Err(MailerError::new(
                MailerErrorKind::SessionClosed,
                format!("Session to {} cannot start a transaction", self.host),
            ));
        }

        let result = self.transaction(message).await;
        if let Err(err) = &result {
            if err.kind().poisons_session() {
                self.state = SessionState::Closed;
                self.stream = None;
            }
        }
        result
    }

    fn is_usable(&self) -> bool {
        self.stream.is_some() && self.state != SessionState::Closed
    }

    async fn reset(&mut self) -> MailerResult<()> {
        if self.state != SessionState::InTransaction {
            return Ok(());
        }

        match self.command(&Command::Rset).await {
            Ok(reply) if reply.is_success() => {
                self.state = SessionState::Ready;
                Ok(())
            }
            Ok(reply) => {
                self.state = SessionState::Closed;
                Err(reply.to_error(SmtpPhase::Handshake))
            }
            Err(err) => {
                self.state = SessionState::Closed;
                self.stream = None;
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> MailerResult<()> {
        if self.stream.is_some() {
            if self.state != SessionState::Closed {
                let _ = self.command(&Command::Quit).await;
            }
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.io().shutdown().await;
            }
        }
        self.state = SessionState::Closed;
        Ok(())
    }
}

#[cfg(feature = "rustls-tls")]
mod tls {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
    use std::sync::Arc;

    use crate::config::{TlsConfig, TlsVersion};
    use crate::errors::{MailerError, MailerResult};

    pub(super) fn client_config(config: &TlsConfig) -> MailerResult<Arc<rustls::ClientConfig>> {
        let versions: &[&'static SupportedProtocolVersion] = match config.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };
        let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);

        if !config.verify_certificate {
            return Ok(Arc::new(
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            ));
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            let file = std::fs::File::open(path).map_err(|e| {
                MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
                    .with_cause(e)
            })?;
            let mut reader = std::io::BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    MailerError::configuration(format!("Invalid certificate in {}: {}", path.display(), e))
                        .with_cause(e)
                })?;
                roots.add(cert).map_err(|e| {
                    MailerError::configuration(format!("Rejected certificate in {}: {}", path.display(), e))
                        .with_cause(e)
                })?;
            }
        }

        Ok(Arc::new(
            builder.with_root_certificates(roots).with_no_client_auth(),
        ))
    }

    /// Accepts any server certificate.
    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
