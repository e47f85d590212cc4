//! Mock SMTP server for testing delivery scenarios
//!
//! This module provides a configurable mock SMTP server that can:
#![allow(dead_code)] // Test utility module - not all methods used in every test
//! - Simulate various SMTP responses (success, failure, temporary errors)
//! - Drop connections after a number of commands
//! - Track received commands and connections for verification
//! - Delay responses to test timeout handling
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_greeting(220, "Test server ready")
//!     .with_rcpt_to_response(550, "User unknown")  // Inject failure
//!     .build()
//!     .await?;
//!
//! // Server is now running on server.addr()
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), still dot-stuffed
    MessageContent(Vec<u8>),
    Rset,
    Noop,
    Quit,
    /// Unknown/other command
    Other(String),
}

/// Response configuration for SMTP commands
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_response: Option<EhloResponse>,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    rset_response: SmtpResponse,
    quit_response: SmtpResponse,

    // Failure injection
    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
}

#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let cap_count = self.capabilities.len();

        for (i, cap) in self.capabilities.iter().enumerate() {
            if i < cap_count - 1 {
                let _ = write!(&mut response, "{}-{}\r\n", self.code, cap);
            } else {
                let _ = write!(&mut response, "{} {}\r\n", self.code, cap);
            }
        }

        response.into_bytes()
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo_response: Some(EhloResponse {
                code: 250,
                capabilities: vec![
                    "localhost".to_string(),
                    "SIZE 10000".to_string(),
                    "8BITMIME".to_string(),
                ],
            }),
            helo_response: SmtpResponse::new(250, "Hello"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            rset_response: SmtpResponse::new(250, "Reset"),
            quit_response: SmtpResponse::new(221, "Bye"),
            response_delay: None,
            drop_after_commands: None,
        }
    }
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    command_count: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all commands received by the server
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// How many times the server received `matching` commands
    pub async fn count(&self, matching: impl Fn(&SmtpCommand) -> bool) -> usize {
        self.commands_received
            .read()
            .await
            .iter()
            .filter(|command| matching(command))
            .count()
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.command_count.load(Ordering::Relaxed)
    }

    /// Connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Connections the client has not closed yet
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
        command_count: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut local_command_count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        // A refusing greeting ends the conversation, as a real 421 would
        if config.greeting.code >= 400 {
            return Ok(());
        }

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            let read_result = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            let Ok(bytes_read) = read_result else {
                return Ok(());
            };
            if bytes_read? == 0 {
                return Ok(());
            }

            local_command_count += 1;
            command_count.fetch_add(1, Ordering::Relaxed);

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {}", cmd_line);

            let parts: Vec<&str> = cmd_line.splitn(2, ' ').collect();
            let command = parts[0].to_uppercase();
            let argument = (*parts.get(1).unwrap_or(&"")).to_string();

            let (response, smtp_cmd) = match command.as_str() {
                "EHLO" => {
                    let resp = config
                        .ehlo_response
                        .as_ref()
                        .map_or_else(|| config.helo_response.to_bytes(), EhloResponse::to_bytes);
                    (resp, SmtpCommand::Ehlo(argument))
                }
                "HELO" => (config.helo_response.to_bytes(), SmtpCommand::Helo(argument)),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument),
                ),
                "RCPT" => (
                    config.rcpt_to_response.to_bytes(),
                    SmtpCommand::RcptTo(argument),
                ),
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "RSET" => (config.rset_response.to_bytes(), SmtpCommand::Rset),
                "NOOP" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Noop),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            commands.write().await.push(smtp_cmd.clone());

            if matches!(smtp_cmd, SmtpCommand::Data) && config.data_response.code == 354 {
                writer.write_all(&response).await?;
                writer.flush().await?;

                // Read message content until we see <CRLF>.<CRLF>
                let mut message_content = Vec::new();
                let mut data_line = Vec::new();

                loop {
                    data_line.clear();
                    if reader.read_until(b'\n', &mut data_line).await? == 0 {
                        return Ok(());
                    }

                    if data_line == b".\r\n" {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(message_content.clone()));

                        if let Some(delay) = config.response_delay {
                            tokio::time::sleep(delay).await;
                        }
                        writer
                            .write_all(&config.data_end_response.to_bytes())
                            .await?;
                        writer.flush().await?;
                        break;
                    }

                    message_content.extend_from_slice(&data_line);
                }
                continue;
            }

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Set the EHLO response with capabilities
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_response = Some(EhloResponse { code, capabilities });
        self
    }

    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.helo_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    /// Set the response after message content (after `<CRLF>.<CRLF>`)
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Add a delay before sending each response
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Drop the connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let command_count = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);
        let command_count_clone = Arc::clone(&command_count);
        let connections_clone = Arc::clone(&connections);
        let open_clone = Arc::clone(&open);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                // Accept connection with timeout to allow checking shutdown flag
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    connections_clone.fetch_add(1, Ordering::Relaxed);
                    open_clone.fetch_add(1, Ordering::Relaxed);

                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);
                    let command_count = Arc::clone(&command_count_clone);
                    let open = Arc::clone(&open_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, commands, command_count)
                                .await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                        open.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            command_count,
            connections,
            open,
        })
    }
}
