//! End-to-end test harness for postern
//!
//! Starts a complete postern instance (listener, memory queue, delivery
//! engine, directory mail drop) next to a mock destination SMTP server.
//! The destination domain resolves to the mock through a static lookup.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use postern::Postern;
use postern_common::Signal;
use postern_delivery::StaticLookup;
use postern_smtp::client::{Response, SmtpClient, TransferEncoding};
use postern_spool::MemoryQueueStore;
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

use super::mock_server::{MockSmtpServer, MockSmtpServerBuilder, SmtpCommand};

pub const LOCAL_DOMAIN: &str = "postern.test";

pub struct E2ETestHarness {
    smtp_addr: SocketAddr,
    mock_server: MockSmtpServer,
    store: MemoryQueueStore,
    handle: JoinHandle<anyhow::Result<()>>,
    shutdown_tx: broadcast::Sender<Signal>,
    mail_root: TempDir,
}

impl E2ETestHarness {
    #[must_use]
    pub fn builder() -> E2ETestHarnessBuilder {
        E2ETestHarnessBuilder::new()
    }

    #[must_use]
    pub const fn store(&self) -> &MemoryQueueStore {
        &self.store
    }

    #[must_use]
    pub fn mail_root(&self) -> &Path {
        self.mail_root.path()
    }

    /// Subscribe to the instance's shutdown broadcast.
    #[must_use]
    #[allow(dead_code)]
    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.shutdown_tx.subscribe()
    }

    /// Submit one message to postern over SMTP, returning the reply to the
    /// end of the message data.
    ///
    /// # Errors
    ///
    /// Returns an error if any command before the data is refused or the
    /// exchange fails.
    pub async fn send_email(&self, from: &str, to: &str, message: &str) -> anyhow::Result<Response> {
        let mut client = SmtpClient::connect(self.smtp_addr, None, Duration::from_secs(5))
            .await?
            .with_command_timeout(Duration::from_secs(5));

        expect(client.read_greeting().await?, "greeting")?;
        expect(client.ehlo("test-client").await?, "EHLO")?;
        expect(client.mail_from(Some(from), &[]).await?, "MAIL")?;
        expect(client.rcpt_to(to).await?, "RCPT")?;

        let data = client.data().await?;
        anyhow::ensure!(data.code == 354, "DATA refused: {data}");
        let reply = client
            .send_data(message.as_bytes(), TransferEncoding::SevenBit, Duration::from_secs(5))
            .await?;

        client.quit().await;
        Ok(reply)
    }

    /// Wait for the mock server to receive a message body.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing arrives within `timeout`.
    pub async fn wait_for_delivery(&self, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let content = self.mock_server.commands().await.into_iter().find_map(|c| match c {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            });
            if let Some(content) = content {
                return Ok(content);
            }

            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "No delivery within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the queue holds nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is still busy after `timeout`.
    pub async fn wait_for_empty_queue(&self, timeout: Duration) -> anyhow::Result<()> {
        use postern_spool::QueueStore;

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.store.is_empty().await? {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "Queue not drained within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub async fn mock_commands(&self) -> Vec<SmtpCommand> {
        self.mock_server.commands().await
    }

    /// Broadcast shutdown and wait for every service to stop.
    ///
    /// # Errors
    ///
    /// Returns whatever error the instance stopped with.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown_tx.send(Signal::Shutdown)?;
        self.handle.await??;
        self.mock_server.shutdown();
        Ok(())
    }
}

fn expect(response: Response, step: &str) -> anyhow::Result<()> {
    anyhow::ensure!(response.is_success(), "{step} refused: {response}");
    Ok(())
}

pub struct E2ETestHarnessBuilder {
    test_domain: String,
    mock: MockSmtpServerBuilder,
}

impl E2ETestHarnessBuilder {
    fn new() -> Self {
        Self {
            test_domain: "test.example.com".to_string(),
            mock: MockSmtpServer::builder(),
        }
    }

    /// Domain whose MX is the mock server
    #[must_use]
    #[allow(dead_code)]
    pub fn with_test_domain(mut self, domain: impl Into<String>) -> Self {
        self.test_domain = domain.into();
        self
    }

    /// Adjust how the mock destination answers
    #[must_use]
    #[allow(dead_code)]
    pub fn with_mock(mut self, configure: impl FnOnce(MockSmtpServerBuilder) -> MockSmtpServerBuilder) -> Self {
        self.mock = configure(self.mock);
        self
    }

    /// Start the mock server and postern.
    ///
    /// # Errors
    ///
    /// Returns an error if either fails to start.
    pub async fn build(self) -> anyhow::Result<E2ETestHarness> {
        let mock_server = self.mock.build().await?;
        let mail_root = tempfile::tempdir()?;

        let smtp_addr = {
            let reserved = TcpListener::bind("127.0.0.1:0").await?;
            reserved.local_addr()?
        };

        let config = format!(
            r#"(
                listeners: [(
                    socket: "{smtp_addr}",
                    banner: "mx.postern.test",
                    local_domains: ["{LOCAL_DOMAIN}"],
                    relay_allow: ["127.0.0.1"],
                )],
                delivery: (
                    smtp_port: {port},
                    poll_interval_ms: 50,
                    hostname: "out.postern.test",
                ),
                local_drop: Some("{root}"),
            )"#,
            port = mock_server.port(),
            root = mail_root.path().display(),
        );

        let mx = format!("mx.{}", self.test_domain);
        let lookup = StaticLookup::new()
            .with_mx(&self.test_domain, &mx, 10, Duration::from_secs(300))
            .with_host(&mx, "127.0.0.1".parse()?);

        let services = Postern::from_ron(&config)?.services_with(Arc::new(lookup))?;
        let store = services.store().clone();

        let (shutdown_tx, _) = broadcast::channel(16);
        let signals = shutdown_tx.clone();
        let handle = tokio::spawn(async move { services.serve(&signals).await });

        for _ in 0..100 {
            if tokio::net::TcpStream::connect(smtp_addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(E2ETestHarness {
            smtp_addr,
            mock_server,
            store,
            handle,
            shutdown_tx,
            mail_root,
        })
    }
}
