use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use postern_common::{
    Signal, error::SessionError, incoming, internal, outgoing, status::Status, tracing,
};
use postern_spool::{Envelope, LocalDelivery, MessageId, QueueStore, QueuedMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    command::{Command, CommandError},
    relay::{RelayPolicy, Route},
    state::{Context, Reply, State},
};

/// Longest command line accepted, CRLF included (RFC 5321 4.5.3.1.4 plus slack).
const MAX_COMMAND_LINE: usize = 1024;

/// Content lines are read in chunks of at most this many bytes.
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Everything a session needs that outlives it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub banner: Arc<str>,
    pub policy: Arc<RelayPolicy>,
    pub queue: Arc<dyn QueueStore>,
    pub local: Arc<dyn LocalDelivery>,
    /// How long to wait for each line from the client.
    pub receive_timeout: Duration,
    /// How long a reply may take to write.
    pub send_timeout: Duration,
    /// Largest accepted message, in bytes. 0 means unlimited.
    pub max_message_size: usize,
    /// Sending group assigned to relayed messages.
    pub group: String,
}

/// Outcome of reading message content after DATA.
enum Body {
    Complete(Vec<u8>),
    TooLarge(usize),
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    stream: BufReader<Stream>,
    context: Context,
    config: Arc<SessionConfig>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn create(stream: Stream, peer: SocketAddr, config: Arc<SessionConfig>) -> Self {
        Self {
            peer,
            stream: BufReader::new(stream),
            context: Context::new(peer.ip()),
            config,
        }
    }

    /// Drive the session until the client quits, disconnects, times out or
    /// the server shuts down.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the connection fails or the client stops
    /// sending within the receive timeout.
    #[tracing::instrument(level = "trace", skip_all, fields(peer = %self.peer))]
    pub async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let greeting = Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP postern", self.config.banner),
        );
        self.send(&greeting).await?;

        let result = loop {
            let line = tokio::select! {
                _ = signal.recv() => {
                    let _ = self
                        .send(&Reply::new(Status::Unavailable, "Server shutting down"))
                        .await;
                    break Ok(());
                }
                line = self.read_line(MAX_COMMAND_LINE) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };

            match self.handle_line(&line).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        internal!("Connection closed");
        result
    }

    /// Process one command line. Returns `false` once the session should end.
    async fn handle_line(&mut self, line: &[u8]) -> Result<bool, SessionError> {
        if !line.ends_with(b"\n") {
            self.send(&Reply::new(Status::SyntaxError, "Line too long"))
                .await?;
            self.discard_rest_of_line().await?;
            return Ok(true);
        }

        incoming!("{}", String::from_utf8_lossy(line).trim_end());

        let reply = match Command::try_from(line) {
            Ok(Command::MailFrom(_, ref params))
                if self.config.max_message_size > 0
                    && params
                        .size()
                        .is_some_and(|size| size > self.config.max_message_size) =>
            {
                Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "Message size exceeds fixed maximum message size of {} bytes",
                        self.config.max_message_size
                    ),
                )
            }
            Ok(command) => {
                self.context
                    .transition(command, &self.config.banner, &self.config.policy)
            }
            Err(CommandError::Unrecognised(_)) => {
                Reply::new(Status::SyntaxError, "Syntax error, command unrecognized")
            }
            Err(CommandError::Syntax(message)) => {
                Reply::new(Status::ParameterSyntaxError, message)
            }
        };

        self.send(&reply).await?;
        if reply.closes() {
            return Ok(false);
        }

        if self.context.state == State::Data {
            let reply = match self.read_body().await? {
                Some(Body::Complete(body)) => self.accept(body).await,
                Some(Body::TooLarge(size)) => Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "Actual message size {size} bytes exceeds maximum allowed size {} bytes",
                        self.config.max_message_size
                    ),
                ),
                None => return Ok(false),
            };
            self.context.reset();
            self.send(&reply).await?;
        }

        Ok(true)
    }

    /// Read message content up to the lone `.`, undoing dot-stuffing.
    /// `None` means the client went away mid-message.
    async fn read_body(&mut self) -> Result<Option<Body>, SessionError> {
        let limit = self.config.max_message_size;
        let mut body = Vec::new();
        let mut size = 0usize;
        let mut at_line_start = true;

        loop {
            let Some(chunk) = self.read_line(MAX_DATA_CHUNK).await? else {
                return Ok(None);
            };

            if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let content = if at_line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };

            size = size.saturating_add(content.len());
            if limit == 0 || size <= limit {
                body.extend_from_slice(content);
            }
            at_line_start = chunk.ends_with(b"\n");
        }

        if limit > 0 && size > limit {
            internal!(level = INFO, "Rejected {size} byte message");
            return Ok(Some(Body::TooLarge(size)));
        }
        Ok(Some(Body::Complete(body)))
    }

    /// Hand a completed message to the outbound queue and the local drop.
    /// Either every recipient is accepted or none is.
    async fn accept(&mut self, body: Vec<u8>) -> Reply {
        let id = MessageId::generate();
        let transaction = &self.context.transaction;
        let helo = self
            .context
            .helo
            .as_ref()
            .map_or("unknown", |helo| helo.host());

        let mut data = format!(
            "Received: from {helo} ([{}]) by {} with SMTP id {id}; {}\r\n",
            self.peer.ip(),
            self.config.banner,
            chrono::Utc::now().to_rfc2822()
        )
        .into_bytes();
        data.extend_from_slice(&body);
        let data: Arc<[u8]> = data.into();

        let mut by_domain = BTreeMap::<String, Vec<_>>::new();
        for recipient in transaction.recipients_for(Route::Relay) {
            by_domain
                .entry(recipient.domain_key())
                .or_default()
                .push(recipient.clone());
        }

        let mut queued = Vec::with_capacity(by_domain.len());
        for (domain, recipients) in by_domain {
            let envelope = Envelope {
                sender: transaction.sender.clone(),
                recipients,
            };
            let message =
                QueuedMessage::new(envelope, Arc::clone(&data), self.config.group.clone());
            match self.config.queue.enqueue(message).await {
                Ok(message) => {
                    internal!(level = INFO, "Queued {message} for {domain}");
                    queued.push(message);
                }
                Err(err) => {
                    internal!(level = ERROR, "Unable to queue {id} for {domain}: {err}");
                    self.withdraw(&queued).await;
                    return Self::local_error();
                }
            }
        }

        let locals: Vec<_> = transaction.recipients_for(Route::Local).cloned().collect();
        if !locals.is_empty() {
            let envelope = Envelope {
                sender: transaction.sender.clone(),
                recipients: locals,
            };
            if let Err(err) = self.config.local.deliver(id, &envelope, Arc::clone(&data)).await {
                internal!(level = ERROR, "Local delivery of {id} failed: {err}");
                self.withdraw(&queued).await;
                return Self::local_error();
            }
        }

        Reply::new(Status::Ok, "Message queued for delivery")
    }

    /// Take back the queued copies of a message that is being refused.
    async fn withdraw(&self, queued: &[MessageId]) {
        for message in queued {
            if let Err(err) = self.config.queue.withdraw(message).await {
                internal!(level = WARN, "Unable to withdraw {message}: {err}");
            }
        }
    }

    fn local_error() -> Reply {
        Reply::new(
            Status::ActionUnavailable,
            "Requested action aborted: local error in processing",
        )
    }

    /// Read one line of at most `limit` bytes, `None` on end of stream.
    async fn read_line(&mut self, limit: usize) -> Result<Option<Vec<u8>>, SessionError> {
        let timeout = self.config.receive_timeout;
        let mut line = Vec::new();
        let read = async {
            (&mut self.stream)
                .take(u64::try_from(limit).unwrap_or(u64::MAX))
                .read_until(b'\n', &mut line)
                .await
        };
        let result = tokio::time::timeout(timeout, read).await;

        match result {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                internal!(level = DEBUG, "Receive timeout after {timeout:?}");
                let _ = self
                    .send(&Reply::new(
                        Status::Unavailable,
                        "Timeout waiting for input, closing connection",
                    ))
                    .await;
                Err(SessionError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn discard_rest_of_line(&mut self) -> Result<(), SessionError> {
        while let Some(chunk) = self.read_line(MAX_COMMAND_LINE).await? {
            if chunk.ends_with(b"\n") {
                break;
            }
        }
        Ok(())
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        let wire = reply.to_string();
        outgoing!("{}", wire.trim_end());

        let write = async {
            let stream = self.stream.get_mut();
            stream.write_all(wire.as_bytes()).await?;
            stream.flush().await
        };

        tokio::time::timeout(self.config.send_timeout, write)
            .await
            .map_err(|_| SessionError::Timeout(self.config.send_timeout.as_secs()))?
            .map_err(SessionError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test {
    use postern_spool::{MemoryMailDrop, MemoryQueueStore};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    struct Harness {
        queue: MemoryQueueStore,
        mail_drop: MemoryMailDrop,
        client: BufReader<DuplexStream>,
        task: tokio::task::JoinHandle<Result<(), SessionError>>,
        shutdown: tokio::sync::broadcast::Sender<Signal>,
    }

    fn start(peer: &str, max_message_size: usize) -> Harness {
        start_with(peer, max_message_size, MemoryQueueStore::new())
    }

    fn start_with(peer: &str, max_message_size: usize, queue: MemoryQueueStore) -> Harness {
        let mail_drop = MemoryMailDrop::new();
        let config = Arc::new(SessionConfig {
            banner: Arc::from("mx.postern.test"),
            policy: Arc::new(RelayPolicy::new(
                ["localdomain"],
                vec!["10.0.0.1".parse().unwrap()],
            )),
            queue: Arc::new(queue.clone()),
            local: Arc::new(mail_drop.clone()),
            receive_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            max_message_size,
            group: "default".to_string(),
        });

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (shutdown, receiver) = tokio::sync::broadcast::channel(1);
        let session = Session::create(server, peer.parse().unwrap(), config);

        Harness {
            queue,
            mail_drop,
            client: BufReader::new(client),
            task: tokio::spawn(session.run(receiver)),
            shutdown,
        }
    }

    impl Harness {
        async fn reply(&mut self) -> String {
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                self.client.read_line(&mut line).await.unwrap();
                reply.push_str(&line);
                if line.as_bytes().get(3) != Some(&b'-') {
                    return reply;
                }
            }
        }

        async fn send(&mut self, line: &str) -> String {
            self.client
                .get_mut()
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
            self.reply().await
        }

        async fn write(&mut self, raw: &[u8]) {
            self.client.get_mut().write_all(raw).await.unwrap();
        }
    }

    #[tokio::test]
    async fn local_recipient_is_dropped_locally() {
        let mut h = start("192.0.2.7:2525", 0);
        assert!(h.reply().await.starts_with("220 mx.postern.test"));

        assert!(h.send("HELO a").await.starts_with("250 "));
        assert!(h.send("MAIL FROM:<x@y>").await.starts_with("250 "));
        assert!(h.send("RCPT TO:<z@localdomain>").await.starts_with("250 "));
        assert!(h.send("DATA").await.starts_with("354 "));
        h.write(b"Subject: hi\r\n\r\n..leading dot\r\nbody\r\n").await;
        assert_eq!(h.send(".").await, "250 Message queued for delivery\r\n");

        assert_eq!(h.mail_drop.len(), 1);
        assert!(h.queue.is_empty().await.unwrap());

        let (_, envelope, data) = h.mail_drop.messages().remove(0);
        assert_eq!(envelope.recipients[0].to_string(), "z@localdomain");
        let text = String::from_utf8(data.to_vec()).unwrap();
        assert!(text.starts_with("Received: from a ([192.0.2.7]) by mx.postern.test with SMTP id "));
        assert!(text.ends_with("Subject: hi\r\n\r\n.leading dot\r\nbody\r\n"));

        assert!(h.send("QUIT").await.starts_with("221 "));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn relay_denied_queues_nothing() {
        let mut h = start("192.0.2.7:2525", 0);
        h.reply().await;
        h.send("HELO a").await;
        h.send("MAIL FROM:<x@y>").await;
        assert_eq!(h.send("RCPT TO:<z@remote.test>").await, "554 Cannot relay\r\n");
        assert!(h.send("DATA").await.starts_with("503 "));
        h.send("QUIT").await;

        h.task.await.unwrap().unwrap();
        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.mail_drop.is_empty());
    }

    #[tokio::test]
    async fn full_queue_refuses_the_whole_message() {
        let mut h = start_with("10.0.0.1:2525", 0, MemoryQueueStore::with_capacity(1));
        h.reply().await;
        h.send("EHLO relay.client").await;
        h.send("MAIL FROM:<x@y>").await;
        for rcpt in ["a@one.test", "b@two.test", "c@localdomain"] {
            assert!(h.send(&format!("RCPT TO:<{rcpt}>")).await.starts_with("250 "));
        }
        h.send("DATA").await;
        h.write(b"body\r\n").await;
        assert!(h.send(".").await.starts_with("451 "));

        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.queue.history().is_empty());
        assert!(h.mail_drop.is_empty());

        // The session carries on and the next message fits
        h.send("MAIL FROM:<x@y>").await;
        h.send("RCPT TO:<a@one.test>").await;
        h.send("DATA").await;
        h.write(b"body\r\n").await;
        assert!(h.send(".").await.starts_with("250 "));
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn relay_splits_by_domain_and_keeps_locals_local() {
        let mut h = start("10.0.0.1:2525", 0);
        h.reply().await;
        h.send("EHLO relay.client").await;
        h.send("MAIL FROM:<x@y>").await;
        for rcpt in ["a@one.test", "b@ONE.test", "c@two.test", "d@localdomain"] {
            assert!(h.send(&format!("RCPT TO:<{rcpt}>")).await.starts_with("250 "));
        }
        h.send("DATA").await;
        h.write(b"body\r\n").await;
        assert!(h.send(".").await.starts_with("250 "));

        assert_eq!(h.queue.len().await.unwrap(), 2);
        assert_eq!(h.mail_drop.len(), 1);

        let batch = h
            .queue
            .pickup_batch(10, std::time::SystemTime::now())
            .await
            .unwrap();
        let mut domains: Vec<_> = batch
            .iter()
            .map(|m| (m.envelope.recipient_domain().unwrap(), m.envelope.recipients.len()))
            .collect();
        domains.sort();
        assert_eq!(
            domains,
            vec![("one.test".to_string(), 2), ("two.test".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn unknown_and_malformed_commands() {
        let mut h = start("192.0.2.7:2525", 0);
        h.reply().await;
        assert!(h.send("VRFY root").await.starts_with("500 "));
        assert!(h.send("HELO a").await.starts_with("250 "));
        assert!(h.send("MAIL FROM:<broken").await.starts_with("501 "));
        assert!(h.send("NOOP").await.starts_with("250 "));
        assert!(h.send("RSET").await.starts_with("250 "));
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let mut h = start("192.0.2.7:2525", 16);
        h.reply().await;
        h.send("HELO a").await;
        assert!(h.send("MAIL FROM:<x@y> SIZE=1000").await.starts_with("552 "));
        h.send("MAIL FROM:<x@y>").await;
        h.send("RCPT TO:<z@localdomain>").await;
        h.send("DATA").await;
        h.write(b"this line is far longer than sixteen bytes\r\n").await;
        assert!(h.send(".").await.starts_with("552 "));
        assert!(h.mail_drop.is_empty());

        // The session is usable afterwards
        assert!(h.send("MAIL FROM:<x@y>").await.starts_with("250 "));
    }

    #[tokio::test]
    async fn shutdown_ends_idle_session() {
        let mut h = start("192.0.2.7:2525", 0);
        h.reply().await;
        h.send("HELO a").await;

        h.shutdown.send(Signal::Shutdown).unwrap();
        assert!(h.reply().await.starts_with("421 "));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_times_out() {
        let mut h = start("192.0.2.7:2525", 0);
        h.reply().await;

        assert!(h.reply().await.starts_with("421 "));
        assert!(matches!(
            h.task.await.unwrap(),
            Err(SessionError::Timeout(5))
        ));
    }
}
