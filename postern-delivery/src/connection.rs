//! Client side of an outbound SMTP conversation over one pooled transport.
//!
//! Every step returns a [`StepOutcome`] instead of an error, leaving the
//! permanent-or-transient decision visible to the caller.
//!
//! # Lifecycle
//!
//! A connection is `Idle`, `InUse` or `Closed`, held in an atomic:
//!
//! - A step run on an `Idle` connection moves it to `InUse` for the round
//!   trip and back afterwards
//! - The pool keeps connections it hands out `InUse` until they are
//!   released
//! - The idle watchdog closes a connection only after moving it from
//!   `Idle` to `Closed`, so a connection in use is never closed under its
//!   caller
//! - Once `Closed`, every step reports [`StepOutcome::NotConnected`]

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use postern_common::{internal, status::Status};
use postern_smtp::client::{ClientError, Response, SmtpClient, TransferEncoding};
use tokio::time::Instant;

use crate::{error::DeliveryError, pool::OpenPermit, unavailable::ServiceUnavailableTracker};

const IDLE: u8 = 0;
const IN_USE: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Closed,
}

impl ConnectionState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => Self::Idle,
            IN_USE => Self::InUse,
            _ => Self::Closed,
        }
    }
}

/// The result of one protocol step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success(Response),
    /// 4xx replies, transport failures and timeouts
    Transient(String),
    /// 5xx replies
    Permanent(String),
    /// The connection was already closed, by us, the peer or the idle timer
    NotConnected,
}

impl StepOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Turn the outcome into the delivery error taxonomy.
    ///
    /// # Errors
    ///
    /// Every outcome other than [`StepOutcome::Success`].
    pub fn into_result(self) -> Result<Response, DeliveryError> {
        match self {
            Self::Success(response) => Ok(response),
            Self::Transient(reason) => Err(DeliveryError::Temporary(reason)),
            Self::Permanent(reason) => Err(DeliveryError::Permanent(reason)),
            Self::NotConnected => Err(DeliveryError::Temporary(
                "Connection is no longer open".to_string(),
            )),
        }
    }
}

/// What a connection is for: a sending IP talking to one MX host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub ip: IpAddr,
    pub host: String,
}

impl ConnectionKey {
    pub fn new(ip: IpAddr, host: &str) -> Self {
        Self {
            ip: ip.to_canonical(),
            host: host.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.ip, self.host)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long to wait for the reply to the end of message data
    pub data_timeout: Duration,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    client: Option<SmtpClient>,
    helloed: bool,
    /// The peer advertised 8BITMIME
    eight_bit_peer: bool,
    encoding: TransferEncoding,
    permit: Option<OpenPermit>,
}

#[derive(Debug)]
struct Shared {
    key: ConnectionKey,
    state: AtomicU8,
    data_count: AtomicU64,
    last_activity: Mutex<Instant>,
    inner: tokio::sync::Mutex<Inner>,
    settings: ConnectionSettings,
    tracker: Arc<ServiceUnavailableTracker>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Mark closed and hand back the transport, releasing the open permit.
    fn shut(&self, inner: &mut Inner) -> Option<SmtpClient> {
        self.state.store(CLOSED, Ordering::Release);
        inner.permit = None;
        inner.client.take()
    }
}

/// Keeps a connection `InUse` for one step, restoring `Idle` afterwards
/// when that is where it started.
struct Activity<'a> {
    shared: &'a Shared,
    restore: bool,
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        self.shared.touch();
        if self.restore {
            let _ = self.shared.state.compare_exchange(
                IN_USE,
                IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

/// One outbound SMTP connection. Clones share the same transport.
#[derive(Debug, Clone)]
pub struct OutboundConnection {
    shared: Arc<Shared>,
}

impl OutboundConnection {
    /// Open a transport from `key.ip` to `address` and read the greeting.
    ///
    /// A 421 greeting blocks the key in `tracker`. The new connection is
    /// `Idle` and watched by the idle timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or the greeting
    /// is not 2xx.
    pub async fn connect(
        key: ConnectionKey,
        address: SocketAddr,
        settings: ConnectionSettings,
        tracker: Arc<ServiceUnavailableTracker>,
        permit: Option<OpenPermit>,
    ) -> Result<Self, ClientError> {
        internal!(level = DEBUG, "Connecting {key} at {address}");

        let mut client = SmtpClient::connect(address, Some(key.ip), settings.connect_timeout)
            .await?
            .with_command_timeout(settings.command_timeout);

        let greeting = client.read_greeting().await?;
        if !greeting.is_success() {
            if greeting.code == Status::Unavailable.code() {
                tracker.record(key.ip, &key.host, std::time::Instant::now());
            }
            client.quit().await;
            return Err(ClientError::SmtpError {
                code: greeting.code,
                message: greeting.message(),
            });
        }

        let shared = Arc::new(Shared {
            key,
            state: AtomicU8::new(IDLE),
            data_count: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            inner: tokio::sync::Mutex::new(Inner {
                client: Some(client),
                helloed: false,
                eight_bit_peer: false,
                encoding: TransferEncoding::SevenBit,
                permit,
            }),
            settings,
            tracker,
        });

        Self::watch(&shared);

        Ok(Self { shared })
    }

    /// Close the connection once it has sat `Idle` past the idle timeout.
    fn watch(shared: &Arc<Shared>) {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let idle = shared.settings.idle_timeout;

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(shared) = weak.upgrade() else { return };
                    match shared.state.load(Ordering::Acquire) {
                        IDLE => *shared.last_activity.lock() + idle,
                        IN_USE => Instant::now() + idle,
                        _ => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(shared) = weak.upgrade() else { return };
                if Instant::now() < *shared.last_activity.lock() + idle {
                    continue;
                }

                if shared
                    .state
                    .compare_exchange(IDLE, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    internal!(level = DEBUG, "Closing idle connection {}", shared.key);
                    let mut inner = shared.inner.lock().await;
                    if let Some(mut client) = shared.shut(&mut inner) {
                        client.quit().await;
                    }
                    return;
                }
            }
        });
    }

    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.shared.key
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Number of messages accepted on this connection.
    #[must_use]
    pub fn data_count(&self) -> u64 {
        self.shared.data_count.load(Ordering::Acquire)
    }

    /// Take an `Idle` connection for exclusive use. Fails when the
    /// connection is in use elsewhere or already closed.
    pub(crate) fn claim(&self) -> bool {
        self.shared
            .state
            .compare_exchange(IDLE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Return a claimed connection to `Idle`, restarting the idle timer.
    pub(crate) fn unclaim(&self) -> bool {
        self.shared.touch();
        self.shared
            .state
            .compare_exchange(IN_USE, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn enter(&self) -> Option<Activity<'_>> {
        match self.shared.state.compare_exchange(
            IDLE,
            IN_USE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(Activity {
                shared: &self.shared,
                restore: true,
            }),
            Err(IN_USE) => Some(Activity {
                shared: &self.shared,
                restore: false,
            }),
            Err(_) => None,
        }
    }

    /// Classify a reply: `accept` decides success, 421 blocks the key and
    /// drops the transport, 5xx is permanent, everything else transient.
    fn classify(
        &self,
        inner: &mut Inner,
        result: Result<Response, ClientError>,
        accept: fn(&Response) -> bool,
    ) -> StepOutcome {
        match result {
            Ok(response) if accept(&response) => StepOutcome::Success(response),
            Ok(response) => {
                let reason = format!("{} {}", response.code, response.message());
                if response.code == Status::Unavailable.code() {
                    let key = &self.shared.key;
                    self.shared
                        .tracker
                        .record(key.ip, &key.host, std::time::Instant::now());
                    self.shared.shut(inner);
                }

                if response.is_permanent_error() {
                    StepOutcome::Permanent(reason)
                } else {
                    StepOutcome::Transient(reason)
                }
            }
            Err(err) => {
                internal!(level = DEBUG, "{}: {err}", self.shared.key);
                self.shared.shut(inner);
                StepOutcome::Transient(err.to_string())
            }
        }
    }

    /// EHLO, falling back to HELO when EHLO is refused.
    pub async fn hello(&self, name: &str) -> StepOutcome {
        let Some(_activity) = self.enter() else {
            return StepOutcome::NotConnected;
        };
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        let Some(client) = inner.client.as_mut() else {
            return StepOutcome::NotConnected;
        };

        let result = match client.ehlo(name).await {
            Ok(response) if response.is_success() => {
                inner.eight_bit_peer = response.advertises("8BITMIME");
                Ok(response)
            }
            Ok(response) if response.code == Status::Unavailable.code() => Ok(response),
            Ok(_) => {
                inner.eight_bit_peer = false;
                client.helo(name).await
            }
            Err(err) => Err(err),
        };

        let outcome = self.classify(inner, result, Response::is_success);
        inner.helloed = outcome.is_success();
        outcome
    }

    /// `MAIL FROM`. An 8-bit body is announced with `BODY=8BITMIME` and
    /// sent as-is when the peer supports it.
    pub async fn mail_from(&self, sender: Option<&str>, eight_bit_body: bool) -> StepOutcome {
        let Some(_activity) = self.enter() else {
            return StepOutcome::NotConnected;
        };
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        let eight_bit = eight_bit_body && inner.eight_bit_peer;
        let Some(client) = inner.client.as_mut() else {
            return StepOutcome::NotConnected;
        };

        let params: &[&str] = if eight_bit { &["BODY=8BITMIME"] } else { &[] };
        let result = client.mail_from(sender, params).await;

        let outcome = self.classify(inner, result, Response::is_success);
        if outcome.is_success() && eight_bit {
            inner.encoding = TransferEncoding::EightBit;
        }
        outcome
    }

    pub async fn rcpt_to(&self, recipient: &str) -> StepOutcome {
        let Some(_activity) = self.enter() else {
            return StepOutcome::NotConnected;
        };
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        let Some(client) = inner.client.as_mut() else {
            return StepOutcome::NotConnected;
        };

        let result = client.rcpt_to(recipient).await;
        self.classify(inner, result, Response::is_success)
    }

    /// `DATA`, the body, and the final reply. The body is only sent after a
    /// 354; any other reply to `DATA` fails the step. After `cap` accepted messages
    /// the connection quits instead of staying open for reuse.
    pub async fn data(&self, body: &[u8], cap: Option<u64>) -> StepOutcome {
        let Some(_activity) = self.enter() else {
            return StepOutcome::NotConnected;
        };
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        let encoding = std::mem::take(&mut inner.encoding);
        let Some(client) = inner.client.as_mut() else {
            return StepOutcome::NotConnected;
        };

        let result = match client.data().await {
            Ok(response) if response.code == Status::StartMailInput.code() => {
                client
                    .send_data(body, encoding, self.shared.settings.data_timeout)
                    .await
            }
            // Anything but 354 means the body was never sent
            Ok(response) => {
                let outcome = self.classify(inner, Ok(response), |_| false);
                if let Some(mut client) = self.shared.shut(inner) {
                    client.quit().await;
                }
                return outcome;
            }
            Err(err) => Err(err),
        };

        let outcome = self.classify(inner, result, Response::is_success);
        if outcome.is_success() {
            let sent = self.shared.data_count.fetch_add(1, Ordering::AcqRel) + 1;
            if cap.is_some_and(|cap| sent >= cap) {
                internal!(
                    level = DEBUG,
                    "{} reached {sent} messages, closing",
                    self.shared.key
                );
                if let Some(mut client) = self.shared.shut(inner) {
                    client.quit().await;
                }
            }
        }
        outcome
    }

    /// `RSET`, starting a new transaction on a helloed connection. A
    /// transport failure reports [`StepOutcome::NotConnected`].
    pub async fn reset(&self) -> StepOutcome {
        let Some(_activity) = self.enter() else {
            return StepOutcome::NotConnected;
        };
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        inner.encoding = TransferEncoding::SevenBit;
        let Some(client) = inner.client.as_mut() else {
            return StepOutcome::NotConnected;
        };

        match client.rset().await {
            Ok(response) => self.classify(inner, Ok(response), Response::is_success),
            Err(err) => {
                internal!(level = DEBUG, "{}: {err}", self.shared.key);
                self.shared.shut(inner);
                StepOutcome::NotConnected
            }
        }
    }

    /// Hello on a fresh connection, reset on one that already said hello.
    pub async fn hello_or_reset(&self, name: &str) -> StepOutcome {
        let helloed = self.shared.inner.lock().await.helloed;
        if helloed {
            self.reset().await
        } else {
            self.hello(name).await
        }
    }

    /// Whether the connection has said hello, and so will be reset rather
    /// than greeted again.
    pub async fn is_helloed(&self) -> bool {
        self.shared.inner.lock().await.helloed
    }

    /// Send `QUIT` and close without waiting for the reply.
    pub async fn quit(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(mut client) = self.shared.shut(&mut inner) {
            client.quit().await;
        }
    }

    /// Close without awaiting, quitting on a background task when a
    /// runtime is available.
    pub fn close_in_background(&self) {
        if self.shared.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = self.clone();
            runtime.spawn(async move { connection.quit().await });
        } else if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(mut client) = self.shared.shut(&mut inner) {
                client.abort();
            }
        }
    }
}
