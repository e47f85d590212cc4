use core::fmt::{self, Display, Formatter};
use std::{borrow::Cow, net::IpAddr};

use postern_common::{address::Address, status::Status};

use crate::{
    command::{Command, HeloVariant, MailParameters},
    relay::{RelayPolicy, Route},
};

/// Where a session is in the command sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Connected, greeting sent, waiting for HELO/EHLO
    #[default]
    Connect,
    /// Greeted, no transaction open
    Helloed,
    /// MAIL FROM accepted
    MailFrom,
    /// At least one RCPT TO accepted
    RcptTo,
    /// DATA accepted, the next lines are message content
    Data,
    /// QUIT received
    Quit,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connect => "Connect",
            Self::Helloed => "Helloed",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::Data => "DATA",
            Self::Quit => "QUIT",
        })
    }
}

/// One server reply, possibly multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub lines: Vec<Cow<'static, str>>,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    #[must_use]
    pub const fn multi(status: Status, lines: Vec<Cow<'static, str>>) -> Self {
        Self { status, lines }
    }

    /// Whether the session should end after sending this reply.
    #[must_use]
    pub fn closes(&self) -> bool {
        matches!(self.status, Status::GoodBye | Status::Unavailable)
    }
}

impl Display for Reply {
    /// Renders the wire form, `CRLF`-terminated, using `-` continuation for
    /// every line but the last.
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let code = self.status.code();
        let last = self.lines.len().saturating_sub(1);

        if self.lines.is_empty() {
            return write!(fmt, "{code}\r\n");
        }

        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            write!(fmt, "{code}{separator}{line}\r\n")?;
        }
        Ok(())
    }
}

/// The envelope being assembled by the current transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Option<Address>,
    pub parameters: MailParameters,
    /// Accepted recipients, each with its own route.
    pub recipients: Vec<(Address, Route)>,
}

impl Transaction {
    pub fn recipients_for(&self, route: Route) -> impl Iterator<Item = &Address> {
        self.recipients
            .iter()
            .filter(move |(_, r)| *r == route)
            .map(|(address, _)| address)
    }
}

/// Per-connection protocol state: what the client called itself, where in
/// the sequence it is, and the transaction in progress.
#[derive(Debug, Clone)]
pub struct Context {
    pub state: State,
    pub helo: Option<HeloVariant>,
    pub transaction: Transaction,
    pub peer: IpAddr,
}

impl Context {
    #[must_use]
    pub fn new(peer: IpAddr) -> Self {
        Self {
            state: State::Connect,
            helo: None,
            transaction: Transaction::default(),
            peer,
        }
    }

    #[must_use]
    pub const fn extended(&self) -> bool {
        matches!(self.helo, Some(HeloVariant::Ehlo(_)))
    }

    /// Discard the transaction and fall back to the greeted state, if the
    /// client has greeted at all.
    pub fn reset(&mut self) {
        self.transaction = Transaction::default();
        if !matches!(self.state, State::Connect | State::Quit) {
            self.state = State::Helloed;
        }
    }

    /// Apply `command` and produce the reply for it.
    ///
    /// `banner` names this server in greetings. RCPT TO consults `policy`
    /// for the recipient's route. DATA only moves to [`State::Data`]; the
    /// session is responsible for reading the content and calling
    /// [`Context::reset`] when it is done.
    pub fn transition(&mut self, command: Command, banner: &str, policy: &RelayPolicy) -> Reply {
        match (self.state, command) {
            (_, Command::Quit) => {
                self.state = State::Quit;
                Reply::new(Status::GoodBye, format!("{banner} Service closing transmission channel"))
            }
            (_, Command::Noop) => Reply::new(Status::Ok, "Ok"),
            (_, Command::Rset) => {
                self.reset();
                Reply::new(Status::Ok, "Ok")
            }

            (_, Command::Helo(variant)) => {
                self.transaction = Transaction::default();
                self.state = State::Helloed;

                let reply = match &variant {
                    HeloVariant::Ehlo(host) => Reply::multi(
                        Status::Ok,
                        vec![
                            Cow::Owned(format!("{banner} says hello to {host}")),
                            Cow::Borrowed("8BITMIME"),
                        ],
                    ),
                    HeloVariant::Helo(host) => {
                        Reply::new(Status::Ok, format!("{banner} says hello to {host}"))
                    }
                };
                self.helo = Some(variant);
                reply
            }

            (State::Connect, _) => Reply::new(
                Status::InvalidCommandSequence,
                "Send HELO/EHLO first",
            ),

            (State::Helloed | State::MailFrom | State::RcptTo, Command::MailFrom(sender, parameters)) => {
                self.transaction = Transaction {
                    sender,
                    parameters,
                    recipients: Vec::new(),
                };
                self.state = State::MailFrom;
                Reply::new(Status::Ok, "Ok")
            }

            (State::MailFrom | State::RcptTo, Command::RcptTo(recipient)) => {
                let Some(route) = policy.classify(&recipient, self.peer) else {
                    return Reply::new(Status::TransactionFailed, "Cannot relay");
                };
                self.transaction.recipients.push((recipient, route));
                self.state = State::RcptTo;
                Reply::new(Status::Ok, "Ok")
            }
            (_, Command::RcptTo(_)) => {
                Reply::new(Status::InvalidCommandSequence, "Need MAIL command first")
            }

            (State::RcptTo, Command::Data) => {
                self.state = State::Data;
                Reply::new(
                    Status::StartMailInput,
                    "Start mail input; end with <CRLF>.<CRLF>",
                )
            }
            (State::MailFrom, Command::Data) => {
                Reply::new(Status::InvalidCommandSequence, "Need RCPT command first")
            }
            (_, Command::Data) => {
                Reply::new(Status::InvalidCommandSequence, "Need MAIL command first")
            }

            (state, command) => Reply::new(
                Status::InvalidCommandSequence,
                format!("{command} not allowed in {state}"),
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const BANNER: &str = "mx.postern.test";

    fn policy() -> RelayPolicy {
        RelayPolicy::new(["localdomain"], vec!["10.0.0.1".parse().unwrap()])
    }

    fn run(ctx: &mut Context, line: &str) -> Reply {
        ctx.transition(Command::try_from(line).unwrap(), BANNER, &policy())
    }

    fn stranger() -> Context {
        Context::new("192.0.2.10".parse().unwrap())
    }

    #[test]
    fn helo_is_required_first() {
        let mut ctx = stranger();
        for line in ["MAIL FROM:<x@y>", "RCPT TO:<z@localdomain>", "DATA"] {
            assert_eq!(run(&mut ctx, line).status, Status::InvalidCommandSequence);
        }
        assert_eq!(ctx.state, State::Connect);
    }

    #[test]
    fn noop_rset_quit_are_legal_anywhere() {
        let mut ctx = stranger();
        assert_eq!(run(&mut ctx, "NOOP").status, Status::Ok);
        assert_eq!(run(&mut ctx, "RSET").status, Status::Ok);
        assert_eq!(ctx.state, State::Connect);

        run(&mut ctx, "HELO a");
        run(&mut ctx, "MAIL FROM:<x@y>");
        assert_eq!(run(&mut ctx, "RSET").status, Status::Ok);
        assert_eq!(ctx.state, State::Helloed);
        assert_eq!(ctx.transaction, Transaction::default());

        let reply = run(&mut ctx, "QUIT");
        assert_eq!(reply.status, Status::GoodBye);
        assert!(reply.closes());
        assert_eq!(ctx.state, State::Quit);
    }

    #[test]
    fn full_local_transaction() {
        let mut ctx = stranger();
        assert_eq!(run(&mut ctx, "HELO a").status, Status::Ok);
        assert_eq!(run(&mut ctx, "MAIL FROM:<x@y>").status, Status::Ok);
        assert_eq!(run(&mut ctx, "RCPT TO:<z@localdomain>").status, Status::Ok);
        assert_eq!(run(&mut ctx, "DATA").status, Status::StartMailInput);
        assert_eq!(ctx.state, State::Data);
        assert_eq!(
            ctx.transaction.recipients_for(Route::Local).count(),
            1
        );
    }

    #[test]
    fn relay_is_denied_for_strangers() {
        let mut ctx = stranger();
        run(&mut ctx, "HELO a");
        run(&mut ctx, "MAIL FROM:<x@y>");

        let reply = run(&mut ctx, "RCPT TO:<z@remote.test>");
        assert_eq!(reply.status, Status::TransactionFailed);
        assert_eq!(reply.to_string(), "554 Cannot relay\r\n");
        assert_eq!(ctx.state, State::MailFrom);
        assert!(ctx.transaction.recipients.is_empty());

        assert_eq!(run(&mut ctx, "DATA").status, Status::InvalidCommandSequence);
    }

    #[test]
    fn relay_is_allowed_for_listed_peers() {
        let mut ctx = Context::new("10.0.0.1".parse().unwrap());
        run(&mut ctx, "EHLO a");
        run(&mut ctx, "MAIL FROM:<>");
        assert_eq!(run(&mut ctx, "RCPT TO:<z@remote.test>").status, Status::Ok);
        assert_eq!(run(&mut ctx, "RCPT TO:<l@localdomain>").status, Status::Ok);

        assert_eq!(ctx.transaction.recipients_for(Route::Relay).count(), 1);
        assert_eq!(ctx.transaction.recipients_for(Route::Local).count(), 1);
        assert_eq!(ctx.transaction.sender, None);
    }

    #[test]
    fn mail_from_starts_fresh_transaction() {
        let mut ctx = stranger();
        run(&mut ctx, "HELO a");
        run(&mut ctx, "MAIL FROM:<x@y>");
        run(&mut ctx, "RCPT TO:<z@localdomain>");
        run(&mut ctx, "MAIL FROM:<other@y>");

        assert_eq!(ctx.state, State::MailFrom);
        assert!(ctx.transaction.recipients.is_empty());
        assert_eq!(
            ctx.transaction.sender,
            Some(Address::parse("other@y").unwrap())
        );
    }

    #[test]
    fn rcpt_needs_mail() {
        let mut ctx = stranger();
        run(&mut ctx, "HELO a");
        assert_eq!(
            run(&mut ctx, "RCPT TO:<z@localdomain>").status,
            Status::InvalidCommandSequence
        );
        assert_eq!(run(&mut ctx, "DATA").status, Status::InvalidCommandSequence);
    }

    #[test]
    fn ehlo_advertises_8bitmime() {
        let mut ctx = stranger();
        let reply = run(&mut ctx, "EHLO client.test");
        assert!(ctx.extended());
        assert_eq!(
            reply.to_string(),
            "250-mx.postern.test says hello to client.test\r\n250 8BITMIME\r\n"
        );
    }
}
