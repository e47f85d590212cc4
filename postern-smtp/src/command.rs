use core::fmt::{self, Display, Formatter};

use ahash::AHashMap;
use postern_common::address::Address;

/// ESMTP parameters for MAIL FROM command (RFC 5321 Section 3.3).
///
/// Keys are normalised to upper case. Only `SIZE` and `BODY` carry any
/// meaning to the server; everything else is kept and ignored.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<String, Option<String>>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses parameter tokens in the form `KEY=VALUE` or `FLAG`.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter appears multiple times, or `SIZE`
    /// is not a positive number.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));
            let key = key.to_ascii_uppercase();

            if params.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" && !value.and_then(|v| v.parse::<usize>().ok()).is_some_and(|v| v > 0)
            {
                return Err(format!("Invalid SIZE value: {}", value.unwrap_or_default()));
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    /// Gets a parameter value by key (case-insensitive).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_uppercase())?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(&key.to_ascii_uppercase())
    }

    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.params.iter().collect();
        keys.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (index, (key, value)) in keys.into_iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            match value {
                None => f.write_str(key)?,
                Some(value) => write!(f, "{key}={value}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Ehlo(host) | Self::Helo(host) => host,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(host) => write!(f, "EHLO {host}"),
            Self::Helo(host) => write!(f, "HELO {host}"),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path (`MAIL FROM:<>`).
    MailFrom(Option<Address>, MailParameters),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
}

/// Why a command line could not be turned into a [`Command`].
#[derive(Eq, PartialEq, Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// Not a verb this server knows; answered with 500.
    #[error("Command unrecognized: {0}")]
    Unrecognised(String),
    /// A known verb with bad arguments; answered with 501.
    #[error("{0}")]
    Syntax(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(variant) => variant.fmt(fmt),
            Self::MailFrom(from, params) => {
                let from = from.as_ref().map(ToString::to_string).unwrap_or_default();
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:<{from}>")
                } else {
                    write!(fmt, "MAIL FROM:<{from}> {params}")
                }
            }
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
        }
    }
}

/// Case-insensitively strips `prefix` from the front of `line`.
fn strip_verb<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .and_then(|_| line.get(prefix.len()..))
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_verb(trimmed, "MAIL FROM:") {
            let rest = rest.trim();
            let (addr, params) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(addr, params)| (addr, params));

            if addr.is_empty() {
                return Err(CommandError::Syntax(
                    "Syntax: MAIL FROM:<address>".to_string(),
                ));
            }

            let params = MailParameters::from_params_str(params).map_err(CommandError::Syntax)?;
            let from = Address::parse_reverse(addr)
                .map_err(|err| CommandError::Syntax(format!("Invalid sender: {err}")))?;

            Ok(Self::MailFrom(from, params))
        } else if let Some(rest) = strip_verb(trimmed, "RCPT TO:") {
            let rest = rest.trim();
            // Parameters after the path are accepted and ignored
            let addr = rest.split_whitespace().next().unwrap_or_default();

            Address::parse(addr)
                .map(Self::RcptTo)
                .map_err(|err| CommandError::Syntax(format!("Invalid recipient: {err}")))
        } else {
            let (verb, argument) = trimmed
                .split_once(char::is_whitespace)
                .map_or((trimmed, ""), |(verb, arg)| (verb, arg.trim()));

            match verb.to_ascii_uppercase().as_str() {
                "EHLO" | "HELO" if argument.is_empty() => Err(CommandError::Syntax(format!(
                    "Expected hostname in {trimmed}"
                ))),
                "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(argument.to_string()))),
                "HELO" => Ok(Self::Helo(HeloVariant::Helo(argument.to_string()))),
                "DATA" | "RSET" | "QUIT" if !argument.is_empty() => Err(CommandError::Syntax(
                    format!("{} takes no arguments", verb.to_ascii_uppercase()),
                )),
                "DATA" => Ok(Self::Data),
                "RSET" => Ok(Self::Rset),
                "QUIT" => Ok(Self::Quit),
                // NOOP may carry an ignored string argument
                "NOOP" => Ok(Self::Noop),
                "MAIL" | "RCPT" => Err(CommandError::Syntax(format!(
                    "Syntax error in parameters: {trimmed}"
                ))),
                _ => Err(CommandError::Unrecognised(trimmed.to_string())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = CommandError;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| {
                Err(CommandError::Unrecognised(
                    "Unable to interpret command".to_string(),
                ))
            },
            Self::try_from,
        )
    }
}
