use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the server and understood by the client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady,
    GoodBye,
    Ok,
    StartMailInput,
    Unavailable,
    ActionUnavailable,
    SyntaxError,
    ParameterSyntaxError,
    InvalidCommandSequence,
    Error,
    ExceededStorage,
    TransactionFailed,
    Unknown(u16),
}

/// The class of a reply, decided purely by its leading digit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Class {
    Success,
    Intermediate,
    Transient,
    Permanent,
    Invalid,
}

impl Class {
    #[must_use]
    pub const fn of(code: u16) -> Self {
        match code / 100 {
            2 => Self::Success,
            3 => Self::Intermediate,
            4 => Self::Transient,
            5 => Self::Permanent,
            _ => Self::Invalid,
        }
    }
}

impl Status {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::ServiceReady => 220,
            Self::GoodBye => 221,
            Self::Ok => 250,
            Self::StartMailInput => 354,
            Self::Unavailable => 421,
            Self::ActionUnavailable => 451,
            Self::SyntaxError => 500,
            Self::ParameterSyntaxError => 501,
            Self::InvalidCommandSequence => 503,
            Self::Error => 550,
            Self::ExceededStorage => 552,
            Self::TransactionFailed => 554,
            Self::Unknown(v) => v,
        }
    }

    #[must_use]
    pub const fn class(self) -> Class {
        Class::of(self.code())
    }

    /// Checks if the status is a permanent rejection
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        matches!(self.class(), Class::Permanent)
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        matches!(self.class(), Class::Transient)
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            250 => Self::Ok,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            500 => Self::SyntaxError,
            501 => Self::ParameterSyntaxError,
            503 => Self::InvalidCommandSequence,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        value.code()
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", self.code())
    }
}
