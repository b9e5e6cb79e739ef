//! Build status lifecycle.
//!
//! ```text
//! SCHEDULED -> STARTED -> { SUCCESS | FAILURE | INFRA_FAILURE | CANCELED }
//!     \__________________________^
//! ```
//!
//! A build may skip STARTED and end straight from SCHEDULED. Ended statuses are
//! permanent.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[display("SCHEDULED")]
    Scheduled,
    #[display("STARTED")]
    Started,
    #[display("SUCCESS")]
    Success,
    #[display("FAILURE")]
    Failure,
    #[display("INFRA_FAILURE")]
    InfraFailure,
    #[display("CANCELED")]
    Canceled,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Scheduled,
        Status::Started,
        Status::Success,
        Status::Failure,
        Status::InfraFailure,
        Status::Canceled,
    ];

    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::InfraFailure | Status::Canceled
        )
    }

    /// Position in the lifecycle. All ended statuses share the last stage.
    pub fn stage(&self) -> u8 {
        match self {
            Status::Scheduled => 0,
            Status::Started => 1,
            _ => 2,
        }
    }

    /// How definitive a status is when two signals disagree.
    pub fn severity(&self) -> u8 {
        match self {
            Status::Scheduled => 0,
            Status::Started => 1,
            Status::Success => 2,
            Status::Failure => 3,
            Status::Canceled => 4,
            Status::InfraFailure => 5,
        }
    }

    /// Picks the more definitive of two statuses.
    ///
    /// An infra failure from either side dominates, cancellation dominates
    /// everything else, and a failure outranks a success.
    pub fn combine(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Whether `next` is a legal, strictly forward move from `self`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        !self.is_ended() && next.stage() > self.stage()
    }

    /// Guard for status mutation: rejects any change to an ended build and any
    /// move that is not strictly forward.
    pub fn transition_to(&mut self, next: Status) -> Result<()> {
        if self.is_ended() {
            return Err(Error::Conflict(format!(
                "status is already {self}; cannot move to {next}"
            )));
        }
        if next.stage() <= self.stage() {
            return Err(Error::Conflict(format!(
                "cannot move status backwards from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .into_iter()
            .find(|st| st.to_string() == s)
            .ok_or_else(|| Error::invalid(format!("unknown status {s:?}")))
    }
}
