//! Reply-to addresses in `bus:queue` form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Where an RPC reply goes: a queue on a named bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyAddress {
    bus: String,
    queue: String,
}

impl ReplyAddress {
    pub fn new(bus: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            queue: queue.into(),
        }
    }

    pub fn bus(&self) -> &str {
        &self.bus
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.queue)
    }
}

impl FromStr for ReplyAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| AddressError {
            input: s.to_owned(),
            reason,
        };

        let mut parts = s.split(':');
        let (bus, queue) = match (parts.next(), parts.next(), parts.next()) {
            (Some(bus), Some(queue), None) => (bus, queue),
            (_, None, _) => return Err(malformed("expected bus:queue")),
            _ => return Err(malformed("more than one ':'")),
        };

        if bus.is_empty() {
            return Err(malformed("empty bus name"));
        }
        if queue.is_empty() {
            return Err(malformed("empty queue name"));
        }
        Ok(ReplyAddress::new(bus, queue))
    }
}
