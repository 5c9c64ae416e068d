//! Event handling module
//!
//! Dispatch envelopes, the allow-list filter, and the sink shards forward
//! events to.

pub mod serialize;

pub use serialize::DispatchEvent;

use crate::error::GatewayError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::str::FromStr;

/// Where forwarded dispatch events go.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DispatchEvent) -> Result<(), GatewayError>;
}

/// Sink for local mode: events are counted and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: &DispatchEvent) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Allow-list of dispatch names. `all` turns filtering off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    All,
    Only(HashSet<String>),
}

impl EventFilter {
    pub fn allows(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(event_type),
        }
    }
}

impl FromStr for EventFilter {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: HashSet<String> = s
            .split(',')
            .map(|name| name.trim().to_ascii_uppercase())
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() || names.contains("ALL") {
            return Ok(Self::All);
        }
        Ok(Self::Only(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sentinel_disables_filtering() {
        assert_eq!("all".parse::<EventFilter>().unwrap(), EventFilter::All);
        assert_eq!("GUILD_CREATE, all".parse::<EventFilter>().unwrap(), EventFilter::All);
        assert_eq!("".parse::<EventFilter>().unwrap(), EventFilter::All);
        assert!(EventFilter::All.allows("ANYTHING"));
    }

    #[test]
    fn allow_list_matches_exact_names() {
        let filter: EventFilter = "guild_create, MESSAGE_CREATE".parse().unwrap();
        assert!(filter.allows("GUILD_CREATE"));
        assert!(filter.allows("MESSAGE_CREATE"));
        assert!(!filter.allows("TYPING_START"));
    }
}
