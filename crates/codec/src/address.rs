//! Remote addresses: (protocol, authority-string, bootstrapable-flag).
//!
//! Authority parsing follows a `scheme://authority` convention, with `*`
//! recognized as a bind-any-interface wildcard authority for server
//! bindings.

use std::fmt;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Lora,
    Unknown,
}

impl Protocol {
    fn as_scheme(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Lora => "lora",
            Self::Unknown => "unknown",
        }
    }

    fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "tcp" => Self::Tcp,
            "lora" => Self::Lora,
            _ => Self::Unknown,
        }
    }
}

/// `protocol://authority` tuple with a flag recording whether this address
/// was sourced from a bootstrap list (and should be retried on failure).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    protocol: Protocol,
    authority: String,
    bootstrapable: bool,
}

impl RemoteAddress {
    pub fn new(protocol: Protocol, authority: impl Into<String>) -> Result<Self, Error> {
        Self::with_bootstrap(protocol, authority, false)
    }

    pub fn with_bootstrap(
        protocol: Protocol,
        authority: impl Into<String>,
        bootstrapable: bool,
    ) -> Result<Self, Error> {
        let authority = authority.into();
        if protocol == Protocol::Unknown || authority.is_empty() {
            return Err(Error::InvalidAddress);
        }

        if protocol == Protocol::Tcp && authority != "*" && Self::split_host_port(&authority).is_none() {
            return Err(Error::InvalidAddress);
        }

        Ok(Self {
            protocol,
            authority,
            bootstrapable,
        })
    }

    /// Parse either a bare `host:port` authority or a `protocol://authority`
    /// URI into a `RemoteAddress`. A bare authority defaults to the `tcp`
    /// protocol, the only transport with a concrete dial/bind scheduling path
    /// in this implementation.
    ///
    /// # Test
    ///
    /// ```
    /// use brypt_codec::address::{RemoteAddress, Protocol};
    ///
    /// let a = RemoteAddress::parse("127.0.0.1:35216").unwrap();
    /// assert_eq!(a.protocol(), Protocol::Tcp);
    /// assert_eq!(a.authority(), "127.0.0.1:35216");
    ///
    /// let b = RemoteAddress::parse("tcp://*").unwrap();
    /// assert!(b.is_wildcard());
    /// ```
    pub fn parse(text: &str) -> Result<Self, Error> {
        if let Some((scheme, authority)) = text.split_once("://") {
            Self::new(Protocol::from_scheme(scheme), authority)
        } else {
            Self::new(Protocol::Tcp, text)
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_bootstrapable(&self) -> bool {
        self.bootstrapable
    }

    pub fn is_wildcard(&self) -> bool {
        self.authority == "*"
    }

    fn split_host_port(authority: &str) -> Option<(&str, &str)> {
        authority.rsplit_once(':')
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.as_scheme(), self.authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_protocol() {
        assert!(RemoteAddress::parse("carrier-pigeon://host").is_err());
    }

    #[test]
    fn rejects_malformed_tcp_authority() {
        assert!(RemoteAddress::new(Protocol::Tcp, "no-port-here").is_err());
    }

    #[test]
    fn wildcard_authority_is_accepted_for_tcp() {
        let addr = RemoteAddress::new(Protocol::Tcp, "*").unwrap();
        assert!(addr.is_wildcard());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let addr = RemoteAddress::parse("tcp://10.0.0.1:4000").unwrap();
        let text = addr.to_string();
        let reparsed = RemoteAddress::parse(&text).unwrap();
        assert_eq!(addr, reparsed);
    }
}
