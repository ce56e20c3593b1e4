//! CSI endpoint parsing.
//!
//! The driver listens on exactly one transport, selected by the scheme of
//! the `--endpoint` flag: `unix://<path>` or `tcp://<host:port>`.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// Transport scheme of a CSI endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Unix domain socket (the usual choice for a node-local CSI plugin)
    Unix,
    /// Plain TCP listener
    Tcp,
}

impl Scheme {
    const fn prefix(self) -> &'static str {
        match self {
            Scheme::Unix => "unix://",
            Scheme::Tcp => "tcp://",
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Unix => write!(f, "unix"),
            Scheme::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid endpoint '{0}': expected 'unix://<path>' or 'tcp://<host:port>'")]
    InvalidEndpoint(String),
}

pub type Result<T> = std::result::Result<T, EndpointError>;

/// A parsed endpoint: transport scheme plus the listen address after `://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub address: String,
}

impl Endpoint {
    /// Parse a scheme-qualified endpoint string.
    ///
    /// The scheme is matched case-insensitively; the address is kept verbatim.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || EndpointError::InvalidEndpoint(s.to_string());

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "unix" => Scheme::Unix,
            "tcp" => Scheme::Tcp,
            _ => return Err(invalid()),
        };

        if rest.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            address: rest.to_string(),
        })
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scheme.prefix(), self.address)
    }
}
