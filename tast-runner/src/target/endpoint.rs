// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::EndpointParseError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// An addressable device under test: `[user@]host[:port]`.
///
/// Immutable after parsing; lives for the whole run.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetEndpoint {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl TargetEndpoint {
    /// The user to log in as, if one was given.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The SSH port, if one was given.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns `user@host` (or just `host`), the form ssh takes as its
    /// destination argument.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl FromStr for TargetEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(EndpointParseError::new(input, "empty endpoint"));
        }

        let (user, rest) = match input.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() {
                    return Err(EndpointParseError::new(input, "empty user"));
                }
                if rest.contains('@') {
                    return Err(EndpointParseError::new(input, "multiple `@` separators"));
                }
                (Some(user.to_owned()), rest)
            }
            None => (None, input),
        };

        // IPv6 literals are bracketed: [::1]:22.
        let (host, port_str) = if let Some(rest) = rest.strip_prefix('[') {
            let Some((host, after)) = rest.split_once(']') else {
                return Err(EndpointParseError::new(input, "unterminated `[`"));
            };
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => {
                    return Err(EndpointParseError::new(input, "garbage after `]`"));
                }
            }
        } else {
            match rest.rsplit_once(':') {
                // A bare colon-containing host without brackets is an
                // unbracketed IPv6 address; reject it as ambiguous.
                Some((host, _)) if host.contains(':') => {
                    return Err(EndpointParseError::new(
                        input,
                        "IPv6 addresses must be bracketed",
                    ));
                }
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointParseError::new(input, "empty host"));
        }

        let port = match port_str {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| EndpointParseError::new(input, "invalid port"))?,
            ),
            None => None,
        };

        Ok(Self {
            user,
            host: host.to_owned(),
            port,
        })
    }
}

impl TryFrom<String> for TargetEndpoint {
    type Error = EndpointParseError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<TargetEndpoint> for String {
    fn from(endpoint: TargetEndpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
