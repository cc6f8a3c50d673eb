//! Cluster coordinator endpoint parsing and normalization.
//!
//! Tables reference a cluster through a free-form address string. Different
//! spellings of the same cluster must share one cached connection, so every
//! string is reduced to a canonical [`Endpoint`] before it is used as a key.

use std::fmt;

use crate::error::{ConnectorError, Result};

/// Scheme assumed when the address does not name one.
const DEFAULT_SCHEME: &str = "http";
/// Port assumed for hosts that do not name one.
pub const DEFAULT_PORT: u16 = 8983;
/// Context path assumed when the address has none.
const DEFAULT_PATH: &str = "/solr";

/// Canonical identifier of a cluster coordinator address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    scheme: String,
    hosts: Vec<(String, u16)>,
    path: String,
}

impl Endpoint {
    /// Parses `[scheme://]host[:port][,host[:port]...][/path]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectorError::Connection(
                "cluster endpoint is empty".to_string(),
            ));
        }

        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme.trim().to_ascii_lowercase(), rest),
            None => (DEFAULT_SCHEME.to_string(), raw),
        };
        if scheme != "http" && scheme != "https" {
            return Err(malformed(raw, "scheme must be http or https"));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let mut hosts = Vec::new();
        for part in authority.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(malformed(raw, "empty host in host list"));
            }
            hosts.push(parse_host(raw, part)?);
        }
        hosts.sort();
        hosts.dedup();

        Ok(Self {
            scheme,
            hosts,
            path: normalize_path(path),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host/port pairs in canonical (sorted) order.
    pub fn hosts(&self) -> &[(String, u16)] {
        &self.hosts
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Base URL of the first coordinator host.
    pub fn primary_base_url(&self) -> String {
        let (host, port) = &self.hosts[0];
        format!("{}://{}:{}{}", self.scheme, host, port, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self
            .hosts
            .iter()
            .map(|(host, port)| format!("{host}:{port}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}://{}{}", self.scheme, hosts, self.path)
    }
}

fn parse_host(raw: &str, part: &str) -> Result<(String, u16)> {
    let (host, port) = match part.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| malformed(raw, &format!("invalid port in '{part}'")))?;
            (host, port)
        }
        None => (part, DEFAULT_PORT),
    };
    if port == 0 {
        return Err(malformed(raw, &format!("port 0 in '{part}'")));
    }
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(malformed(raw, &format!("invalid host in '{part}'")));
    }
    Ok((host, port))
}

fn normalize_path(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    if segments.is_empty() {
        return DEFAULT_PATH.to_string();
    }
    format!("/{}", segments.join("/"))
}

fn malformed(raw: &str, reason: &str) -> ConnectorError {
    ConnectorError::Connection(format!("malformed cluster endpoint '{raw}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::Endpoint;
    use crate::error::ConnectorError;

    #[test]
    fn equivalent_spellings_share_one_key() {
        let a = Endpoint::parse("Node2:8983,node1:8983/solr/").unwrap();
        let b = Endpoint::parse("http://node1,NODE2:8983//solr").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "http://node1:8983,node2:8983/solr");
    }

    #[test]
    fn duplicate_hosts_collapse() {
        let endpoint = Endpoint::parse("a:1,a:1,b:2").unwrap();
        assert_eq!(endpoint.hosts().len(), 2);
    }

    #[test]
    fn default_path_and_port_are_applied() {
        let endpoint = Endpoint::parse("localhost").unwrap();
        assert_eq!(endpoint.primary_base_url(), "http://localhost:8983/solr");
    }

    #[test]
    fn https_scheme_is_kept_distinct() {
        let plain = Endpoint::parse("http://search:8983").unwrap();
        let tls = Endpoint::parse("https://search:8983").unwrap();
        assert_ne!(plain, tls);
    }

    #[test]
    fn empty_and_malformed_addresses_are_connection_errors() {
        for raw in ["", "   ", "ftp://x", "a:notaport", "a,,b", "bad host:1", "x:0"] {
            match Endpoint::parse(raw) {
                Err(ConnectorError::Connection(_)) => {}
                other => panic!("expected connection error for {raw:?}, got {other:?}"),
            }
        }
    }
}
