//! Broker address list parsing and selection.
//!
//! An address list string is a comma/whitespace separated sequence of
//! `scheme://host:port[/service][;key=value...]` tokens (HTTP tunnel
//! addresses keep their full URL as an opaque remainder). The list is
//! parsed eagerly and rejected whole on the first malformed token, then
//! ordered once by the configured selection behavior. After that the
//! order never changes, so a failover sweep over the list is
//! deterministic and exhaustible.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

use crate::core::error::WireError;

/// Transport handler kind a scheme resolves to. The actual transport
/// implementations are registered at startup in `link::TransportRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Tcp,
    Ssl,
    Http,
    Https,
    Direct,
    WebSocket,
}

/// Static scheme resolution table. Unknown schemes are malformed.
static SCHEME_HANDLERS: Lazy<HashMap<&'static str, HandlerKind>> = Lazy::new(|| {
    HashMap::from([
        ("mqtcp", HandlerKind::Tcp),
        ("mqssl", HandlerKind::Ssl),
        ("http", HandlerKind::Http),
        ("https", HandlerKind::Https),
        ("mqdirect", HandlerKind::Direct),
        ("mqws", HandlerKind::WebSocket),
    ])
});

const DEFAULT_SERVICE: &str = "jms";

/// One parsed broker address. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: String,
    pub handler: HandlerKind,
    pub host: String,
    pub port: u16,
    pub service: String,
    pub properties: HashMap<String, String>,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/{}", self.scheme, self.host, self.port, self.service)
    }
}

impl BrokerAddress {
    fn malformed(token: &str, reason: impl Into<String>) -> WireError {
        WireError::MalformedAddress {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    /// Parse a single `scheme://host:port[/service][;k=v...]` token.
    pub fn parse(token: &str) -> Result<Self, WireError> {
        let (body, props) = match token.split_once(';') {
            Some((b, p)) => (b, Some(p)),
            None => (token, None),
        };

        let (scheme, rest) = body
            .split_once("://")
            .ok_or_else(|| Self::malformed(token, "missing '://'"))?;

        let handler = *SCHEME_HANDLERS
            .get(scheme)
            .ok_or_else(|| Self::malformed(token, format!("unknown scheme '{scheme}'")))?;

        // HTTP(S) tunnel addresses are full URLs; keep the remainder opaque
        // as the "host" with the scheme's default port.
        if matches!(handler, HandlerKind::Http | HandlerKind::Https) {
            if rest.is_empty() {
                return Err(Self::malformed(token, "empty URL"));
            }
            let port = if handler == HandlerKind::Http { 80 } else { 443 };
            return Ok(Self {
                scheme: scheme.to_string(),
                handler,
                host: rest.to_string(),
                port,
                service: DEFAULT_SERVICE.to_string(),
                properties: parse_properties(token, props)?,
            });
        }

        let (hostport, service) = match rest.split_once('/') {
            Some((hp, svc)) if !svc.is_empty() => (hp, svc.to_string()),
            Some((hp, _)) => (hp, DEFAULT_SERVICE.to_string()),
            None => (rest, DEFAULT_SERVICE.to_string()),
        };

        let (host, port_str) = hostport
            .rsplit_once(':')
            .ok_or_else(|| Self::malformed(token, "missing ':port'"))?;

        if host.is_empty() {
            return Err(Self::malformed(token, "empty host"));
        }

        let port: u16 = port_str
            .parse()
            .map_err(|_| Self::malformed(token, format!("bad port '{port_str}'")))?;

        Ok(Self {
            scheme: scheme.to_string(),
            handler,
            host: host.to_string(),
            port,
            service,
            properties: parse_properties(token, props)?,
        })
    }
}

fn parse_properties(
    token: &str,
    props: Option<&str>,
) -> Result<HashMap<String, String>, WireError> {
    let mut out = HashMap::new();
    if let Some(props) = props {
        for pair in props.split(';').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                BrokerAddress::malformed(token, format!("bad property '{pair}'"))
            })?;
            out.insert(k.to_string(), v.to_string());
        }
    }
    Ok(out)
}

/// Address selection behavior applied once to a parsed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Keep parse order.
    #[default]
    Priority,
    /// Shuffle uniformly, once, when the policy is applied.
    Random,
}

impl FromStr for SelectionPolicy {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("PRIORITY") {
            Ok(SelectionPolicy::Priority)
        } else if s.eq_ignore_ascii_case("RANDOM") {
            Ok(SelectionPolicy::Random)
        } else {
            Err(WireError::BadListBehavior(s.to_string()))
        }
    }
}

/// Ordered broker address list. Once a policy has been applied the order
/// is fixed for the lifetime of the list and may be iterated concurrently.
#[derive(Debug, Clone)]
pub struct AddressList {
    addrs: Vec<BrokerAddress>,
    policy: SelectionPolicy,
}

impl AddressList {
    /// Parse a full address-list string. Any malformed token rejects the
    /// whole list; there is no partial success.
    pub fn parse(list: &str) -> Result<Self, WireError> {
        let mut addrs = Vec::new();
        let separators = |c: char| c == ',' || c.is_whitespace();
        for token in list.split(separators).filter(|t| !t.is_empty()) {
            addrs.push(BrokerAddress::parse(token)?);
        }
        Ok(Self {
            addrs,
            policy: SelectionPolicy::Priority,
        })
    }

    /// Apply a selection behavior. `Random` performs its single uniform
    /// shuffle here, not on later iterations or failover retries.
    pub fn select(&mut self, policy: SelectionPolicy) {
        self.policy = policy;
        if policy == SelectionPolicy::Random {
            self.addrs.shuffle(&mut rand::thread_rng());
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&BrokerAddress> {
        self.addrs.get(idx)
    }

    /// Ordered view for connection attempts.
    pub fn iter(&self) -> std::slice::Iter<'_, BrokerAddress> {
        self.addrs.iter()
    }

    /// Service name of the first address; connections validate that every
    /// address in a list serves the same service.
    pub fn default_service(&self) -> Option<&str> {
        self.addrs.first().map(|a| a.service.as_str())
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a BrokerAddress;
    type IntoIter = std::slice::Iter<'a, BrokerAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
