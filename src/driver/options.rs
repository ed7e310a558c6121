//! Connection-URL parsing.
//!
//! Device connection URLs take the form `scheme://host:port?opt=val&opt=val`.
//! The query is URL-decoded once at protocol construction and mapped into
//! typed per-driver option structs.

use std::collections::HashMap;

use crate::core::error::{GatewayError, Result};
use crate::core::util;

/// Parsed connection URL.
#[derive(Debug, Clone)]
pub struct ConnectionUrl {
    pub scheme: String,
    /// Everything between `://` and `?` (usually `host:port`).
    pub connection_info: String,
    pub options: HashMap<String, String>,
}

impl ConnectionUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| GatewayError::config(format!("not found protocol: {url}")))?;
        let (info, query) = match rest.split_once('?') {
            Some((info, query)) => (info, Some(query)),
            None => (rest, None),
        };
        let mut options = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    GatewayError::config(format!("option parsing error, option: {query}"))
                })?;
                options.insert(percent_decode(key), percent_decode(value));
            }
        }
        Ok(Self {
            scheme: scheme.to_string(),
            connection_info: info.to_string(),
            options,
        })
    }

    /// `host:port` of the connection info; host may be empty (servers).
    pub fn host_port(&self) -> Result<(String, u16)> {
        util::split_host_port(&self.connection_info).ok_or_else(|| {
            GatewayError::config(format!(
                "invalid host:port notation: {}",
                self.connection_info
            ))
        })
    }

    pub fn bool_option(&self, key: &str) -> Option<bool> {
        self.options.get(key).map(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn int_option(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(|v| v.parse().ok())
    }

    pub fn str_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }
}

/// Minimal percent decoding (`%NN` and `+` as space).
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hi = (bytes[i + 1] as char).to_digit(16).unwrap() as u8;
                let lo = (bytes[i + 2] as char).to_digit(16).unwrap() as u8;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Framing options shared by the TCP/UDP drivers.
#[derive(Debug, Clone, Default)]
pub struct FramingOptions {
    pub start_bytes: Option<Vec<u8>>,
    pub end_bytes: Option<Vec<u8>>,
    pub retain_start_end_bytes: bool,
    pub combine_buffered_data: bool,
    /// Milliseconds the time-buffer waits before flushing; 0 disables.
    pub buffer_time: u64,
}

impl FramingOptions {
    /// Base options common to TCP and UDP; `buffer_time` is filled by the
    /// scheme-specific constructors below.
    fn base(url: &ConnectionUrl) -> Self {
        Self {
            start_bytes: url.str_option("startBytes").and_then(util::unescape_bytes),
            end_bytes: url.str_option("endBytes").and_then(util::unescape_bytes),
            retain_start_end_bytes: url.bool_option("retainStartEndBytes").unwrap_or(false),
            combine_buffered_data: url.bool_option("combineBufferedData").unwrap_or(true),
            buffer_time: 0,
        }
    }

    /// TCP defaults the time buffer to 100 ms when no other boundary rule
    /// applies.
    pub fn tcp(url: &ConnectionUrl, has_buffering_fn: bool) -> Self {
        let mut opts = Self::base(url);
        opts.buffer_time = match url.int_option("bufferTime") {
            Some(t) => t.max(0) as u64,
            None => {
                if opts.end_bytes.is_none() && !has_buffering_fn {
                    100
                } else {
                    0
                }
            }
        };
        opts
    }

    /// UDP datagrams are naturally framed; the time buffer defaults off.
    pub fn udp(url: &ConnectionUrl) -> Self {
        let mut opts = Self::base(url);
        opts.buffer_time = url.int_option("bufferTime").map(|t| t.max(0) as u64).unwrap_or(0);
        opts
    }
}

/// TLS and body options of the HTTP drivers. Certificate material arrives
/// base64-encoded in the URL query (PEM only).
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub use_byte_array_body: bool,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub trust_cert: Option<Vec<u8>>,
}

impl HttpOptions {
    pub fn from_url(url: &ConnectionUrl) -> Result<Self> {
        use base64::Engine;
        let decode = |key: &str| -> Result<Option<Vec<u8>>> {
            url.str_option(key)
                .map(|v| {
                    base64::engine::general_purpose::STANDARD
                        .decode(v)
                        .map_err(|e| GatewayError::config(format!("invalid {key} option: {e}")))
                })
                .transpose()
        };
        Ok(Self {
            use_byte_array_body: url.bool_option("useByteArrayBody").unwrap_or(false),
            cert: decode("cert")?,
            key: decode("key")?,
            trust_cert: decode("trustCert")?,
        })
    }
}

/// Modbus client/server options.
#[derive(Debug, Clone)]
pub struct ModbusOptions {
    pub unit_id: u8,
    pub combine_data: bool,
}

impl ModbusOptions {
    pub fn from_url(url: &ConnectionUrl) -> Self {
        Self {
            unit_id: url.int_option("unitId").map(|v| v as u8).unwrap_or(1),
            combine_data: url.bool_option("combineData").unwrap_or(true),
        }
    }
}

/// UDP server options.
#[derive(Debug, Clone, Default)]
pub struct UdpOptions {
    /// IPv4 multicast groups to join, comma-separated in the URL.
    pub multicast_groups: Vec<std::net::Ipv4Addr>,
}

impl UdpOptions {
    pub fn from_url(url: &ConnectionUrl) -> Result<Self> {
        let mut groups = Vec::new();
        if let Some(raw) = url.str_option("multicastGroup") {
            for addr in raw.split(',').filter(|s| !s.is_empty()) {
                groups.push(addr.parse().map_err(|_| {
                    GatewayError::config(format!("invalid multicast address: {addr}"))
                })?);
            }
        }
        Ok(Self {
            multicast_groups: groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let url = ConnectionUrl::parse(
            "tcp-client://127.0.0.1:9999?endBytes=%5Cr%5Cn&retainStartEndBytes=false",
        )
        .unwrap();
        assert_eq!(url.scheme, "tcp-client");
        assert_eq!(url.connection_info, "127.0.0.1:9999");
        assert_eq!(url.str_option("endBytes"), Some("\\r\\n"));
        assert_eq!(url.bool_option("retainStartEndBytes"), Some(false));
        assert_eq!(url.host_port().unwrap(), ("127.0.0.1".into(), 9999));
    }

    #[test]
    fn test_parse_url_without_scheme() {
        assert!(ConnectionUrl::parse("localhost:1234").is_err());
    }

    #[test]
    fn test_bad_option_pair() {
        assert!(ConnectionUrl::parse("udp-client://h:1?novalue").is_err());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("%5Cr"), "\\r");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }

    #[test]
    fn test_tcp_framing_defaults() {
        let url = ConnectionUrl::parse("tcp-client://h:1").unwrap();
        let opts = FramingOptions::tcp(&url, false);
        assert_eq!(opts.buffer_time, 100);
        assert!(opts.combine_buffered_data);

        let url = ConnectionUrl::parse("tcp-client://h:1?endBytes=%5Cn").unwrap();
        let opts = FramingOptions::tcp(&url, false);
        assert_eq!(opts.buffer_time, 0);
        assert_eq!(opts.end_bytes.as_deref(), Some(b"\n".as_ref()));
    }

    #[test]
    fn test_udp_framing_defaults() {
        let url = ConnectionUrl::parse("udp-server://:5000").unwrap();
        assert_eq!(FramingOptions::udp(&url).buffer_time, 0);
    }

    #[test]
    fn test_modbus_options() {
        let url = ConnectionUrl::parse("modbus-client://h:502?unitId=3&combineData=false").unwrap();
        let opts = ModbusOptions::from_url(&url);
        assert_eq!(opts.unit_id, 3);
        assert!(!opts.combine_data);
    }

    #[test]
    fn test_udp_multicast_groups() {
        let url =
            ConnectionUrl::parse("udp-server://:5000?multicastGroup=239.0.0.1,239.0.0.2").unwrap();
        let opts = UdpOptions::from_url(&url).unwrap();
        assert_eq!(opts.multicast_groups.len(), 2);

        let url = ConnectionUrl::parse("udp-server://:5000?multicastGroup=nonsense").unwrap();
        assert!(UdpOptions::from_url(&url).is_err());
    }
}
