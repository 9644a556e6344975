//! Request target parsing and `.onion` address validation.
//!
//! Validation is purely local: an invalid target is rejected before any
//! SOCKS connection is opened.
//!
//! A v3 onion service id is 56 base32 characters encoding
//! `PUBKEY (32) || CHECKSUM (2) || VERSION (1)`, where
//! `CHECKSUM = SHA3-256(".onion checksum" || PUBKEY || VERSION)[..2]`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use data_encoding::BASE32_NOPAD;
use sha3::{Digest, Sha3_256};
use url::{Host, Url};

use super::ProxyError;

const ONION_SUFFIX: &str = ".onion";
const V3_ID_LEN: usize = 56;
const V2_ID_LEN: usize = 16;
const V3_VERSION: u8 = 0x03;

fn invalid(msg: impl Into<String>) -> ProxyError {
    ProxyError::InvalidTarget(msg.into())
}

fn onion_checksum(public_key: &[u8], version: u8) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

/// A validated v3 onion hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAddress {
    hostname: String,
    service_id: String,
    public_key: [u8; 32],
}

impl OnionAddress {
    /// Validate a `.onion` hostname, allowing subdomains
    /// (`www.<id>.onion`).
    pub fn parse(hostname: &str) -> Result<Self, ProxyError> {
        let hostname = hostname.to_ascii_lowercase();
        let stem = hostname
            .strip_suffix(ONION_SUFFIX)
            .ok_or_else(|| invalid(format!("{hostname} is not an onion address")))?;
        let service_id = stem.rsplit('.').next().unwrap_or(stem);

        match service_id.len() {
            V3_ID_LEN => {}
            V2_ID_LEN => {
                return Err(invalid(format!(
                    "{hostname}: v2 onion addresses are no longer supported"
                )));
            }
            n => {
                return Err(invalid(format!(
                    "{hostname}: onion service id must be {V3_ID_LEN} characters, got {n}"
                )));
            }
        }

        let decoded = BASE32_NOPAD
            .decode(service_id.to_ascii_uppercase().as_bytes())
            .map_err(|e| invalid(format!("{hostname}: not base32 ({e})")))?;
        let [key @ .., c0, c1, version]: [u8; 35] = decoded
            .try_into()
            .map_err(|_| invalid(format!("{hostname}: bad decoded length")))?;
        let public_key: [u8; 32] = key;

        if version != V3_VERSION {
            return Err(invalid(format!(
                "{hostname}: unsupported onion version {version}"
            )));
        }
        if onion_checksum(&public_key, version) != [c0, c1] {
            return Err(invalid(format!("{hostname}: onion checksum mismatch")));
        }

        Ok(Self {
            service_id: service_id.to_string(),
            hostname,
            public_key,
        })
    }

    /// Encode the v3 address for an ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut raw = Vec::with_capacity(35);
        raw.extend_from_slice(public_key);
        raw.extend_from_slice(&onion_checksum(public_key, V3_VERSION));
        raw.push(V3_VERSION);
        let service_id = BASE32_NOPAD.encode(&raw).to_ascii_lowercase();
        Self {
            hostname: format!("{service_id}{ONION_SUFFIX}"),
            service_id,
            public_key: *public_key,
        }
    }

    /// Full lowercase hostname, including any subdomain.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The 56-character service id.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hostname)
    }
}

/// Host part of a request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Onion(OnionAddress),
    Domain(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl TargetHost {
    /// Hostname as sent in the SOCKS request.
    pub fn hostname(&self) -> String {
        match self {
            TargetHost::Onion(onion) => onion.hostname().to_string(),
            TargetHost::Domain(name) => name.clone(),
            TargetHost::Ipv4(addr) => addr.to_string(),
            TargetHost::Ipv6(addr) => addr.to_string(),
        }
    }

    pub fn is_onion(&self) -> bool {
        matches!(self, TargetHost::Onion(_))
    }
}

/// A validated `http`/`https` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    url: Url,
    host: TargetHost,
    port: u16,
}

impl TargetUrl {
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(input).map_err(|e| invalid(format!("{input}: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme {other:?}"))),
        }

        let host = match url.host() {
            Some(Host::Domain(name)) if name.to_ascii_lowercase().ends_with(ONION_SUFFIX) => {
                TargetHost::Onion(OnionAddress::parse(name)?)
            }
            Some(Host::Domain(name)) => TargetHost::Domain(name.to_string()),
            Some(Host::Ipv4(addr)) => TargetHost::Ipv4(addr),
            Some(Host::Ipv6(addr)) => TargetHost::Ipv6(addr),
            None => return Err(invalid(format!("{input}: missing host"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid(format!("{input}: missing port")))?;

        Ok(Self { url, host, port })
    }

    pub fn host(&self) -> &TargetHost {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Origin-form request target (`/path?query`).
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }

    /// Value for the `Host` header.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // The Tor Project's website onion service
    const TORPROJECT: &str = "2gzyxa5ihm7nsggfxnu52rck2vv4rvmdlkiu3zzui5du4xyclen53wid.onion";

    #[test]
    fn test_valid_v3_address() {
        let onion = OnionAddress::parse(TORPROJECT).unwrap();
        assert_eq!(onion.hostname(), TORPROJECT);
        assert_eq!(onion.service_id().len(), 56);
    }

    #[test]
    fn test_uppercase_and_subdomain() {
        let host = format!("www.{}", TORPROJECT.to_ascii_uppercase());
        let onion = OnionAddress::parse(&host).unwrap();
        assert_eq!(onion.hostname(), format!("www.{TORPROJECT}"));
        assert_eq!(onion.service_id(), &TORPROJECT[..56]);
    }

    #[test]
    fn test_checksum_mismatch() {
        // Flip one character of the public key portion
        let mut bad = TORPROJECT.to_string();
        bad.replace_range(0..1, "3");
        assert!(matches!(
            OnionAddress::parse(&bad),
            Err(ProxyError::InvalidTarget(msg)) if msg.contains("checksum")
        ));
    }

    #[test]
    fn test_rejects_v2() {
        let err = OnionAddress::parse("expyuzz4wqqyqhjn.onion").unwrap_err();
        assert!(err.to_string().contains("v2"));
    }

    #[test]
    fn test_rejects_bad_length_and_alphabet() {
        assert!(OnionAddress::parse("invalid.onion").is_err());
        // 56 chars but '1' and '8' are not base32
        let bad = format!("{}.onion", "18".repeat(28));
        assert!(OnionAddress::parse(&bad).is_err());
    }

    #[test]
    fn test_from_public_key_round_trips() {
        let onion = OnionAddress::from_public_key(&[7u8; 32]);
        let parsed = OnionAddress::parse(onion.hostname()).unwrap();
        assert_eq!(parsed.public_key(), &[7u8; 32]);
    }

    #[test]
    fn test_target_url_onion() {
        let url = format!("http://{TORPROJECT}/index.html?lang=en");
        let target = TargetUrl::parse(&url).unwrap();
        assert!(target.host().is_onion());
        assert_eq!(target.port(), 80);
        assert!(!target.is_https());
        assert_eq!(target.path_and_query(), "/index.html?lang=en");
        assert_eq!(target.host_header(), TORPROJECT);
    }

    #[test]
    fn test_target_url_clearnet_with_port() {
        let target = TargetUrl::parse("https://example.com:8443/api").unwrap();
        assert_eq!(target.host(), &TargetHost::Domain("example.com".into()));
        assert_eq!(target.port(), 8443);
        assert!(target.is_https());
        assert_eq!(target.host_header(), "example.com:8443");
    }

    #[test]
    fn test_target_url_ip_literals() {
        let v4 = TargetUrl::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(v4.host(), &TargetHost::Ipv4(Ipv4Addr::LOCALHOST));
        let v6 = TargetUrl::parse("http://[::1]/").unwrap();
        assert_eq!(v6.host(), &TargetHost::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(v6.host_header(), "[::1]");
    }

    #[test]
    fn test_target_url_rejections() {
        for input in [
            "not a url",
            "ftp://example.com/",
            "file:///etc/passwd",
            "http://invalid.onion/",
            "http://expyuzz4wqqyqhjn.onion/",
        ] {
            assert!(
                matches!(TargetUrl::parse(input), Err(ProxyError::InvalidTarget(_))),
                "accepted {input}"
            );
        }
    }
}
