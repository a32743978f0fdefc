//! External-reachability echo-check (spec §4.7): ask a well-known HTTP service whether an inbound
//! connection to our advertised port succeeded, and if so, what address it saw us connecting from.

use crate::endpoint::Endpoint;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EchoCheckError {
    #[error("echo-check request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("echo-check response was malformed")]
    MalformedResponse,
}

/// Parsed echo-check response body (spec §4.7 wire layout): `[success: u8][family tag:
/// u8][ip][port: u16 LE]`. `endpoint` is `None` when the family tag names neither IPv4 nor IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoResponse {
    pub success: bool,
    pub endpoint: Option<Endpoint>,
}

fn parse_response(bytes: &[u8]) -> Result<EchoResponse, EchoCheckError> {
    let success = *bytes.first().ok_or(EchoCheckError::MalformedResponse)? != 0;
    let tag = *bytes.get(1).ok_or(EchoCheckError::MalformedResponse)?;

    let endpoint = match tag {
        1 => {
            let ip_port = bytes.get(2..8).ok_or(EchoCheckError::MalformedResponse)?;
            let ip = Ipv4Addr::new(ip_port[0], ip_port[1], ip_port[2], ip_port[3]);
            let port = u16::from_le_bytes([ip_port[4], ip_port[5]]);
            Some(Endpoint::new(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        2 => {
            let rest = bytes.get(2..20).ok_or(EchoCheckError::MalformedResponse)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_le_bytes([rest[16], rest[17]]);
            Some(Endpoint::new(SocketAddr::new(IpAddr::V6(ip), port)))
        }
        _ => None,
    };

    Ok(EchoResponse { success, endpoint })
}

/// General internet-reachability probe (spec §4.6 "test general web accessibility"), distinct
/// from the port-specific echo check above: succeeds if the request completes at all, regardless
/// of what the response body says.
pub async fn check_web_access(
    client: &reqwest::Client,
    service_url: &str,
    timeout: std::time::Duration,
) -> bool {
    client
        .get(service_url)
        .timeout(timeout)
        .send()
        .await
        .is_ok()
}

/// Performs one echo-check round-trip against `service_url?port=<port>`.
pub async fn check(
    client: &reqwest::Client,
    service_url: &str,
    port: u16,
    timeout: std::time::Duration,
) -> Result<EchoResponse, EchoCheckError> {
    let bytes = client
        .get(service_url)
        .query(&[("port", port.to_string())])
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    parse_response(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_successful_ipv4_response() {
        let mut body = vec![1u8, 1];
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.extend_from_slice(&5000u16.to_le_bytes());
        let resp = parse_response(&body).unwrap();
        assert!(resp.success);
        assert_eq!(
            resp.endpoint,
            Some(Endpoint::new("1.2.3.4:5000".parse().unwrap()))
        );
    }

    #[test]
    fn parses_unreachable_response_with_no_address() {
        let body = vec![0u8, 0];
        let resp = parse_response(&body).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.endpoint, None);
    }

    #[test]
    fn rejects_truncated_response() {
        assert!(matches!(
            parse_response(&[1]),
            Err(EchoCheckError::MalformedResponse)
        ));
    }
}
