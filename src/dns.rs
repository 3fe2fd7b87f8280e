//! DNS resolution seam.
//!
//! Resolution is an external collaborator: the core only needs
//! `resolve(host) -> [ip...]`. The default resolver wraps the system
//! resolver via tokio, applies address-family preferences, and honors the
//! domain-fronting map (DNS resolves the connect host while SNI and the
//! Host header keep the request host).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Address-family constraints applied to every resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyPolicy {
    /// Sort IPv4 addresses first.
    pub prefer_ipv4: bool,
    /// Local address outgoing sockets bind to. Targets with no address in
    /// this family are rejected with a `Network` error.
    pub local_address: Option<IpAddr>,
}

impl FamilyPolicy {
    fn filter(&self, host: &str, addrs: Vec<IpAddr>) -> Result<Vec<IpAddr>> {
        let mut addrs = match self.local_address {
            Some(IpAddr::V4(_)) => addrs.into_iter().filter(|a| a.is_ipv4()).collect::<Vec<_>>(),
            Some(IpAddr::V6(_)) => addrs.into_iter().filter(|a| a.is_ipv6()).collect::<Vec<_>>(),
            None => addrs,
        };
        if self.prefer_ipv4 {
            addrs.sort_by_key(|a| !a.is_ipv4());
        }
        if addrs.is_empty() {
            let family = match self.local_address {
                Some(IpAddr::V4(_)) => "IPv4",
                Some(IpAddr::V6(_)) => "IPv6",
                None => "any",
            };
            return Err(Error::network(
                "dns_filter",
                format!("no {} address for target", family),
            )
            .with_endpoint(host, 0));
        }
        Ok(addrs)
    }
}

/// System resolver with a connect-to override map.
#[derive(Clone, Default)]
pub struct Resolver {
    policy: FamilyPolicy,
    /// request host -> connect host (domain fronting).
    connect_to: Arc<Mutex<HashMap<String, String>>>,
}

impl Resolver {
    pub fn new(policy: FamilyPolicy) -> Self {
        Self {
            policy,
            connect_to: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> FamilyPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FamilyPolicy) {
        self.policy = policy;
    }

    /// Map `request_host` to resolve (and connect) via `connect_host`.
    pub fn set_connect_to(&self, request_host: &str, connect_host: &str) {
        self.connect_to
            .lock()
            .expect("connect_to poisoned")
            .insert(request_host.to_string(), connect_host.to_string());
    }

    pub fn clear_connect_to(&self, request_host: &str) {
        self.connect_to
            .lock()
            .expect("connect_to poisoned")
            .remove(request_host);
    }

    /// The host DNS and TCP actually target for a request host.
    pub fn connect_host(&self, request_host: &str) -> String {
        self.connect_to
            .lock()
            .expect("connect_to poisoned")
            .get(request_host)
            .cloned()
            .unwrap_or_else(|| request_host.to_string())
    }

    /// Resolve the connect host for `request_host` to socket addresses.
    pub async fn resolve(&self, request_host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let target = self.connect_host(request_host);

        // IP literals skip the resolver entirely.
        if let Ok(ip) = target.parse::<IpAddr>() {
            let addrs = self.policy.filter(&target, vec![ip])?;
            return Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect());
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((target.as_str(), port))
            .await
            .map_err(|e| Error::dns(&target, e.to_string()).with_cause(e))?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(Error::dns(&target, "no addresses returned"));
        }
        let addrs = self.policy.filter(&target, addrs)?;
        Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

/// Connect a TCP socket to the first reachable address, binding to the
/// configured local address when one is set.
pub async fn connect_tcp(
    resolver: &Resolver,
    request_host: &str,
    port: u16,
) -> Result<tokio::net::TcpStream> {
    let addrs = resolver.resolve(request_host, port).await?;
    let policy = resolver.policy();

    let mut last_err = None;
    for addr in addrs {
        let attempt = match policy.local_address {
            Some(local) => connect_bound(addr, local).await,
            None => tokio::net::TcpStream::connect(addr)
                .await
                .map_err(|e| Error::io("tcp_connect", e)),
        };
        match attempt {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| Error::network("tcp_connect", "no addresses"))
        .with_endpoint(request_host, port))
}

async fn connect_bound(addr: SocketAddr, local: IpAddr) -> Result<tokio::net::TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::io("tcp_socket", e))?;
    socket
        .bind(&SocketAddr::new(local, 0).into())
        .map_err(|e| Error::io("tcp_bind", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::io("tcp_socket", e))?;

    // Non-blocking connect: in-progress is expected, readiness comes from tokio.
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(115) || e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::io("tcp_connect", e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = tokio::net::TcpStream::from_std(std_stream)
        .map_err(|e| Error::io("tcp_connect", e))?;
    stream.writable().await.map_err(|e| Error::io("tcp_connect", e))?;
    if let Some(e) = stream
        .take_error()
        .map_err(|e| Error::io("tcp_connect", e))?
    {
        return Err(Error::io("tcp_connect", e));
    }
    Ok(stream)
}

/// Bind a UDP socket for QUIC, honoring the local-address policy.
pub async fn bind_udp(policy: FamilyPolicy, peer: SocketAddr) -> Result<tokio::net::UdpSocket> {
    let local: SocketAddr = match policy.local_address {
        Some(ip) => SocketAddr::new(ip, 0),
        None if peer.is_ipv6() => "[::]:0".parse().expect("literal"),
        None => "0.0.0.0:0".parse().expect("literal"),
    };
    tokio::net::UdpSocket::bind(local)
        .await
        .map_err(|e| Error::io("udp_bind", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_filter_rejects_empty() {
        let policy = FamilyPolicy {
            prefer_ipv4: false,
            local_address: Some("::1".parse().unwrap()),
        };
        let v4only = vec!["127.0.0.1".parse().unwrap()];
        let err = policy.filter("example.com", v4only).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Network);
        assert!(err.to_string().contains("IPv6"));
    }

    #[test]
    fn test_prefer_ipv4_sorts() {
        let policy = FamilyPolicy {
            prefer_ipv4: true,
            local_address: None,
        };
        let addrs: Vec<IpAddr> = vec!["::1".parse().unwrap(), "127.0.0.1".parse().unwrap()];
        let sorted = policy.filter("example.com", addrs).unwrap();
        assert!(sorted[0].is_ipv4());
    }

    #[tokio::test]
    async fn test_connect_to_override() {
        let resolver = Resolver::default();
        resolver.set_connect_to("www.cloudflare.com", "127.0.0.1");
        assert_eq!(resolver.connect_host("www.cloudflare.com"), "127.0.0.1");
        assert_eq!(resolver.connect_host("other.com"), "other.com");

        let addrs = resolver.resolve("www.cloudflare.com", 8443).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8443".parse().unwrap());
    }
}
