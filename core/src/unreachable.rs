// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classifies a source IP seen in a target's logs but not itself reachable
//! from the scanner: reachability is cached for an hour, reverse DNS is
//! best-effort, and severity is assigned by a strict first-match-wins rule
//! order over `(username, fingerprint, ip range)`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::models::Severity;
use crate::ssh_pool::SshPool;

const REACHABILITY_TTL: Duration = Duration::from_secs(3600);

pub struct UnreachableSourceClassifier {
    pool: Arc<SshPool>,
    reachability_cache: Mutex<HashMap<(String, u16), (bool, Instant)>>,
}

impl UnreachableSourceClassifier {
    pub fn new(pool: Arc<SshPool>) -> Self {
        UnreachableSourceClassifier {
            pool,
            reachability_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Open-then-close via the pool, cached for `REACHABILITY_TTL`.
    pub async fn is_reachable(&self, ip: &str, port: u16) -> bool {
        {
            let cache = self.reachability_cache.lock().await;
            if let Some((reachable, at)) = cache.get(&(ip.to_string(), port)) {
                if at.elapsed() < REACHABILITY_TTL {
                    return *reachable;
                }
            }
        }

        let reachable = match self.pool.acquire(ip, port).await {
            Ok(guard) => {
                self.pool.release(guard).await;
                true
            }
            Err(_) => false,
        };

        let mut cache = self.reachability_cache.lock().await;
        cache.insert((ip.to_string(), port), (reachable, Instant::now()));
        reachable
    }

    /// Best-effort reverse DNS, dispatched to a blocking-thread pool since
    /// no async-DNS crate is part of this stack. `None` on any failure.
    pub async fn reverse_dns(&self, ip: &str) -> Option<String> {
        let ip = ip.to_string();
        tokio::task::spawn_blocking(move || reverse_dns_blocking(&ip))
            .await
            .ok()
            .flatten()
    }

    /// Classify severity for `(source_ip, username?, fingerprint?)` per
    /// the first-match-wins rule order:
    /// 1. `username == root` and a fingerprint was observed → critical.
    /// 2. a fingerprint was observed and the ip is public → high.
    /// 3. a fingerprint was observed and the ip is private → medium.
    /// 4. otherwise → low.
    pub fn classify_severity(
        source_ip: &str,
        username: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Severity {
        if username == Some("root") && fingerprint.is_some() {
            return Severity::Critical;
        }
        if fingerprint.is_some() {
            return if is_private_range(source_ip) {
                Severity::Medium
            } else {
                Severity::High
            };
        }
        Severity::Low
    }
}

/// Reverse DNS via the system resolver (`getnameinfo(3)`), since the
/// workspace carries no async-DNS crate. This is the blocking half of
/// `reverse_dns`, always run on a `spawn_blocking` thread.
fn reverse_dns_blocking(ip: &str) -> Option<String> {
    let addr: IpAddr = ip.parse().ok()?;
    match addr {
        IpAddr::V4(v4) => reverse_lookup_sockaddr(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(v4, 0))),
        IpAddr::V6(v6) => reverse_lookup_sockaddr(std::net::SocketAddr::V6(std::net::SocketAddrV6::new(v6, 0, 0, 0))),
    }
}

fn reverse_lookup_sockaddr(addr: std::net::SocketAddr) -> Option<String> {
    let mut host = [0u8; 256];

    let ret = match addr {
        std::net::SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::getnameinfo(
                    &sockaddr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr() as *mut libc::c_char,
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
        std::net::SocketAddr::V6(v6) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: 0,
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                libc::getnameinfo(
                    &sockaddr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr() as *mut libc::c_char,
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };

    if ret != 0 {
        return None;
    }

    let cstr = unsafe { std::ffi::CStr::from_ptr(host.as_ptr() as *const libc::c_char) };
    cstr.to_str().ok().map(str::to_string)
}

/// `10/8`, `172.16/12`, `192.168/16`, and `fc00::/7`.
fn is_private_range(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        Ok(IpAddr::V6(v6)) => (v6.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_unreachable_severity_scenarios() {
        assert_eq!(
            UnreachableSourceClassifier::classify_severity(
                "203.0.113.9",
                Some("root"),
                Some("SHA256:xyz")
            ),
            Severity::Critical
        );
        assert_eq!(
            UnreachableSourceClassifier::classify_severity(
                "203.0.113.9",
                Some("alice"),
                Some("SHA256:xyz")
            ),
            Severity::High
        );
        assert_eq!(
            UnreachableSourceClassifier::classify_severity("10.2.3.4", Some("alice"), Some("SHA256:xyz")),
            Severity::Medium
        );
        assert_eq!(
            UnreachableSourceClassifier::classify_severity("203.0.113.9", Some("alice"), None),
            Severity::Low
        );
    }

    #[test]
    fn private_ranges_detected() {
        assert!(is_private_range("10.0.0.1"));
        assert!(is_private_range("172.16.5.5"));
        assert!(is_private_range("172.31.255.255"));
        assert!(!is_private_range("172.32.0.1"));
        assert!(is_private_range("192.168.1.1"));
        assert!(!is_private_range("203.0.113.9"));
        assert!(is_private_range("fc00::1"));
        assert!(!is_private_range("2001:db8::1"));
    }
}
