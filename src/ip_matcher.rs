use log::{debug, warn};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// IP 规则集合，支持单个地址和 CIDR 网段
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    exact: HashSet<IpAddr>,
    networks: Vec<Network>,
}

#[derive(Debug, Clone, Copy)]
enum Network {
    V4 { network: u32, mask: u32 },
    V6 { network: u128, mask: u128 },
}

impl Network {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Network::V4 { network, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (Network::V6 { network, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *network,
            _ => false,
        }
    }
}

impl IpMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for pattern in patterns {
            if !matcher.insert(pattern.as_ref()) {
                warn!("忽略无效的 IP 规则: {}", pattern.as_ref());
            }
        }
        matcher
    }

    /// 判断一条规则是否是 IP 或 CIDR 写法
    pub fn is_ip_pattern(pattern: &str) -> bool {
        let addr = pattern.trim().split('/').next().unwrap_or_default();
        addr.parse::<IpAddr>().is_ok()
    }

    /// 添加一条规则，无法解析时返回 false
    pub fn insert(&mut self, pattern: &str) -> bool {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return false;
        }

        let Some((addr, prefix)) = pattern.split_once('/') else {
            return match pattern.parse::<IpAddr>() {
                Ok(ip) => {
                    debug!("添加 IP 规则: {}", ip);
                    self.exact.insert(ip);
                    true
                }
                Err(_) => false,
            };
        };

        let Ok(prefix_len) = prefix.trim().parse::<u8>() else {
            return false;
        };

        let network = match addr.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if prefix_len <= 32 => {
                let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
                Network::V4 {
                    network: u32::from(ip) & mask,
                    mask,
                }
            }
            Ok(IpAddr::V6(ip)) if prefix_len <= 128 => {
                let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len) };
                Network::V6 {
                    network: u128::from(ip) & mask,
                    mask,
                }
            }
            _ => return false,
        };

        debug!("添加网段规则: {}", pattern);
        self.networks.push(network);
        true
    }

    #[inline]
    pub fn matches(&self, ip: IpAddr) -> bool {
        self.exact.contains(&ip) || self.networks.iter().any(|network| network.contains(ip))
    }

    /// 规则条数（单个地址与网段合计）
    pub fn len(&self) -> usize {
        self.exact.len() + self.networks.len()
    }
}

/// 私有、回环、链路本地等不应经过隧道的 IPv4 地址
pub fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 运营商级 NAT
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_match() {
        let matcher = IpMatcher::new(["192.168.1.1", "2001:db8::1"]);

        assert!(matcher.matches(ip("192.168.1.1")));
        assert!(matcher.matches(ip("2001:db8::1")));
        assert!(!matcher.matches(ip("192.168.1.2")));
        assert!(!matcher.matches(ip("2001:db8::2")));
    }

    #[test]
    fn test_cidr_match() {
        let matcher = IpMatcher::new(["10.0.0.0/8", "2001:db8::/32"]);

        assert!(matcher.matches(ip("10.0.0.1")));
        assert!(matcher.matches(ip("10.255.255.255")));
        assert!(!matcher.matches(ip("11.0.0.1")));
        assert!(matcher.matches(ip("2001:db8:ffff::1")));
        assert!(!matcher.matches(ip("2001:db9::1")));
    }

    #[test]
    fn test_cidr_all_and_single_host() {
        let all = IpMatcher::new(["0.0.0.0/0"]);
        assert!(all.matches(ip("8.8.8.8")));
        assert!(!all.matches(ip("::1"))); // 不跨地址族

        let single = IpMatcher::new(["192.168.1.1/32"]);
        assert!(single.matches(ip("192.168.1.1")));
        assert!(!single.matches(ip("192.168.1.2")));
    }

    #[test]
    fn test_invalid_patterns() {
        let matcher = IpMatcher::new([
            "invalid",
            "192.168.1.1.1",
            "192.168.1.0/33",
            "2001:db8::/129",
            "",
        ]);

        assert_eq!(matcher.len(), 0);
    }

    #[test]
    fn test_is_ip_pattern() {
        assert!(IpMatcher::is_ip_pattern("1.2.3.4"));
        assert!(IpMatcher::is_ip_pattern("10.0.0.0/8"));
        assert!(IpMatcher::is_ip_pattern("fe80::/10"));
        assert!(!IpMatcher::is_ip_pattern("example.com"));
        assert!(!IpMatcher::is_ip_pattern("*.example.com"));
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private_v4("10.1.2.3".parse().unwrap()));
        assert!(is_private_v4("172.16.0.1".parse().unwrap()));
        assert!(is_private_v4("192.168.0.1".parse().unwrap()));
        assert!(is_private_v4("127.0.0.1".parse().unwrap()));
        assert!(is_private_v4("100.64.0.1".parse().unwrap()));
        assert!(!is_private_v4("172.32.0.1".parse().unwrap()));
        assert!(!is_private_v4("8.8.8.8".parse().unwrap()));
    }
}
