//! Address arithmetic and automatic subnet allocation.

use crate::{NovaError, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Attempts made by the random allocators before giving up.
pub const SUBNET_ALLOCATION_ATTEMPTS: usize = 100;

/// Parse a bare IP into a single-host network (/32 or /128).
pub fn parse_ip_to_net(value: &str) -> Result<IpNet> {
    let ip = IpAddr::from_str(value.trim())
        .map_err(|_| NovaError::Validation(format!("Not an IP address {:?}", value)))?;
    Ok(IpNet::from(ip))
}

/// Parse `addr/prefix`, keeping the host part.
pub fn parse_cidr(value: &str) -> Result<IpNet> {
    IpNet::from_str(value.trim())
        .map_err(|_| NovaError::Validation(format!("Invalid CIDR address {:?}", value)))
}

/// True when `outer` fully contains `inner` and both are the same family.
pub fn subnet_contains(outer: &IpNet, inner: &IpNet) -> bool {
    match (outer, inner) {
        (IpNet::V4(o), IpNet::V4(i)) => {
            o.prefix_len() <= i.prefix_len() && o.trunc().contains(&i.network())
        }
        (IpNet::V6(o), IpNet::V6(i)) => {
            o.prefix_len() <= i.prefix_len() && o.trunc().contains(&i.network())
        }
        _ => false,
    }
}

/// Two CIDR networks intersect when one contains the other.
pub fn subnets_overlap(a: &IpNet, b: &IpNet) -> bool {
    subnet_contains(a, b) || subnet_contains(b, a)
}

/// Inclusive address range, used for DHCP and OVN ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl IpRange {
    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.start.is_ipv4() == ip.is_ipv4() && &self.start <= ip && ip <= &self.end
    }
}

pub fn ip_ranges_overlap(a: &IpRange, b: &IpRange) -> bool {
    if a.start.is_ipv4() != b.start.is_ipv4() {
        return false;
    }
    std::cmp::max(a.start, b.start) <= std::cmp::min(a.end, b.end)
}

/// Parse a comma separated list of `start-end` ranges. When `allowed` is not
/// empty every range must sit inside one of the allowed networks.
pub fn parse_ip_ranges(value: &str, allowed: &[IpNet]) -> Result<Vec<IpRange>> {
    let mut ranges = Vec::new();
    for entry in crate::validate::split_trim(value, ',') {
        let (start, end) = entry.split_once('-').ok_or_else(|| {
            NovaError::Validation(format!("Invalid IP range {:?}", entry))
        })?;
        let start = IpAddr::from_str(start.trim())
            .map_err(|_| NovaError::Validation(format!("Start not an IP address {:?}", start)))?;
        let end = IpAddr::from_str(end.trim())
            .map_err(|_| NovaError::Validation(format!("End not an IP address {:?}", end)))?;
        if start.is_ipv4() != end.is_ipv4() || start > end {
            return Err(NovaError::Validation(format!(
                "Invalid IP range {:?}",
                entry
            )));
        }

        let range = IpRange { start, end };
        if !allowed.is_empty()
            && !allowed
                .iter()
                .any(|net| net.contains(&range.start) && net.contains(&range.end))
        {
            return Err(NovaError::Validation(format!(
                "IP range {:?} does not fall within any of the allowed networks {:?}",
                entry,
                allowed.iter().map(|n| n.to_string()).collect::<Vec<_>>()
            )));
        }
        ranges.push(range);
    }
    Ok(ranges)
}

/// Address at offset `host` inside `subnet`. Negative offsets count back from
/// the end of the subnet, so -1 is the broadcast address.
pub fn get_ip(subnet: &IpNet, host: i64) -> IpAddr {
    match subnet {
        IpNet::V4(net) => {
            let base = u32::from(net.network()) as i128;
            let size = 1i128 << (32 - net.prefix_len() as u32);
            let offset = if host < 0 { size + host as i128 } else { host as i128 };
            let value = (base + offset).clamp(0, u32::MAX as i128) as u32;
            IpAddr::V4(Ipv4Addr::from(value))
        }
        IpNet::V6(net) => {
            let base = u128::from(net.network());
            let bits = 128 - net.prefix_len() as u32;
            let value = if host < 0 {
                let last = if bits == 128 {
                    u128::MAX
                } else {
                    base | ((1u128 << bits) - 1)
                };
                last.wrapping_sub(host.unsigned_abs() as u128 - 1)
            } else {
                base.wrapping_add(host as u128)
            };
            IpAddr::V6(Ipv6Addr::from(value))
        }
    }
}

/// Number of addresses in `subnet`, saturating at u64::MAX.
pub fn subnet_size(subnet: &IpNet) -> u64 {
    let bits = subnet.max_prefix_len() - subnet.prefix_len();
    if bits >= 64 {
        u64::MAX
    } else {
        1u64 << bits
    }
}

/// Modified EUI-64 address for `mac` inside a /64 `prefix`.
pub fn derive_eui64(prefix: &Ipv6Net, mac: &[u8; 6]) -> Result<Ipv6Addr> {
    if prefix.prefix_len() != 64 {
        return Err(NovaError::Validation(
            "Can't generate an EUI64 derived IPv6 address with a mask other than /64".to_string(),
        ));
    }

    let mut octets = prefix.network().octets();
    octets[8] = mac[0] ^ 0x02;
    octets[9] = mac[1];
    octets[10] = mac[2];
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13] = mac[3];
    octets[14] = mac[4];
    octets[15] = mac[5];
    Ok(Ipv6Addr::from(octets))
}

/// Pick a random `10.x.y.1/24` that does not overlap anything in `in_use`.
pub fn random_subnet_v4<R: Rng>(rng: &mut R, in_use: &[IpNet]) -> Result<Ipv4Net> {
    for _ in 0..SUBNET_ALLOCATION_ATTEMPTS {
        let candidate = Ipv4Net::new(
            Ipv4Addr::new(10, rng.gen_range(0..=255), rng.gen_range(0..=255), 1),
            24,
        )
        .map_err(|e| NovaError::Os(e.to_string()))?;

        let net = IpNet::V4(candidate);
        if in_use.iter().any(|used| subnets_overlap(used, &net)) {
            continue;
        }
        return Ok(candidate);
    }

    Err(NovaError::Conflict(
        "Failed to automatically find an unused IPv4 subnet, manual configuration required"
            .to_string(),
    ))
}

/// Pick a random ULA `fd42:xxxx:xxxx:xxxx::1/64` that does not overlap anything in `in_use`.
pub fn random_subnet_v6<R: Rng>(rng: &mut R, in_use: &[IpNet]) -> Result<Ipv6Net> {
    for _ in 0..SUBNET_ALLOCATION_ATTEMPTS {
        let candidate = Ipv6Net::new(
            Ipv6Addr::new(0xfd42, rng.r#gen(), rng.r#gen(), rng.r#gen(), 0, 0, 0, 1),
            64,
        )
        .map_err(|e| NovaError::Os(e.to_string()))?;

        let net = IpNet::V6(candidate);
        if in_use.iter().any(|used| subnets_overlap(used, &net)) {
            continue;
        }
        return Ok(candidate);
    }

    Err(NovaError::Conflict(
        "Failed to automatically find an unused IPv6 subnet, manual configuration required"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn overlap_is_symmetric_and_reflexive() {
        let samples = [
            "10.0.0.0/8",
            "10.10.10.0/24",
            "10.10.10.1/32",
            "192.168.1.0/24",
            "fd42::/64",
            "fd42::1/128",
            "fd43::/48",
        ];
        for a in samples {
            assert!(subnets_overlap(&net(a), &net(a)), "{} overlaps itself", a);
            for b in samples {
                assert_eq!(
                    subnets_overlap(&net(a), &net(b)),
                    subnets_overlap(&net(b), &net(a)),
                    "{} vs {}",
                    a,
                    b
                );
            }
        }
        assert!(subnets_overlap(&net("10.0.0.0/8"), &net("10.10.10.1/32")));
        assert!(!subnets_overlap(&net("10.10.10.0/24"), &net("192.168.1.0/24")));
        assert!(!subnets_overlap(&net("10.0.0.0/8"), &net("fd42::/64")));
    }

    #[test]
    fn host_bits_do_not_matter_for_containment() {
        assert!(subnet_contains(&net("10.10.10.1/24"), &net("10.10.10.5/32")));
    }

    #[test]
    fn get_ip_offsets() {
        let v4 = net("10.10.10.1/24");
        assert_eq!(get_ip(&v4, 2).to_string(), "10.10.10.2");
        assert_eq!(get_ip(&v4, -2).to_string(), "10.10.10.254");
        assert_eq!(get_ip(&v4, -1).to_string(), "10.10.10.255");

        let v6 = net("fd42::1/64");
        assert_eq!(get_ip(&v6, 2).to_string(), "fd42::2");
        assert_eq!(get_ip(&v6, -1).to_string(), "fd42::ffff:ffff:ffff:ffff");
    }

    #[test]
    fn eui64_is_deterministic() {
        let prefix: Ipv6Net = "fd42:1:2:3::/64".parse().unwrap();
        let mac = [0x00, 0x16, 0x3e, 0x12, 0x34, 0x56];
        let a = derive_eui64(&prefix, &mac).unwrap();
        let b = derive_eui64(&prefix, &mac).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "fd42:1:2:3:216:3eff:fe12:3456");

        let wide: Ipv6Net = "fd42:1::/48".parse().unwrap();
        assert!(derive_eui64(&wide, &mac).is_err());
    }

    #[test]
    fn ranges_overlap_inclusively() {
        let ranges = parse_ip_ranges("10.0.0.10-10.0.0.20,10.0.0.20-10.0.0.30", &[]).unwrap();
        assert!(ip_ranges_overlap(&ranges[0], &ranges[1]));
        let apart = parse_ip_ranges("10.0.0.21-10.0.0.30", &[]).unwrap();
        assert!(!ip_ranges_overlap(&ranges[0], &apart[0]));

        let allowed = [net("10.0.0.0/24")];
        assert!(parse_ip_ranges("10.0.1.1-10.0.1.5", &allowed).is_err());
    }

    #[test]
    fn random_subnets_avoid_used_space() {
        let mut rng = StdRng::seed_from_u64(7);
        let subnet = random_subnet_v4(&mut rng, &[net("172.16.0.0/12")]).unwrap();
        assert_eq!(subnet.prefix_len(), 24);
        assert_eq!(subnet.addr().octets()[0], 10);

        let mut rng = StdRng::seed_from_u64(7);
        let err = random_subnet_v4(&mut rng, &[net("10.0.0.0/8")]).unwrap_err();
        assert!(err.to_string().contains("unused IPv4 subnet"));

        let mut rng = StdRng::seed_from_u64(7);
        let v6 = random_subnet_v6(&mut rng, &[]).unwrap();
        assert_eq!(v6.prefix_len(), 64);
        assert_eq!(v6.addr().segments()[0], 0xfd42);
    }
}
