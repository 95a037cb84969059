//! Pure, stateless subnet allocation (spec §4.1). Server indices are
//! assigned in topology-join order and never reused within a cluster's
//! lifetime, so allocation requires no coordination: it's a pure function
//! of the cluster CIDR and a zero-based index.

use crate::error::SubnetError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Maximum index derivable from a cluster prefix, i.e. the number of /24s
/// that fit (minus one, since indices are zero-based).
fn max_index(cluster_prefix: u8) -> u32 {
    (1u32 << (24 - cluster_prefix as u32)) - 1
}

fn require_prefix(cluster: Ipv4Net) -> Result<(), SubnetError> {
    if cluster.prefix_len() > 24 || cluster.prefix_len() < 8 {
        return Err(SubnetError::PrefixTooLong(cluster.prefix_len()));
    }
    Ok(())
}

fn base_plus(cluster: Ipv4Net, offset: u32) -> Ipv4Addr {
    let base: u32 = cluster.network().into();
    Ipv4Addr::from(base.wrapping_add(offset))
}

/// Returns the /24 CIDR whose base address is `cluster_base + index * 256`.
pub fn allocate(cluster: Ipv4Net, index: u32) -> Result<Ipv4Net, SubnetError> {
    require_prefix(cluster)?;
    let max = max_index(cluster.prefix_len());
    if index > max {
        return Err(SubnetError::CapacityExceeded { index, max });
    }
    let base = base_plus(cluster, index * 256);
    Ok(Ipv4Net::new(base, 24).expect("constructed /24 is always valid"))
}

/// The WireGuard host address inside the allocated /24 (base + 1).
pub fn server_address(cluster: Ipv4Net, index: u32) -> Result<Ipv4Addr, SubnetError> {
    let net = allocate(cluster, index)?;
    let base: u32 = net.network().into();
    Ok(Ipv4Addr::from(base + 1))
}

/// The first usable container address inside the allocated /24 (base + 2).
pub fn first_container_address(cluster: Ipv4Net, index: u32) -> Result<Ipv4Addr, SubnetError> {
    let net = allocate(cluster, index)?;
    let base: u32 = net.network().into();
    Ok(Ipv4Addr::from(base + 2))
}

/// The container-side /24 for server `index`: `base_network.(128+i).0/24`.
/// Kept disjoint from the WireGuard host /24 so both remain independently
/// routable over the mesh.
pub fn container_subnet(cluster: Ipv4Net, index: u32) -> Result<Ipv4Net, SubnetError> {
    require_prefix(cluster)?;
    let max = max_index(cluster.prefix_len());
    if index > max {
        return Err(SubnetError::CapacityExceeded { index, max });
    }
    let base = base_plus(cluster, (128 + index) * 256);
    Ok(Ipv4Net::new(base, 24).expect("constructed /24 is always valid"))
}

/// Standard mask-and-compare containment check.
pub fn contains(ip: Ipv4Addr, cidr: Ipv4Net) -> bool {
    cidr.contains(&ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cluster() -> Ipv4Net {
        "10.210.0.0/16".parse().unwrap()
    }

    #[test]
    fn scenario_s1_three_hosts() {
        let c = cluster();
        assert_eq!(allocate(c, 0).unwrap(), "10.210.0.0/24".parse().unwrap());
        assert_eq!(allocate(c, 1).unwrap(), "10.210.1.0/24".parse().unwrap());
        assert_eq!(allocate(c, 2).unwrap(), "10.210.2.0/24".parse().unwrap());

        assert_eq!(server_address(c, 0).unwrap(), "10.210.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(server_address(c, 1).unwrap(), "10.210.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(server_address(c, 2).unwrap(), "10.210.2.1".parse::<Ipv4Addr>().unwrap());

        assert_eq!(
            container_subnet(c, 0).unwrap(),
            "10.210.128.0/24".parse().unwrap()
        );
        assert_eq!(
            container_subnet(c, 1).unwrap(),
            "10.210.129.0/24".parse().unwrap()
        );
        assert_eq!(
            container_subnet(c, 2).unwrap(),
            "10.210.130.0/24".parse().unwrap()
        );
    }

    #[test]
    fn capacity_exceeded_at_boundary() {
        let c: Ipv4Net = "10.210.0.0/24".parse().unwrap();
        // /24 cluster => exactly one valid index: 0
        assert!(allocate(c, 0).is_ok());
        assert!(matches!(
            allocate(c, 1),
            Err(SubnetError::CapacityExceeded { index: 1, max: 0 })
        ));
    }

    proptest! {
        #[test]
        fn allocations_are_disjoint_and_contained(
            third in 0u8..=252u8,
            i in 0u32..4,
            j in 0u32..4,
        ) {
            // pick a /16-ish cluster so several /24 indices are valid
            let cluster: Ipv4Net = format!("10.{}.0.0/16", third).parse().unwrap();
            prop_assume!(i != j);
            let a = allocate(cluster, i).unwrap();
            let b = allocate(cluster, j).unwrap();
            prop_assert_ne!(a, b);
            prop_assert!(cluster.contains(&a));
            prop_assert!(cluster.contains(&b));
        }

        #[test]
        fn last_valid_index_is_the_last_24(prefix in 16u8..=24u8) {
            let cluster: Ipv4Net = format!("10.0.0.0/{}", prefix).parse().unwrap();
            let max = max_index(prefix);
            prop_assert!(allocate(cluster, max).is_ok());
            let exceeded = matches!(allocate(cluster, max + 1), Err(SubnetError::CapacityExceeded { .. }));
            prop_assert!(exceeded);
        }
    }
}
