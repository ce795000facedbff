use crate::{Result, StateError};
use berth_storage::RevisionedStore;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Address handed to an owner (usually `namespace/pod`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAllocation {
    pub ip_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

/// IP address management, injected into the cluster state
pub trait Ipam: Send + Sync {
    /// Allocate an address. Idempotent per owner.
    fn allocate(&self, owner: &str) -> Result<IpAllocation>;

    /// Release the owner's address, returning it if there was one
    fn release(&self, owner: &str) -> Result<Option<Ipv4Addr>>;

    fn lookup(&self, owner: &str) -> Result<Option<IpAllocation>>;
}

/// Parsed CIDR configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrConfig {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    /// network + 1
    pub gateway: Ipv4Addr,
    /// network + 2
    pub first_host: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl CidrConfig {
    fn allocation(&self, ip_address: Ipv4Addr) -> IpAllocation {
        IpAllocation {
            ip_address,
            gateway: self.gateway,
            prefix_len: self.prefix_len,
        }
    }
}

/// Storage layout:
/// - `ipam/_cidr` -> the CIDR string
/// - `ipam/alloc/{ip}` -> owner
const IPAM_CIDR_KEY: &str = "ipam/_cidr";
const IPAM_ALLOC_PREFIX: &str = "ipam/alloc/";

/// CIDR pool kept in the revisioned store. Addresses are handed out lowest
/// first and reused after release.
pub struct CidrIpam {
    store: Arc<RevisionedStore>,
    cidr: CidrConfig,
}

impl CidrIpam {
    pub fn new(store: Arc<RevisionedStore>, cidr_str: &str) -> Result<Self> {
        let cidr = parse_cidr(cidr_str)?;

        let current = store.get(IPAM_CIDR_KEY)?;
        if current.as_ref().map(|v| v.value.as_ref()) != Some(cidr_str.as_bytes()) {
            store.put(IPAM_CIDR_KEY, cidr_str.as_bytes())?;
        }

        debug!(
            "IPAM initialized: network={}, gateway={}, first_host={}, broadcast={}, prefix_len={}",
            cidr.network, cidr.gateway, cidr.first_host, cidr.broadcast, cidr.prefix_len
        );

        Ok(Self { store, cidr })
    }

    pub fn cidr(&self) -> &CidrConfig {
        &self.cidr
    }

    /// Every current allocation, by address
    pub fn allocations(&self) -> Result<BTreeMap<Ipv4Addr, String>> {
        let (entries, _) = self.store.list(IPAM_ALLOC_PREFIX)?;

        Ok(entries
            .into_iter()
            .filter_map(|(key, versioned)| {
                let ip = key[IPAM_ALLOC_PREFIX.len()..].parse::<Ipv4Addr>().ok()?;
                Some((ip, String::from_utf8_lossy(&versioned.value).into_owned()))
            })
            .collect())
    }

    fn find(&self, owner: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self
            .allocations()?
            .into_iter()
            .find(|(_, holder)| holder == owner)
            .map(|(ip, _)| ip))
    }
}

impl Ipam for CidrIpam {
    fn allocate(&self, owner: &str) -> Result<IpAllocation> {
        let allocations = self.allocations()?;

        if let Some((ip, _)) = allocations.iter().find(|(_, holder)| *holder == owner) {
            debug!("IPAM: returning existing allocation {} for {}", ip, owner);
            return Ok(self.cidr.allocation(*ip));
        }

        let taken: HashSet<Ipv4Addr> = allocations.into_keys().collect();

        let mut candidate = self.cidr.first_host;
        while candidate < self.cidr.broadcast {
            if !taken.contains(&candidate) {
                let key = format!("{}{}", IPAM_ALLOC_PREFIX, candidate);
                self.store.put(&key, owner.as_bytes())?;

                debug!("IPAM: allocated {} for {}", candidate, owner);
                return Ok(self.cidr.allocation(candidate));
            }
            candidate = next_ip(candidate);
        }

        Err(StateError::IpamPoolExhausted {
            cidr: format!("{}/{}", self.cidr.network, self.cidr.prefix_len),
        })
    }

    fn release(&self, owner: &str) -> Result<Option<Ipv4Addr>> {
        let Some(ip) = self.find(owner)? else {
            debug!("IPAM: no allocation found for {}", owner);
            return Ok(None);
        };

        self.store.delete(&format!("{}{}", IPAM_ALLOC_PREFIX, ip))?;
        debug!("IPAM: released {} for {}", ip, owner);
        Ok(Some(ip))
    }

    fn lookup(&self, owner: &str) -> Result<Option<IpAllocation>> {
        Ok(self.find(owner)?.map(|ip| self.cidr.allocation(ip)))
    }
}

/// Parse a CIDR string like "10.88.0.0/16"
pub fn parse_cidr(cidr_str: &str) -> Result<CidrConfig> {
    let (network, prefix) = cidr_str.split_once('/').ok_or_else(|| {
        StateError::invalid_request(
            format!("Invalid CIDR format: '{}'", cidr_str),
            "Use format like '10.88.0.0/16'",
        )
    })?;

    let network: Ipv4Addr = network.parse().map_err(|_| {
        StateError::invalid_request(
            format!("Invalid network address: '{}'", network),
            "Use a valid IPv4 address like '10.88.0.0'",
        )
    })?;

    let prefix_len: u8 = prefix.parse().map_err(|_| {
        StateError::invalid_request(
            format!("Invalid prefix length: '{}'", prefix),
            "Use a number between 0 and 30",
        )
    })?;

    // Anything smaller than /30 leaves no room for a gateway and a host
    if prefix_len > 30 {
        return Err(StateError::invalid_request(
            format!("Prefix length {} is out of range", prefix_len),
            "Use a number between 0 and 30",
        ));
    }

    let mask = if prefix_len == 0 {
        0u32
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    };
    let network_u32 = u32::from(network) & mask;

    Ok(CidrConfig {
        network: Ipv4Addr::from(network_u32),
        prefix_len,
        gateway: Ipv4Addr::from(network_u32 + 1),
        first_host: Ipv4Addr::from(network_u32 + 2),
        broadcast: Ipv4Addr::from(network_u32 | !mask),
    })
}

fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).saturating_add(1))
}
