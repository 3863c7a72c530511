//! Compiled flow-dump filter.
//!
//! Two combinators over the same constraint set: `AllAnd` requires every
//! non-empty constraint to match; `Or` accepts a flow when its single port
//! constraint is unset or matches either side and its single address
//! constraint (both read from the src slots) matches either endpoint. An
//! empty filter short-circuits to match-all.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::common::enums::PktType;
use crate::utils::net::MappedAddr;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    /// A malformed IP literal, including the dotted-quad leading-zero forms
    /// that platform `inet_pton` implementations disagree on.
    #[error("inet_pton parse error on {0}")]
    InetParse(String),
    #[error("invalid cidr /{0}")]
    InvalidCidr(u32),
    #[error("invalid filter address {0}")]
    InvalidAddress(String),
}

/// One address constraint: an address and an optional mask, both stored
/// v4-mapped like every other address in the engine.
#[derive(Debug, Clone)]
pub struct IpMatcher {
    addr: MappedAddr,
    v4: bool,
    mask: Option<MappedAddr>,
}

impl IpMatcher {
    pub fn matches(&self, flow_addr: &MappedAddr) -> bool {
        match &self.mask {
            None => self.addr == *flow_addr,
            Some(mask) => {
                if self.v4 != flow_addr.is_v4() {
                    return false;
                }
                for chunk in 0..2 {
                    let range = chunk * 8..chunk * 8 + 8;
                    let f = u64::from_ne_bytes(self.addr.0[range.clone()].try_into().unwrap());
                    let a = u64::from_ne_bytes(flow_addr.0[range.clone()].try_into().unwrap());
                    let m = u64::from_ne_bytes(mask.0[range].try_into().unwrap());
                    if (f & m) != (a & m) {
                        return false;
                    }
                }
                true
            }
        }
    }
}

/// Parse dotted-quad rejecting a leading zero followed by another digit,
/// which `inet_pton` is inconsistent about across platforms.
fn parse_v4(literal: &str) -> Result<Ipv4Addr, FilterError> {
    let bytes = literal.as_bytes();
    let mut new_octet = true;
    for i in 0..bytes.len() {
        // a lone zero octet is fine; a leading zero followed by another
        // digit is not
        if new_octet && bytes[i] == b'0' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            return Err(FilterError::InetParse(literal.to_string()));
        }
        new_octet = bytes[i] == b'.';
    }
    Ipv4Addr::from_str(literal).map_err(|_| FilterError::InetParse(literal.to_string()))
}

fn parse_v6(literal: &str) -> Result<Ipv6Addr, FilterError> {
    Ipv6Addr::from_str(literal).map_err(|_| FilterError::InetParse(literal.to_string()))
}

// bit i of mask word i/32 is set iff i < cidr
fn cidr_to_mask(cidr: u32, words: &mut [u32]) {
    let mut bit = cidr;
    while bit > 0 {
        bit -= 1;
        words[(bit / 32) as usize] |= 1u32 << (bit % 32);
    }
}

fn v4_mapped_words(words: &[u32; 1]) -> MappedAddr {
    let mut bytes = [0u8; 16];
    bytes[10] = 0xff;
    bytes[11] = 0xff;
    bytes[12..].copy_from_slice(&words[0].to_ne_bytes());
    MappedAddr(bytes)
}

fn v6_words(words: &[u32; 4]) -> MappedAddr {
    let mut bytes = [0u8; 16];
    for (i, word) in words.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
    }
    MappedAddr(bytes)
}

/// Parse `addr`, `addr/cidr` or `addr/netmask` into a matcher.
pub fn parse_ip_matcher(filter_ip: &str) -> Result<IpMatcher, FilterError> {
    if let Some((ip_part, subnet_part)) = filter_ip.split_once('/') {
        if ip_part.contains(':') {
            let addr = MappedAddr::from_ip(parse_v6(ip_part)?.into());
            let mask = if !subnet_part.contains(':') {
                let cidr: u32 = subnet_part
                    .parse()
                    .map_err(|_| FilterError::InvalidAddress(filter_ip.to_string()))?;
                if cidr > 128 {
                    return Err(FilterError::InvalidCidr(cidr));
                }
                let mut words = [0u32; 4];
                cidr_to_mask(cidr, &mut words);
                v6_words(&words)
            } else {
                MappedAddr::from_ip(parse_v6(subnet_part)?.into())
            };
            return Ok(IpMatcher {
                addr,
                v4: false,
                mask: Some(mask),
            });
        }
        if ip_part.contains('.') {
            let addr = MappedAddr::from_v4(parse_v4(ip_part)?);
            let mask = if !subnet_part.contains('.') {
                let cidr: u32 = subnet_part
                    .parse()
                    .map_err(|_| FilterError::InvalidAddress(filter_ip.to_string()))?;
                if cidr > 32 {
                    return Err(FilterError::InvalidCidr(cidr));
                }
                let mut words = [0u32; 1];
                cidr_to_mask(cidr, &mut words);
                v4_mapped_words(&words)
            } else {
                MappedAddr::from_v4(parse_v4(subnet_part)?)
            };
            return Ok(IpMatcher {
                addr,
                v4: true,
                mask: Some(mask),
            });
        }
        return Err(FilterError::InvalidAddress(filter_ip.to_string()));
    }

    // no mask
    if filter_ip.contains(':') {
        Ok(IpMatcher {
            addr: MappedAddr::from_ip(parse_v6(filter_ip)?.into()),
            v4: false,
            mask: None,
        })
    } else if filter_ip.contains('.') {
        Ok(IpMatcher {
            addr: MappedAddr::from_v4(parse_v4(filter_ip)?),
            v4: true,
            mask: None,
        })
    } else {
        Err(FilterError::InvalidAddress(filter_ip.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub src_ip: Option<IpMatcher>,
    pub dst_ip: Option<IpMatcher>,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Option<PktType>,
}

impl FilterSpec {
    pub fn set_src_ip(&mut self, filter_ip: &str) -> Result<(), FilterError> {
        if filter_ip.is_empty() {
            return Ok(());
        }
        self.src_ip = Some(parse_ip_matcher(filter_ip)?);
        Ok(())
    }

    pub fn set_dst_ip(&mut self, filter_ip: &str) -> Result<(), FilterError> {
        if filter_ip.is_empty() {
            return Ok(());
        }
        self.dst_ip = Some(parse_ip_matcher(filter_ip)?);
        Ok(())
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.src_port = port;
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.dst_port = port;
    }

    pub fn set_proto(&mut self, proto: PktType) {
        self.proto = Some(proto);
    }

    fn is_empty(&self) -> bool {
        self.src_ip.is_none()
            && self.dst_ip.is_none()
            && self.src_port == 0
            && self.dst_port == 0
            && self.proto.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum DumpFilter {
    AllAnd(FilterSpec),
    Or(FilterSpec),
}

impl DumpFilter {
    pub fn spec(&self) -> &FilterSpec {
        match self {
            DumpFilter::AllAnd(spec) | DumpFilter::Or(spec) => spec,
        }
    }

    /// Fast path: nothing to check, every flow matches.
    pub fn is_match_all(&self) -> bool {
        self.spec().is_empty()
    }

    pub fn matches(
        &self,
        flow_src_ip: &MappedAddr,
        flow_dst_ip: &MappedAddr,
        flow_src_port: u16,
        flow_dst_port: u16,
        flow_pkt_type: PktType,
    ) -> bool {
        match self {
            DumpFilter::AllAnd(spec) => {
                if let Some(proto) = spec.proto {
                    if proto != flow_pkt_type {
                        return false;
                    }
                }
                if spec.src_port != 0 && spec.src_port != flow_src_port {
                    return false;
                }
                if spec.dst_port != 0 && spec.dst_port != flow_dst_port {
                    return false;
                }
                if spec.src_ip.is_none() && spec.dst_ip.is_none() {
                    return true;
                }
                if let Some(src) = &spec.src_ip {
                    if !src.matches(flow_src_ip) {
                        return false;
                    }
                }
                if let Some(dst) = &spec.dst_ip {
                    if !dst.matches(flow_dst_ip) {
                        return false;
                    }
                }
                true
            }
            DumpFilter::Or(spec) => {
                // if the port is unspecified or matches either side, check
                // whether either address matches the single ip constraint
                let port = spec.src_port;
                if port == 0 || port == flow_src_port || port == flow_dst_port {
                    let Some(ip) = &spec.src_ip else {
                        return true;
                    };
                    if ip.matches(flow_src_ip) || ip.matches(flow_dst_ip) {
                        return true;
                    }
                }
                false
            }
        }
    }
}
