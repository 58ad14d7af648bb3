//! VPC, subnets, gateways and routing.

use super::{cfn_ref, get_att, name_tags, CfnResource};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::net::Ipv4Addr;

/// Smallest subnet CIDR handed out when splitting an address space.
const MAX_SUBNET_PREFIX: u32 = 28;

#[derive(Debug, Clone, PartialEq)]
pub struct Vpc {
    pub name: Option<String>,
    pub cidr: String,
}

impl CfnResource for Vpc {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::VPC"
    }

    fn properties(&self) -> Value {
        json!({
            "CidrBlock": self.cidr,
            "EnableDnsHostnames": true,
            "EnableDnsSupport": true,
            "Tags": name_tags(self.name.as_deref()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub vpc: String,
    pub cidr: String,
    /// Index into the region's availability zones
    pub az_index: u32,
    pub public: bool,
    pub name: Option<String>,
}

impl CfnResource for Subnet {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::Subnet"
    }

    fn properties(&self) -> Value {
        json!({
            "VpcId": cfn_ref(&self.vpc),
            "CidrBlock": self.cidr,
            "AvailabilityZone": { "Fn::Select": [self.az_index, { "Fn::GetAZs": "" }] },
            "MapPublicIpOnLaunch": self.public,
            "Tags": name_tags(self.name.as_deref()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternetGateway;

impl CfnResource for InternetGateway {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::InternetGateway"
    }

    fn properties(&self) -> Value {
        json!({})
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayAttachment {
    pub vpc: String,
    pub gateway: String,
}

impl CfnResource for GatewayAttachment {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::VPCGatewayAttachment"
    }

    fn properties(&self) -> Value {
        json!({
            "VpcId": cfn_ref(&self.vpc),
            "InternetGatewayId": cfn_ref(&self.gateway),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteTable {
    pub vpc: String,
}

impl CfnResource for RouteTable {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::RouteTable"
    }

    fn properties(&self) -> Value {
        json!({ "VpcId": cfn_ref(&self.vpc) })
    }
}

/// Where a default route sends traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

/// Default (`0.0.0.0/0`) route.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub route_table: String,
    pub target: RouteTarget,
}

impl CfnResource for Route {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::Route"
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "RouteTableId": cfn_ref(&self.route_table),
            "DestinationCidrBlock": "0.0.0.0/0",
        });
        match &self.target {
            RouteTarget::InternetGateway(id) => props["GatewayId"] = cfn_ref(id),
            RouteTarget::NatGateway(id) => props["NatGatewayId"] = cfn_ref(id),
        }
        props
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteTableAssociation {
    pub subnet: String,
    pub route_table: String,
}

impl CfnResource for RouteTableAssociation {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::SubnetRouteTableAssociation"
    }

    fn properties(&self) -> Value {
        json!({
            "SubnetId": cfn_ref(&self.subnet),
            "RouteTableId": cfn_ref(&self.route_table),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElasticIp;

impl CfnResource for ElasticIp {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::EIP"
    }

    fn properties(&self) -> Value {
        json!({ "Domain": "vpc" })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NatGateway {
    /// Public subnet the gateway lives in
    pub subnet: String,
    pub eip: String,
}

impl CfnResource for NatGateway {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::NatGateway"
    }

    fn properties(&self) -> Value {
        json!({
            "SubnetId": cfn_ref(&self.subnet),
            "AllocationId": get_att(&self.eip, "AllocationId"),
        })
    }
}

/// Parse `a.b.c.d/prefix`, rejecting host bits.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    let invalid = |reason: &str| Error::InvalidCidr {
        cidr: cidr.to_string(),
        reason: reason.to_string(),
    };
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| invalid("missing '/prefix'"))?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad IPv4 address"))?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
    if prefix > 32 {
        return Err(invalid("prefix length above 32"));
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    if u32::from(addr) & !mask != 0 {
        return Err(invalid("address has host bits set"));
    }
    Ok((addr, prefix))
}

/// Split `cidr` into `count` equal, non-overlapping subnets.
///
/// The block is divided into the smallest power of two that holds `count`
/// pieces; the first `count` are returned in address order.
pub fn split_cidr(cidr: &str, count: usize) -> Result<Vec<String>> {
    let (addr, prefix) = parse_cidr(cidr)?;
    if count == 0 {
        return Ok(vec![]);
    }
    let bits = usize::BITS - (count - 1).leading_zeros();
    let new_prefix = prefix + bits;
    if new_prefix > MAX_SUBNET_PREFIX {
        return Err(Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: format!("too small to hold {} subnets", count),
        });
    }
    let size = 1u64 << (32 - new_prefix);
    let base = u64::from(u32::from(addr));
    Ok((0..count as u64)
        .map(|i| {
            let start = (base + i * size) as u32;
            format!("{}/{}", Ipv4Addr::from(start), new_prefix)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_cidr_four() {
        let subnets = split_cidr("10.0.0.0/16", 4).unwrap();
        assert_eq!(
            subnets,
            vec!["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18", "10.0.192.0/18"]
        );
    }

    #[test]
    fn test_split_cidr_rounds_up_to_power_of_two() {
        let subnets = split_cidr("10.0.0.0/16", 3).unwrap();
        assert_eq!(subnets, vec!["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18"]);
    }

    #[test]
    fn test_split_cidr_single() {
        assert_eq!(split_cidr("192.168.0.0/24", 1).unwrap(), vec!["192.168.0.0/24"]);
    }

    #[test]
    fn test_split_cidr_too_small() {
        let err = split_cidr("10.0.0.0/27", 4).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_parse_cidr_rejects_host_bits() {
        assert!(parse_cidr("10.0.0.1/16").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.300.0/16").is_err());
        assert!(parse_cidr("0.0.0.0/0").is_ok());
    }

    #[test]
    fn test_subnet_properties() {
        let s = Subnet {
            vpc: "Vpc".to_string(),
            cidr: "10.0.0.0/18".to_string(),
            az_index: 1,
            public: true,
            name: None,
        };
        let p = s.properties();
        assert_eq!(p["VpcId"], json!({"Ref": "Vpc"}));
        assert_eq!(p["MapPublicIpOnLaunch"], json!(true));
        assert_eq!(p["AvailabilityZone"]["Fn::Select"][0], json!(1));
        assert_eq!(s.references(), vec!["Vpc"]);
    }

    #[test]
    fn test_route_targets() {
        let igw = Route {
            route_table: "Rt".to_string(),
            target: RouteTarget::InternetGateway("Igw".to_string()),
        };
        assert_eq!(igw.properties()["GatewayId"], json!({"Ref": "Igw"}));
        let nat = Route {
            route_table: "Rt".to_string(),
            target: RouteTarget::NatGateway("Nat".to_string()),
        };
        assert_eq!(nat.properties()["NatGatewayId"], json!({"Ref": "Nat"}));
        assert_eq!(nat.references(), vec!["Rt", "Nat"]);
    }
}
