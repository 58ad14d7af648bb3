//! Application Load Balancer, listeners, target groups and the
//! request-count scaling trigger.

use super::{cfn_ref, get_att, CfnResource};
use crate::core::types::Protocol;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancer {
    pub name: Option<String>,
    pub internet_facing: bool,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
}

impl CfnResource for LoadBalancer {
    fn cfn_type(&self) -> &'static str {
        "AWS::ElasticLoadBalancingV2::LoadBalancer"
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "Type": "application",
            "Scheme": if self.internet_facing { "internet-facing" } else { "internal" },
            "Subnets": self.subnets.iter().map(|s| cfn_ref(s)).collect::<Vec<_>>(),
            "SecurityGroups": self
                .security_groups
                .iter()
                .map(|sg| get_att(sg, "GroupId"))
                .collect::<Vec<_>>(),
        });
        if let Some(name) = &self.name {
            props["Name"] = json!(name);
        }
        props
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub load_balancer: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Target group the default action forwards to
    pub default_target_group: String,
    /// ACM certificate ARN, required for HTTPS
    pub certificate_arn: Option<String>,
}

impl CfnResource for Listener {
    fn cfn_type(&self) -> &'static str {
        "AWS::ElasticLoadBalancingV2::Listener"
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "LoadBalancerArn": cfn_ref(&self.load_balancer),
            "Port": self.port,
            "Protocol": self.protocol.to_string(),
            "DefaultActions": [{
                "Type": "forward",
                "TargetGroupArn": cfn_ref(&self.default_target_group),
            }],
        });
        if let Some(arn) = &self.certificate_arn {
            props["Certificates"] = json!([{ "CertificateArn": arn }]);
        }
        props
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Instance,
    Ip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub vpc: String,
    pub port: u16,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub health_check_path: String,
}

impl CfnResource for TargetGroup {
    fn cfn_type(&self) -> &'static str {
        "AWS::ElasticLoadBalancingV2::TargetGroup"
    }

    fn properties(&self) -> Value {
        json!({
            "VpcId": cfn_ref(&self.vpc),
            "Port": self.port,
            "Protocol": self.protocol.to_string(),
            "TargetType": match self.target_type {
                TargetType::Instance => "instance",
                TargetType::Ip => "ip",
            },
            "HealthCheckPath": self.health_check_path,
        })
    }
}

/// Target tracking on `ALBRequestCountPerTarget`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestCountScalingPolicy {
    pub auto_scaling_group: String,
    pub load_balancer: String,
    pub target_group: String,
    pub requests_per_minute: u32,
}

impl CfnResource for RequestCountScalingPolicy {
    fn cfn_type(&self) -> &'static str {
        "AWS::AutoScaling::ScalingPolicy"
    }

    fn properties(&self) -> Value {
        json!({
            "AutoScalingGroupName": cfn_ref(&self.auto_scaling_group),
            "PolicyType": "TargetTrackingScaling",
            "TargetTrackingConfiguration": {
                "PredefinedMetricSpecification": {
                    "PredefinedMetricType": "ALBRequestCountPerTarget",
                    "ResourceLabel": {
                        "Fn::Join": ["/", [
                            get_att(&self.load_balancer, "LoadBalancerFullName"),
                            get_att(&self.target_group, "TargetGroupFullName"),
                        ]],
                    },
                },
                "TargetValue": self.requests_per_minute,
            },
        })
    }
}
