//! ECS cluster, ECR repository, Fargate task definition and service.

use super::{cfn_ref, get_att, CfnResource};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: Option<String>,
    pub fargate_capacity_providers: bool,
}

impl CfnResource for Cluster {
    fn cfn_type(&self) -> &'static str {
        "AWS::ECS::Cluster"
    }

    fn properties(&self) -> Value {
        let mut props = json!({});
        if let Some(name) = &self.name {
            props["ClusterName"] = json!(name);
        }
        if self.fargate_capacity_providers {
            props["CapacityProviders"] = json!(["FARGATE", "FARGATE_SPOT"]);
        }
        props
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repository {
    pub name: String,
}

impl CfnResource for Repository {
    fn cfn_type(&self) -> &'static str {
        "AWS::ECR::Repository"
    }

    fn properties(&self) -> Value {
        json!({ "RepositoryName": self.name })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub execution_role: String,
    pub container: ContainerDefinition,
}

impl CfnResource for TaskDefinition {
    fn cfn_type(&self) -> &'static str {
        "AWS::ECS::TaskDefinition"
    }

    fn properties(&self) -> Value {
        json!({
            "Family": self.family,
            "Cpu": self.cpu.to_string(),
            "Memory": self.memory_mib.to_string(),
            "NetworkMode": "awsvpc",
            "RequiresCompatibilities": ["FARGATE"],
            "ExecutionRoleArn": get_att(&self.execution_role, "Arn"),
            "ContainerDefinitions": [{
                "Name": self.container.name,
                "Image": self.container.image,
                "Essential": true,
                "PortMappings": [{ "ContainerPort": self.container.port, "Protocol": "tcp" }],
            }],
        })
    }
}

/// Fargate service whose task sets are rolled out by CodeDeploy.
#[derive(Debug, Clone, PartialEq)]
pub struct FargateService {
    pub cluster: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub target_group: String,
    pub container_name: String,
    pub container_port: u16,
}

impl CfnResource for FargateService {
    fn cfn_type(&self) -> &'static str {
        "AWS::ECS::Service"
    }

    fn properties(&self) -> Value {
        json!({
            "Cluster": cfn_ref(&self.cluster),
            "LaunchType": "FARGATE",
            "TaskDefinition": cfn_ref(&self.task_definition),
            "DesiredCount": self.desired_count,
            "DeploymentController": { "Type": "CODE_DEPLOY" },
            "HealthCheckGracePeriodSeconds": 60,
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": "DISABLED",
                    "Subnets": self.subnets.iter().map(|s| cfn_ref(s)).collect::<Vec<_>>(),
                    "SecurityGroups": self
                        .security_groups
                        .iter()
                        .map(|sg| get_att(sg, "GroupId"))
                        .collect::<Vec<_>>(),
                },
            },
            "LoadBalancers": [{
                "ContainerName": self.container_name,
                "ContainerPort": self.container_port,
                "TargetGroupArn": cfn_ref(&self.target_group),
            }],
        })
    }
}
