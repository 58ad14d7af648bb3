//! App file schema (`stackwright.yaml`).
//!
//! Every literal a stack is built from lives here with its default, so an app
//! file only has to name what differs. All types derive Serialize/Deserialize
//! for YAML roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Top-level stackwright.yaml
// ============================================================================

/// Root configuration: the stacks of one app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// App name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (templatable)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Target account and region
    #[serde(default)]
    pub env: Environment,

    /// Stack declarations (order-preserving)
    pub stacks: IndexMap<String, StackConfig>,
}

/// Deployment environment. Unset fields fall back to `CDK_DEFAULT_ACCOUNT`
/// and `CDK_DEFAULT_REGION`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

/// Environment after the process environment has been consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Environment {
    /// Fill unset fields from the process environment.
    pub fn resolve(&self) -> ResolvedEnv {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Fill unset fields from `lookup` (injectable for tests).
    pub fn resolve_with(&self, lookup: impl Fn(&str) -> Option<String>) -> ResolvedEnv {
        ResolvedEnv {
            account: self
                .account
                .clone()
                .or_else(|| lookup("CDK_DEFAULT_ACCOUNT")),
            region: self.region.clone().or_else(|| lookup("CDK_DEFAULT_REGION")),
        }
    }
}

impl ResolvedEnv {
    /// `aws://account/region`, with `unknown-*` placeholders for unset parts.
    pub fn uri(&self) -> String {
        format!(
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region.as_deref().unwrap_or("unknown-region")
        )
    }
}

// ============================================================================
// Stacks
// ============================================================================

/// A single deployable stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Which composition this stack uses
    pub kind: StackKind,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub network: NetworkConfig,

    /// EC2 fleet sizing (ec2_* kinds)
    #[serde(default)]
    pub compute: ComputeConfig,

    /// Load balancer and scaling trigger (ec2_* kinds)
    #[serde(default)]
    pub traffic: TrafficConfig,

    /// Fargate service (ecs_blue_green)
    #[serde(default)]
    pub service: ServiceConfig,

    /// Delivery pipeline (ec2_pipeline, ecs_blue_green)
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
}

/// Stack composition variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackKind {
    /// Auto Scaling Group behind a public ALB
    Ec2Service,
    /// `ec2_service` plus an in-place CodeDeploy pipeline
    Ec2Pipeline,
    /// Fargate service plus a blue/green CodeDeploy pipeline
    EcsBlueGreen,
}

impl StackKind {
    pub fn needs_pipeline(self) -> bool {
        matches!(self, Self::Ec2Pipeline | Self::EcsBlueGreen)
    }

    pub fn is_ec2(self) -> bool {
        matches!(self, Self::Ec2Service | Self::Ec2Pipeline)
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ec2Service => write!(f, "ec2_service"),
            Self::Ec2Pipeline => write!(f, "ec2_pipeline"),
            Self::EcsBlueGreen => write!(f, "ecs_blue_green"),
        }
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// VPC name tag
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_cidr")]
    pub cidr: String,

    /// Availability zones to spread subnets over
    #[serde(default = "default_max_azs")]
    pub max_azs: u32,

    /// One NAT gateway per AZ for the private subnets
    #[serde(default = "default_true")]
    pub nat_gateways: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: None,
            cidr: default_cidr(),
            max_azs: default_max_azs(),
            nat_gateways: true,
        }
    }
}

fn default_cidr() -> String {
    "10.0.0.0/16".to_string()
}

fn default_max_azs() -> u32 {
    2
}

// ============================================================================
// Compute (EC2)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    #[serde(default)]
    pub machine_image: MachineImage,

    #[serde(default = "default_one")]
    pub min_capacity: u32,

    #[serde(default = "default_one")]
    pub max_capacity: u32,

    #[serde(default = "default_one")]
    pub desired_capacity: u32,

    /// EC2 key pair for SSH access
    #[serde(default)]
    pub key_name: Option<String>,

    /// Shell commands run at first boot
    #[serde(default = "default_user_data")]
    pub user_data: Vec<String>,

    /// AWS managed policies attached to the instance role
    #[serde(default = "default_instance_policies")]
    pub managed_policies: Vec<String>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            instance_type: default_instance_type(),
            machine_image: MachineImage::default(),
            min_capacity: 1,
            max_capacity: 1,
            desired_capacity: 1,
            key_name: None,
            user_data: default_user_data(),
            managed_policies: default_instance_policies(),
        }
    }
}

fn default_instance_type() -> String {
    "t2.micro".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_user_data() -> Vec<String> {
    vec![
        "sudo yum -y update".to_string(),
        "sudo yum install -y https://s3.amazonaws.com/ec2-downloads-windows/SSMAgent/latest/linux_amd64/amazon-ssm-agent.rpm".to_string(),
        "sudo yum install -y java-11-amazon-corretto-headless".to_string(),
    ]
}

fn default_instance_policies() -> Vec<String> {
    vec!["AmazonSSMManagedInstanceCore".to_string()]
}

/// Amazon Linux generation, resolved at deploy time through the public
/// SSM parameter for the latest AMI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineImage {
    AmazonLinux,
    #[default]
    AmazonLinux2,
    AmazonLinux2023,
}

impl MachineImage {
    pub fn ssm_parameter(self) -> &'static str {
        match self {
            Self::AmazonLinux => "/aws/service/ami-amazon-linux-latest/amzn-ami-hvm-x86_64-gp2",
            Self::AmazonLinux2 => "/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2",
            Self::AmazonLinux2023 => {
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
            }
        }
    }
}

// ============================================================================
// Traffic
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// ALB name (AWS generates one when unset)
    #[serde(default)]
    pub load_balancer_name: Option<String>,

    #[serde(default = "default_true")]
    pub internet_facing: bool,

    #[serde(default = "default_http_port")]
    pub listener_port: u16,

    /// Port the instances serve on
    #[serde(default = "default_target_port")]
    pub target_port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// ACM certificate for an HTTPS listener
    #[serde(default)]
    pub certificate_arn: Option<String>,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    /// Target-tracking value for ALBRequestCountPerTarget
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            load_balancer_name: None,
            internet_facing: true,
            listener_port: default_http_port(),
            target_port: default_target_port(),
            protocol: Protocol::default(),
            certificate_arn: None,
            health_check_path: default_health_check_path(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

fn default_http_port() -> u16 {
    80
}

fn default_target_port() -> u16 {
    3000
}

fn default_health_check_path() -> String {
    "/ping".to_string()
}

fn default_requests_per_minute() -> u32 {
    1000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Https => write!(f, "HTTPS"),
        }
    }
}

// ============================================================================
// Service (Fargate)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    #[serde(default = "default_memory")]
    pub memory_mib: u32,

    #[serde(default = "default_one")]
    pub desired_count: u32,

    /// Image the service starts with, before the first pipeline run
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default = "default_http_port")]
    pub container_port: u16,

    /// ECR repository name (defaults to the lowercased stack name)
    #[serde(default)]
    pub repository_name: Option<String>,

    #[serde(default)]
    pub load_balancer_name: Option<String>,

    /// ECS cluster name (CloudFormation generates one when unset)
    #[serde(default)]
    pub cluster_name: Option<String>,

    #[serde(default = "default_true")]
    pub fargate_capacity_providers: bool,

    #[serde(default)]
    pub blue_green: BlueGreenConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mib: default_memory(),
            desired_count: 1,
            image: default_image(),
            container_name: default_container_name(),
            container_port: default_http_port(),
            repository_name: None,
            load_balancer_name: None,
            cluster_name: None,
            fargate_capacity_providers: true,
            blue_green: BlueGreenConfig::default(),
        }
    }
}

fn default_cpu() -> u32 {
    512
}

fn default_memory() -> u32 {
    1024
}

fn default_image() -> String {
    "amazon/amazon-ecs-sample".to_string()
}

fn default_container_name() -> String {
    "web".to_string()
}

/// Production listener and the two target groups traffic shifts between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    #[serde(default = "default_http_port")]
    pub listener_port: u16,

    /// Port of both target groups
    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub certificate_arn: Option<String>,

    #[serde(default = "default_container_health_check")]
    pub health_check_path: String,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            listener_port: default_http_port(),
            port: default_http_port(),
            protocol: Protocol::default(),
            certificate_arn: None,
            health_check_path: default_container_health_check(),
        }
    }
}

fn default_container_health_check() -> String {
    "/".to_string()
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name (defaults to `<Stack>Pipeline`)
    #[serde(default)]
    pub name: Option<String>,

    pub source: SourceConfig,

    /// Build spec; omitted means the default for the stack kind
    #[serde(default)]
    pub build: Option<BuildConfig>,

    #[serde(default)]
    pub deploy: DeployConfig,
}

/// CodeStar connection to a hosted git repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub connection_arn: String,
    pub owner: String,
    pub repo: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_true")]
    pub trigger_on_push: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// CodeBuild project name (AWS generates one when unset)
    #[serde(default)]
    pub project_name: Option<String>,

    pub image: String,

    /// Needed for docker builds
    #[serde(default)]
    pub privileged: bool,

    /// `install.runtime-versions` of the buildspec
    #[serde(default)]
    pub runtime_versions: IndexMap<String, String>,

    #[serde(default)]
    pub pre_build: Vec<String>,

    #[serde(default)]
    pub build: Vec<String>,

    #[serde(default)]
    pub post_build: Vec<String>,

    /// Artifact globs handed to the deploy stage
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl BuildConfig {
    /// Build spec used when a pipeline declares none.
    pub fn default_for(kind: StackKind, container_name: &str) -> Self {
        match kind {
            StackKind::EcsBlueGreen => Self {
                project_name: None,
                image: "aws/codebuild/standard:5.0".to_string(),
                privileged: true,
                runtime_versions: IndexMap::new(),
                pre_build: vec![
                    "aws ecr get-login-password --region {{env.region}} | docker login --username AWS --password-stdin {{ecr.uri}}".to_string(),
                ],
                build: vec![
                    "docker build -t {{ecr.repository}} .".to_string(),
                    "docker tag {{ecr.repository}} {{ecr.uri}}".to_string(),
                ],
                post_build: vec![
                    "docker push {{ecr.uri}}".to_string(),
                    format!(
                        "printf '[{{\"name\": \"{}\", \"imageUri\": \"%s\"}}]' {{{{ecr.uri}}}} > imagedefinitions.json",
                        container_name
                    ),
                    "printf '{\"ImageURI\": \"%s\"}' {{ecr.uri}} > imageDetail.json".to_string(),
                ],
                artifacts: vec![
                    "imagedefinitions.json".to_string(),
                    "imageDetail.json".to_string(),
                    "appspec.yaml".to_string(),
                    "taskdef.json".to_string(),
                ],
            },
            StackKind::Ec2Service | StackKind::Ec2Pipeline => Self {
                project_name: None,
                image: "aws/codebuild/amazonlinux2-x86_64-standard:4.0".to_string(),
                privileged: false,
                runtime_versions: IndexMap::from([("java".to_string(), "corretto11".to_string())]),
                pre_build: vec![],
                build: vec!["./gradlew build".to_string()],
                post_build: vec![],
                artifacts: vec![
                    "appspec.yml".to_string(),
                    "build/distributions/*".to_string(),
                    "scripts/*".to_string(),
                ],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// CodeDeploy application name
    #[serde(default)]
    pub application_name: Option<String>,

    #[serde(default)]
    pub deployment_group_name: Option<String>,

    /// CodeDeploy deployment config (defaults per stack kind)
    #[serde(default)]
    pub deployment_config: Option<String>,

    /// Install the CodeDeploy agent through instance user data
    #[serde(default = "default_true")]
    pub install_agent: bool,

    /// CloudWatch alarm names that stop a deployment
    #[serde(default)]
    pub alarms: Vec<String>,

    #[serde(default)]
    pub ignore_poll_alarms_failure: bool,

    #[serde(default)]
    pub auto_rollback: AutoRollbackConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            application_name: None,
            deployment_group_name: None,
            deployment_config: None,
            install_agent: true,
            alarms: Vec::new(),
            ignore_poll_alarms_failure: false,
            auto_rollback: AutoRollbackConfig::default(),
        }
    }
}

/// Events that roll a deployment back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRollbackConfig {
    #[serde(default = "default_true")]
    pub failed_deployment: bool,

    #[serde(default = "default_true")]
    pub stopped_deployment: bool,

    #[serde(default)]
    pub deployment_in_alarm: bool,
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            failed_deployment: true,
            stopped_deployment: true,
            deployment_in_alarm: false,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}
