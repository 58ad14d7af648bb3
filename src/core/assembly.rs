//! Stack assembly: turn a resolved [`StackConfig`] into a construct graph.
//!
//! Each stack kind is composed from the same building blocks:
//! a network, then either an EC2 fleet behind an ALB or a Fargate service
//! behind an ALB, then (for the pipeline kinds) a Source → Build → Deploy
//! pipeline that deploys onto whichever compute unit was built.

use super::parser::validate_stack;
use super::resolver::{resolve_stack_templates, resolve_template, TemplateContext};
use super::stack::{ConstructKind, Stack};
use super::types::*;
use crate::error::{Error, Result};
use crate::resources::compute::{
    AutoScalingGroup, IngressRule, IngressSource, LaunchTemplate, SecurityGroup,
};
use crate::resources::container::{
    Cluster, ContainerDefinition, FargateService, Repository, TaskDefinition,
};
use crate::resources::deploy::{Application, ComputePlatform, DeploymentGroup, DeploymentTarget};
use crate::resources::iam::{InstanceProfile, PolicyStatement, Role};
use crate::resources::network::{
    split_cidr, ElasticIp, GatewayAttachment, InternetGateway, NatGateway, Route, RouteTable,
    RouteTableAssociation, RouteTarget, Subnet, Vpc,
};
use crate::resources::pipeline::{
    Action, ActionKind, ArtifactBucket, ArtifactPath, BuildSpec, Pipeline, Project, Stage,
};
use crate::resources::traffic::{
    Listener, LoadBalancer, RequestCountScalingPolicy, TargetGroup, TargetType,
};
use crate::resources::{cfn_ref, get_att};
use serde_json::json;
use tracing::{debug, info};

/// Artifact produced by the Source stage.
pub const SOURCE_ARTIFACT: &str = "source";
/// Artifact produced by the Build stage.
pub const BUILD_ARTIFACT: &str = "build";

const SERVER_DEPLOYMENT_CONFIG: &str = "CodeDeployDefault.OneAtATime";
const ECS_DEPLOYMENT_CONFIG: &str = "CodeDeployDefault.ECSAllAtOnce";

/// Commands that install the CodeDeploy agent on Amazon Linux.
const CODEDEPLOY_AGENT_INSTALL: &[&str] = &[
    "sudo yum install -y ruby wget",
    "REGION=$(curl -s http://169.254.169.254/latest/meta-data/placement/region)",
    "cd /home/ec2-user",
    "wget https://aws-codedeploy-$REGION.s3.$REGION.amazonaws.com/latest/install",
    "chmod +x ./install",
    "sudo ./install auto",
];

// ============================================================================
// Network
// ============================================================================

/// Logical ids of an assembled network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkHandle {
    pub vpc: String,
    pub public_subnets: Vec<String>,
    pub private_subnets: Vec<String>,
}

/// VPC with one public and one private subnet per AZ. Public subnets route
/// through an internet gateway; private subnets through a per-AZ NAT gateway
/// when enabled.
pub fn assemble_network(stack: &mut Stack, cfg: &NetworkConfig) -> Result<NetworkHandle> {
    let azs = cfg.max_azs as usize;
    let blocks = split_cidr(&cfg.cidr, azs * 2)?;

    let vpc = stack.add(
        "Vpc",
        Vpc {
            name: cfg.name.clone(),
            cidr: cfg.cidr.clone(),
        },
    )?;
    let igw = stack.add("VpcInternetGateway", InternetGateway)?;
    let attachment = stack.add(
        "VpcGatewayAttachment",
        GatewayAttachment {
            vpc: vpc.clone(),
            gateway: igw.clone(),
        },
    )?;

    let public_table = stack.add("VpcPublicRouteTable", RouteTable { vpc: vpc.clone() })?;
    let public_route = stack.add(
        "VpcPublicDefaultRoute",
        Route {
            route_table: public_table.clone(),
            target: RouteTarget::InternetGateway(igw),
        },
    )?;
    stack.add_dependency(&public_route, &attachment)?;

    let mut public_subnets = Vec::with_capacity(azs);
    let mut private_subnets = Vec::with_capacity(azs);

    for (i, cidr) in blocks[..azs].iter().enumerate() {
        let id = stack.add(
            &format!("VpcPublicSubnet{}", i + 1),
            Subnet {
                vpc: vpc.clone(),
                cidr: cidr.clone(),
                az_index: i as u32,
                public: true,
                name: cfg.name.as_ref().map(|n| format!("{}/Public{}", n, i + 1)),
            },
        )?;
        stack.add(
            &format!("{}RouteTableAssociation", id),
            RouteTableAssociation {
                subnet: id.clone(),
                route_table: public_table.clone(),
            },
        )?;
        public_subnets.push(id);
    }

    for (i, cidr) in blocks[azs..].iter().enumerate() {
        let id = stack.add(
            &format!("VpcPrivateSubnet{}", i + 1),
            Subnet {
                vpc: vpc.clone(),
                cidr: cidr.clone(),
                az_index: i as u32,
                public: false,
                name: cfg.name.as_ref().map(|n| format!("{}/Private{}", n, i + 1)),
            },
        )?;
        let table = stack.add(&format!("{}RouteTable", id), RouteTable { vpc: vpc.clone() })?;
        stack.add(
            &format!("{}RouteTableAssociation", id),
            RouteTableAssociation {
                subnet: id.clone(),
                route_table: table.clone(),
            },
        )?;
        if cfg.nat_gateways {
            let public = &public_subnets[i];
            let eip = stack.add(&format!("{}Eip", public), ElasticIp)?;
            let nat = stack.add(
                &format!("{}NatGateway", public),
                NatGateway {
                    subnet: public.clone(),
                    eip,
                },
            )?;
            stack.add_dependency(&nat, &attachment)?;
            stack.add(
                &format!("{}DefaultRoute", id),
                Route {
                    route_table: table,
                    target: RouteTarget::NatGateway(nat),
                },
            )?;
        }
        private_subnets.push(id);
    }

    debug!(vpc = %vpc, azs, nat = cfg.nat_gateways, "Assembled network");
    Ok(NetworkHandle {
        vpc,
        public_subnets,
        private_subnets,
    })
}

// ============================================================================
// Compute and traffic
// ============================================================================

/// Logical ids of an EC2 fleet and its load balancing.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetHandle {
    pub auto_scaling_group: String,
    pub launch_template: String,
    pub instance_role: String,
    pub load_balancer: String,
    pub listener: String,
    pub target_group: String,
}

/// Logical ids of a Fargate service and its blue/green load balancing.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHandle {
    pub cluster: String,
    pub service: String,
    pub repository: String,
    pub load_balancer: String,
    /// Production listener; forwards to the blue group
    pub listener: String,
    pub blue_target_group: String,
    pub green_target_group: String,
}

/// The compute unit a pipeline deploys onto.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployTarget {
    Fleet(FleetHandle),
    Service(ServiceHandle),
}

fn open_to_world(stack: &mut Stack, vpc: &str, port: u16) -> Result<String> {
    stack.add(
        "AlbSecurityGroup",
        SecurityGroup {
            vpc: vpc.to_string(),
            description: "Load balancer".to_string(),
            ingress: vec![IngressRule {
                source: IngressSource::Cidr("0.0.0.0/0".to_string()),
                port,
                description: "Open to the world".to_string(),
            }],
        },
    )
}

fn load_balancer(
    stack: &mut Stack,
    net: &NetworkHandle,
    name: Option<String>,
    internet_facing: bool,
    security_group: String,
) -> Result<String> {
    let subnets = if internet_facing {
        net.public_subnets.clone()
    } else {
        net.private_subnets.clone()
    };
    let id = stack.add(
        "Alb",
        LoadBalancer {
            name,
            internet_facing,
            subnets,
            security_groups: vec![security_group],
        },
    )?;
    stack.add_output(
        "LoadBalancerDns",
        get_att(&id, "DNSName"),
        Some("Public DNS name of the load balancer"),
    );
    Ok(id)
}

/// Auto Scaling Group in the private subnets behind an ALB, scaled on
/// request count per target.
pub fn assemble_fleet(
    stack: &mut Stack,
    compute: &ComputeConfig,
    traffic: &TrafficConfig,
    net: &NetworkHandle,
) -> Result<FleetHandle> {
    let role = compute
        .managed_policies
        .iter()
        .fold(Role::for_service("ec2.amazonaws.com"), |role, p| {
            role.with_managed_policy(p)
        });
    let instance_role = stack.add("InstanceRole", role)?;
    let profile = stack.add(
        "InstanceProfile",
        InstanceProfile {
            role: instance_role.clone(),
        },
    )?;

    let alb_sg = open_to_world(stack, &net.vpc, traffic.listener_port)?;
    let asg_sg = stack.add(
        "AsgSecurityGroup",
        SecurityGroup {
            vpc: net.vpc.clone(),
            description: "Instances behind the load balancer".to_string(),
            ingress: vec![IngressRule {
                source: IngressSource::SecurityGroup(alb_sg.clone()),
                port: traffic.target_port,
                description: "Load balancer to target".to_string(),
            }],
        },
    )?;

    let launch_template = stack.add(
        "AsgLaunchTemplate",
        LaunchTemplate {
            image: compute.machine_image,
            instance_type: compute.instance_type.clone(),
            key_name: compute.key_name.clone(),
            instance_profile: profile,
            security_group: asg_sg,
            user_data: compute.user_data.clone(),
        },
    )?;

    let alb = load_balancer(
        stack,
        net,
        traffic.load_balancer_name.clone(),
        traffic.internet_facing,
        alb_sg,
    )?;
    let target_group = stack.add(
        "AlbListenerTarget",
        TargetGroup {
            vpc: net.vpc.clone(),
            port: traffic.target_port,
            protocol: traffic.protocol,
            target_type: TargetType::Instance,
            health_check_path: traffic.health_check_path.clone(),
        },
    )?;
    let listener = stack.add(
        "AlbListener",
        Listener {
            load_balancer: alb.clone(),
            port: traffic.listener_port,
            protocol: traffic.protocol,
            default_target_group: target_group.clone(),
            certificate_arn: traffic.certificate_arn.clone(),
        },
    )?;

    let asg = stack.add(
        "Asg",
        AutoScalingGroup {
            launch_template: launch_template.clone(),
            min_capacity: compute.min_capacity,
            max_capacity: compute.max_capacity,
            desired_capacity: compute.desired_capacity,
            subnets: net.private_subnets.clone(),
            target_groups: vec![target_group.clone()],
            service_port: traffic.target_port,
        },
    )?;
    let policy = stack.add(
        "AsgRequestCountScaling",
        RequestCountScalingPolicy {
            auto_scaling_group: asg.clone(),
            load_balancer: alb.clone(),
            target_group: target_group.clone(),
            requests_per_minute: traffic.requests_per_minute,
        },
    )?;
    // The target group is only attached to the ALB once the listener exists
    stack.add_dependency(&policy, &listener)?;

    debug!(
        asg = %asg,
        min = compute.min_capacity,
        desired = compute.desired_capacity,
        max = compute.max_capacity,
        "Assembled fleet"
    );
    Ok(FleetHandle {
        auto_scaling_group: asg,
        launch_template,
        instance_role,
        load_balancer: alb,
        listener,
        target_group,
    })
}

/// Fargate service behind an ALB whose production listener forwards to the
/// blue target group; the green group waits for CodeDeploy to shift traffic.
pub fn assemble_service(
    stack: &mut Stack,
    service: &ServiceConfig,
    repository_name: &str,
    net: &NetworkHandle,
) -> Result<ServiceHandle> {
    let bg = &service.blue_green;

    let cluster = stack.add(
        "Cluster",
        Cluster {
            name: service.cluster_name.clone(),
            fargate_capacity_providers: service.fargate_capacity_providers,
        },
    )?;
    let repository = stack.add(
        "Repository",
        Repository {
            name: repository_name.to_string(),
        },
    )?;
    let execution_role = stack.add(
        "TaskExecutionRole",
        Role::for_service("ecs-tasks.amazonaws.com")
            .with_managed_policy("service-role/AmazonECSTaskExecutionRolePolicy"),
    )?;

    let alb_sg = open_to_world(stack, &net.vpc, bg.listener_port)?;
    let service_sg = stack.add(
        "ServiceSecurityGroup",
        SecurityGroup {
            vpc: net.vpc.clone(),
            description: "Fargate tasks behind the load balancer".to_string(),
            ingress: vec![IngressRule {
                source: IngressSource::SecurityGroup(alb_sg.clone()),
                port: service.container_port,
                description: "Load balancer to target".to_string(),
            }],
        },
    )?;

    let alb = load_balancer(stack, net, service.load_balancer_name.clone(), true, alb_sg)?;
    let target_group = || TargetGroup {
        vpc: net.vpc.clone(),
        port: bg.port,
        protocol: bg.protocol,
        target_type: TargetType::Ip,
        health_check_path: bg.health_check_path.clone(),
    };
    let blue = stack.add("BlueTargetGroup", target_group())?;
    let green = stack.add("GreenTargetGroup", target_group())?;
    let listener = stack.add(
        "AlbListener",
        Listener {
            load_balancer: alb.clone(),
            port: bg.listener_port,
            protocol: bg.protocol,
            default_target_group: blue.clone(),
            certificate_arn: bg.certificate_arn.clone(),
        },
    )?;

    let family = format!("{}Task", stack.name);
    let task_definition = stack.add(
        "TaskDefinition",
        TaskDefinition {
            family,
            cpu: service.cpu,
            memory_mib: service.memory_mib,
            execution_role,
            container: ContainerDefinition {
                name: service.container_name.clone(),
                image: service.image.clone(),
                port: service.container_port,
            },
        },
    )?;
    let svc = stack.add(
        "Service",
        FargateService {
            cluster: cluster.clone(),
            task_definition,
            desired_count: service.desired_count,
            subnets: net.private_subnets.clone(),
            security_groups: vec![service_sg],
            target_group: blue.clone(),
            container_name: service.container_name.clone(),
            container_port: service.container_port,
        },
    )?;
    stack.add_dependency(&svc, &listener)?;

    stack.add_output(
        "RepositoryUri",
        get_att(&repository, "RepositoryUri"),
        Some("Container image repository"),
    );

    debug!(service = %svc, repository = %repository_name, "Assembled Fargate service");
    Ok(ServiceHandle {
        cluster,
        service: svc,
        repository,
        load_balancer: alb,
        listener,
        blue_target_group: blue,
        green_target_group: green,
    })
}

// ============================================================================
// Pipeline
// ============================================================================

fn bucket_statement(bucket: &str, actions: &[&str]) -> PolicyStatement {
    PolicyStatement::new(
        actions,
        vec![
            get_att(bucket, "Arn"),
            json!({ "Fn::Join": ["", [get_att(bucket, "Arn"), "/*"]] }),
        ],
    )
}

const BUCKET_READ: &[&str] = &["s3:GetObject*", "s3:GetBucket*", "s3:List*"];
const BUCKET_READ_WRITE: &[&str] = &[
    "s3:GetObject*",
    "s3:GetBucket*",
    "s3:List*",
    "s3:PutObject*",
    "s3:DeleteObject*",
    "s3:Abort*",
];

fn build_spec(build: &BuildConfig) -> BuildSpec {
    BuildSpec {
        runtime_versions: build.runtime_versions.clone(),
        pre_build: build.pre_build.clone(),
        build: build.build.clone(),
        post_build: build.post_build.clone(),
        artifacts: build.artifacts.clone(),
    }
}

/// Source → Build → Deploy pipeline deploying onto `target`.
///
/// The deploy stage is in-place onto an Auto Scaling Group for a fleet, and
/// blue/green onto the production listener for a Fargate service.
pub fn assemble_pipeline(
    stack: &mut Stack,
    cfg: &PipelineConfig,
    build: &BuildConfig,
    target: &DeployTarget,
) -> Result<String> {
    let bucket = stack.add("ArtifactsBucket", ArtifactBucket)?;

    // Build
    let mut build_role = Role::for_service("codebuild.amazonaws.com")
        .with_statement(PolicyStatement::new(
            &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            vec![json!("*")],
        ))
        .with_statement(bucket_statement(&bucket, BUCKET_READ_WRITE));
    if let DeployTarget::Service(svc) = target {
        build_role = build_role
            .with_statement(PolicyStatement::new(
                &["ecr:GetAuthorizationToken"],
                vec![json!("*")],
            ))
            .with_statement(PolicyStatement::new(
                &[
                    "ecr:BatchCheckLayerAvailability",
                    "ecr:CompleteLayerUpload",
                    "ecr:InitiateLayerUpload",
                    "ecr:PutImage",
                    "ecr:UploadLayerPart",
                ],
                vec![get_att(&svc.repository, "Arn")],
            ));
    }
    let build_role = stack.add("BuildProjectRole", build_role)?;
    let project = stack.add(
        "BuildProject",
        Project {
            name: build.project_name.clone(),
            image: build.image.clone(),
            privileged: build.privileged,
            role: build_role,
            build_spec: build_spec(build),
        },
    )?;

    // Deploy
    let deploy = &cfg.deploy;
    let (platform, dg_policy, default_config) = match target {
        DeployTarget::Fleet(_) => (
            ComputePlatform::Server,
            "service-role/AWSCodeDeployRole",
            SERVER_DEPLOYMENT_CONFIG,
        ),
        DeployTarget::Service(_) => (
            ComputePlatform::Ecs,
            "AWSCodeDeployRoleForECS",
            ECS_DEPLOYMENT_CONFIG,
        ),
    };
    let application = stack.add(
        "DeployApplication",
        Application {
            name: deploy.application_name.clone(),
            platform,
        },
    )?;
    let dg_role = stack.add(
        "DeploymentGroupRole",
        Role::for_service("codedeploy.amazonaws.com").with_managed_policy(dg_policy),
    )?;
    let deployment_target = match target {
        DeployTarget::Fleet(fleet) => DeploymentTarget::AutoScaling {
            groups: vec![fleet.auto_scaling_group.clone()],
        },
        DeployTarget::Service(svc) => DeploymentTarget::EcsBlueGreen {
            cluster: svc.cluster.clone(),
            service: svc.service.clone(),
            listener: svc.listener.clone(),
            blue_target_group: svc.blue_target_group.clone(),
            green_target_group: svc.green_target_group.clone(),
        },
    };
    let deployment_group = stack.add(
        "DeploymentGroup",
        DeploymentGroup {
            application: application.clone(),
            name: deploy.deployment_group_name.clone(),
            role: dg_role,
            target: deployment_target,
            deployment_config: deploy
                .deployment_config
                .clone()
                .unwrap_or_else(|| default_config.to_string()),
            auto_rollback: deploy.auto_rollback,
            alarms: deploy.alarms.clone(),
            ignore_poll_alarms_failure: deploy.ignore_poll_alarms_failure,
        },
    )?;

    if let DeployTarget::Fleet(fleet) = target {
        if deploy.install_agent {
            install_codedeploy_agent(stack, fleet)?;
        }
        // The agent pulls revisions from the artifact bucket
        if let Some(ConstructKind::Role(role)) = stack
            .get_mut(&fleet.instance_role)
            .map(|c| &mut c.kind)
        {
            role.statements.push(bucket_statement(&bucket, BUCKET_READ));
        }
    }

    let deploy_kind = match target {
        DeployTarget::Fleet(_) => ActionKind::CodeDeployServer {
            application,
            deployment_group,
        },
        DeployTarget::Service(_) => ActionKind::CodeDeployEcs {
            application,
            deployment_group,
            task_definition_template: ArtifactPath {
                artifact: BUILD_ARTIFACT.to_string(),
                file: "taskdef.json".to_string(),
            },
            appspec_template: ArtifactPath {
                artifact: BUILD_ARTIFACT.to_string(),
                file: "appspec.yaml".to_string(),
            },
            image_artifact: BUILD_ARTIFACT.to_string(),
            image_placeholder: "IMAGE1_NAME".to_string(),
        },
    };

    // Pipeline
    let src = &cfg.source;
    let mut pipeline_role = Role::for_service("codepipeline.amazonaws.com")
        .with_statement(bucket_statement(&bucket, BUCKET_READ_WRITE))
        .with_statement(PolicyStatement::new(
            &["codestar-connections:UseConnection"],
            vec![json!(src.connection_arn)],
        ))
        .with_statement(PolicyStatement::new(
            &["codebuild:BatchGetBuilds", "codebuild:StartBuild", "codebuild:StopBuild"],
            vec![get_att(&project, "Arn")],
        ))
        .with_statement(PolicyStatement::new(
            &[
                "codedeploy:CreateDeployment",
                "codedeploy:GetApplication",
                "codedeploy:GetApplicationRevision",
                "codedeploy:GetDeployment",
                "codedeploy:GetDeploymentConfig",
                "codedeploy:RegisterApplicationRevision",
            ],
            vec![json!("*")],
        ));
    if matches!(target, DeployTarget::Service(_)) {
        pipeline_role = pipeline_role.with_statement(PolicyStatement::new(
            &["ecs:RegisterTaskDefinition", "iam:PassRole"],
            vec![json!("*")],
        ));
    }
    let pipeline_role = stack.add("PipelineRole", pipeline_role)?;

    let stages = vec![
        Stage {
            name: "Source".to_string(),
            actions: vec![Action {
                name: "GitHub_Source".to_string(),
                kind: ActionKind::CodeStarSource {
                    connection_arn: src.connection_arn.clone(),
                    owner: src.owner.clone(),
                    repo: src.repo.clone(),
                    branch: src.branch.clone(),
                    trigger_on_push: src.trigger_on_push,
                },
                inputs: vec![],
                outputs: vec![SOURCE_ARTIFACT.to_string()],
            }],
        },
        Stage {
            name: "Build".to_string(),
            actions: vec![Action {
                name: "CodeBuild".to_string(),
                kind: ActionKind::CodeBuild { project },
                inputs: vec![SOURCE_ARTIFACT.to_string()],
                outputs: vec![BUILD_ARTIFACT.to_string()],
            }],
        },
        Stage {
            name: "Deploy".to_string(),
            actions: vec![Action {
                name: "CodeDeploy".to_string(),
                kind: deploy_kind,
                inputs: vec![BUILD_ARTIFACT.to_string()],
                outputs: vec![],
            }],
        },
    ];

    let name = cfg
        .name
        .clone()
        .unwrap_or_else(|| format!("{}Pipeline", stack.name));
    let pipeline = stack.add(
        "Pipeline",
        Pipeline {
            name: name.clone(),
            role: pipeline_role,
            artifact_bucket: bucket,
            stages,
        },
    )?;
    stack.add_output("PipelineName", cfn_ref(&pipeline), Some("Delivery pipeline"));

    debug!(pipeline = %name, branch = %src.branch, "Assembled pipeline");
    Ok(pipeline)
}

/// Append the CodeDeploy agent install to the fleet's first-boot script.
fn install_codedeploy_agent(stack: &mut Stack, fleet: &FleetHandle) -> Result<()> {
    let from = fleet.auto_scaling_group.clone();
    match stack.get_mut(&fleet.launch_template).map(|c| &mut c.kind) {
        Some(ConstructKind::LaunchTemplate(lt)) => {
            lt.user_data
                .extend(CODEDEPLOY_AGENT_INSTALL.iter().map(|c| c.to_string()));
            Ok(())
        }
        _ => Err(Error::UnknownReference {
            from,
            to: fleet.launch_template.clone(),
        }),
    }
}

// ============================================================================
// Stacks
// ============================================================================

/// ECR repository name of an `ecs_blue_green` stack, with templates in a
/// configured name resolved against `ctx`.
pub fn repository_name(name: &str, cfg: &StackConfig, ctx: &TemplateContext) -> Result<String> {
    match &cfg.service.repository_name {
        Some(repo) => resolve_template(repo, ctx),
        None => Ok(name.to_lowercase()),
    }
}

/// Resolve templates in `cfg` and assemble the stack it describes.
pub fn build_stack(
    name: &str,
    cfg: &StackConfig,
    env: &ResolvedEnv,
    params: &std::collections::HashMap<String, serde_yaml_ng::Value>,
) -> Result<Stack> {
    debug!(stack = %name, kind = %cfg.kind, "Assembling stack");

    let base = TemplateContext {
        params,
        env,
        ecr_repository: None,
    };
    let repo = match cfg.kind {
        StackKind::EcsBlueGreen => Some(repository_name(name, cfg, &base)?),
        _ => None,
    };
    let ctx = TemplateContext {
        ecr_repository: repo.as_deref(),
        ..base
    };
    let cfg = resolve_stack_templates(cfg, &ctx)?;

    let problems = validate_stack(name, &cfg);
    if !problems.is_empty() {
        return Err(Error::Invalid {
            stack: name.to_string(),
            problems: problems.into_iter().map(|e| e.message).collect(),
        });
    }

    let mut stack = Stack::new(name);
    stack.description = cfg.description.clone();

    let net = assemble_network(&mut stack, &cfg.network)?;
    let target = match cfg.kind {
        StackKind::Ec2Service | StackKind::Ec2Pipeline => {
            DeployTarget::Fleet(assemble_fleet(&mut stack, &cfg.compute, &cfg.traffic, &net)?)
        }
        StackKind::EcsBlueGreen => {
            let repo = repo.as_deref().unwrap_or(name);
            DeployTarget::Service(assemble_service(&mut stack, &cfg.service, repo, &net)?)
        }
    };

    if cfg.kind.needs_pipeline() {
        let pipeline = cfg.pipeline.as_ref().ok_or_else(|| Error::MissingSection {
            stack: name.to_string(),
            section: "pipeline",
        })?;
        let build = pipeline
            .build
            .clone()
            .unwrap_or_else(|| BuildConfig::default_for(cfg.kind, &cfg.service.container_name));
        assemble_pipeline(&mut stack, pipeline, &build, &target)?;
    }

    info!(stack = %name, kind = %cfg.kind, resources = stack.len(), "Stack assembled");
    Ok(stack)
}

/// Assemble every stack of the app, in declaration order.
pub fn build_app(config: &AppConfig, env: &ResolvedEnv) -> Result<Vec<Stack>> {
    config
        .stacks
        .iter()
        .map(|(name, cfg)| build_stack(name, cfg, env, &config.params))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_config;
    use crate::resources::pipeline::ActionCategory;
    use crate::resources::CfnResource;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const SOURCE: &str = r#"
      source:
        connection_arn: arn:aws:codestar-connections:us-east-1:123456789012:connection/abc
        owner: ntalbs
        repo: reflexive
        branch: mainline
"#;

    fn env() -> ResolvedEnv {
        ResolvedEnv {
            account: Some("123456789012".to_string()),
            region: Some("us-east-1".to_string()),
        }
    }

    fn stack_config(yaml: &str) -> StackConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn build(name: &str, yaml: &str) -> Stack {
        build_stack(name, &stack_config(yaml), &env(), &HashMap::new()).unwrap()
    }

    fn kind<'a>(stack: &'a Stack, id: &str) -> &'a ConstructKind {
        &stack
            .get(id)
            .unwrap_or_else(|| panic!("missing construct {}", id))
            .kind
    }

    fn asg(stack: &Stack) -> &AutoScalingGroup {
        match kind(stack, "Asg") {
            ConstructKind::AutoScalingGroup(a) => a,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn pipeline(stack: &Stack) -> &Pipeline {
        match kind(stack, "Pipeline") {
            ConstructKind::Pipeline(p) => p,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn target_group<'a>(stack: &'a Stack, id: &str) -> &'a TargetGroup {
        match kind(stack, id) {
            ConstructKind::TargetGroup(t) => t,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_network_splits_cidr_per_az() {
        let stack = build("Web", "kind: ec2_service");
        let cidr = |id: &str| match kind(&stack, id) {
            ConstructKind::Subnet(s) => s.cidr.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(cidr("VpcPublicSubnet1"), "10.0.0.0/18");
        assert_eq!(cidr("VpcPublicSubnet2"), "10.0.64.0/18");
        assert_eq!(cidr("VpcPrivateSubnet1"), "10.0.128.0/18");
        assert_eq!(cidr("VpcPrivateSubnet2"), "10.0.192.0/18");
        assert!(stack.contains("VpcPublicSubnet1NatGateway"));
        assert!(stack.contains("VpcPrivateSubnet2DefaultRoute"));
    }

    #[test]
    fn test_network_without_nat() {
        let stack = build("Web", "kind: ec2_service\nnetwork:\n  nat_gateways: false\n  max_azs: 3");
        assert!(stack.contains("VpcPrivateSubnet3"));
        assert!(!stack.contains("VpcPublicSubnet1NatGateway"));
        assert!(!stack.contains("VpcPrivateSubnet1DefaultRoute"));
    }

    #[test]
    fn test_public_route_waits_for_gateway_attachment() {
        let stack = build("Web", "kind: ec2_service");
        let route = stack.get("VpcPublicDefaultRoute").unwrap();
        assert!(route.depends_on.contains(&"VpcGatewayAttachment".to_string()));
    }

    #[test]
    fn test_fleet_defaults() {
        let stack = build("Web", "kind: ec2_service");
        let a = asg(&stack);
        assert_eq!((a.min_capacity, a.desired_capacity, a.max_capacity), (1, 1, 1));
        assert_eq!(a.service_port, 3000);
        assert_eq!(a.subnets, vec!["VpcPrivateSubnet1", "VpcPrivateSubnet2"]);

        let tg = target_group(&stack, "AlbListenerTarget");
        assert_eq!(tg.port, 3000);
        assert_eq!(tg.health_check_path, "/ping");

        match kind(&stack, "AlbListener") {
            ConstructKind::Listener(l) => assert_eq!(l.port, 80),
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "AlbSecurityGroup") {
            ConstructKind::SecurityGroup(sg) => assert!(sg.allows_port(80)),
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "AsgRequestCountScaling") {
            ConstructKind::ScalingPolicy(p) => assert_eq!(p.requests_per_minute, 1000),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!stack.contains("Pipeline"));
        assert_eq!(stack.outputs().count(), 1);
    }

    #[test]
    fn test_fleet_instance_role_policies() {
        let stack = build("Web", "kind: ec2_service");
        match kind(&stack, "InstanceRole") {
            ConstructKind::Role(r) => {
                assert_eq!(r.assumed_by, "ec2.amazonaws.com");
                assert_eq!(r.managed_policies, vec!["AmazonSSMManagedInstanceCore"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ec2_pipeline_stages_and_artifacts() {
        let stack = build("Java", &format!("kind: ec2_pipeline\npipeline:{}", SOURCE));
        let p = pipeline(&stack);
        assert_eq!(p.name, "JavaPipeline");
        assert_eq!(p.stage_names(), vec!["Source", "Build", "Deploy"]);
        assert_eq!(p.stages[0].outputs().collect::<Vec<_>>(), vec![SOURCE_ARTIFACT]);
        assert_eq!(p.stages[1].inputs().collect::<Vec<_>>(), vec![SOURCE_ARTIFACT]);
        assert_eq!(p.stages[2].inputs().collect::<Vec<_>>(), vec![BUILD_ARTIFACT]);
        assert_eq!(p.stages[2].actions[0].kind.category(), ActionCategory::Deploy);
        assert_eq!(p.stages[2].actions[0].kind.provider(), "CodeDeploy");

        match kind(&stack, "DeploymentGroup") {
            ConstructKind::DeploymentGroup(dg) => {
                assert_eq!(
                    dg.target,
                    DeploymentTarget::AutoScaling {
                        groups: vec!["Asg".to_string()]
                    }
                );
                assert_eq!(dg.deployment_config, "CodeDeployDefault.OneAtATime");
                assert_eq!(
                    dg.rollback_events(),
                    vec!["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_REQUEST"]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ec2_pipeline_installs_agent() {
        let stack = build("Java", &format!("kind: ec2_pipeline\npipeline:{}", SOURCE));
        match kind(&stack, "AsgLaunchTemplate") {
            ConstructKind::LaunchTemplate(lt) => {
                assert_eq!(lt.user_data.last().unwrap(), "sudo ./install auto");
                assert_eq!(lt.user_data[0], "sudo yum -y update");
            }
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "InstanceRole") {
            ConstructKind::Role(r) => assert_eq!(r.statements.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ec2_pipeline_without_agent() {
        let yaml = format!(
            "kind: ec2_pipeline\npipeline:{}      deploy:\n        install_agent: false\n",
            SOURCE
        );
        let stack = build("Java", &yaml);
        match kind(&stack, "AsgLaunchTemplate") {
            ConstructKind::LaunchTemplate(lt) => assert_eq!(lt.user_data.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ec2_build_spec_defaults() {
        let stack = build("Java", &format!("kind: ec2_pipeline\npipeline:{}", SOURCE));
        match kind(&stack, "BuildProject") {
            ConstructKind::Project(p) => {
                assert_eq!(p.image, "aws/codebuild/amazonlinux2-x86_64-standard:4.0");
                assert_eq!(p.build_spec.runtime_versions["java"], "corretto11");
                assert_eq!(p.build_spec.build, vec!["./gradlew build"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ecs_blue_green_service() {
        let stack = build("ReflexiveRs", &format!("kind: ecs_blue_green\npipeline:{}", SOURCE));

        let blue = target_group(&stack, "BlueTargetGroup");
        let green = target_group(&stack, "GreenTargetGroup");
        assert_eq!(blue, green);
        assert_eq!(blue.port, 80);
        assert_eq!(blue.target_type, TargetType::Ip);

        match kind(&stack, "AlbListener") {
            ConstructKind::Listener(l) => assert_eq!(l.default_target_group, "BlueTargetGroup"),
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "Service") {
            ConstructKind::FargateService(s) => {
                assert_eq!(s.properties()["DeploymentController"]["Type"], json!("CODE_DEPLOY"));
                assert_eq!(s.target_group, "BlueTargetGroup");
                assert_eq!(s.container_port, 80);
            }
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "Repository") {
            ConstructKind::Repository(r) => assert_eq!(r.name, "reflexivers"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!stack.contains("Asg"));
    }

    #[test]
    fn test_ecs_pipeline_deploys_blue_green() {
        let stack = build("ReflexiveRs", &format!("kind: ecs_blue_green\npipeline:{}", SOURCE));
        let p = pipeline(&stack);
        assert_eq!(p.stages[2].actions[0].kind.provider(), "CodeDeployToECS");
        match kind(&stack, "DeploymentGroup") {
            ConstructKind::DeploymentGroup(dg) => {
                assert_eq!(dg.deployment_config, "CodeDeployDefault.ECSAllAtOnce");
                match &dg.target {
                    DeploymentTarget::EcsBlueGreen {
                        listener,
                        blue_target_group,
                        green_target_group,
                        ..
                    } => {
                        assert_eq!(listener, "AlbListener");
                        assert_ne!(blue_target_group, green_target_group);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "BuildProject") {
            ConstructKind::Project(project) => {
                assert!(project.privileged);
                assert!(project.build_spec.post_build[0]
                    .ends_with("123456789012.dkr.ecr.us-east-1.amazonaws.com/reflexivers"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_custom_repository_and_pipeline_name() {
        let yaml = format!(
            "kind: ecs_blue_green\nservice:\n  repository_name: reflexive-rs\npipeline:\n      name: RsPipeline{}",
            SOURCE
        );
        let stack = build("ReflexiveRs", &yaml);
        assert_eq!(pipeline(&stack).name, "RsPipeline");
        match kind(&stack, "Repository") {
            ConstructKind::Repository(r) => assert_eq!(r.name, "reflexive-rs"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_pipeline_section() {
        let err = build_stack(
            "Java",
            &stack_config("kind: ec2_pipeline"),
            &env(),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no pipeline section"));
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, serde_yaml_ng::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_yaml_ng::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_templated_repository_name_reaches_ecr_uri() {
        let yaml = format!(
            "kind: ecs_blue_green\nservice:\n  repository_name: \"{{{{params.repo}}}}\"\npipeline:{}",
            SOURCE
        );
        let stack = build_stack(
            "ReflexiveRs",
            &stack_config(&yaml),
            &env(),
            &params(&[("repo", "reflexive-rs")]),
        )
        .unwrap();

        match kind(&stack, "Repository") {
            ConstructKind::Repository(r) => assert_eq!(r.name, "reflexive-rs"),
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "BuildProject") {
            ConstructKind::Project(p) => assert_eq!(
                p.build_spec.post_build[0],
                "docker push 123456789012.dkr.ecr.us-east-1.amazonaws.com/reflexive-rs"
            ),
            other => panic!("unexpected {:?}", other),
        }
        for (id, construct) in stack.constructs() {
            let props = construct.kind.properties().to_string();
            assert!(!props.contains("{{"), "{} still holds a template: {}", id, props);
        }
    }

    #[test]
    fn test_resolved_values_are_validated() {
        let cfg = stack_config("kind: ec2_service\ncompute:\n  instance_type: \"{{params.size}}\"\n");
        let stack = build_stack("Web", &cfg, &env(), &params(&[("size", "t3.small")])).unwrap();
        match kind(&stack, "AsgLaunchTemplate") {
            ConstructKind::LaunchTemplate(lt) => assert_eq!(lt.instance_type, "t3.small"),
            other => panic!("unexpected {:?}", other),
        }

        let err = build_stack("Web", &cfg, &env(), &params(&[("size", "large")])).unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
        assert!(err.to_string().contains("instance_type 'large'"));
    }

    #[test]
    fn test_https_listener_and_named_cluster() {
        let yaml = format!(
            "kind: ecs_blue_green\nservice:\n  cluster_name: reflexive\n  blue_green:\n    listener_port: 443\n    protocol: HTTPS\n    certificate_arn: arn:aws:acm:us-east-1:123456789012:certificate/abc\npipeline:{}",
            SOURCE
        );
        let stack = build("ReflexiveRs", &yaml);
        match kind(&stack, "AlbListener") {
            ConstructKind::Listener(l) => {
                assert_eq!(l.port, 443);
                assert_eq!(
                    l.certificate_arn.as_deref(),
                    Some("arn:aws:acm:us-east-1:123456789012:certificate/abc")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stack, "Cluster") {
            ConstructKind::Cluster(c) => assert_eq!(c.name.as_deref(), Some("reflexive")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_alarm_rollback_reaches_deployment_group() {
        let yaml = format!(
            "kind: ec2_pipeline\npipeline:{}      deploy:\n        alarms: [HighLatency]\n        auto_rollback:\n          deployment_in_alarm: true\n",
            SOURCE
        );
        let stack = build("Java", &yaml);
        match kind(&stack, "DeploymentGroup") {
            ConstructKind::DeploymentGroup(g) => {
                assert_eq!(g.alarms, vec!["HighLatency"]);
                assert!(g.rollback_events().contains(&"DEPLOYMENT_STOP_ON_ALARM"));
                assert_eq!(g.properties()["AlarmConfiguration"]["Enabled"], json!(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_template_params_reach_constructs() {
        let yaml = format!(
            r#"
version: "1.0"
name: reflexive
params:
  branch: release
stacks:
  Java:
    kind: ec2_pipeline
    compute:
      key_name: "{{{{params.branch}}}}-key"
    pipeline:{}"#,
            SOURCE.replace("mainline", "\"{{params.branch}}\"")
        );
        let config = parse_config(&yaml).unwrap();
        let stacks = build_app(&config, &env()).unwrap();
        assert_eq!(stacks.len(), 1);
        match &stacks[0].get("Pipeline").unwrap().kind {
            ConstructKind::Pipeline(p) => match &p.stages[0].actions[0].kind {
                ActionKind::CodeStarSource { branch, .. } => assert_eq!(branch, "release"),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        match kind(&stacks[0], "AsgLaunchTemplate") {
            ConstructKind::LaunchTemplate(lt) => {
                assert_eq!(lt.key_name.as_deref(), Some("release-key"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_build_app_keeps_declaration_order() {
        let yaml = format!(
            "version: \"1.0\"\nname: app\nstacks:\n  Zeta:\n    kind: ec2_service\n  Alpha:\n    kind: ecs_blue_green\n    pipeline:{}",
            SOURCE
        );
        let config = parse_config(&yaml).unwrap();
        let stacks = build_app(&config, &env()).unwrap();
        let names: Vec<_> = stacks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        /// Assembled capacity bounds are exactly the configured ones.
        #[test]
        fn capacity_bounds_carry_through(
            min in 0u32..10,
            extra_desired in 0u32..10,
            extra_max in 0u32..10,
        ) {
            let desired = min + extra_desired;
            let max = (desired + extra_max).max(1);
            let yaml = format!(
                "kind: ec2_service\ncompute:\n  min_capacity: {}\n  desired_capacity: {}\n  max_capacity: {}\n",
                min, desired, max
            );
            let stack = build("Web", &yaml);
            let a = asg(&stack);
            prop_assert_eq!(a.min_capacity, min);
            prop_assert_eq!(a.desired_capacity, desired);
            prop_assert_eq!(a.max_capacity, max);
            prop_assert!(a.min_capacity <= a.desired_capacity);
            prop_assert!(a.desired_capacity <= a.max_capacity);
        }
    }
}
