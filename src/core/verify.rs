//! Structural checks on an assembled stack.
//!
//! Run on every stack before it is rendered:
//! - references resolve and are acyclic
//! - pipelines run Source → Build → Deploy and pass artifacts forward
//! - capacity bounds are ordered
//! - target groups serve the compute unit's port
//! - listeners, deployment groups and blue/green pairs point at the right kinds

use super::resolver::build_construct_order;
use super::stack::{ConstructKind, Stack};
use crate::error::{Error, Result};
use crate::resources::deploy::DeploymentTarget;
use crate::resources::pipeline::{ActionCategory, Pipeline};
use crate::resources::traffic::TargetGroup;
use std::collections::HashSet;

const STAGE_ORDER: [ActionCategory; 3] = [
    ActionCategory::Source,
    ActionCategory::Build,
    ActionCategory::Deploy,
];

/// Every violated property, in construct order. Empty means the stack holds.
pub fn verify_stack(stack: &Stack) -> Vec<String> {
    let mut violations = Vec::new();

    if let Err(e) = build_construct_order(stack) {
        violations.push(e.to_string());
    }

    for (id, construct) in stack.constructs() {
        match &construct.kind {
            ConstructKind::Pipeline(p) => check_pipeline(id, p, &mut violations),
            ConstructKind::AutoScalingGroup(asg) => {
                if asg.max_capacity == 0 {
                    violations.push(format!("{}: max capacity is 0", id));
                }
                if asg.min_capacity > asg.desired_capacity
                    || asg.desired_capacity > asg.max_capacity
                {
                    violations.push(format!(
                        "{}: capacity {} <= {} <= {} does not hold",
                        id, asg.min_capacity, asg.desired_capacity, asg.max_capacity
                    ));
                }
                for tg in &asg.target_groups {
                    check_port(stack, id, tg, asg.service_port, &mut violations);
                }
            }
            ConstructKind::FargateService(svc) => {
                check_port(stack, id, &svc.target_group, svc.container_port, &mut violations);
            }
            ConstructKind::Listener(l) => {
                let lb_vpcs = match stack.get(&l.load_balancer).map(|c| &c.kind) {
                    Some(ConstructKind::LoadBalancer(lb)) => lb
                        .subnets
                        .iter()
                        .filter_map(|s| match stack.get(s).map(|c| &c.kind) {
                            Some(ConstructKind::Subnet(subnet)) => Some(subnet.vpc.as_str()),
                            _ => None,
                        })
                        .collect::<HashSet<_>>(),
                    _ => {
                        violations.push(format!(
                            "{}: '{}' is not a load balancer",
                            id, l.load_balancer
                        ));
                        continue;
                    }
                };
                match target_group(stack, &l.default_target_group) {
                    Some(tg) if lb_vpcs.iter().all(|vpc| *vpc == tg.vpc) => {}
                    Some(tg) => violations.push(format!(
                        "{}: load balancer '{}' is not in the network of target group '{}' ({})",
                        id, l.load_balancer, l.default_target_group, tg.vpc
                    )),
                    None => violations.push(format!(
                        "{}: '{}' is not a target group",
                        id, l.default_target_group
                    )),
                }
            }
            ConstructKind::DeploymentGroup(dg) => {
                if !matches!(
                    stack.get(&dg.application).map(|c| &c.kind),
                    Some(ConstructKind::Application(_))
                ) {
                    violations.push(format!(
                        "{}: '{}' is not a CodeDeploy application",
                        id, dg.application
                    ));
                }
                check_deployment_target(stack, id, &dg.target, &mut violations);
            }
            _ => {}
        }
    }

    violations
}

/// [`verify_stack`], as an error when anything is violated.
pub fn verify(stack: &Stack) -> Result<()> {
    let violations = verify_stack(stack);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Verification {
            stack: stack.name.clone(),
            violations,
        })
    }
}

fn target_group<'a>(stack: &'a Stack, id: &str) -> Option<&'a TargetGroup> {
    match stack.get(id).map(|c| &c.kind) {
        Some(ConstructKind::TargetGroup(tg)) => Some(tg),
        _ => None,
    }
}

fn check_port(stack: &Stack, id: &str, tg_id: &str, port: u16, violations: &mut Vec<String>) {
    match target_group(stack, tg_id) {
        Some(tg) if tg.port == port => {}
        Some(tg) => violations.push(format!(
            "{}: target group '{}' forwards to port {} but the service listens on {}",
            id, tg_id, tg.port, port
        )),
        None => violations.push(format!("{}: '{}' is not a target group", id, tg_id)),
    }
}

fn check_pipeline(id: &str, pipeline: &Pipeline, violations: &mut Vec<String>) {
    let names = pipeline.stage_names();
    let expected: Vec<String> = STAGE_ORDER.iter().map(|c| c.to_string()).collect();
    if names != expected {
        violations.push(format!(
            "{}: stages are [{}], expected [{}]",
            id,
            names.join(", "),
            expected.join(", ")
        ));
    }

    for (stage, category) in pipeline.stages.iter().zip(STAGE_ORDER) {
        for action in &stage.actions {
            if action.kind.category() != category {
                violations.push(format!(
                    "{}: action '{}' ({}) is in the {} stage",
                    id,
                    action.name,
                    action.kind.category(),
                    stage.name
                ));
            }
        }
    }

    let mut produced: HashSet<&str> = HashSet::new();
    for stage in &pipeline.stages {
        for input in stage.inputs() {
            if !produced.contains(input) {
                violations.push(format!(
                    "{}: stage {} consumes '{}' before any stage produces it",
                    id, stage.name, input
                ));
            }
        }
        produced.extend(stage.outputs());
    }

    // Artifacts hand over stage to stage
    for pair in pipeline.stages.windows(2) {
        let outputs: Vec<&str> = pair[0].outputs().collect();
        let inputs: Vec<&str> = pair[1].inputs().collect();
        if outputs != inputs {
            violations.push(format!(
                "{}: stage {} consumes [{}] but stage {} produces [{}]",
                id,
                pair[1].name,
                inputs.join(", "),
                pair[0].name,
                outputs.join(", ")
            ));
        }
    }
}

fn check_deployment_target(
    stack: &Stack,
    id: &str,
    target: &DeploymentTarget,
    violations: &mut Vec<String>,
) {
    let mut expect = |target_id: &str, what: &str, ok: fn(&ConstructKind) -> bool| {
        if !stack.get(target_id).map(|c| ok(&c.kind)).unwrap_or(false) {
            violations.push(format!("{}: '{}' is not {}", id, target_id, what));
        }
    };

    match target {
        DeploymentTarget::AutoScaling { groups } => {
            for g in groups {
                expect(g, "an Auto Scaling Group", |k| {
                    matches!(k, ConstructKind::AutoScalingGroup(_))
                });
            }
        }
        DeploymentTarget::EcsBlueGreen {
            cluster,
            service,
            listener,
            blue_target_group,
            green_target_group,
        } => {
            expect(cluster, "an ECS cluster", |k| {
                matches!(k, ConstructKind::Cluster(_))
            });
            expect(service, "a Fargate service", |k| {
                matches!(k, ConstructKind::FargateService(_))
            });
            expect(listener, "a listener", |k| matches!(k, ConstructKind::Listener(_)));

            if blue_target_group == green_target_group {
                violations.push(format!(
                    "{}: blue and green are the same target group '{}'",
                    id, blue_target_group
                ));
                return;
            }
            match (
                target_group(stack, blue_target_group),
                target_group(stack, green_target_group),
            ) {
                (Some(blue), Some(green)) => {
                    if blue.port != green.port || blue.protocol != green.protocol {
                        violations.push(format!(
                            "{}: blue ({} {}) and green ({} {}) target groups differ",
                            id, blue.protocol, blue.port, green.protocol, green.port
                        ));
                    }
                }
                _ => violations.push(format!(
                    "{}: '{}' and '{}' must both be target groups",
                    id, blue_target_group, green_target_group
                )),
            }
        }
    }
}
