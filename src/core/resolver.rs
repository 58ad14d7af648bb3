//! Template resolution and construct ordering.
//!
//! Resolves `{{params.key}}`, `{{env.account}}`, `{{env.region}}`,
//! `{{ecr.repository}}` and `{{ecr.uri}}` in app-file strings. Orders a
//! stack's constructs from their reference edges using Kahn's algorithm with
//! deterministic (alphabetical) tie-breaking.

use super::stack::Stack;
use super::types::*;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Values templates can refer to.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub params: &'a HashMap<String, serde_yaml_ng::Value>,
    pub env: &'a ResolvedEnv,
    /// ECR repository of the stack, when it has one
    pub ecr_repository: Option<&'a str>,
}

impl TemplateContext<'_> {
    fn lookup(&self, key: &str) -> std::result::Result<String, String> {
        if let Some(param_key) = key.strip_prefix("params.") {
            return self
                .params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key));
        }
        match key {
            "env.account" => self
                .env
                .account
                .clone()
                .ok_or_else(|| "env.account is not set (CDK_DEFAULT_ACCOUNT)".to_string()),
            "env.region" => self
                .env
                .region
                .clone()
                .ok_or_else(|| "env.region is not set (CDK_DEFAULT_REGION)".to_string()),
            "ecr.repository" => self
                .ecr_repository
                .map(str::to_string)
                .ok_or_else(|| "ecr.repository is only available in ecs stacks".to_string()),
            "ecr.uri" => {
                let repo = self
                    .ecr_repository
                    .ok_or_else(|| "ecr.uri is only available in ecs stacks".to_string())?;
                Ok(format!(
                    "{}.dkr.ecr.{}.amazonaws.com/{}",
                    self.lookup("env.account")?,
                    self.lookup("env.region")?,
                    repo
                ))
            }
            _ => Err(format!("unknown template variable: {}", key)),
        }
    }
}

/// Resolve all template variables in a string.
pub fn resolve_template(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| Error::Template(format!("unclosed template at position {}", open)))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = ctx.lookup(key).map_err(Error::Template)?;

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn resolve_all(items: &[String], ctx: &TemplateContext) -> Result<Vec<String>> {
    items.iter().map(|s| resolve_template(s, ctx)).collect()
}

fn resolve_opt(item: &Option<String>, ctx: &TemplateContext) -> Result<Option<String>> {
    item.as_deref().map(|s| resolve_template(s, ctx)).transpose()
}

/// Resolve templates in every free-text field of a stack config.
///
/// A pipeline without a build section gets the default build for its kind
/// first, so the default's templates are resolved too.
pub fn resolve_stack_templates(stack: &StackConfig, ctx: &TemplateContext) -> Result<StackConfig> {
    let mut resolved = stack.clone();

    resolved.description = resolve_opt(&stack.description, ctx)?;
    resolved.network.name = resolve_opt(&stack.network.name, ctx)?;

    let compute = &mut resolved.compute;
    compute.instance_type = resolve_template(&compute.instance_type, ctx)?;
    compute.key_name = resolve_opt(&compute.key_name, ctx)?;
    compute.user_data = resolve_all(&compute.user_data, ctx)?;
    compute.managed_policies = resolve_all(&compute.managed_policies, ctx)?;

    let traffic = &mut resolved.traffic;
    traffic.load_balancer_name = resolve_opt(&traffic.load_balancer_name, ctx)?;
    traffic.certificate_arn = resolve_opt(&traffic.certificate_arn, ctx)?;
    traffic.health_check_path = resolve_template(&traffic.health_check_path, ctx)?;

    let service = &mut resolved.service;
    service.image = resolve_template(&service.image, ctx)?;
    service.container_name = resolve_template(&service.container_name, ctx)?;
    service.repository_name = resolve_opt(&service.repository_name, ctx)?;
    service.load_balancer_name = resolve_opt(&service.load_balancer_name, ctx)?;
    service.cluster_name = resolve_opt(&service.cluster_name, ctx)?;
    let bg = &mut service.blue_green;
    bg.certificate_arn = resolve_opt(&bg.certificate_arn, ctx)?;
    bg.health_check_path = resolve_template(&bg.health_check_path, ctx)?;

    let container_name = resolved.service.container_name.clone();
    if let Some(pipeline) = resolved.pipeline.as_mut() {
        pipeline.name = resolve_opt(&pipeline.name, ctx)?;

        let source = &mut pipeline.source;
        source.connection_arn = resolve_template(&source.connection_arn, ctx)?;
        source.owner = resolve_template(&source.owner, ctx)?;
        source.repo = resolve_template(&source.repo, ctx)?;
        source.branch = resolve_template(&source.branch, ctx)?;

        let mut build = pipeline
            .build
            .clone()
            .unwrap_or_else(|| BuildConfig::default_for(stack.kind, &container_name));
        build.project_name = resolve_opt(&build.project_name, ctx)?;
        build.image = resolve_template(&build.image, ctx)?;
        for version in build.runtime_versions.values_mut() {
            *version = resolve_template(version, ctx)?;
        }
        build.pre_build = resolve_all(&build.pre_build, ctx)?;
        build.build = resolve_all(&build.build, ctx)?;
        build.post_build = resolve_all(&build.post_build, ctx)?;
        build.artifacts = resolve_all(&build.artifacts, ctx)?;
        pipeline.build = Some(build);

        let deploy = &mut pipeline.deploy;
        deploy.application_name = resolve_opt(&deploy.application_name, ctx)?;
        deploy.deployment_group_name = resolve_opt(&deploy.deployment_group_name, ctx)?;
        deploy.deployment_config = resolve_opt(&deploy.deployment_config, ctx)?;
        deploy.alarms = resolve_all(&deploy.alarms, ctx)?;
    }

    Ok(resolved)
}

/// Build a topological order of a stack's constructs from references and
/// explicit dependencies. Uses Kahn's algorithm with alphabetical
/// tie-breaking for determinism.
pub fn build_construct_order(stack: &Stack) -> Result<Vec<String>> {
    let ids: Vec<String> = stack.constructs().map(|(id, _)| id.clone()).collect();
    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for (id, construct) in stack.constructs() {
        for dep in construct.edges() {
            if !stack.contains(&dep) {
                return Err(Error::UnknownReference {
                    from: id.clone(),
                    to: dep,
                });
            }
            if let Some(d) = in_degree.get_mut(id.as_str()) {
                *d += 1;
            }
            dependents.entry(dep).or_default().push(id.clone());
        }
    }

    // Kahn's algorithm with sorted tie-breaking
    let mut queue: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| id.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(current) = queue.pop_front() {
        let mut next_ready = BTreeSet::new();
        if let Some(children) = dependents.get(&current) {
            for child in children {
                if let Some(d) = in_degree.get_mut(child.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        next_ready.insert(child.clone());
                    }
                }
            }
        }
        order.push(current);
        queue.extend(next_ready);
    }

    if order.len() != ids.len() {
        let ordered: HashSet<&String> = order.iter().collect();
        let mut cycle_members: Vec<&str> = ids
            .iter()
            .filter(|id| !ordered.contains(id))
            .map(String::as_str)
            .collect();
        cycle_members.sort_unstable();
        return Err(Error::Cycle(cycle_members.join(", ")));
    }

    Ok(order)
}
