//! YAML parsing and validation.
//!
//! Parses stackwright.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Stack names must be valid CloudFormation stack names
//! - Capacities satisfy `min <= desired <= max`
//! - Pipelines are present exactly where the stack kind needs one
//! - The blue/green target groups serve the container's port
//! - HTTPS listeners carry a certificate
//!
//! Format checks skip values that still hold `{{...}}` templates;
//! [`validate_stack`] runs again on the resolved config during assembly.

use super::types::*;
use crate::resources::network::parse_cidr;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a stackwright.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<AppConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a stackwright.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<AppConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &AppConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // Version check
    if config.version != "1.0" {
        errors.push(ValidationError {
            message: format!("version must be \"1.0\", got \"{}\"", config.version),
        });
    }

    // Name check
    if config.name.is_empty() {
        errors.push(ValidationError {
            message: "name must not be empty".to_string(),
        });
    }

    if config.stacks.is_empty() {
        errors.push(ValidationError {
            message: "at least one stack must be declared".to_string(),
        });
    }

    for (name, stack) in &config.stacks {
        errors.extend(validate_stack(name, stack));
    }

    errors
}

/// Validate one stack config.
pub fn validate_stack(name: &str, stack: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if !is_valid_stack_name(name) {
        push(format!(
            "stack '{}': name must start with a letter and contain only letters, digits and hyphens",
            name
        ));
    }

    // Network
    if let Err(e) = parse_cidr(&stack.network.cidr) {
        push(format!("stack '{}': {}", name, e));
    }
    if stack.network.max_azs == 0 {
        push(format!("stack '{}': network.max_azs must be at least 1", name));
    }

    // Kind-specific sections
    if stack.kind.is_ec2() {
        let c = &stack.compute;
        if c.max_capacity == 0 {
            push(format!("stack '{}': compute.max_capacity must be at least 1", name));
        }
        if c.min_capacity > c.desired_capacity || c.desired_capacity > c.max_capacity {
            push(format!(
                "stack '{}': capacity must satisfy min <= desired <= max, got {} <= {} <= {}",
                name, c.min_capacity, c.desired_capacity, c.max_capacity
            ));
        }
        if !is_templated(&c.instance_type) && !is_valid_instance_type(&c.instance_type) {
            push(format!(
                "stack '{}': instance_type '{}' is not of the form <family>.<size>",
                name, c.instance_type
            ));
        }

        let t = &stack.traffic;
        if t.listener_port == 0 {
            push(format!("stack '{}': traffic.listener_port must be nonzero", name));
        }
        if t.target_port == 0 {
            push(format!("stack '{}': traffic.target_port must be nonzero", name));
        }
        if !is_templated(&t.health_check_path) && !t.health_check_path.starts_with('/') {
            push(format!(
                "stack '{}': traffic.health_check_path must start with '/'",
                name
            ));
        }
        if let Some(message) = check_certificate(t.protocol, &t.certificate_arn) {
            push(format!("stack '{}': traffic: {}", name, message));
        }
    } else {
        let s = &stack.service;
        if s.container_port == 0 {
            push(format!("stack '{}': service.container_port must be nonzero", name));
        }
        if s.blue_green.listener_port == 0 {
            push(format!(
                "stack '{}': service.blue_green.listener_port must be nonzero",
                name
            ));
        }
        if s.blue_green.port != s.container_port {
            push(format!(
                "stack '{}': blue/green target port {} does not match container port {}",
                name, s.blue_green.port, s.container_port
            ));
        }
        if s.container_name.is_empty() {
            push(format!("stack '{}': service.container_name must not be empty", name));
        }
        if s.cpu == 0 || s.memory_mib == 0 {
            push(format!("stack '{}': service cpu and memory must be nonzero", name));
        }
        let bg_path = &s.blue_green.health_check_path;
        if !is_templated(bg_path) && !bg_path.starts_with('/') {
            push(format!(
                "stack '{}': service.blue_green.health_check_path must start with '/'",
                name
            ));
        }
        if let Some(message) = check_certificate(s.blue_green.protocol, &s.blue_green.certificate_arn) {
            push(format!("stack '{}': service.blue_green: {}", name, message));
        }
    }

    // Pipeline presence
    match (&stack.pipeline, stack.kind.needs_pipeline()) {
        (None, true) => push(format!(
            "stack '{}' ({}) has no pipeline section",
            name, stack.kind
        )),
        (Some(_), false) => push(format!(
            "stack '{}' ({}) does not take a pipeline section",
            name, stack.kind
        )),
        (Some(pipeline), true) => {
            let src = &pipeline.source;
            for (field, value) in [
                ("connection_arn", &src.connection_arn),
                ("owner", &src.owner),
                ("repo", &src.repo),
                ("branch", &src.branch),
            ] {
                if value.trim().is_empty() {
                    push(format!(
                        "stack '{}': pipeline.source.{} must not be empty",
                        name, field
                    ));
                }
            }
            if let Some(build) = &pipeline.build {
                if build.image.trim().is_empty() {
                    push(format!("stack '{}': pipeline.build.image must not be empty", name));
                }
                if build.build.is_empty() {
                    push(format!("stack '{}': pipeline.build has no build commands", name));
                }
            }
            let deploy = &pipeline.deploy;
            if deploy.auto_rollback.deployment_in_alarm && deploy.alarms.is_empty() {
                push(format!(
                    "stack '{}': pipeline.deploy.auto_rollback.deployment_in_alarm needs at least one alarm in pipeline.deploy.alarms",
                    name
                ));
            }
            if deploy.alarms.iter().any(|a| a.trim().is_empty()) {
                push(format!("stack '{}': pipeline.deploy.alarms has an empty name", name));
            }
        }
        (None, false) => {}
    }

    errors
}

fn is_templated(value: &str) -> bool {
    value.contains("{{")
}

fn check_certificate(protocol: Protocol, certificate_arn: &Option<String>) -> Option<String> {
    match (protocol, certificate_arn) {
        (Protocol::Https, None) => Some("HTTPS listener needs certificate_arn".to_string()),
        (Protocol::Http, Some(_)) => {
            Some("certificate_arn is only used with protocol HTTPS".to_string())
        }
        _ => None,
    }
}

fn is_valid_stack_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.len() <= 128
}

fn is_valid_instance_type(instance_type: &str) -> bool {
    match instance_type.split_once('.') {
        Some((family, size)) => {
            !family.is_empty()
                && !size.is_empty()
                && family.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && size.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}
