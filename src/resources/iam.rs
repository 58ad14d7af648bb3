//! IAM roles and instance profiles.

use super::{cfn_ref, managed_policy_arn, CfnResource};
use serde_json::{json, Value};

/// An allow statement in a role's inline policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    /// ARNs or intrinsic values (`Ref`, `Fn::GetAtt`, `Fn::Join`)
    pub resources: Vec<Value>,
}

impl PolicyStatement {
    pub fn new(actions: &[&str], resources: Vec<Value>) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    fn render(&self) -> Value {
        json!({
            "Effect": "Allow",
            "Action": self.actions,
            "Resource": self.resources,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    /// Service principal, e.g. `ec2.amazonaws.com`
    pub assumed_by: String,
    /// AWS managed policy names (without the ARN prefix)
    pub managed_policies: Vec<String>,
    pub statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn for_service(principal: &str) -> Self {
        Self {
            assumed_by: principal.to_string(),
            managed_policies: vec![],
            statements: vec![],
        }
    }

    pub fn with_managed_policy(mut self, name: &str) -> Self {
        self.managed_policies.push(name.to_string());
        self
    }

    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }
}

impl CfnResource for Role {
    fn cfn_type(&self) -> &'static str {
        "AWS::IAM::Role"
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": self.assumed_by },
                    "Action": "sts:AssumeRole",
                }],
            },
        });
        if !self.managed_policies.is_empty() {
            props["ManagedPolicyArns"] = self
                .managed_policies
                .iter()
                .map(|p| Value::String(managed_policy_arn(p)))
                .collect();
        }
        if !self.statements.is_empty() {
            props["Policies"] = json!([{
                "PolicyName": "default",
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": self.statements.iter().map(PolicyStatement::render).collect::<Vec<_>>(),
                },
            }]);
        }
        props
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProfile {
    pub role: String,
}

impl CfnResource for InstanceProfile {
    fn cfn_type(&self) -> &'static str {
        "AWS::IAM::InstanceProfile"
    }

    fn properties(&self) -> Value {
        json!({ "Roles": [cfn_ref(&self.role)] })
    }
}
