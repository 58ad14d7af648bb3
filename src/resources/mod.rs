//! Construct descriptors: one typed struct per CloudFormation resource.
//!
//! Each descriptor knows:
//! 1. its CloudFormation type
//! 2. how to render its `Properties` block
//! 3. which other constructs (by logical id) it references

use serde_json::{json, Value};

pub mod compute;
pub mod container;
pub mod deploy;
pub mod iam;
pub mod network;
pub mod pipeline;
pub mod traffic;

/// A resource that can be placed in a stack and rendered to CloudFormation.
pub trait CfnResource {
    /// CloudFormation resource type, e.g. `AWS::EC2::VPC`.
    fn cfn_type(&self) -> &'static str;

    /// The `Properties` block.
    fn properties(&self) -> Value;

    /// Logical ids this resource points at through `Ref` / `Fn::GetAtt`.
    fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        collect_refs(&self.properties(), &mut refs);
        refs
    }
}

/// Walk a rendered value and collect every logical id it references.
/// Pseudo parameters (`AWS::Region`, ...) are skipped. Order is first
/// occurrence; duplicates are dropped.
pub fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(id)) = map.get("Ref") {
                push_ref(id, out);
            }
            if let Some(Value::Array(parts)) = map.get("Fn::GetAtt") {
                if let Some(Value::String(id)) = parts.first() {
                    push_ref(id, out);
                }
            }
            for v in map.values() {
                collect_refs(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_refs(v, out);
            }
        }
        _ => {}
    }
}

fn push_ref(id: &str, out: &mut Vec<String>) {
    if !id.starts_with("AWS::") && !out.iter().any(|r| r == id) {
        out.push(id.to_string());
    }
}

/// `{"Ref": id}`
pub fn cfn_ref(id: &str) -> Value {
    json!({ "Ref": id })
}

/// `{"Fn::GetAtt": [id, attr]}`
pub fn get_att(id: &str, attr: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attr] })
}

/// A `Name` tag list, or an empty list.
pub fn name_tags(name: Option<&str>) -> Value {
    match name {
        Some(n) => json!([{ "Key": "Name", "Value": n }]),
        None => json!([]),
    }
}

/// ARN of an AWS managed IAM policy.
pub fn managed_policy_arn(name: &str) -> String {
    format!("arn:aws:iam::aws:policy/{}", name)
}
