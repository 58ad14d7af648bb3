//! Stack: an ordered set of constructs keyed by logical id.

use crate::error::{Error, Result};
use crate::resources::{
    compute, container, deploy, iam, network, pipeline, traffic, CfnResource,
};
use indexmap::IndexMap;
use serde_json::Value;

macro_rules! construct_kinds {
    ($($variant:ident($ty:path)),+ $(,)?) => {
        /// Every resource kind a stack can hold.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ConstructKind {
            $($variant($ty)),+
        }

        $(
            impl From<$ty> for ConstructKind {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )+

        impl ConstructKind {
            fn as_resource(&self) -> &dyn CfnResource {
                match self {
                    $(Self::$variant(v) => v),+
                }
            }
        }
    };
}

construct_kinds! {
    Vpc(network::Vpc),
    Subnet(network::Subnet),
    InternetGateway(network::InternetGateway),
    GatewayAttachment(network::GatewayAttachment),
    RouteTable(network::RouteTable),
    Route(network::Route),
    RouteTableAssociation(network::RouteTableAssociation),
    ElasticIp(network::ElasticIp),
    NatGateway(network::NatGateway),
    Role(iam::Role),
    InstanceProfile(iam::InstanceProfile),
    SecurityGroup(compute::SecurityGroup),
    LaunchTemplate(compute::LaunchTemplate),
    AutoScalingGroup(compute::AutoScalingGroup),
    LoadBalancer(traffic::LoadBalancer),
    Listener(traffic::Listener),
    TargetGroup(traffic::TargetGroup),
    ScalingPolicy(traffic::RequestCountScalingPolicy),
    Cluster(container::Cluster),
    Repository(container::Repository),
    TaskDefinition(container::TaskDefinition),
    FargateService(container::FargateService),
    ArtifactBucket(pipeline::ArtifactBucket),
    Project(pipeline::Project),
    Pipeline(pipeline::Pipeline),
    Application(deploy::Application),
    DeploymentGroup(deploy::DeploymentGroup),
}

impl ConstructKind {
    pub fn cfn_type(&self) -> &'static str {
        self.as_resource().cfn_type()
    }

    pub fn properties(&self) -> Value {
        self.as_resource().properties()
    }

    pub fn references(&self) -> Vec<String> {
        self.as_resource().references()
    }
}

/// A construct placed in a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Construct {
    pub kind: ConstructKind,
    /// Ordering edges not expressed through references
    pub depends_on: Vec<String>,
}

impl Construct {
    /// Every logical id this construct must come after.
    pub fn edges(&self) -> Vec<String> {
        let mut edges = self.kind.references();
        for dep in &self.depends_on {
            if !edges.contains(dep) {
                edges.push(dep.clone());
            }
        }
        edges
    }
}

/// A stack output.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub value: Value,
    pub description: Option<String>,
}

/// A named, independently deployable collection of constructs.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub name: String,
    pub description: Option<String>,
    constructs: IndexMap<String, Construct>,
    outputs: IndexMap<String, Output>,
}

impl Stack {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            constructs: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    /// Place a construct under `id`. Ids are unique within a stack.
    pub fn add(&mut self, id: &str, kind: impl Into<ConstructKind>) -> Result<String> {
        if self.constructs.contains_key(id) {
            return Err(Error::DuplicateId {
                stack: self.name.clone(),
                id: id.to_string(),
            });
        }
        self.constructs.insert(
            id.to_string(),
            Construct {
                kind: kind.into(),
                depends_on: vec![],
            },
        );
        Ok(id.to_string())
    }

    /// Order `id` after `on`. Both must already be in the stack.
    pub fn add_dependency(&mut self, id: &str, on: &str) -> Result<()> {
        if !self.constructs.contains_key(on) {
            return Err(Error::UnknownReference {
                from: id.to_string(),
                to: on.to_string(),
            });
        }
        let construct = self
            .constructs
            .get_mut(id)
            .ok_or_else(|| Error::UnknownReference {
                from: on.to_string(),
                to: id.to_string(),
            })?;
        if !construct.depends_on.iter().any(|d| d == on) {
            construct.depends_on.push(on.to_string());
        }
        Ok(())
    }

    pub fn add_output(&mut self, name: &str, value: Value, description: Option<&str>) {
        self.outputs.insert(
            name.to_string(),
            Output {
                value,
                description: description.map(str::to_string),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&Construct> {
        self.constructs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Construct> {
        self.constructs.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructs.contains_key(id)
    }

    /// Constructs in insertion order.
    pub fn constructs(&self) -> impl Iterator<Item = (&String, &Construct)> {
        self.constructs.iter()
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&String, &Output)> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.constructs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::network::{Subnet, Vpc};
    use serde_json::json;

    fn make_vpc() -> Vpc {
        Vpc {
            name: None,
            cidr: "10.0.0.0/16".to_string(),
        }
    }

    #[test]
    fn test_add_and_get() {
        let mut stack = Stack::new("Test");
        let id = stack.add("Vpc", make_vpc()).unwrap();
        assert_eq!(id, "Vpc");
        assert!(stack.contains("Vpc"));
        assert_eq!(stack.get("Vpc").unwrap().kind.cfn_type(), "AWS::EC2::VPC");
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut stack = Stack::new("Test");
        stack.add("Vpc", make_vpc()).unwrap();
        let err = stack.add("Vpc", make_vpc()).unwrap_err();
        assert!(err.to_string().contains("duplicate construct id 'Vpc'"));
    }

    #[test]
    fn test_edges_merge_references_and_dependencies() {
        let mut stack = Stack::new("Test");
        stack.add("Vpc", make_vpc()).unwrap();
        stack.add("Other", make_vpc()).unwrap();
        stack
            .add(
                "Subnet",
                Subnet {
                    vpc: "Vpc".to_string(),
                    cidr: "10.0.0.0/18".to_string(),
                    az_index: 0,
                    public: true,
                    name: None,
                },
            )
            .unwrap();
        stack.add_dependency("Subnet", "Other").unwrap();
        stack.add_dependency("Subnet", "Other").unwrap();
        stack.add_dependency("Subnet", "Vpc").unwrap();
        let subnet = stack.get("Subnet").unwrap();
        assert_eq!(subnet.depends_on, vec!["Other", "Vpc"]);
        assert_eq!(subnet.edges(), vec!["Vpc", "Other"]);
    }

    #[test]
    fn test_dependency_on_unknown_construct() {
        let mut stack = Stack::new("Test");
        stack.add("Vpc", make_vpc()).unwrap();
        assert!(stack.add_dependency("Vpc", "Ghost").is_err());
        assert!(stack.add_dependency("Ghost", "Vpc").is_err());
    }

    #[test]
    fn test_outputs_keep_order() {
        let mut stack = Stack::new("Test");
        stack.add_output("B", json!("b"), None);
        stack.add_output("A", json!("a"), Some("first"));
        let names: Vec<_> = stack.outputs().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
