//! EC2 fleet: security groups, launch template, Auto Scaling Group.

use super::{cfn_ref, get_att, CfnResource};
use crate::core::types::MachineImage;
use serde_json::{json, Value};

/// Where an ingress rule admits traffic from.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressSource {
    Cidr(String),
    /// Another security group, by logical id
    SecurityGroup(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub source: IngressSource,
    pub port: u16,
    pub description: String,
}

impl IngressRule {
    fn render(&self) -> Value {
        let mut rule = json!({
            "IpProtocol": "tcp",
            "FromPort": self.port,
            "ToPort": self.port,
            "Description": self.description,
        });
        match &self.source {
            IngressSource::Cidr(cidr) => rule["CidrIp"] = json!(cidr),
            IngressSource::SecurityGroup(id) => {
                rule["SourceSecurityGroupId"] = get_att(id, "GroupId")
            }
        }
        rule
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroup {
    pub vpc: String,
    pub description: String,
    pub ingress: Vec<IngressRule>,
}

impl SecurityGroup {
    /// Whether any ingress rule admits `port`.
    pub fn allows_port(&self, port: u16) -> bool {
        self.ingress.iter().any(|r| r.port == port)
    }
}

impl CfnResource for SecurityGroup {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::SecurityGroup"
    }

    fn properties(&self) -> Value {
        json!({
            "GroupDescription": self.description,
            "VpcId": cfn_ref(&self.vpc),
            "SecurityGroupIngress": self.ingress.iter().map(IngressRule::render).collect::<Vec<_>>(),
            "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchTemplate {
    pub image: MachineImage,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub instance_profile: String,
    pub security_group: String,
    /// Shell commands, run in order at first boot
    pub user_data: Vec<String>,
}

impl LaunchTemplate {
    /// `#!/bin/bash` script assembled from the user-data commands.
    pub fn user_data_script(&self) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for cmd in &self.user_data {
            script.push_str(cmd);
            script.push('\n');
        }
        script
    }
}

impl CfnResource for LaunchTemplate {
    fn cfn_type(&self) -> &'static str {
        "AWS::EC2::LaunchTemplate"
    }

    fn properties(&self) -> Value {
        let mut data = json!({
            "ImageId": format!("{{{{resolve:ssm:{}}}}}", self.image.ssm_parameter()),
            "InstanceType": self.instance_type,
            "IamInstanceProfile": { "Arn": get_att(&self.instance_profile, "Arn") },
            "SecurityGroupIds": [get_att(&self.security_group, "GroupId")],
            "UserData": { "Fn::Base64": self.user_data_script() },
        });
        if let Some(key) = &self.key_name {
            data["KeyName"] = json!(key);
        }
        json!({ "LaunchTemplateData": data })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoScalingGroup {
    pub launch_template: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub desired_capacity: u32,
    pub subnets: Vec<String>,
    pub target_groups: Vec<String>,
    /// Port the instances serve on; not rendered, checked against the
    /// target groups that front this fleet
    pub service_port: u16,
}

impl CfnResource for AutoScalingGroup {
    fn cfn_type(&self) -> &'static str {
        "AWS::AutoScaling::AutoScalingGroup"
    }

    fn properties(&self) -> Value {
        json!({
            "LaunchTemplate": {
                "LaunchTemplateId": cfn_ref(&self.launch_template),
                "Version": get_att(&self.launch_template, "LatestVersionNumber"),
            },
            "MinSize": self.min_capacity.to_string(),
            "MaxSize": self.max_capacity.to_string(),
            "DesiredCapacity": self.desired_capacity.to_string(),
            "VPCZoneIdentifier": self.subnets.iter().map(|s| cfn_ref(s)).collect::<Vec<_>>(),
            "TargetGroupARNs": self.target_groups.iter().map(|t| cfn_ref(t)).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_template() -> LaunchTemplate {
        LaunchTemplate {
            image: MachineImage::AmazonLinux2,
            instance_type: "t2.micro".to_string(),
            key_name: Some("stackulus".to_string()),
            instance_profile: "AsgInstanceProfile".to_string(),
            security_group: "AsgSecurityGroup".to_string(),
            user_data: vec!["sudo yum -y update".to_string()],
        }
    }

    #[test]
    fn test_launch_template_resolves_ami_from_ssm() {
        let p = make_template().properties();
        assert_eq!(
            p["LaunchTemplateData"]["ImageId"],
            json!("{{resolve:ssm:/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2}}")
        );
        assert_eq!(p["LaunchTemplateData"]["KeyName"], json!("stackulus"));
    }

    #[test]
    fn test_user_data_script() {
        let script = make_template().user_data_script();
        assert_eq!(script, "#!/bin/bash\nsudo yum -y update\n");
    }

    #[test]
    fn test_launch_template_references() {
        assert_eq!(
            make_template().references(),
            vec!["AsgInstanceProfile", "AsgSecurityGroup"]
        );
    }

    #[test]
    fn test_asg_capacity_rendered_as_strings() {
        let asg = AutoScalingGroup {
            launch_template: "AsgLaunchTemplate".to_string(),
            min_capacity: 1,
            max_capacity: 3,
            desired_capacity: 2,
            subnets: vec!["VpcPrivateSubnet1".to_string()],
            target_groups: vec!["AlbListenerTarget".to_string()],
            service_port: 3000,
        };
        let p = asg.properties();
        assert_eq!(p["MinSize"], json!("1"));
        assert_eq!(p["MaxSize"], json!("3"));
        assert_eq!(p["DesiredCapacity"], json!("2"));
        assert_eq!(
            asg.references(),
            vec!["AsgLaunchTemplate", "VpcPrivateSubnet1", "AlbListenerTarget"]
        );
    }

    #[test]
    fn test_security_group_ingress() {
        let sg = SecurityGroup {
            vpc: "Vpc".to_string(),
            description: "instances".to_string(),
            ingress: vec![IngressRule {
                source: IngressSource::SecurityGroup("AlbSecurityGroup".to_string()),
                port: 3000,
                description: "Load balancer to target".to_string(),
            }],
        };
        let p = sg.properties();
        assert_eq!(p["SecurityGroupIngress"][0]["FromPort"], json!(3000));
        assert!(sg.allows_port(3000));
        assert!(!sg.allows_port(80));
        assert_eq!(sg.references(), vec!["Vpc", "AlbSecurityGroup"]);
    }
}
