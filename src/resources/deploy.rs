//! CodeDeploy applications and deployment groups.

use super::{cfn_ref, get_att, CfnResource};
use crate::core::types::AutoRollbackConfig;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputePlatform {
    Server,
    Ecs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub name: Option<String>,
    pub platform: ComputePlatform,
}

impl CfnResource for Application {
    fn cfn_type(&self) -> &'static str {
        "AWS::CodeDeploy::Application"
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "ComputePlatform": match self.platform {
                ComputePlatform::Server => "Server",
                ComputePlatform::Ecs => "ECS",
            },
        });
        if let Some(name) = &self.name {
            props["ApplicationName"] = json!(name);
        }
        props
    }
}

/// What a deployment group rolls out to.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentTarget {
    /// In-place onto the instances of these Auto Scaling Groups
    AutoScaling { groups: Vec<String> },
    /// Blue/green between two target groups behind a production listener
    EcsBlueGreen {
        cluster: String,
        service: String,
        listener: String,
        blue_target_group: String,
        green_target_group: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentGroup {
    pub application: String,
    pub name: Option<String>,
    pub role: String,
    pub target: DeploymentTarget,
    pub deployment_config: String,
    pub auto_rollback: AutoRollbackConfig,
    /// CloudWatch alarm names watched during a deployment
    pub alarms: Vec<String>,
    pub ignore_poll_alarms_failure: bool,
}

impl DeploymentGroup {
    /// CodeDeploy rollback event names for the enabled triggers.
    pub fn rollback_events(&self) -> Vec<&'static str> {
        let mut events = Vec::new();
        if self.auto_rollback.failed_deployment {
            events.push("DEPLOYMENT_FAILURE");
        }
        if self.auto_rollback.stopped_deployment {
            events.push("DEPLOYMENT_STOP_ON_REQUEST");
        }
        if self.auto_rollback.deployment_in_alarm {
            events.push("DEPLOYMENT_STOP_ON_ALARM");
        }
        events
    }
}

impl CfnResource for DeploymentGroup {
    fn cfn_type(&self) -> &'static str {
        "AWS::CodeDeploy::DeploymentGroup"
    }

    fn properties(&self) -> Value {
        let events = self.rollback_events();
        let mut props = json!({
            "ApplicationName": cfn_ref(&self.application),
            "ServiceRoleArn": get_att(&self.role, "Arn"),
            "DeploymentConfigName": self.deployment_config,
            "AutoRollbackConfiguration": {
                "Enabled": !events.is_empty(),
                "Events": events,
            },
            "AlarmConfiguration": {
                "Enabled": !self.alarms.is_empty(),
                "IgnorePollAlarmFailure": self.ignore_poll_alarms_failure,
            },
        });
        if !self.alarms.is_empty() {
            props["AlarmConfiguration"]["Alarms"] =
                self.alarms.iter().map(|name| json!({ "Name": name })).collect();
        }
        if let Some(name) = &self.name {
            props["DeploymentGroupName"] = json!(name);
        }
        match &self.target {
            DeploymentTarget::AutoScaling { groups } => {
                props["AutoScalingGroups"] = groups.iter().map(|g| cfn_ref(g)).collect();
                props["DeploymentStyle"] = json!({
                    "DeploymentType": "IN_PLACE",
                    "DeploymentOption": "WITHOUT_TRAFFIC_CONTROL",
                });
            }
            DeploymentTarget::EcsBlueGreen {
                cluster,
                service,
                listener,
                blue_target_group,
                green_target_group,
            } => {
                props["DeploymentStyle"] = json!({
                    "DeploymentType": "BLUE_GREEN",
                    "DeploymentOption": "WITH_TRAFFIC_CONTROL",
                });
                props["BlueGreenDeploymentConfiguration"] = json!({
                    "DeploymentReadyOption": { "ActionOnTimeout": "CONTINUE_DEPLOYMENT" },
                    "TerminateBlueInstancesOnDeploymentSuccess": {
                        "Action": "TERMINATE",
                        "TerminationWaitTimeInMinutes": 0,
                    },
                });
                props["ECSServices"] = json!([{
                    "ClusterName": cfn_ref(cluster),
                    "ServiceName": get_att(service, "Name"),
                }]);
                props["LoadBalancerInfo"] = json!({
                    "TargetGroupPairInfoList": [{
                        "ProdTrafficRoute": { "ListenerArns": [cfn_ref(listener)] },
                        "TargetGroups": [
                            { "Name": get_att(blue_target_group, "TargetGroupName") },
                            { "Name": get_att(green_target_group, "TargetGroupName") },
                        ],
                    }],
                });
            }
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_group(target: DeploymentTarget) -> DeploymentGroup {
        DeploymentGroup {
            application: "App".to_string(),
            name: Some("ReflexiveJavaDeploymentGroup".to_string()),
            role: "DeploymentGroupRole".to_string(),
            target,
            deployment_config: "CodeDeployDefault.OneAtATime".to_string(),
            auto_rollback: AutoRollbackConfig::default(),
            alarms: Vec::new(),
            ignore_poll_alarms_failure: false,
        }
    }

    #[test]
    fn test_rollback_events_follow_triggers() {
        let mut g = make_group(DeploymentTarget::AutoScaling {
            groups: vec!["Asg".to_string()],
        });
        assert_eq!(
            g.rollback_events(),
            vec!["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_REQUEST"]
        );
        g.auto_rollback = AutoRollbackConfig {
            failed_deployment: false,
            stopped_deployment: false,
            deployment_in_alarm: false,
        };
        let p = g.properties();
        assert_eq!(p["AutoRollbackConfiguration"]["Enabled"], json!(false));
    }

    #[test]
    fn test_alarm_rollback_watches_named_alarms() {
        let mut g = make_group(DeploymentTarget::AutoScaling {
            groups: vec!["Asg".to_string()],
        });
        let p = g.properties();
        assert_eq!(p["AlarmConfiguration"]["Enabled"], json!(false));
        assert!(p["AlarmConfiguration"].get("Alarms").is_none());

        g.auto_rollback.deployment_in_alarm = true;
        g.alarms = vec!["HighLatency".to_string(), "5xxErrors".to_string()];
        let p = g.properties();
        assert_eq!(p["AlarmConfiguration"]["Enabled"], json!(true));
        assert_eq!(
            p["AlarmConfiguration"]["Alarms"],
            json!([{ "Name": "HighLatency" }, { "Name": "5xxErrors" }])
        );
        assert!(p["AutoRollbackConfiguration"]["Events"]
            .as_array()
            .unwrap()
            .contains(&json!("DEPLOYMENT_STOP_ON_ALARM")));
    }

    #[test]
    fn test_server_group_is_in_place() {
        let g = make_group(DeploymentTarget::AutoScaling {
            groups: vec!["Asg".to_string()],
        });
        let p = g.properties();
        assert_eq!(p["DeploymentStyle"]["DeploymentType"], json!("IN_PLACE"));
        assert_eq!(p["AutoScalingGroups"], json!([{"Ref": "Asg"}]));
        assert_eq!(g.references(), vec!["App", "DeploymentGroupRole", "Asg"]);
    }

    #[test]
    fn test_ecs_group_is_blue_green() {
        let g = make_group(DeploymentTarget::EcsBlueGreen {
            cluster: "Cluster".to_string(),
            service: "Service".to_string(),
            listener: "Listener".to_string(),
            blue_target_group: "BlueTargetGroup".to_string(),
            green_target_group: "GreenTargetGroup".to_string(),
        });
        let p = g.properties();
        assert_eq!(p["DeploymentStyle"]["DeploymentType"], json!("BLUE_GREEN"));
        let groups = &p["LoadBalancerInfo"]["TargetGroupPairInfoList"][0]["TargetGroups"];
        assert_eq!(groups[0]["Name"]["Fn::GetAtt"][0], json!("BlueTargetGroup"));
        assert_eq!(groups[1]["Name"]["Fn::GetAtt"][0], json!("GreenTargetGroup"));
    }
}
