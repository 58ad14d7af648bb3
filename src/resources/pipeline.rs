//! CodePipeline, its stages and actions, the CodeBuild project and the
//! artifact bucket.

use super::{cfn_ref, get_att, CfnResource};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::fmt;

/// Artifact store for pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBucket;

impl CfnResource for ArtifactBucket {
    fn cfn_type(&self) -> &'static str {
        "AWS::S3::Bucket"
    }

    fn properties(&self) -> Value {
        json!({
            "BucketEncryption": {
                "ServerSideEncryptionConfiguration": [{
                    "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" },
                }],
            },
            "PublicAccessBlockConfiguration": {
                "BlockPublicAcls": true,
                "BlockPublicPolicy": true,
                "IgnorePublicAcls": true,
                "RestrictPublicBuckets": true,
            },
        })
    }
}

// ============================================================================
// CodeBuild
// ============================================================================

/// CodeBuild buildspec, version 0.2.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuildSpec {
    pub runtime_versions: IndexMap<String, String>,
    pub pre_build: Vec<String>,
    pub build: Vec<String>,
    pub post_build: Vec<String>,
    pub artifacts: Vec<String>,
}

impl BuildSpec {
    /// Render as the buildspec document. Empty phases are left out.
    pub fn to_value(&self) -> Value {
        let mut phases = serde_json::Map::new();
        if !self.runtime_versions.is_empty() {
            phases.insert(
                "install".to_string(),
                json!({ "runtime-versions": self.runtime_versions }),
            );
        }
        for (phase, commands) in [
            ("pre_build", &self.pre_build),
            ("build", &self.build),
            ("post_build", &self.post_build),
        ] {
            if !commands.is_empty() {
                phases.insert(phase.to_string(), json!({ "commands": commands }));
            }
        }
        let mut spec = json!({ "version": "0.2", "phases": phases });
        if !self.artifacts.is_empty() {
            spec["artifacts"] = json!({ "files": self.artifacts });
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub name: Option<String>,
    pub image: String,
    pub privileged: bool,
    pub role: String,
    pub build_spec: BuildSpec,
}

impl CfnResource for Project {
    fn cfn_type(&self) -> &'static str {
        "AWS::CodeBuild::Project"
    }

    fn properties(&self) -> Value {
        let build_spec = self.build_spec.to_value().to_string();
        let mut props = json!({
            "ServiceRole": get_att(&self.role, "Arn"),
            "Source": { "Type": "CODEPIPELINE", "BuildSpec": build_spec },
            "Artifacts": { "Type": "CODEPIPELINE" },
            "Environment": {
                "Type": "LINUX_CONTAINER",
                "ComputeType": "BUILD_GENERAL1_SMALL",
                "Image": self.image,
                "PrivilegedMode": self.privileged,
            },
        });
        if let Some(name) = &self.name {
            props["Name"] = json!(name);
        }
        props
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Action category, in the order stages must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionCategory {
    Source,
    Build,
    Deploy,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "Source"),
            Self::Build => write!(f, "Build"),
            Self::Deploy => write!(f, "Deploy"),
        }
    }
}

/// A file inside a named artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPath {
    pub artifact: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    CodeStarSource {
        connection_arn: String,
        owner: String,
        repo: String,
        branch: String,
        trigger_on_push: bool,
    },
    CodeBuild {
        project: String,
    },
    /// In-place deploy onto an EC2 deployment group
    CodeDeployServer {
        application: String,
        deployment_group: String,
    },
    /// Blue/green deploy onto an ECS deployment group
    CodeDeployEcs {
        application: String,
        deployment_group: String,
        task_definition_template: ArtifactPath,
        appspec_template: ArtifactPath,
        /// Artifact carrying `imageDetail.json`
        image_artifact: String,
        image_placeholder: String,
    },
}

impl ActionKind {
    pub fn category(&self) -> ActionCategory {
        match self {
            Self::CodeStarSource { .. } => ActionCategory::Source,
            Self::CodeBuild { .. } => ActionCategory::Build,
            Self::CodeDeployServer { .. } | Self::CodeDeployEcs { .. } => ActionCategory::Deploy,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::CodeStarSource { .. } => "CodeStarSourceConnection",
            Self::CodeBuild { .. } => "CodeBuild",
            Self::CodeDeployServer { .. } => "CodeDeploy",
            Self::CodeDeployEcs { .. } => "CodeDeployToECS",
        }
    }

    fn configuration(&self) -> Value {
        match self {
            Self::CodeStarSource {
                connection_arn,
                owner,
                repo,
                branch,
                trigger_on_push,
            } => json!({
                "ConnectionArn": connection_arn,
                "FullRepositoryId": format!("{}/{}", owner, repo),
                "BranchName": branch,
                "DetectChanges": trigger_on_push,
            }),
            Self::CodeBuild { project } => json!({ "ProjectName": cfn_ref(project) }),
            Self::CodeDeployServer {
                application,
                deployment_group,
            } => json!({
                "ApplicationName": cfn_ref(application),
                "DeploymentGroupName": cfn_ref(deployment_group),
            }),
            Self::CodeDeployEcs {
                application,
                deployment_group,
                task_definition_template,
                appspec_template,
                image_artifact,
                image_placeholder,
            } => json!({
                "ApplicationName": cfn_ref(application),
                "DeploymentGroupName": cfn_ref(deployment_group),
                "TaskDefinitionTemplateArtifact": task_definition_template.artifact,
                "TaskDefinitionTemplatePath": task_definition_template.file,
                "AppSpecTemplateArtifact": appspec_template.artifact,
                "AppSpecTemplatePath": appspec_template.file,
                "Image1ArtifactName": image_artifact,
                "Image1ContainerName": image_placeholder,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    /// Input artifact names
    pub inputs: Vec<String>,
    /// Output artifact names
    pub outputs: Vec<String>,
}

impl Action {
    fn render(&self) -> Value {
        let mut action = json!({
            "Name": self.name,
            "ActionTypeId": {
                "Category": self.kind.category().to_string(),
                "Owner": "AWS",
                "Provider": self.kind.provider(),
                "Version": "1",
            },
            "Configuration": self.kind.configuration(),
            "RunOrder": 1,
        });
        if !self.inputs.is_empty() {
            action["InputArtifacts"] = self.inputs.iter().map(|n| json!({ "Name": n })).collect();
        }
        if !self.outputs.is_empty() {
            action["OutputArtifacts"] = self.outputs.iter().map(|n| json!({ "Name": n })).collect();
        }
        action
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    /// Artifacts produced by this stage's actions.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.outputs.iter().map(String::as_str))
    }

    /// Artifacts consumed by this stage's actions.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.inputs.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub role: String,
    pub artifact_bucket: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

impl CfnResource for Pipeline {
    fn cfn_type(&self) -> &'static str {
        "AWS::CodePipeline::Pipeline"
    }

    fn properties(&self) -> Value {
        json!({
            "Name": self.name,
            "RoleArn": get_att(&self.role, "Arn"),
            "ArtifactStore": { "Type": "S3", "Location": cfn_ref(&self.artifact_bucket) },
            "Stages": self.stages.iter().map(|s| json!({
                "Name": s.name,
                "Actions": s.actions.iter().map(Action::render).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_action() -> Action {
        Action {
            name: "Github_Source".to_string(),
            kind: ActionKind::CodeStarSource {
                connection_arn: "arn:aws:codestar-connections:us-east-1:123456789012:connection/abc"
                    .to_string(),
                owner: "ntalbs".to_string(),
                repo: "reflexive-java".to_string(),
                branch: "mainline".to_string(),
                trigger_on_push: true,
            },
            inputs: vec![],
            outputs: vec!["source".to_string()],
        }
    }

    #[test]
    fn test_build_spec_omits_empty_phases() {
        let spec = BuildSpec {
            runtime_versions: IndexMap::from([("java".to_string(), "corretto11".to_string())]),
            build: vec!["./gradlew build".to_string()],
            artifacts: vec!["appspec.yml".to_string()],
            ..Default::default()
        };
        let v = spec.to_value();
        assert_eq!(v["version"], json!("0.2"));
        assert_eq!(v["phases"]["install"]["runtime-versions"]["java"], json!("corretto11"));
        assert_eq!(v["phases"]["build"]["commands"], json!(["./gradlew build"]));
        assert!(v["phases"].get("pre_build").is_none());
        assert_eq!(v["artifacts"]["files"], json!(["appspec.yml"]));
    }

    #[test]
    fn test_project_embeds_build_spec_as_string() {
        let project = Project {
            name: None,
            image: "aws/codebuild/standard:5.0".to_string(),
            privileged: true,
            role: "ProjectRole".to_string(),
            build_spec: BuildSpec {
                build: vec!["docker build -t app .".to_string()],
                ..Default::default()
            },
        };
        let p = project.properties();
        let embedded: Value =
            serde_json::from_str(p["Source"]["BuildSpec"].as_str().unwrap()).unwrap();
        assert_eq!(embedded["phases"]["build"]["commands"][0], json!("docker build -t app ."));
        assert_eq!(p["Environment"]["PrivilegedMode"], json!(true));
        assert_eq!(project.references(), vec!["ProjectRole"]);
    }

    #[test]
    fn test_source_action_render() {
        let a = source_action().render();
        assert_eq!(a["ActionTypeId"]["Category"], json!("Source"));
        assert_eq!(a["ActionTypeId"]["Provider"], json!("CodeStarSourceConnection"));
        assert_eq!(a["Configuration"]["FullRepositoryId"], json!("ntalbs/reflexive-java"));
        assert_eq!(a["OutputArtifacts"], json!([{"Name": "source"}]));
        assert!(a.get("InputArtifacts").is_none());
    }

    #[test]
    fn test_ecs_deploy_configuration() {
        let kind = ActionKind::CodeDeployEcs {
            application: "App".to_string(),
            deployment_group: "Dg".to_string(),
            task_definition_template: ArtifactPath {
                artifact: "build".to_string(),
                file: "taskdef.json".to_string(),
            },
            appspec_template: ArtifactPath {
                artifact: "build".to_string(),
                file: "appspec.yaml".to_string(),
            },
            image_artifact: "build".to_string(),
            image_placeholder: "IMAGE1_NAME".to_string(),
        };
        assert_eq!(kind.category(), ActionCategory::Deploy);
        assert_eq!(kind.provider(), "CodeDeployToECS");
        let c = kind.configuration();
        assert_eq!(c["TaskDefinitionTemplatePath"], json!("taskdef.json"));
        assert_eq!(c["Image1ArtifactName"], json!("build"));
    }

    #[test]
    fn test_pipeline_render_and_references() {
        let pipeline = Pipeline {
            name: "ReflexiveJavaPipeline".to_string(),
            role: "PipelineRole".to_string(),
            artifact_bucket: "PipelineArtifactsBucket".to_string(),
            stages: vec![
                Stage {
                    name: "Source".to_string(),
                    actions: vec![source_action()],
                },
                Stage {
                    name: "Build".to_string(),
                    actions: vec![Action {
                        name: "BuildAction".to_string(),
                        kind: ActionKind::CodeBuild {
                            project: "Project".to_string(),
                        },
                        inputs: vec!["source".to_string()],
                        outputs: vec!["build".to_string()],
                    }],
                },
            ],
        };
        assert_eq!(pipeline.stage_names(), vec!["Source", "Build"]);
        assert_eq!(pipeline.stages[1].inputs().collect::<Vec<_>>(), vec!["source"]);
        let p = pipeline.properties();
        assert_eq!(p["Stages"][1]["Actions"][0]["Configuration"]["ProjectName"], json!({"Ref": "Project"}));
        assert_eq!(
            pipeline.references(),
            vec!["PipelineRole", "PipelineArtifactsBucket", "Project"]
        );
    }

    #[test]
    fn test_action_category_order() {
        assert!(ActionCategory::Source < ActionCategory::Build);
        assert!(ActionCategory::Build < ActionCategory::Deploy);
    }
}
