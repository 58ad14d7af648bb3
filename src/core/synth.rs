//! Synthesis: render stacks to CloudFormation JSON and write them out.
//!
//! Each stack becomes `<out>/<stack>.template.json`; `<out>/manifest.json`
//! lists every template with its BLAKE3 hash. Files are written atomically
//! (temp file + rename) and only after every stack has passed verification.
//! Output is deterministic: same app file, same bytes.

use super::resolver::build_construct_order;
use super::stack::Stack;
use super::types::ResolvedEnv;
use super::verify::verify;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Index of a synth run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: String,
    pub app: String,
    pub generator: String,
    /// `aws://account/region`
    pub environment: String,
    pub stacks: IndexMap<String, StackArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackArtifact {
    /// Template file name, relative to the manifest
    pub template: String,
    /// `blake3:{hex}` of the template file
    pub hash: String,
    pub resources: usize,
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Render a stack as a CloudFormation template. Resources are emitted in
/// dependency order; explicit dependencies become `DependsOn`.
pub fn render_template(stack: &Stack) -> Result<Value> {
    let order = build_construct_order(stack)?;

    let mut resources = Map::new();
    for id in &order {
        let Some(construct) = stack.get(id) else {
            continue;
        };
        let mut resource = json!({
            "Type": construct.kind.cfn_type(),
            "Properties": construct.kind.properties(),
        });
        if !construct.depends_on.is_empty() {
            resource["DependsOn"] = json!(construct.depends_on);
        }
        resources.insert(id.clone(), resource);
    }

    let mut template = json!({ "AWSTemplateFormatVersion": "2010-09-09" });
    if let Some(desc) = &stack.description {
        template["Description"] = json!(desc);
    }
    template["Resources"] = Value::Object(resources);

    let outputs: Map<String, Value> = stack
        .outputs()
        .map(|(name, output)| {
            let mut out = json!({ "Value": output.value });
            if let Some(desc) = &output.description {
                out["Description"] = json!(desc);
            }
            (name.clone(), out)
        })
        .collect();
    if !outputs.is_empty() {
        template["Outputs"] = Value::Object(outputs);
    }

    Ok(template)
}

/// Pretty JSON with a trailing newline.
pub fn to_json(value: &impl Serialize) -> Result<String> {
    let mut s = serde_json::to_string_pretty(value)?;
    s.push('\n');
    Ok(s)
}

/// Template file name of a stack.
pub fn template_file_name(stack: &str) -> String {
    format!("{}.template.json", stack)
}

/// Write a file atomically (write to temp, then rename).
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| Error::Io {
            action: "create dir",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(|source| Error::Io {
        action: "write",
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| Error::Io {
        action: "rename",
        path: tmp_path,
        source,
    })?;

    Ok(())
}

/// Verify and render one stack to its template body.
pub fn render_stack(stack: &Stack) -> Result<String> {
    verify(stack)?;
    to_json(&render_template(stack)?)
}

fn write_body(stack: &Stack, body: &str, out_dir: &Path) -> Result<StackArtifact> {
    let template = template_file_name(&stack.name);
    let path: PathBuf = out_dir.join(&template);
    write_atomic(&path, body)?;
    debug!(stack = %stack.name, path = %path.display(), "Wrote template");

    Ok(StackArtifact {
        template,
        hash: hash_string(body),
        resources: stack.len(),
    })
}

/// Verify, render and write one stack. Returns its manifest entry.
pub fn write_stack(stack: &Stack, out_dir: &Path) -> Result<StackArtifact> {
    let body = render_stack(stack)?;
    write_body(stack, &body, out_dir)
}

/// Read the manifest of a previous run, if `out_dir` has one.
pub fn read_manifest(out_dir: &Path) -> Result<Option<Manifest>> {
    let path = out_dir.join(MANIFEST_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Io {
                action: "read",
                path,
                source,
            })
        }
    };
    Ok(Some(serde_json::from_str(&content)?))
}

/// Entries of a previous manifest worth carrying over: stacks named in
/// `keep` whose template is still on disk with the recorded hash.
fn carried_entries(app: &str, out_dir: &Path, keep: &[String]) -> IndexMap<String, StackArtifact> {
    if keep.is_empty() {
        return IndexMap::new();
    }
    let previous = match read_manifest(out_dir) {
        Ok(Some(previous)) if previous.app == app => previous,
        Ok(_) => return IndexMap::new(),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable manifest");
            return IndexMap::new();
        }
    };
    previous
        .stacks
        .into_iter()
        .filter(|(name, artifact)| {
            keep.contains(name)
                && std::fs::read_to_string(out_dir.join(&artifact.template))
                    .map(|body| hash_string(&body) == artifact.hash)
                    .unwrap_or(false)
        })
        .collect()
}

/// Write every stack plus the manifest into `out_dir`.
///
/// Every stack is verified and rendered before anything is written, so a
/// failing stack leaves `out_dir` untouched. Stacks named in `keep` that are
/// not written this run keep their entry from the previous manifest while
/// their template on disk still matches it.
pub fn synth_app(
    app: &str,
    stacks: &[Stack],
    out_dir: &Path,
    env: &ResolvedEnv,
    keep: &[String],
) -> Result<Manifest> {
    let bodies = stacks
        .iter()
        .map(|stack| render_stack(stack).map(|body| (stack, body)))
        .collect::<Result<Vec<_>>>()?;

    let mut manifest = Manifest {
        schema: "1.0".to_string(),
        app: app.to_string(),
        generator: format!("stackwright {}", env!("CARGO_PKG_VERSION")),
        environment: env.uri(),
        stacks: carried_entries(app, out_dir, keep),
    };

    for (stack, body) in &bodies {
        let artifact = write_body(stack, body, out_dir)?;
        manifest.stacks.insert(stack.name.clone(), artifact);
    }

    write_atomic(&out_dir.join(MANIFEST_FILE), &to_json(&manifest)?)?;
    info!(
        app = %app,
        written = bodies.len(),
        stacks = manifest.stacks.len(),
        out = %out_dir.display(),
        "Synthesized app"
    );
    Ok(manifest)
}
