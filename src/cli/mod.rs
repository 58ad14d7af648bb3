//! CLI subcommands: init, validate, list, plan, synth.

use crate::core::stack::Stack;
use crate::core::{assembly, parser, resolver, synth, types, verify};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stackwright project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stackwright.yaml without assembling stacks
    Validate {
        /// Path to stackwright.yaml
        #[arg(short, long, default_value = "stackwright.yaml")]
        file: PathBuf,
    },

    /// List declared stacks and their kinds
    List {
        /// Path to stackwright.yaml
        #[arg(short, long, default_value = "stackwright.yaml")]
        file: PathBuf,
    },

    /// Show each stack's resources in deployment order
    Plan {
        /// Path to stackwright.yaml
        #[arg(short, long, default_value = "stackwright.yaml")]
        file: PathBuf,

        /// Target specific stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Write CloudFormation templates and a manifest
    Synth {
        /// Path to stackwright.yaml
        #[arg(short, long, default_value = "stackwright.yaml")]
        file: PathBuf,

        /// Target specific stack; the others keep their manifest entries
        #[arg(short, long)]
        stack: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = "stackwright.out")]
        out: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::List { file } => cmd_list(&file),
        Commands::Plan { file, stack } => cmd_plan(&file, stack.as_deref()),
        Commands::Synth { file, stack, out } => cmd_synth(&file, stack.as_deref(), &out),
    }
}

const STARTER: &str = r#"version: "1.0"
name: my-app
description: "Managed by stackwright"

params: {}

# Falls back to CDK_DEFAULT_ACCOUNT / CDK_DEFAULT_REGION when unset
env: {}

stacks:
  WebStack:
    kind: ec2_service
    compute:
      instance_type: t2.micro
      min_capacity: 1
      desired_capacity: 1
      max_capacity: 1
    traffic:
      listener_port: 80
      target_port: 3000
      health_check_path: /ping

  # WebPipelineStack:
  #   kind: ec2_pipeline
  #   pipeline:
  #     source:
  #       connection_arn: arn:aws:codestar-connections:REGION:ACCOUNT:connection/ID
  #       owner: my-org
  #       repo: my-repo
  #       branch: main
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("stackwright.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    std::fs::create_dir_all(path)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, STARTER)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized stackwright project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!("OK: {} ({} stacks)", config.name, config.stacks.len());
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a stackwright config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::AppConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

/// Assemble the selected stacks (all of them without a filter).
fn assemble(
    config: &types::AppConfig,
    env: &types::ResolvedEnv,
    stack_filter: Option<&str>,
) -> Result<Vec<Stack>, String> {
    if let Some(name) = stack_filter {
        if !config.stacks.contains_key(name) {
            return Err(format!("unknown stack '{}'", name));
        }
    }
    let mut stacks = Vec::new();
    for (name, cfg) in &config.stacks {
        if stack_filter.is_some_and(|f| f != name.as_str()) {
            continue;
        }
        stacks.push(assembly::build_stack(name, cfg, env, &config.params)?);
    }
    Ok(stacks)
}

fn cmd_list(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    println!("{}: {} stacks", config.name, config.stacks.len());
    for (name, stack) in &config.stacks {
        match &stack.description {
            Some(desc) => println!("  {} ({}): {}", name, stack.kind, desc),
            None => println!("  {} ({})", name, stack.kind),
        }
    }
    Ok(())
}

/// One line per resource, in deployment order.
fn plan_lines(stack: &Stack) -> Result<Vec<String>, String> {
    let order = resolver::build_construct_order(stack)?;
    Ok(order
        .iter()
        .filter_map(|id| stack.get(id).map(|c| (id, c)))
        .map(|(id, c)| {
            if c.depends_on.is_empty() {
                format!("+ {} ({})", id, c.kind.cfn_type())
            } else {
                format!(
                    "+ {} ({}) after {}",
                    id,
                    c.kind.cfn_type(),
                    c.depends_on.join(", ")
                )
            }
        })
        .collect())
}

fn cmd_plan(file: &Path, stack_filter: Option<&str>) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let env = config.env.resolve();
    let stacks = assemble(&config, &env, stack_filter)?;

    println!("Planning: {} ({})", config.name, env.uri());
    let mut total = 0;
    for stack in &stacks {
        verify::verify(stack)?;
        println!();
        println!("{} ({} resources):", stack.name, stack.len());
        for line in plan_lines(stack)? {
            println!("  {}", line);
        }
        for (name, _) in stack.outputs() {
            println!("  > output {}", name);
        }
        total += stack.len();
    }

    println!();
    println!("Plan: {} stacks, {} resources.", stacks.len(), total);
    Ok(())
}

fn cmd_synth(file: &Path, stack_filter: Option<&str>, out: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let env = config.env.resolve();
    let stacks = assemble(&config, &env, stack_filter)?;

    // Stacks left out by the filter keep their manifest entries
    let keep: Vec<String> = config
        .stacks
        .keys()
        .filter(|name| stacks.iter().all(|s| &s.name != *name))
        .cloned()
        .collect();
    let manifest = synth::synth_app(&config.name, &stacks, out, &env, &keep)?;
    for (name, artifact) in &manifest.stacks {
        println!(
            "{}: {} resources → {} ({})",
            name,
            artifact.resources,
            out.join(&artifact.template).display(),
            artifact.hash
        );
    }
    println!(
        "Synthesized {} stacks into {}",
        manifest.stacks.len(),
        out.display()
    );
    Ok(())
}
