//! Command-line interface for the Crucible knowledge refinery.

mod config;
mod workflow_file;

pub use config::{build_registry, CrucibleConfig};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crucible_engine::{ModelDiscovery, RunRequest, WorkflowEngine};
use crucible_store::{
    new_id, ForensicStore, GrantEffect, GranteeKind, MetricsStore, ModelGrant, TreeStore,
    WorkflowStatus,
};

#[derive(Parser)]
#[command(name = "crucible", about = "Refine claims through LLM workflow pipelines")]
struct Cli {
    /// Path to a configuration file (defaults to ./crucible.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow against a body of text or a tree node.
    Run {
        /// Workflow name.
        workflow: String,
        /// Claim text to refine. Defaults to the body of --node.
        #[arg(long)]
        body: Option<String>,
        #[arg(long, default_value = "local")]
        user: String,
        #[arg(long, default_value = "member")]
        role: String,
        /// Instance-level pre-prompt override.
        #[arg(long)]
        pre_prompt: Option<String>,
        /// Tree node this run refines.
        #[arg(long)]
        node: Option<String>,
    },
    /// Record a claim (or piece) in the proof tree.
    Claim {
        body: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value = "claim")]
        node_type: String,
        #[arg(long, default_value = "local")]
        author: String,
    },
    /// Vote on a tree node.
    Vote {
        node_id: String,
        /// Vote down instead of up.
        #[arg(long)]
        down: bool,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Show a run's status and result.
    Status { run_id: String },
    /// Show a run's step runs.
    Steps { run_id: String },
    /// Show a run's audit trail.
    Audit { run_id: String },
    /// List workflows.
    Workflows,
    /// Import a workflow definition from a JSON file.
    Import {
        path: String,
        /// Activate immediately instead of leaving it in draft.
        #[arg(long)]
        activate: bool,
    },
    /// List the model catalogue.
    Models,
    /// Run a model discovery sweep.
    Discover,
    /// List model grants.
    Grants,
    /// Add a model grant.
    Grant {
        /// allow or deny.
        effect: String,
        /// Grantee, e.g. user:alice or role:operator.
        #[arg(long)]
        grantee: String,
        /// Model pattern: <provider>/<name>, <provider>/*, or *.
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "*")]
        step_kind: String,
    },
}

/// CLI entry point.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CrucibleConfig::load(cli.config.as_deref())?;
    let store = ForensicStore::open(&config.stores.forensic_path)?;
    let tree = TreeStore::open(&config.stores.tree_path)?;
    let metrics = MetricsStore::open(&config.stores.metrics_path)?;
    let registry = Arc::new(build_registry(&config));

    match cli.command {
        Command::Run {
            workflow,
            body,
            user,
            role,
            pre_prompt,
            node,
        } => {
            let body = match (body, node.as_deref()) {
                (Some(body), _) => body,
                (None, Some(node_id)) => tree
                    .get_node(node_id)?
                    .with_context(|| format!("node {node_id} not found"))?
                    .body,
                (None, None) => anyhow::bail!("provide --body or --node"),
            };

            let engine = WorkflowEngine::new(store.clone(), metrics, registry)?;
            let definition = store.get_workflow_by_name(&workflow)?;

            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, cancelling run");
                    signal_token.cancel();
                }
            });

            let run_id = engine
                .execute(
                    RunRequest {
                        workflow_id: definition.id,
                        node_id: node,
                        user_id: user,
                        role,
                        pre_prompt,
                        body,
                        batch_id: None,
                    },
                    cancel,
                )
                .await?;

            let view = store.get_run_view(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Claim {
            body,
            parent,
            node_type,
            author,
        } => {
            let node = crucible_store::TreeNode {
                id: new_id(),
                parent_id: parent,
                node_type,
                body,
                visibility: "public".into(),
                author_id: author,
                created_at: chrono::Utc::now(),
            };
            tree.insert_node(&node)?;
            println!("recorded node {}", node.id);
        }
        Command::Vote {
            node_id,
            down,
            user,
        } => {
            let vote = crucible_store::Vote {
                id: new_id(),
                node_id: node_id.clone(),
                user_id: user,
                value: if down { -1 } else { 1 },
                created_at: chrono::Utc::now(),
            };
            tree.insert_vote(&vote)?;
            println!("node {} total is now {}", node_id, tree.vote_total(&node_id)?);
        }
        Command::Status { run_id } => {
            let view = store.get_run_view(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Steps { run_id } => {
            let views = store.list_step_run_views(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Command::Audit { run_id } => {
            let events = store.list_audit(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Workflows => {
            let workflows = store.list_workflows()?;
            for workflow in workflows {
                println!(
                    "{}  {}  v{}  {}",
                    workflow.id,
                    workflow.status.as_str(),
                    workflow.version,
                    workflow.name
                );
            }
        }
        Command::Import { path, activate } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            let spec: workflow_file::WorkflowFile =
                serde_json::from_str(&raw).context("invalid workflow file")?;
            let (workflow, steps) = spec.into_records()?;
            let id = workflow.id.clone();
            let name = workflow.name.clone();
            store.insert_workflow(&workflow, &steps)?;
            if activate {
                store.update_workflow_status(&id, WorkflowStatus::Active, Some("import"), None)?;
            }
            println!("imported workflow {name} as {id}");
        }
        Command::Models => {
            for model in store.list_models()? {
                println!(
                    "{}  available={}  owner={}",
                    model.id,
                    model.available,
                    model.owner_id.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Discover => {
            let discovery = ModelDiscovery::new(store.clone(), registry);
            let count = discovery.sweep().await?;
            println!("discovered {count} models");
        }
        Command::Grants => {
            for grant in store.list_grants()? {
                println!(
                    "{}  {}:{}  {}  {}  {}",
                    grant.id,
                    grant.grantee_kind.as_str(),
                    grant.grantee_id,
                    grant.model,
                    grant.step_kind,
                    grant.effect.as_str()
                );
            }
        }
        Command::Grant {
            effect,
            grantee,
            model,
            step_kind,
        } => {
            let effect = GrantEffect::parse(&effect)?;
            let (kind, grantee_id) = parse_grantee(&grantee)?;
            let grant = ModelGrant {
                id: new_id(),
                grantee_kind: kind,
                grantee_id: grantee_id.to_string(),
                model,
                step_kind,
                effect,
                created_by: "cli".into(),
                created_at: chrono::Utc::now(),
            };
            store.insert_grant(&grant)?;
            println!("created grant {}", grant.id);
        }
    }

    Ok(())
}

fn parse_grantee(value: &str) -> anyhow::Result<(GranteeKind, &str)> {
    match value.split_once(':') {
        Some(("user", id)) if !id.is_empty() => Ok((GranteeKind::User, id)),
        Some(("role", id)) if !id.is_empty() => Ok((GranteeKind::Role, id)),
        _ => anyhow::bail!("grantee must look like user:<id> or role:<id>, got {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grantee() {
        assert!(matches!(
            parse_grantee("user:alice").unwrap(),
            (GranteeKind::User, "alice")
        ));
        assert!(matches!(
            parse_grantee("role:operator").unwrap(),
            (GranteeKind::Role, "operator")
        ));
        assert!(parse_grantee("alice").is_err());
        assert!(parse_grantee("user:").is_err());
    }
}
