//! Lanekeeper: two-lane delivery governance for repository portfolios.
//!
//! **Lane A (Knowledge)** indexes a portfolio of git repositories, evidences
//! what it finds, synthesizes a versioned System-of-Record, and gates
//! delivery on its freshness and sufficiency. **Lane B (Delivery)** turns
//! intake into repo-scoped work items; its only coupling to Lane A is
//! governance enforcement at triage time.
//!
//! # Pipeline
//!
//! ```bash
//! # Index every active repo at its branch head
//! lanekeeper index
//!
//! # Approve the dependency graph, then scan and synthesize
//! lanekeeper graph approve --by operator
//! lanekeeper scan
//! lanekeeper synthesize
//!
//! # Evaluate freshness, record sufficiency, seal a bundle
//! lanekeeper staleness
//! lanekeeper sufficiency approve --scope system --by operator
//! lanekeeper bundle --scope system
//!
//! # Lane B: log merges and triage intake
//! lanekeeper events log --repo-id svc-a --pr-number 42 --merge-commit-sha <sha>
//! lanekeeper triage
//! ```
//!
//! # Invariants
//!
//! - Every fact cites evidence refs that exist and re-hash cleanly.
//! - Bundles are reproducible: unchanged Knowledge yields the identical
//!   `bundle_id` (volatile timestamps are normalized before hashing).
//! - Guards never mutate knowledge; refusals always leave an artifact and a
//!   ledger line.
//!
//! # Crate structure
//!
//! - [`core`]: atomic I/O, canonical JSON, sandbox, lock, pool, git adapter
//! - [`knowledge`]: Lane A pipeline (index -> scan -> synthesize -> bundle)
//! - [`events`]: merge-event log producer, summary, checkpoints
//! - [`delivery`]: Lane B intake triage and the governance gate

pub mod core;
pub mod delivery;
pub mod events;
pub mod knowledge;

use crate::core::error::LanekeeperError;
use crate::core::layout::{KnowledgePaths, OpsPaths, ProjectConfig};
use crate::core::pool;
use crate::core::time;
use crate::events::log::MergeEventInput;
use crate::events::summary;
use crate::knowledge::bundle::{self, BundleOptions};
use crate::knowledge::graph;
use crate::knowledge::indexer;
use crate::knowledge::qa;
use crate::knowledge::registry::RepoRegistry;
use crate::knowledge::scan::{self, ScanOptions};
use crate::knowledge::staleness::{self, StaleOverride, StalenessConfig};
use crate::knowledge::sufficiency::{self, SufficiencyStatus};
use crate::knowledge::synthesize;
use crate::knowledge::version::{self, BumpKind};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

#[derive(Parser, Debug)]
#[clap(
    name = "lanekeeper",
    version = env!("CARGO_PKG_VERSION"),
    about = "Two-lane delivery governance: knowledge indexing, freshness gates, merge audit"
)]
struct Cli {
    /// OPS root (absolute path ending in /ops); defaults to AI_PROJECT_ROOT.
    #[clap(long, global = true)]
    ops_root: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index active repos: fingerprints and structural discovery
    #[clap(name = "index")]
    Index(IndexCli),

    /// Scan repos into evidence-bounded facts
    #[clap(name = "scan")]
    Scan(ScanCli),

    /// Roll repo scans into the system integration view
    #[clap(name = "synthesize")]
    Synthesize,

    /// Evaluate freshness and persist staleness.json
    #[clap(name = "staleness")]
    Staleness(StalenessCli),

    /// Knowledge version pointer
    #[clap(name = "version")]
    Version(VersionCli),

    /// Sufficiency records per (scope, knowledge version)
    #[clap(name = "sufficiency")]
    Sufficiency(SufficiencyCli),

    /// Build a manifest-sealed knowledge bundle
    #[clap(name = "bundle")]
    Bundle(BundleCli),

    /// Merge-event log: producer, summary, checkpoints
    #[clap(name = "events")]
    Events(EventsCli),

    /// Dependency graph and its approval gate
    #[clap(name = "graph")]
    Graph(GraphCli),

    /// Triage Lane B intake into repo-scoped work items
    #[clap(name = "triage")]
    Triage(TriageCli),

    /// QA-pack maintenance
    #[clap(name = "qa")]
    Qa(QaCli),
}

#[derive(clap::Args, Debug)]
struct IndexCli {
    /// Index exactly one repo
    #[clap(long)]
    repo_id: Option<String>,
    /// Worker pool width (clamped to 1..=32)
    #[clap(long, default_value_t = pool::DEFAULT_JOBS)]
    jobs: usize,
}

#[derive(clap::Args, Debug)]
struct ScanCli {
    /// Scan exactly one repo
    #[clap(long)]
    repo_id: Option<String>,
    /// Worker pool width (clamped to 1..=32)
    #[clap(long, default_value_t = pool::DEFAULT_JOBS)]
    jobs: usize,
    /// Bypass the dependency-graph approval gate
    #[clap(long)]
    force_deps: bool,
}

#[derive(clap::Args, Debug)]
struct StalenessCli {
    /// Evaluate a single scope (system or repo:<id>) instead of all
    #[clap(long)]
    scope: Option<String>,
}

#[derive(clap::Args, Debug)]
struct VersionCli {
    #[clap(subcommand)]
    command: VersionCommand,
}

#[derive(Subcommand, Debug)]
enum VersionCommand {
    /// Show the current pointer and recent history
    Show,
    /// Bump the pointer (major, minor, patch)
    Bump {
        #[clap(long)]
        kind: String,
        #[clap(long)]
        reason: String,
        #[clap(long, default_value = "system")]
        scope: String,
    },
    /// Set an explicit version
    Set {
        #[clap(long)]
        to: String,
        #[clap(long)]
        reason: String,
        #[clap(long, default_value = "system")]
        scope: String,
    },
}

#[derive(clap::Args, Debug)]
struct SufficiencyCli {
    #[clap(subcommand)]
    command: SufficiencyCommand,
}

#[derive(Subcommand, Debug)]
enum SufficiencyCommand {
    /// Show the record for (scope, version)
    Show {
        #[clap(long)]
        scope: String,
        /// Defaults to the current knowledge version
        #[clap(long)]
        knowledge_version: Option<String>,
    },
    /// Record insufficient/partial for a scope
    Set {
        #[clap(long)]
        scope: String,
        #[clap(long)]
        status: String,
        #[clap(long)]
        knowledge_version: Option<String>,
        #[clap(long)]
        reason: Option<String>,
    },
    /// The deliberate approval step that makes a scope sufficient
    Approve {
        #[clap(long)]
        scope: String,
        #[clap(long)]
        by: String,
        #[clap(long)]
        knowledge_version: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct BundleCli {
    /// Scope: system or repo:<id>
    #[clap(long)]
    scope: String,
    /// Output base; must lie within <lane_a>/bundles
    #[clap(long)]
    out_base: Option<PathBuf>,
    /// Proceed despite staleness (requires --by and --reason)
    #[clap(long)]
    force_stale_override: bool,
    #[clap(long)]
    by: Option<String>,
    #[clap(long)]
    reason: Option<String>,
}

#[derive(clap::Args, Debug)]
struct EventsCli {
    #[clap(subcommand)]
    command: EventsCommand,
}

#[derive(Subcommand, Debug)]
enum EventsCommand {
    /// Append a merge event to the current segment
    Log {
        #[clap(long)]
        repo_id: String,
        #[clap(long)]
        pr_number: u64,
        #[clap(long)]
        merge_commit_sha: String,
        #[clap(long, default_value = "main")]
        base_branch: String,
        /// RFC3339; defaults to now
        #[clap(long)]
        timestamp: Option<String>,
        /// Derive affected paths from the local clone (diff-tree fallback)
        #[clap(long)]
        derive_paths: bool,
        #[clap(long)]
        dry_run: bool,
    },
    /// Rebuild the latest-per-repo summary
    Summary,
    /// Consumer checkpoints
    Checkpoint {
        #[clap(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// Show a consumer's checkpoint
    Show {
        #[clap(long)]
        consumer: String,
    },
    /// Advance a consumer's checkpoint past everything read so far
    Advance {
        #[clap(long)]
        consumer: String,
    },
}

#[derive(clap::Args, Debug)]
struct GraphCli {
    #[clap(subcommand)]
    command: GraphCommand,
}

#[derive(Subcommand, Debug)]
enum GraphCommand {
    /// Print the effective (base + override) graph
    Show,
    /// Approve the current override
    Approve {
        #[clap(long)]
        by: String,
    },
}

#[derive(clap::Args, Debug)]
struct TriageCli {
    /// Triage one intake file instead of the whole inbox
    #[clap(long)]
    file: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct QaCli {
    #[clap(subcommand)]
    command: QaCommand,
}

#[derive(Subcommand, Debug)]
enum QaCommand {
    /// Merge committee invariant outputs into the QA pack
    Update,
}

/// Resolved project context shared by every command.
struct Context {
    ops: OpsPaths,
    knowledge: KnowledgePaths,
    repos_root: PathBuf,
    #[allow(dead_code)]
    config: ProjectConfig,
}

impl Context {
    fn resolve(ops_root: Option<&Path>) -> Result<Context, LanekeeperError> {
        let ops = match ops_root {
            Some(root) => OpsPaths::new(root)?,
            None => OpsPaths::from_env()?,
        };
        let config = ops.load_project_config()?;
        let knowledge = KnowledgePaths::from_config(&ops, &config);
        let repos_root = ops.resolve(&config.repos_root);
        Ok(Context {
            ops,
            knowledge,
            repos_root,
            config,
        })
    }

    fn registry(&self) -> Result<RepoRegistry, LanekeeperError> {
        RepoRegistry::load(&self.ops)
    }
}

pub fn run() -> Result<(), LanekeeperError> {
    let cli = Cli::parse();
    let ctx = Context::resolve(cli.ops_root.as_deref())?;

    match cli.command {
        Command::Index(index_cli) => run_index_command(&ctx, index_cli),
        Command::Scan(scan_cli) => run_scan_command(&ctx, scan_cli),
        Command::Synthesize => run_synthesize_command(&ctx),
        Command::Staleness(staleness_cli) => run_staleness_command(&ctx, staleness_cli),
        Command::Version(version_cli) => run_version_command(&ctx, version_cli),
        Command::Sufficiency(sufficiency_cli) => run_sufficiency_command(&ctx, sufficiency_cli),
        Command::Bundle(bundle_cli) => run_bundle_command(&ctx, bundle_cli),
        Command::Events(events_cli) => run_events_command(&ctx, events_cli),
        Command::Graph(graph_cli) => run_graph_command(&ctx, graph_cli),
        Command::Triage(triage_cli) => run_triage_command(&ctx, triage_cli),
        Command::Qa(qa_cli) => match qa_cli.command {
            QaCommand::Update => {
                let update = qa::run_qa_pack_update(&ctx.knowledge)?;
                println!(
                    "qa: committed={} invariants={}",
                    update.committed, update.invariant_count
                );
                Ok(())
            }
        },
    }
}

fn run_index_command(ctx: &Context, cli: IndexCli) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let targets: Vec<_> = match &cli.repo_id {
        Some(id) => vec![registry.require_active(id)?],
        None => registry.active_repos(),
    };
    let sibling_ids: Vec<String> = registry
        .repos
        .iter()
        .map(|r| r.repo_id.clone())
        .collect();

    let cancel = AtomicBool::new(false);
    let results = pool::run_pool(&targets, cli.jobs, &cancel, |repo, _| {
        let outcome = indexer::index_repo(
            repo,
            &repo.abs_path(&ctx.repos_root),
            &ctx.knowledge,
            &sibling_ids,
        );
        (repo.repo_id.clone(), outcome)
    });

    let mut failures = 0usize;
    for slot in results.into_iter().flatten() {
        match slot {
            (repo_id, Ok(outcome)) => println!(
                "{} {} v{} ({} fingerprints, {} files)",
                "indexed".green(),
                repo_id,
                outcome.index.version,
                outcome.fingerprints.files.len(),
                outcome.files_seen
            ),
            (repo_id, Err(e)) => {
                failures += 1;
                eprintln!("{} {}: {}", "failed".red(), repo_id, e);
            }
        }
    }
    if failures > 0 {
        return Err(LanekeeperError::ContractViolation(format!(
            "{} repo(s) failed to index",
            failures
        )));
    }
    Ok(())
}

fn run_scan_command(ctx: &Context, cli: ScanCli) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let opts = ScanOptions {
        repo_id: cli.repo_id,
        jobs: cli.jobs,
        force_deps: cli.force_deps,
    };
    let cancel = AtomicBool::new(false);
    let reports = scan::run_knowledge_scan(
        &ctx.ops,
        &ctx.knowledge,
        &registry,
        &ctx.repos_root,
        &opts,
        &cancel,
    )?;

    let mut failures = 0usize;
    for report in reports {
        match report.result {
            Ok(scan) => println!(
                "{} {} scan_version={} facts={} unknowns={}",
                "scanned".green(),
                report.repo_id,
                scan.scan_version,
                scan.facts.len(),
                scan.unknowns.len()
            ),
            Err(e) => {
                failures += 1;
                eprintln!("{} {}: {}", "failed".red(), report.repo_id, e);
            }
        }
    }
    if failures > 0 {
        return Err(LanekeeperError::ContractViolation(format!(
            "{} repo(s) failed to scan",
            failures
        )));
    }
    Ok(())
}

fn run_synthesize_command(ctx: &Context) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let (integration, gaps) = synthesize::run_synthesize(&ctx.ops, &ctx.knowledge, &registry)?;
    println!(
        "{} {} repos, {} gaps, {} unknowns",
        "synthesized".green(),
        integration.integration_map.repos.len(),
        gaps.gaps.len(),
        integration.known_unknowns.len()
    );
    Ok(())
}

fn run_staleness_command(ctx: &Context, cli: StalenessCli) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let config = StalenessConfig::default();
    match cli.scope {
        Some(scope) => {
            let result = staleness::evaluate_scope(
                &ctx.ops,
                &ctx.knowledge,
                &registry,
                &ctx.repos_root,
                &scope,
                &config,
            )?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        None => {
            let view = staleness::run_staleness(
                &ctx.ops,
                &ctx.knowledge,
                &registry,
                &ctx.repos_root,
                &config,
            )?;
            for (scope, result) in &view.scopes {
                let label = if result.hard_stale {
                    "hard-stale".red()
                } else if result.stale {
                    "soft-stale".yellow()
                } else {
                    "fresh".green()
                };
                println!("{:<24} {}", scope, label);
            }
        }
    }
    Ok(())
}

fn run_version_command(ctx: &Context, cli: VersionCli) -> Result<(), LanekeeperError> {
    match cli.command {
        VersionCommand::Show => {
            let record = version::load(&ctx.ops)?;
            println!("{}", record.current.bright_green());
            for entry in record.history.iter().rev().take(5) {
                println!("  {} {} ({}) {}", entry.v, entry.at, entry.scope, entry.reason);
            }
        }
        VersionCommand::Bump {
            kind,
            reason,
            scope,
        } => {
            let record = version::bump(
                &ctx.ops,
                &ctx.knowledge,
                BumpKind::parse(&kind)?,
                &reason,
                &scope,
            )?;
            println!("version: {}", record.current);
        }
        VersionCommand::Set { to, reason, scope } => {
            let record = version::set_explicit(&ctx.ops, &ctx.knowledge, &to, &reason, &scope)?;
            println!("version: {}", record.current);
        }
    }
    Ok(())
}

fn current_or(ctx: &Context, explicit: Option<String>) -> Result<String, LanekeeperError> {
    match explicit {
        Some(v) => Ok(v),
        None => Ok(version::load(&ctx.ops)?.current),
    }
}

fn run_sufficiency_command(ctx: &Context, cli: SufficiencyCli) -> Result<(), LanekeeperError> {
    match cli.command {
        SufficiencyCommand::Show {
            scope,
            knowledge_version,
        } => {
            let v = current_or(ctx, knowledge_version)?;
            match sufficiency::load(&ctx.ops, &scope, &v)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("no sufficiency record for ({}, {})", scope, v),
            }
        }
        SufficiencyCommand::Set {
            scope,
            status,
            knowledge_version,
            reason,
        } => {
            let parsed = SufficiencyStatus::parse(&status)?;
            if parsed == SufficiencyStatus::Sufficient {
                return Err(LanekeeperError::ContractViolation(
                    "'sufficient' requires the approval step; use `sufficiency approve`"
                        .to_string(),
                ));
            }
            let v = current_or(ctx, knowledge_version)?;
            let record = sufficiency::set_status(
                &ctx.ops,
                &scope,
                &v,
                parsed,
                reason.map(|r| vec![r]),
            )?;
            println!("sufficiency: ({}, {}) = {:?}", record.scope, record.knowledge_version, record.status);
        }
        SufficiencyCommand::Approve {
            scope,
            by,
            knowledge_version,
        } => {
            let v = current_or(ctx, knowledge_version)?;
            sufficiency::approve(&ctx.ops, &scope, &v, &by)?;
            println!("sufficiency: ({}, {}) = sufficient", scope, v);
        }
    }
    Ok(())
}

fn run_bundle_command(ctx: &Context, cli: BundleCli) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let stale_override = if cli.force_stale_override {
        let by = cli.by.ok_or_else(|| {
            LanekeeperError::ContractViolation(
                "--force-stale-override requires --by".to_string(),
            )
        })?;
        let reason = cli.reason.ok_or_else(|| {
            LanekeeperError::ContractViolation(
                "--force-stale-override requires --reason".to_string(),
            )
        })?;
        Some(StaleOverride { by, reason })
    } else {
        None
    };

    let outcome = bundle::build_bundle(
        &ctx.ops,
        &ctx.knowledge,
        &registry,
        &ctx.repos_root,
        &cli.scope,
        &StalenessConfig::default(),
        &BundleOptions {
            out_base: cli.out_base,
            stale_override,
        },
    )?;
    println!(
        "{} {} ({} files) at {}",
        "bundled".green(),
        outcome.bundle_id,
        outcome.file_count,
        outcome.dir.display()
    );
    Ok(())
}

fn run_events_command(ctx: &Context, cli: EventsCli) -> Result<(), LanekeeperError> {
    match cli.command {
        EventsCommand::Log {
            repo_id,
            pr_number,
            merge_commit_sha,
            base_branch,
            timestamp,
            derive_paths,
            dry_run,
        } => {
            let now = chrono::Utc::now();
            let timestamp = timestamp.unwrap_or_else(time::now_rfc3339);
            time::parse_rfc3339(&timestamp)?;

            let affected_paths = if derive_paths {
                let registry = ctx.registry()?;
                let repo = registry.require_active(&repo_id)?;
                let (paths, source) = events::log::derive_affected_paths(
                    &repo.abs_path(&ctx.repos_root),
                    &merge_commit_sha,
                    None,
                );
                println!("affected paths: {} (source: {})", paths.len(), source);
                paths
            } else {
                Vec::new()
            };

            let logged = events::log::log_merge_event(
                &ctx.ops,
                MergeEventInput {
                    repo_id,
                    pr_number,
                    merge_commit_sha,
                    base_branch,
                    affected_paths,
                    timestamp,
                    work_id: None,
                    pr: None,
                    risk_level: None,
                },
                &now,
                dry_run,
            )?;
            println!(
                "{} {} -> {}",
                if logged.dry_run { "dry-run" } else { "logged" },
                logged.event.id,
                logged.segment.display()
            );
        }
        EventsCommand::Summary => {
            let outcome = summary::run_events_summary(&ctx.ops, &ctx.knowledge)?;
            for warning in &outcome.warnings {
                eprintln!("{} {}", "warning".yellow(), warning);
            }
            println!(
                "summary: {} repos, {} warnings",
                outcome.summary.merge_events.len(),
                outcome.warnings.len()
            );
        }
        EventsCommand::Checkpoint { command } => match command {
            CheckpointCommand::Show { consumer } => {
                match summary::load_checkpoint(&ctx.ops, &consumer)? {
                    Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
                    None => println!("no checkpoint for consumer '{}'", consumer),
                }
            }
            CheckpointCommand::Advance { consumer } => {
                let (events, position) = summary::events_since_checkpoint(&ctx.ops, &consumer)?;
                match position {
                    Some((segment, offset)) => {
                        summary::store_checkpoint(&ctx.ops, &consumer, &segment, offset)?;
                        println!(
                            "checkpoint '{}' advanced past {} event(s) to {}:{}",
                            consumer,
                            events.len(),
                            segment,
                            offset
                        );
                    }
                    None => println!("no segments to checkpoint"),
                }
            }
        },
    }
    Ok(())
}

fn run_graph_command(ctx: &Context, cli: GraphCli) -> Result<(), LanekeeperError> {
    match cli.command {
        GraphCommand::Show => {
            let base = graph::load_base(&ctx.knowledge)?;
            let ovr = graph::load_override(&ctx.knowledge)?;
            let effective = graph::effective_graph(&base, ovr.as_ref());
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
        GraphCommand::Approve { by } => {
            graph::approve(&ctx.knowledge, &by)?;
            println!("graph: override approved by {}", by);
        }
    }
    Ok(())
}

fn run_triage_command(ctx: &Context, cli: TriageCli) -> Result<(), LanekeeperError> {
    let registry = ctx.registry()?;
    let config = StalenessConfig::default();
    let outcomes = match cli.file {
        Some(file) => {
            let outcome = delivery::triage::triage_intake(
                &ctx.ops,
                &ctx.knowledge,
                &registry,
                &ctx.repos_root,
                &file,
                &config,
            )?;
            vec![(file, outcome)]
        }
        None => delivery::triage::triage_inbox(
            &ctx.ops,
            &ctx.knowledge,
            &registry,
            &ctx.repos_root,
            &config,
        )?,
    };

    if outcomes.is_empty() {
        println!("triage: inbox is empty");
        return Ok(());
    }
    for (path, outcome) in outcomes {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match outcome {
            delivery::triage::TriageOutcome::Triaged { items } => {
                println!("{} {} -> {} item(s)", "triaged".green(), name, items.len());
            }
            delivery::triage::TriageOutcome::Failed {
                reason_code,
                detail,
            } => {
                eprintln!("{} {} [{}]: {}", "refused".red(), name, reason_code, detail);
            }
        }
    }
    Ok(())
}
