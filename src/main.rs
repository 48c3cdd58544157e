//! proficio CLI: hierarchical knowledge proficiency propagation.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr, miette};

use proficio::config::EngineConfig;
use proficio::engine::Engine;
use proficio::item_bank::{ItemDifficulty, ItemInventory};
use proficio::node::{ClusterId, NodeId, UserId};
use proficio::propagation::AssessmentResult;

const CONFIG_FILE: &str = "proficio.toml";

#[derive(Parser)]
#[command(name = "proficio", version, about = "Knowledge proficiency propagation engine")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, global = true, default_value = ".proficio")]
    data_dir: PathBuf,

    /// Config file (defaults to proficio.toml inside the data directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory with a default config file.
    Init,

    /// Ingest a concept graph and/or an item inventory from JSON files.
    Ingest {
        /// Graph snapshot JSON (clusters, nodes, edges).
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Item inventory JSON (list of {node, difficulty, count}).
        #[arg(long)]
        items: Option<PathBuf>,
    },

    /// Register assessment items for one node.
    Items {
        #[arg(long)]
        node: u64,

        /// easy, medium or hard.
        #[arg(long)]
        difficulty: ItemDifficulty,

        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Apply one assessment to a learner's proficiency.
    Assess {
        /// Learner id.
        #[arg(long)]
        user: u64,

        /// Results as comma-separated node=score pairs, e.g. "12=0.9,14=0.5".
        #[arg(long)]
        results: String,

        /// Compute and print the update without writing it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show a learner's stored proficiency.
    Proficiency {
        /// Learner id.
        #[arg(long)]
        user: u64,

        /// Comma-separated node ids; all stored records when omitted.
        #[arg(long)]
        nodes: Option<String>,

        /// Show mean proficiency per cluster instead.
        #[arg(long)]
        clusters: bool,
    },

    /// Select assessment centroids for a subject and grade.
    Centroids {
        #[arg(long)]
        subject: String,

        #[arg(long)]
        grade: u8,

        /// Maximum number of clusters (0 = all).
        #[arg(long, default_value = "0")]
        count: usize,
    },

    /// Recompute edge weights from stored mastery data.
    RecalcWeights {
        /// Graph snapshot id to compute against (defaults to the current one).
        #[arg(long)]
        snapshot: Option<u64>,
    },

    /// Move a node to another cluster.
    Reassign {
        #[arg(long)]
        node: u64,

        #[arg(long)]
        cluster: u64,
    },

    /// Show engine info and statistics.
    Info,

    /// Export edge weights (and optionally a learner's records) as JSON.
    Export {
        #[arg(long)]
        user: Option<u64>,

        /// Export the full graph snapshot instead, in the ingestion format.
        #[arg(long, conflicts_with = "user")]
        graph: bool,
    },
}

fn node_id(raw: u64) -> Result<NodeId> {
    NodeId::new(raw).ok_or_else(|| miette!("node ids start at 1, got {raw}"))
}

fn parse_nodes(list: &str) -> Result<Vec<NodeId>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| node_id(s.parse::<u64>().into_diagnostic()?))
        .collect()
}

fn parse_results(list: &str) -> Result<Vec<AssessmentResult>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (node, score) = pair
                .split_once('=')
                .ok_or_else(|| miette!("expected node=score, got \"{pair}\""))?;
            let node = node_id(node.trim().parse::<u64>().into_diagnostic()?)?;
            let score = score.trim().parse::<f64>().into_diagnostic()?;
            Ok(AssessmentResult::new(node, score))
        })
        .collect()
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.data_dir.join(CONFIG_FILE));
    let mut config = if path.exists() {
        EngineConfig::load(&path)?
    } else {
        EngineConfig::default()
    };
    config.data_dir = Some(cli.data_dir.clone());
    Ok(config)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => {
            let path = cli.data_dir.join(CONFIG_FILE);
            if !path.exists() {
                config.save(&path)?;
            }
            let engine = Engine::new(config)?;
            println!("Initialized proficio at {}", cli.data_dir.display());
            println!("{}", engine.info());
        }

        Commands::Ingest { graph, items } => {
            if graph.is_none() && items.is_none() {
                return Err(miette!("nothing to ingest: pass --graph and/or --items"));
            }
            let engine = Engine::new(config)?;
            if let Some(path) = graph {
                let report = engine.ingest_json(&read_file(&path)?)?;
                println!(
                    "Ingested {} clusters, {} nodes, {} edges ({} weighted, {} weights dropped)",
                    report.clusters,
                    report.nodes,
                    report.edges,
                    report.weighted_edges,
                    report.dropped_weights
                );
            }
            if let Some(path) = items {
                let inventory: Vec<ItemInventory> =
                    serde_json::from_str(&read_file(&path)?).into_diagnostic()?;
                engine.register_items(&inventory)?;
                println!("Registered {} item entries", inventory.len());
            }
        }

        Commands::Items {
            node,
            difficulty,
            count,
        } => {
            let engine = Engine::new(config)?;
            engine.register_items(&[ItemInventory {
                node: node_id(node)?,
                difficulty,
                count,
            }])?;
            println!("Registered {count} {difficulty} item(s) for node:{node}");
        }

        Commands::Assess {
            user,
            results,
            dry_run,
        } => {
            let engine = Engine::new(config)?;
            let results = parse_results(&results)?;
            let update = if dry_run {
                engine.preview(UserId(user), &results)?
            } else {
                engine.compute_proficiency_update(UserId(user), &results)?
            };
            for (node, value) in &update.values {
                let marker = if update.tested.contains(node) { "*" } else { " " };
                println!("{marker} {:<12} {value:.4}", node.to_string());
            }
            println!(
                "{} tested, {} baseline, {} propagated{}",
                update.counts.direct,
                update.counts.baseline,
                update.counts.propagated,
                if update.is_persisted() { "" } else { " (not persisted)" }
            );
        }

        Commands::Proficiency {
            user,
            nodes,
            clusters,
        } => {
            let engine = Engine::new(config)?;
            let user = UserId(user);
            if clusters {
                for row in engine.cluster_report(user)? {
                    println!(
                        "cluster:{:<6} {:<24} mean {:.4} ({}/{} assessed)",
                        row.cluster, row.name, row.mean, row.assessed, row.members
                    );
                }
            } else if let Some(list) = nodes {
                let nodes = parse_nodes(&list)?;
                let records = engine.node_records(user, &nodes)?;
                let default = engine.batch().default_proficiency();
                for node in nodes {
                    match records.get(&node) {
                        Some(r) => println!(
                            "{:<12} {:.4}  interactions={}",
                            node.to_string(),
                            r.proficiency,
                            r.interactions_count
                        ),
                        None => println!("{:<12} {default:.4}  (default)", node.to_string()),
                    }
                }
            } else {
                let records = engine.records(user)?;
                if records.is_empty() {
                    println!("No records for {user}.");
                }
                for (node, r) in records {
                    println!(
                        "{:<12} {:.4}  interactions={} last_updated={}",
                        node.to_string(),
                        r.proficiency, r.interactions_count, r.last_updated
                    );
                }
            }
        }

        Commands::Centroids {
            subject,
            grade,
            count,
        } => {
            let engine = Engine::new(config)?;
            let selection = engine.centroid_selection(&subject, grade, count)?;
            if selection.is_empty() {
                println!("No centroids selected.");
            }
            for choice in &selection.centroids {
                println!("{} -> {} (degree {})", choice.cluster, choice.node, choice.degree);
            }
            for cluster in &selection.unavailable {
                println!("{cluster} -> centroid unavailable");
            }
        }

        Commands::RecalcWeights { snapshot } => {
            let engine = Engine::new(config)?;
            let snapshot = match snapshot {
                Some(id) => id,
                None => engine.snapshot_id()?,
            };
            let report = engine.recalculate_edge_weights(snapshot)?;
            println!(
                "Snapshot {}: {} updated, {} skipped, {} failed (of {})",
                report.snapshot_id,
                report.edges_updated,
                report.edges_skipped,
                report.failures.len(),
                report.edges_total
            );
            for failure in &report.failures {
                println!("  {} -> {}: {}", failure.from, failure.to, failure.message);
            }
        }

        Commands::Reassign { node, cluster } => {
            let engine = Engine::new(config)?;
            engine.reassign_cluster(node_id(node)?, ClusterId(cluster))?;
            println!("Moved node:{node} to cluster:{cluster}");
        }

        Commands::Info => {
            let engine = Engine::new(config)?;
            println!("{}", engine.info());
        }

        Commands::Export { user, graph } => {
            let engine = Engine::new(config)?;
            let json = if graph {
                engine.graph().to_snapshot()?.to_json()?
            } else {
                let export = engine.export(user.map(UserId))?;
                serde_json::to_string_pretty(&export).into_diagnostic()?
            };
            println!("{json}");
        }
    }

    Ok(())
}
