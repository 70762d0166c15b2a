//! Splinter CLI: compile a demo query against a fleet state and inspect the
//! resulting per-instance plan fragments.

use clap::{Parser, Subcommand};
use splinter_core::error::Result;
use splinter_core::relation::{ColumnSpec, Relation};
use splinter_core::types::DataType;
use splinter_ir::node::ColumnExpr;
use splinter_ir::{proto, Graph};
use splinter_planner::{DistributedPlanner, DistributedState};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "splinter")]
#[command(about = "Splinter: fragment a query plan across a fleet of agents", long_about = None)]
struct Cli {
    /// Enable debug logging of planner decisions
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a demo query against a fleet state and print each fragment
    Plan {
        /// Path to the distributed-state JSON file
        #[arg(short, long)]
        state: PathBuf,

        /// Demo query to compile: scan | filter | agg
        #[arg(short, long, default_value = "scan")]
        query: String,

        /// Print encoded wire fragments instead of the debug rendering
        #[arg(long)]
        wire: bool,
    },
    /// Print the structural fingerprint of the planned query
    Fingerprint {
        #[arg(short, long)]
        state: PathBuf,

        #[arg(short, long, default_value = "scan")]
        query: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .init();
    }
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Plan { state, query, wire } => {
            let state = load_state(&state)?;
            let graph = build_query(&query, &state)?;
            let plan = DistributedPlanner::new().plan(&graph, &state)?;
            if wire {
                for id in plan.topological_order()? {
                    let inst = plan.get(id)?;
                    let fragment = proto::graph_to_proto(&inst.graph)?;
                    println!(
                        "instance {} ({}):",
                        id.get(),
                        inst.spec.query_broker_address
                    );
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&fragment)
                            .map_err(|e| splinter_core::error::Error::internal(e.to_string()))?
                    );
                }
            } else {
                print!("{}", plan.debug_string());
            }
            Ok(())
        }
        Commands::Fingerprint { state, query } => {
            let state = load_state(&state)?;
            let graph = build_query(&query, &state)?;
            let plan = DistributedPlanner::new().plan(&graph, &state)?;
            println!("{}", plan.fingerprint()?);
            Ok(())
        }
    }
}

fn load_state(path: &PathBuf) -> Result<DistributedState> {
    let text = fs::read_to_string(path).map_err(|e| {
        splinter_core::error::Error::invalid_argument(format!(
            "cannot read {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        splinter_core::error::Error::invalid_argument(format!(
            "cannot parse {}: {e}",
            path.display()
        ))
    })
}

/// Builds one of a few canned query graphs over the first table in the
/// state. The real front-end is a separate system; these exist so the plan
/// output can be inspected by hand.
fn build_query(name: &str, state: &DistributedState) -> Result<Graph> {
    let table = state.tables.first().ok_or_else(|| {
        splinter_core::error::Error::invalid_argument("state declares no tables")
    })?;
    let relation = table.relation.clone();
    let mut g = Graph::new();
    let src = g.create_mem_source(table.name.clone(), vec![])?;
    g.set_relation(src, relation.clone())?;

    let (tail, tail_rel) = match name {
        "scan" => (src, relation),
        "filter" => {
            let col = first_column(&relation)?;
            let col_ref = g.add_column(col.clone())?;
            let zero = g.add_int(0)?;
            let pred = g.add_func("greater_than", vec![col_ref, zero])?;
            let filter = g.create_filter(src, pred)?;
            g.set_relation(filter, relation.clone())?;
            (filter, relation)
        }
        "agg" => {
            let group = relation.column(0).cloned().ok_or_else(|| {
                splinter_core::error::Error::invalid_argument("table relation has no columns")
            })?;
            let value = relation.column(1).cloned().unwrap_or_else(|| group.clone());
            let group_ref = g.add_column(group.name.clone())?;
            let value_ref = g.add_column(value.name)?;
            let mean = g.add_func("mean", vec![value_ref])?;
            let agg =
                g.create_blocking_agg(src, vec![group_ref], vec![ColumnExpr::new("mean", mean)])?;
            let out = Relation::new(vec![group, ColumnSpec::new("mean", DataType::Float64)]);
            g.set_relation(agg, out.clone())?;
            (agg, out)
        }
        other => {
            return Err(splinter_core::error::Error::invalid_argument(format!(
                "unknown demo query '{other}' (expected scan | filter | agg)"
            )))
        }
    };
    let sink = g.create_mem_sink(tail, "out")?;
    g.set_relation(sink, tail_rel)?;
    Ok(g)
}

fn first_column(relation: &Relation) -> Result<String> {
    relation
        .iter()
        .next()
        .map(|c| c.name.clone())
        .ok_or_else(|| {
            splinter_core::error::Error::invalid_argument("table relation has no columns")
        })
}
