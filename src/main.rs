use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use sql_lineage::{AggregatorConfig, ObservedQuery, SqlParsingAggregator};

fn main() {
    init_logging();

    let mut args: Vec<String> = env::args().skip(1).collect();

    let pretty = if let Some(pos) = args.iter().position(|a| a == "--pretty" || a == "-p") {
        args.remove(pos);
        true
    } else {
        false
    };
    let config_path = if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        args.remove(pos);
        if pos < args.len() {
            Some(args.remove(pos))
        } else {
            eprintln!("--config requires a path");
            std::process::exit(2);
        }
    } else {
        env::var("CONFIG_PATH").ok()
    };

    let config = match config_path {
        Some(path) => match AggregatorConfig::from_file(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {:#}", path, e);
                std::process::exit(2);
            }
        },
        None => AggregatorConfig::new("generic"),
    };

    if let Err(e) = run(config, &args, pretty) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Ingests each input (files, or stdin when none are given) as one observed
/// query script, then prints the merged metadata as JSON.
fn run(config: AggregatorConfig, inputs: &[String], pretty: bool) -> anyhow::Result<()> {
    let mut agg = SqlParsingAggregator::new(config)?;

    if inputs.is_empty() || (inputs.len() == 1 && inputs[0] == "-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        ingest(&mut agg, &buf)?;
    } else {
        for path in inputs {
            let contents = fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path, e))?;
            ingest(&mut agg, &contents)?;
        }
    }

    let changes = agg.gen_metadata()?;
    if pretty {
        println!("{}", serde_json::to_string_pretty(&changes)?);
    } else {
        for change in &changes {
            println!("{}", serde_json::to_string(change)?);
        }
    }

    let report = agg.report();
    if report.num_observed_queries_failed > 0 {
        tracing::warn!(
            failed = report.num_observed_queries_failed,
            total = report.num_observed_queries,
            "some queries failed to parse"
        );
    }
    agg.close();
    Ok(())
}

fn ingest(agg: &mut SqlParsingAggregator, sql: &str) -> anyhow::Result<()> {
    agg.add_observed_query(ObservedQuery {
        query: sql.to_string(),
        default_db: None,
        default_schema: None,
        session_id: None,
        timestamp: None,
        user: None,
    })
}
