pub mod choropleth;
pub mod colorscale;
pub mod config;
pub mod data;
pub mod render;
pub mod server;
pub mod transform;
pub mod types;

use anyhow::Result;
use choropleth::Choropleth;
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the choropleth and open it in an interactive map view
    Show {
        /// TOML config; built-in defaults when omitted
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the joined table without starting the map view
    Summary {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Load both inputs, derive the log column and join it onto the boundaries.
fn prepare(config: &AppConfig) -> Result<Choropleth> {
    let dataset = data::load_data(config)?;
    let values = transform::derive_log_confirmed(&dataset.records, config.style.log_policy)?;
    Ok(choropleth::build_choropleth(
        dataset.boundaries,
        &dataset.records,
        &values,
        &config.style,
        &config.input.columns,
    ))
}

fn write_summary<W: Write>(choropleth: &Choropleth, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "{:<16} {:>10} {:>10} {:>10} {:>10} {:>10}  state",
        "region", "confirmed", "suspected", "recovered", "deaths", "log"
    )?;
    for feature in &choropleth.features {
        let name = feature.key.as_deref().unwrap_or("<no key>");
        match &feature.hover {
            Some(h) => writeln!(
                out,
                "{:<16} {:>10} {:>10} {:>10} {:>10} {:>10.3}  {}",
                name,
                h.confirmed,
                h.suspected,
                h.recovered,
                h.deaths,
                feature.value.unwrap_or(f64::NAN),
                if feature.is_colored() { "colored" } else { "matched" },
            )?,
            None => writeln!(out, "{:<16} {:>54}  unmatched", name, "-")?,
        }
    }
    for name in &choropleth.unmatched_rows {
        writeln!(out, "{:<16} {:>54}  no boundary", name, "-")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Show { config } => {
            let app_config = AppConfig::load(config.as_deref())?;
            info!(
                "Rendering {:?} with {:?}",
                app_config.input.data_csv, app_config.input.boundaries
            );

            let choropleth = prepare(&app_config)?;
            let layer = render::MapLayer::new(choropleth, &app_config.style)?;

            server::start_server(app_config, layer).await?;
        }
        Commands::Summary { config } => {
            let app_config = AppConfig::load(config.as_deref())?;
            let choropleth = prepare(&app_config)?;
            write_summary(&choropleth, &mut io::stdout().lock())?;
        }
    }

    Ok(())
}
