pub mod types;
pub mod error;
pub mod config;
pub mod crs;
pub mod data;
pub mod join;
pub mod aggregate;
pub mod filter;
pub mod cache;
pub mod render;
pub mod server;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::filter::{Choice, Criteria};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count restaurants per district
    Summary {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Also write the table as CSV
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// List the districts, categories, prices and rating range available for filtering
    Options {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Show the restaurants of one district matching the given filters
    Filter {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        region: String,
        #[arg(long, default_value = filter::ALL)]
        category: String,
        #[arg(long, default_value = filter::ALL)]
        price: String,
        /// Defaults to the lowest rating in the data
        #[arg(long)]
        min_rating: Option<f64>,
        /// Write the latitude/longitude table as CSV
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// Render district outlines and restaurants to a PNG
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Serve the JSON API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Summary { config, csv } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let dataset = cache::global().get_or_load(&app_config.input)?;

            match aggregate::count_by_region(&dataset, &app_config.schema.group_candidates) {
                Ok(agg) => {
                    println!("Restaurants per district ({})", agg.column);
                    for row in &agg.counts {
                        println!("{:>6}  {}", row.count, row.region);
                    }
                    println!("{:>6}  (unmatched)", agg.unmatched);
                    println!("{:>6}  total", agg.total());

                    if let Some(path) = csv {
                        let file = File::create(&path)
                            .with_context(|| format!("Failed to create {:?}", path))?;
                        agg.write_csv(file)?;
                    }
                }
                Err(e) => warn!("{}", e),
            }

            let report = &dataset.report;
            println!(
                "Total restaurants: {} ({} invalid restaurant geometries, {} invalid district geometries)",
                dataset.len(),
                report.invalid_points.len(),
                report.invalid_regions.len()
            );
        }
        Commands::Options { config } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let dataset = cache::global().get_or_load(&app_config.input)?;
            let schema = &app_config.schema;

            let Some(column) = aggregate::resolve_column(&dataset, &schema.group_candidates) else {
                warn!("{}", error::NoGroupingKeyError { checked: schema.group_candidates.clone() });
                return Ok(());
            };
            let opts = filter::options(&dataset, &column, schema);
            println!("Districts ({}): {}", column, opts.regions.join(", "));
            println!("Categories: {}, {}", filter::ALL, opts.categories.join(", "));
            println!("Prices: {}, {}", filter::ALL, opts.prices.join(", "));
            println!("Rating: {:.1} - {:.1}", opts.rating.min, opts.rating.max);
        }
        Commands::Filter { config, region, category, price, min_rating, csv } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let dataset = cache::global().get_or_load(&app_config.input)?;
            let schema = &app_config.schema;

            let Some(column) = aggregate::resolve_column(&dataset, &schema.group_candidates) else {
                warn!("{}", error::NoGroupingKeyError { checked: schema.group_candidates.clone() });
                return Ok(());
            };

            let min_rating = min_rating
                .unwrap_or_else(|| filter::rating_bounds(&dataset, &schema.rating_column).min);
            let criteria = Criteria {
                region,
                category: Choice::from_input(Some(category.as_str())),
                price: Choice::from_input(Some(price.as_str())),
                min_rating: Some(min_rating),
            };
            let outcome = filter::apply(&dataset, &column, schema, &criteria);

            println!("Restaurants in {}", criteria.region);
            if let Some(message) = outcome.message() {
                println!("{}", message);
            } else {
                let table = filter::coordinates(outcome.records.iter().copied(), schema);
                match table.message() {
                    Some(message) => println!("{}", message),
                    None => {
                        let mut wtr = csv::Writer::from_writer(io::stdout());
                        for row in &table.rows {
                            wtr.serialize(row)?;
                        }
                        wtr.flush()?;
                    }
                }
                if table.dropped > 0 {
                    println!("{} restaurants without valid coordinates not shown", table.dropped);
                }
                if let Some(path) = csv {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    table.write_csv(file)?;
                }
            }
            if outcome.excluded_missing_rating > 0 {
                println!("{} restaurants without a rating excluded", outcome.excluded_missing_rating);
            }
            println!("Total restaurants with selected filters: {}", outcome.len());
        }
        Commands::Render { config, out } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let dataset = cache::global().get_or_load(&app_config.input)?;
            let output = &app_config.output;
            let path = out.unwrap_or_else(|| output.map_image.clone());
            render::save_map(&dataset, &path, output.width, output.height)?;
            println!("Map written to {}", path.display());
        }
        Commands::Serve { config } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}
