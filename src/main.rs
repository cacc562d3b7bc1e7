mod backfill;
mod blob;
mod db;
mod error;
mod fetch;
mod html;
mod notify;
mod parser;
mod pipeline;
mod profiles;
mod settings;
mod supplement;

use std::time::Instant;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use crate::blob::FsBlobStore;
use crate::fetch::{Fetch, HttpFetcher};
use crate::notify::WebhookNotifier;
use crate::pipeline::Pipeline;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "bangumi_cast", about = "TV listing and cast scraper for bangumi.org")]
struct Cli {
    /// Settings file (without extension); BANGUMI_* env vars override it
    #[arg(short, long, global = true, default_value = "bangumi")]
    config: String,
    /// Cast extraction profile, overrides the settings file
    #[arg(long, global = true, value_enum)]
    profile: Option<parser::Profile>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listing + details + snapshots, then rotation and one notification
    Run,
    /// Fetch the EPG listings only
    Epg,
    /// Rebuild talents and appearances from stored snapshots
    Supplement {
        /// Dates to scan, comma separated (default: the last `days_back` days)
        #[arg(long, value_delimiter = ',')]
        dates: Vec<NaiveDate>,
        /// Max snapshot files to read
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Refetch the cast for snapshots that have no performers
    Backfill {
        #[arg(long, value_delimiter = ',', required = true)]
        dates: Vec<NaiveDate>,
        /// Append cast named in each snapshot's own 【出演】 text instead of refetching
        #[arg(long)]
        from_text: bool,
    },
    /// Scrape talent profile pages
    Profiles {
        /// Max talents to scrape
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Try every detail URL for one program and report what each returns
    Probe { event_id: String },
    /// Move rows older than `rotation_days` into the archive tables
    Archive,
    /// Show store statistics
    Stats,
    /// List stored snapshots for a date; dumps the cast when one program matches
    Snapshots {
        date: NaiveDate,
        /// Channel code, e.g. NHKG-TKY
        channel: Option<String>,
        /// Substring of the program title
        keyword: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)?;
    if let Some(profile) = cli.profile {
        settings.profile = profile;
    }
    let today = Local::now().date_naive();

    let result = match cli.command {
        Commands::Run => {
            let mut pipeline = build_pipeline(settings)?;
            let summary = pipeline.run_and_notify(today).await?;
            summary.print();
            if summary.archived > 0 {
                println!("Archived:       {}", summary.archived);
            }
            Ok(())
        }
        Commands::Epg => {
            let days = settings.target_days;
            let p = build_pipeline(settings)?;
            let entries = p.discover(&pipeline::target_dates(today, days)).await?;
            let unknown = entries.iter().filter(|e| e.channel_code.is_none()).count();
            println!("Stored {} EPG entries ({} on unmapped channels)", entries.len(), unknown);
            Ok(())
        }
        Commands::Supplement { dates, limit } => {
            let conn = open_db(&settings)?;
            let store = FsBlobStore::new(&settings.blob_root);
            let dates = if dates.is_empty() {
                supplement::recent_dates(today, settings.days_back)
            } else {
                dates
            };
            let limit = limit.unwrap_or(settings.max_programs);
            let s = supplement::supplement(&conn, &store, &dates, limit)?;
            println!(
                "Scanned {} snapshots: {} pairs added, {} already present, {} new talents, {} errors",
                s.files, s.supplemented, s.skipped, s.new_talents, s.errors
            );
            Ok(())
        }
        Commands::Backfill { dates, from_text: true } => {
            let conn = open_db(&settings)?;
            let store = FsBlobStore::new(&settings.blob_root);
            let s = backfill::fill_from_text(&conn, &store, &settings, &dates).await?;
            println!(
                "Checked {} snapshots: {} updated (+{} performers), {} complete, {} no cast text, {} failed",
                s.checked, s.updated, s.added, s.complete, s.no_marker, s.failed
            );
            Ok(())
        }
        Commands::Backfill { dates, from_text: false } => {
            let conn = open_db(&settings)?;
            let store = FsBlobStore::new(&settings.blob_root);
            let fetcher = HttpFetcher::new(&settings.user_agent, settings.request_timeout_secs)?;
            let s = backfill::backfill(&fetcher, &conn, &store, &settings, &dates).await?;
            println!(
                "Checked {} snapshots: {} updated, {} still empty, {} already filled, {} failed",
                s.checked, s.updated, s.still_empty, s.already_filled, s.failed
            );
            Ok(())
        }
        Commands::Profiles { limit, offset } => {
            let conn = open_db(&settings)?;
            let fetcher = HttpFetcher::new(&settings.user_agent, settings.request_timeout_secs)?;
            let notifier = WebhookNotifier::new(settings.webhook_url.clone());
            let limit = limit.unwrap_or(settings.profile_limit);
            let s =
                profiles::scrape_profiles(&fetcher, &conn, &notifier, &settings, limit, offset)
                    .await?;
            println!(
                "Profiles: {} attempted, {} ok, {} failed (mean completeness {:.0}%)",
                s.attempted,
                s.success,
                s.failed,
                s.mean_completeness * 100.0
            );
            Ok(())
        }
        Commands::Probe { event_id } => probe(&settings, &event_id).await,
        Commands::Archive => {
            let conn = open_db(&settings)?;
            let cutoff = today - chrono::Duration::days(settings.rotation_days);
            let moved = db::archive_older_than(&conn, &cutoff.format("%Y-%m-%d").to_string())?;
            println!(
                "Archived {} EPG rows and {} programs broadcast before {}",
                moved.epg, moved.programs, cutoff
            );
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&settings)?;
            let s = db::stats(&conn)?;
            println!("EPG entries:  {}", s.epg);
            println!("Programs:     {}", s.programs);
            println!("Talents:      {} ({} without link)", s.talents, s.placeholders);
            println!("Appearances:  {}", s.appearances);
            println!("Profiles:     {}", s.profiles);
            println!("Archived:     {} EPG, {} programs", s.archived_epg, s.archived_programs);
            match s.last_run {
                Some((kind, at, ok)) => {
                    let outcome = if ok { "ok" } else { "failed" };
                    println!("Last run:     {} at {} ({})", kind, at, outcome)
                }
                None => println!("Last run:     -"),
            }
            Ok(())
        }
        Commands::Snapshots { date, channel, keyword } => {
            let store = FsBlobStore::new(&settings.blob_root);
            let found = blob::find_snapshots(
                &store,
                &date.format("%Y-%m-%d").to_string(),
                channel.as_deref(),
                keyword.as_deref(),
            )?;
            println!("{} snapshots", found.len());
            let dump = found.len() == 1 || keyword.is_some();
            for (path, snap) in &found {
                println!(
                    "  {}  {} ({} performers)",
                    path,
                    truncate(&snap.program_title, 30),
                    snap.performers().len()
                );
                if !dump {
                    continue;
                }
                for p in snap.performers() {
                    let link = p.link.as_deref().unwrap_or("-");
                    println!("      {:<24} {:<12} {}", p.talent_id, p.name, link);
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn build_pipeline(
    settings: Settings,
) -> anyhow::Result<Pipeline<HttpFetcher, WebhookNotifier, FsBlobStore>> {
    let conn = open_db(&settings)?;
    let fetcher = HttpFetcher::new(&settings.user_agent, settings.request_timeout_secs)?;
    let store = FsBlobStore::new(&settings.blob_root);
    let notifier = WebhookNotifier::new(settings.webhook_url.clone());
    Ok(Pipeline::new(fetcher, conn, store, notifier, settings))
}

async fn probe(settings: &Settings, event_id: &str) -> anyhow::Result<()> {
    let conn = open_db(settings)?;
    let entry = db::fetch_epg_entry(&conn, event_id)?.unwrap_or_else(|| db::EpgEntry {
        event_id: event_id.to_string(),
        ..Default::default()
    });
    let fetcher = HttpFetcher::new(&settings.user_agent, settings.request_timeout_secs)
        .context("probe needs an HTTP client")?;
    let candidates = fetch::detail_candidates(
        &entry.link,
        &entry.event_id,
        &settings.site_origin,
        &settings.detail_url_patterns,
    );

    println!("{} ({})", event_id, truncate(&entry.program_title, 40));
    for url in &candidates {
        let resp = match fetcher.get(url).await {
            Ok(r) => r,
            Err(e) => {
                println!("  ERR  {}  {:#}", url, e);
                continue;
            }
        };
        println!("  {}  {}  {} chars", resp.status, url, resp.body.chars().count());
        if !resp.is_success() {
            continue;
        }
        let doc = html::Document::parse(&resp.body);
        let markup = parser::structured::diagnose(&doc);
        let data =
            parser::process_detail(&resp.body, &entry, settings.profile, &settings.site_origin);
        println!(
            "       ul.addition: {}  ul.talent_panel: {}  talent links: {}  【出演】: {}",
            markup.has_cast_list,
            markup.has_talent_panel,
            markup.talent_links,
            parser::fallback::has_cast_marker(&data.record.description_detail)
        );
        println!(
            "       performers: {} ({} from markup, {} from text, {} rejected)",
            data.report.outcome.len(),
            data.report.from_markup,
            data.report.from_text,
            data.report.rejected
        );
        for t in &data.record.performers {
            println!("         {:<24} {}", t.identifier, truncate(&t.display_name, 20));
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
