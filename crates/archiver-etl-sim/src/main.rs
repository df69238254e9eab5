//! etl-sim: drive the archiver ETL against in-memory tiers
//!
//! `failover` seeds a two-appliance pair, runs the primary's chain under
//! manual control and reports whether the long-term tier ended up with
//! every second. `plan` prints the stage schedule a tier list would get.

use anyhow::{bail, Context, Result};
use archiver_etl::metrics::TransitionMetrics;
use archiver_etl::{
    EtlConfig, EtlStage, JobOutcome, PartitionGranularity, StageChain, ValueType,
};
use archiver_etl_testkit::{gaps, FailoverRig, MemoryTier};
use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SIM_PV: &str = "sim:failover";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("etl-sim")
        .version(archiver_etl::VERSION)
        .about("Exercise the archiver ETL against in-memory tiers")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log at debug level"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("ETL configuration file (TOML)"),
        )
        .subcommand(
            Command::new("failover")
                .about("Merge a fail-over pair and check the result")
                .arg(
                    Arg::new("days")
                        .long("days")
                        .default_value("2")
                        .value_parser(value_parser!(i64).range(1..=31))
                        .help("Days of one-second samples to archive"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Show cadence and first run for each stage of a tier list")
                .arg(
                    Arg::new("stores")
                        .long("stores")
                        .default_value("hour,day,year")
                        .help("Comma separated partition granularities, first tier first"),
                ),
        );

    let matches = cli.get_matches();
    init_logging(matches.get_flag("verbose"));

    let config = match matches.get_one::<String>("config") {
        Some(path) => EtlConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => EtlConfig::default(),
    };

    match matches.subcommand() {
        Some(("failover", args)) => failover(config, args).await,
        Some(("plan", args)) => plan(&config, args),
        _ => Ok(()),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Debug, Serialize)]
struct FailoverReport {
    pv: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    expected_samples: usize,
    merged_samples: usize,
    gaps: usize,
    stages: Vec<String>,
    summary: BTreeMap<String, String>,
    passed: bool,
}

async fn failover(config: EtlConfig, args: &ArgMatches) -> Result<()> {
    let days = args.get_one::<i64>("days").copied().unwrap_or(2);
    let json = args.get_flag("json");

    let start = Utc
        .with_ymd_and_hms(2023, 3, 1, 0, 0, 0)
        .single()
        .context("invalid start date")?;
    let end = start + Duration::days(days);

    let rig = FailoverRig::new(SIM_PV);
    let expected = rig.seed(start, end);
    info!(days, samples = expected, "seeded fail-over pair");

    let registry = rig.registry(config)?;
    registry.manual_control();
    if registry.discover().await == 0 {
        bail!("{SIM_PV} was not picked up for ETL");
    }
    let run = registry
        .run_pv_etls(SIM_PV, Utc::now() + Duration::days(3_650))
        .await?;

    let merged = rig
        .primary_lts
        .events_between(SIM_PV, start - Duration::days(730), end + Duration::days(730));
    let holes = gaps(&merged, Duration::seconds(1));
    let report = FailoverReport {
        pv: SIM_PV.to_string(),
        start,
        end,
        expected_samples: expected,
        merged_samples: merged.len(),
        gaps: holes.len(),
        stages: run.outcomes.iter().map(describe).collect(),
        summary: registry.metrics().summary(Utc::now()),
        passed: merged.len() == expected && holes.is_empty(),
    };
    registry.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Fail-over merge for {}", report.pv);
        println!("  Window: {} .. {}", report.start, report.end);
        println!("  Expected samples: {}", report.expected_samples);
        println!("  Merged samples:   {}", report.merged_samples);
        println!("  Gaps:             {}", report.gaps);
        for (i, stage) in report.stages.iter().enumerate() {
            println!("  Stage {i}: {stage}");
        }
        for (name, value) in &report.summary {
            println!("  {name}: {value}");
        }
        println!("Result: {}", if report.passed { "PASS" } else { "FAIL" });
    }

    if !report.passed {
        bail!("merged tier is incomplete");
    }
    Ok(())
}

fn describe(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::AlreadyRunning => "already running".to_string(),
        JobOutcome::NothingReady => "nothing ready".to_string(),
        JobOutcome::Completed(r) => format!(
            "moved {} of {} chunks ({} bytes), gave up {}{}",
            r.chunks_moved,
            r.chunks_listed,
            r.bytes_moved,
            r.chunks_given_up,
            if r.stopped_early { ", stopped early" } else { "" }
        ),
        JobOutcome::Failed(message) => format!("failed: {message}"),
    }
}

fn plan(config: &EtlConfig, args: &ArgMatches) -> Result<()> {
    let raw = args
        .get_one::<String>("stores")
        .map_or("hour,day,year", String::as_str);
    let granularities = raw
        .split(',')
        .map(str::parse::<PartitionGranularity>)
        .collect::<Result<Vec<_>, _>>()?;
    if granularities.len() < 2 {
        bail!("need at least two tiers to plan a transition");
    }
    if granularities.len() - 1 > config.max_transitions {
        bail!(
            "{} transitions requested; configuration allows {}",
            granularities.len() - 1,
            config.max_transitions
        );
    }

    let now = Utc::now();
    let tiers: Vec<Arc<MemoryTier>> = granularities
        .iter()
        .enumerate()
        .map(|(i, g)| Arc::new(MemoryTier::new(format!("tier{i}"), *g)))
        .collect();
    let mut chain = StageChain::new("plan", Vec::new());
    for (index, pair) in tiers.windows(2).enumerate() {
        chain.push_stage(
            EtlStage::new(
                "plan",
                index,
                ValueType::default(),
                Arc::clone(&pair[0]) as _,
                Arc::clone(&pair[1]) as _,
                config.out_of_space_policy,
                Arc::new(TransitionMetrics::new(index, config.space_cache_ttl())),
            ),
            now,
        );
    }

    println!("Policy: {}", config.out_of_space_policy);
    for stage in chain.stages() {
        let source = stage.source().partition_granularity();
        let dest = stage.dest().partition_granularity();
        println!(
            "  Stage {}: {} -> {} every {}s, boundary in {}s, padding {}s, on failure {:?}",
            stage.index(),
            source,
            dest,
            stage.cadence_secs(),
            stage.initial_delay(now).as_secs(),
            stage.processing_padding().as_secs(),
            stage.effective_policy(),
        );
    }
    println!(
        "  Chain due in {}s, then every {}s",
        chain.initial_delay(now).as_secs(),
        chain.cadence().as_secs()
    );
    Ok(())
}
