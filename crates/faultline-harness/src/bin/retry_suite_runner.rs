use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use faultline_error::HarnessError;
use faultline_harness::catalog::{self, Catalog};
use faultline_harness::config::{HarnessConfig, LOG_FILTER_ENV};
use faultline_harness::injector::InjectionLedger;
use faultline_harness::log::{RunBundle, RunStatus};
use faultline_harness::services::{ResolvedTarget, TargetSystem};
use faultline_harness::sim::SimulatedArray;
use faultline_harness::suite::{self, StartPoint, SuiteDriver, SuiteOptions};
use faultline_types::{SuiteLevel, TopologyKind};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Simulated targets, one raid group each.
const SIM_TARGETS: [(TopologyKind, u32); 7] = [
    (TopologyKind::Raid0, 3),
    (TopologyKind::Raid1, 2),
    (TopologyKind::Raid10, 4),
    (TopologyKind::Raid3, 5),
    (TopologyKind::Raid5, 3),
    (TopologyKind::Raid5, 5),
    (TopologyKind::Raid6, 6),
];

#[derive(Debug)]
struct CliConfig {
    level: SuiteLevel,
    kind: Option<TopologyKind>,
    options: SuiteOptions,
    config_path: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    list: bool,
    export_catalog: Option<PathBuf>,
}

fn print_help() {
    let help = "\
retry_suite_runner: run the retry-validation scenario catalog against the simulated array

USAGE:
    cargo run -p faultline-harness --bin retry_suite_runner -- [OPTIONS]

OPTIONS:
    --level <qual|extended>   Suite level (default: qual)
    --kind <KIND>             Only targets of this kind (raid0, raid1, raid10, raid3, raid5, raid6)
    --start-table <N>         Table to start from (default: 0)
    --start-index <N>         Case index to resume at inside the start table
    --start-tag <TAG>         Source tag to resume at inside the start table
    --max-cases <N>           Stop after N cases
    --repeat <N>              Run each case N times (default: 1)
    --abort-only              Only cases that accept a client abort
    --config <PATH>           Harness config JSON (FAULTLINE_* variables override it)
    --catalog <PATH>          Load the scenario catalog from JSON instead of the built-in one
    --list                    Print the planned cases and exit
    --export-catalog <PATH>   Write the built-in catalog as JSON and exit
    -h, --help                Show this help

ENVIRONMENT:
    FAULTLINE_LOG             tracing filter (default: info)
";
    println!("{help}");
}

fn parse_count(flag: &str, value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("{flag} expects a non-negative integer, got {value}"))
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str, String> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig {
        level: SuiteLevel::Qualification,
        kind: None,
        options: SuiteOptions::default(),
        config_path: None,
        catalog_path: None,
        list: false,
        export_catalog: None,
    };

    let mut index = 0;
    while index < args.len() {
        let flag = args[index].as_str();
        match flag {
            "--level" => {
                config.level = match take_value(args, &mut index, flag)? {
                    "qual" | "qualification" => SuiteLevel::Qualification,
                    "extended" => SuiteLevel::Extended,
                    other => return Err(format!("unknown level: {other}")),
                };
            }
            "--kind" => config.kind = Some(take_value(args, &mut index, flag)?.parse()?),
            "--start-table" => {
                let table = parse_count(flag, take_value(args, &mut index, flag)?)?;
                config.options.start_table = table;
            }
            "--start-index" => {
                let start = parse_count(flag, take_value(args, &mut index, flag)?)?;
                config.options.start_at = Some(StartPoint::Index(start));
            }
            "--start-tag" => {
                let tag = take_value(args, &mut index, flag)?;
                config.options.start_at = Some(StartPoint::SourceTag(tag.to_owned()));
            }
            "--max-cases" => {
                let max = parse_count(flag, take_value(args, &mut index, flag)?)?;
                config.options.max_cases = Some(max);
            }
            "--repeat" => {
                let repeat = parse_count(flag, take_value(args, &mut index, flag)?)?;
                config.options.repeat_count =
                    u32::try_from(repeat).map_err(|_| format!("--repeat too large: {repeat}"))?;
            }
            "--abort-only" => config.options.abort_only = true,
            "--config" => {
                config.config_path = Some(PathBuf::from(take_value(args, &mut index, flag)?));
            }
            "--catalog" => {
                config.catalog_path = Some(PathBuf::from(take_value(args, &mut index, flag)?));
            }
            "--list" => config.list = true,
            "--export-catalog" => {
                config.export_catalog = Some(PathBuf::from(take_value(args, &mut index, flag)?));
            }
            "-h" | "--help" => {
                print_help();
                return Err(String::new());
            }
            unknown => return Err(format!("unknown option: {unknown}")),
        }
        index += 1;
    }

    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn run(cli: &CliConfig) -> Result<(), HarnessError> {
    if let Some(path) = &cli.export_catalog {
        return catalog::builtin().export_json(path);
    }

    let harness_config = match &cli.config_path {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    }
    .apply_env()?;

    let loaded;
    let catalog: &Catalog = match &cli.catalog_path {
        Some(path) => {
            loaded = Catalog::load_json(path)?;
            &loaded
        }
        None => catalog::builtin(),
    };
    let tables = match cli.kind {
        Some(kind) => catalog.tables_for(kind, cli.level),
        None => catalog.tables_at(cli.level),
    };

    if cli.list {
        for planned in suite::plan(&tables, &cli.options)? {
            println!(
                "{:>3}.{:<3} {:<16} {}",
                planned.table_index, planned.case_index, planned.table.name, planned.case
            );
        }
        return Ok(());
    }

    let sim = SimulatedArray::new();
    let targets = SIM_TARGETS
        .iter()
        .filter(|(kind, _)| cli.kind.is_none_or(|wanted| wanted == *kind))
        .map(|(kind, width)| {
            let topology = sim.add_raid_group(&format!("{kind}-w{width}"), *kind, *width);
            ResolvedTarget::resolve(&topology, &sim)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ledger = InjectionLedger::new();
    let bundle = match &harness_config.artifact_dir {
        Some(dir) => Some(RunBundle::create(dir, &format!("retry-{}", cli.level), &run_id())?),
        None => None,
    };
    let mut driver = SuiteDriver::new(TargetSystem::from_backend(&sim), &harness_config, &ledger);
    if let Some(bundle) = &bundle {
        driver = driver.with_bundle(bundle);
    }

    let outcome = driver.run(&tables, &targets, &cli.options);
    if let Some(bundle) = bundle {
        let status = if outcome.is_ok() {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        let root = bundle.finish(status)?;
        eprintln!("run bundle: {}", root.display());
    }
    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    format!("{secs}-{}", std::process::id())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(error) if error.is_empty() => return ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR retry_suite_runner failed: {error}");
            return ExitCode::from(2);
        }
    };

    init_tracing();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR retry_suite_runner failed: {error}");
            if let Some(hint) = error.suggestion() {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(1))
        }
    }
}
