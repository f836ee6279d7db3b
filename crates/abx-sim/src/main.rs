use abx_core::EngineConfig;
use abx_sim::{run_simulator, SimulatorConfig};
use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

fn cli() -> Command {
    Command::new("abx-sim")
        .version(abx_core::VERSION)
        .about("ABX experiment engine simulator")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run seeded experiments against synthetic configurations")
                .arg(
                    Arg::new("control-rate")
                        .long("control-rate")
                        .default_value("0.5")
                        .value_parser(value_parser!(f64))
                        .help("True success probability of the control"),
                )
                .arg(
                    Arg::new("variant-rate")
                        .long("variant-rate")
                        .default_value("0.6")
                        .value_parser(value_parser!(f64))
                        .help("True success probability of the variant"),
                )
                .arg(
                    Arg::new("samples")
                        .long("samples")
                        .default_value("500")
                        .value_parser(value_parser!(u32))
                        .help("Target sample size per arm"),
                )
                .arg(
                    Arg::new("confidence")
                        .long("confidence")
                        .default_value("95")
                        .value_parser(value_parser!(f64))
                        .help("Confidence threshold in percent"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0")
                        .value_parser(value_parser!(f64))
                        .help("Fraction of harness calls that fail"),
                )
                .arg(
                    Arg::new("experiments")
                        .long("experiments")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Experiments to run side by side"),
                )
                .arg(
                    Arg::new("tick-ms")
                        .long("tick-ms")
                        .value_parser(value_parser!(u64))
                        .help("Drive through the scheduler with this tick delay"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("FILE")
                        .help("Engine configuration (TOML)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = Registry::default().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn arg<T: Clone + Send + Sync + 'static>(args: &ArgMatches, name: &str) -> anyhow::Result<T> {
    args.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{name}"))
}

fn engine_config(args: &ArgMatches) -> anyhow::Result<EngineConfig> {
    let Some(path) = args.get_one::<String>("config") else {
        return Ok(EngineConfig::new());
    };
    let source =
        std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
    EngineConfig::from_toml_str(&source).with_context(|| format!("parsing config {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: arg(args, "seed")?,
                control_rate: arg(args, "control-rate")?,
                variant_rate: arg(args, "variant-rate")?,
                target_sample_size: arg(args, "samples")?,
                confidence: arg(args, "confidence")?,
                failure_rate: arg(args, "failure-rate")?,
                experiments: arg(args, "experiments")?,
                tick_ms: args.get_one::<u64>("tick-ms").copied(),
                engine: engine_config(args)?,
            };

            let report = run_simulator(config).await?;

            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }

            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        _ => {
            cli().print_help()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_defaults() {
        let matches = cli().get_matches_from(["abx-sim", "simulate", "--samples", "80"]);
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(arg::<u32>(args, "samples").unwrap(), 80);
        assert_eq!(arg::<u64>(args, "seed").unwrap(), 42);
        assert!(args.get_one::<u64>("tick-ms").is_none());
        assert!(!args.get_flag("json"));
    }
}
