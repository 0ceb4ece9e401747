use std::{sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::*;

fn main() {
    use clap::{
        Arg, ArgAction, Command, crate_authors, crate_description, crate_name, crate_version,
        value_parser,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run controllers").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("watch_namespaces")
                .long("watch-namespaces")
                .env("WATCH_NAMESPACES")
                .help("comma-separated namespaces to restrict mirroring to; empty watches all")
                .default_value(""),
            Arg::new("excluded_namespaces")
                .long("excluded-namespaces")
                .env("EXCLUDED_NAMESPACES")
                .help("comma-separated namespace globs that never receive mirrors")
                .default_value("kube-system,kube-public,kube-node-lease,openshift-*"),
            Arg::new("allowed_namespaces")
                .long("allowed-namespaces")
                .env("ALLOWED_NAMESPACES")
                .help("comma-separated namespace globs eligible for mirrors; empty allows all")
                .default_value(""),
            Arg::new("kinds")
                .long("kinds")
                .env("MIRRORED_KINDS")
                .help("comma-separated Kind.version.group list; empty auto-discovers")
                .default_value(""),
            Arg::new("workers")
                .long("workers")
                .help("concurrent reconciles per kind")
                .value_parser(value_parser!(u16))
                .default_value("2"),
            Arg::new("rate_limit_qps")
                .long("rate-limit-qps")
                .help("reconcile token-bucket refill rate")
                .value_parser(value_parser!(f64))
                .default_value("10"),
            Arg::new("rate_limit_burst")
                .long("rate-limit-burst")
                .help("reconcile token-bucket burst")
                .value_parser(value_parser!(u32))
                .default_value("20"),
            Arg::new("reconcile_interval")
                .long("reconcile-interval")
                .help("seconds between periodic re-reconciles of healthy sources")
                .value_parser(value_parser!(u64))
                .default_value("600"),
            Arg::new("scan_interval")
                .long("scan-interval")
                .help("seconds between dynamic-manager scans")
                .value_parser(value_parser!(u64))
                .default_value("300"),
            Arg::new("debounce")
                .long("debounce")
                .help("seconds to debounce watch events per kind")
                .value_parser(value_parser!(u64))
                .default_value("1"),
            Arg::new("max_targets")
                .long("max-targets")
                .help("cap on resolved target namespaces per source")
                .value_parser(value_parser!(usize))
                .default_value("250"),
            Arg::new("dry_run")
                .long("dry-run")
                .help("log writes instead of sending them")
                .action(ArgAction::SetTrue),
            Arg::new("verify_source_freshness")
                .long("verify-source-freshness")
                .help("re-read sources directly before mirroring")
                .action(ArgAction::SetTrue),
            Arg::new("require_opt_in")
                .long("require-opt-in")
                .help("only namespaces labeled allow-mirrors=true receive mirrors")
                .action(ArgAction::SetTrue),
            Arg::new("transform_strict")
                .long("transform-strict")
                .help("treat any transform error as fatal for the target")
                .action(ArgAction::SetTrue),
            Arg::new("transform_timeout_ms")
                .long("transform-timeout-ms")
                .help("hard cap on a single template render, in milliseconds")
                .value_parser(value_parser!(u64))
                .default_value("100"),
            Arg::new("max_transform_rules")
                .long("max-transform-rules")
                .help("cap on rules per transform annotation")
                .value_parser(value_parser!(usize))
                .default_value("64"),
            Arg::new("max_transform_bytes")
                .long("max-transform-bytes")
                .help("cap on the transform annotation size")
                .value_parser(value_parser!(usize))
                .default_value("16384"),
            Arg::new("breaker_failure_threshold")
                .long("breaker-failure-threshold")
                .help("consecutive failures before a source's circuit opens")
                .value_parser(value_parser!(u32))
                .default_value("5"),
            Arg::new("breaker_reset_timeout")
                .long("breaker-reset-timeout")
                .help("seconds an open circuit waits before probing")
                .value_parser(value_parser!(u64))
                .default_value("60"),
            Arg::new("breaker_half_open_successes")
                .long("breaker-half-open-successes")
                .help("probe successes needed to close a circuit")
                .value_parser(value_parser!(u32))
                .default_value("2"),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    introspection_address: std::net::SocketAddr,
    settings: Settings,
}

fn csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        let secs = |name: &str| Duration::from_secs(*m.get_one::<u64>(name).unwrap());
        Ok(Self {
            introspection_address: m
                .get_one::<String>("introspection_address")
                .unwrap()
                .parse()?,
            settings: Settings {
                watch_namespaces: csv(m.get_one::<String>("watch_namespaces").unwrap()),
                excluded_namespaces: csv(m.get_one::<String>("excluded_namespaces").unwrap()),
                allowed_namespaces: csv(m.get_one::<String>("allowed_namespaces").unwrap()),
                kinds: csv(m.get_one::<String>("kinds").unwrap()),
                workers: *m.get_one::<u16>("workers").unwrap(),
                rate_limit_qps: *m.get_one::<f64>("rate_limit_qps").unwrap(),
                rate_limit_burst: *m.get_one::<u32>("rate_limit_burst").unwrap(),
                reconcile_interval: secs("reconcile_interval"),
                scan_interval: secs("scan_interval"),
                debounce: secs("debounce"),
                max_targets: *m.get_one::<usize>("max_targets").unwrap(),
                dry_run: m.get_flag("dry_run"),
                verify_source_freshness: m.get_flag("verify_source_freshness"),
                require_opt_in: m.get_flag("require_opt_in"),
                transform_strict: m.get_flag("transform_strict"),
                transform_limits: mirror_transform::Limits {
                    max_rules: *m.get_one::<usize>("max_transform_rules").unwrap(),
                    max_bytes: *m.get_one::<usize>("max_transform_bytes").unwrap(),
                    render_timeout: Duration::from_millis(
                        *m.get_one::<u64>("transform_timeout_ms").unwrap(),
                    ),
                },
                breaker: breaker::Config {
                    failure_threshold: *m.get_one::<u32>("breaker_failure_threshold").unwrap(),
                    reset_timeout: secs("breaker_reset_timeout"),
                    half_open_success_threshold: *m
                        .get_one::<u32>("breaker_half_open_successes")
                        .unwrap(),
                },
            },
        })
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
        controller::metrics::register();
    });
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();

    let (store, writer) = reflector::store::<Namespace>();
    let ctx = Arc::new(Context::new(client, args.settings, store));
    let discovery = Arc::new(discovery::DiscoveryManager::new(
        ctx.client.clone(),
        ctx.settings.scan_interval,
        ctx.settings.kinds.clone(),
    ));
    // The first enumeration is part of bootstrap: a cluster we cannot
    // discover against is a configuration problem, not a retry case.
    let kinds = discovery.refresh().await?;
    info!(kinds, "initial discovery finished");

    let manager = Arc::new(manager::DynamicControllerManager::new(
        ctx.clone(),
        discovery.clone(),
        token.clone(),
    ));

    info!("setup done, starting controllers");
    let mut tasks = task::JoinSet::new();
    tasks.spawn(namespaces::watch(
        token.clone(),
        ctx.clone(),
        manager.clone(),
        writer,
    ));
    {
        let (discovery, cancel) = (discovery.clone(), token.clone());
        tasks.spawn(async move {
            discovery.run(cancel).await;
            Ok(())
        });
    }
    {
        let manager = manager.clone();
        tasks.spawn(async move {
            manager.run().await;
            Ok(())
        });
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}
