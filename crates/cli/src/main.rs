#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use gensec_core::{resolve, sample, FieldSpec, InheritPolicy, ObjectKey, OsEntropy};
use gensec_kubehub::{get_kube_client, run_controller, ControllerOptions, GeneratedSecret, KubeStore};
use gensec_reconcile::{Outcome, Reconciler, ReconcilerConfig, SystemClock, DEFAULT_FIELD_MANAGER};
use kube::CustomResourceExt;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gensecctl", version, about = "Keep generated secret values in line with GeneratedSecret resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Only watch this namespace (default: all)
        #[arg(long = "ns", env = "GENSEC_NAMESPACE")]
        namespace: Option<String>,
        /// Requeue converged objects every N seconds (0: only on change)
        #[arg(long = "resync-secs", env = "GENSEC_RESYNC_SECS", default_value_t = 0)]
        resync_secs: u64,
        /// Seconds to wait before retrying a failed reconcile
        #[arg(long = "retry-secs", default_value_t = 15)]
        retry_secs: u64,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Reconcile a single GeneratedSecret once and exit
    Reconcile {
        /// Target as namespace/name
        target: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Print the GeneratedSecret CustomResourceDefinition as YAML
    Crd,
    /// Sample one value locally
    Generate {
        #[arg(long, default_value_t = 0)]
        length: u32,
        /// Characters to draw from (default: a-zA-Z0-9)
        #[arg(long, default_value = "")]
        alphabet: String,
        /// Raw bytes, printed as hex
        #[arg(long, action = ArgAction::SetTrue)]
        binary: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Writer identity for server-side apply
    #[arg(long = "field-manager", env = "GENSEC_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,
    /// Re-evaluate even when status already reflects the current generation
    #[arg(long = "no-fast-skip", env = "GENSEC_NO_FAST_SKIP", action = ArgAction::SetTrue)]
    no_fast_skip: bool,
    /// Which attributes fall back to spec.default
    #[arg(long, env = "GENSEC_INHERIT", value_enum, default_value_t = Inherit::FieldOnly)]
    inherit: Inherit,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Inherit {
    FieldOnly,
    Full,
}

impl EngineArgs {
    fn config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            field_manager: self.field_manager.clone(),
            fast_skip: !self.no_fast_skip,
            inherit: match self.inherit {
                Inherit::FieldOnly => InheritPolicy::FieldOnly,
                Inherit::Full => InheritPolicy::Full,
            },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("GENSEC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GENSEC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid GENSEC_METRICS_ADDR; expected host:port");
        }
    }
}

async fn kube_reconciler(engine: &EngineArgs) -> Result<(kube::Client, Reconciler)> {
    let client = get_kube_client().await?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let rec = Reconciler::new(store, Arc::new(SystemClock), Arc::new(OsEntropy), engine.config());
    Ok((client, rec))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { namespace, resync_secs, retry_secs, engine } => {
            init_metrics();
            info!(ns = ?namespace, config = ?engine.config(), "run invoked");
            let (client, rec) = kube_reconciler(&engine).await?;
            let opts = ControllerOptions {
                namespace,
                resync: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
                retry_after: Duration::from_secs(retry_secs),
            };
            run_controller(client, rec, opts).await?;
        }
        Commands::Reconcile { target, engine } => {
            let key = ObjectKey::parse(&target).ok_or_else(|| anyhow!("invalid target {:?} (expect namespace/name)", target))?;
            info!(key = %key, "reconcile invoked");
            let (_, rec) = kube_reconciler(&engine).await?;
            let outcome = rec.reconcile(&key).await.with_context(|| format!("reconciling {}", key))?;
            match cli.output {
                Output::Human => match &outcome {
                    Outcome::Applied(a) => println!(
                        "{} applied generation {} (generated: [{}], kept: [{}])",
                        key,
                        a.generation,
                        a.generated.join(", "),
                        a.kept.join(", ")
                    ),
                    Outcome::NoOp(_) => println!("{} {}", key, outcome.as_str()),
                },
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        key: String,
                        outcome: &'a str,
                        generated: Vec<String>,
                        kept: Vec<String>,
                    }
                    let (generated, kept) = match &outcome {
                        Outcome::Applied(a) => (a.generated.clone(), a.kept.clone()),
                        Outcome::NoOp(_) => (Vec::new(), Vec::new()),
                    };
                    let row = Row { key: key.to_string(), outcome: outcome.as_str(), generated, kept };
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
            }
        }
        Commands::Crd => {
            let crd = GeneratedSecret::crd();
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
            }
        }
        Commands::Generate { length, alphabet, binary } => {
            let field = FieldSpec { length, alphabet, binary, ttl: None };
            let spec = resolve(&field, None, InheritPolicy::FieldOnly);
            let value = sample(&spec, &OsEntropy).context("reading system entropy")?;
            if spec.binary {
                println!("{}", hex(&value));
            } else {
                println!("{}", String::from_utf8_lossy(&value));
            }
        }
    }

    Ok(())
}
