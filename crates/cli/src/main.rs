use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use defsmith_core::{convert::workload_to_component, Definition, DefinitionKind, ObjectKey};
use defsmith_engine::{Engine, EngineConfig, ReconcileOutcome};
use defsmith_persist::SqliteStore;
use defsmith_schema::{BuiltinDeriver, SchemaDeriver};
use defsmith_store::{resource_version, ObjectStore};
use serde_json::{json, Value as Json};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "defsmithctl", version, about = "Defsmith definition revision and schema engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for lookups and watches
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a definition file and show what the engine sees
    Inspect {
        file: String,
        /// Print a WorkloadDefinition converted to a ComponentDefinition
        #[arg(long = "as-component", action = ArgAction::SetTrue)]
        as_component: bool,
    },
    /// Store a definition file in the local database and reconcile it once
    Reconcile { file: String },
    /// List stored revisions of a definition
    Revisions {
        /// Definition kind, e.g. TraitDefinition
        kind: String,
        name: String,
        /// Print the frozen schematic of this revision index
        #[arg(long = "show")]
        show: Option<u64>,
    },
    /// Print the CUE template of a component or trait definition
    Template {
        /// Capability type: component or trait
        capability_type: String,
        name: String,
    },
    /// Validate a parameter file against a definition's derived schema
    #[cfg(feature = "validate")]
    Validate { definition: String, params: String },
    /// Watch the cluster and reconcile definitions continuously
    Run {
        /// Definition kinds to watch (default: all)
        #[arg(long = "kind")]
        kinds: Vec<String>,
        /// Delay before retrying a transiently failed reconcile
        #[arg(long = "requeue-ms", default_value_t = 2000)]
        requeue_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("DEFSMITH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DEFSMITH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DEFSMITH_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_definition(path: &str) -> Result<Definition> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing YAML in {}", path))?;
    let raw = serde_json::to_value(doc).context("converting YAML to JSON")?;
    Ok(Definition::from_value(raw)?)
}

fn open_store(cfg: &EngineConfig) -> Result<Arc<SqliteStore>> {
    let store = match &cfg.db_path {
        Some(p) => SqliteStore::open(&p.to_string_lossy())?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

/// Create or overwrite the stored copy of `def`, keeping the stored status.
async fn upsert(store: &dyn ObjectStore, def: &Definition) -> Result<ObjectKey> {
    let key = def.key();
    let mut raw = def.as_value().clone();
    if let Some(obj) = raw.as_object_mut() {
        obj.remove("status");
    }
    match store.get_opt(&key).await? {
        None => {
            store.create(raw).await?;
        }
        Some(cur) => {
            store.update(raw, resource_version(&cur)).await?;
        }
    }
    Ok(key)
}

fn print(output: Output, value: &Json, human: impl FnOnce()) -> Result<()> {
    match output {
        Output::Human => human(),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = EngineConfig::from_env();
    let ns = cli.namespace.clone().unwrap_or_else(|| defsmith_core::DEFAULT_NAMESPACE.to_string());

    match cli.command {
        Commands::Inspect { file, as_component } => {
            let def = read_definition(&file)?;
            if as_component {
                if !def.is_workload_definition() {
                    return Err(anyhow!("{} is a {}, not a WorkloadDefinition", def.name(), def.kind_str()));
                }
                let comp = workload_to_component(&def)?;
                match cli.output {
                    Output::Human => print!("{}", serde_yaml::to_string(comp.as_value())?),
                    Output::Json => println!("{}", serde_json::to_string_pretty(comp.as_value())?),
                }
                return Ok(());
            }
            let decoded = def.decode()?;
            let schema = match &decoded.schematic {
                Some(s) => BuiltinDeriver.derive(s).unwrap_or_else(|e| {
                    warn!(error = %e, "schema derivation failed");
                    None
                }),
                None => None,
            };
            let view = json!({
                "kind": decoded.kind,
                "capabilityType": decoded.kind.capability_type(),
                "name": def.name(),
                "namespace": def.namespace(),
                "engine": decoded.schematic.as_ref().map(|s| s.engine().as_str()),
                "revisionHash": decoded.schematic.as_ref().map(|s| s.fingerprint()),
                "reference": decoded.reference,
                "userLabels": def.user_labels(),
                "userAnnotations": def.user_annotations(),
                "schema": schema,
            });
            print(cli.output, &view, || {
                println!("{} {}/{}", decoded.kind, def.namespace(), def.name());
                match &decoded.schematic {
                    Some(s) => println!("engine:    {} ({})", s.engine(), s.fingerprint()),
                    None => println!("engine:    -"),
                }
                if let Some(r) = &decoded.reference {
                    let v = if r.is_latest() { "latest" } else { r.version.as_str() };
                    println!("reference: {}@{}", r.name, v);
                }
                for (k, v) in def.user_labels().iter().chain(def.user_annotations().iter()) {
                    println!("user:      {}={}", k, v);
                }
                match &schema {
                    Some(s) => println!("{}", serde_json::to_string_pretty(s).unwrap_or_default()),
                    None => println!("schema:    none"),
                }
            })?;
        }
        Commands::Reconcile { file } => {
            let def = read_definition(&file)?;
            let store = open_store(&cfg)?;
            let key = upsert(store.as_ref(), &def).await?;
            let engine = Engine::new(store.clone(), cfg);
            let outcome = engine.reconcile(&key).await?;
            let value = serde_json::to_value(&outcome)?;
            print(cli.output, &value, || match &outcome {
                ReconcileOutcome::Gone => println!("{} is gone", key),
                ReconcileOutcome::Reconciled(r) => {
                    println!("{}", r.owner);
                    println!("revision:  {} ({:?})", r.latest_revision.name, r.revision_action);
                    println!("schema:    {:?}", r.schema);
                    println!("status:    {}", if r.status_written { "updated" } else { "unchanged" });
                }
            })?;
        }
        Commands::Revisions { kind, name, show } => {
            let kind = DefinitionKind::classify(&kind)?;
            let store = open_store(&cfg)?;
            let engine = Engine::new(store, cfg);
            let key = ObjectKey::new(kind.as_str(), &ns, &name);
            if let Some(index) = show {
                let schematic = engine.template_at(&key, index).await?;
                let value = serde_json::to_value(&schematic)?;
                print(cli.output, &value, || match &schematic {
                    Some(s) => match s.cue_template() {
                        Some(t) => print!("{}", t),
                        None => println!("{}", serde_json::to_string_pretty(&s.to_value()).unwrap_or_default()),
                    },
                    None => println!("revision {} has no schematic", index),
                })?;
                return Ok(());
            }
            let revs = engine.list_revisions(&key).await?;
            let value = Json::Array(
                revs.iter()
                    .map(|r| json!({ "name": r.name, "revision": r.index, "revisionHash": r.revision_hash, "createdAt": r.created_at }))
                    .collect(),
            );
            print(cli.output, &value, || {
                println!("{:<32} {:<8} {:<18} CREATED", "NAME", "REV", "HASH");
                for r in revs.iter() {
                    println!("{:<32} {:<8} {:<18} {}", r.name, r.index, r.revision_hash, r.created_at);
                }
            })?;
        }
        Commands::Template { capability_type, name } => {
            let store = open_store(&cfg)?;
            let engine = Engine::new(store, cfg);
            let template = engine.template_for(&capability_type, &name, &ns).await?;
            print(cli.output, &json!({ "template": template }), || print!("{}", template))?;
        }
        #[cfg(feature = "validate")]
        Commands::Validate { definition, params } => {
            let def = read_definition(&definition)?;
            let schema = match def.decode()?.schematic {
                Some(s) => BuiltinDeriver.derive(&s)?,
                None => None,
            };
            let schema = schema.ok_or_else(|| anyhow!("{} has no derivable parameter schema", def.name()))?;
            let text = std::fs::read_to_string(&params).with_context(|| format!("reading {}", params))?;
            let issues = defsmith_schema::validate::validate_yaml(&schema, &text)?;
            let value = json!(issues.iter().map(|i| json!({ "path": i.path, "error": i.error, "hint": i.hint })).collect::<Vec<_>>());
            print(cli.output, &value, || {
                if issues.is_empty() {
                    println!("ok");
                }
                for i in issues.iter() {
                    match &i.hint {
                        Some(h) => println!("{}: {} ({})", i.path, i.error, h),
                        None => println!("{}: {}", i.path, i.error),
                    }
                }
            })?;
        }
        Commands::Run { kinds, requeue_ms } => {
            let kinds: Vec<DefinitionKind> = if kinds.is_empty() {
                DefinitionKind::ALL.to_vec()
            } else {
                kinds.iter().map(|k| DefinitionKind::classify(k)).collect::<Result<_, _>>()?
            };
            let client = defsmith_kubehub::client().await?;
            let store = Arc::new(defsmith_kubehub::KubeStore::new(client.clone()));
            let cap = cfg.queue_cap;
            let engine = Arc::new(Engine::new(store, cfg));
            let (tx, rx) = mpsc::channel::<ObjectKey>(cap);
            let watch_ns = cli.namespace.clone();
            let mut watchers = Vec::new();
            for kind in kinds {
                let client = client.clone();
                let tx = tx.clone();
                let watch_ns = watch_ns.clone();
                watchers.push(tokio::spawn(async move {
                    if let Err(e) = defsmith_kubehub::start_watcher(client, kind.as_str(), watch_ns.as_deref(), tx).await {
                        error!(kind = kind.as_str(), error = ?e, "watcher failed");
                    }
                }));
            }
            drop(tx);
            info!(ns = ?watch_ns, "controller running; Ctrl-C to stop");
            let controller = defsmith_kubehub::run_controller(engine, rx, cap, Duration::from_millis(requeue_ms));
            tokio::select! {
                _ = controller => info!("all watchers ended"),
                _ = signal::ctrl_c() => info!("interrupted; shutting down"),
            }
            for w in watchers {
                w.abort();
            }
        }
    }
    Ok(())
}
