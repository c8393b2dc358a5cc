use std::path::PathBuf;

use clap::{Args, Parser as ClapParser, Subcommand as ClapSubcommand};
use ethereum_types::Address;
use sentinelx::abi::parse_address;
use sentinelx::models::{ActionPlan, IncidentId, IntentId, IntentState, MonitorId, MonitorStatus, NewMonitor};
use serde::Serialize;
use tracing::{Level, info};

use crate::initializers::{Components, init_components, load_config, serve};

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "sentinelx", version, about = "Oracle safety monitor for guarded contracts")]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "config",
        value_name = "CONFIG_FILE",
        help = "TOML configuration file. SENTINELX_* environment variables override its values.",
        env = "SENTINELX_CONFIG"
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error. RUST_LOG takes precedence.",
        env = "SENTINELX_LOG_LEVEL"
    )]
    pub log_level: Level,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "serve", about = "Run the evaluation loop and the operator HTTP API")]
    Serve {
        #[arg(long = "listen", value_name = "ADDR", help = "Overrides server.listen")]
        listen: Option<String>,
    },
    #[command(name = "evaluate", about = "Run a single evaluation pass and print the summary")]
    Evaluate {
        #[arg(long = "monitor", value_name = "MONITOR_ID", help = "Evaluate only this monitor")]
        monitor: Option<MonitorId>,
    },
    #[command(subcommand, about = "Register and manage monitors")]
    Monitor(MonitorCommand),
    #[command(subcommand, about = "Inspect and triage incidents")]
    Incident(IncidentCommand),
    #[command(subcommand, about = "Propose, approve and execute mitigation intents")]
    Intent(IntentCommand),
}

#[derive(ClapSubcommand)]
pub enum MonitorCommand {
    #[command(about = "Register a new monitor")]
    Register(RegisterArgs),
    #[command(about = "List monitors")]
    List {
        #[arg(long = "tenant", value_name = "TENANT_ID")]
        tenant: Option<String>,
    },
    #[command(about = "Set a monitor's status")]
    Status {
        id: MonitorId,
        #[arg(value_parser = clap::value_parser!(MonitorStatus))]
        status: MonitorStatus,
        #[arg(long = "actor", default_value = "cli")]
        actor: String,
    },
    #[command(about = "Schedule a synthetic price spike (demo mode)")]
    Spike {
        id: MonitorId,
        #[arg(long = "duration-secs", default_value_t = 120)]
        duration_secs: u64,
    },
}

#[derive(Args)]
pub struct RegisterArgs {
    #[arg(long = "tenant")]
    pub tenant: String,
    #[arg(long = "name")]
    pub name: String,
    #[arg(long = "guarded-contract", value_parser = address_arg)]
    pub guarded_contract: Address,
    #[arg(long = "guardian-hub", value_parser = address_arg)]
    pub guardian_hub: Option<Address>,
    #[arg(long = "router", value_parser = address_arg)]
    pub router: Option<Address>,
    #[arg(long = "oracle-key")]
    pub oracle_key: String,
    #[arg(long = "protofire-feed", value_parser = address_arg)]
    pub protofire_feed: Address,
    #[arg(long = "dia-feed", value_parser = address_arg)]
    pub dia_feed: Address,
    #[arg(long = "max-deviation-bps", default_value_t = 150)]
    pub max_deviation_bps: u32,
    #[arg(long = "stale-after-seconds", default_value_t = 300)]
    pub stale_after_seconds: u64,
}

impl From<RegisterArgs> for NewMonitor {
    fn from(args: RegisterArgs) -> Self {
        NewMonitor {
            tenant_id: args.tenant,
            name: args.name,
            guarded_contract: args.guarded_contract,
            guardian_hub: args.guardian_hub,
            router: args.router,
            oracle_key: args.oracle_key,
            protofire_feed: args.protofire_feed,
            dia_feed: args.dia_feed,
            max_deviation_bps: args.max_deviation_bps,
            stale_after_seconds: args.stale_after_seconds,
        }
    }
}

#[derive(ClapSubcommand)]
pub enum IncidentCommand {
    #[command(about = "List recent incidents, newest first")]
    List {
        #[arg(long = "monitor", value_name = "MONITOR_ID")]
        monitor: Option<MonitorId>,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
    #[command(name = "ack", about = "Acknowledge an open incident")]
    Acknowledge {
        id: IncidentId,
        #[arg(long = "actor", default_value = "cli")]
        actor: String,
    },
    #[command(about = "Close an incident")]
    Close {
        id: IncidentId,
        #[arg(long = "actor", default_value = "cli")]
        actor: String,
    },
}

#[derive(ClapSubcommand)]
pub enum IntentCommand {
    #[command(about = "List intents")]
    List {
        #[arg(long = "incident", value_name = "INCIDENT_ID")]
        incident: Option<IncidentId>,
        #[arg(long = "state", value_parser = clap::value_parser!(IntentState))]
        state: Option<IntentState>,
    },
    #[command(about = "Propose a manual action against an incident")]
    Propose {
        #[arg(long = "incident", value_name = "INCIDENT_ID")]
        incident: IncidentId,
        #[arg(long = "proposer", default_value = "cli")]
        proposer: String,
        #[arg(long = "name")]
        name: String,
        #[arg(long = "target", help = "Contract the transaction is sent to")]
        target: String,
        #[arg(long = "calldata", help = "0x-prefixed ABI-encoded call")]
        calldata: String,
        #[arg(long = "rationale", default_value = "")]
        rationale: String,
    },
    #[command(about = "Approve a proposed intent")]
    Approve(ActorArgs),
    #[command(about = "Reject a proposed intent")]
    Reject(ActorArgs),
    #[command(about = "Sign and broadcast an approved intent")]
    Execute(ActorArgs),
    #[command(about = "Re-check the receipt of an executing intent")]
    Reconcile(ActorArgs),
}

#[derive(Args)]
pub struct ActorArgs {
    pub id: IntentId,
    #[arg(long = "actor", default_value = "cli")]
    pub actor: String,
}

fn address_arg(raw: &str) -> Result<Address, String> {
    parse_address(raw).ok_or_else(|| format!("not a 20-byte hex address: {raw}"))
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> eyre::Result<()> {
        let config = load_config(opts)?;
        let components = init_components(&config)?;

        match self {
            Subcommand::Serve { listen } => {
                let listen = listen.unwrap_or_else(|| config.server.listen.clone());
                serve(components, &config, &listen).await
            }
            Subcommand::Evaluate { monitor: Some(id) } => {
                print_json(&components.evaluator.evaluate_monitor(id).await?)
            }
            Subcommand::Evaluate { monitor: None } => print_json(&components.evaluator.evaluate_all().await?),
            Subcommand::Monitor(command) => command.run(&components),
            Subcommand::Incident(command) => command.run(&components),
            Subcommand::Intent(command) => command.run(&components).await,
        }
    }
}

impl MonitorCommand {
    fn run(self, components: &Components) -> eyre::Result<()> {
        let registry = &components.registry;
        match self {
            MonitorCommand::Register(args) => {
                let monitor = registry.register(args.into())?;
                info!(monitor_id = monitor.id, "monitor registered");
                print_json(&monitor)
            }
            MonitorCommand::List { tenant } => print_json(&registry.list(tenant.as_deref())?),
            MonitorCommand::Status { id, status, actor } => print_json(&registry.set_status(id, status, &actor)?),
            MonitorCommand::Spike { id, duration_secs } => {
                print_json(&registry.schedule_demo_spike(id, duration_secs)?)
            }
        }
    }
}

impl IncidentCommand {
    fn run(self, components: &Components) -> eyre::Result<()> {
        let desk = &components.incidents;
        match self {
            IncidentCommand::List { monitor, limit } => print_json(&desk.list(monitor, limit)?),
            IncidentCommand::Acknowledge { id, actor } => print_json(&desk.acknowledge(id, &actor)?),
            IncidentCommand::Close { id, actor } => print_json(&desk.close(id, &actor)?),
        }
    }
}

impl IntentCommand {
    async fn run(self, components: &Components) -> eyre::Result<()> {
        let intents = &components.intents;
        match self {
            IntentCommand::List { incident, state } => print_json(&intents.list(incident, state)?),
            IntentCommand::Propose {
                incident,
                proposer,
                name,
                target,
                calldata,
                rationale,
            } => {
                let plan = ActionPlan {
                    name,
                    target,
                    calldata,
                    arguments: serde_json::Value::Null,
                };
                print_json(&intents.propose(incident, &proposer, plan, &rationale)?)
            }
            IntentCommand::Approve(ActorArgs { id, actor }) => print_json(&intents.approve(id, &actor)?),
            IntentCommand::Reject(ActorArgs { id, actor }) => print_json(&intents.reject(id, &actor)?),
            IntentCommand::Execute(ActorArgs { id, actor }) => print_json(&intents.execute(id, &actor).await?),
            IntentCommand::Reconcile(ActorArgs { id, actor }) => print_json(&intents.reconcile(id, &actor).await?),
        }
    }
}
