//! `esrep` actions: VM replication between a master and a slave host.
//!
//! The command runs on the slave's host. The local helper manages the slave
//! side, the master side is reached over SSH, and streams are pulled from the
//! master by the local transfer helper.

use super::{json_pretty, read_json_input};
use crate::callback::CommandCallback;
use crate::{failure, load_config};
use clap::{Args, Subcommand};
use esrep_core::{Replication, ReplicationOptions, ReplicationSettings, Response};
use esrep_driver::{CancelToken, CommandRunner, Drivers, ShellHost, ShellTransfer, SshTarget, Target};
use esrep_types::EsrepConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Args)]
pub struct ReplicationArgs {
    /// UUID of the master (source) VM.
    #[arg(short = 'm', long = "master")]
    pub master: String,

    /// UUID of the slave (replica) VM.
    #[arg(short = 's', long = "slave")]
    pub slave: String,

    /// Address of the master host, as passed to SSH.
    #[arg(short = 'H', long = "master-host")]
    pub master_host: Option<String>,

    /// Replication ID; part of snapshot and property names.
    #[arg(short = 'i', long, default_value_t = 1)]
    pub id: u32,

    /// Slave VM definition for init (`-` reads stdin).
    #[arg(short = 'j', long = "json-file")]
    pub json_file: Option<PathBuf>,

    /// Seconds between sync cycles; sync once when omitted.
    #[arg(short = 't', long = "sleep-time")]
    pub sleep_time: Option<f64>,

    /// Program run after each sync cycle, as `program[:arg...]`.
    #[arg(short = 'c', long)]
    pub callback: Option<String>,

    /// Bandwidth limit for transfers (e.g. `10m`).
    #[arg(short = 'l', long = "bwlimit")]
    pub limit: Option<String>,

    /// Enable the replication service right after svc_create.
    #[arg(short = 'e', long, default_value_t = false)]
    pub enabled: bool,

    /// Continue past failures on the master side.
    #[arg(short = 'f', long, default_value_t = false)]
    pub force: bool,

    /// Do not print intermediate sync results.
    #[arg(short = 'q', long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
pub enum ReplicationCommand {
    /// Create the slave VM and run the initial full sync.
    Init(ReplicationArgs),
    /// Incremental sync from the master; loops with --sleep-time.
    Sync(ReplicationArgs),
    /// Promote the slave and demote the master.
    Failover(ReplicationArgs),
    /// Turn the old master into a slave of the promoted VM.
    Reinit(ReplicationArgs),
    /// Remove the slave VM and unlink the master disks.
    Destroy(ReplicationArgs),
    /// Destroy the slave VM and clear replication metadata from the master disks.
    #[command(alias = "destroy-clear")]
    DestroyClear(ReplicationArgs),
    /// Remove leftover replication state from a master VM.
    Clear(ReplicationArgs),
    /// Install the periodic sync service for this replica.
    #[command(alias = "svc-create")]
    SvcCreate(ReplicationArgs),
    /// Remove the periodic sync service.
    #[command(alias = "svc-remove")]
    SvcRemove(ReplicationArgs),
    /// Enable the periodic sync service.
    #[command(alias = "svc-enable")]
    SvcEnable(ReplicationArgs),
    /// Disable the periodic sync service.
    #[command(alias = "svc-disable")]
    SvcDisable(ReplicationArgs),
    /// Report the state of the periodic sync service.
    #[command(alias = "svc-status")]
    SvcStatus(ReplicationArgs),
}

impl ReplicationCommand {
    fn into_parts(self) -> (fn(&mut Replication) -> Response, bool, ReplicationArgs) {
        match self {
            Self::Init(args) => (Replication::init, true, args),
            Self::Sync(args) => (Replication::sync, true, args),
            Self::Failover(args) => (Replication::failover, true, args),
            Self::Reinit(args) => (Replication::reinit, true, args),
            Self::Destroy(args) => (Replication::destroy, true, args),
            Self::DestroyClear(args) => (Replication::destroy_clear, true, args),
            Self::SvcCreate(args) => (Replication::svc_create, true, args),
            Self::Clear(args) => (Replication::clear, false, args),
            Self::SvcRemove(args) => (Replication::svc_remove, false, args),
            Self::SvcEnable(args) => (Replication::svc_enable, false, args),
            Self::SvcDisable(args) => (Replication::svc_disable, false, args),
            Self::SvcStatus(args) => (Replication::svc_status, false, args),
        }
    }
}

pub fn run(command: ReplicationCommand, config: Option<&Path>, cancel: CancelToken) -> Response {
    let (action, needs_master, args) = command.into_parts();
    match engine(args, needs_master, config, cancel) {
        Ok(mut engine) => action(&mut engine),
        Err(msg) => failure(msg),
    }
}

fn engine(
    args: ReplicationArgs,
    needs_master: bool,
    config: Option<&Path>,
    cancel: CancelToken,
) -> Result<Replication, String> {
    let config = load_config(config)?;
    let master_host = match args.master_host {
        Some(host) => host,
        None if needs_master => return Err("Master host (-H) is required".to_owned()),
        None => String::new(),
    };

    let callback = match args.callback.as_deref() {
        Some(spec) => Some(
            CommandCallback::parse(spec).ok_or_else(|| format!("Invalid callback \"{spec}\""))?,
        ),
        None => None,
    };
    let slave_definition = args
        .json_file
        .as_deref()
        .map(read_json_input)
        .transpose()?;

    let mut options = ReplicationOptions::new(args.master, args.slave, master_host.clone());
    options.id = args.id;
    options.force = args.force;
    options.quiet = args.quiet;
    options.limit = args.limit;
    options.sleep_time = args.sleep_time;
    options.enabled = args.enabled;
    options.callback = args.callback;
    options.slave_definition = slave_definition;
    info!(
        "replication {} of {} -> {} (master host {master_host:?})",
        options.id, options.master_uuid, options.slave_uuid
    );

    let drivers = drivers(&config, &master_host, &cancel);
    let settings = ReplicationSettings::from_config(&config);
    let mut engine = Replication::new(options, drivers, settings, cancel).with_progress(|fields| {
        match json_pretty(fields) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("cannot print sync progress: {e}"),
        }
    });
    if let Some(callback) = callback {
        engine = engine.with_callback(callback);
    }
    Ok(engine)
}

fn drivers(config: &EsrepConfig, master_host: &str, cancel: &CancelToken) -> Drivers {
    let helper = config.helpers.esrep.clone();
    let master = SshTarget::new(master_host, config.ssh.clone());
    Drivers::new(
        ShellHost::new(CommandRunner::local(cancel.clone()), helper.clone()),
        ShellHost::new(
            CommandRunner::new(Target::Ssh(master), cancel.clone()),
            helper.clone(),
        ),
        ShellTransfer::new(
            CommandRunner::local(cancel.clone()),
            helper,
            Some(master_host.to_owned()),
        ),
    )
}
