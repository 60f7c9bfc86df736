//! RBD Storage Repository Driver
//!
//! Command-line entry point. Each invocation runs one repository or disk
//! operation to completion and prints its result as JSON.
//!
//! Device configuration comes from a YAML file and/or repeated
//! `-d key=value` flags, the latter taking precedence.

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rbd_sr::config::parse_size_mb;
use rbd_sr::domain::ports::{ClusterClientRef, ControlPlaneRef, VolumeGroupLifecycleRef};
use rbd_sr::naming::new_volume_uuid;
use rbd_sr::repository::MIB;
use rbd_sr::{
    DeviceConfig, EngineConfig, LayeredConfig, LvmEngine, LvmOverRbd, RbdCli,
    RbdScopedVolumeGroup, Repository, RepositoryConfig, ResumeConfig, StateFileControlPlane,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ceph RBD storage repository driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Repository UUID
    #[arg(long, env = "RBD_SR_UUID", global = true)]
    sr: Option<String>,

    /// Device-config entry as key=value (repeatable)
    #[arg(short = 'd', long = "device-config", value_parser = parse_key_value, global = true)]
    device_config: Vec<(String, String)>,

    /// YAML file holding the device-config map
    #[arg(long, env = "RBD_SR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding control-plane state files
    #[arg(long, env = "RBD_SR_STATE_DIR", default_value = "/var/lib/rbd-sr", global = true)]
    state_dir: PathBuf,

    /// Directory holding per-repository lock files
    #[arg(long, env = "RBD_SR_LOCK_DIR", default_value = "/var/lock/sm", global = true)]
    lock_dir: PathBuf,

    /// Host identity used for per-host device paths
    #[arg(long, env = "RBD_SR_HOST", global = true)]
    host: Option<String>,

    /// rbd binary
    #[arg(long, env = "RBD_BINARY", default_value = "rbd", global = true)]
    rbd_binary: String,

    /// ceph binary
    #[arg(long, env = "CEPH_BINARY", default_value = "ceph", global = true)]
    ceph_binary: String,

    /// Seconds to wait for a mapped device node
    #[arg(long, env = "RBD_SR_DEVICE_WAIT", default_value = "30", global = true)]
    device_wait_secs: u64,

    /// LVM configuration directory for layered repositories
    #[arg(long, env = "RBD_SR_LVM_CONF_DIR", default_value = rbd_sr::config::DEFAULT_LVM_CONF_DIR, global = true)]
    lvm_conf_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repository operations
    #[command(subcommand)]
    Sr(SrCommand),
    /// Disk operations
    #[command(subcommand)]
    Vdi(VdiCommand),
    /// Layered (LVM over RBD) repository operations
    #[command(subcommand)]
    Lvm(LvmCommand),
}

#[derive(Subcommand, Debug)]
enum SrCommand {
    Probe,
    Create,
    Delete,
    Attach,
    Detach,
    Scan,
    Stat,
    Update,
}

#[derive(ClapArgs, Debug)]
struct VdiTarget {
    /// Disk UUID
    uuid: String,
}

#[derive(Subcommand, Debug)]
enum VdiCommand {
    Create {
        /// Size with optional K/M/G/T unit (default MiB)
        #[arg(long)]
        size: String,
        /// Disk UUID; generated when omitted
        #[arg(long)]
        uuid: Option<String>,
    },
    Delete(VdiTarget),
    Attach(VdiTarget),
    Detach(VdiTarget),
    Snapshot(VdiTarget),
    Clone(VdiTarget),
    Resize {
        uuid: String,
        #[arg(long)]
        size: String,
    },
    Activate(VdiTarget),
    Deactivate(VdiTarget),
    VerifyMapping(VdiTarget),
    GenerateConfig(VdiTarget),
    /// Re-attach from a file written by generate-config
    AttachFromConfig {
        #[arg(long)]
        from: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum LvmCommand {
    Probe,
    Create,
    Delete,
    Attach,
    Detach,
    Scan,
    RefreshSize,
    GenerateConfig(VdiTarget),
    AttachFromConfig {
        #[arg(long)]
        from: PathBuf,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("{} {}", rbd_sr::NAME, rbd_sr::VERSION);

    match &args.command {
        Command::Sr(cmd) => run_sr(&args, cmd).await,
        Command::Vdi(cmd) => run_vdi(&args, cmd).await,
        Command::Lvm(cmd) => run_lvm(&args, cmd).await,
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn engine_config(args: &Args) -> EngineConfig {
    EngineConfig {
        rbd_binary: args.rbd_binary.clone(),
        ceph_binary: args.ceph_binary.clone(),
        device_wait: Duration::from_secs(args.device_wait_secs),
        lock_dir: args.lock_dir.clone(),
        lvm_conf_dir: args.lvm_conf_dir.clone(),
        ..Default::default()
    }
}

/// Merge the YAML file and the command-line entries
fn device_config(args: &Args) -> anyhow::Result<DeviceConfig> {
    let mut dconf = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<DeviceConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => DeviceConfig::new(),
    };
    dconf.extend(args.device_config.iter().cloned());
    Ok(dconf)
}

fn host_name(args: &Args) -> String {
    if let Some(host) = &args.host {
        return host.clone();
    }
    let kernel = nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned());
    let file = || std::fs::read_to_string("/etc/hostname").ok();
    pick_host_name(kernel, file)
}

/// First non-blank name of the kernel's and the file's, else "localhost"
fn pick_host_name(kernel: Option<String>, file: impl FnOnce() -> Option<String>) -> String {
    let usable = |name: Option<String>| {
        name.map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
    };
    usable(kernel)
        .or_else(|| usable(file()))
        .unwrap_or_else(|| "localhost".to_string())
}

fn control_plane(args: &Args) -> ControlPlaneRef {
    Arc::new(StateFileControlPlane::new(&args.state_dir, host_name(args)))
}

fn require_sr(args: &Args) -> anyhow::Result<String> {
    match &args.sr {
        Some(sr) => Ok(sr.clone()),
        None => bail!("--sr (or RBD_SR_UUID) is required for this operation"),
    }
}

fn size_bytes(raw: &str) -> anyhow::Result<u64> {
    Ok(parse_size_mb(raw)? * MIB)
}

fn open_repository(
    args: &Args,
    sr: String,
    config: RepositoryConfig,
) -> Repository {
    let engine = engine_config(args);
    let cluster: ClusterClientRef = Arc::new(RbdCli::new(config.connection.clone(), &engine));
    Repository::new(sr, config, engine, cluster, control_plane(args))
}

// =============================================================================
// Repository Commands
// =============================================================================

async fn run_sr(args: &Args, cmd: &SrCommand) -> anyhow::Result<()> {
    let config = RepositoryConfig::from_device_config(&device_config(args)?)?;

    if let SrCommand::Probe = cmd {
        let cluster = RbdCli::new(config.connection.clone(), &engine_config(args));
        return print(&Repository::probe(&cluster, &config.namespace).await?);
    }

    let repo = open_repository(args, require_sr(args)?, config);
    match cmd {
        SrCommand::Probe => unreachable!("handled above"),
        SrCommand::Create => print(&repo.create().await?),
        SrCommand::Delete => {
            repo.delete().await?;
            Ok(())
        }
        SrCommand::Attach => print(&repo.attach().await?),
        SrCommand::Detach => {
            repo.detach().await?;
            Ok(())
        }
        SrCommand::Scan => print(&repo.scan().await?),
        SrCommand::Stat => print(&repo.stat().await?),
        SrCommand::Update => print(&repo.update().await?),
    }
}

// =============================================================================
// Disk Commands
// =============================================================================

async fn run_vdi(args: &Args, cmd: &VdiCommand) -> anyhow::Result<()> {
    if let VdiCommand::AttachFromConfig { from } = cmd {
        let raw = std::fs::read_to_string(from)
            .with_context(|| format!("reading {}", from.display()))?;
        let resume = ResumeConfig::parse(&raw)?;
        let config = RepositoryConfig::from_device_config(&resume.device_config)?;
        let repo = open_repository(args, resume.sr_uuid.clone(), config);
        return print(&repo.vdi(&resume.vdi_uuid).attach_from_config().await?);
    }

    let config = RepositoryConfig::from_device_config(&device_config(args)?)?;
    let repo = open_repository(args, require_sr(args)?, config);

    match cmd {
        VdiCommand::Create { size, uuid } => {
            let uuid = uuid.clone().unwrap_or_else(new_volume_uuid);
            print(&repo.vdi(uuid).create(size_bytes(size)?).await?)
        }
        VdiCommand::Delete(t) => {
            repo.vdi(&t.uuid).delete().await?;
            Ok(())
        }
        VdiCommand::Attach(t) => print(&repo.vdi(&t.uuid).attach().await?),
        VdiCommand::Detach(t) => {
            repo.vdi(&t.uuid).detach().await?;
            Ok(())
        }
        VdiCommand::Snapshot(t) => print(&repo.vdi(&t.uuid).snapshot().await?),
        VdiCommand::Clone(t) => print(&repo.vdi(&t.uuid).clone_volume().await?),
        VdiCommand::Resize { uuid, size } => {
            print(&repo.vdi(uuid).resize(size_bytes(size)?).await?)
        }
        VdiCommand::Activate(t) => print(&repo.vdi(&t.uuid).activate().await?),
        VdiCommand::Deactivate(t) => {
            repo.vdi(&t.uuid).deactivate().await?;
            Ok(())
        }
        VdiCommand::VerifyMapping(t) => {
            let change = repo.vdi(&t.uuid).verify_mapping().await?;
            println!("{:?}", change);
            Ok(())
        }
        VdiCommand::GenerateConfig(t) => {
            println!("{}", repo.vdi(&t.uuid).generate_config().await?);
            Ok(())
        }
        VdiCommand::AttachFromConfig { .. } => unreachable!("handled above"),
    }
}

// =============================================================================
// Layered Repository Commands
// =============================================================================

async fn run_lvm(args: &Args, cmd: &LvmCommand) -> anyhow::Result<()> {
    let engine = engine_config(args);
    let vg: VolumeGroupLifecycleRef = Arc::new(RbdScopedVolumeGroup::new(
        LvmEngine::new(),
        engine.lvm_conf_dir.clone(),
    ));

    let resume = match cmd {
        LvmCommand::AttachFromConfig { from } => {
            let raw = std::fs::read_to_string(from)
                .with_context(|| format!("reading {}", from.display()))?;
            Some(ResumeConfig::parse(&raw)?)
        }
        _ => None,
    };
    let (sr, dconf) = match &resume {
        Some(resume) => (Some(resume.sr_uuid.clone()), resume.device_config.clone()),
        None => (args.sr.clone(), device_config(args)?),
    };
    let config = LayeredConfig::parse(&dconf)?;
    let cluster: ClusterClientRef = Arc::new(RbdCli::new(config.connection.clone(), &engine));

    if let LvmCommand::Probe = cmd {
        return print(&LvmOverRbd::probe(cluster.as_ref(), &config, &engine, &vg).await?);
    }

    let sr = match sr {
        Some(sr) => sr,
        None => require_sr(args)?,
    };
    let repo = LvmOverRbd::load(sr, config, engine, cluster, control_plane(args), vg).await;

    match cmd {
        LvmCommand::Probe => unreachable!("handled above"),
        LvmCommand::Create => repo.create().await.map_err(Into::into),
        LvmCommand::Delete => repo.delete().await.map_err(Into::into),
        LvmCommand::Attach => repo.attach().await.map_err(Into::into),
        LvmCommand::Detach => repo.detach().await.map_err(Into::into),
        LvmCommand::Scan => print(&repo.scan().await?),
        LvmCommand::RefreshSize => print(&repo.refresh_size().await?),
        LvmCommand::GenerateConfig(t) => {
            println!("{}", repo.generate_config(&t.uuid).await?);
            Ok(())
        }
        LvmCommand::AttachFromConfig { .. } => match &resume {
            Some(resume) => print(&repo.attach_from_config(&resume.vdi_uuid).await?),
            None => bail!("attach-from-config needs a resume file"),
        },
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command results, so logs go to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
