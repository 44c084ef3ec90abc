//! GCE machine actuator - drive a single Machine operation from the command line

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gce_actuator::client::KubeMachineClient;
use gce_actuator::compute::GceComputeClient;
use gce_actuator::config::{
    DEFAULT_IMAGE_PATH, DEFAULT_MACHINE_NAMESPACE, DEFAULT_MIN_BOOT_DISK_SIZE_GB,
};
use gce_actuator::crd::{Cluster, Machine};
use gce_actuator::setup::{MachineSetup, MachineSetupCatalog};
use gce_actuator::{ActuatorConfig, CertificateAuthority, GceActuator, MachineActuator};

/// Reconcile Cluster API Machines against Google Compute Engine
#[derive(Parser, Debug)]
#[command(name = "gce-actuator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the instance backing a Machine
    Create(MachineArgs),

    /// Delete the instance backing a Machine
    Delete(MachineArgs),

    /// Converge the instance towards the Machine spec
    ///
    /// Masters are upgraded in place; every other role is replaced.
    Update(MachineArgs),

    /// Print whether an instance backs the Machine
    Exists(MachineArgs),

    /// Print the external IP of the Machine's instance
    GetIp(MachineArgs),

    /// Print the admin kubeconfig of a master
    Kubeconfig(MachineArgs),

    /// Print the machine setup catalog as YAML
    PublishSetup {
        /// Path to the machine setup catalog
        #[arg(long, env = "MACHINE_SETUP_CONFIG")]
        setup_config: PathBuf,
    },
}

/// Arguments shared by every Machine operation
#[derive(Parser, Debug)]
struct MachineArgs {
    /// Path to the Cluster YAML
    #[arg(long)]
    cluster: PathBuf,

    /// Path to the Machine YAML
    #[arg(long)]
    machine: PathBuf,

    /// Path to the machine setup catalog (required for create and update)
    #[arg(long, env = "MACHINE_SETUP_CONFIG")]
    setup_config: Option<PathBuf>,

    /// Persist annotations, finalizers and status to the Machine record
    ///
    /// Without this flag the actuator runs in bootstrap mode.
    #[arg(long)]
    kube: bool,

    /// Namespace of the Machine record
    #[arg(long, default_value = DEFAULT_MACHINE_NAMESPACE)]
    namespace: String,

    /// OAuth2 access token for the Compute Engine API
    #[arg(long, env = "GCE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Token new nodes join the cluster with
    #[arg(long, env = "KUBEADM_TOKEN", hide_env_values = true)]
    kubeadm_token: Option<String>,

    /// PEM certificate of the cluster CA, handed to new masters
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// PEM private key of the cluster CA
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Image used when the catalog image can't be found
    #[arg(long, default_value = DEFAULT_IMAGE_PATH)]
    default_image: String,

    /// Upper bound on waiting for a provider operation, in seconds
    #[arg(long, default_value = "600")]
    operation_timeout_secs: u64,

    /// Delay between operation polls, in seconds
    #[arg(long, default_value = "5")]
    poll_interval_secs: u64,

    /// Smallest boot disk to create, in GiB
    #[arg(long, default_value_t = DEFAULT_MIN_BOOT_DISK_SIZE_GB)]
    min_boot_disk_size_gb: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let machine = serde_yaml::to_string(&Machine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Machine CRD: {}", e))?;
        let cluster = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Cluster CRD: {}", e))?;
        println!("{machine}---\n{cluster}");
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("no command given, see --help");
    };

    match command {
        Commands::PublishSetup { setup_config } => {
            let catalog = MachineSetupCatalog::from_file(&setup_config).await?;
            print!("{}", catalog.to_yaml()?);
            Ok(())
        }
        Commands::Create(args) => {
            let (actuator, cluster, mut machine) = prepare(&args).await?;
            actuator.create(&cluster, &mut machine).await?;
            print_machine(&machine)
        }
        Commands::Delete(args) => {
            let (actuator, cluster, mut machine) = prepare(&args).await?;
            actuator.delete(&cluster, &mut machine).await?;
            print_machine(&machine)
        }
        Commands::Update(args) => {
            let (actuator, cluster, mut machine) = prepare(&args).await?;
            actuator.update(&cluster, &mut machine).await?;
            print_machine(&machine)
        }
        Commands::Exists(args) => {
            let (actuator, cluster, machine) = prepare(&args).await?;
            println!("{}", actuator.exists(&cluster, &machine).await?);
            Ok(())
        }
        Commands::GetIp(args) => {
            let (actuator, cluster, machine) = prepare(&args).await?;
            println!("{}", actuator.get_ip(&cluster, &machine).await?);
            Ok(())
        }
        Commands::Kubeconfig(args) => {
            let (actuator, cluster, machine) = prepare(&args).await?;
            println!("{}", actuator.get_kubeconfig(&cluster, &machine).await?);
            Ok(())
        }
    }
}

/// Build the actuator and load the Cluster and Machine it acts on
async fn prepare(args: &MachineArgs) -> anyhow::Result<(GceActuator, Cluster, Machine)> {
    let cluster: Cluster = read_yaml(&args.cluster).await?;
    let machine: Machine = read_yaml(&args.machine).await?;

    let config = ActuatorConfig {
        min_boot_disk_size_gb: args.min_boot_disk_size_gb,
        ..Default::default()
    }
    .with_polling(
        Duration::from_secs(args.operation_timeout_secs),
        Duration::from_secs(args.poll_interval_secs),
    )
    .with_default_image(args.default_image.clone())
    .with_machine_namespace(args.namespace.clone());

    let compute = GceComputeClient::new(args.access_token.clone())?;
    let mut builder = GceActuator::builder(Arc::new(compute)).config(config.clone());

    if let Some(path) = &args.setup_config {
        let catalog: Arc<dyn MachineSetup> = Arc::new(MachineSetupCatalog::from_file(path).await?);
        builder = builder.machine_setup(catalog);
    }

    if args.kube {
        let client = Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
        info!(namespace = %config.machine_namespace, "Persisting changes to Machine records");
        builder = builder.machine_client(Arc::new(KubeMachineClient::from_config(client, &config)));
    } else {
        info!("No Kubernetes client, running in bootstrap mode");
    }

    if let Some(token) = &args.kubeadm_token {
        builder = builder.kubeadm_token(token.clone());
    }

    if let (Some(cert), Some(key)) = (&args.ca_cert, &args.ca_key) {
        builder = builder.certificate_authority(CertificateAuthority {
            certificate: read_file(cert).await?,
            private_key: read_file(key).await?,
        });
    }

    Ok((builder.build(), cluster, machine))
}

async fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = read_file(path).await?;
    serde_yaml::from_slice(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))
}

fn print_machine(machine: &Machine) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(machine)
        .map_err(|e| anyhow::anyhow!("Failed to serialize Machine: {}", e))?;
    print!("{yaml}");
    Ok(())
}
