use anyhow::Context;
use clap::{Parser, Subcommand};
use nova_bridge::{
    ClientType, ConfigMap, DaemonState, NetworkPut, NetworksPost, NovaConfig,
    apparmor::AppArmor,
    bgp::PrefixTable,
    config::DEFAULT_CONFIG_FILE,
    db::{Cluster, DEFAULT_PROJECT, NetworkStatus},
    firewall::Nftables,
    forward::{ForwardPort, NetworkForwardPut, NetworkForwardsPost},
    ip::IpCommand,
    logger,
    network::{self, Network},
    subprocess::SystemSupervisor,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "nova-bridge")]
#[command(about = "Managed bridge networks for Nova hosts")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Project the networks belong to
    #[arg(short, long, default_value = DEFAULT_PROJECT)]
    project: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Managed bridge networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },
    /// Address forwards on a network
    Forward {
        #[command(subcommand)]
        command: ForwardCommands,
    },
    /// Create, update and start every network declared in the config file
    Apply,
    /// Write a default configuration file
    Init,
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// List networks
    #[command(alias = "ls")]
    List,
    /// Show a network's settings
    Show { name: String },
    /// Create and start a network
    Create {
        name: String,
        /// key=value settings
        config: Vec<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Stop and remove a network
    Delete { name: String },
    /// Rename a network
    Rename { name: String, new_name: String },
    /// Bring a network up
    Start { name: String },
    /// Tear a network down, keeping its record
    Stop { name: String },
    /// Change settings
    Set {
        name: String,
        /// key=value settings
        config: Vec<String>,
    },
    /// Remove settings
    Unset { name: String, keys: Vec<String> },
    /// Check settings without applying them
    Validate {
        name: String,
        /// key=value settings
        config: Vec<String>,
    },
    /// DHCP leases and reserved addresses
    Leases { name: String },
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// List forwards on a network
    #[command(alias = "ls")]
    List { network: String },
    /// Create a forward
    Create {
        network: String,
        listen_address: String,
        /// key=value settings, e.g. target_address=10.0.0.2
        config: Vec<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Delete a forward
    Delete { network: String, listen_address: String },
    /// Add a port mapping to a forward
    PortAdd {
        network: String,
        listen_address: String,
        protocol: String,
        listen_port: String,
        target_address: String,
        target_port: Option<String>,
        #[arg(long)]
        snat: bool,
    },
}

fn parse_settings(pairs: &[String]) -> anyhow::Result<ConfigMap> {
    let mut config = ConfigMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid setting {:?}, expected key=value", pair))?;
        config.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(config)
}

fn daemon_state(config: &NovaConfig) -> anyhow::Result<Arc<DaemonState>> {
    let settings = config.daemon.clone();
    let cluster = Cluster::open(&settings.cluster_path(), settings.node_id)
        .context("Failed to open cluster store")?;
    let apparmor = AppArmor::detect(&settings.var_dir);

    Ok(Arc::new(DaemonState {
        settings,
        cluster: Arc::new(cluster),
        host: Arc::new(IpCommand::new()),
        firewall: Arc::new(Nftables::new()),
        supervisor: Arc::new(SystemSupervisor::new()),
        bgp: Arc::new(PrefixTable::new()),
        apparmor: Arc::new(apparmor),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "nova_bridge=debug");
        }
    }
    logger::init_logger();

    if let Commands::Init = cli.command {
        NovaConfig::default()
            .save_to_file(&cli.config)
            .with_context(|| format!("Failed to write {}", cli.config.display()))?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = if cli.config.exists() {
        NovaConfig::from_file(&cli.config)?
    } else {
        logger::warn!(
            "{} not found at {}, using defaults",
            DEFAULT_CONFIG_FILE,
            cli.config.display()
        );
        NovaConfig::default()
    };
    config.validate()?;

    let state = daemon_state(&config)?;
    let project = cli.project.as_str();

    match cli.command {
        Commands::Network { command } => handle_network(&state, project, command).await?,
        Commands::Forward { command } => handle_forward(&state, project, command)?,
        Commands::Apply => handle_apply(&state, project, &config).await?,
        Commands::Init => {}
    }

    Ok(())
}

async fn handle_network(
    state: &Arc<DaemonState>,
    project: &str,
    command: NetworkCommands,
) -> anyhow::Result<()> {
    match command {
        NetworkCommands::List => {
            let networks = state.cluster.transaction(|tx| Ok(tx.networks()))?;
            println!("{:<16} {:<8} {:<10} {:<20} {}", "NAME", "TYPE", "STATE", "IPV4", "IPV6");
            for record in networks.iter().filter(|n| n.project == project) {
                let get = |key: &str| record.config.get(key).cloned().unwrap_or_default();
                println!(
                    "{:<16} {:<8} {:<10} {:<20} {}",
                    record.name,
                    record.network_type,
                    format!("{:?}", record.status),
                    get("ipv4.address"),
                    get("ipv6.address")
                );
            }
        }
        NetworkCommands::Show { name } => {
            let record = state.cluster.transaction(|tx| tx.get_network(project, &name))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        NetworkCommands::Create {
            name,
            config,
            description,
        } => {
            let req = NetworksPost {
                name: name.clone(),
                network_type: "bridge".to_string(),
                put: NetworkPut {
                    description,
                    config: parse_settings(&config)?,
                },
            };
            network::create_network(state, project, req, ClientType::Normal).await?;
            println!("Network {} created", name);
        }
        NetworkCommands::Delete { name } => {
            network::delete_network(state, project, &name, ClientType::Normal)?;
            println!("Network {} deleted", name);
        }
        NetworkCommands::Rename { name, new_name } => {
            let mut net = network::load_by_name(state, project, &name)?;
            net.validate_name(&new_name)?;
            net.rename(&new_name).await?;
            println!("Network {} renamed to {}", name, new_name);
        }
        NetworkCommands::Start { name } => {
            network::load_by_name(state, project, &name)?.start().await?;
            println!("Network {} started", name);
        }
        NetworkCommands::Stop { name } => {
            network::load_by_name(state, project, &name)?.stop()?;
            println!("Network {} stopped", name);
        }
        NetworkCommands::Set { name, config } => {
            let mut net = network::load_by_name(state, project, &name)?;
            let mut put = NetworkPut {
                description: net.description().to_string(),
                config: net.config().clone(),
            };
            put.config.extend(parse_settings(&config)?);
            net.update(put, ClientType::Normal).await?;
        }
        NetworkCommands::Unset { name, keys } => {
            let mut net = network::load_by_name(state, project, &name)?;
            let mut put = NetworkPut {
                description: net.description().to_string(),
                config: net.config().clone(),
            };
            for key in &keys {
                put.config.remove(key);
            }
            net.update(put, ClientType::Normal).await?;
        }
        NetworkCommands::Validate { name, config } => {
            let net = network::load_by_name(state, project, &name)?;
            let mut settings = net.config().clone();
            settings.extend(parse_settings(&config)?);
            net.validate(&settings)?;
            println!("Settings for {} are valid", name);
        }
        NetworkCommands::Leases { name } => {
            let net = network::load_by_name(state, project, &name)?;
            println!("{:<24} {:<18} {:<40} {:<8} {}", "HOSTNAME", "MAC", "ADDRESS", "TYPE", "LOCATION");
            for lease in net.leases(project, ClientType::Normal)? {
                println!(
                    "{:<24} {:<18} {:<40} {:<8} {}",
                    lease.hostname, lease.hwaddr, lease.address, lease.lease_type, lease.location
                );
            }
        }
    }
    Ok(())
}

fn handle_forward(
    state: &Arc<DaemonState>,
    project: &str,
    command: ForwardCommands,
) -> anyhow::Result<()> {
    match command {
        ForwardCommands::List { network } => {
            let net = network::load_by_name(state, project, &network)?;
            println!("{:<40} {:<20} {:<6} {}", "LISTEN ADDRESS", "DEFAULT TARGET", "PORTS", "LOCATION");
            for forward in net.forwards()? {
                println!(
                    "{:<40} {:<20} {:<6} {}",
                    forward.listen_address,
                    forward.config.get("target_address").cloned().unwrap_or_default(),
                    forward.ports.len(),
                    forward.location
                );
            }
        }
        ForwardCommands::Create {
            network,
            listen_address,
            config,
            description,
        } => {
            let net = network::load_by_name(state, project, &network)?;
            let req = NetworkForwardsPost {
                listen_address: listen_address.clone(),
                put: NetworkForwardPut {
                    description,
                    config: parse_settings(&config)?,
                    ports: Vec::new(),
                },
            };
            net.forward_create(req, ClientType::Normal)?;
            println!("Forward {} created", listen_address);
        }
        ForwardCommands::Delete {
            network,
            listen_address,
        } => {
            let net = network::load_by_name(state, project, &network)?;
            net.forward_delete(&listen_address, ClientType::Normal)?;
            println!("Forward {} deleted", listen_address);
        }
        ForwardCommands::PortAdd {
            network,
            listen_address,
            protocol,
            listen_port,
            target_address,
            target_port,
            snat,
        } => {
            let net = network::load_by_name(state, project, &network)?;
            let current = net
                .forwards()?
                .into_iter()
                .find(|f| f.listen_address == listen_address)
                .with_context(|| format!("Network forward {:?} not found", listen_address))?;

            let mut put = NetworkForwardPut {
                description: current.description,
                config: current.config,
                ports: current.ports,
            };
            put.ports.push(ForwardPort {
                description: String::new(),
                protocol,
                listen_port,
                target_address,
                target_port: target_port.unwrap_or_default(),
                snat,
            });
            net.forward_update(&listen_address, put, ClientType::Normal)?;
            println!("Port added to forward {}", listen_address);
        }
    }
    Ok(())
}

/// Bring the declared networks to their configured state.
async fn handle_apply(
    state: &Arc<DaemonState>,
    project: &str,
    config: &NovaConfig,
) -> anyhow::Result<()> {
    for name in config.list_networks() {
        let Some(decl) = config.get_network(name) else {
            continue;
        };

        match network::load_by_name(state, project, name) {
            Ok(mut net) => {
                let mut put = NetworkPut {
                    description: decl.description.clone(),
                    config: decl.config.clone(),
                };
                // Keep addresses allocated on creation unless the file pins them.
                for key in ["ipv4.address", "ipv4.nat", "ipv6.address", "ipv6.nat"] {
                    if put.config.contains_key(key) {
                        continue;
                    }
                    if let Some(value) = net.config().get(key) {
                        put.config.insert(key.to_string(), value.clone());
                    }
                }
                net.update(put, ClientType::Normal)
                    .await
                    .with_context(|| format!("Failed to update network {}", name))?;

                if net.status() == NetworkStatus::Created && !net.is_running() {
                    net.start().await?;
                }
                println!("Network {} is up to date", name);
            }
            Err(e) if e.is_not_found() => {
                let req = NetworksPost {
                    name: name.clone(),
                    network_type: "bridge".to_string(),
                    put: NetworkPut {
                        description: decl.description.clone(),
                        config: decl.config.clone(),
                    },
                };
                network::create_network(state, project, req, ClientType::Normal)
                    .await
                    .with_context(|| format!("Failed to create network {}", name))?;
                println!("Network {} created", name);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
