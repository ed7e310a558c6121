//! fieldgate CLI entry point.
//!
//! Runs a gateway node from a TOML configuration, lists the supported
//! connection schemes, or prints an example configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info};

use fieldgate::cluster::ClusterConfig;
use fieldgate::core::Device;
use fieldgate::driver::{DriverBuilder, DriverOutput, FileOutput, LogOutput, RestOutput};

#[derive(Parser, Debug)]
#[command(name = "fieldgate", version, about = "Clustered industrial-protocol gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a gateway node
    Run {
        /// Configuration file path
        config: PathBuf,
    },

    /// List supported connection schemes
    ListProtocols,

    /// Generate an example configuration
    Example,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct NodeConfig {
    driver_id: String,
    cluster: ClusterConfig,
    #[serde(default)]
    default_script: String,
    #[serde(default = "default_true")]
    load_balancing: bool,
    #[serde(default)]
    reconnect_when_split_brain_resolved: bool,
    #[serde(default)]
    output: OutputConfig,
    /// Devices connected once the node activates.
    #[serde(default)]
    devices: Vec<Device>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum OutputConfig {
    #[default]
    Log,
    #[serde(rename_all = "kebab-case")]
    File {
        response_file: String,
        status_file: String,
    },
    #[serde(rename_all = "kebab-case")]
    Rest {
        urls: Vec<String>,
        response_path: String,
        response_format: String,
        status_path: String,
        status_format: String,
    },
    #[cfg(feature = "kafka")]
    #[serde(rename_all = "kebab-case")]
    Kafka {
        bootstrap: Vec<String>,
        response_topic: String,
        response_format: String,
        status_topic: String,
        status_format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "info".into()),
                )
                .init();
            if let Err(e) = run(config).await {
                error!("fieldgate terminated: {}", e);
                std::process::exit(1);
            }
        }
        Commands::ListProtocols => list_protocols(),
        Commands::Example => println!("{}", EXAMPLE_CONFIG),
    }
}

async fn run(config_path: PathBuf) -> fieldgate::Result<()> {
    let raw = std::fs::read_to_string(&config_path)?;
    let config: NodeConfig = toml::from_str(&raw)
        .map_err(|e| fieldgate::GatewayError::Config(format!("invalid configuration: {e}")))?;

    let output: Arc<dyn DriverOutput> = match config.output {
        OutputConfig::Log => Arc::new(LogOutput),
        OutputConfig::File {
            response_file,
            status_file,
        } => Arc::new(FileOutput::new(response_file, status_file)),
        OutputConfig::Rest {
            urls,
            response_path,
            response_format,
            status_path,
            status_format,
        } => Arc::new(RestOutput::new(
            urls,
            response_path,
            response_format,
            status_path,
            status_format,
        )?),
        #[cfg(feature = "kafka")]
        OutputConfig::Kafka {
            bootstrap,
            response_topic,
            response_format,
            status_topic,
            status_format,
        } => Arc::new(
            fieldgate::driver::KafkaOutput::connect(
                bootstrap,
                response_topic,
                response_format,
                status_topic,
                status_format,
            )
            .await?,
        ),
    };

    let node = DriverBuilder::new(config.driver_id, config.cluster)
        .default_script(config.default_script)
        .load_balancing(config.load_balancing)
        .reconnect_when_split_brain_resolved(config.reconnect_when_split_brain_resolved)
        .output(output)
        .start()
        .await?;

    if !config.devices.is_empty() {
        let devices: HashSet<Device> = config.devices.into_iter().collect();
        let service = node.service.clone();
        let cluster = node.cluster.clone();
        tokio::spawn(async move {
            // placement needs an activated cluster
            while !cluster.activated() {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            let results = service.balanced_connect_all(devices).await;
            for (device_id, result) in results {
                info!("[{}] {}", device_id, result);
            }
        });
    }

    node.join().await;
    Ok(())
}

fn list_protocols() {
    println!("Supported connection schemes:");
    println!();
    for scheme in fieldgate::protocols::SUPPORTED_SCHEMES {
        println!("  {scheme}");
    }
    println!();
    println!("Device connection URLs take the form:");
    println!("  scheme://host:port?opt=val&opt=val");
}

const EXAMPLE_CONFIG: &str = r#"# fieldgate node configuration

driver-id = "driver1"
load-balancing = true

[cluster]
node-index = 1
server-port = 8080
node-target-urls = ["http://127.0.0.1:8080", "http://127.0.0.1:8081"]
leader-lost-timeout-secs = 20
heartbeat-interval-ms = 2000

[output]
type = "file"
response-file = "responses"
status-file = "status"

[[devices]]
id = "plc_01"
connectionUrl = "tcp-client://192.168.1.50:5000?endBytes=%5Cr%5Cn"
maxRetryConnect = 5
retryConnectDelay = 5000

[[devices.commands]]
id = "read_temp"
type = "READ_REQUEST"
periodGroup = 1000
requestInfo = "RD1\r\n"
cmdScript = '''
fn cmdFunc(received, time) {
    [["temperature", received]]
}
'''
"#;
