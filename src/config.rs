use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "haas-broker",
    about = "Service broker for on-demand hardware leases",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8620")]
    pub bind: SocketAddr,

    #[arg(
        long,
        env = "HAAS_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "dispenser-url",
        env = "HAAS_DISPENSER_URL",
        value_name = "URL",
        default_value = "http://127.0.0.1:9280"
    )]
    pub dispenser_url: String,

    #[arg(
        long = "dispenser-api-key",
        env = "HAAS_DISPENSER_API_KEY",
        value_name = "KEY",
        default_value = ""
    )]
    pub dispenser_api_key: String,

    #[arg(
        long = "dispenser-timeout-secs",
        env = "HAAS_DISPENSER_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub dispenser_timeout_secs: u64,

    #[arg(
        long = "broker-username",
        env = "HAAS_BROKER_USERNAME",
        value_name = "NAME",
        default_value = ""
    )]
    pub broker_username: String,

    #[arg(
        long = "broker-password",
        env = "HAAS_BROKER_PASSWORD",
        value_name = "PASSWORD",
        default_value = ""
    )]
    pub broker_password: String,

    #[arg(
        long = "service-id",
        env = "HAAS_SERVICE_ID",
        value_name = "GUID",
        default_value = "5a9b9f22-a08d-11e5-8062-7831c1d4f660"
    )]
    pub service_id: String,

    #[arg(
        long = "service-name",
        env = "HAAS_SERVICE_NAME",
        value_name = "NAME",
        default_value = "haas"
    )]
    pub service_name: String,

    #[arg(
        long = "plan-id",
        env = "HAAS_PLAN_ID",
        value_name = "GUID",
        default_value = "6a977311-a08d-11e5-8062-7831c1d4f660"
    )]
    pub plan_id: String,

    #[arg(
        long = "plan-name",
        env = "HAAS_PLAN_NAME",
        value_name = "NAME",
        default_value = "m1.small"
    )]
    pub plan_name: String,

    #[arg(
        long = "dashboard-url",
        env = "HAAS_DASHBOARD_URL",
        value_name = "URL",
        default_value = ""
    )]
    pub dashboard_url: String,

    #[arg(
        long = "dashboard-client-id",
        env = "HAAS_DASHBOARD_CLIENT_ID",
        value_name = "ID",
        default_value = "haas-broker-ui"
    )]
    pub dashboard_client_id: String,

    #[arg(
        long = "dashboard-client-secret",
        env = "HAAS_DASHBOARD_CLIENT_SECRET",
        value_name = "SECRET",
        default_value = ""
    )]
    pub dashboard_client_secret: String,
}

impl Config {
    pub fn basic_auth_enabled(&self) -> bool {
        !self.broker_username.is_empty()
    }

    pub fn dispenser_timeout(&self) -> Duration {
        Duration::from_secs(self.dispenser_timeout_secs)
    }
}
