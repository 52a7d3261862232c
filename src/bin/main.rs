use mio::Poll;
use server_proxy::{
    config::{AppConfig, FromYaml},
    error::Result,
    server::Server,
};
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = "./webserv.conf";

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    config.display_config();

    match start(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(AppConfig::from_str(&content)?)
}

fn start(config: AppConfig) -> Result<()> {
    let poll = Poll::new()?;
    let server = Server::new(config, &poll)?;
    server.run(poll)
}
