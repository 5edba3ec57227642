use petoi_driver::ControllerConfig;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt)]
#[structopt()]
pub struct Args {
    #[structopt(long, about = "Serial port to use, discovered when omitted")]
    pub port: Vec<String>,
    #[structopt(long, default_value = "115200", about = "Baud rate of the board")]
    pub baud_rate: u32,
}

impl Args {
    #[allow(dead_code)]
    pub fn config(&self) -> ControllerConfig {
        ControllerConfig {
            ports: self.port.clone(),
            baud_rate: self.baud_rate,
            ..ControllerConfig::default()
        }
    }
}

pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
