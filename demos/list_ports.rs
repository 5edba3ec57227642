mod common;

use petoi_driver::{available_port_names, PetoiDriver};
use structopt::StructOpt;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::setup_tracing();
    let args = common::Args::from_args();
    let names = if args.port.is_empty() {
        available_port_names()?
    } else {
        args.port.clone()
    };
    for name in names {
        match PetoiDriver::with_baud_rate(&name, args.baud_rate) {
            Ok(mut driver) => {
                // boards print a greeting once they finish booting
                sleep(Duration::from_secs(3)).await;
                match driver.receive().await {
                    Ok(response) => println!("=======> Found board at {}: {}", name, response.line()),
                    Err(_) => println!("Port {} opened, board silent", name),
                }
                driver.close().await?;
            }
            Err(error) => println!("Could not open {}: {}", name, error),
        }
    }
    Ok(())
}
