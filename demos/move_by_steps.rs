mod common;

use petoi_driver::Controller;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::setup_tracing();
    let args = common::Args::from_args();
    let mut controller = Controller::connect(args.config()).await?;
    controller.run().await?;
    Ok(())
}
