use clap::Parser;
use env_logger::Env;
use log::info;

mod args;
mod weights;

fn main() {
    let args = args::Args::parse();

    if args.verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }
    info!("args: {:?}", args);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Could not start the runtime: {}", e);
            std::process::exit(2);
        }
    };

    if !runtime.block_on(weights::run_and_report(&args)) {
        std::process::exit(1);
    }
}
