//! `mdrd` binary entry point.

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = mdrd::daemon::run().await {
        log::error!("fatal: {err}");
        std::process::exit(1);
    }
}
