use token_pulse_lib::pulse::config::StartFeedArgs;
use tracing::error;

#[tokio::main]
async fn main() {
    token_pulse_lib::logging::init_tracing();

    let args = match StartFeedArgs::load() {
        Ok(args) => args,
        Err(load_error) => {
            error!("invalid configuration: {load_error}");
            std::process::exit(2);
        }
    };

    if let Err(run_error) = token_pulse_lib::run(args).await {
        error!("token pulse stopped: {run_error}");
        std::process::exit(1);
    }
}
