use docker_registry_pusher::cli::{Args, Runner};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse_args();
    let runner = Runner::new(args);
    let output = runner.output().clone();

    match runner.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            output.error(&err.to_string());
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
