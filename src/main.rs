use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    knowyourstats_client::run().await
}
