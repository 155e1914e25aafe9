use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match fleet_backup::run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fleet-backup: {err:#}");
            ExitCode::from(1)
        }
    }
}
