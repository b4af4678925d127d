use std::process::ExitCode;

use apim_stream::{app, EnvProvider};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let trace_id = std::env::args().nth(1);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match app::run_trace(&EnvProvider, trace_id, &mut stdin.lock(), &mut stdout.lock()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{e:#?}");
            eprintln!("error: {}", e.report());
            ExitCode::from(e.exit_code())
        }
    }
}
