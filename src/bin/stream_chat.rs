use std::process::ExitCode;

use apim_stream::{app, EnvProvider, Error};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match app::run_chat(&EnvProvider, &mut stdin.lock(), &mut stdout.lock()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if let Error::Auth { .. } = e {
                eprintln!("The gateway rejected APIM_SUBSCRIPTION_KEY. Check the key and its product subscription.");
            }
            tracing::debug!("{e:#?}");
            eprintln!("error: {}", e.report());
            ExitCode::from(e.exit_code())
        }
    }
}
