use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "reload-cli")]
#[command(about = "Operator CLI for the live-reload proxy", long_about = None)]
struct Cli {
    /// Address serving the reload endpoints
    #[arg(short, long, default_value = "http://localhost:9090")]
    url: String,

    #[arg(long, default_value = "/ws/reload")]
    reload_path: String,

    #[arg(long, default_value = "/ws/status")]
    status_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tell every connected browser to reload
    Trigger,
    /// Show the live reload connections
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Trigger => {
            client
                .post(format!("{}{}", base, cli.reload_path))
                .send()
                .await?
        }
        Commands::Status => {
            client
                .get(format!("{}{}", base, cli.status_path))
                .send()
                .await?
        }
    };
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: reload endpoint returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
