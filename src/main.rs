use clap::Parser;

use carapace_guard::cli::{self, Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // `serve` configures logging from the config file.
    if !matches!(cli.command, None | Some(Command::Serve)) {
        cli::init_command_logging();
    }

    match cli.command {
        // No subcommand or explicit `serve` both launch the gateway.
        None | Some(Command::Serve) => cli::handle_serve(cli.config.as_deref()).await,

        Some(Command::CheckSecret { secret, stdin }) => {
            cli::handle_check_secret(secret.as_deref(), stdin)
        }

        Some(Command::InstallPath { id, base_dir }) => {
            cli::handle_install_path(cli.config.as_deref(), base_dir.as_deref(), &id)
        }

        Some(Command::Normalize { text, sanitize }) => {
            cli::handle_normalize(&text, sanitize);
            Ok(())
        }

        Some(Command::CheckOrigin {
            host,
            origin,
            allowed_origins,
        }) => cli::handle_check_origin(&host, origin.as_deref(), &allowed_origins),

        Some(Command::Fetch { url, overrides }) => {
            cli::handle_fetch(cli.config.as_deref(), &url, &overrides).await
        }

        Some(Command::Audit { lines }) => cli::handle_audit(lines),
    }
}
