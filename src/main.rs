//! Bus Tracker - Main Entry Point
//!
//! Command-line client for the Bus Tracker platform: signs in, publishes
//! this vehicle's GPS position and follows the rest of the fleet.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use bus_tracker_lib::api::{RegistrationRequest, Role};
use bus_tracker_lib::{commands, logging, AppState, Config};

#[derive(Parser)]
#[command(name = "bus-tracker", version, about = "Live bus tracking client")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session tokens
    Login {
        /// Email address or phone number
        email: String,
        #[arg(long, env = "BUS_TRACKER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create a user account
    Register {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, env = "BUS_TRACKER_PASSWORD", hide_env_values = true)]
        password: String,
        /// driver, passenger or admin
        #[arg(long, default_value = "passenger")]
        role: Role,
    },
    /// Forget the stored session
    Logout,
    /// Show session and connection settings
    Status,
    /// Publish this device's position and show other buses
    Track {
        /// Name published with every position (defaults to BUS_TRACKER_BUS_NAME)
        #[arg(long)]
        bus_name: Option<String>,
    },
    /// Show live positions of all buses without publishing
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Invalid configuration")?;
    logging::init(&config.log_dir());
    info!("Bus Tracker starting...");

    let state = AppState::new(config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Login { email, password } => {
            let session = commands::sign_in(&state, &email, &password)
                .await
                .map_err(|e| anyhow!(e))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!("Logged in as {} ({:?})", session.display_name, session.role);
            }
        }
        Commands::Register {
            first_name,
            last_name,
            email,
            phone,
            password,
            role,
        } => {
            let request = RegistrationRequest {
                first_name,
                last_name,
                email,
                phone_number: phone,
                password,
                role,
            };
            let created = commands::sign_up(&state, &request)
                .await
                .map_err(|e| anyhow!(e))?;
            println!("Registered user {}", created.id);
        }
        Commands::Logout => {
            commands::logout(&state);
            println!("Logged out");
        }
        Commands::Status => {
            let report = commands::status(&state);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Logged in: {}", if report.logged_in { "yes" } else { "no" });
                println!("API:       {}", report.api_url);
                println!("Broker:    {}", report.broker);
                println!("Topic:     {}", report.topic);
                println!("Bus name:  {}", report.bus_name);
            }
        }
        Commands::Track { bus_name } => {
            commands::track(&state, bus_name)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        Commands::Watch => {
            commands::watch(&state).await.map_err(|e| anyhow!(e))?;
        }
    }

    Ok(())
}
