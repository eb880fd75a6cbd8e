use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;
use todo_auth::auth::{spawn_ledger_sweeper, PgRefreshLedger, RefreshLedger};
use todo_auth::configuration::get_configuration;
use todo_auth::startup::{run, AppState};
use todo_auth::telemetry::init_telemetry;
use todo_auth::users::{PgUserStore, UserStore};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    tracing::info!("Starting application");

    // Any missing or invalid setting is fatal
    let configuration = match get_configuration() {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to read configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Configuration error",
            ));
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(configuration.auth.store_timeout())
        .connect(&configuration.database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!("Failed to create connection pool: {}", e);
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Database connection error")
        })?;

    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        tracing::error!("Failed to run migrations: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, "Migration error")
    })?;

    tracing::info!("Database connection pool created successfully");

    let users: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pool.clone()));
    let ledger: Arc<dyn RefreshLedger> = Arc::new(PgRefreshLedger::new(pool));

    if let Some(interval) = configuration.auth.sweep_interval() {
        spawn_ledger_sweeper(ledger.clone(), interval);
        tracing::info!(interval_secs = interval.as_secs(), "Refresh ledger sweeper started");
    }

    let state = AppState::new(&configuration.auth, users, ledger).map_err(|e| {
        tracing::error!("Failed to initialise session core: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Session core error")
    })?;

    let address = format!("{}:{}", configuration.application.host, configuration.application.port);
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Server listening on: {}", address);

    run(listener, state)?.await
}
