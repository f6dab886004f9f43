use sea_orm::{Database, DatabaseConnection};

pub async fn postgres_connection(
    host: &str,
    port: u16,
    db: &str,
    schema: &str,
    user: &str,
    password: &str,
) -> Option<DatabaseConnection> {
    let pg_url = format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, db);

    let mut db_options = sea_orm::ConnectOptions::new(pg_url);
    db_options
        .set_schema_search_path(schema)
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Trace);

    match Database::connect(db_options).await {
        Ok(db) => Some(db),
        Err(e) => {
            log::error!("Failed to connect to postgres database: {}", e);
            None
        }
    }
}
