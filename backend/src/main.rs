use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::{middleware, Json, Router};
use diesel::prelude::*;
use serde_json::json;

mod alerts;
mod auth;
mod books;
mod complaints;
mod config;
mod db;
mod deals;
mod error;
mod events;
mod ids;
mod mailer;
mod models;
mod notifications;
mod old_deals;
mod publishers;
mod push;
mod relations;
mod reviews;
mod schema;
mod users;

use crate::mailer::Mailer;
use crate::push::PushGateway;

#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub pool: db::DbPool,
    pub events: events::EventBus,
    pub push: Arc<dyn PushGateway>,
    pub mailer: Arc<dyn Mailer>,
    pub http: reqwest::Client,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = config::AppConfig::load()?;

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));

    let mut conn = PgConnection::establish(&config.database_url)
        .map_err(|e| format!("Failed to connect to database: {}", e))?;
    let test_query: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("1"))
        .get_result(&mut conn)?;
    log::info!("Database test query result: {}", test_query);
    drop(conn);

    let pool = db::init_pool(&config.database_url)?;

    let push: Arc<dyn PushGateway> = Arc::new(push::FcmClient::new(
        &config.fcm_endpoint,
        &config.fcm_server_key,
    ));
    let mailer: Arc<dyn Mailer> = Arc::new(mailer::HttpMailer::new(
        &config.mail_endpoint,
        &config.mail_api_key,
        &config.mail_from,
    ));
    let (events, inbox) = events::EventBus::new();

    let state = AppState {
        config,
        pool,
        events,
        push,
        mailer,
        http: reqwest::Client::new(),
    };

    tokio::spawn(notifications::run_listener(state.clone(), inbox));

    log::info!("Starting server on {}", addr);

    let user_routes = Router::new()
        .route("/users/me", get(users::me))
        .route("/users/me/books", get(users::library))
        .route("/users/me/deals", get(users::my_deals))
        .route("/users/me/devices", post(users::register_device))
        .route("/users/me/devices/:token", delete(users::remove_device))
        .route("/users/me/hearts", get(alerts::list_hearts))
        .route("/users/me/notices", get(alerts::list_notices))
        .route("/books/:id/hearts", post(alerts::toggle_heart))
        .route("/books/:id/reviews", post(reviews::create))
        .route("/alerts/notices", post(alerts::upsert_notice))
        .route("/notifications", get(notifications::list))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/deals/charges", post(deals::charge))
        .route("/deals/purchases", post(deals::purchase))
        .route("/deals/purchases/:id/refund", post(deals::refund_purchase))
        .route("/deals/listings", post(deals::create_listing))
        .route("/deals/listings/:id", delete(deals::delete_listing))
        .route("/deals/listings/:id/purchase", post(deals::purchase_listing))
        .route("/deals/cashouts", post(deals::cashout))
        .route("/relations/blocks", post(relations::create_block))
        .route("/relations/blocks/:target_id", delete(relations::delete_block))
        .route("/relations/reports", post(relations::create_report))
        .route("/complaints", post(complaints::create))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ));

    let publisher_routes = Router::new()
        .route("/publisher/books", post(publishers::register_book))
        .route("/publisher/books/:id", put(publishers::update_book))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate_publisher,
        ));

    let app = Router::new()
        .route("/", get(|| async { "Hello, Book Marketplace!" }))
        .route("/health", get(health))
        .route("/users/login", post(users::login))
        .route("/publishers/login", post(publishers::login))
        .route("/books", get(books::list))
        .route("/books/:id", get(books::detail))
        .route("/books/:id/reviews", get(reviews::list_for_book))
        .route("/old-deals", get(old_deals::grouped))
        .route("/old-deals/recent", get(old_deals::recent))
        .route("/old-deals/books/:book_id", get(old_deals::by_book))
        .merge(user_routes)
        .merge(publisher_routes)
        .with_state(state);

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;

    Ok(())
}
