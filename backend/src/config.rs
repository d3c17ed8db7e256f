use config::{Config, ConfigError, Environment};
use dotenv::dotenv;
use serde::Deserialize;

/// Runtime settings, read from the environment (a `.env` file is honored in
/// development). Only the database url and the two token secrets are
/// mandatory; everything else has a default suitable for local runs.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub jwt_secret: String,
    pub publisher_jwt_secret: String,
    #[serde(default = "default_fcm_endpoint")]
    pub fcm_endpoint: String,
    #[serde(default)]
    pub fcm_server_key: String,
    #[serde(default = "default_mail_endpoint")]
    pub mail_endpoint: String,
    #[serde(default)]
    pub mail_api_key: String,
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    #[serde(default = "default_complaint_inbox")]
    pub complaint_inbox: String,
    #[serde(default = "default_receipt_endpoint")]
    pub receipt_endpoint: String,
}

fn default_port() -> u16 {
    3000
}

fn default_fcm_endpoint() -> String {
    "https://fcm.googleapis.com/fcm/send".to_string()
}

fn default_mail_endpoint() -> String {
    "https://api.mailgun.net/v3/mg.bookmarket.example/messages".to_string()
}

fn default_mail_from() -> String {
    "no-reply@bookmarket.example".to_string()
}

fn default_complaint_inbox() -> String {
    "support@bookmarket.example".to_string()
}

fn default_receipt_endpoint() -> String {
    "https://play.googleapis.com/receipts/verify".to_string()
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load .env file if present
        Config::builder()
            .add_source(Environment::default())
            .build()?
            .try_deserialize()
    }
}
