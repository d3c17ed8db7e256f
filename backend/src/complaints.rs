//! Customer complaints: persisted, then relayed to the ops inbox.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::ApiError;
use crate::models::{Complaint, NewComplaint};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintRequest {
    pub category: String,
    pub content: String,
    pub deal_id: Option<String>,
}

/// POST /complaints. The row always lands; the ops email is best effort
/// and a failed send never fails the request.
pub async fn create(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<ComplaintRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let category = request.category.trim().to_string();
    let content = request.content.trim().to_string();
    if category.is_empty() || content.is_empty() {
        return Err(ApiError::Validation(
            "category and content are required".to_string(),
        ));
    }
    let deal = match &request.deal_id {
        Some(raw) => Some(
            Uuid::parse_str(raw.trim())
                .map_err(|_| ApiError::Validation("invalid deal id".to_string()))?,
        ),
        None => None,
    };
    let saved = db::run(&state.pool, {
        let category = category.clone();
        let content = content.clone();
        move |conn| {
            use crate::schema::complaints;
            let row = NewComplaint {
                id: Uuid::new_v4(),
                user_id: user,
                category,
                content,
                deal_id: deal,
                created_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(complaints::table)
                .values(&row)
                .get_result::<Complaint>(conn)
                .map_err(Into::into)
        }
    })
    .await?;
    let subject = format!("[complaint] {category}");
    let body = format!("user: {user}\ncomplaint: {}\n\n{content}", saved.id);
    if let Err(err) = state
        .mailer
        .send(&state.config.complaint_inbox, &subject, &body)
        .await
    {
        log::warn!("complaint {} saved but the ops mail failed: {err}", saved.id);
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "received", "id": saved.id })),
    ))
}
