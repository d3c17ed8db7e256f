//! Reader accounts: social login, profile, shelf and deal history, device
//! registration for pushes.

use std::collections::{HashMap, HashSet};

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::auth::{self, AuthUser};
use crate::db;
use crate::error::ApiError;
use crate::ids::normalize_loose_id;
use crate::models::{
    page_window, Book, Deal, DealStatus, NewDeviceToken, NewUser, Paged, User, UserBook,
    UserBookStatus,
};
use crate::old_deals::PageQuery;
use crate::AppState;

const KAKAO_USERINFO: &str = "https://kapi.kakao.com/v2/user/me";
const GOOGLE_USERINFO: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

/// What we keep from a provider's userinfo response.
#[derive(Debug, Clone)]
struct ExternalIdentity {
    provider: String,
    provider_user_id: String,
    email: Option<String>,
    nickname: String,
}

fn lookup_str(profile: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cursor = profile;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_str().map(str::to_string)
}

fn subject_of(profile: &JsonValue) -> Option<String> {
    match profile.get("id") {
        Some(JsonValue::Number(number)) => return Some(number.to_string()),
        Some(JsonValue::String(text)) if !text.is_empty() => return Some(text.clone()),
        _ => {}
    }
    profile
        .get("sub")
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

/// Pulls the subject, email and display name out of a userinfo payload.
/// Kakao nests them under `kakao_account`, Google keeps them flat; either
/// way a missing display name falls back to a generated one.
fn parse_identity(provider: &str, profile: &JsonValue) -> Option<ExternalIdentity> {
    let subject = subject_of(profile)?;
    let email = lookup_str(profile, &["email"])
        .or_else(|| lookup_str(profile, &["kakao_account", "email"]));
    let nickname = lookup_str(profile, &["nickname"])
        .or_else(|| lookup_str(profile, &["name"]))
        .or_else(|| lookup_str(profile, &["kakao_account", "profile", "nickname"]))
        .or_else(|| lookup_str(profile, &["properties", "nickname"]))
        .unwrap_or_else(|| format!("reader-{}", subject.chars().take(6).collect::<String>()));
    Some(ExternalIdentity {
        provider: provider.to_string(),
        provider_user_id: subject,
        email,
        nickname,
    })
}

async fn verify_identity(
    http: &reqwest::Client,
    provider: &str,
    access_token: &str,
) -> Result<ExternalIdentity, ApiError> {
    let endpoint = match provider {
        "kakao" => KAKAO_USERINFO,
        "google" => GOOGLE_USERINFO,
        other => {
            return Err(ApiError::Validation(format!(
                "unsupported login provider: {other}"
            )))
        }
    };
    let response = http
        .get(endpoint)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|err| ApiError::Internal(format!("identity endpoint unreachable: {err}")))?;
    if !response.status().is_success() {
        return Err(ApiError::Unauthorized(
            "identity token was rejected".to_string(),
        ));
    }
    let profile: JsonValue = response
        .json()
        .await
        .map_err(|err| ApiError::Internal(format!("identity response unreadable: {err}")))?;
    parse_identity(provider, &profile).ok_or_else(|| {
        ApiError::Unauthorized("identity response carried no subject".to_string())
    })
}

/// The account row follows the external identity: first login inserts it,
/// later logins refresh the profile fields in place.
fn upsert_user(conn: &mut PgConnection, identity: ExternalIdentity) -> Result<User, ApiError> {
    use crate::schema::users;
    let row = NewUser {
        id: Uuid::new_v4(),
        provider: identity.provider,
        provider_user_id: identity.provider_user_id,
        email: identity.email,
        nickname: identity.nickname,
        coin: 0,
        created_at: Utc::now().naive_utc(),
    };
    let snapshot = row.clone();
    diesel::insert_into(users::table)
        .values(&row)
        .on_conflict((users::provider, users::provider_user_id))
        .do_update()
        .set((
            users::email.eq(snapshot.email),
            users::nickname.eq(snapshot.nickname),
        ))
        .get_result::<User>(conn)
        .map_err(Into::into)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub provider: String,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub nickname: String,
    pub email: Option<String>,
    pub coin: i64,
    pub provider: String,
    pub created_at: NaiveDateTime,
}

impl From<User> for UserView {
    fn from(row: User) -> Self {
        UserView {
            id: row.id,
            nickname: row.nickname,
            email: row.email,
            coin: row.coin,
            provider: row.provider,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserView,
}

/// POST /users/login. The access token is verified against the provider's
/// userinfo endpoint; we never mint sessions from unverified input.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let provider = request.provider.trim().to_lowercase();
    let identity = verify_identity(&state.http, &provider, &request.access_token).await?;
    let user = db::run(&state.pool, move |conn| upsert_user(conn, identity)).await?;
    let token = auth::create_token(&user.id.to_string(), &state.config.jwt_secret)
        .map_err(|err| ApiError::Internal(format!("could not issue token: {err}")))?;
    log::info!("user {} logged in via {}", user.id, provider);
    Ok(Json(LoginResponse {
        token,
        user: UserView::from(user),
    }))
}

/// GET /users/me
pub async fn me(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<UserView>, ApiError> {
    let row = db::run(&state.pool, move |conn| {
        use crate::schema::users::dsl::*;
        users
            .find(user)
            .first::<User>(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
    })
    .await?;
    Ok(Json(UserView::from(row)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfBookView {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub book_pic: Option<String>,
    pub rent_price: i64,
    pub own_price: i64,
}

fn shelf_book_view(book: &Book) -> ShelfBookView {
    ShelfBookView {
        id: book.id,
        title: book.title.clone(),
        author: book.author.clone(),
        book_pic: book.book_pic.clone(),
        rent_price: book.rent_price,
        own_price: book.own_price,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleView {
    pub price: i64,
    pub date: NaiveDateTime,
    pub buyer_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: Uuid,
    pub status: String,
    pub remaining_time: Option<i64>,
    pub book: Option<ShelfBookView>,
    pub asking_price: Option<i64>,
    pub sale: Option<SaleView>,
    pub acquired_at: NaiveDateTime,
}

/// GET /users/me/books. The shelf, with a live asking price attached to
/// copies that currently sit in a listing.
pub async fn library(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(params): Query<PageQuery>,
) -> Result<Json<Paged<LibraryItem>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let offset = (page - 1) * limit;
    let (total, rows, catalog, asking) = db::run(&state.pool, move |conn| {
        use crate::schema::{books, deals, user_books};
        let total: i64 = user_books::table
            .filter(user_books::user_id.eq(user))
            .count()
            .get_result(conn)?;
        let rows: Vec<UserBook> = user_books::table
            .filter(user_books::user_id.eq(user))
            .order(user_books::updated_at.desc())
            .offset(offset)
            .limit(limit)
            .load(conn)?;
        let book_ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|row| normalize_loose_id(&row.book_id))
            .collect::<HashSet<Uuid>>()
            .into_iter()
            .collect();
        let catalog: HashMap<Uuid, Book> = books::table
            .filter(books::id.eq_any(book_ids))
            .load::<Book>(conn)?
            .into_iter()
            .map(|book| (book.id, book))
            .collect();
        let deal_ids: Vec<Uuid> = rows
            .iter()
            .filter(|row| UserBookStatus::is_listed(&row.status))
            .filter_map(|row| row.source_deal_id)
            .collect();
        let asking: HashMap<Uuid, i64> = if deal_ids.is_empty() {
            HashMap::new()
        } else {
            deals::table
                .filter(deals::id.eq_any(deal_ids))
                .filter(deals::status.eq(DealStatus::Listing.as_str()))
                .select((deals::id, deals::price))
                .load::<(Uuid, i64)>(conn)?
                .into_iter()
                .collect()
        };
        Ok((total, rows, catalog, asking))
    })
    .await?;
    let items = rows
        .into_iter()
        .map(|row| {
            let book = normalize_loose_id(&row.book_id)
                .and_then(|id| catalog.get(&id))
                .map(shelf_book_view);
            let asking_price = row
                .source_deal_id
                .and_then(|deal| asking.get(&deal))
                .copied();
            let sale = match (row.sale_price, row.sale_date) {
                (Some(price), Some(date)) => Some(SaleView {
                    price,
                    date,
                    buyer_id: row.sale_buyer_id,
                }),
                _ => None,
            };
            LibraryItem {
                id: row.id,
                status: row.status,
                remaining_time: row.remaining_time,
                book,
                asking_price,
                sale,
                acquired_at: row.created_at,
            }
        })
        .collect();
    Ok(Json(Paged {
        total,
        page,
        limit,
        items,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealHistoryView {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub category: String,
    pub price: i64,
    pub role: String,
    pub book_id: Option<Uuid>,
    pub registered_at: NaiveDateTime,
    pub dealt_at: Option<NaiveDateTime>,
}

/// GET /users/me/deals. Every money or book movement the account took part
/// in, on either side.
pub async fn my_deals(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(params): Query<PageQuery>,
) -> Result<Json<Paged<DealHistoryView>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let offset = (page - 1) * limit;
    let (total, rows) = db::run(&state.pool, move |conn| {
        use crate::schema::deals::dsl::*;
        let total: i64 = deals
            .filter(seller_id.eq(user).nullable().or(buyer_id.eq(user)))
            .count()
            .get_result(conn)?;
        let rows: Vec<Deal> = deals
            .filter(seller_id.eq(user).nullable().or(buyer_id.eq(user)))
            .order(registered_at.desc())
            .offset(offset)
            .limit(limit)
            .load(conn)?;
        Ok((total, rows))
    })
    .await?;
    let items = rows
        .into_iter()
        .map(|deal| {
            let role = if deal.buyer_id == Some(user) && deal.seller_id != user {
                "buyer"
            } else {
                "seller"
            };
            DealHistoryView {
                id: deal.id,
                kind: deal.kind,
                status: deal.status,
                category: deal.category,
                price: deal.price,
                role: role.to_string(),
                book_id: normalize_loose_id(&deal.book_id),
                registered_at: deal.registered_at,
                dealt_at: deal.dealt_at,
            }
        })
        .collect();
    Ok(Json(Paged {
        total,
        page,
        limit,
        items,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub token: String,
}

/// POST /users/me/devices. Registering the same token twice is a no-op.
pub async fn register_device(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let token_value = request.token.trim().to_string();
    if token_value.is_empty() {
        return Err(ApiError::Validation("device token is required".to_string()));
    }
    db::run(&state.pool, move |conn| {
        use crate::schema::device_tokens;
        let row = NewDeviceToken {
            id: Uuid::new_v4(),
            user_id: user,
            token: token_value,
            created_at: Utc::now().naive_utc(),
        };
        diesel::insert_into(device_tokens::table)
            .values(&row)
            .on_conflict((device_tokens::user_id, device_tokens::token))
            .do_nothing()
            .execute(conn)
            .map_err(Into::into)
    })
    .await?;
    Ok(Json(json!({ "status": "registered" })))
}

/// DELETE /users/me/devices/:token
pub async fn remove_device(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(token_value): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let removed = db::run(&state.pool, move |conn| {
        use crate::schema::device_tokens::dsl::*;
        diesel::delete(
            device_tokens
                .filter(user_id.eq(user))
                .filter(token.eq(token_value)),
        )
        .execute(conn)
        .map_err(Into::into)
    })
    .await?;
    log::debug!("removed {removed} device tokens for user {user}");
    Ok(Json(json!({ "status": "removed" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kakao_profiles_use_numeric_id_and_nested_nickname() {
        let profile = json!({
            "id": 123456789,
            "kakao_account": {
                "email": "reader@example.com",
                "profile": { "nickname": "bookworm" }
            }
        });
        let identity = parse_identity("kakao", &profile).unwrap();
        assert_eq!(identity.provider, "kakao");
        assert_eq!(identity.provider_user_id, "123456789");
        assert_eq!(identity.email.as_deref(), Some("reader@example.com"));
        assert_eq!(identity.nickname, "bookworm");
    }

    #[test]
    fn google_profiles_use_sub_and_flat_fields() {
        let profile = json!({
            "sub": "10987654321",
            "email": "reader@gmail.com",
            "name": "Jin Reader"
        });
        let identity = parse_identity("google", &profile).unwrap();
        assert_eq!(identity.provider_user_id, "10987654321");
        assert_eq!(identity.email.as_deref(), Some("reader@gmail.com"));
        assert_eq!(identity.nickname, "Jin Reader");
    }

    #[test]
    fn missing_subject_yields_no_identity() {
        let profile = json!({ "email": "nobody@example.com" });
        assert!(parse_identity("google", &profile).is_none());
    }

    #[test]
    fn missing_nickname_falls_back_to_a_generated_one() {
        let profile = json!({ "id": "abcdef123456" });
        let identity = parse_identity("kakao", &profile).unwrap();
        assert_eq!(identity.nickname, "reader-abcdef");
    }
}
