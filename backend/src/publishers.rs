//! Publisher-facing surface: API-key login and catalog registration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::subscription_key;
use crate::auth::{self, AuthPublisher};
use crate::books::BookSummary;
use crate::db;
use crate::error::ApiError;
use crate::events::{EventType, ListingEvent};
use crate::models::{Book, BookType, NewBook, Publisher};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherLoginRequest {
    pub code: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherView {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct PublisherLoginResponse {
    pub token: String,
    pub publisher: PublisherView,
}

/// POST /publishers/login. A wrong code and a wrong key answer the same
/// way so the endpoint does not confirm which codes exist.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<PublisherLoginRequest>,
) -> Result<Json<PublisherLoginResponse>, ApiError> {
    let code_value = request.code.trim().to_string();
    let row = db::run(&state.pool, move |conn| {
        use crate::schema::publishers::dsl::*;
        publishers
            .filter(code.eq(code_value))
            .first::<Publisher>(conn)
            .optional()
            .map_err(Into::into)
    })
    .await?;
    let publisher = row
        .filter(|found| found.api_key == request.api_key)
        .ok_or_else(|| ApiError::Unauthorized("unknown publisher code or api key".to_string()))?;
    let token = auth::create_token(
        &publisher.id.to_string(),
        &state.config.publisher_jwt_secret,
    )
    .map_err(|err| ApiError::Internal(format!("could not issue token: {err}")))?;
    log::info!("publisher {} logged in", publisher.code);
    Ok(Json(PublisherLoginResponse {
        token,
        publisher: PublisherView {
            id: publisher.id,
            code: publisher.code,
            name: publisher.name,
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBookRequest {
    pub title: String,
    pub author: String,
    pub rent_price: i64,
    pub own_price: i64,
    pub original_price: Option<i64>,
    pub book_pic: Option<String>,
    pub category: Option<String>,
    pub total_time: Option<i32>,
    pub published_at: Option<String>,
    pub description: Option<String>,
    pub contents: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub page_count: Option<i32>,
    pub content_ref: Option<String>,
}

/// POST /publisher/books. The (title, author) pair is the catalog identity:
/// a second registration with an equivalent pair is refused, and a fresh one
/// is announced so pending subscriptions can latch onto it.
pub async fn register_book(
    State(state): State<AppState>,
    Extension(AuthPublisher(publisher)): Extension<AuthPublisher>,
    Json(request): Json<RegisterBookRequest>,
) -> Result<(StatusCode, Json<BookSummary>), ApiError> {
    let title = request.title.trim().to_string();
    let author = request.author.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::Validation("title is required".to_string()));
    }
    if author.is_empty() {
        return Err(ApiError::Validation("author is required".to_string()));
    }
    if request.rent_price < 0 || request.own_price < 0 {
        return Err(ApiError::Validation(
            "prices cannot be negative".to_string(),
        ));
    }
    let key = subscription_key(&title, &author);
    let book = db::run(&state.pool, move |conn| {
        use crate::schema::{books, publishers};
        let imprint: Publisher = publishers::table.find(publisher).first(conn)?;
        if let Some(wanted) = key.as_deref() {
            let taken = books::table
                .filter(books::match_key.eq(wanted))
                .select(books::id)
                .first::<Uuid>(conn)
                .optional()?;
            if taken.is_some() {
                return Err(ApiError::Conflict(
                    "this title and author pair is already in the catalog".to_string(),
                ));
            }
        }
        let now = Utc::now().naive_utc();
        let row = NewBook {
            id: Uuid::new_v4(),
            title,
            author,
            publisher: imprint.name,
            publisher_id: Some(publisher),
            match_key: key,
            rent_price: request.rent_price,
            own_price: request.own_price,
            original_price: request.original_price,
            book_pic: request.book_pic,
            category: request.category,
            total_time: request.total_time,
            published_at: request.published_at,
            description: request.description,
            contents: request.contents,
            isbn: request.isbn,
            isbn13: request.isbn13,
            page_count: request.page_count,
            book_type: BookType::New.as_str().to_string(),
            content_ref: request.content_ref,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(books::table)
            .values(&row)
            .get_result::<Book>(conn)
            .map_err(Into::into)
    })
    .await?;
    state.events.publish(ListingEvent {
        event_type: EventType::New,
        title: book.title.clone(),
        author: Some(book.author.clone()),
        book_id: Some(book.id),
        deal_id: None,
        seller_id: None,
        price: Some(book.own_price),
        image: book.book_pic.clone(),
    });
    Ok((StatusCode::CREATED, Json(BookSummary::from(book))))
}

/// Everything a publisher may amend after registration. Title and author
/// stay fixed; subscriptions are keyed off them.
#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = crate::schema::books)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBookRequest {
    pub rent_price: Option<i64>,
    pub own_price: Option<i64>,
    pub original_price: Option<i64>,
    pub book_pic: Option<String>,
    pub category: Option<String>,
    pub total_time: Option<i32>,
    pub published_at: Option<String>,
    pub description: Option<String>,
    pub contents: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub page_count: Option<i32>,
    pub content_ref: Option<String>,
}

/// PUT /publisher/books/:id. Another publisher's entry reads as absent
/// rather than forbidden.
pub async fn update_book(
    State(state): State<AppState>,
    Extension(AuthPublisher(publisher)): Extension<AuthPublisher>,
    Path(id): Path<String>,
    Json(changes): Json<UpdateBookRequest>,
) -> Result<Json<BookSummary>, ApiError> {
    let book_id = Uuid::parse_str(id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let updated = db::run(&state.pool, move |conn| {
        use crate::schema::books;
        let owner = books::table
            .find(book_id)
            .select(books::publisher_id)
            .first::<Option<Uuid>>(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("book not found".to_string()))?;
        if owner != Some(publisher) {
            return Err(ApiError::NotFound("book not found".to_string()));
        }
        diesel::update(books::table.find(book_id))
            .set((&changes, books::updated_at.eq(Utc::now().naive_utc())))
            .get_result::<Book>(conn)
            .map_err(Into::into)
    })
    .await?;
    Ok(Json(BookSummary::from(updated)))
}
