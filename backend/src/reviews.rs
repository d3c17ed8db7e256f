//! Reviews left on catalog entries after a purchase.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::ApiError;
use crate::models::{page_window, NewReview, Paged, Review};
use crate::old_deals::PageQuery;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub deal_id: Option<String>,
    pub rating: i16,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub nickname: String,
    pub rating: i16,
    pub content: String,
    pub created_at: NaiveDateTime,
}

fn validate_rating(rating: i16) -> Result<(), ApiError> {
    if !(1..=5).contains(&rating) {
        return Err(ApiError::Validation(
            "rating must be between 1 and 5".to_string(),
        ));
    }
    Ok(())
}

/// POST /books/:id/reviews
pub async fn create(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(book_id): Path<String>,
    Json(request): Json<CreateReviewRequest>,
) -> Result<Json<ReviewView>, ApiError> {
    let book = Uuid::parse_str(book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    validate_rating(request.rating)?;
    let content = request.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::Validation("review content is required".to_string()));
    }
    let deal = match &request.deal_id {
        Some(raw) => Some(
            Uuid::parse_str(raw.trim())
                .map_err(|_| ApiError::Validation("invalid deal id".to_string()))?,
        ),
        None => None,
    };
    let rating = request.rating;
    let (saved, nickname) = db::run(&state.pool, move |conn| {
        use crate::schema::{books, reviews, users};
        let known = books::table
            .find(book)
            .select(books::id)
            .first::<Uuid>(conn)
            .optional()?;
        if known.is_none() {
            return Err(ApiError::NotFound("book not found".to_string()));
        }
        let row = NewReview {
            id: Uuid::new_v4(),
            user_id: user,
            book_id: book,
            deal_id: deal,
            rating,
            content,
            created_at: Utc::now().naive_utc(),
        };
        let saved: Review = diesel::insert_into(reviews::table)
            .values(&row)
            .get_result(conn)?;
        let nickname: String = users::table
            .find(user)
            .select(users::nickname)
            .first(conn)?;
        Ok((saved, nickname))
    })
    .await?;
    Ok(Json(ReviewView {
        id: saved.id,
        user_id: saved.user_id,
        nickname,
        rating: saved.rating,
        content: saved.content,
        created_at: saved.created_at,
    }))
}

/// GET /books/:id/reviews
pub async fn list_for_book(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Query(params): Query<PageQuery>,
) -> Result<Json<Paged<ReviewView>>, ApiError> {
    let target = Uuid::parse_str(book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let (page, limit) = page_window(params.page, params.limit);
    let offset = (page - 1) * limit;
    let (total, rows, names) = db::run(&state.pool, move |conn| {
        use crate::schema::{reviews, users};
        let total: i64 = reviews::table
            .filter(reviews::book_id.eq(target))
            .count()
            .get_result(conn)?;
        let rows: Vec<Review> = reviews::table
            .filter(reviews::book_id.eq(target))
            .order(reviews::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(conn)?;
        let user_ids: Vec<Uuid> = rows.iter().map(|review| review.user_id).collect();
        let names: HashMap<Uuid, String> = users::table
            .select((users::id, users::nickname))
            .filter(users::id.eq_any(user_ids))
            .load::<(Uuid, String)>(conn)?
            .into_iter()
            .collect();
        Ok((total, rows, names))
    })
    .await?;
    let items = rows
        .into_iter()
        .map(|review| {
            let nickname = names.get(&review.user_id).cloned().unwrap_or_default();
            ReviewView {
                id: review.id,
                user_id: review.user_id,
                nickname,
                rating: review.rating,
                content: review.content,
                created_at: review.created_at,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratings_outside_one_to_five_are_rejected() {
        assert!(validate_rating(0).is_err());
        assert!(validate_rating(6).is_err());
        assert!(validate_rating(-1).is_err());
        for ok in 1..=5 {
            assert!(validate_rating(ok).is_ok());
        }
    }
}
