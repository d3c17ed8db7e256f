//! Public catalog browsing.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::MaybeUser;
use crate::db;
use crate::error::ApiError;
use crate::models::{page_window, Book, Paged};
use crate::old_deals;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct BookQuery {
    pub query: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSummary {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub book_pic: Option<String>,
    pub category: Option<String>,
    pub rent_price: i64,
    pub own_price: i64,
    pub book_type: String,
}

impl From<Book> for BookSummary {
    fn from(book: Book) -> Self {
        BookSummary {
            id: book.id,
            title: book.title,
            author: book.author,
            publisher: book.publisher,
            book_pic: book.book_pic,
            category: book.category,
            rent_price: book.rent_price,
            own_price: book.own_price,
            book_type: book.book_type,
        }
    }
}

/// GET /books. Newest first, optionally narrowed by category and by a
/// title/author substring search.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<BookQuery>,
) -> Result<Json<Paged<BookSummary>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let offset = (page - 1) * limit;
    let search = params.query;
    let category_filter = params.category;
    let (total, rows) = db::run(&state.pool, move |conn| {
        use crate::schema::books::dsl::*;
        let mut count_query = books.select(diesel::dsl::count_star()).into_boxed();
        let mut rows_query = books.into_boxed();
        if let Some(wanted) = &category_filter {
            count_query = count_query.filter(category.eq(wanted.clone()));
            rows_query = rows_query.filter(category.eq(wanted.clone()));
        }
        if let Some(needle) = &search {
            let pattern = format!("%{}%", needle.trim());
            count_query =
                count_query.filter(title.ilike(pattern.clone()).or(author.ilike(pattern.clone())));
            rows_query = rows_query.filter(title.ilike(pattern.clone()).or(author.ilike(pattern)));
        }
        let total: i64 = count_query.first(conn)?;
        let rows: Vec<Book> = rows_query
            .order(created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(conn)?;
        Ok((total, rows))
    })
    .await?;
    Ok(Json(Paged {
        total,
        page,
        limit,
        items: rows.into_iter().map(BookSummary::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDetail {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub book_pic: Option<String>,
    pub category: Option<String>,
    pub rent_price: i64,
    pub own_price: i64,
    pub original_price: Option<i64>,
    pub total_time: Option<i32>,
    pub published_at: Option<String>,
    pub description: Option<String>,
    pub contents: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub page_count: Option<i32>,
    pub book_type: String,
    pub created_at: NaiveDateTime,
    pub review_count: i64,
    pub heart_count: i64,
    pub active_listings: i64,
    pub hearted: bool,
}

/// GET /books/:id. The catalog entry plus its social counters; `hearted`
/// reflects the viewer when a valid token is present.
pub async fn detail(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    MaybeUser(viewer): MaybeUser,
) -> Result<Json<BookDetail>, ApiError> {
    let target = Uuid::parse_str(book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let detail = db::run(&state.pool, move |conn| {
        use crate::schema::{books, hearts, reviews};
        let book: Option<Book> = books::table.find(target).first(conn).optional()?;
        let book = book.ok_or_else(|| ApiError::NotFound("book not found".to_string()))?;
        let review_count: i64 = reviews::table
            .filter(reviews::book_id.eq(target))
            .count()
            .get_result(conn)?;
        let heart_count: i64 = hearts::table
            .filter(hearts::book_id.eq(target))
            .count()
            .get_result(conn)?;
        let active_listings = old_deals::active_count_for_book(conn, target)?;
        let hearted = match viewer {
            Some(user) => hearts::table
                .filter(hearts::user_id.eq(user))
                .filter(hearts::book_id.eq(target))
                .select(hearts::id)
                .first::<Uuid>(conn)
                .optional()?
                .is_some(),
            None => false,
        };
        Ok(BookDetail {
            id: book.id,
            title: book.title,
            author: book.author,
            publisher: book.publisher,
            book_pic: book.book_pic,
            category: book.category,
            rent_price: book.rent_price,
            own_price: book.own_price,
            original_price: book.original_price,
            total_time: book.total_time,
            published_at: book.published_at,
            description: book.description,
            contents: book.contents,
            isbn: book.isbn,
            isbn13: book.isbn13,
            page_count: book.page_count,
            book_type: book.book_type,
            created_at: book.created_at,
            review_count,
            heart_count,
            active_listings,
            hearted,
        })
    })
    .await?;
    Ok(Json(detail))
}
