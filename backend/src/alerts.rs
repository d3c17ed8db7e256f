//! Interest records: restock subscriptions (notices) matched by a
//! normalized title+author key, and plain per-book hearts.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::ApiError;
use crate::models::{Book, Heart, NewHeart, NewNotice, Notice, NoticeType};
use crate::AppState;

/// Canonical key for "the same book by the same author" across sloppy
/// client input and catalog data: both parts are NFC-normalized,
/// lowercased and stripped to their alphanumeric characters. An empty part
/// means no key can be derived.
pub fn subscription_key(title: &str, author: &str) -> Option<String> {
    let title_part = canonical_part(title);
    let author_part = canonical_part(author);
    if title_part.is_empty() || author_part.is_empty() {
        return None;
    }
    Some(format!("{title_part}:{author_part}"))
}

fn canonical_part(text: &str) -> String {
    text.nfc()
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// A subscription request identifies its target either by catalog id or by
/// a raw title+author pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeTarget {
    ByBook(Uuid),
    ByKey {
        key: String,
        title: String,
        author: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeRequest {
    pub notice: bool,
    pub notice_type: Option<NoticeType>,
    pub book_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
}

pub(crate) fn resolve_target(request: &NoticeRequest) -> Result<NoticeTarget, ApiError> {
    if let Some(raw) = &request.book_id {
        let id = Uuid::parse_str(raw.trim())
            .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
        return Ok(NoticeTarget::ByBook(id));
    }
    match (&request.title, &request.author) {
        (Some(title), Some(author)) => {
            let key = subscription_key(title, author).ok_or_else(|| {
                ApiError::Validation("title and author leave nothing to match on".to_string())
            })?;
            Ok(NoticeTarget::ByKey {
                key,
                title: title.clone(),
                author: author.clone(),
            })
        }
        _ => Err(ApiError::Validation(
            "bookId or title and author are required".to_string(),
        )),
    }
}

fn subscribe(
    conn: &mut PgConnection,
    user: Uuid,
    target: NoticeTarget,
    wanted_type: NoticeType,
) -> Result<Notice, ApiError> {
    use crate::schema::{books, notices};

    let now = Utc::now().naive_utc();
    let (book, key, title, author, publisher) = match target {
        NoticeTarget::ByBook(book_id) => {
            let book: Option<Book> = books::table.find(book_id).first(conn).optional()?;
            let book = book.ok_or_else(|| ApiError::NotFound("book not found".to_string()))?;
            let key = subscription_key(&book.title, &book.author).ok_or_else(|| {
                ApiError::Validation("book has no usable title and author".to_string())
            })?;
            (Some(book.id), key, book.title, book.author, Some(book.publisher))
        }
        NoticeTarget::ByKey { key, title, author } => {
            // the pair may already be in the catalog, in which case the
            // subscription links up right away instead of staying pending
            let existing: Option<Book> = books::table
                .filter(books::match_key.eq(&key))
                .first(conn)
                .optional()?;
            match existing {
                Some(book) => (
                    Some(book.id),
                    key,
                    book.title,
                    book.author,
                    Some(book.publisher),
                ),
                None => (None, key, title, author, None),
            }
        }
    };

    let row = NewNotice {
        id: Uuid::new_v4(),
        user_id: user,
        book_id: book,
        title,
        author,
        publisher,
        match_key: key,
        notice: true,
        notice_type: wanted_type.as_str().to_string(),
        noticed_at: now,
        created_at: now,
    };
    let snapshot = row.clone();
    diesel::insert_into(notices::table)
        .values(&row)
        .on_conflict((notices::user_id, notices::match_key))
        .do_update()
        .set((
            notices::notice.eq(true),
            notices::notice_type.eq(snapshot.notice_type),
            notices::noticed_at.eq(now),
            notices::book_id.eq(snapshot.book_id),
            notices::title.eq(snapshot.title),
            notices::author.eq(snapshot.author),
            notices::publisher.eq(snapshot.publisher),
        ))
        .get_result::<Notice>(conn)
        .map_err(Into::into)
}

fn unsubscribe(conn: &mut PgConnection, user: Uuid, target: NoticeTarget) -> Result<usize, ApiError> {
    use crate::schema::notices::dsl::*;
    let deleted = match target {
        NoticeTarget::ByBook(book) => diesel::delete(
            notices.filter(user_id.eq(user)).filter(book_id.eq(book)),
        )
        .execute(conn)?,
        NoticeTarget::ByKey { key, .. } => diesel::delete(
            notices.filter(user_id.eq(user)).filter(match_key.eq(key)),
        )
        .execute(conn)?,
    };
    Ok(deleted)
}

/// Attaches a freshly registered book to every pending subscription with
/// the same key. Called from the notification listener on NEW events.
pub fn promote_pending(conn: &mut PgConnection, key: &str, new_book: Uuid) -> Result<usize, ApiError> {
    use crate::schema::notices::dsl::*;
    diesel::update(notices.filter(match_key.eq(key)).filter(book_id.is_null()))
        .set(book_id.eq(new_book))
        .execute(conn)
        .map_err(Into::into)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeView {
    pub id: Uuid,
    pub book_id: Option<Uuid>,
    pub title: String,
    pub author: String,
    pub publisher: Option<String>,
    pub notice_type: String,
    pub noticed_at: NaiveDateTime,
}

impl From<Notice> for NoticeView {
    fn from(row: Notice) -> Self {
        NoticeView {
            id: row.id,
            book_id: row.book_id,
            title: row.title,
            author: row.author,
            publisher: row.publisher,
            notice_type: row.notice_type,
            noticed_at: row.noticed_at,
        }
    }
}

/// POST /alerts/notices. `notice: true` subscribes (idempotently, updating
/// the existing record in place), `notice: false` deletes by whichever
/// identifier the request carries. Unsubscribe answers `null`.
pub async fn upsert_notice(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<NoticeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = resolve_target(&request)?;
    if request.notice {
        let wanted_type = request.notice_type.unwrap_or(NoticeType::Any);
        let saved = db::run(&state.pool, move |conn| {
            subscribe(conn, user, target, wanted_type)
        })
        .await?;
        let view = NoticeView::from(saved);
        serde_json::to_value(view)
            .map(Json)
            .map_err(|err| ApiError::Internal(format!("failed to encode notice: {err}")))
    } else {
        let deleted = db::run(&state.pool, move |conn| unsubscribe(conn, user, target)).await?;
        log::debug!("removed {deleted} subscription rows for user {user}");
        Ok(Json(serde_json::Value::Null))
    }
}

/// GET /users/me/notices
pub async fn list_notices(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Vec<NoticeView>>, ApiError> {
    let rows = db::run(&state.pool, move |conn| {
        use crate::schema::notices::dsl::*;
        notices
            .filter(user_id.eq(user))
            .order(noticed_at.desc())
            .load::<Notice>(conn)
            .map_err(Into::into)
    })
    .await?;
    Ok(Json(rows.into_iter().map(NoticeView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct HeartRequest {
    pub on: bool,
}

/// POST /books/:id/hearts
pub async fn toggle_heart(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(book_id): Path<String>,
    Json(request): Json<HeartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let book = Uuid::parse_str(book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let status = db::run(&state.pool, move |conn| {
        use crate::schema::{books, hearts};
        if request.on {
            let known = books::table
                .find(book)
                .select(books::id)
                .first::<Uuid>(conn)
                .optional()?;
            if known.is_none() {
                return Err(ApiError::NotFound("book not found".to_string()));
            }
            let row = NewHeart {
                id: Uuid::new_v4(),
                user_id: user,
                book_id: book,
                created_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(hearts::table)
                .values(&row)
                .on_conflict((hearts::user_id, hearts::book_id))
                .do_nothing()
                .execute(conn)?;
            Ok(json!({ "status": "hearted" }))
        } else {
            diesel::delete(
                hearts::table
                    .filter(hearts::user_id.eq(user))
                    .filter(hearts::book_id.eq(book)),
            )
            .execute(conn)?;
            Ok(json!({ "status": "unhearted" }))
        }
    })
    .await?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartView {
    pub book_id: Uuid,
    pub title: String,
    pub author: String,
    pub book_pic: Option<String>,
    pub hearted_at: NaiveDateTime,
}

/// GET /users/me/hearts. Hearts whose catalog row has vanished are left out.
pub async fn list_hearts(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Vec<HeartView>>, ApiError> {
    let views = db::run(&state.pool, move |conn| {
        use crate::schema::{books, hearts};
        let rows: Vec<Heart> = hearts::table
            .filter(hearts::user_id.eq(user))
            .order(hearts::created_at.desc())
            .load(conn)?;
        let ids: Vec<Uuid> = rows.iter().map(|heart| heart.book_id).collect();
        let catalog: Vec<Book> = books::table.filter(books::id.eq_any(ids)).load(conn)?;
        let by_id: std::collections::HashMap<Uuid, Book> =
            catalog.into_iter().map(|book| (book.id, book)).collect();
        let views = rows
            .into_iter()
            .filter_map(|heart| {
                let book = by_id.get(&heart.book_id)?;
                Some(HeartView {
                    book_id: heart.book_id,
                    title: book.title.clone(),
                    author: book.author.clone(),
                    book_pic: book.book_pic.clone(),
                    hearted_at: heart.created_at,
                })
            })
            .collect::<Vec<_>>();
        Ok(views)
    })
    .await?;
    Ok(Json(views))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_folds_case_whitespace_and_punctuation() {
        let a = subscription_key("Harry Potter!", "J. K. Rowling");
        let b = subscription_key("harry potter", "JK Rowling");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn key_normalizes_unicode_composition() {
        let composed = subscription_key("Café", "Gide");
        let decomposed = subscription_key("Cafe\u{0301}", "Gide");
        assert!(composed.is_some());
        assert_eq!(composed, decomposed);
    }

    #[test]
    fn key_keeps_non_latin_letters() {
        let key = subscription_key("해리 포터", "조앤 롤링").unwrap();
        assert_eq!(key, "해리포터:조앤롤링");
    }

    #[test]
    fn key_requires_both_parts() {
        assert_eq!(subscription_key("", "Author"), None);
        assert_eq!(subscription_key("Title", ""), None);
        assert_eq!(subscription_key("!!!", "Author"), None);
        assert_eq!(subscription_key("Title", "..."), None);
    }

    #[test]
    fn key_separator_cannot_be_forged_from_input() {
        // a colon in the title is stripped, so it cannot collide with the
        // title/author separator
        let forged = subscription_key("a:b", "c").unwrap();
        let plain = subscription_key("ab", "c").unwrap();
        assert_eq!(forged, plain);
    }

    fn request(
        notice: bool,
        book_id: Option<&str>,
        title: Option<&str>,
        author: Option<&str>,
    ) -> NoticeRequest {
        NoticeRequest {
            notice,
            notice_type: None,
            book_id: book_id.map(str::to_string),
            title: title.map(str::to_string),
            author: author.map(str::to_string),
        }
    }

    #[test]
    fn target_prefers_the_book_id() {
        let id = Uuid::new_v4();
        let resolved =
            resolve_target(&request(true, Some(&id.to_string()), Some("T"), Some("A"))).unwrap();
        assert_eq!(resolved, NoticeTarget::ByBook(id));
    }

    #[test]
    fn target_falls_back_to_title_and_author() {
        let resolved = resolve_target(&request(true, None, Some("Dune"), Some("Herbert"))).unwrap();
        match resolved {
            NoticeTarget::ByKey { key, title, author } => {
                assert_eq!(key, "dune:herbert");
                assert_eq!(title, "Dune");
                assert_eq!(author, "Herbert");
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn target_rejects_malformed_book_id() {
        let result = resolve_target(&request(true, Some("not-a-uuid"), None, None));
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[test]
    fn unsubscribe_without_identifiers_is_rejected() {
        let result = resolve_target(&request(false, None, None, None));
        assert!(matches!(result, Err(ApiError::Validation(_))));
        let result = resolve_target(&request(false, None, Some("only title"), None));
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[test]
    fn resubscribing_a_variant_spelling_targets_the_same_row() {
        // the (user_id, match_key) upsert can only land on the existing row
        // if variant spellings of the pair resolve to the same key
        let first = resolve_target(&request(true, None, Some("Harry Potter!"), Some("J. K. Rowling")));
        let second = resolve_target(&request(true, None, Some("harry potter"), Some("JK Rowling")));
        let key_of = |target: NoticeTarget| match target {
            NoticeTarget::ByKey { key, .. } => key,
            other => panic!("unexpected target {other:?}"),
        };
        assert_eq!(key_of(first.unwrap()), key_of(second.unwrap()));
    }
}
