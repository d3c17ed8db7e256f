//! The single consumer of the listing event bus. Matches each announcement
//! against the stored subscriptions, persists one notification per
//! recipient and pushes to all their devices best-effort. The read
//! endpoints for the in-app notification feed live here too.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::alerts;
use crate::auth::AuthUser;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::events::{EventType, ListingEvent};
use crate::models::{
    page_window, NewNotification, Notice, NoticeType, Notification, NotificationKind, Paged,
};
use crate::push::{PushGateway, PushMessage};
use crate::AppState;

pub async fn run_listener(state: AppState, mut inbox: UnboundedReceiver<ListingEvent>) {
    log::info!("notification listener started");
    while let Some(event) = inbox.recv().await {
        if let Err(err) = handle_event(&state, &event).await {
            log::error!("listing event for '{}' failed: {err}", event.title);
        }
    }
    log::info!("notification listener stopped");
}

async fn handle_event(state: &AppState, event: &ListingEvent) -> Result<(), ApiError> {
    if event.event_type == EventType::New {
        link_pending_subscriptions(state, event).await?;
    }
    let candidates = load_candidates(&state.pool, event).await?;
    let recipients = filter_subscribers(event, candidates);
    if recipients.is_empty() {
        return Ok(());
    }
    log::info!(
        "notifying {} subscribers about '{}'",
        recipients.len(),
        event.title
    );
    let deliveries = recipients
        .into_iter()
        .map(|notice| deliver(state, event, notice.user_id));
    join_all(deliveries).await;
    Ok(())
}

/// A NEW event means the title just entered the catalog, so subscriptions
/// created before registration get their book reference filled in first.
async fn link_pending_subscriptions(state: &AppState, event: &ListingEvent) -> Result<(), ApiError> {
    let (Some(book), Some(author)) = (event.book_id, event.author.as_deref()) else {
        return Ok(());
    };
    let Some(key) = alerts::subscription_key(&event.title, author) else {
        return Ok(());
    };
    let linked = db::run(&state.pool, move |conn| {
        alerts::promote_pending(conn, &key, book)
    })
    .await?;
    if linked > 0 {
        log::info!("linked {linked} pending subscriptions to book {book}");
    }
    Ok(())
}

/// Candidate subscriptions match on the normalized title+author key or on
/// the concrete book reference.
async fn load_candidates(pool: &DbPool, event: &ListingEvent) -> Result<Vec<Notice>, ApiError> {
    let key = event
        .author
        .as_deref()
        .and_then(|author| alerts::subscription_key(&event.title, author));
    let book = event.book_id;
    if key.is_none() && book.is_none() {
        return Ok(Vec::new());
    }
    db::run(pool, move |conn| {
        use crate::schema::notices::dsl::*;
        let mut query = notices.filter(notice.eq(true)).into_boxed();
        query = match (key, book) {
            (Some(wanted_key), Some(wanted_book)) => {
                query.filter(match_key.eq(wanted_key).nullable().or(book_id.eq(wanted_book)))
            }
            (Some(wanted_key), None) => query.filter(match_key.eq(wanted_key)),
            (None, Some(wanted_book)) => query.filter(book_id.eq(wanted_book)),
            (None, None) => return Ok(Vec::new()),
        };
        query.load::<Notice>(conn).map_err(Into::into)
    })
    .await
}

/// Applies the subscription rules: the flag must be on, the stored type
/// must cover the event (ANY covers everything, unknown legacy values are
/// treated as ANY), the listing seller never gets notified about their own
/// listing, and each user appears at most once even with several matching
/// subscriptions.
fn filter_subscribers(event: &ListingEvent, candidates: Vec<Notice>) -> Vec<Notice> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            if !candidate.notice {
                return false;
            }
            let type_ok = match NoticeType::parse(&candidate.notice_type) {
                Some(NoticeType::Any) | None => true,
                Some(NoticeType::New) => event.event_type == EventType::New,
                Some(NoticeType::Old) => event.event_type == EventType::Old,
            };
            if !type_ok {
                return false;
            }
            if event.seller_id == Some(candidate.user_id) {
                return false;
            }
            seen.insert(candidate.user_id)
        })
        .collect()
}

fn notification_kind(event_type: EventType) -> NotificationKind {
    match event_type {
        EventType::New => NotificationKind::NewListed,
        EventType::Old => NotificationKind::OldListed,
    }
}

fn build_notification(event: &ListingEvent, user: Uuid) -> NewNotification {
    NewNotification {
        id: Uuid::new_v4(),
        user_id: user,
        kind: notification_kind(event.event_type).as_str().to_string(),
        read: false,
        book_id: event.book_id,
        deal_id: event.deal_id,
        image: event.image.clone(),
        price: event.price,
        created_at: Utc::now().naive_utc(),
    }
}

fn build_push_message(event: &ListingEvent) -> PushMessage {
    let title = match event.event_type {
        EventType::New => format!("{} is now in the store", event.title),
        EventType::Old => format!("A used copy of {} was listed", event.title),
    };
    let body = match event.price {
        Some(price) => format!("Price: {price} coins"),
        None => "Open the app for details".to_string(),
    };
    PushMessage {
        title,
        body,
        data: json!({
            "kind": notification_kind(event.event_type).as_str(),
            "bookId": event.book_id,
            "dealId": event.deal_id,
            "price": event.price,
        }),
    }
}

/// One notification record per recipient; the pushes afterwards are
/// best-effort and never undo the stored record.
async fn deliver(state: &AppState, event: &ListingEvent, user: Uuid) {
    let record = build_notification(event, user);
    let persisted = db::run(&state.pool, move |conn| {
        use crate::schema::notifications::dsl::*;
        diesel::insert_into(notifications)
            .values(&record)
            .execute(conn)
            .map_err(Into::into)
    })
    .await;
    if let Err(err) = persisted {
        log::error!("could not persist notification for user {user}: {err}");
        return;
    }
    let tokens = match load_tokens(&state.pool, user).await {
        Ok(tokens) => tokens,
        Err(err) => {
            log::error!("could not load device tokens for user {user}: {err}");
            return;
        }
    };
    let message = build_push_message(event);
    push_to_devices(state.push.as_ref(), user, &tokens, &message).await;
}

async fn push_to_devices(
    gateway: &dyn PushGateway,
    user: Uuid,
    tokens: &[String],
    message: &PushMessage,
) {
    for token in tokens {
        if let Err(err) = gateway.send(token, message).await {
            log::warn!("push to a device of user {user} failed: {err}");
        }
    }
}

async fn load_tokens(pool: &DbPool, user: Uuid) -> Result<Vec<String>, ApiError> {
    db::run(pool, move |conn| {
        use crate::schema::device_tokens::dsl::*;
        device_tokens
            .filter(user_id.eq(user))
            .select(token)
            .load(conn)
            .map_err(Into::into)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub unread: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub id: Uuid,
    pub kind: String,
    pub read: bool,
    pub book_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub image: Option<String>,
    pub price: Option<i64>,
    pub created_at: NaiveDateTime,
}

impl From<Notification> for NotificationView {
    fn from(row: Notification) -> Self {
        NotificationView {
            id: row.id,
            kind: row.kind,
            read: row.read,
            book_id: row.book_id,
            deal_id: row.deal_id,
            image: row.image,
            price: row.price,
            created_at: row.created_at,
        }
    }
}

/// GET /notifications
pub async fn list(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(params): Query<NotificationQuery>,
) -> Result<Json<Paged<NotificationView>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let unread_only = params.unread.unwrap_or(false);
    let offset = (page - 1) * limit;
    let (total, rows) = db::run(&state.pool, move |conn| {
        use crate::schema::notifications::dsl::*;
        if unread_only {
            let total: i64 = notifications
                .filter(user_id.eq(user))
                .filter(read.eq(false))
                .count()
                .get_result(conn)?;
            let rows: Vec<Notification> = notifications
                .filter(user_id.eq(user))
                .filter(read.eq(false))
                .order(created_at.desc())
                .offset(offset)
                .limit(limit)
                .load(conn)?;
            Ok((total, rows))
        } else {
            let total: i64 = notifications
                .filter(user_id.eq(user))
                .count()
                .get_result(conn)?;
            let rows: Vec<Notification> = notifications
                .filter(user_id.eq(user))
                .order(created_at.desc())
                .offset(offset)
                .limit(limit)
                .load(conn)?;
            Ok((total, rows))
        }
    })
    .await?;
    Ok(Json(Paged {
        total,
        page,
        limit,
        items: rows.into_iter().map(NotificationView::from).collect(),
    }))
}

/// POST /notifications/:id/read
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(notification_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = Uuid::parse_str(notification_id.trim())
        .map_err(|_| ApiError::Validation("invalid notification id".to_string()))?;
    let updated = db::run(&state.pool, move |conn| {
        use crate::schema::notifications::dsl::*;
        diesel::update(notifications.filter(id.eq(target)).filter(user_id.eq(user)))
            .set(read.eq(true))
            .execute(conn)
            .map_err(Into::into)
    })
    .await?;
    if updated == 0 {
        return Err(ApiError::NotFound("notification not found".to_string()));
    }
    Ok(Json(json!({ "status": "read" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Mutex;

    fn ts(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }

    fn notice_row(user: Uuid, stored_type: &str, on: bool) -> Notice {
        Notice {
            id: Uuid::new_v4(),
            user_id: user,
            book_id: None,
            title: "Dune".to_string(),
            author: "Herbert".to_string(),
            publisher: None,
            match_key: "dune:herbert".to_string(),
            notice: on,
            notice_type: stored_type.to_string(),
            noticed_at: ts(0),
            created_at: ts(0),
        }
    }

    fn event_fixture(event_type: EventType, seller: Option<Uuid>) -> ListingEvent {
        ListingEvent {
            event_type,
            title: "Dune".to_string(),
            author: Some("Herbert".to_string()),
            book_id: Some(Uuid::new_v4()),
            deal_id: Some(Uuid::new_v4()),
            seller_id: seller,
            price: Some(4500),
            image: None,
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<String>>,
        fail_tokens: HashSet<String>,
    }

    impl RecordingGateway {
        fn failing_on(token: &str) -> Self {
            RecordingGateway {
                sent: Mutex::new(Vec::new()),
                fail_tokens: [token.to_string()].into(),
            }
        }
    }

    #[async_trait]
    impl PushGateway for RecordingGateway {
        async fn send(&self, token: &str, _message: &PushMessage) -> Result<(), crate::push::PushError> {
            self.sent.lock().await.push(token.to_string());
            if self.fail_tokens.contains(token) {
                return Err(crate::push::PushError::Rejected("boom".to_string()));
            }
            Ok(())
        }
    }

    // ---- subscriber filtering ----

    #[test]
    fn type_filter_matches_any_and_exact() {
        let old_event = event_fixture(EventType::Old, None);
        let candidates = vec![
            notice_row(Uuid::new_v4(), "ANY", true),
            notice_row(Uuid::new_v4(), "OLD", true),
            notice_row(Uuid::new_v4(), "NEW", true),
        ];
        let recipients = filter_subscribers(&old_event, candidates);
        let types: Vec<&str> = recipients.iter().map(|n| n.notice_type.as_str()).collect();
        assert_eq!(types, vec!["ANY", "OLD"]);
    }

    #[test]
    fn unknown_stored_types_are_treated_as_any() {
        let event = event_fixture(EventType::New, None);
        let recipients = filter_subscribers(&event, vec![notice_row(Uuid::new_v4(), "LEGACY", true)]);
        assert_eq!(recipients.len(), 1);
    }

    #[test]
    fn disabled_subscriptions_never_match() {
        let event = event_fixture(EventType::Old, None);
        let recipients = filter_subscribers(&event, vec![notice_row(Uuid::new_v4(), "ANY", false)]);
        assert!(recipients.is_empty());
    }

    #[test]
    fn the_seller_is_not_notified_about_their_own_listing() {
        let seller = Uuid::new_v4();
        let event = event_fixture(EventType::Old, Some(seller));
        let candidates = vec![
            notice_row(seller, "ANY", true),
            notice_row(Uuid::new_v4(), "ANY", true),
        ];
        let recipients = filter_subscribers(&event, candidates);
        assert_eq!(recipients.len(), 1);
        assert_ne!(recipients[0].user_id, seller);
    }

    #[test]
    fn duplicate_subscriptions_collapse_to_one_recipient() {
        let user = Uuid::new_v4();
        let event = event_fixture(EventType::Old, None);
        let candidates = vec![
            notice_row(user, "ANY", true),
            notice_row(user, "OLD", true),
        ];
        assert_eq!(filter_subscribers(&event, candidates).len(), 1);
    }

    // ---- notification building ----

    #[test]
    fn notification_starts_unread_and_carries_the_refs() {
        let user = Uuid::new_v4();
        let event = event_fixture(EventType::Old, None);
        let record = build_notification(&event, user);
        assert_eq!(record.user_id, user);
        assert!(!record.read);
        assert_eq!(record.kind, "OLD_LISTED");
        assert_eq!(record.book_id, event.book_id);
        assert_eq!(record.deal_id, event.deal_id);
        assert_eq!(record.price, Some(4500));
    }

    #[test]
    fn new_events_map_to_the_new_listed_kind() {
        let record = build_notification(&event_fixture(EventType::New, None), Uuid::new_v4());
        assert_eq!(record.kind, "NEW_LISTED");
    }

    // ---- device pushes ----

    #[tokio::test]
    async fn one_record_per_user_but_every_device_pushed() {
        let user = Uuid::new_v4();
        let event = event_fixture(EventType::Old, None);
        let candidates = vec![
            notice_row(user, "ANY", true),
            notice_row(user, "OLD", true),
        ];
        let recipients = filter_subscribers(&event, candidates);
        assert_eq!(recipients.len(), 1);

        let gateway = RecordingGateway::default();
        let tokens = vec!["device-a".to_string(), "device-b".to_string()];
        push_to_devices(&gateway, user, &tokens, &build_push_message(&event)).await;
        assert_eq!(
            gateway.sent.lock().await.as_slice(),
            ["device-a", "device-b"]
        );
    }

    #[tokio::test]
    async fn a_failing_device_does_not_stop_the_rest() {
        let gateway = RecordingGateway::failing_on("device-a");
        let tokens = vec!["device-a".to_string(), "device-b".to_string()];
        let event = event_fixture(EventType::Old, None);
        push_to_devices(&gateway, Uuid::new_v4(), &tokens, &build_push_message(&event)).await;
        assert_eq!(
            gateway.sent.lock().await.as_slice(),
            ["device-a", "device-b"]
        );
    }
}
