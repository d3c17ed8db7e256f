//! Money and book movements: coin charges and cashouts, first-hand
//! purchases and refunds, used listings and their sales.
//!
//! Every handler writes as a plain sequence without a wrapping transaction;
//! a failure partway leaves the earlier steps in place.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::ApiError;
use crate::events::{EventType, ListingEvent};
use crate::models::{
    Book, Deal, DealCategory, DealKind, DealStatus, NewDeal, NewUserBook, UserBook,
    UserBookStatus,
};
use crate::old_deals::parse_good_points;
use crate::AppState;

fn coin_balance(conn: &mut PgConnection, user: Uuid) -> Result<i64, ApiError> {
    use crate::schema::users;
    users::table
        .find(user)
        .select(users::coin)
        .first(conn)
        .map_err(Into::into)
}

fn adjust_coins(conn: &mut PgConnection, user: Uuid, delta: i64) -> Result<i64, ApiError> {
    use crate::schema::users;
    diesel::update(users::table.find(user))
        .set(users::coin.eq(users::coin + delta))
        .returning(users::coin)
        .get_result(conn)
        .map_err(Into::into)
}

async fn verify_receipt(state: &AppState, receipt: &str) -> Result<(), ApiError> {
    let response = state
        .http
        .post(&state.config.receipt_endpoint)
        .json(&json!({ "receipt": receipt }))
        .send()
        .await
        .map_err(|err| ApiError::Internal(format!("receipt endpoint unreachable: {err}")))?;
    if !response.status().is_success() {
        return Err(ApiError::Validation("receipt was rejected".to_string()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletView {
    pub deal_id: Uuid,
    pub coin: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRequest {
    pub amount: i64,
    pub receipt: String,
}

/// POST /deals/charges. The store receipt is checked upstream before any
/// write; the deal row is recorded first and the coin credit follows it.
pub async fn charge(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<ChargeRequest>,
) -> Result<(StatusCode, Json<WalletView>), ApiError> {
    if request.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }
    let receipt = request.receipt.trim().to_string();
    if receipt.is_empty() {
        return Err(ApiError::Validation("receipt is required".to_string()));
    }
    verify_receipt(&state, &receipt).await?;
    let amount = request.amount;
    let (deal_id, coin) = db::run(&state.pool, move |conn| {
        use crate::schema::deals;
        let now = Utc::now().naive_utc();
        let row = NewDeal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: user,
            book_id: String::new(),
            price: amount,
            remaining_time: None,
            condition: None,
            kind: DealKind::Charge.as_str().to_string(),
            status: DealStatus::Completed.as_str().to_string(),
            category: DealCategory::Coin.as_str().to_string(),
            comment: Some(receipt),
            good_points: None,
            source_deal_id: None,
            registered_at: now,
            dealt_at: Some(now),
        };
        let saved: Deal = diesel::insert_into(deals::table)
            .values(&row)
            .get_result(conn)?;
        let coin = adjust_coins(conn, user, amount)?;
        Ok((saved.id, coin))
    })
    .await?;
    log::info!("user {user} charged {amount} coins");
    Ok((StatusCode::CREATED, Json(WalletView { deal_id, coin })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseType {
    Rent,
    Own,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub book_id: String,
    pub purchase_type: PurchaseType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseView {
    pub deal_id: Uuid,
    pub user_book_id: Uuid,
    pub coin: i64,
}

fn price_for(purchase_type: PurchaseType, book: &Book) -> i64 {
    match purchase_type {
        PurchaseType::Rent => book.rent_price,
        PurchaseType::Own => book.own_price,
    }
}

/// POST /deals/purchases. A rental grants a timed copy that can never be
/// resold; buying outright grants an untimed copy that can.
pub async fn purchase(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseView>), ApiError> {
    let book_ref = Uuid::parse_str(request.book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let purchase_type = request.purchase_type;
    let (deal_id, user_book_id, coin) = db::run(&state.pool, move |conn| {
        use crate::schema::{books, deals, user_books};
        let book: Book = books::table
            .find(book_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("book not found".to_string()))?;
        let price = price_for(purchase_type, &book);
        let balance = coin_balance(conn, user)?;
        if balance < price {
            return Err(ApiError::Validation("not enough coins".to_string()));
        }
        let now = Utc::now().naive_utc();
        let remaining = match purchase_type {
            PurchaseType::Rent => book.total_time.map(|minutes| i64::from(minutes) * 60),
            PurchaseType::Own => None,
        };
        let status = match purchase_type {
            PurchaseType::Rent => UserBookStatus::Unsellable,
            PurchaseType::Own => UserBookStatus::Sellable,
        };
        let deal = NewDeal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: user,
            book_id: book.id.to_string(),
            price,
            remaining_time: remaining,
            condition: None,
            kind: DealKind::New.as_str().to_string(),
            status: DealStatus::Completed.as_str().to_string(),
            category: DealCategory::Book.as_str().to_string(),
            comment: None,
            good_points: None,
            source_deal_id: None,
            registered_at: now,
            dealt_at: Some(now),
        };
        let saved: Deal = diesel::insert_into(deals::table)
            .values(&deal)
            .get_result(conn)?;
        let coin = adjust_coins(conn, user, -price)?;
        let copy = NewUserBook {
            id: Uuid::new_v4(),
            user_id: user,
            book_id: book.id.to_string(),
            status: status.as_str().to_string(),
            remaining_time: remaining,
            source_deal_id: Some(saved.id),
            created_at: now,
            updated_at: now,
        };
        let granted: UserBook = diesel::insert_into(user_books::table)
            .values(&copy)
            .get_result(conn)?;
        Ok((saved.id, granted.id, coin))
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(PurchaseView {
            deal_id,
            user_book_id,
            coin,
        }),
    ))
}

/// POST /deals/purchases/:id/refund. Only a first-hand purchase still held
/// as-bought can come back; the refund is a second deal row pointing at the
/// first.
pub async fn refund_purchase(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<WalletView>, ApiError> {
    let deal_ref = Uuid::parse_str(id.trim())
        .map_err(|_| ApiError::Validation("invalid deal id".to_string()))?;
    let (deal_id, coin) = db::run(&state.pool, move |conn| {
        use crate::schema::{deals, user_books};
        let purchase: Deal = deals::table
            .find(deal_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("deal not found".to_string()))?;
        if purchase.seller_id != user || purchase.kind != DealKind::New.as_str() {
            return Err(ApiError::NotFound("deal not found".to_string()));
        }
        let refunded = deals::table
            .filter(deals::kind.eq(DealKind::NewRefund.as_str()))
            .filter(deals::source_deal_id.eq(purchase.id))
            .select(deals::id)
            .first::<Uuid>(conn)
            .optional()?;
        if refunded.is_some() {
            return Err(ApiError::Conflict(
                "this purchase was already refunded".to_string(),
            ));
        }
        let copy: UserBook = user_books::table
            .filter(user_books::user_id.eq(user))
            .filter(user_books::source_deal_id.eq(purchase.id))
            .first(conn)
            .optional()?
            .ok_or_else(|| {
                ApiError::Validation("this copy can no longer be refunded".to_string())
            })?;
        let held = matches!(
            UserBookStatus::parse(&copy.status),
            Some(UserBookStatus::Sellable) | Some(UserBookStatus::Unsellable)
        );
        if !held {
            return Err(ApiError::Validation(
                "this copy can no longer be refunded".to_string(),
            ));
        }
        let now = Utc::now().naive_utc();
        let row = NewDeal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: user,
            book_id: purchase.book_id.clone(),
            price: purchase.price,
            remaining_time: None,
            condition: None,
            kind: DealKind::NewRefund.as_str().to_string(),
            status: DealStatus::Completed.as_str().to_string(),
            category: DealCategory::Book.as_str().to_string(),
            comment: None,
            good_points: None,
            source_deal_id: Some(purchase.id),
            registered_at: now,
            dealt_at: Some(now),
        };
        let saved: Deal = diesel::insert_into(deals::table)
            .values(&row)
            .get_result(conn)?;
        let coin = adjust_coins(conn, user, purchase.price)?;
        diesel::update(user_books::table.find(copy.id))
            .set((
                user_books::status.eq(UserBookStatus::Refunded.as_str()),
                user_books::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok((saved.id, coin))
    })
    .await?;
    Ok(Json(WalletView { deal_id, coin }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRequest {
    pub user_book_id: String,
    pub price: i64,
    pub condition: Option<String>,
    pub comment: Option<String>,
    pub good_points: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingView {
    pub id: Uuid,
    pub book_id: Option<Uuid>,
    pub price: i64,
    pub status: String,
    pub condition: Option<String>,
    pub comment: Option<String>,
    pub good_points: Vec<String>,
    pub registered_at: NaiveDateTime,
}

impl From<Deal> for ListingView {
    fn from(deal: Deal) -> Self {
        ListingView {
            id: deal.id,
            book_id: crate::ids::normalize_loose_id(&deal.book_id),
            price: deal.price,
            status: deal.status,
            condition: deal.condition,
            comment: deal.comment,
            good_points: parse_good_points(deal.good_points.as_ref()),
            registered_at: deal.registered_at,
        }
    }
}

/// POST /deals/listings. Puts a sellable copy on the used market and
/// announces it to subscribers.
pub async fn create_listing(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<ListingRequest>,
) -> Result<(StatusCode, Json<ListingView>), ApiError> {
    let copy_ref = Uuid::parse_str(request.user_book_id.trim())
        .map_err(|_| ApiError::Validation("invalid held book id".to_string()))?;
    if request.price <= 0 {
        return Err(ApiError::Validation("price must be positive".to_string()));
    }
    let price = request.price;
    let condition = request.condition.clone();
    let comment = request.comment.clone();
    let good_points = request.good_points.clone().map(JsonValue::from);
    let (listing, book) = db::run(&state.pool, move |conn| {
        use crate::schema::{books, deals, user_books};
        let copy: UserBook = user_books::table
            .find(copy_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("held book not found".to_string()))?;
        if copy.user_id != user {
            return Err(ApiError::NotFound("held book not found".to_string()));
        }
        if UserBookStatus::parse(&copy.status) != Some(UserBookStatus::Sellable) {
            return Err(ApiError::Validation(
                "only a sellable copy can be listed".to_string(),
            ));
        }
        let book_ref = crate::ids::normalize_loose_id(&copy.book_id).ok_or_else(|| {
            ApiError::Validation("the catalog entry for this copy is gone".to_string())
        })?;
        let book: Book = books::table
            .find(book_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| {
                ApiError::Validation("the catalog entry for this copy is gone".to_string())
            })?;
        let now = Utc::now().naive_utc();
        let row = NewDeal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: user,
            book_id: copy.book_id.clone(),
            price,
            remaining_time: copy.remaining_time,
            condition,
            kind: DealKind::Old.as_str().to_string(),
            status: DealStatus::Listing.as_str().to_string(),
            category: DealCategory::Book.as_str().to_string(),
            comment,
            good_points,
            source_deal_id: copy.source_deal_id,
            registered_at: now,
            dealt_at: None,
        };
        let saved: Deal = diesel::insert_into(deals::table)
            .values(&row)
            .get_result(conn)?;
        diesel::update(user_books::table.find(copy.id))
            .set((
                user_books::status.eq(UserBookStatus::Selling.as_str()),
                user_books::source_deal_id.eq(saved.id),
                user_books::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok((saved, book))
    })
    .await?;
    state.events.publish(ListingEvent {
        event_type: EventType::Old,
        title: book.title.clone(),
        author: Some(book.author.clone()),
        book_id: Some(book.id),
        deal_id: Some(listing.id),
        seller_id: Some(user),
        price: Some(listing.price),
        image: book.book_pic,
    });
    Ok((StatusCode::CREATED, Json(ListingView::from(listing))))
}

fn ensure_withdrawable(listing: &Deal, user: Uuid) -> Result<(), ApiError> {
    if listing.seller_id != user {
        return Err(ApiError::NotFound("listing not found".to_string()));
    }
    let pending = listing.kind == DealKind::Old.as_str()
        && listing.status == DealStatus::Listing.as_str()
        && listing.buyer_id.is_none();
    if !pending {
        return Err(ApiError::Validation(
            "listing can no longer be withdrawn".to_string(),
        ));
    }
    Ok(())
}

/// DELETE /deals/listings/:id. Withdrawing deletes the deal row outright
/// and hands the copy back, relinking it to the deal that granted it.
pub async fn delete_listing(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let deal_ref = Uuid::parse_str(id.trim())
        .map_err(|_| ApiError::Validation("invalid deal id".to_string()))?;
    db::run(&state.pool, move |conn| {
        use crate::schema::{deals, user_books};
        let listing: Deal = deals::table
            .find(deal_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("listing not found".to_string()))?;
        ensure_withdrawable(&listing, user)?;
        let now = Utc::now().naive_utc();
        diesel::update(
            user_books::table
                .filter(user_books::user_id.eq(user))
                .filter(user_books::source_deal_id.eq(listing.id)),
        )
        .set((
            user_books::status.eq(UserBookStatus::Sellable.as_str()),
            user_books::source_deal_id.eq(listing.source_deal_id),
            user_books::updated_at.eq(now),
        ))
        .execute(conn)?;
        diesel::delete(deals::table.find(listing.id)).execute(conn)?;
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "status": "withdrawn" })))
}

fn ensure_purchasable(listing: &Deal, buyer: Uuid) -> Result<(), ApiError> {
    let active = listing.kind == DealKind::Old.as_str()
        && listing.status == DealStatus::Listing.as_str()
        && listing.category == DealCategory::Book.as_str()
        && listing.buyer_id.is_none();
    if !active {
        return Err(ApiError::Validation(
            "listing is no longer available".to_string(),
        ));
    }
    if listing.seller_id == buyer {
        return Err(ApiError::Validation(
            "you cannot buy your own listing".to_string(),
        ));
    }
    Ok(())
}

/// POST /deals/listings/:id/purchase. Closes the sale: buyer attached,
/// coins move at the full asking price, the seller's copy keeps a sale
/// snapshot and the buyer gets a copy with whatever time was left.
pub async fn purchase_listing(
    State(state): State<AppState>,
    Extension(AuthUser(buyer)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<PurchaseView>, ApiError> {
    let deal_ref = Uuid::parse_str(id.trim())
        .map_err(|_| ApiError::Validation("invalid deal id".to_string()))?;
    let (deal_id, user_book_id, coin) = db::run(&state.pool, move |conn| {
        use crate::schema::{deals, user_books};
        let listing: Deal = deals::table
            .find(deal_ref)
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("listing not found".to_string()))?;
        ensure_purchasable(&listing, buyer)?;
        let balance = coin_balance(conn, buyer)?;
        if balance < listing.price {
            return Err(ApiError::Validation("not enough coins".to_string()));
        }
        let now = Utc::now().naive_utc();
        let closed: Deal = diesel::update(deals::table.find(listing.id))
            .set((
                deals::buyer_id.eq(buyer),
                deals::status.eq(DealStatus::Completed.as_str()),
                deals::dealt_at.eq(now),
            ))
            .get_result(conn)?;
        let marked = diesel::update(
            user_books::table
                .filter(user_books::user_id.eq(closed.seller_id))
                .filter(user_books::source_deal_id.eq(closed.id)),
        )
        .set((
            user_books::status.eq(UserBookStatus::Sold.as_str()),
            user_books::sale_price.eq(closed.price),
            user_books::sale_date.eq(now),
            user_books::sale_buyer_id.eq(buyer),
            user_books::sale_seller_id.eq(closed.seller_id),
            user_books::updated_at.eq(now),
        ))
        .execute(conn)?;
        if marked == 0 {
            log::warn!("listing {} had no copy to mark as sold", closed.id);
        }
        let granted: UserBook = diesel::insert_into(user_books::table)
            .values(&NewUserBook {
                id: Uuid::new_v4(),
                user_id: buyer,
                book_id: closed.book_id.clone(),
                status: UserBookStatus::Sellable.as_str().to_string(),
                remaining_time: closed.remaining_time,
                source_deal_id: Some(closed.id),
                created_at: now,
                updated_at: now,
            })
            .get_result(conn)?;
        let coin = adjust_coins(conn, buyer, -closed.price)?;
        adjust_coins(conn, closed.seller_id, closed.price)?;
        Ok((closed.id, granted.id, coin))
    })
    .await?;
    Ok(Json(PurchaseView {
        deal_id,
        user_book_id,
        coin,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CashoutRequest {
    pub amount: i64,
    pub account: String,
}

/// POST /deals/cashouts. The payout itself happens out of band; the deal
/// stays PROCESSING until operations settle it.
pub async fn cashout(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<CashoutRequest>,
) -> Result<(StatusCode, Json<WalletView>), ApiError> {
    if request.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }
    let account = request.account.trim().to_string();
    if account.is_empty() {
        return Err(ApiError::Validation(
            "a payout account is required".to_string(),
        ));
    }
    let amount = request.amount;
    let (deal_id, coin) = db::run(&state.pool, move |conn| {
        use crate::schema::deals;
        let balance = coin_balance(conn, user)?;
        if balance < amount {
            return Err(ApiError::Validation("not enough coins".to_string()));
        }
        let row = NewDeal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: user,
            book_id: String::new(),
            price: amount,
            remaining_time: None,
            condition: None,
            kind: DealKind::ToCash.as_str().to_string(),
            status: DealStatus::Processing.as_str().to_string(),
            category: DealCategory::Coin.as_str().to_string(),
            comment: Some(account),
            good_points: None,
            source_deal_id: None,
            registered_at: Utc::now().naive_utc(),
            dealt_at: None,
        };
        let saved: Deal = diesel::insert_into(deals::table)
            .values(&row)
            .get_result(conn)?;
        let coin = adjust_coins(conn, user, -amount)?;
        Ok((saved.id, coin))
    })
    .await?;
    Ok((StatusCode::CREATED, Json(WalletView { deal_id, coin })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_fixture(seller: Uuid) -> Deal {
        Deal {
            id: Uuid::new_v4(),
            buyer_id: None,
            seller_id: seller,
            book_id: Uuid::new_v4().to_string(),
            price: 4000,
            remaining_time: Some(5400),
            condition: None,
            kind: DealKind::Old.as_str().to_string(),
            status: DealStatus::Listing.as_str().to_string(),
            category: DealCategory::Book.as_str().to_string(),
            comment: None,
            good_points: None,
            source_deal_id: None,
            registered_at: Utc::now().naive_utc(),
            dealt_at: None,
        }
    }

    #[test]
    fn an_active_listing_can_be_bought_by_someone_else() {
        let seller = Uuid::new_v4();
        let listing = listing_fixture(seller);
        assert!(ensure_purchasable(&listing, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn sellers_cannot_buy_their_own_listing() {
        let seller = Uuid::new_v4();
        let listing = listing_fixture(seller);
        assert!(ensure_purchasable(&listing, seller).is_err());
    }

    #[test]
    fn a_completed_sale_cannot_be_bought_again() {
        let mut listing = listing_fixture(Uuid::new_v4());
        listing.buyer_id = Some(Uuid::new_v4());
        listing.status = DealStatus::Completed.as_str().to_string();
        assert!(ensure_purchasable(&listing, Uuid::new_v4()).is_err());
    }

    #[test]
    fn only_the_seller_may_withdraw_and_only_while_pending() {
        let seller = Uuid::new_v4();
        let listing = listing_fixture(seller);
        assert!(ensure_withdrawable(&listing, seller).is_ok());
        assert!(ensure_withdrawable(&listing, Uuid::new_v4()).is_err());
        let mut sold = listing_fixture(seller);
        sold.buyer_id = Some(Uuid::new_v4());
        assert!(ensure_withdrawable(&sold, seller).is_err());
    }

    #[test]
    fn rent_and_own_read_their_own_price_points() {
        let now = Utc::now().naive_utc();
        let book = Book {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            author: "a".to_string(),
            publisher: "p".to_string(),
            publisher_id: None,
            match_key: None,
            rent_price: 1500,
            own_price: 9000,
            original_price: None,
            book_pic: None,
            category: None,
            total_time: Some(90),
            published_at: None,
            description: None,
            contents: None,
            isbn: None,
            isbn13: None,
            page_count: None,
            book_type: "NEW".to_string(),
            content_ref: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(price_for(PurchaseType::Rent, &book), 1500);
        assert_eq!(price_for(PurchaseType::Own, &book), 9000);
    }
}
