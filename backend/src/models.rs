use std::fmt;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::schema::{
    books, complaints, deals, device_tokens, hearts, notices, notifications, relations, reviews,
    user_books, users,
};

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub nickname: String,
    pub coin: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub nickname: String,
    pub coin: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = crate::schema::publishers)]
pub struct Publisher {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub api_key: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = device_tokens)]
pub struct DeviceToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = device_tokens)]
pub struct NewDeviceToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = books)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub publisher_id: Option<Uuid>,
    pub match_key: Option<String>,
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
    pub book_type: String,
    pub content_ref: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = books)]
pub struct NewBook {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub publisher_id: Option<Uuid>,
    pub match_key: Option<String>,
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
    pub book_type: String,
    pub content_ref: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One money or book movement. `seller_id` is the account that owns the
/// record; for two-party used sales it is the listing seller, and the buyer
/// is attached when the sale completes. `book_id` is kept as free text
/// because rows imported from the previous datastore carry wrapped ids.
#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = deals)]
pub struct Deal {
    pub id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Uuid,
    pub book_id: String,
    pub price: i64,
    pub remaining_time: Option<i64>,
    pub condition: Option<String>,
    pub kind: String,
    pub status: String,
    pub category: String,
    pub comment: Option<String>,
    pub good_points: Option<JsonValue>,
    pub source_deal_id: Option<Uuid>,
    pub registered_at: NaiveDateTime,
    pub dealt_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = deals)]
pub struct NewDeal {
    pub id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Uuid,
    pub book_id: String,
    pub price: i64,
    pub remaining_time: Option<i64>,
    pub condition: Option<String>,
    pub kind: String,
    pub status: String,
    pub category: String,
    pub comment: Option<String>,
    pub good_points: Option<JsonValue>,
    pub source_deal_id: Option<Uuid>,
    pub registered_at: NaiveDateTime,
    pub dealt_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = user_books)]
pub struct UserBook {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: String,
    pub status: String,
    pub remaining_time: Option<i64>,
    pub source_deal_id: Option<Uuid>,
    pub sale_price: Option<i64>,
    pub sale_date: Option<NaiveDateTime>,
    pub sale_buyer_id: Option<Uuid>,
    pub sale_seller_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = user_books)]
pub struct NewUserBook {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: String,
    pub status: String,
    pub remaining_time: Option<i64>,
    pub source_deal_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = notices)]
pub struct Notice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Option<Uuid>,
    pub title: String,
    pub author: String,
    pub publisher: Option<String>,
    pub match_key: String,
    pub notice: bool,
    pub notice_type: String,
    pub noticed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = notices)]
pub struct NewNotice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Option<Uuid>,
    pub title: String,
    pub author: String,
    pub publisher: Option<String>,
    pub match_key: String,
    pub notice: bool,
    pub notice_type: String,
    pub noticed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = hearts)]
pub struct Heart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = hearts)]
pub struct NewHeart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub read: bool,
    pub book_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub image: Option<String>,
    pub price: Option<i64>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub read: bool,
    pub book_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub image: Option<String>,
    pub price: Option<i64>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = relations)]
pub struct Relation {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub target_id: Uuid,
    pub kind: String,
    pub note: Option<String>,
    pub context_ref: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = relations)]
pub struct NewRelation {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub target_id: Uuid,
    pub kind: String,
    pub note: Option<String>,
    pub context_ref: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = reviews)]
pub struct Review {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Uuid,
    pub deal_id: Option<Uuid>,
    pub rating: i16,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = reviews)]
pub struct NewReview {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book_id: Uuid,
    pub deal_id: Option<Uuid>,
    pub rating: i16,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = complaints)]
pub struct Complaint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: String,
    pub content: String,
    pub deal_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Clone)]
#[diesel(table_name = complaints)]
pub struct NewComplaint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: String,
    pub content: String,
    pub deal_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealKind {
    Charge,
    ToCash,
    New,
    Old,
    NewRefund,
}

impl DealKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealKind::Charge => "CHARGE",
            DealKind::ToCash => "TOCASH",
            DealKind::New => "NEW",
            DealKind::Old => "OLD",
            DealKind::NewRefund => "NEWREFUND",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CHARGE" => Some(DealKind::Charge),
            "TOCASH" => Some(DealKind::ToCash),
            "NEW" => Some(DealKind::New),
            "OLD" => Some(DealKind::Old),
            "NEWREFUND" => Some(DealKind::NewRefund),
            _ => None,
        }
    }
}

impl fmt::Display for DealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    Listing,
    Completed,
    Cancelled,
    Processing,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Listing => "LISTING",
            DealStatus::Completed => "COMPLETED",
            DealStatus::Cancelled => "CANCELLED",
            DealStatus::Processing => "PROCESSING",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealCategory {
    Book,
    Coin,
}

impl DealCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealCategory::Book => "BOOK",
            DealCategory::Coin => "COIN",
        }
    }
}

impl fmt::Display for DealCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog flag on a book: `NEW` entries are sold first-hand by their
/// publisher, `OLD` entries only circulate as used stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookType {
    New,
    Old,
}

impl BookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookType::New => "NEW",
            BookType::Old => "OLD",
        }
    }
}

/// Lifecycle of one copy on a user's shelf. `Sellable` copies are owned
/// outright, `Unsellable` ones are rentals, `Expired` rentals ran out of
/// time, `Selling` means an active listing currently references the copy.
/// `OnSale` is a legacy spelling of `Selling` still present in imported
/// rows; readers treat the two alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserBookStatus {
    Sellable,
    Unsellable,
    Expired,
    Selling,
    OnSale,
    Sold,
    Refunded,
}

impl UserBookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserBookStatus::Sellable => "SELLABLE",
            UserBookStatus::Unsellable => "UNSELLABLE",
            UserBookStatus::Expired => "EXPIRED",
            UserBookStatus::Selling => "SELLING",
            UserBookStatus::OnSale => "ONSALE",
            UserBookStatus::Sold => "SOLD",
            UserBookStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SELLABLE" => Some(UserBookStatus::Sellable),
            "UNSELLABLE" => Some(UserBookStatus::Unsellable),
            "EXPIRED" => Some(UserBookStatus::Expired),
            "SELLING" => Some(UserBookStatus::Selling),
            "ONSALE" => Some(UserBookStatus::OnSale),
            "SOLD" => Some(UserBookStatus::Sold),
            "REFUNDED" => Some(UserBookStatus::Refunded),
            _ => None,
        }
    }

    /// True for rows an active listing currently references, in either the
    /// modern or the imported spelling.
    pub fn is_listed(value: &str) -> bool {
        matches!(
            Self::parse(value),
            Some(UserBookStatus::Selling) | Some(UserBookStatus::OnSale)
        )
    }
}

impl fmt::Display for UserBookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NoticeType {
    Any,
    New,
    Old,
}

impl NoticeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeType::Any => "ANY",
            NoticeType::New => "NEW",
            NoticeType::Old => "OLD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ANY" => Some(NoticeType::Any),
            "NEW" => Some(NoticeType::New),
            "OLD" => Some(NoticeType::Old),
            _ => None,
        }
    }
}

impl fmt::Display for NoticeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewListed,
    OldListed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewListed => "NEW_LISTED",
            NotificationKind::OldListed => "OLD_LISTED",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Block,
    Report,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Block => "BLOCK",
            RelationKind::Report => "REPORT",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes request paging to a sane window: pages start at 1 and the
/// page size is clamped to 1..=50 with a default of 20. The page cap keeps
/// `(page - 1) * limit` inside an `i64` at the widest page size.
pub fn page_window(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    const MAX_PAGE: i64 = i64::MAX / 50;
    let page = page.unwrap_or(1).clamp(1, MAX_PAGE);
    let limit = limit.unwrap_or(20).clamp(1, 50);
    (page, limit)
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_window_defaults() {
        assert_eq!(page_window(None, None), (1, 20));
    }

    #[test]
    fn page_window_clamps_limit() {
        assert_eq!(page_window(Some(2), Some(0)), (2, 1));
        assert_eq!(page_window(Some(2), Some(-5)), (2, 1));
        assert_eq!(page_window(Some(2), Some(999)), (2, 50));
    }

    #[test]
    fn page_window_floors_page() {
        assert_eq!(page_window(Some(0), Some(10)), (1, 10));
        assert_eq!(page_window(Some(-3), Some(10)), (1, 10));
    }

    #[test]
    fn page_window_caps_runaway_pages() {
        let (page, limit) = page_window(Some(i64::MAX), Some(50));
        let offset = (page - 1) * limit;
        assert!(offset >= 0);
        assert_eq!(limit, 50);
    }

    #[test]
    fn deal_kind_round_trips() {
        for kind in [
            DealKind::Charge,
            DealKind::ToCash,
            DealKind::New,
            DealKind::Old,
            DealKind::NewRefund,
        ] {
            assert_eq!(DealKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DealKind::parse("RENT"), None);
    }

    #[test]
    fn notice_type_accepts_uppercase_json() {
        let parsed: NoticeType = serde_json::from_str("\"ANY\"").unwrap();
        assert_eq!(parsed, NoticeType::Any);
        assert!(serde_json::from_str::<NoticeType>("\"any\"").is_err());
    }
}
