//! Read side of the used-book marketplace. Every request re-reads the active
//! listings, joins catalog and seller reference data in memory, and shapes
//! the result. Nothing here mutates state, so the whole pipeline below the
//! handlers is plain functions over fetched rows.

use std::collections::{HashMap, HashSet};

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{NaiveDate, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::MaybeUser;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::ids::normalize_loose_id;
use crate::models::{page_window, Book, Deal, DealCategory, DealKind, DealStatus, Paged};
use crate::relations;
use crate::AppState;

/// One active used-book listing, its loose book reference already
/// normalized. Listings whose reference cannot be normalized keep
/// `book_ref: None` and only survive into the flat views.
#[derive(Debug, Clone)]
pub struct ActiveListing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub book_ref: Option<Uuid>,
    pub price: i64,
    pub remaining_time: Option<i64>,
    pub condition: Option<String>,
    pub comment: Option<String>,
    pub good_points: Option<serde_json::Value>,
    pub registered_at: NaiveDateTime,
}

impl From<Deal> for ActiveListing {
    fn from(row: Deal) -> Self {
        let book_ref = normalize_loose_id(&row.book_id);
        ActiveListing {
            id: row.id,
            seller_id: row.seller_id,
            book_ref,
            price: row.price,
            remaining_time: row.remaining_time,
            condition: row.condition,
            comment: row.comment,
            good_points: row.good_points,
            registered_at: row.registered_at,
        }
    }
}

fn passes_book_filter(listing: &ActiveListing, book_filter: Option<&HashSet<Uuid>>) -> bool {
    match book_filter {
        Some(wanted) => listing.book_ref.is_some_and(|book| wanted.contains(&book)),
        None => true,
    }
}

/// An active listing is an unsold OLD book deal still in LISTING state.
/// When `book_filter` is given, only listings resolving to one of those
/// books are kept.
pub(crate) fn load_active_listings(
    conn: &mut PgConnection,
    book_filter: Option<&HashSet<Uuid>>,
) -> Result<Vec<ActiveListing>, ApiError> {
    use crate::schema::deals::dsl::*;
    let rows: Vec<Deal> = deals
        .filter(status.eq(DealStatus::Listing.as_str()))
        .filter(kind.eq(DealKind::Old.as_str()))
        .filter(category.eq(DealCategory::Book.as_str()))
        .filter(buyer_id.is_null())
        .order(registered_at.desc())
        .load(conn)?;
    let listings = rows
        .into_iter()
        .map(ActiveListing::from)
        .filter(|listing| passes_book_filter(listing, book_filter))
        .collect();
    Ok(listings)
}

pub(crate) fn active_count_for_book(conn: &mut PgConnection, book: Uuid) -> Result<i64, ApiError> {
    let mut wanted = HashSet::new();
    wanted.insert(book);
    Ok(load_active_listings(conn, Some(&wanted))?.len() as i64)
}

/// Resolves optional catalog filters (category, title/author search) into
/// the set of candidate book ids, or `None` when no filter applies.
fn candidate_book_ids(
    conn: &mut PgConnection,
    category_filter: Option<&str>,
    search: Option<&str>,
) -> Result<Option<HashSet<Uuid>>, ApiError> {
    if category_filter.is_none() && search.is_none() {
        return Ok(None);
    }
    use crate::schema::books::dsl::*;
    let mut query = books.select(id).into_boxed();
    if let Some(wanted) = category_filter {
        query = query.filter(category.eq(wanted.to_string()));
    }
    if let Some(needle) = search {
        let pattern = format!("%{}%", needle.trim());
        query = query.filter(title.ilike(pattern.clone()).or(author.ilike(pattern)));
    }
    let ids: Vec<Uuid> = query.load(conn)?;
    Ok(Some(ids.into_iter().collect()))
}

async fn load_books_map(pool: &DbPool, book_ids: Vec<Uuid>) -> Result<HashMap<Uuid, Book>, ApiError> {
    if book_ids.is_empty() {
        return Ok(HashMap::new());
    }
    db::run(pool, move |conn| {
        use crate::schema::books::dsl::*;
        let rows: Vec<Book> = books.filter(id.eq_any(book_ids)).load(conn)?;
        Ok(rows.into_iter().map(|book| (book.id, book)).collect())
    })
    .await
}

async fn load_seller_names(
    pool: &DbPool,
    seller_ids: Vec<Uuid>,
) -> Result<HashMap<Uuid, String>, ApiError> {
    if seller_ids.is_empty() {
        return Ok(HashMap::new());
    }
    db::run(pool, move |conn| {
        use crate::schema::users::dsl::*;
        let rows: Vec<(Uuid, String)> = users
            .select((id, nickname))
            .filter(id.eq_any(seller_ids))
            .load(conn)?;
        Ok(rows.into_iter().collect())
    })
    .await
}

fn seller_ids_of(listings: &[ActiveListing]) -> Vec<Uuid> {
    let unique: HashSet<Uuid> = listings.iter().map(|listing| listing.seller_id).collect();
    unique.into_iter().collect()
}

/// Batches the catalog and seller lookups for a page of listings: one query
/// per referenced entity type, both awaited jointly.
async fn load_references(
    pool: &DbPool,
    listings: &[ActiveListing],
) -> Result<(HashMap<Uuid, Book>, HashMap<Uuid, String>), ApiError> {
    let book_ids: Vec<Uuid> = {
        let unique: HashSet<Uuid> = listings.iter().filter_map(|listing| listing.book_ref).collect();
        unique.into_iter().collect()
    };
    let (books, sellers) = tokio::join!(
        load_books_map(pool, book_ids),
        load_seller_names(pool, seller_ids_of(listings)),
    );
    Ok((books?, sellers?))
}

/// Popularity is the all-time count of OLD book deals per title, whatever
/// their current status. Loose references are normalized before counting so
/// legacy rows still contribute.
fn load_popularity(
    conn: &mut PgConnection,
    wanted: &HashSet<Uuid>,
) -> Result<HashMap<Uuid, i64>, ApiError> {
    use crate::schema::deals::dsl::*;
    let refs: Vec<String> = deals
        .filter(kind.eq(DealKind::Old.as_str()))
        .filter(category.eq(DealCategory::Book.as_str()))
        .select(book_id)
        .load(conn)?;
    let mut counts: HashMap<Uuid, i64> = HashMap::new();
    for raw in refs {
        if let Some(book) = normalize_loose_id(&raw) {
            if wanted.contains(&book) {
                *counts.entry(book).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}

fn load_review_counts(
    conn: &mut PgConnection,
    wanted: Vec<Uuid>,
) -> Result<HashMap<Uuid, i64>, ApiError> {
    use crate::schema::reviews::dsl::*;
    let rows: Vec<(Uuid, i64)> = reviews
        .filter(book_id.eq_any(wanted))
        .group_by(book_id)
        .select((book_id, diesel::dsl::count_star()))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

/// Publication dates arrive as free text from several feeds. Anything
/// unparseable sorts as the epoch so it lands at the end of a
/// newest-first ordering.
fn publish_timestamp(raw: Option<&str>) -> i64 {
    let Some(text) = raw else { return 0 };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    if let Ok(at) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return at.timestamp();
    }
    for format in ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|at| at.and_utc().timestamp())
                .unwrap_or(0);
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Popular,
    Recent,
    Review,
    Price,
}

/// One book with at least one active listing, carrying everything the
/// ranking needs.
#[derive(Debug)]
pub struct BookGroup {
    pub book_id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub book_pic: Option<String>,
    pub min_price: i64,
    pub popularity: i64,
    pub review_count: i64,
    pub publish_time: i64,
}

/// Folds listings into one group per referenced book. Listings whose book
/// reference is missing or points at a vanished catalog row contribute to
/// no group.
fn build_groups(
    listings: &[ActiveListing],
    books: &HashMap<Uuid, Book>,
    popularity: &HashMap<Uuid, i64>,
    review_counts: &HashMap<Uuid, i64>,
) -> Vec<BookGroup> {
    let mut min_prices: HashMap<Uuid, i64> = HashMap::new();
    for listing in listings {
        let Some(book_ref) = listing.book_ref else { continue };
        min_prices
            .entry(book_ref)
            .and_modify(|price| *price = (*price).min(listing.price))
            .or_insert(listing.price);
    }
    min_prices
        .into_iter()
        .filter_map(|(book_id, min_price)| {
            let book = books.get(&book_id)?;
            Some(BookGroup {
                book_id,
                title: book.title.clone(),
                author: book.author.clone(),
                publisher: book.publisher.clone(),
                book_pic: book.book_pic.clone(),
                min_price,
                popularity: popularity.get(&book_id).copied().unwrap_or(0),
                review_count: review_counts.get(&book_id).copied().unwrap_or(0),
                publish_time: publish_timestamp(book.published_at.as_deref()),
            })
        })
        .collect()
}

/// Total order over groups: the chosen key first (price ascends, the rest
/// descend), then popularity, then min price, then the book id so equal
/// rows cannot flap between requests.
fn rank_groups(groups: &mut [BookGroup], sort: SortKey) {
    groups.sort_by(|a, b| {
        let primary = match sort {
            SortKey::Popular => b.popularity.cmp(&a.popularity),
            SortKey::Recent => b.publish_time.cmp(&a.publish_time),
            SortKey::Review => b.review_count.cmp(&a.review_count),
            SortKey::Price => a.min_price.cmp(&b.min_price),
        };
        primary
            .then_with(|| b.popularity.cmp(&a.popularity))
            .then_with(|| a.min_price.cmp(&b.min_price))
            .then_with(|| a.book_id.cmp(&b.book_id))
    });
}

/// The whole result set is ranked before the page is cut out of it.
fn page_slice<T>(items: Vec<T>, page: i64, limit: i64) -> Vec<T> {
    let offset = ((page - 1) * limit) as usize;
    items
        .into_iter()
        .skip(offset)
        .take(limit as usize)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupItem {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub book_pic: Option<String>,
    pub min_price: i64,
    pub popularity: i64,
    pub review_count: i64,
}

impl From<BookGroup> for GroupItem {
    fn from(group: BookGroup) -> Self {
        GroupItem {
            id: group.book_id,
            title: group.title,
            author: group.author,
            publisher: group.publisher,
            book_pic: group.book_pic,
            min_price: group.min_price,
            popularity: group.popularity,
            review_count: group.review_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingBookView {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub book_pic: Option<String>,
    pub original_price: Option<i64>,
    pub rent_price: i64,
    pub own_price: i64,
}

fn listing_book_view(book: &Book) -> ListingBookView {
    ListingBookView {
        id: book.id,
        title: book.title.clone(),
        author: book.author.clone(),
        publisher: book.publisher.clone(),
        book_pic: book.book_pic.clone(),
        original_price: book.original_price,
        rent_price: book.rent_price,
        own_price: book.own_price,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OldDealView {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub seller_name: String,
    pub price: i64,
    pub registered_at: NaiveDateTime,
    pub remaining_minutes: i64,
    pub good_points: Vec<String>,
    pub comment: String,
    pub condition: Option<String>,
    pub book: Option<ListingBookView>,
    pub comment_blocked: bool,
}

pub(crate) fn parse_good_points(value: Option<&serde_json::Value>) -> Vec<String> {
    match value.and_then(|v| v.as_array()) {
        Some(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        None => Vec::new(),
    }
}

/// Merges one listing with its resolved references. Remaining reading time
/// prefers the listing's own seconds and falls back to the catalog total;
/// either way the client sees whole minutes, never negative.
fn merge_view(
    listing: &ActiveListing,
    book: Option<&Book>,
    seller_name: Option<&str>,
) -> OldDealView {
    let seconds = listing
        .remaining_time
        .or_else(|| {
            book.and_then(|b| b.total_time)
                .map(|minutes| i64::from(minutes) * 60)
        })
        .unwrap_or(0);
    let remaining_minutes = (seconds / 60).max(0);
    OldDealView {
        id: listing.id,
        seller_id: listing.seller_id,
        seller_name: seller_name.unwrap_or("").to_string(),
        price: listing.price,
        registered_at: listing.registered_at,
        remaining_minutes,
        good_points: parse_good_points(listing.good_points.as_ref()),
        comment: listing.comment.clone().unwrap_or_default(),
        condition: listing.condition.clone(),
        book: book.map(listing_book_view),
        comment_blocked: false,
    }
}

#[derive(Debug, Deserialize)]
pub struct GroupedQuery {
    pub category: Option<String>,
    pub query: Option<String>,
    pub sort: Option<SortKey>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BookListingsResponse {
    pub total: i64,
    pub items: Vec<OldDealView>,
    pub book: Option<ListingBookView>,
}

/// GET /old-deals. Active listings grouped per book and ranked.
pub async fn grouped(
    State(state): State<AppState>,
    Query(params): Query<GroupedQuery>,
) -> Result<Json<Paged<GroupItem>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let sort = params.sort.unwrap_or(SortKey::Popular);

    let category = params.category;
    let search = params.query;
    let listings = db::run(&state.pool, move |conn| {
        let candidates = candidate_book_ids(conn, category.as_deref(), search.as_deref())?;
        load_active_listings(conn, candidates.as_ref())
    })
    .await?;

    let wanted: HashSet<Uuid> = listings.iter().filter_map(|l| l.book_ref).collect();
    if wanted.is_empty() {
        return Ok(Json(Paged {
            total: 0,
            page,
            limit,
            items: Vec::new(),
        }));
    }

    let book_ids: Vec<Uuid> = wanted.iter().copied().collect();
    let review_ids = book_ids.clone();
    let books_fut = load_books_map(&state.pool, book_ids);
    let popularity_fut = {
        let pool = state.pool.clone();
        let wanted = wanted.clone();
        async move { db::run(&pool, move |conn| load_popularity(conn, &wanted)).await }
    };
    let reviews_fut = {
        let pool = state.pool.clone();
        async move { db::run(&pool, move |conn| load_review_counts(conn, review_ids)).await }
    };
    let (books, popularity, review_counts) = tokio::join!(books_fut, popularity_fut, reviews_fut);
    let (books, popularity, review_counts) = (books?, popularity?, review_counts?);

    let mut groups = build_groups(&listings, &books, &popularity, &review_counts);
    rank_groups(&mut groups, sort);
    let total = groups.len() as i64;
    let items = page_slice(groups, page, limit)
        .into_iter()
        .map(GroupItem::from)
        .collect();
    Ok(Json(Paged {
        total,
        page,
        limit,
        items,
    }))
}

/// GET /old-deals/recent. Flat newest-first listings; a vanished book
/// reference shows up as `book: null` here instead of hiding the listing.
pub async fn recent(
    State(state): State<AppState>,
    Query(params): Query<PageQuery>,
) -> Result<Json<Paged<OldDealView>>, ApiError> {
    let (page, limit) = page_window(params.page, params.limit);
    let listings = db::run(&state.pool, move |conn| load_active_listings(conn, None)).await?;
    let total = listings.len() as i64;
    let page_rows = page_slice(listings, page, limit);
    let (books, sellers) = load_references(&state.pool, &page_rows).await?;
    let items = page_rows
        .iter()
        .map(|listing| {
            let book = listing.book_ref.and_then(|id| books.get(&id));
            merge_view(listing, book, sellers.get(&listing.seller_id).map(String::as_str))
        })
        .collect();
    Ok(Json(Paged {
        total,
        page,
        limit,
        items,
    }))
}

/// GET /old-deals/books/:book_id. Listings for one book, annotated with the
/// viewer's block flags when a token is present. A missing catalog row is
/// `book: null`, not an error.
pub async fn by_book(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    MaybeUser(viewer): MaybeUser,
    Query(params): Query<PageQuery>,
) -> Result<Json<BookListingsResponse>, ApiError> {
    let target = Uuid::parse_str(book_id.trim())
        .map_err(|_| ApiError::Validation("invalid book id".to_string()))?;
    let (page, limit) = page_window(params.page, params.limit);

    let listings_fut = {
        let pool = state.pool.clone();
        async move {
            db::run(&pool, move |conn| {
                let mut wanted = HashSet::new();
                wanted.insert(target);
                load_active_listings(conn, Some(&wanted))
            })
            .await
        }
    };
    let book_fut = {
        let pool = state.pool.clone();
        async move {
            db::run(&pool, move |conn| {
                use crate::schema::books::dsl::*;
                books
                    .find(target)
                    .first::<Book>(conn)
                    .optional()
                    .map_err(Into::into)
            })
            .await
        }
    };
    let (listings, book) = tokio::join!(listings_fut, book_fut);
    let (listings, book) = (listings?, book?);

    let total = listings.len() as i64;
    let page_rows = page_slice(listings, page, limit);
    let sellers = load_seller_names(&state.pool, seller_ids_of(&page_rows)).await?;

    let items: Vec<OldDealView> = page_rows
        .iter()
        .map(|listing| {
            merge_view(
                listing,
                book.as_ref(),
                sellers.get(&listing.seller_id).map(String::as_str),
            )
        })
        .collect();
    let items = relations::annotate_blocked(&state.pool, viewer, items).await;

    Ok(Json(BookListingsResponse {
        total,
        items,
        book: book.as_ref().map(listing_book_view),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;

    fn ts(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }

    fn book_fixture(id: Uuid, title: &str, published_at: Option<&str>) -> Book {
        Book {
            id,
            title: title.to_string(),
            author: "Author".to_string(),
            publisher: "Publisher".to_string(),
            publisher_id: None,
            match_key: None,
            rent_price: 900,
            own_price: 9000,
            original_price: Some(12000),
            book_pic: None,
            category: Some("novel".to_string()),
            total_time: Some(300),
            published_at: published_at.map(str::to_string),
            description: None,
            contents: None,
            isbn: None,
            isbn13: None,
            page_count: None,
            book_type: "NEW".to_string(),
            content_ref: None,
            created_at: ts(0),
            updated_at: ts(0),
        }
    }

    fn listing_fixture(book: Option<Uuid>, price: i64, seller: Uuid) -> ActiveListing {
        ActiveListing {
            id: Uuid::new_v4(),
            seller_id: seller,
            book_ref: book,
            price,
            remaining_time: None,
            condition: None,
            comment: None,
            good_points: None,
            registered_at: ts(1_700_000_000),
        }
    }

    fn ranked_ids(
        listings: &[ActiveListing],
        books: &HashMap<Uuid, Book>,
        popularity: &HashMap<Uuid, i64>,
        reviews: &HashMap<Uuid, i64>,
        sort: SortKey,
    ) -> Vec<Uuid> {
        let mut groups = build_groups(listings, books, popularity, reviews);
        rank_groups(&mut groups, sort);
        groups.into_iter().map(|g| g.book_id).collect()
    }

    // ---- filtering ----

    #[test]
    fn book_filter_keeps_only_listings_resolving_to_a_wanted_book() {
        let wanted_book = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let wanted: HashSet<Uuid> = [wanted_book].into();
        let matching = listing_fixture(Some(wanted_book), 4000, seller);
        let other = listing_fixture(Some(Uuid::new_v4()), 4000, seller);
        let unresolved = listing_fixture(None, 4000, seller);
        assert!(passes_book_filter(&matching, Some(&wanted)));
        assert!(!passes_book_filter(&other, Some(&wanted)));
        assert!(!passes_book_filter(&unresolved, Some(&wanted)));
        assert!(passes_book_filter(&unresolved, None));
    }

    // ---- grouping ----

    #[test]
    fn groups_cover_exactly_the_books_with_listings() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (a, book_fixture(a, "A", None)),
            (b, book_fixture(b, "B", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(a), 5000, seller),
            listing_fixture(Some(a), 7000, seller),
            listing_fixture(Some(b), 3000, seller),
            listing_fixture(None, 1000, seller), // unresolvable reference
        ];
        let groups = build_groups(&listings, &books, &HashMap::new(), &HashMap::new());
        let ids: HashSet<Uuid> = groups.iter().map(|g| g.book_id).collect();
        assert_eq!(ids, [a, b].into());
    }

    #[test]
    fn min_price_is_the_group_minimum() {
        let a = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [(a, book_fixture(a, "A", None))].into();
        let listings = vec![
            listing_fixture(Some(a), 8000, seller),
            listing_fixture(Some(a), 4500, seller),
            listing_fixture(Some(a), 9900, seller),
        ];
        let groups = build_groups(&listings, &books, &HashMap::new(), &HashMap::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].min_price, 4500);
    }

    #[test]
    fn vanished_catalog_rows_drop_their_group() {
        let known = Uuid::new_v4();
        let vanished = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [(known, book_fixture(known, "K", None))].into();
        let listings = vec![
            listing_fixture(Some(known), 5000, seller),
            listing_fixture(Some(vanished), 2000, seller),
        ];
        let groups = build_groups(&listings, &books, &HashMap::new(), &HashMap::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].book_id, known);
    }

    // ---- ranking ----

    #[test]
    fn equal_popularity_breaks_the_tie_on_min_price() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (a, book_fixture(a, "A", None)),
            (b, book_fixture(b, "B", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(a), 8000, seller),
            listing_fixture(Some(b), 5000, seller),
        ];
        let popularity: HashMap<Uuid, i64> = [(a, 3), (b, 3)].into();
        let order = ranked_ids(&listings, &books, &popularity, &HashMap::new(), SortKey::Popular);
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn popular_sort_descends() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (a, book_fixture(a, "A", None)),
            (b, book_fixture(b, "B", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(a), 1000, seller),
            listing_fixture(Some(b), 9000, seller),
        ];
        let popularity: HashMap<Uuid, i64> = [(a, 1), (b, 8)].into();
        let order = ranked_ids(&listings, &books, &popularity, &HashMap::new(), SortKey::Popular);
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn price_sort_ascends() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (a, book_fixture(a, "A", None)),
            (b, book_fixture(b, "B", None)),
            (c, book_fixture(c, "C", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(a), 7000, seller),
            listing_fixture(Some(b), 2000, seller),
            listing_fixture(Some(c), 4000, seller),
        ];
        let order = ranked_ids(&listings, &books, &HashMap::new(), &HashMap::new(), SortKey::Price);
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn review_sort_descends() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (a, book_fixture(a, "A", None)),
            (b, book_fixture(b, "B", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(a), 1000, seller),
            listing_fixture(Some(b), 1000, seller),
        ];
        let reviews: HashMap<Uuid, i64> = [(a, 2), (b, 11)].into();
        let order = ranked_ids(&listings, &books, &HashMap::new(), &reviews, SortKey::Review);
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn recent_sort_puts_undated_books_last() {
        let dated = Uuid::new_v4();
        let undated = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = [
            (dated, book_fixture(dated, "Dated", Some("2024-01-10"))),
            (undated, book_fixture(undated, "Undated", None)),
        ]
        .into();
        let listings = vec![
            listing_fixture(Some(undated), 1000, seller),
            listing_fixture(Some(dated), 1000, seller),
        ];
        let order = ranked_ids(&listings, &books, &HashMap::new(), &HashMap::new(), SortKey::Recent);
        assert_eq!(order, vec![dated, undated]);
    }

    #[test]
    fn fully_tied_groups_order_by_book_id() {
        let mut ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let seller = Uuid::new_v4();
        let books: HashMap<Uuid, Book> = ids
            .iter()
            .map(|id| (*id, book_fixture(*id, "Same", None)))
            .collect();
        let listings: Vec<ActiveListing> = ids
            .iter()
            .map(|id| listing_fixture(Some(*id), 5000, seller))
            .collect();
        let order = ranked_ids(&listings, &books, &HashMap::new(), &HashMap::new(), SortKey::Popular);
        ids.sort();
        assert_eq!(order, ids.to_vec());
    }

    // ---- paging ----

    #[test]
    fn page_slice_cuts_after_ranking() {
        let items: Vec<i32> = (1..=7).collect();
        assert_eq!(page_slice(items.clone(), 1, 3), vec![1, 2, 3]);
        assert_eq!(page_slice(items.clone(), 2, 3), vec![4, 5, 6]);
        assert_eq!(page_slice(items.clone(), 3, 3), vec![7]);
        assert_eq!(page_slice(items, 4, 3), Vec::<i32>::new());
    }

    #[test]
    fn page_slice_survives_the_largest_page() {
        let (page, limit) = page_window(Some(i64::MAX), Some(50));
        assert_eq!(page_slice(vec![1, 2, 3], page, limit), Vec::<i32>::new());
    }

    // ---- merging ----

    #[test]
    fn merge_prefers_the_listing_remaining_time() {
        let a = Uuid::new_v4();
        let book = book_fixture(a, "A", None);
        let mut listing = listing_fixture(Some(a), 5000, Uuid::new_v4());
        listing.remaining_time = Some(7200);
        let view = merge_view(&listing, Some(&book), Some("seller"));
        assert_eq!(view.remaining_minutes, 120);
    }

    #[test]
    fn merge_falls_back_to_catalog_total_time() {
        let a = Uuid::new_v4();
        let book = book_fixture(a, "A", None); // total_time 300 minutes
        let listing = listing_fixture(Some(a), 5000, Uuid::new_v4());
        let view = merge_view(&listing, Some(&book), None);
        assert_eq!(view.remaining_minutes, 300);
    }

    #[test]
    fn merge_clamps_negative_remaining_time() {
        let mut listing = listing_fixture(None, 5000, Uuid::new_v4());
        listing.remaining_time = Some(-90);
        let view = merge_view(&listing, None, None);
        assert_eq!(view.remaining_minutes, 0);
    }

    #[test]
    fn merge_defaults_missing_text_fields() {
        let listing = listing_fixture(None, 5000, Uuid::new_v4());
        let view = merge_view(&listing, None, None);
        assert_eq!(view.comment, "");
        assert!(view.good_points.is_empty());
        assert_eq!(view.seller_name, "");
        assert!(view.book.is_none());
        assert!(!view.comment_blocked);
    }

    #[test]
    fn merge_keeps_well_formed_good_points_only() {
        let mut listing = listing_fixture(None, 5000, Uuid::new_v4());
        listing.good_points = Some(json!(["Clean pages", 7, "Signed copy"]));
        let view = merge_view(&listing, None, None);
        assert_eq!(view.good_points, vec!["Clean pages", "Signed copy"]);

        listing.good_points = Some(json!("not an array"));
        let view = merge_view(&listing, None, None);
        assert!(view.good_points.is_empty());
    }

    // ---- publish dates ----

    #[test]
    fn publish_timestamp_reads_common_feed_formats() {
        let iso = publish_timestamp(Some("2024-01-10"));
        assert!(iso > 0);
        assert_eq!(publish_timestamp(Some("2024.01.10")), iso);
        assert_eq!(publish_timestamp(Some("2024/01/10")), iso);
        assert_eq!(publish_timestamp(Some("20240110")), iso);
        assert_eq!(publish_timestamp(Some(" 2024-01-10 ")), iso);
    }

    #[test]
    fn publish_timestamp_treats_junk_as_epoch() {
        assert_eq!(publish_timestamp(None), 0);
        assert_eq!(publish_timestamp(Some("")), 0);
        assert_eq!(publish_timestamp(Some("unknown")), 0);
        assert_eq!(publish_timestamp(Some("10th of January")), 0);
    }
}
