//! Directed user-to-user edges: blocks and reports. Also home of the block
//! annotator the listing views run through, since the flags are a property
//! of the viewer's edges, not of the listings.

use std::collections::HashSet;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use diesel::prelude::*;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::models::{NewRelation, Relation, RelationKind};
use crate::old_deals::OldDealView;
use crate::AppState;

pub async fn is_blocked(pool: &DbPool, viewer: Uuid, seller: Uuid) -> Result<bool, ApiError> {
    db::run(pool, move |conn| {
        use crate::schema::relations::dsl::*;
        let found = relations
            .filter(owner_id.eq(viewer))
            .filter(target_id.eq(seller))
            .filter(kind.eq(RelationKind::Block.as_str()))
            .select(id)
            .first::<Uuid>(conn)
            .optional()?;
        Ok(found.is_some())
    })
    .await
}

pub fn apply_block_flags(views: &mut [OldDealView], blocked: &HashSet<Uuid>) {
    for view in views {
        view.comment_blocked = blocked.contains(&view.seller_id);
    }
}

/// Marks each view whose seller the viewer has blocked. Anonymous viewers
/// and empty pages skip the lookups entirely. One lookup per distinct
/// seller, all in flight at once; a failed lookup downgrades to
/// "not blocked" because the flag is advisory.
pub async fn annotate_blocked(
    pool: &DbPool,
    viewer: Option<Uuid>,
    mut views: Vec<OldDealView>,
) -> Vec<OldDealView> {
    let Some(viewer) = viewer else { return views };
    if views.is_empty() {
        return views;
    }
    let sellers: Vec<Uuid> = views
        .iter()
        .map(|view| view.seller_id)
        .collect::<HashSet<Uuid>>()
        .into_iter()
        .collect();
    let lookups = sellers.into_iter().map(|seller| {
        let pool = pool.clone();
        async move {
            match is_blocked(&pool, viewer, seller).await {
                Ok(blocked) => (seller, blocked),
                Err(err) => {
                    log::warn!("block lookup for seller {seller} failed: {err}");
                    (seller, false)
                }
            }
        }
    });
    let blocked: HashSet<Uuid> = join_all(lookups)
        .await
        .into_iter()
        .filter(|(_, blocked)| *blocked)
        .map(|(seller, _)| seller)
        .collect();
    apply_block_flags(&mut views, &blocked);
    views
}

pub(crate) fn validate_block_target(owner: Uuid, target: Uuid) -> Result<(), ApiError> {
    if owner == target {
        return Err(ApiError::Validation("cannot block yourself".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub target_id: Uuid,
    pub note: Option<String>,
}

fn require_fresh_block(row: Option<Relation>) -> Result<Relation, ApiError> {
    row.ok_or_else(|| ApiError::Conflict("already blocked".to_string()))
}

/// POST /relations/blocks. The insert rides on the partial unique block
/// index, so a concurrent duplicate is swallowed there and surfaces as the
/// same conflict answer.
pub async fn create_block(
    State(state): State<AppState>,
    Extension(AuthUser(owner)): Extension<AuthUser>,
    Json(request): Json<BlockRequest>,
) -> Result<Json<Relation>, ApiError> {
    validate_block_target(owner, request.target_id)?;
    let created = db::run(&state.pool, move |conn| {
        use crate::schema::relations::dsl as rel;
        let row = NewRelation {
            id: Uuid::new_v4(),
            owner_id: owner,
            target_id: request.target_id,
            kind: RelationKind::Block.as_str().to_string(),
            note: request.note,
            context_ref: None,
            created_at: Utc::now().naive_utc(),
        };
        let inserted = diesel::insert_into(rel::relations)
            .values(&row)
            .on_conflict((rel::owner_id, rel::target_id))
            .filter_target(rel::kind.eq(RelationKind::Block.as_str()))
            .do_nothing()
            .get_result::<Relation>(conn)
            .optional()?;
        require_fresh_block(inserted)
    })
    .await?;
    Ok(Json(created))
}

/// DELETE /relations/blocks/:target_id
pub async fn delete_block(
    State(state): State<AppState>,
    Extension(AuthUser(owner)): Extension<AuthUser>,
    Path(target): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = db::run(&state.pool, move |conn| {
        use crate::schema::relations::dsl::*;
        diesel::delete(
            relations
                .filter(owner_id.eq(owner))
                .filter(target_id.eq(target))
                .filter(kind.eq(RelationKind::Block.as_str())),
        )
        .execute(conn)
        .map_err(Into::into)
    })
    .await?;
    if removed == 0 {
        return Err(ApiError::NotFound("block not found".to_string()));
    }
    Ok(Json(json!({ "status": "unblocked" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub target_id: Uuid,
    pub note: Option<String>,
    pub context_ref: Option<String>,
}

/// POST /relations/reports. One report per reporter and context; without a
/// context, one per reporter and target.
pub async fn create_report(
    State(state): State<AppState>,
    Extension(AuthUser(owner)): Extension<AuthUser>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<Relation>, ApiError> {
    if owner == request.target_id {
        return Err(ApiError::Validation("cannot report yourself".to_string()));
    }
    let created = db::run(&state.pool, move |conn| {
        use crate::schema::relations::dsl::*;
        let mut existing = relations
            .filter(owner_id.eq(owner))
            .filter(kind.eq(RelationKind::Report.as_str()))
            .select(id)
            .into_boxed();
        existing = match &request.context_ref {
            Some(context) => existing.filter(context_ref.eq(context.clone())),
            None => existing.filter(target_id.eq(request.target_id)),
        };
        if existing.first::<Uuid>(conn).optional()?.is_some() {
            return Err(ApiError::Conflict("already reported".to_string()));
        }
        let row = NewRelation {
            id: Uuid::new_v4(),
            owner_id: owner,
            target_id: request.target_id,
            kind: RelationKind::Report.as_str().to_string(),
            note: request.note,
            context_ref: request.context_ref,
            created_at: Utc::now().naive_utc(),
        };
        diesel::insert_into(relations)
            .values(&row)
            .get_result::<Relation>(conn)
            .map_err(Into::into)
    })
    .await?;
    Ok(Json(created))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use diesel::pg::PgConnection;

    fn view(seller: Uuid) -> OldDealView {
        OldDealView {
            id: Uuid::new_v4(),
            seller_id: seller,
            seller_name: "seller".to_string(),
            price: 5000,
            registered_at: DateTime::from_timestamp(0, 0).unwrap().naive_utc(),
            remaining_minutes: 0,
            good_points: Vec::new(),
            comment: "fine copy".to_string(),
            condition: None,
            book: None,
            comment_blocked: false,
        }
    }

    #[test]
    fn flags_only_views_from_blocked_sellers() {
        let blocked_seller = Uuid::new_v4();
        let other_seller = Uuid::new_v4();
        let mut views = vec![view(blocked_seller), view(other_seller), view(blocked_seller)];
        let blocked: HashSet<Uuid> = [blocked_seller].into();
        apply_block_flags(&mut views, &blocked);
        assert!(views[0].comment_blocked);
        assert!(!views[1].comment_blocked);
        assert!(views[2].comment_blocked);
    }

    #[test]
    fn empty_block_set_leaves_views_untouched() {
        let mut views = vec![view(Uuid::new_v4())];
        apply_block_flags(&mut views, &HashSet::new());
        assert!(!views[0].comment_blocked);
    }

    #[test]
    fn self_block_is_rejected() {
        let me = Uuid::new_v4();
        assert!(validate_block_target(me, me).is_err());
        assert!(validate_block_target(me, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn a_swallowed_duplicate_block_reads_as_conflict() {
        let fresh = Relation {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            kind: RelationKind::Block.as_str().to_string(),
            note: None,
            context_ref: None,
            created_at: DateTime::from_timestamp(0, 0).unwrap().naive_utc(),
        };
        assert!(require_fresh_block(Some(fresh)).is_ok());
        assert!(matches!(
            require_fresh_block(None),
            Err(ApiError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_viewers_skip_the_lookup_entirely() {
        // build_unchecked never opens a connection, so this only passes if
        // the anonymous path returns before touching the pool
        let manager =
            diesel::r2d2::ConnectionManager::<PgConnection>::new("postgres://unused/unused");
        let pool = diesel::r2d2::Pool::builder()
            .max_size(1)
            .build_unchecked(manager);
        let views = annotate_blocked(&pool, None, vec![view(Uuid::new_v4())]).await;
        assert_eq!(views.len(), 1);
        assert!(!views[0].comment_blocked);
    }
}
