use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::audit::current_unix_secs;
use crate::config::config;
use crate::db::with_db;
use crate::http::{
    RequestContext, parse_json_body, path_segments, respond_empty, respond_error,
    respond_internal_error, respond_json,
};
use crate::session::{require_admin, verify_access_token};
use crate::users;

pub(crate) const DEFAULT_DELAY_MS: i64 = 7_000;
pub(crate) const DEFAULT_CAROUSEL_TYPE: &str = "main";

const IMAGE_COLUMNS: &str = "id, image_url, title, subtitle, delay, display_order, is_active, carousel_type, created_at, updated_at";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CarouselImage {
    pub id: i64,
    pub image_url: String,
    pub title: String,
    pub subtitle: String,
    pub delay: i64,
    pub display_order: i64,
    pub is_active: bool,
    #[serde(rename = "carousel_type")]
    pub carousel_type: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CarouselImage {
    fn from_row(row: &SqliteRow) -> Self {
        CarouselImage {
            id: row.get("id"),
            image_url: row.get("image_url"),
            title: row.get("title"),
            subtitle: row.get("subtitle"),
            delay: row.get("delay"),
            display_order: row.get("display_order"),
            is_active: row.get::<i64, _>("is_active") != 0,
            carousel_type: row.get("carousel_type"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Create and update body; absent fields keep their current value on update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CarouselPatch {
    #[serde(alias = "image_url")]
    pub image_url: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub delay: Option<i64>,
    #[serde(alias = "carousel_type", alias = "type")]
    pub carousel_type: Option<String>,
    #[serde(alias = "is_active")]
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    new_order: Option<i64>,
}

fn normalize_delay(delay: Option<i64>) -> i64 {
    delay.filter(|d| *d > 0).unwrap_or(DEFAULT_DELAY_MS)
}

fn normalize_type(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CAROUSEL_TYPE)
        .to_string()
}

pub(crate) async fn list_images(
    pool: &SqlitePool,
    carousel_type: Option<&str>,
    include_inactive: bool,
) -> Result<Vec<CarouselImage>, sqlx::Error> {
    let sql = format!(
        "SELECT {IMAGE_COLUMNS} FROM carousel_images WHERE (? OR is_active = 1) AND (? IS NULL OR carousel_type = ?) ORDER BY display_order ASC, id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(include_inactive)
        .bind(carousel_type)
        .bind(carousel_type)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(CarouselImage::from_row).collect())
}

pub(crate) async fn get_image(pool: &SqlitePool, id: i64) -> Result<Option<CarouselImage>, sqlx::Error> {
    let sql = format!("SELECT {IMAGE_COLUMNS} FROM carousel_images WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(CarouselImage::from_row))
}

/// Appends after the current last position.
pub(crate) async fn create_image(
    pool: &SqlitePool,
    image_url: &str,
    patch: &CarouselPatch,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let max_order: Option<i64> = sqlx::query_scalar("SELECT MAX(display_order) FROM carousel_images")
        .fetch_one(&mut *tx)
        .await?;
    let res = sqlx::query(
        "INSERT INTO carousel_images (image_url, title, subtitle, delay, display_order, is_active, carousel_type, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(image_url)
    .bind(patch.title.as_deref().unwrap_or_default())
    .bind(patch.subtitle.as_deref().unwrap_or_default())
    .bind(normalize_delay(patch.delay))
    .bind(max_order.unwrap_or(0) + 1)
    .bind(patch.is_active.unwrap_or(true) as i64)
    .bind(normalize_type(patch.carousel_type.as_deref()))
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.last_insert_rowid())
}

pub(crate) async fn update_image(
    pool: &SqlitePool,
    id: i64,
    patch: &CarouselPatch,
    now: i64,
) -> Result<Option<CarouselImage>, sqlx::Error> {
    let Some(current) = get_image(pool, id).await? else {
        return Ok(None);
    };
    let image_url = patch
        .image_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&current.image_url)
        .to_string();
    let carousel_type = match patch.carousel_type.as_deref() {
        Some(value) => normalize_type(Some(value)),
        None => current.carousel_type.clone(),
    };
    let delay = match patch.delay {
        Some(value) => normalize_delay(Some(value)),
        None => current.delay,
    };

    sqlx::query(
        "UPDATE carousel_images SET image_url = ?, title = ?, subtitle = ?, delay = ?, carousel_type = ?, is_active = ?, updated_at = ? WHERE id = ?",
    )
    .bind(image_url)
    .bind(patch.title.clone().unwrap_or(current.title))
    .bind(patch.subtitle.clone().unwrap_or(current.subtitle))
    .bind(delay)
    .bind(carousel_type)
    .bind(patch.is_active.unwrap_or(current.is_active) as i64)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    get_image(pool, id).await
}

/// Deletes and closes the gap it leaves. `false` when the id is unknown.
pub(crate) async fn delete_image(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let order: Option<i64> = sqlx::query_scalar("SELECT display_order FROM carousel_images WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(order) = order else {
        tx.rollback().await?;
        return Ok(false);
    };

    sqlx::query("DELETE FROM carousel_images WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE carousel_images SET display_order = display_order - 1 WHERE display_order > ?")
        .bind(order)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

/// Moves an image to `new_order` (clamped to `1..=count`), shifting the
/// images in between. Returns the final position.
pub(crate) async fn reorder_image(
    pool: &SqlitePool,
    id: i64,
    new_order: i64,
    now: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let current: Option<i64> = sqlx::query_scalar("SELECT display_order FROM carousel_images WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(current) = current else {
        tx.rollback().await?;
        return Ok(None);
    };
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM carousel_images")
        .fetch_one(&mut *tx)
        .await?;
    let target = new_order.clamp(1, count.max(1));

    if target > current {
        sqlx::query(
            "UPDATE carousel_images SET display_order = display_order - 1 WHERE display_order > ? AND display_order <= ?",
        )
        .bind(current)
        .bind(target)
        .execute(&mut *tx)
        .await?;
    } else if target < current {
        sqlx::query(
            "UPDATE carousel_images SET display_order = display_order + 1 WHERE display_order >= ? AND display_order < ?",
        )
        .bind(target)
        .bind(current)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE carousel_images SET display_order = ?, updated_at = ? WHERE id = ?")
        .bind(target)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(target))
}

pub(crate) fn handle_carousel_api(ctx: &RequestContext) -> Result<(), String> {
    let segments = path_segments(&ctx.path);
    match (ctx.method.as_str(), segments.as_slice()) {
        ("GET", ["api", "carousel-images"]) => handle_list(ctx),
        ("POST", ["api", "carousel-images"]) => handle_create(ctx),
        (method, ["api", "carousel-images", raw_id, rest @ ..]) => {
            let Ok(id) = raw_id.parse::<i64>() else {
                return respond_error(ctx, 400, "Invalid carousel image id", "carousel-api");
            };
            match (method, rest) {
                ("PUT", []) => handle_update(ctx, id),
                ("DELETE", []) => handle_delete(ctx, id),
                ("PUT", ["order"]) => handle_reorder(ctx, id),
                (_, [] | ["order"]) => respond_error(ctx, 405, "Method not allowed", "carousel-api"),
                _ => respond_error(ctx, 404, "Not found", "carousel-api"),
            }
        }
        (_, ["api", "carousel-images"]) => {
            respond_error(ctx, 405, "Method not allowed", "carousel-api")
        }
        _ => respond_error(ctx, 404, "Not found", "carousel-api"),
    }
}

/// `all=1` is honoured for admins only; anyone else silently gets the
/// public list.
fn wants_inactive(ctx: &RequestContext) -> bool {
    let requested = ctx
        .query_param("all")
        .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
    let (true, Some(token), Some(secret)) =
        (requested, ctx.bearer_token(), config().jwt_secret.as_deref())
    else {
        return false;
    };
    let Ok(claims) = verify_access_token(secret, &token, current_unix_secs()) else {
        return false;
    };
    // The role claim may be stale; the stored account decides.
    let user_id = claims.id;
    with_db(move |pool| async move { users::find_by_id(&pool, user_id).await })
        .ok()
        .flatten()
        .is_some_and(|user| user.is_active && user.is_admin())
}

fn handle_list(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "carousel-list";
    let include_inactive = wants_inactive(ctx);
    let carousel_type = ctx
        .query_param("type")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let meta_type = carousel_type.clone();
    let images = with_db(move |pool| async move {
        list_images(&pool, carousel_type.as_deref(), include_inactive).await
    });
    match images {
        Ok(images) => {
            let payload = serde_json::to_value(&images).map_err(|e| e.to_string())?;
            respond_json(
                ctx,
                200,
                &payload,
                ACTION,
                Some(json!({ "type": meta_type, "all": include_inactive })),
            )
        }
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn read_patch(ctx: &RequestContext, action: &str) -> Result<Option<CarouselPatch>, String> {
    match parse_json_body::<CarouselPatch>(ctx) {
        Ok(patch) => Ok(Some(patch)),
        Err(err) => {
            respond_json(
                ctx,
                400,
                &json!({ "error": "Invalid request body" }),
                action,
                Some(json!({ "reason": err })),
            )?;
            Ok(None)
        }
    }
}

fn handle_create(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "carousel-create";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(patch) = read_patch(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(image_url) = patch
        .image_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return respond_error(ctx, 400, "imageUrl is required", ACTION);
    };

    let now = current_unix_secs() as i64;
    let created = with_db(move |pool| async move {
        let id = create_image(&pool, &image_url, &patch, now).await?;
        get_image(&pool, id).await
    });
    match created {
        Ok(Some(image)) => {
            let payload = serde_json::to_value(&image).map_err(|e| e.to_string())?;
            respond_json(
                ctx,
                201,
                &payload,
                ACTION,
                Some(json!({ "image_id": image.id, "display_order": image.display_order })),
            )
        }
        Ok(None) => respond_internal_error(ctx, ACTION, "inserted image vanished"),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_update(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "carousel-update";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(patch) = read_patch(ctx, ACTION)? else {
        return Ok(());
    };
    let now = current_unix_secs() as i64;
    match with_db(move |pool| async move { update_image(&pool, id, &patch, now).await }) {
        Ok(Some(image)) => {
            let payload = serde_json::to_value(&image).map_err(|e| e.to_string())?;
            respond_json(ctx, 200, &payload, ACTION, Some(json!({ "image_id": id })))
        }
        Ok(None) => respond_error(ctx, 404, "Carousel image not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_delete(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "carousel-delete";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    match with_db(move |pool| async move { delete_image(&pool, id).await }) {
        Ok(true) => respond_empty(ctx, 204, ACTION),
        Ok(false) => respond_error(ctx, 404, "Carousel image not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_reorder(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "carousel-reorder";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let request = match parse_json_body::<OrderRequest>(ctx) {
        Ok(request) => request,
        Err(err) => {
            return respond_json(
                ctx,
                400,
                &json!({ "error": "Invalid request body" }),
                ACTION,
                Some(json!({ "reason": err })),
            );
        }
    };
    let Some(new_order) = request.new_order else {
        return respond_error(ctx, 400, "newOrder is required", ACTION);
    };

    let now = current_unix_secs() as i64;
    match with_db(move |pool| async move { reorder_image(&pool, id, new_order, now).await }) {
        Ok(Some(display_order)) => respond_json(
            ctx,
            200,
            &json!({ "success": true, "displayOrder": display_order }),
            ACTION,
            Some(json!({ "image_id": id, "requested": new_order, "display_order": display_order })),
        ),
        Ok(None) => respond_error(ctx, 404, "Carousel image not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn patch(title: &str) -> CarouselPatch {
        CarouselPatch {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    async fn seed(pool: &SqlitePool, titles: &[&str]) -> Vec<i64> {
        let mut ids = Vec::new();
        for title in titles {
            ids.push(
                create_image(pool, &format!("/uploads/{title}.jpg"), &patch(title), 1)
                    .await
                    .unwrap(),
            );
        }
        ids
    }

    async fn order_of(pool: &SqlitePool) -> Vec<String> {
        list_images(pool, None, true)
            .await
            .unwrap()
            .into_iter()
            .map(|i| format!("{}:{}", i.display_order, i.title))
            .collect()
    }

    #[tokio::test]
    async fn create_appends_with_defaults() {
        let pool = test_pool().await;
        let ids = seed(&pool, &["a", "b"]).await;
        let second = get_image(&pool, ids[1]).await.unwrap().unwrap();
        assert_eq!(second.display_order, 2);
        assert_eq!(second.delay, DEFAULT_DELAY_MS);
        assert_eq!(second.carousel_type, "main");
        assert!(second.is_active);

        let json = serde_json::to_value(&second).unwrap();
        assert_eq!(json["imageUrl"], "/uploads/b.jpg");
        assert_eq!(json["displayOrder"], 2);
        assert_eq!(json["carousel_type"], "main");
        assert_eq!(json["isActive"], true);
    }

    #[tokio::test]
    async fn delete_closes_the_gap() {
        let pool = test_pool().await;
        let ids = seed(&pool, &["a", "b", "c", "d"]).await;
        assert!(delete_image(&pool, ids[1]).await.unwrap());
        assert_eq!(order_of(&pool).await, vec!["1:a", "2:c", "3:d"]);
        assert!(!delete_image(&pool, ids[1]).await.unwrap());
    }

    #[tokio::test]
    async fn reorder_moves_both_directions_and_clamps() {
        let pool = test_pool().await;
        let ids = seed(&pool, &["a", "b", "c", "d"]).await;

        assert_eq!(reorder_image(&pool, ids[0], 3, 2).await.unwrap(), Some(3));
        assert_eq!(order_of(&pool).await, vec!["1:b", "2:c", "3:a", "4:d"]);

        assert_eq!(reorder_image(&pool, ids[3], 1, 3).await.unwrap(), Some(1));
        assert_eq!(order_of(&pool).await, vec!["1:d", "2:b", "3:c", "4:a"]);

        assert_eq!(reorder_image(&pool, ids[1], 99, 4).await.unwrap(), Some(4));
        assert_eq!(order_of(&pool).await, vec!["1:d", "2:c", "3:a", "4:b"]);

        assert_eq!(reorder_image(&pool, ids[1], -5, 5).await.unwrap(), Some(1));
        assert_eq!(order_of(&pool).await, vec!["1:b", "2:d", "3:c", "4:a"]);

        assert_eq!(reorder_image(&pool, 999, 1, 6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_filters_type_and_inactive() {
        let pool = test_pool().await;
        let ids = seed(&pool, &["a", "b"]).await;
        let promo = CarouselPatch {
            carousel_type: Some("promo".into()),
            is_active: Some(false),
            ..Default::default()
        };
        update_image(&pool, ids[1], &promo, 5).await.unwrap();

        assert_eq!(list_images(&pool, None, false).await.unwrap().len(), 1);
        assert_eq!(list_images(&pool, None, true).await.unwrap().len(), 2);
        assert!(list_images(&pool, Some("promo"), false).await.unwrap().is_empty());
        assert_eq!(list_images(&pool, Some("promo"), true).await.unwrap().len(), 1);

        let updated = get_image(&pool, ids[1]).await.unwrap().unwrap();
        assert_eq!(updated.title, "b");
        assert_eq!(updated.image_url, "/uploads/b.jpg");
        assert_eq!(updated.updated_at, 5);
    }
}
