use serde::Serialize;
use serde_json::{Map, Value, json};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::audit::current_unix_secs;
use crate::db::with_db;
use crate::http::{
    RequestContext, path_segments, respond_empty, respond_error, respond_internal_error,
    respond_json,
};
use crate::session::require_admin;
use crate::showroom;

pub(crate) const DEFAULT_PAGE_SIZE: i64 = 12;
pub(crate) const MAX_PAGE_SIZE: i64 = 100;
pub(crate) const FIRST_MODEL_YEAR: i64 = 1886;

const CAR_COLUMNS: &str = "id, make, model, model_year, color, doors, engine_size, horsepower, mileage, price, title, body_text, image_name, car_condition, car_status, car_transmission, car_type, featured_car, created_at, updated_at";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub(crate) struct Car {
    pub id: i64,
    pub make: String,
    pub model: String,
    pub model_year: i64,
    pub color: String,
    pub doors: i64,
    pub engine_size: String,
    pub horsepower: i64,
    pub mileage: i64,
    pub price: i64,
    pub title: String,
    pub body_text: String,
    pub image_name: String,
    pub car_condition: String,
    pub car_status: String,
    pub car_transmission: String,
    pub car_type: String,
    pub featured_car: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Car {
    pub(crate) fn from_row(row: &SqliteRow) -> Self {
        Car {
            id: row.get("id"),
            make: row.get("make"),
            model: row.get("model"),
            model_year: row.get("model_year"),
            color: row.get("color"),
            doors: row.get("doors"),
            engine_size: row.get("engine_size"),
            horsepower: row.get("horsepower"),
            mileage: row.get("mileage"),
            price: row.get("price"),
            title: row.get("title"),
            body_text: row.get("body_text"),
            image_name: row.get("image_name"),
            car_condition: row.get("car_condition"),
            car_status: row.get("car_status"),
            car_transmission: row.get("car_transmission"),
            car_type: row.get("car_type"),
            featured_car: row.get::<i64, _>("featured_car") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Writable fields, after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CarInput {
    pub make: String,
    pub model: String,
    pub model_year: i64,
    pub color: String,
    pub doors: i64,
    pub engine_size: String,
    pub horsepower: i64,
    pub mileage: i64,
    pub price: i64,
    pub title: String,
    pub body_text: String,
    pub image_name: String,
    pub car_condition: String,
    pub car_status: String,
    pub car_transmission: String,
    pub car_type: String,
    pub featured_car: bool,
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn text_field(obj: &Map<String, Value>, keys: &[&str], default: &str) -> String {
    match lookup(obj, keys) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn int_field(
    obj: &Map<String, Value>,
    keys: &[&str],
    default: i64,
    details: &mut Vec<String>,
) -> i64 {
    match lookup(obj, keys) {
        None => default,
        Some(Value::Number(n)) => match n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)) {
            Some(v) => v,
            None => {
                details.push(format!("{} must be a number", keys[0]));
                default
            }
        },
        Some(Value::String(s)) if s.trim().is_empty() => default,
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v.round() as i64,
            _ => {
                details.push(format!("{} must be a number", keys[0]));
                default
            }
        },
        Some(_) => {
            details.push(format!("{} must be a number", keys[0]));
            default
        }
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}

/// Civil year for a unix timestamp (UTC).
pub(crate) fn year_of(unix_secs: i64) -> i64 {
    let days = unix_secs.div_euclid(86_400);
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    yoe + era * 400 + if month <= 2 { 1 } else { 0 }
}

/// Parses and validates a create/replace body. `Err` carries the details list.
pub(crate) fn parse_car_input(body: &Value, now: i64) -> Result<CarInput, Vec<String>> {
    let Some(obj) = body.as_object() else {
        return Err(vec!["body must be a JSON object".to_string()]);
    };
    let mut details = Vec::new();

    let input = CarInput {
        make: text_field(obj, &["make"], ""),
        model: text_field(obj, &["model"], ""),
        model_year: int_field(obj, &["model_year", "modelYear", "year"], 0, &mut details),
        color: text_field(obj, &["color"], ""),
        doors: int_field(obj, &["doors"], 4, &mut details),
        engine_size: text_field(obj, &["engine_size", "engineSize"], ""),
        horsepower: int_field(obj, &["horsepower"], 0, &mut details),
        mileage: int_field(obj, &["mileage"], 0, &mut details),
        price: int_field(obj, &["price"], 0, &mut details),
        title: text_field(obj, &["title"], ""),
        body_text: text_field(obj, &["body_text", "bodyText"], ""),
        image_name: text_field(obj, &["image_name", "imageName"], ""),
        car_condition: text_field(obj, &["car_condition", "carCondition"], "Good"),
        car_status: text_field(obj, &["car_status", "carStatus"], "Clean"),
        car_transmission: text_field(obj, &["car_transmission", "carTransmission"], "Automatic"),
        car_type: text_field(obj, &["car_type", "carType"], "Sedan"),
        featured_car: lookup(obj, &["featured_car", "featuredCar", "featured"]).is_some_and(truthy),
    };

    if input.make.is_empty() {
        details.push("make is required".to_string());
    }
    if input.model.is_empty() {
        details.push("model is required".to_string());
    }
    let max_year = year_of(now) + 1;
    if !(FIRST_MODEL_YEAR..=max_year).contains(&input.model_year) {
        details.push(format!("model_year must be between {FIRST_MODEL_YEAR} and {max_year}"));
    }
    for (name, value) in [
        ("price", input.price),
        ("mileage", input.mileage),
        ("horsepower", input.horsepower),
    ] {
        if value < 0 {
            details.push(format!("{name} must not be negative"));
        }
    }
    if !(1..=6).contains(&input.doors) {
        details.push("doors must be between 1 and 6".to_string());
    }

    if details.is_empty() {
        Ok(input)
    } else {
        Err(details)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CarFilter {
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub max_mileage: Option<i64>,
    pub min_year: Option<i64>,
    pub max_year: Option<i64>,
    pub terms: Vec<String>,
    pub featured: Option<bool>,
}

impl CarFilter {
    pub(crate) fn from_context(ctx: &RequestContext) -> Self {
        let number = |name: &str| {
            ctx.query_param(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .map(|v| v as i64)
        };
        let text = |name: &str| {
            ctx.query_param(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let search = text("query").or_else(|| text("q")).unwrap_or_default();

        CarFilter {
            make: text("make"),
            model: text("model"),
            color: text("color"),
            min_price: number("minPrice"),
            max_price: number("maxPrice"),
            max_mileage: number("maxMileage"),
            min_year: number("minYear"),
            max_year: number("maxYear"),
            terms: search.split_whitespace().map(str::to_string).collect(),
            featured: ctx
                .query_param("featured")
                .map(|v| truthy(&Value::String(v))),
        }
    }
}

fn like_pattern(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CarFilter) {
    qb.push(" WHERE 1=1");
    for (column, value) in [
        ("make", &filter.make),
        ("model", &filter.model),
        ("color", &filter.color),
    ] {
        if let Some(value) = value {
            qb.push(format!(" AND {column} LIKE "))
                .push_bind(like_pattern(value))
                .push(" ESCAPE '\\'");
        }
    }
    for (clause, value) in [
        (" AND price >= ", filter.min_price),
        (" AND price <= ", filter.max_price),
        (" AND mileage <= ", filter.max_mileage),
        (" AND model_year >= ", filter.min_year),
        (" AND model_year <= ", filter.max_year),
    ] {
        if let Some(value) = value {
            qb.push(clause).push_bind(value);
        }
    }
    for term in &filter.terms {
        let pattern = like_pattern(term);
        qb.push(" AND (");
        for (idx, column) in ["make", "model", "title", "body_text"].iter().enumerate() {
            if idx > 0 {
                qb.push(" OR ");
            }
            qb.push(format!("{column} LIKE "))
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
    }
    if let Some(featured) = filter.featured {
        qb.push(" AND featured_car = ").push_bind(featured as i64);
    }
}

pub(crate) struct CarPage {
    pub cars: Vec<Car>,
    pub total: i64,
}

pub(crate) async fn list_cars(
    pool: &SqlitePool,
    filter: &CarFilter,
    limit: i64,
    offset: i64,
) -> Result<CarPage, sqlx::Error> {
    let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM cars");
    push_filters(&mut count_qb, filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {CAR_COLUMNS} FROM cars"));
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = qb.build().fetch_all(pool).await?;

    Ok(CarPage {
        cars: rows.iter().map(Car::from_row).collect(),
        total,
    })
}

pub(crate) async fn featured_cars(pool: &SqlitePool) -> Result<Vec<Car>, sqlx::Error> {
    let sql = format!("SELECT {CAR_COLUMNS} FROM cars WHERE featured_car = 1 ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(Car::from_row).collect())
}

pub(crate) async fn get_car(pool: &SqlitePool, id: i64) -> Result<Option<Car>, sqlx::Error> {
    let sql = format!("SELECT {CAR_COLUMNS} FROM cars WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(Car::from_row))
}

pub(crate) async fn insert_car<'e, E>(executor: E, car: &CarInput, now: i64) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "INSERT INTO cars (make, model, model_year, color, doors, engine_size, horsepower, mileage, price, title, body_text, image_name, car_condition, car_status, car_transmission, car_type, featured_car, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&car.make)
    .bind(&car.model)
    .bind(car.model_year)
    .bind(&car.color)
    .bind(car.doors)
    .bind(&car.engine_size)
    .bind(car.horsepower)
    .bind(car.mileage)
    .bind(car.price)
    .bind(&car.title)
    .bind(&car.body_text)
    .bind(&car.image_name)
    .bind(&car.car_condition)
    .bind(&car.car_status)
    .bind(&car.car_transmission)
    .bind(&car.car_type)
    .bind(car.featured_car as i64)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub(crate) async fn update_car(
    pool: &SqlitePool,
    id: i64,
    car: &CarInput,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE cars SET make = ?, model = ?, model_year = ?, color = ?, doors = ?, engine_size = ?, horsepower = ?, mileage = ?, price = ?, title = ?, body_text = ?, image_name = ?, car_condition = ?, car_status = ?, car_transmission = ?, car_type = ?, featured_car = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&car.make)
    .bind(&car.model)
    .bind(car.model_year)
    .bind(&car.color)
    .bind(car.doors)
    .bind(&car.engine_size)
    .bind(car.horsepower)
    .bind(car.mileage)
    .bind(car.price)
    .bind(&car.title)
    .bind(&car.body_text)
    .bind(&car.image_name)
    .bind(&car.car_condition)
    .bind(&car.car_status)
    .bind(&car.car_transmission)
    .bind(&car.car_type)
    .bind(car.featured_car as i64)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) async fn delete_car(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM cars WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) fn handle_cars_api(ctx: &RequestContext) -> Result<(), String> {
    let segments = path_segments(&ctx.path);
    match (ctx.method.as_str(), segments.as_slice()) {
        ("GET", ["api", "cars"]) => handle_list(ctx),
        ("POST", ["api", "cars"]) => handle_create(ctx),
        ("GET", ["api", "cars", "featured"]) => showroom::handle_featured(ctx),
        (method, ["api", "cars", raw_id]) => {
            let Ok(id) = raw_id.parse::<i64>() else {
                return respond_error(ctx, 400, "Invalid car id", "cars-api");
            };
            match method {
                "GET" => handle_get(ctx, id),
                "PUT" => handle_replace(ctx, id),
                "DELETE" => handle_delete(ctx, id),
                _ => respond_error(ctx, 405, "Method not allowed", "cars-api"),
            }
        }
        (_, ["api", "cars"]) => respond_error(ctx, 405, "Method not allowed", "cars-api"),
        _ => respond_error(ctx, 404, "Not found", "cars-api"),
    }
}

fn handle_list(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "cars-list";
    let page = ctx
        .query_param("page")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(1);
    let limit = ctx
        .query_param("limit")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    let offset = (page - 1).saturating_mul(limit);
    let filter = CarFilter::from_context(ctx);

    let listing = with_db(move |pool| async move { list_cars(&pool, &filter, limit, offset).await });
    let listing = match listing {
        Ok(listing) => listing,
        Err(err) => return respond_internal_error(ctx, ACTION, &err),
    };

    let has_more = offset + (listing.cars.len() as i64) < listing.total;
    respond_json(
        ctx,
        200,
        &json!({
            "cars": listing.cars,
            "hasMore": has_more,
            "total": listing.total,
            "page": page,
            "limit": limit,
        }),
        ACTION,
        Some(json!({ "total": listing.total, "page": page })),
    )
}

fn handle_get(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "cars-get";
    match with_db(move |pool| async move { get_car(&pool, id).await }) {
        Ok(Some(car)) => {
            let payload = serde_json::to_value(&car).map_err(|e| e.to_string())?;
            respond_json(ctx, 200, &payload, ACTION, Some(json!({ "car_id": id })))
        }
        Ok(None) => respond_error(ctx, 404, "Car not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn read_car_input(ctx: &RequestContext, action: &str) -> Result<Option<CarInput>, String> {
    let body: Value = match crate::http::parse_json_body(ctx) {
        Ok(body) => body,
        Err(err) => {
            respond_json(
                ctx,
                400,
                &json!({ "error": "Invalid request body" }),
                action,
                Some(json!({ "reason": err })),
            )?;
            return Ok(None);
        }
    };
    match parse_car_input(&body, current_unix_secs() as i64) {
        Ok(input) => Ok(Some(input)),
        Err(details) => {
            respond_json(
                ctx,
                400,
                &json!({ "error": "Validation failed", "details": details }),
                action,
                Some(json!({ "details": details })),
            )?;
            Ok(None)
        }
    }
}

fn handle_create(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "cars-create";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(input) = read_car_input(ctx, ACTION)? else {
        return Ok(());
    };

    let now = current_unix_secs() as i64;
    let created = with_db(move |pool| async move {
        let id = insert_car(&pool, &input, now).await?;
        get_car(&pool, id).await
    });
    match created {
        Ok(Some(car)) => {
            let payload = serde_json::to_value(&car).map_err(|e| e.to_string())?;
            respond_json(ctx, 201, &payload, ACTION, Some(json!({ "car_id": car.id })))
        }
        Ok(None) => respond_internal_error(ctx, ACTION, "inserted car vanished"),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_replace(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "cars-update";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(input) = read_car_input(ctx, ACTION)? else {
        return Ok(());
    };

    let now = current_unix_secs() as i64;
    let updated = with_db(move |pool| async move {
        if !update_car(&pool, id, &input, now).await? {
            return Ok(None);
        }
        get_car(&pool, id).await
    });
    match updated {
        Ok(Some(car)) => {
            let payload = serde_json::to_value(&car).map_err(|e| e.to_string())?;
            respond_json(ctx, 200, &payload, ACTION, Some(json!({ "car_id": id })))
        }
        Ok(None) => respond_error(ctx, 404, "Car not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_delete(ctx: &RequestContext, id: i64) -> Result<(), String> {
    const ACTION: &str = "cars-delete";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    match with_db(move |pool| async move { delete_car(&pool, id).await }) {
        Ok(true) => respond_empty(ctx, 204, ACTION),
        Ok(false) => respond_error(ctx, 404, "Car not found", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

#[cfg(test)]
pub(crate) fn sample_input(make: &str, model: &str) -> CarInput {
    CarInput {
        make: make.into(),
        model: model.into(),
        model_year: 2020,
        color: "Blue".into(),
        doors: 4,
        engine_size: "2.0L".into(),
        horsepower: 180,
        mileage: 30_000,
        price: 18_500,
        title: format!("{make} {model}"),
        body_text: "One owner".into(),
        image_name: String::new(),
        car_condition: "Good".into(),
        car_status: "Clean".into(),
        car_transmission: "Automatic".into(),
        car_type: "Sedan".into(),
        featured_car: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::http::test_context;

    // 2024-06-01T00:00:00Z
    const NOW: i64 = 1_717_200_000;

    #[test]
    fn year_of_handles_boundaries() {
        assert_eq!(year_of(0), 1970);
        assert_eq!(year_of(NOW), 2024);
        assert_eq!(year_of(1_704_067_199), 2023);
        assert_eq!(year_of(1_704_067_200), 2024);
    }

    #[test]
    fn parse_applies_defaults_and_aliases() {
        let body = json!({
            "make": " Honda ",
            "model": "Civic",
            "modelYear": "2019",
            "price": 15000.4,
            "featured": 1,
        });
        let input = parse_car_input(&body, NOW).unwrap();
        assert_eq!(input.make, "Honda");
        assert_eq!(input.model_year, 2019);
        assert_eq!(input.price, 15_000);
        assert_eq!(input.doors, 4);
        assert_eq!(input.car_condition, "Good");
        assert_eq!(input.car_status, "Clean");
        assert_eq!(input.car_transmission, "Automatic");
        assert_eq!(input.car_type, "Sedan");
        assert!(input.featured_car);
    }

    #[test]
    fn parse_collects_every_problem() {
        let body = json!({
            "make": "",
            "model_year": 2026,
            "price": -1,
            "mileage": "lots",
            "doors": 9,
        });
        let details = parse_car_input(&body, NOW).unwrap_err();
        assert!(details.contains(&"make is required".to_string()));
        assert!(details.contains(&"model is required".to_string()));
        assert!(details.contains(&"model_year must be between 1886 and 2025".to_string()));
        assert!(details.contains(&"price must not be negative".to_string()));
        assert!(details.contains(&"mileage must be a number".to_string()));
        assert!(details.contains(&"doors must be between 1 and 6".to_string()));

        assert!(parse_car_input(&json!([1, 2]), NOW).is_err());
    }

    #[test]
    fn filter_reads_query_string() {
        let ctx = test_context(
            "GET",
            "/api/cars?make=Ford&minPrice=1000&maxPrice=abc&q=red%20truck&featured=true",
            &[],
        );
        let filter = CarFilter::from_context(&ctx);
        assert_eq!(filter.make.as_deref(), Some("Ford"));
        assert_eq!(filter.min_price, Some(1000));
        assert_eq!(filter.max_price, None);
        assert_eq!(filter.terms, vec!["red".to_string(), "truck".to_string()]);
        assert_eq!(filter.featured, Some(true));
    }

    #[tokio::test]
    async fn listing_filters_pages_and_counts_filtered_total() {
        let pool = test_pool().await;
        let mut civic = sample_input("Honda", "Civic");
        civic.price = 12_000;
        civic.body_text = "Red paint, sunroof".into();
        let mut accord = sample_input("Honda", "Accord");
        accord.price = 22_000;
        accord.model_year = 2022;
        let mut f150 = sample_input("Ford", "F-150");
        f150.price = 35_000;
        f150.featured_car = true;
        insert_car(&pool, &civic, 100).await.unwrap();
        insert_car(&pool, &accord, 200).await.unwrap();
        insert_car(&pool, &f150, 300).await.unwrap();

        let all = list_cars(&pool, &CarFilter::default(), 2, 0).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(
            all.cars.iter().map(|c| c.model.as_str()).collect::<Vec<_>>(),
            vec!["F-150", "Accord"]
        );

        let hondas = CarFilter { make: Some("honda".into()), ..Default::default() };
        let page = list_cars(&pool, &hondas, 10, 0).await.unwrap();
        assert_eq!(page.total, 2);

        let bounded = CarFilter {
            min_price: Some(20_000),
            max_price: Some(30_000),
            min_year: Some(2021),
            ..Default::default()
        };
        let page = list_cars(&pool, &bounded, 10, 0).await.unwrap();
        assert_eq!(page.cars.len(), 1);
        assert_eq!(page.cars[0].model, "Accord");

        let search = CarFilter {
            terms: vec!["honda".into(), "SUNROOF".into()],
            ..Default::default()
        };
        let page = list_cars(&pool, &search, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.cars[0].model, "Civic");

        let wildcard = CarFilter { make: Some("%".into()), ..Default::default() };
        assert_eq!(list_cars(&pool, &wildcard, 10, 0).await.unwrap().total, 0);

        let featured = CarFilter { featured: Some(true), ..Default::default() };
        assert_eq!(list_cars(&pool, &featured, 10, 0).await.unwrap().total, 1);
        assert_eq!(featured_cars(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rows() {
        let pool = test_pool().await;
        let id = insert_car(&pool, &sample_input("Mazda", "3"), 10).await.unwrap();

        let mut changed = sample_input("Mazda", "CX-5");
        changed.doors = 5;
        assert!(update_car(&pool, id, &changed, 20).await.unwrap());
        let stored = get_car(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.model, "CX-5");
        assert_eq!(stored.doors, 5);
        assert_eq!(stored.created_at, 10);
        assert_eq!(stored.updated_at, 20);

        assert!(!update_car(&pool, id + 1, &changed, 20).await.unwrap());
        assert!(delete_car(&pool, id).await.unwrap());
        assert!(!delete_car(&pool, id).await.unwrap());
        assert!(get_car(&pool, id).await.unwrap().is_none());
    }
}
