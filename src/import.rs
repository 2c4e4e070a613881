//! CSV bulk import of listings and duplicate clean-up.

use rand::Rng;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::io::Read;

use crate::cars::{CarInput, FIRST_MODEL_YEAR, insert_car, truthy, year_of};

pub(crate) const DEFAULT_FEATURED_RATIO: f64 = 0.3;
const DEFAULT_MODEL_YEAR: i64 = 2023;
const DEFAULT_ENGINE_SIZE: &str = "2.0L";
const DEFAULT_HORSEPOWER: i64 = 200;
const HORSEPOWER_PER_CYLINDER: i64 = 25;

const MAKE_WIDTH: usize = 75;
const MODEL_WIDTH: usize = 50;
const COLOR_WIDTH: usize = 30;
const ENGINE_WIDTH: usize = 20;
const TITLE_WIDTH: usize = 300;
const IMAGE_WIDTH: usize = 255;
const TEXT_WIDTH: usize = 65_535;
const ENUM_WIDTH: usize = 50;

#[derive(Debug, Default, Serialize, PartialEq)]
pub(crate) struct ImportReport {
    pub imported: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

pub(crate) struct ParsedRows {
    pub cars: Vec<CarInput>,
    pub skipped: u64,
    pub errors: Vec<String>,
}

fn truncate(value: &str, width: usize) -> String {
    value.trim().chars().take(width).collect()
}

/// Leading integer of a loosely formatted number: `$25,999.00` -> 25999,
/// `48,000 mi` -> 48000.
pub(crate) fn loose_int(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.'))
        .chars()
        .filter(|c| *c != ',' && *c != '_')
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if let Ok(value) = cleaned.parse::<i64>() {
        return Some(value);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.trunc() as i64)
}

fn text_or(record: &HashMap<String, String>, key: &str, default: &str, width: usize) -> String {
    match record.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => truncate(value, width),
        None => truncate(default, width),
    }
}

/// Reads a header-driven CSV into validated inputs.
pub(crate) fn parse_csv<R: Read, G: Rng>(
    reader: R,
    featured_ratio: f64,
    now: i64,
    rng: &mut G,
) -> Result<ParsedRows, String> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = csv_reader
        .headers()
        .map_err(|e| format!("csv-header-error: {e}"))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();
    let has_featured = headers.iter().any(|h| h == "featured" || h == "featured_car");
    let ratio = featured_ratio.clamp(0.0, 1.0);
    let max_year = year_of(now) + 1;

    let mut parsed = ParsedRows { cars: Vec::new(), skipped: 0, errors: Vec::new() };
    for (index, result) in csv_reader.records().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                parsed.skipped += 1;
                parsed.errors.push(format!("line {line}: {err}"));
                continue;
            }
        };
        let row: HashMap<String, String> = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();

        let make = text_or(&row, "make", "", MAKE_WIDTH);
        let model = text_or(&row, "model", "", MODEL_WIDTH);
        if make.is_empty() || model.is_empty() {
            parsed.skipped += 1;
            parsed.errors.push(format!("line {line}: make and model are required"));
            continue;
        }

        let number = |key: &str| row.get(key).and_then(|v| loose_int(v));
        let model_year = number("modelYear")
            .filter(|y| *y != 0)
            .unwrap_or(DEFAULT_MODEL_YEAR);
        if !(FIRST_MODEL_YEAR..=max_year).contains(&model_year) {
            parsed.skipped += 1;
            parsed.errors.push(format!(
                "line {line}: modelYear must be between {FIRST_MODEL_YEAR} and {max_year}"
            ));
            continue;
        }
        let horsepower = number("cylinders")
            .and_then(|c| c.checked_mul(HORSEPOWER_PER_CYLINDER))
            .filter(|hp| *hp > 0)
            .unwrap_or(DEFAULT_HORSEPOWER);
        let featured_car = if has_featured {
            row.get("featured")
                .or_else(|| row.get("featured_car"))
                .is_some_and(|v| truthy(&serde_json::Value::String(v.clone())))
        } else {
            rng.gen_bool(ratio)
        };

        parsed.cars.push(CarInput {
            make,
            model,
            model_year,
            color: text_or(&row, "color", "", COLOR_WIDTH),
            doors: 4,
            engine_size: text_or(&row, "fuel", DEFAULT_ENGINE_SIZE, ENGINE_WIDTH),
            horsepower,
            mileage: number("odometer").unwrap_or(0).max(0),
            price: number("price").unwrap_or(0).max(0),
            title: text_or(&row, "title", "", TITLE_WIDTH),
            body_text: text_or(&row, "bodyText", "", TEXT_WIDTH),
            image_name: text_or(&row, "imageName", "", IMAGE_WIDTH),
            car_condition: text_or(&row, "car_condition", "Good", ENUM_WIDTH),
            car_status: text_or(&row, "car_status", "Clean", ENUM_WIDTH),
            car_transmission: text_or(&row, "car_transmission", "Automatic", ENUM_WIDTH),
            car_type: text_or(&row, "car_type", "Sedan", ENUM_WIDTH),
            featured_car,
        });
    }
    Ok(parsed)
}

/// Inserts every parsed row in one transaction, optionally emptying the
/// table first.
pub(crate) async fn import_rows(
    pool: &SqlitePool,
    parsed: ParsedRows,
    truncate_first: bool,
    now: i64,
) -> Result<ImportReport, sqlx::Error> {
    let mut tx = pool.begin().await?;
    if truncate_first {
        sqlx::query("DELETE FROM cars").execute(&mut *tx).await?;
    }
    let mut imported = 0u64;
    for car in &parsed.cars {
        insert_car(&mut *tx, car, now).await?;
        imported += 1;
    }
    tx.commit().await?;
    Ok(ImportReport {
        imported,
        skipped: parsed.skipped,
        errors: parsed.errors,
    })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DuplicateSet {
    pub keep: i64,
    pub remove: Vec<i64>,
}

/// Groups listings by make, model, year, mileage and title; the lowest id
/// of each group survives.
pub(crate) async fn find_duplicates(pool: &SqlitePool) -> Result<Vec<DuplicateSet>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, make, model, model_year, mileage, title FROM cars ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<DuplicateSet> = Vec::new();
    let mut index: HashMap<(String, String, i64, i64, String), usize> = HashMap::new();
    for row in rows {
        let key = (
            row.get::<String, _>("make"),
            row.get::<String, _>("model"),
            row.get::<i64, _>("model_year"),
            row.get::<i64, _>("mileage"),
            row.get::<String, _>("title"),
        );
        let id: i64 = row.get("id");
        match index.get(&key) {
            Some(&slot) => groups[slot].remove.push(id),
            None => {
                index.insert(key, groups.len());
                groups.push(DuplicateSet { keep: id, remove: Vec::new() });
            }
        }
    }
    groups.retain(|g| !g.remove.is_empty());
    Ok(groups)
}

pub(crate) async fn remove_duplicates(
    pool: &SqlitePool,
    sets: &[DuplicateSet],
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut removed = 0;
    for id in sets.iter().flat_map(|s| s.remove.iter()) {
        removed += sqlx::query("DELETE FROM cars WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cars::{get_car, sample_input};
    use crate::db::test_pool;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    // 2024-06-01T00:00:00Z
    const NOW: i64 = 1_717_200_000;

    const CSV: &str = "\
make,model,modelYear,color,fuel,cylinders,odometer,price,title,bodyText,imageName,car_condition,car_status,car_transmission,car_type
Toyota,Camry,2018,Silver,2.5L,4,\"48,000 mi\",\"$17,995\",2018 Toyota Camry,Clean,camry.jpg,,,,
Ford,,2020,Blue,,,,,,,,,,,
Jeep,Wrangler,,Green,,abc,,,Jeep,,,Excellent,,Manual,SUV
";

    #[test]
    fn loose_numbers() {
        assert_eq!(loose_int("$25,999.00"), Some(25_999));
        assert_eq!(loose_int("48,000 mi"), Some(48_000));
        assert_eq!(loose_int(" 7 "), Some(7));
        assert_eq!(loose_int("n/a"), None);
        assert_eq!(loose_int(""), None);
    }

    #[test]
    fn csv_rows_get_defaults_and_skips() {
        let mut rng = StdRng::seed_from_u64(7);
        let parsed = parse_csv(CSV.as_bytes(), 0.0, NOW, &mut rng).unwrap();
        assert_eq!(parsed.cars.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.errors, vec!["line 3: make and model are required".to_string()]);

        let camry = &parsed.cars[0];
        assert_eq!(camry.mileage, 48_000);
        assert_eq!(camry.price, 17_995);
        assert_eq!(camry.horsepower, 100);
        assert_eq!(camry.engine_size, "2.5L");
        assert_eq!(camry.car_condition, "Good");
        assert!(!camry.featured_car);

        let jeep = &parsed.cars[1];
        assert_eq!(jeep.model_year, DEFAULT_MODEL_YEAR);
        assert_eq!(jeep.horsepower, DEFAULT_HORSEPOWER);
        assert_eq!(jeep.engine_size, DEFAULT_ENGINE_SIZE);
        assert_eq!(jeep.car_condition, "Excellent");
        assert_eq!(jeep.car_transmission, "Manual");
        assert_eq!(jeep.car_type, "SUV");
    }

    #[test]
    fn oversized_cylinder_counts_fall_back_to_default_horsepower() {
        let csv = "make,model,cylinders\nJeep,Wrangler,400000000000000000\nFord,Ranger,-6\n";
        let mut rng = StdRng::seed_from_u64(5);
        let parsed = parse_csv(csv.as_bytes(), 0.0, NOW, &mut rng).unwrap();
        assert_eq!(parsed.cars.len(), 2);
        assert!(parsed.cars.iter().all(|c| c.horsepower == DEFAULT_HORSEPOWER));
    }

    #[test]
    fn out_of_range_model_years_are_skipped() {
        let csv = "make,model,modelYear\nA,B,1\nC,D,99999\nE,F,1886\nG,H,2025\nI,J,2026\n";
        let mut rng = StdRng::seed_from_u64(5);
        let parsed = parse_csv(csv.as_bytes(), 0.0, NOW, &mut rng).unwrap();
        let years: Vec<i64> = parsed.cars.iter().map(|c| c.model_year).collect();
        assert_eq!(years, vec![1886, 2025]);
        assert_eq!(parsed.skipped, 3);
        assert_eq!(
            parsed.errors[0],
            "line 2: modelYear must be between 1886 and 2025"
        );
        assert_eq!(
            parsed.errors[2],
            "line 6: modelYear must be between 1886 and 2025"
        );
    }

    #[test]
    fn long_values_are_truncated_and_featured_column_wins() {
        let csv = format!(
            "make,model,featured\n{},Model,yes\nA,B,0\n",
            "M".repeat(100)
        );
        let mut rng = StdRng::seed_from_u64(1);
        let parsed = parse_csv(csv.as_bytes(), 1.0, NOW, &mut rng).unwrap();
        assert_eq!(parsed.cars[0].make.chars().count(), MAKE_WIDTH);
        assert!(parsed.cars[0].featured_car);
        assert!(!parsed.cars[1].featured_car);
    }

    #[test]
    fn featured_ratio_extremes() {
        let csv = "make,model\nA,B\nC,D\nE,F\n";
        let mut rng = StdRng::seed_from_u64(3);
        let all = parse_csv(csv.as_bytes(), 1.0, NOW, &mut rng).unwrap();
        assert!(all.cars.iter().all(|c| c.featured_car));
        let none = parse_csv(csv.as_bytes(), 0.0, NOW, &mut rng).unwrap();
        assert!(none.cars.iter().all(|c| !c.featured_car));
    }

    #[tokio::test]
    async fn import_can_replace_existing_inventory() {
        let pool = test_pool().await;
        let old = insert_car(&pool, &sample_input("Old", "Car"), 1).await.unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let parsed = parse_csv(CSV.as_bytes(), 0.0, NOW, &mut rng).unwrap();
        let report = import_rows(&pool, parsed, true, 50).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped, 1);
        assert!(get_car(&pool, old).await.unwrap().is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cars")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn duplicates_keep_lowest_id() {
        let pool = test_pool().await;
        let a = insert_car(&pool, &sample_input("Kia", "Soul"), 1).await.unwrap();
        let b = insert_car(&pool, &sample_input("Kia", "Soul"), 2).await.unwrap();
        let c = insert_car(&pool, &sample_input("Kia", "Soul"), 3).await.unwrap();
        let mut different = sample_input("Kia", "Soul");
        different.mileage = 1;
        insert_car(&pool, &different, 4).await.unwrap();

        let sets = find_duplicates(&pool).await.unwrap();
        assert_eq!(sets, vec![DuplicateSet { keep: a, remove: vec![b, c] }]);
        assert_eq!(remove_duplicates(&pool, &sets).await.unwrap(), 2);
        assert!(find_duplicates(&pool).await.unwrap().is_empty());
    }
}
