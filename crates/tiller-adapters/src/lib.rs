//! Inbound payload normalization: the untrusted raw shapes delivered
//! by webhooks, form submissions and the polled booking-engine API
//! all converge on one canonical [`Booking`] here. Shape sniffing
//! stays in this adapter layer so booking semantics never have to
//! probe JSON.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tiller_core::{AddOnItem, Booking, CatalogRules, ItemKind, Status};

pub const CRATE_NAME: &str = "tiller-adapters";

/// The inbound payload shapes this subsystem accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// Nested webhook JSON with an items collection under `order`.
    Webhook,
    /// Flat key-value form fields; items arrive as one opaque string.
    FlatFields,
    /// A single polled API record with an `order.items.item` path.
    PolledRecord,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no booking code")]
    MissingCode,
    #[error("payload has no status")]
    MissingStatus,
}

/// Guesses the shape of an unlabeled payload. Webhook deliveries
/// carry a top-level `booking` object, form submissions carry the
/// flat well-known keys, and anything else is treated as a polled
/// record.
pub fn detect_shape(raw: &JsonValue) -> PayloadShape {
    if raw.get("booking").map_or(false, JsonValue::is_object) {
        PayloadShape::Webhook
    } else if raw.get("Booking Code").is_some() {
        PayloadShape::FlatFields
    } else {
        PayloadShape::PolledRecord
    }
}

/// Normalizes a raw payload of the given shape into a canonical
/// booking. Fields absent from the source stay `None`; only a
/// missing booking code (or status) is an error, because without it
/// the record cannot be reconciled at all.
pub fn normalize(
    raw: &JsonValue,
    shape: PayloadShape,
    rules: &CatalogRules,
    tz: Tz,
) -> Result<Booking, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    match shape {
        PayloadShape::Webhook => normalize_webhook(raw, rules, tz),
        PayloadShape::FlatFields => normalize_flat(raw),
        PayloadShape::PolledRecord => normalize_polled(raw, rules, tz),
    }
}

fn normalize_webhook(
    raw: &JsonValue,
    rules: &CatalogRules,
    tz: Tz,
) -> Result<Booking, NormalizeError> {
    let body = raw.get("booking").unwrap_or(raw);
    let code = str_at(body, &["code"])
        .or_else(|| str_at(body, &["booking_id"]))
        .ok_or(NormalizeError::MissingCode)?;
    let status = str_at(body, &["status_id"])
        .or_else(|| str_at(body, &["status"]))
        .ok_or(NormalizeError::MissingStatus)?;

    let mut booking = Booking::new(code, Status::new(status));
    booking.customer.name = str_at(body, &["customer", "name"]).map(ToString::to_string);
    booking.customer.email = str_at(body, &["customer", "email"]).map(ToString::to_string);
    booking.customer.phone = str_at(body, &["customer", "phone"]).map(ToString::to_string);
    booking.total_amount = flexible_f64(value_at(body, &["order", "total"]));
    apply_epoch_schedule(&mut booking, body, tz);

    let items = body
        .get("order")
        .and_then(|order| order.get("items"))
        .map(coerce_item_list)
        .unwrap_or_default();
    apply_items(&mut booking, &items, rules);
    Ok(booking)
}

fn normalize_flat(raw: &JsonValue) -> Result<Booking, NormalizeError> {
    let code = str_at(raw, &["Booking Code"]).ok_or(NormalizeError::MissingCode)?;
    let status = str_at(raw, &["Status"]).ok_or(NormalizeError::MissingStatus)?;

    let mut booking = Booking::new(code, Status::new(status));
    booking.customer.name = str_at(raw, &["Customer Name"]).map(ToString::to_string);
    booking.customer.email = str_at(raw, &["Email"]).map(ToString::to_string);
    booking.customer.phone = str_at(raw, &["Phone"]).map(ToString::to_string);
    booking.total_amount = flexible_f64(raw.get("Total Amount"));
    booking.schedule.booking_date = str_at(raw, &["Booking Date"])
        .and_then(|v| v.parse::<NaiveDate>().ok());
    booking.schedule.start_time = str_at(raw, &["Start Time"])
        .and_then(|v| NaiveTime::parse_from_str(v, "%H:%M").ok());
    booking.schedule.finish_time = str_at(raw, &["Finish Time"])
        .and_then(|v| NaiveTime::parse_from_str(v, "%H:%M").ok());
    // Form fields carry no item-level structure: the single opaque
    // string is the primary item and there are no add-ons.
    booking.primary_item = str_at(raw, &["Booking Items"])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string);
    Ok(booking)
}

fn normalize_polled(
    raw: &JsonValue,
    rules: &CatalogRules,
    tz: Tz,
) -> Result<Booking, NormalizeError> {
    let code = str_at(raw, &["code"])
        .or_else(|| str_at(raw, &["booking_id"]))
        .ok_or(NormalizeError::MissingCode)?;
    let status = str_at(raw, &["status_id"])
        .or_else(|| str_at(raw, &["status"]))
        .ok_or(NormalizeError::MissingStatus)?;

    let mut booking = Booking::new(code, Status::new(status));
    booking.customer.name = str_at(raw, &["customer", "name"])
        .or_else(|| str_at(raw, &["customer_name"]))
        .map(ToString::to_string);
    booking.customer.email = str_at(raw, &["customer", "email"])
        .or_else(|| str_at(raw, &["customer_email"]))
        .map(ToString::to_string);
    booking.customer.phone = str_at(raw, &["customer", "phone"])
        .or_else(|| str_at(raw, &["customer_phone"]))
        .map(ToString::to_string);
    booking.total_amount = flexible_f64(value_at(raw, &["order", "total"]))
        .or_else(|| flexible_f64(raw.get("total")));
    apply_epoch_schedule(&mut booking, raw, tz);

    // `order.items.item` is a single object for one-item bookings
    // and an array otherwise; always coerce to a list.
    let items = value_at(raw, &["order", "items", "item"])
        .map(coerce_item_list)
        .unwrap_or_default();
    apply_items(&mut booking, &items, rules);
    Ok(booking)
}

/// Coerces the booking engine's item collection to a plain list.
///
/// Three upstream variants exist: a plain array, a single bare item
/// object, and an array spuriously wrapped in an object keyed by
/// stringified indices ("1", "2", "3"). The last is detected by
/// probing the keys and unwrapped in numeric order.
pub fn coerce_item_list(value: &JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(map) => {
            let mut indexed: Vec<(u64, &JsonValue)> = Vec::with_capacity(map.len());
            for (key, item) in map {
                match key.parse::<u64>() {
                    Ok(index) => indexed.push((index, item)),
                    // Any non-numeric key means this is a bare item
                    // object, not an index wrapper.
                    Err(_) => return vec![value.clone()],
                }
            }
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, item)| item.clone()).collect()
        }
        _ => Vec::new(),
    }
}

fn apply_items(booking: &mut Booking, items: &[JsonValue], rules: &CatalogRules) {
    for item in items {
        let Some(sku) = str_at(item, &["sku"]).or_else(|| str_at(item, &["name"])) else {
            continue;
        };
        let category_id = item
            .get("category_id")
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            });
        let classified = rules.classify(sku, category_id.as_deref());
        let is_first_primary = classified.kind == ItemKind::Primary && booking.primary_item.is_none();
        if is_first_primary {
            booking.primary_item = Some(classified.display_name);
        } else {
            // Extra primaries degrade to add-ons rather than being
            // dropped; this domain has at most one vessel per booking.
            let quantity = flexible_u32(item.get("qty")).unwrap_or(1);
            let price = flexible_f64(item.get("price"))
                .or_else(|| flexible_f64(item.get("total")))
                .unwrap_or(0.0);
            booking
                .add_ons
                .push(AddOnItem::new(classified.display_name, quantity, price));
        }
    }
}

fn apply_epoch_schedule(booking: &mut Booking, body: &JsonValue, tz: Tz) {
    if let Some(start) = epoch_at(body, &["start_date"]) {
        let local = start.with_timezone(&tz);
        booking.schedule.booking_date = Some(local.date_naive());
        booking.schedule.start_time = Some(local.time());
    }
    if let Some(end) = epoch_at(body, &["end_date"]) {
        booking.schedule.finish_time = Some(end.with_timezone(&tz).time());
    }
    booking.schedule.created_at = epoch_at(body, &["created_date"]);
}

fn value_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn str_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    value_at(value, path)?.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn epoch_at(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    let raw = value_at(value, path)?;
    let secs = raw
        .as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse::<i64>().ok()))?;
    Utc.timestamp_opt(secs, 0).single()
}

fn flexible_f64(value: Option<&JsonValue>) -> Option<f64> {
    let value = value?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

fn flexible_u32(value: Option<&JsonValue>) -> Option<u32> {
    let value = value?;
    value
        .as_u64()
        .map(|v| v as u32)
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u32>().ok()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PolledPage {
    pub records: Vec<JsonValue>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Inbound poll source: returns booking records for a date range,
/// one page at a time. The date range is keyed on
/// creation/activity date, not code; codes of missing records are
/// by definition unknown locally.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_page(
        &self,
        range: DateRange,
        cursor: Option<&str>,
    ) -> Result<PolledPage, PollError>;
}

/// Runaway-cursor guard; no legitimate lookback window pages this deep.
const MAX_POLL_PAGES: usize = 500;

/// Follows the pagination cursor to exhaustion before returning, as
/// reconciliation must never run against a partial external view.
pub async fn fetch_all_pages(
    source: &dyn PollSource,
    range: DateRange,
) -> Result<Vec<JsonValue>, PollError> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_POLL_PAGES {
        let page = source.fetch_page(range, cursor.as_deref()).await?;
        records.extend(page.records);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(records),
        }
    }
    Err(PollError::Message(format!(
        "poll source did not exhaust its cursor within {MAX_POLL_PAGES} pages"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Australia::Sydney;
    use serde_json::json;

    fn rules() -> CatalogRules {
        CatalogRules::default()
    }

    #[test]
    fn webhook_shape_with_index_wrapped_items() {
        let raw = json!({
            "booking": {
                "code": "X1",
                "status_id": "PEND",
                "customer": {"name": "Ada Lovelace", "phone": "+61400000000"},
                "order": {
                    "total": "310.00",
                    "items": {
                        "2": {"sku": "kayak", "qty": "2", "total": "30.00"},
                        "1": {"sku": "half-day-bbq-boat", "qty": 1, "total": 280.0}
                    }
                }
            }
        });
        let booking = normalize(&raw, PayloadShape::Webhook, &rules(), Sydney).unwrap();
        assert_eq!(booking.code, "X1");
        assert_eq!(booking.status, Status::new("PEND"));
        assert_eq!(booking.customer.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(booking.total_amount, Some(310.0));
        // Numeric keys were unwrapped in index order: the boat is the
        // primary item, the kayak an add-on.
        assert_eq!(booking.primary_item.as_deref(), Some("Half Day Bbq Boat"));
        assert_eq!(booking.add_ons, vec![AddOnItem::new("Kayak", 2, 30.0)]);
    }

    #[test]
    fn webhook_shape_with_plain_array_items() {
        let raw = json!({
            "booking": {
                "code": "X2",
                "status_id": "PAID",
                "order": {"items": [{"sku": "polycraft-45", "qty": 1}]}
            }
        });
        let booking = normalize(&raw, PayloadShape::Webhook, &rules(), Sydney).unwrap();
        assert_eq!(booking.primary_item.as_deref(), Some("Polycraft 45"));
        assert!(booking.add_ons.is_empty());
        assert!(booking.customer.name.is_none());
    }

    #[test]
    fn epoch_timestamps_convert_to_civil_timezone() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 23, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 11, 3, 0, 0).unwrap();
        let raw = json!({
            "booking": {
                "code": "X3",
                "status_id": "PEND",
                "start_date": start.timestamp(),
                "end_date": end.timestamp(),
                "created_date": start.timestamp()
            }
        });
        let booking = normalize(&raw, PayloadShape::Webhook, &rules(), Sydney).unwrap();
        // Sydney is UTC+11 in January.
        assert_eq!(
            booking.schedule.booking_date,
            Some(NaiveDate::from_ymd_opt(2026, 1, 11).unwrap())
        );
        assert_eq!(
            booking.schedule.start_time,
            Some(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
        );
        assert_eq!(
            booking.schedule.finish_time,
            Some(NaiveTime::from_hms_opt(14, 0, 0).unwrap())
        );
        assert_eq!(booking.schedule.created_at, Some(start));
    }

    #[test]
    fn flat_shape_treats_items_as_one_opaque_primary() {
        let raw = json!({
            "Booking Code": "F1",
            "Status": "HOLD",
            "Customer Name": "Grace Hopper",
            "Booking Items": "Full Day BBQ Pontoon",
            "Booking Date": "2026-02-14",
            "Start Time": "09:30",
            "Total Amount": "420.00"
        });
        let booking = normalize(&raw, PayloadShape::FlatFields, &rules(), Sydney).unwrap();
        assert_eq!(booking.primary_item.as_deref(), Some("Full Day BBQ Pontoon"));
        assert!(booking.add_ons.is_empty());
        assert_eq!(booking.total_amount, Some(420.0));
        assert_eq!(
            booking.schedule.start_time,
            Some(NaiveTime::from_hms_opt(9, 30, 0).unwrap())
        );
        // Absent fields surface as absent, not as defaults.
        assert!(booking.customer.email.is_none());
    }

    #[test]
    fn polled_shape_coerces_single_item_object_to_list() {
        let single = json!({
            "booking_id": "P1",
            "status_id": "PAID",
            "order": {"total": 150.0, "items": {"item": {"sku": "boat-half-day", "qty": 1}}}
        });
        let booking = normalize(&single, PayloadShape::PolledRecord, &rules(), Sydney).unwrap();
        assert_eq!(booking.primary_item.as_deref(), Some("Boat Half Day"));

        let many = json!({
            "booking_id": "P2",
            "status_id": "PAID",
            "order": {"items": {"item": [
                {"sku": "boat-half-day", "qty": 1},
                {"sku": "esky", "qty": 1, "price": 10.0}
            ]}}
        });
        let booking = normalize(&many, PayloadShape::PolledRecord, &rules(), Sydney).unwrap();
        assert_eq!(booking.primary_item.as_deref(), Some("Boat Half Day"));
        assert_eq!(booking.add_ons, vec![AddOnItem::new("Esky", 1, 10.0)]);
    }

    #[test]
    fn missing_identifiers_are_errors_not_defaults() {
        let no_code = json!({"booking": {"status_id": "PEND"}});
        assert!(matches!(
            normalize(&no_code, PayloadShape::Webhook, &rules(), Sydney),
            Err(NormalizeError::MissingCode)
        ));
        let no_status = json!({"Booking Code": "F9"});
        assert!(matches!(
            normalize(&no_status, PayloadShape::FlatFields, &rules(), Sydney),
            Err(NormalizeError::MissingStatus)
        ));
        assert!(matches!(
            normalize(&json!([1, 2]), PayloadShape::Webhook, &rules(), Sydney),
            Err(NormalizeError::NotAnObject)
        ));
    }

    #[test]
    fn shape_detection_probes_distinguishing_keys() {
        assert_eq!(
            detect_shape(&json!({"booking": {"code": "X"}})),
            PayloadShape::Webhook
        );
        assert_eq!(
            detect_shape(&json!({"Booking Code": "X"})),
            PayloadShape::FlatFields
        );
        assert_eq!(
            detect_shape(&json!({"booking_id": "X"})),
            PayloadShape::PolledRecord
        );
    }

    struct PagedSource {
        pages: Vec<PolledPage>,
    }

    #[async_trait]
    impl PollSource for PagedSource {
        async fn fetch_page(
            &self,
            _range: DateRange,
            cursor: Option<&str>,
        ) -> Result<PolledPage, PollError> {
            let index = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0));
            self.pages
                .get(index)
                .cloned()
                .ok_or_else(|| PollError::Message(format!("no page at cursor {index}")))
        }
    }

    #[tokio::test]
    async fn poll_pagination_is_followed_to_exhaustion() {
        let source = PagedSource {
            pages: vec![
                PolledPage {
                    records: vec![json!({"booking_id": "A"}), json!({"booking_id": "B"})],
                    next_cursor: Some("1".to_string()),
                },
                PolledPage {
                    records: vec![json!({"booking_id": "C"})],
                    next_cursor: None,
                },
            ],
        };
        let range = DateRange {
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        };
        let records = fetch_all_pages(&source, range).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["booking_id"], "C");
    }
}
