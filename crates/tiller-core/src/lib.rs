//! Core booking domain model for Tiller: status codes, transition
//! classification, add-on line items, and catalog item classification.
//! Everything in this crate is pure and total; I/O lives elsewhere.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tiller-core";

/// Booking status code from the external booking engine.
///
/// The code set is open: the engine may introduce new codes at any
/// time, so unknown values are preserved verbatim rather than
/// rejected. Codes are normalized to trimmed upper-case on entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(String);

impl Status {
    pub const PENDING: &'static str = "PEND";
    pub const HOLD: &'static str = "HOLD";
    pub const WAITING: &'static str = "WAIT";
    pub const PARTIAL: &'static str = "PART";
    pub const PAID: &'static str = "PAID";
    pub const VOID: &'static str = "VOID";
    pub const STOPPED: &'static str = "STOP";

    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is(&self, code: &str) -> bool {
        self.0 == code
    }

    pub fn is_paid(&self) -> bool {
        self.is(Self::PAID)
    }

    /// Canonical-row selection rank. Unknown codes rank lowest so a
    /// recognized row always wins over one carrying a novel code.
    pub fn rank(&self) -> u8 {
        match self.0.as_str() {
            Self::PAID => 4,
            Self::PARTIAL => 3,
            Self::WAITING | Self::HOLD => 2,
            Self::PENDING => 1,
            _ => 0,
        }
    }

    fn is_pre_paid(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::PENDING | Self::HOLD | Self::WAITING | Self::PARTIAL
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Customer-notification template selected for a significant
/// status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Cancellation,
    PaymentConfirmed,
    PartialPayment,
}

/// Decides whether a status transition warrants a customer
/// notification and, if so, which template applies.
///
/// Rules are checked in strict priority order. Cancellation is
/// checked before the same-status short-circuit on purpose: a
/// re-delivered VOID -> VOID must still fire.
pub fn notification_for(old: &Status, new: &Status) -> Option<NotificationKind> {
    if new.is(Status::VOID) || new.is(Status::STOPPED) {
        return Some(NotificationKind::Cancellation);
    }
    if new.is_paid() && old.is_pre_paid() {
        return Some(NotificationKind::PaymentConfirmed);
    }
    if old == new {
        return None;
    }
    // Internal triage moves among unpaid states; not customer-relevant.
    let lateral = matches!(
        (old.as_str(), new.as_str()),
        (Status::PENDING, Status::HOLD)
            | (Status::PENDING, Status::WAITING)
            | (Status::HOLD, Status::WAITING)
            | (Status::WAITING, Status::HOLD)
    );
    if lateral {
        return None;
    }
    if new.is(Status::PARTIAL)
        && matches!(
            old.as_str(),
            Status::PENDING | Status::HOLD | Status::WAITING
        )
    {
        return Some(NotificationKind::PartialPayment);
    }
    // Conservative default: never notify on transitions we do not
    // recognize, including anything involving novel status codes.
    None
}

pub fn is_significant(old: &Status, new: &Status) -> bool {
    notification_for(old, new).is_some()
}

/// One add-on line item. Semantically a set entry keyed by
/// [`normalize_name`]; display order is insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOnItem {
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

impl AddOnItem {
    pub fn new(name: impl Into<String>, quantity: u32, price: f64) -> Self {
        Self {
            name: name.into(),
            quantity,
            price,
        }
    }
}

/// Case-insensitive, whitespace-collapsed merge key for add-on names.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses the canonical add-on display string
/// (`"Item - $12.50, 2 x Other - $40.00"`) back into line items.
///
/// Entries that do not match the grammar are kept as name-only items
/// (quantity 1, price 0) instead of being dropped: upstream data is
/// not always well-formed and silent loss is worse than a degraded
/// parse.
pub fn parse_add_ons(display: &str) -> Vec<AddOnItem> {
    display
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> AddOnItem {
    let (quantity, rest) = split_quantity_prefix(entry);
    let (name, price) = split_price_suffix(rest);
    AddOnItem::new(name, quantity, price)
}

fn split_quantity_prefix(entry: &str) -> (u32, &str) {
    if let Some((count, rest)) = entry.split_once(" x ") {
        if let Ok(quantity) = count.trim().parse::<u32>() {
            if quantity >= 1 && !rest.is_empty() {
                return (quantity, rest);
            }
        }
    }
    (1, entry)
}

fn split_price_suffix(entry: &str) -> (&str, f64) {
    if let Some(idx) = entry.rfind(" - $") {
        let price_text = &entry[idx + 4..];
        if is_two_decimal_price(price_text) {
            if let Ok(price) = price_text.parse::<f64>() {
                return (&entry[..idx], price);
            }
        }
    }
    (entry, 0.0)
}

fn is_two_decimal_price(text: &str) -> bool {
    match text.split_once('.') {
        Some((whole, cents)) => {
            !whole.is_empty()
                && whole.chars().all(|c| c.is_ascii_digit())
                && cents.len() == 2
                && cents.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Formats line items into the canonical display string. Inverse of
/// [`parse_add_ons`] for well-formed item lists (quantity >= 1,
/// prices with at most two decimals).
pub fn format_add_ons(items: &[AddOnItem]) -> String {
    items
        .iter()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_entry(item: &AddOnItem) -> String {
    let mut out = String::new();
    if item.quantity > 1 {
        out.push_str(&format!("{} x ", item.quantity));
    }
    out.push_str(&item.name);
    if item.price != 0.0 {
        out.push_str(&format!(" - ${:.2}", item.price));
    }
    out
}

/// Merges two add-on lists keyed by normalized name.
///
/// The incoming side is authoritative for quantity and price of
/// items it reports; items only the existing side knows about are
/// preserved (they were added manually and the booking engine has
/// never heard of them). Order: existing items first, then incoming
/// items whose keys are new.
pub fn merge_add_ons(existing: &[AddOnItem], incoming: &[AddOnItem]) -> Vec<AddOnItem> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for item in existing {
        let key = normalize_name(&item.name);
        match incoming.iter().find(|inc| normalize_name(&inc.name) == key) {
            Some(inc) => merged.push(AddOnItem::new(item.name.clone(), inc.quantity, inc.price)),
            None => merged.push(item.clone()),
        }
    }
    for inc in incoming {
        let key = normalize_name(&inc.name);
        if !existing.iter().any(|item| normalize_name(&item.name) == key) {
            merged.push(inc.clone());
        }
    }
    merged
}

/// Whether a catalog item is the rentable unit or a supplementary
/// add-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Primary,
    Addon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedItem {
    pub kind: ItemKind,
    pub display_name: String,
}

/// Catalog classification ruleset: explicit category map, then SKU
/// substring heuristics, then the add-on default. Deployments
/// override the defaults via `catalog.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRules {
    /// Explicit category-id -> kind overrides, highest priority.
    #[serde(default)]
    pub category_kinds: BTreeMap<String, ItemKind>,
    /// Substrings of a normalized SKU that mark a primary item.
    #[serde(default)]
    pub primary_markers: Vec<String>,
    /// Normalized SKU -> human display name.
    #[serde(default)]
    pub display_names: BTreeMap<String, String>,
}

impl Default for CatalogRules {
    fn default() -> Self {
        let display_names = [
            ("kayak", "Kayak"),
            ("esky", "Esky"),
            ("baitpack", "Bait Pack"),
            ("fishingrod", "Fishing Rod"),
            ("icebag", "Ice Bag"),
        ]
        .into_iter()
        .map(|(sku, name)| (sku.to_string(), name.to_string()))
        .collect();

        Self {
            category_kinds: BTreeMap::new(),
            primary_markers: vec![
                "boat".to_string(),
                "polycraft".to_string(),
                "bbq".to_string(),
            ],
            display_names,
        }
    }
}

impl CatalogRules {
    /// Classifies a raw catalog SKU, optionally with its category id.
    ///
    /// Pure and total: malformed upstream input is routine on the
    /// ingestion hot path, so unknown values fall through to the
    /// lowest-confidence default instead of erroring.
    pub fn classify(&self, sku: &str, category_id: Option<&str>) -> ClassifiedItem {
        let display_name = self.display_name_for(sku);
        if let Some(kind) = category_id.and_then(|id| self.category_kinds.get(id.trim())) {
            return ClassifiedItem {
                kind: *kind,
                display_name,
            };
        }
        let normalized = normalize_sku(sku);
        let is_primary = self
            .primary_markers
            .iter()
            .any(|marker| normalized.contains(&normalize_sku(marker)));
        ClassifiedItem {
            kind: if is_primary {
                ItemKind::Primary
            } else {
                ItemKind::Addon
            },
            display_name,
        }
    }

    pub fn display_name_for(&self, sku: &str) -> String {
        let normalized = normalize_sku(sku);
        self.display_names
            .get(&normalized)
            .cloned()
            .unwrap_or_else(|| title_case_sku(sku))
    }
}

/// Lower-cases a SKU and strips separators so `"Bait-Pack"`,
/// `"bait_pack"` and `"baitpack"` all key the same entry.
pub fn normalize_sku(sku: &str) -> String {
    sku.chars()
        .filter(|c| !matches!(c, '-' | '_') && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn title_case_sku(sku: &str) -> String {
    sku.split(|c: char| matches!(c, '-' | '_') || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Customer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Booking schedule, normalized to the deployment's civil timezone
/// at the adapter boundary. `created_at` stays UTC because it is an
/// ordering key, not a display value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schedule {
    pub booking_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub finish_time: Option<NaiveTime>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Owned by internal staff scheduling; reconciliation must never
/// overwrite these (sticky fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StaffAssignments {
    pub onboarding_staff_id: Option<String>,
    pub deloading_staff_id: Option<String>,
}

/// Customer-notification lifecycle for a stored booking row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    #[default]
    Unsent,
    Sent,
}

/// Canonical booking record. One logical booking is keyed by `code`;
/// the storage layer may hold 0, 1 or more rows for it at any time.
/// Fields absent in a source stay `None` so downstream code can tell
/// "missing" apart from "empty".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub code: String,
    pub customer: Customer,
    pub status: Status,
    pub total_amount: Option<f64>,
    pub schedule: Schedule,
    pub primary_item: Option<String>,
    pub add_ons: Vec<AddOnItem>,
    pub staff: StaffAssignments,
}

impl Booking {
    pub fn new(code: impl Into<String>, status: Status) -> Self {
        Self {
            code: code.into(),
            customer: Customer::default(),
            status,
            total_amount: None,
            schedule: Schedule::default(),
            primary_item: None,
            add_ons: Vec::new(),
            staff: StaffAssignments::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(code: &str) -> Status {
        Status::new(code)
    }

    #[test]
    fn status_codes_normalize_and_preserve_unknowns() {
        assert_eq!(s(" paid ").as_str(), "PAID");
        assert_eq!(s("XFER").as_str(), "XFER");
        assert_eq!(s("XFER").rank(), 0);
        assert_eq!(s("PAID").rank(), 4);
        assert_eq!(s("WAIT").rank(), s("HOLD").rank());
    }

    #[test]
    fn significance_truth_table() {
        assert!(!is_significant(&s("PEND"), &s("HOLD")));
        assert!(is_significant(&s("PART"), &s("VOID")));
        assert!(!is_significant(&s("PAID"), &s("PAID")));
        assert!(is_significant(&s("PEND"), &s("PART")));
        assert!(!is_significant(&s("HOLD"), &s("WAIT")));
        assert!(is_significant(&s("WAIT"), &s("PAID")));
    }

    #[test]
    fn cancellation_fires_even_on_same_status_redelivery() {
        assert_eq!(
            notification_for(&s("VOID"), &s("VOID")),
            Some(NotificationKind::Cancellation)
        );
        assert_eq!(
            notification_for(&s("PAID"), &s("STOP")),
            Some(NotificationKind::Cancellation)
        );
    }

    #[test]
    fn template_selection_matches_transition() {
        assert_eq!(
            notification_for(&s("HOLD"), &s("PAID")),
            Some(NotificationKind::PaymentConfirmed)
        );
        assert_eq!(
            notification_for(&s("WAIT"), &s("PART")),
            Some(NotificationKind::PartialPayment)
        );
        // Unrecognized codes never notify.
        assert_eq!(notification_for(&s("PEND"), &s("XFER")), None);
        assert_eq!(notification_for(&s("PART"), &s("PAID")).is_some(), true);
    }

    #[test]
    fn add_on_round_trip() {
        let items = vec![
            AddOnItem::new("Kayak", 1, 12.5),
            AddOnItem::new("Bait Pack", 2, 40.0),
            AddOnItem::new("Life Jacket", 3, 0.0),
        ];
        let display = format_add_ons(&items);
        assert_eq!(display, "Kayak - $12.50, 2 x Bait Pack - $40.00, 3 x Life Jacket");
        assert_eq!(parse_add_ons(&display), items);
        assert_eq!(format_add_ons(&parse_add_ons(&display)), display);
    }

    #[test]
    fn malformed_entries_degrade_to_name_only() {
        let parsed = parse_add_ons("Kayak - $12.50, - $oops, x x Rod");
        assert_eq!(
            parsed,
            vec![
                AddOnItem::new("Kayak", 1, 12.5),
                AddOnItem::new("- $oops", 1, 0.0),
                AddOnItem::new("x x Rod", 1, 0.0),
            ]
        );
        assert!(parse_add_ons("").is_empty());
        assert!(parse_add_ons("  ,  ").is_empty());
    }

    #[test]
    fn merge_disjoint_keeps_both_in_order() {
        let a = vec![AddOnItem::new("Kayak", 1, 12.5)];
        let b = vec![AddOnItem::new("Esky", 1, 8.0)];
        let merged = merge_add_ons(&a, &b);
        assert_eq!(
            merged,
            vec![
                AddOnItem::new("Kayak", 1, 12.5),
                AddOnItem::new("Esky", 1, 8.0),
            ]
        );
    }

    #[test]
    fn merge_incoming_wins_on_shared_keys() {
        let existing = vec![
            AddOnItem::new("Kayak", 1, 12.5),
            AddOnItem::new("Deck Chair", 2, 6.0),
        ];
        let incoming = vec![AddOnItem::new("kayak", 3, 15.0)];
        let merged = merge_add_ons(&existing, &incoming);
        assert_eq!(
            merged,
            vec![
                AddOnItem::new("Kayak", 3, 15.0),
                AddOnItem::new("Deck Chair", 2, 6.0),
            ]
        );
    }

    #[test]
    fn classifier_heuristics_and_defaults() {
        let rules = CatalogRules::default();
        assert_eq!(rules.classify("half-day-bbq-boat", None).kind, ItemKind::Primary);
        assert_eq!(rules.classify("BBQ_Pontoon", None).kind, ItemKind::Primary);
        assert_eq!(rules.classify("kayak", None).kind, ItemKind::Addon);
        assert_eq!(rules.classify("kayak", None).display_name, "Kayak");
        // Title-case fallback for unknown SKUs.
        assert_eq!(
            rules.classify("premium_rod_holder", None).display_name,
            "Premium Rod Holder"
        );
        // Determinism.
        assert_eq!(rules.classify("kayak", None), rules.classify("kayak", None));
    }

    #[test]
    fn category_map_outranks_sku_heuristics() {
        let mut rules = CatalogRules::default();
        rules.category_kinds.insert("9".to_string(), ItemKind::Addon);
        // SKU says boat, category map says add-on; map wins.
        assert_eq!(rules.classify("boat-hire", Some("9")).kind, ItemKind::Addon);
        // Unmapped category falls back to the heuristics.
        assert_eq!(rules.classify("boat-hire", Some("1")).kind, ItemKind::Primary);
    }
}
