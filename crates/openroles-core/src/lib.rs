//! Core listing model, validation and change detection for openroles.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "openroles-core";

/// A listing as produced by a source adapter for the current cycle.
///
/// Required fields default to empty strings on deserialization so that a
/// malformed listing reaches the validator instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservedListing {
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_mid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_high: Option<f64>,
    /// Source-specific extras kept verbatim (e.g. `jobFamily`, `validThrough`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, JsonValue>,
}

impl ObservedListing {
    pub fn new(
        source: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            source: source.into(),
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Durable lifecycle state for one `(source, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    #[serde(flatten)]
    pub listing: ObservedListing,
    pub open: bool,
    pub found_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reopened_at: Option<DateTime<Utc>>,
    /// Opaque reference owned by the persistence gateway.
    #[serde(default)]
    pub storage_key: Option<String>,
}

impl PersistedRecord {
    /// Record for a listing seen for the first time.
    pub fn first_seen(listing: ObservedListing, now: DateTime<Utc>) -> Self {
        Self {
            listing,
            open: true,
            found_at: now,
            last_seen_at: now,
            closed_at: None,
            reopened_at: None,
            storage_key: None,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.listing.external_id
    }

    pub fn source(&self) -> &str {
        &self.listing.source
    }

    /// Replace every descriptive field with the observed values. Bookkeeping
    /// (`found_at`, `closed_at`, `reopened_at`, `storage_key`) is left alone.
    pub fn merge_observed(&mut self, observed: ObservedListing) {
        self.listing = observed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Reopened,
    Updated,
    Unchanged,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Reopened => "reopened",
            Classification::Updated => "updated",
            Classification::Unchanged => "unchanged",
        }
    }

    /// Unchanged records only need their liveness timestamp refreshed.
    pub fn is_touch_only(&self) -> bool {
        matches!(self, Classification::Unchanged)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upsert {
    pub classification: Classification,
    pub record: PersistedRecord,
}

/// Output of one reconciliation pass. Nothing in here has been written yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Changeset {
    pub source: String,
    pub computed_at: DateTime<Utc>,
    pub upserts: Vec<Upsert>,
    pub closures: Vec<PersistedRecord>,
    pub errors: Vec<ValidationError>,
}

impl Changeset {
    pub fn empty(source: impl Into<String>, computed_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            computed_at,
            upserts: Vec::new(),
            closures: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts {
            closed: self.closures.len(),
            invalid: self.errors.len(),
            ..Default::default()
        };
        for upsert in &self.upserts {
            match upsert.classification {
                Classification::New => counts.added += 1,
                Classification::Reopened => counts.reopened += 1,
                Classification::Updated => counts.updated += 1,
                Classification::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }

    /// True when the pass moved any lifecycle state beyond liveness refreshes.
    pub fn has_lifecycle_changes(&self) -> bool {
        !self.closures.is_empty()
            || self
                .upserts
                .iter()
                .any(|u| u.classification != Classification::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub reopened: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub closed: usize,
    pub invalid: usize,
}

/// Per-item rejection of an observed listing. Never retried.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("missing required listing field `{field}`")]
    MissingField {
        field: &'static str,
        listing: Box<ObservedListing>,
    },
    #[error("listing `{external_id}` is from source `{found}`, expected `{expected}`")]
    SourceMismatch {
        expected: String,
        found: String,
        external_id: String,
        listing: Box<ObservedListing>,
    },
    #[error("external_id `{external_id}` appears more than once in one batch")]
    DuplicateExternalId {
        external_id: String,
        listing: Box<ObservedListing>,
    },
}

impl ValidationError {
    pub fn listing(&self) -> &ObservedListing {
        match self {
            ValidationError::MissingField { listing, .. }
            | ValidationError::SourceMismatch { listing, .. }
            | ValidationError::DuplicateExternalId { listing, .. } => listing,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.listing().external_id
    }
}

const REQUIRED_FIELDS: [&str; 4] = ["external_id", "title", "url", "source"];

fn required_value<'a>(listing: &'a ObservedListing, field: &str) -> &'a str {
    match field {
        "external_id" => &listing.external_id,
        "title" => &listing.title,
        "url" => &listing.url,
        _ => &listing.source,
    }
}

/// Reject listings missing any required field. Empty strings count as missing.
pub fn validate(listing: ObservedListing) -> Result<ObservedListing, ValidationError> {
    for field in REQUIRED_FIELDS {
        if required_value(&listing, field).is_empty() {
            return Err(ValidationError::MissingField {
                field,
                listing: Box::new(listing),
            });
        }
    }
    Ok(listing)
}

/// [`validate`] plus a check that the listing belongs to `source`.
pub fn validate_for_source(
    listing: ObservedListing,
    source: &str,
) -> Result<ObservedListing, ValidationError> {
    let listing = validate(listing)?;
    if listing.source != source {
        return Err(ValidationError::SourceMismatch {
            expected: source.to_string(),
            found: listing.source.clone(),
            external_id: listing.external_id.clone(),
            listing: Box::new(listing),
        });
    }
    Ok(listing)
}

/// A field whose change makes a listing count as Updated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignificantField {
    Title,
    Url,
    Description,
    Location,
    EmploymentType,
    PostedDate,
    Department,
    CompensationLow,
    CompensationMid,
    CompensationHigh,
    /// A key inside [`ObservedListing::attributes`], compared structurally.
    Attribute(String),
}

impl SignificantField {
    pub fn defaults() -> Vec<SignificantField> {
        vec![
            SignificantField::Title,
            SignificantField::Url,
            SignificantField::Description,
            SignificantField::Location,
            SignificantField::EmploymentType,
            SignificantField::PostedDate,
            SignificantField::Department,
            SignificantField::CompensationLow,
            SignificantField::CompensationMid,
            SignificantField::CompensationHigh,
        ]
    }

    fn differs(&self, a: &ObservedListing, b: &ObservedListing) -> bool {
        match self {
            SignificantField::Title => a.title != b.title,
            SignificantField::Url => a.url != b.url,
            SignificantField::Description => a.description != b.description,
            SignificantField::Location => a.location != b.location,
            SignificantField::EmploymentType => a.employment_type != b.employment_type,
            SignificantField::PostedDate => a.posted_date != b.posted_date,
            SignificantField::Department => a.department != b.department,
            SignificantField::CompensationLow => {
                !same_amount(a.compensation_low, b.compensation_low)
            }
            SignificantField::CompensationMid => {
                !same_amount(a.compensation_mid, b.compensation_mid)
            }
            SignificantField::CompensationHigh => {
                !same_amount(a.compensation_high, b.compensation_high)
            }
            SignificantField::Attribute(key) => a.attributes.get(key) != b.attributes.get(key),
        }
    }
}

// NaN must compare equal to itself or a listing carrying it would never settle.
fn same_amount(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
        (None, None) => true,
        _ => false,
    }
}

impl fmt::Display for SignificantField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignificantField::Title => f.write_str("title"),
            SignificantField::Url => f.write_str("url"),
            SignificantField::Description => f.write_str("description"),
            SignificantField::Location => f.write_str("location"),
            SignificantField::EmploymentType => f.write_str("employment_type"),
            SignificantField::PostedDate => f.write_str("posted_date"),
            SignificantField::Department => f.write_str("department"),
            SignificantField::CompensationLow => f.write_str("compensation_low"),
            SignificantField::CompensationMid => f.write_str("compensation_mid"),
            SignificantField::CompensationHigh => f.write_str("compensation_high"),
            SignificantField::Attribute(key) => write!(f, "attr:{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown significant field `{0}`")]
pub struct UnknownFieldError(pub String);

impl FromStr for SignificantField {
    type Err = UnknownFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix("attr:") {
            let key = key.trim();
            if key.is_empty() {
                return Err(UnknownFieldError(s.to_string()));
            }
            return Ok(SignificantField::Attribute(key.to_string()));
        }
        let field = match s {
            "title" => SignificantField::Title,
            "url" => SignificantField::Url,
            "description" => SignificantField::Description,
            "location" => SignificantField::Location,
            "employment_type" | "employmentType" => SignificantField::EmploymentType,
            "posted_date" | "postedDate" => SignificantField::PostedDate,
            "department" => SignificantField::Department,
            "compensation_low" | "compensationLow" => SignificantField::CompensationLow,
            "compensation_mid" | "compensationMid" => SignificantField::CompensationMid,
            "compensation_high" | "compensationHigh" => SignificantField::CompensationHigh,
            other => return Err(UnknownFieldError(other.to_string())),
        };
        Ok(field)
    }
}

/// Parse a comma separated field list such as `title,url,attr:jobFamily`.
pub fn parse_field_list(input: &str) -> Result<Vec<SignificantField>, UnknownFieldError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SignificantField::from_str)
        .collect()
}

/// Decides whether a persisted record and a fresh observation differ in any
/// significant field. Values are compared as given; no normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetector {
    fields: Vec<SignificantField>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            fields: SignificantField::defaults(),
        }
    }
}

impl ChangeDetector {
    pub fn new(fields: Vec<SignificantField>) -> Self {
        let mut unique = Vec::with_capacity(fields.len());
        for field in fields {
            if !unique.contains(&field) {
                unique.push(field);
            }
        }
        Self { fields: unique }
    }

    pub fn fields(&self) -> &[SignificantField] {
        &self.fields
    }

    pub fn has_changed(&self, existing: &PersistedRecord, observed: &ObservedListing) -> bool {
        self.fields
            .iter()
            .any(|field| field.differs(&existing.listing, observed))
    }

    pub fn changed_fields(
        &self,
        existing: &PersistedRecord,
        observed: &ObservedListing,
    ) -> Vec<&SignificantField> {
        self.fields
            .iter()
            .filter(|field| field.differs(&existing.listing, observed))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn listing(id: &str, title: &str) -> ObservedListing {
        ObservedListing::new("acme", id, title, format!("https://acme.test/jobs/{id}"))
    }

    #[test]
    fn valid_listing_passes_through_unchanged() {
        let l = listing("J1", "Engineer");
        assert_eq!(validate(l.clone()).unwrap(), l);
    }

    #[test]
    fn each_required_field_is_enforced() {
        let cases: [(&str, fn(&mut ObservedListing)); 4] = [
            ("external_id", |l| l.external_id.clear()),
            ("title", |l| l.title.clear()),
            ("url", |l| l.url.clear()),
            ("source", |l| l.source.clear()),
        ];
        for (expected, blank) in cases {
            let mut l = listing("J1", "Engineer");
            blank(&mut l);
            match validate(l) {
                Err(ValidationError::MissingField { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected missing {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn validation_error_keeps_offending_listing() {
        let mut l = listing("J9", "Engineer");
        l.url.clear();
        let err = validate(l).unwrap_err();
        assert_eq!(err.external_id(), "J9");
        assert_eq!(err.listing().title, "Engineer");
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn listing_from_other_source_is_rejected() {
        let err = validate_for_source(listing("J1", "Engineer"), "globex").unwrap_err();
        assert!(matches!(err, ValidationError::SourceMismatch { ref found, .. } if found == "acme"));
    }

    #[test]
    fn missing_json_fields_deserialize_then_fail_validation() {
        let l: ObservedListing = serde_json::from_value(json!({
            "external_id": "J1",
            "source": "acme",
            "url": "https://acme.test/jobs/J1"
        }))
        .unwrap();
        assert!(matches!(
            validate(l),
            Err(ValidationError::MissingField { field: "title", .. })
        ));
    }

    #[test]
    fn title_change_is_significant() {
        let detector = ChangeDetector::default();
        let record = PersistedRecord::first_seen(listing("A1", "Engineer"), ts());
        assert!(detector.has_changed(&record, &listing("A1", "Senior Engineer")));
        assert_eq!(
            detector.changed_fields(&record, &listing("A1", "Senior Engineer")),
            vec![&SignificantField::Title]
        );
    }

    #[test]
    fn bookkeeping_fields_are_ignored() {
        let detector = ChangeDetector::default();
        let mut record = PersistedRecord::first_seen(listing("A1", "Engineer"), ts());
        record.last_seen_at = ts() + Duration::days(3);
        record.storage_key = Some("doc-1".into());
        assert!(!detector.has_changed(&record, &listing("A1", "Engineer")));
    }

    #[test]
    fn optional_field_appearing_counts_as_change() {
        let detector = ChangeDetector::default();
        let record = PersistedRecord::first_seen(listing("A1", "Engineer"), ts());
        let mut observed = listing("A1", "Engineer");
        observed.location = Some("Austin, TX".into());
        assert!(detector.has_changed(&record, &observed));
    }

    #[test]
    fn comparison_is_symmetric() {
        let detector = ChangeDetector::default();
        let mut a = listing("A1", "Engineer");
        a.compensation_low = Some(100_000.0);
        let mut b = listing("A1", "Engineer");
        b.compensation_low = Some(120_000.0);

        let ab = detector.has_changed(&PersistedRecord::first_seen(a.clone(), ts()), &b);
        let ba = detector.has_changed(&PersistedRecord::first_seen(b, ts()), &a);
        assert!(ab);
        assert_eq!(ab, ba);
    }

    #[test]
    fn nan_compensation_settles() {
        let detector = ChangeDetector::default();
        let mut l = listing("A1", "Engineer");
        l.compensation_mid = Some(f64::NAN);
        let record = PersistedRecord::first_seen(l.clone(), ts());
        assert!(!detector.has_changed(&record, &l));
    }

    #[test]
    fn attributes_only_count_when_configured() {
        let mut before = listing("A1", "Engineer");
        before
            .attributes
            .insert("jobFamily".into(), json!({"name": "Software", "codes": [1, 2]}));
        let mut after = listing("A1", "Engineer");
        after
            .attributes
            .insert("jobFamily".into(), json!({"codes": [2, 1], "name": "Software"}));
        let record = PersistedRecord::first_seen(before, ts());

        assert!(!ChangeDetector::default().has_changed(&record, &after));

        let mut fields = SignificantField::defaults();
        fields.push(SignificantField::Attribute("jobFamily".into()));
        let detector = ChangeDetector::new(fields);
        assert!(detector.has_changed(&record, &after));

        let mut same = after.clone();
        same.attributes
            .insert("jobFamily".into(), json!({"codes": [1, 2], "name": "Software"}));
        assert!(!detector.has_changed(&record, &same));
    }

    #[test]
    fn field_list_parses_both_spellings_and_attributes() {
        let fields = parse_field_list("title, employmentType,compensation_high, attr:validThrough,").unwrap();
        assert_eq!(
            fields,
            vec![
                SignificantField::Title,
                SignificantField::EmploymentType,
                SignificantField::CompensationHigh,
                SignificantField::Attribute("validThrough".into()),
            ]
        );
        assert_eq!(fields[3].to_string(), "attr:validThrough");
        assert_eq!(
            parse_field_list("title,salary").unwrap_err(),
            UnknownFieldError("salary".into())
        );
        assert!(parse_field_list("attr:").is_err());
    }

    #[test]
    fn detector_drops_duplicate_fields() {
        let detector = ChangeDetector::new(vec![SignificantField::Url, SignificantField::Url]);
        assert_eq!(detector.fields(), &[SignificantField::Url]);
    }

    #[test]
    fn persisted_record_round_trips_through_flattened_json() {
        let mut record = PersistedRecord::first_seen(listing("J1", "Engineer"), ts());
        record.listing.attributes.insert("jobFamily".into(), json!("Software"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["external_id"], "J1");
        assert_eq!(value["open"], true);
        let back: PersistedRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn counts_follow_classifications() {
        let mut cs = Changeset::empty("acme", ts());
        for (id, class) in [
            ("A", Classification::New),
            ("B", Classification::Updated),
            ("C", Classification::Unchanged),
        ] {
            cs.upserts.push(Upsert {
                classification: class,
                record: PersistedRecord::first_seen(listing(id, "t"), ts()),
            });
        }
        cs.closures
            .push(PersistedRecord::first_seen(listing("D", "t"), ts()));
        let counts = cs.counts();
        assert_eq!(
            counts,
            ChangeCounts {
                added: 1,
                reopened: 0,
                updated: 1,
                unchanged: 1,
                closed: 1,
                invalid: 0
            }
        );
        assert!(cs.has_lifecycle_changes());

        let mut quiet = Changeset::empty("acme", ts());
        quiet.upserts.push(Upsert {
            classification: Classification::Unchanged,
            record: PersistedRecord::first_seen(listing("C", "t"), ts()),
        });
        assert!(!quiet.has_lifecycle_changes());
    }
}
