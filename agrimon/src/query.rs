//! Read-side helpers: zero-based pagination and time-range filtering.

use crate::errors::{Error, FieldError, Result};
use crate::model::Page;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingLimits {
    pub default_per_page: usize,
    pub max_per_page: usize,
}

impl Default for PagingLimits {
    fn default() -> Self {
        Self {
            default_per_page: 20,
            max_per_page: 100,
        }
    }
}

/// A resolved page request. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    /// Oversized `per_page` is clamped to the maximum; zero is rejected.
    pub fn new(page: Option<usize>, per_page: Option<usize>, limits: PagingLimits) -> Result<Self> {
        let per_page = per_page.unwrap_or(limits.default_per_page);
        if per_page == 0 {
            return Err(Error::invalid_fields(vec![FieldError::new(
                "per_page",
                "must be at least 1",
            )]));
        }
        Ok(Self {
            page: page.unwrap_or(0),
            per_page: per_page.min(limits.max_per_page),
        })
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.per_page)
    }
}

/// Inclusive time window; a missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(Error::invalid_fields(vec![FieldError::new(
                    "from",
                    format!("{} is after to={}", f.to_rfc3339(), t.to_rfc3339()),
                )]));
            }
        }
        Ok(Self { from, to })
    }

    /// Parses raw query bounds, reporting each malformed one.
    pub fn parse(
        from_field: &str,
        from: Option<&str>,
        to_field: &str,
        to: Option<&str>,
    ) -> Result<Self> {
        let mut errors = Vec::new();
        let from = from.and_then(|raw| {
            parse_bound(raw, false)
                .map_err(|m| errors.push(FieldError::new(from_field, m)))
                .ok()
        });
        let to = to.and_then(|raw| {
            parse_bound(raw, true)
                .map_err(|m| errors.push(FieldError::new(to_field, m)))
                .ok()
        });
        if !errors.is_empty() {
            return Err(Error::invalid_fields(errors));
        }
        Self::new(from, to)
    }

    pub fn open() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |f| ts >= f) && self.to.map_or(true, |t| ts <= t)
    }

    /// Sub-slice of `items` (sorted ascending by `key`) that falls in range.
    pub fn slice<'a, T>(&self, items: &'a [T], key: impl Fn(&T) -> DateTime<Utc>) -> &'a [T] {
        let start = match self.from {
            Some(f) => items.partition_point(|i| key(i) < f),
            None => 0,
        };
        let end = match self.to {
            Some(t) => items.partition_point(|i| key(i) <= t),
            None => items.len(),
        };
        if start >= end {
            &[]
        } else {
            &items[start..end]
        }
    }
}

/// Accepts an RFC 3339 instant or a `YYYY-MM-DD` date. A date used as an
/// upper bound covers the whole day.
pub fn parse_bound(raw: &str, end_of_day: bool) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("'{}' is not an RFC 3339 timestamp or YYYY-MM-DD date", raw))?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| "invalid time of day".to_string())?;
    Ok(date.and_time(time).and_utc())
}

/// Items `[page*per_page, page*per_page + per_page)` of `items`.
pub fn paginate<T: Clone>(items: &[T], request: PageRequest) -> Page<T> {
    let start = request.offset().min(items.len());
    let end = start.saturating_add(request.per_page).min(items.len());
    Page {
        data: items[start..end].to_vec(),
        page: request.page,
        per_page: request.per_page,
        total_count: items.len(),
    }
}
