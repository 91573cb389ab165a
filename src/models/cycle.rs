use serde::{Deserialize, Serialize};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

use crate::models::RewardsError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CycleKind {
    Weekly,
    Quarterly,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Weekly => "weekly",
            CycleKind::Quarterly => "quarterly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "weekly" | "week" => Some(CycleKind::Weekly),
            "quarterly" | "quarter" => Some(CycleKind::Quarterly),
            _ => None,
        }
    }
}

/// Comparable identifier of a cycle, derived from the last day of its window.
/// Two settlement attempts for the same window always produce the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct CycleId(String);

impl CycleId {
    pub fn weekly(last_day: NaiveDate) -> Self {
        CycleId(format!("weekly_{}", last_day.format("%Y-%m-%d")))
    }

    pub fn quarterly(label: &QuarterLabel) -> Self {
        CycleId(format!("quarterly_{}", label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A half-open `[start, end)` interval of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleWindow {
    pub id: CycleId,
    pub kind: CycleKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    /// The final instant inside the window (`23:59:59.999` of its last day).
    pub fn last_instant(&self) -> DateTime<Utc> {
        self.end - Duration::milliseconds(1)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    pub fn number(&self) -> u32 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }

    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            1 => Some(Quarter::Q1),
            2 => Some(Quarter::Q2),
            3 => Some(Quarter::Q3),
            4 => Some(Quarter::Q4),
            _ => None,
        }
    }

    pub fn from_month(month: u32) -> Self {
        match month {
            1..=3 => Quarter::Q1,
            4..=6 => Quarter::Q2,
            7..=9 => Quarter::Q3,
            _ => Quarter::Q4,
        }
    }

    pub fn first_month(&self) -> u32 {
        (self.number() - 1) * 3 + 1
    }

    pub fn last_month(&self) -> u32 {
        self.first_month() + 2
    }
}

/// Calendar quarter label, written `YYYY-Qn`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuarterLabel {
    pub year: i32,
    pub quarter: Quarter,
}

impl QuarterLabel {
    pub fn new(year: i32, quarter: Quarter) -> Self {
        Self { year, quarter }
    }

    pub fn containing_date(date: NaiveDate) -> Self {
        Self::new(date.year(), Quarter::from_month(date.month()))
    }

    pub fn next(&self) -> Self {
        match self.quarter {
            Quarter::Q4 => Self::new(self.year + 1, Quarter::Q1),
            q => Self::new(self.year, Quarter::from_number(q.number() + 1).unwrap_or(Quarter::Q4)),
        }
    }

    pub fn previous(&self) -> Self {
        match self.quarter {
            Quarter::Q1 => Self::new(self.year - 1, Quarter::Q4),
            q => Self::new(self.year, Quarter::from_number(q.number() - 1).unwrap_or(Quarter::Q1)),
        }
    }

    /// First calendar day of the quarter.
    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.quarter.first_month(), 1)
    }

    /// First calendar day after the quarter.
    pub fn day_after_end(&self) -> Option<NaiveDate> {
        self.next().first_day()
    }
}

impl fmt::Display for QuarterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-Q{}", self.year, self.quarter.number())
    }
}

impl FromStr for QuarterLabel {
    type Err = RewardsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RewardsError::InvalidQuarterLabel(s.to_string());
        let (year, quarter) = s.trim().split_once("-Q").ok_or_else(invalid)?;
        if year.len() != 4 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let quarter = quarter
            .parse::<u32>()
            .ok()
            .and_then(Quarter::from_number)
            .ok_or_else(invalid)?;
        Ok(Self::new(year, quarter))
    }
}
