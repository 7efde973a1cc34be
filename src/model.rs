//! Core domain types for the reservation engine.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::Points;

/// Show identifier.
pub type ShowId = u32;

/// Show date (one performance of a show) identifier.
pub type ShowDateId = u32;

/// User identifier.
pub type UserId = u32;

/// Reservation identifier.
pub type ReservationId = u32;

/// Catalog category of a show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowCategory {
    Musical,
    Concert,
    Sports,
    Exhibition,
    Classic,
    Children,
    Theater,
    Etc,
}

impl ShowCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ShowCategory::Musical => "musical",
            ShowCategory::Concert => "concert",
            ShowCategory::Sports => "sports",
            ShowCategory::Exhibition => "exhibition",
            ShowCategory::Classic => "classic",
            ShowCategory::Children => "children",
            ShowCategory::Theater => "theater",
            ShowCategory::Etc => "etc",
        }
    }
}

impl fmt::Display for ShowCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown category or status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for ShowCategory {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "musical" => ShowCategory::Musical,
            "concert" => ShowCategory::Concert,
            "sports" => ShowCategory::Sports,
            "exhibition" => ShowCategory::Exhibition,
            "classic" => ShowCategory::Classic,
            "children" => ShowCategory::Children,
            "theater" => ShowCategory::Theater,
            "etc" => ShowCategory::Etc,
            other => {
                return Err(ParseNameError {
                    kind: "category",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// A show in the catalog. Only the fields the engine reads are kept here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Show {
    pub id: ShowId,
    pub title: String,
    pub category: ShowCategory,
    pub location: String,
    pub price: Points,
}

/// One scheduled performance of a show, with its own seat inventory.
///
/// `reserved` never exceeds `capacity`; only the engine's transactions move it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowDate {
    pub id: ShowDateId,
    pub show_id: ShowId,
    pub date: DateTime<Utc>,
    pub capacity: u32,
    pub reserved: u32,
}

impl ShowDate {
    pub fn has_seats(&self) -> bool {
        self.reserved < self.capacity
    }

    /// Reserved count after taking one more seat, or `None` when sold out.
    pub fn reserve_seat(&self) -> Option<u32> {
        self.has_seats().then(|| self.reserved + 1)
    }

    /// Reserved count after giving one seat back, or `None` when nothing is reserved.
    pub fn release_seat(&self) -> Option<u32> {
        self.reserved.checked_sub(1)
    }
}

/// A show date joined with the show it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowDateDetail {
    pub show: Show,
    pub show_date: ShowDate,
}

impl ShowDateDetail {
    pub fn summary(&self) -> ShowSummary {
        ShowSummary {
            show_id: self.show.id,
            show_date_id: self.show_date.id,
            title: self.show.title.clone(),
            category: self.show.category,
            location: self.show.location.clone(),
            price: self.show.price,
            date: self.show_date.date,
        }
    }
}

/// Point balance of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBalance {
    pub user: UserId,
    pub points: Points,
}

impl UserBalance {
    /// Balance granted to a freshly signed-up user.
    pub const DEFAULT_POINTS: Points = Points::new(1_000_000);

    pub fn new(user: UserId, points: Points) -> Self {
        Self { user, points }
    }
}

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ReservationStatus {
    /// Seat is held and paid for.
    #[default]
    Reserved,
    /// Seat was given back and points refunded. Terminal.
    Cancelled,
    /// Show took place. Not produced by the engine yet.
    Completed,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_active(self) -> bool {
        self == ReservationStatus::Reserved
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVED" => Ok(ReservationStatus::Reserved),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            other => Err(ParseNameError {
                kind: "reservation status",
                value: other.to_string(),
            }),
        }
    }
}

/// One user's claim on one seat of one show date.
///
/// The price paid is not recorded; refunds re-read the show's current price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user: UserId,
    pub show_date: ShowDateId,
}

impl Reservation {
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.user == user
    }
}

/// Display fields of the show a reservation points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowSummary {
    pub show_id: ShowId,
    pub show_date_id: ShowDateId,
    pub title: String,
    pub category: ShowCategory,
    pub location: String,
    pub price: Points,
    pub date: DateTime<Utc>,
}

/// A reservation together with its show summary, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub show: ShowSummary,
}

/// Confirmation of a successful cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub reservation: ReservationId,
    pub refunded: Points,
}

impl Cancellation {
    pub fn message(&self) -> &'static str {
        "reservation cancelled"
    }
}

/// A request handed to the engine by the surrounding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Book one seat of a show date.
    Create { user: UserId, show_date: ShowDateId },
    /// Give a seat back and get the points refunded.
    Cancel {
        user: UserId,
        reservation: ReservationId,
    },
    /// List a user's reservations.
    List { user: UserId },
}
