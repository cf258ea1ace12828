//! Canvas geometry stored on node records.
//!
//! The diagramming engine persists locations and sizes as space-separated
//! strings (`"120 80"`), so both types serialize through their string form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::model::ModelError;

/// A document-space location.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Explicit node size set by a resize gesture.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

fn parse_pair(raw: &str) -> Result<(f64, f64), ModelError> {
    let mut parts = raw.split_whitespace();
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ModelError::InvalidGeometry(raw.to_string()));
    };
    let a = a
        .parse::<f64>()
        .map_err(|_| ModelError::InvalidGeometry(raw.to_string()))?;
    let b = b
        .parse::<f64>()
        .map_err(|_| ModelError::InvalidGeometry(raw.to_string()))?;
    if !a.is_finite() || !b.is_finite() {
        return Err(ModelError::InvalidGeometry(raw.to_string()));
    }
    Ok((a, b))
}

// f64's Display already drops the fraction of integral values ("120", not "120.0").
impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.y)
    }
}

impl FromStr for Point {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = parse_pair(s)?;
        Ok(Self { x, y })
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = parse_pair(s)?;
        Ok(Self { width, height })
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Point);
string_serde!(Size);
