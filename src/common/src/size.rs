// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid data size: {0}")]
pub struct ParseDataSizeError(String);

/// A byte count. Kept as a distinct type rather than a bare `u64` so that split weights,
/// memory estimates and packing thresholds can't be accidentally compared against partition
/// counts or other unrelated integers.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSize(pub u64);

impl DataSize {
    pub const ZERO: DataSize = DataSize(0);

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn saturating_mul(self, factor: u64) -> DataSize {
        DataSize(self.0.saturating_mul(factor))
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> DataSize {
        DataSize(self.0 + rhs.0)
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl Sum for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, Add::add)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl FromStr for DataSize {
    type Err = ParseDataSizeError;

    /// Accepts either a bare integer (bytes) or a size suffix like `64MB`, so that
    /// `SchedulerConfig` fields can be written either way in TOML.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(bytes) = trimmed.parse::<u64>() {
            return Ok(DataSize(bytes));
        }
        let split_at = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ParseDataSizeError(s.to_string()))?;
        let (digits, unit) = trimmed.split_at(split_at);
        let value: u64 = digits
            .parse()
            .map_err(|_| ParseDataSizeError(s.to_string()))?;
        let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
            "B" => 1,
            "KB" => 1024,
            "MB" => 1024 * 1024,
            "GB" => 1024 * 1024 * 1024,
            _ => return Err(ParseDataSizeError(s.to_string())),
        };
        Ok(DataSize(value * multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!("1024".parse::<DataSize>().unwrap(), DataSize(1024));
    }

    #[test]
    fn parses_unit_suffix() {
        assert_eq!("4MB".parse::<DataSize>().unwrap(), DataSize(4 * 1024 * 1024));
    }

    #[test]
    fn sums() {
        let total: DataSize = vec![DataSize(1), DataSize(2), DataSize(3)].into_iter().sum();
        assert_eq!(total, DataSize(6));
    }
}
