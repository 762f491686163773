// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthTier {
    /// Tier from the connected/total relay ratio.
    pub fn classify(connected: usize, total: usize) -> Self {
        if connected == 0 || total == 0 {
            return HealthTier::Poor;
        }
        let ratio = connected as f64 / total as f64;
        if ratio < 0.5 {
            HealthTier::Fair
        } else if ratio <= 0.75 {
            HealthTier::Good
        } else {
            HealthTier::Excellent
        }
    }

    /// Fewer than half of the relays are connected.
    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthTier::Poor | HealthTier::Fair)
    }
}

impl std::fmt::Display for HealthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthTier::Poor => "poor",
            HealthTier::Fair => "fair",
            HealthTier::Good => "good",
            HealthTier::Excellent => "excellent",
        };
        f.write_str(s)
    }
}
