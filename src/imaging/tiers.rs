//! Named size tiers derived from breakpoint configuration.
//!
//! Layout breakpoints describe CSS widths. Variants are generated for
//! high-density displays, so every tier above `xs` targets twice its
//! breakpoint. `xs` is used as-is and `micro` is half of `xs`:
//!
//! ```text
//! breakpoint   xs=320  sm=640  md=768  lg=1024  xl=1280  xxl=1536
//! tier  micro=160  xs=320  sm=1280  md=1536  lg=2048  xl=2560  xxl=3072
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tier names, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTag {
    Micro,
    Xs,
    Sm,
    Md,
    Lg,
    Xl,
    Xxl,
}

impl SizeTag {
    pub const ALL: [SizeTag; 7] = [
        SizeTag::Micro,
        SizeTag::Xs,
        SizeTag::Sm,
        SizeTag::Md,
        SizeTag::Lg,
        SizeTag::Xl,
        SizeTag::Xxl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Micro => "micro",
            Self::Xs => "xs",
            Self::Sm => "sm",
            Self::Md => "md",
            Self::Lg => "lg",
            Self::Xl => "xl",
            Self::Xxl => "xxl",
        }
    }
}

impl fmt::Display for SizeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named layout width thresholds, in CSS pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakpointSet {
    pub xs: u32,
    pub sm: u32,
    pub md: u32,
    pub lg: u32,
    pub xl: u32,
    pub xxl: u32,
}

impl Default for BreakpointSet {
    fn default() -> Self {
        Self {
            xs: 320,
            sm: 640,
            md: 768,
            lg: 1024,
            xl: 1280,
            xxl: 1536,
        }
    }
}

/// One tier with its target width in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub tag: SizeTag,
    pub target_width: u32,
}

impl BreakpointSet {
    /// Breakpoints must be non-zero and non-decreasing.
    pub fn validate(&self) -> Result<(), String> {
        let values = [
            ("xs", self.xs),
            ("sm", self.sm),
            ("md", self.md),
            ("lg", self.lg),
            ("xl", self.xl),
            ("xxl", self.xxl),
        ];
        for (name, value) in values {
            if value == 0 {
                return Err(format!("breakpoints.{name} must be greater than zero"));
            }
        }
        for pair in values.windows(2) {
            if pair[1].1 < pair[0].1 {
                return Err(format!(
                    "breakpoints.{} ({}) is smaller than breakpoints.{} ({})",
                    pair[1].0, pair[1].1, pair[0].0, pair[0].1
                ));
            }
        }
        Ok(())
    }

    /// Target width of a single tier.
    pub fn target_width(&self, tag: SizeTag) -> u32 {
        match tag {
            SizeTag::Micro => (self.xs / 2).max(1),
            SizeTag::Xs => self.xs,
            SizeTag::Sm => self.sm.saturating_mul(2),
            SizeTag::Md => self.md.saturating_mul(2),
            SizeTag::Lg => self.lg.saturating_mul(2),
            SizeTag::Xl => self.xl.saturating_mul(2),
            SizeTag::Xxl => self.xxl.saturating_mul(2),
        }
    }

    /// The full tier table, smallest first.
    pub fn tiers(&self) -> Vec<Tier> {
        SizeTag::ALL
            .iter()
            .map(|&tag| Tier {
                tag,
                target_width: self.target_width(tag),
            })
            .collect()
    }
}
