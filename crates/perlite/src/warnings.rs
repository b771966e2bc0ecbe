//! Warning categories and lexical warning masks.
//!
//! Perl warnings are lexically scoped: `use warnings` / `no warnings LIST`
//! toggle category bits that the compiler threads into the emitted code. At
//! runtime a warning is emitted only when its category bit is set in the
//! current frame's mask; delivery goes through `$SIG{__WARN__}` when installed,
//! otherwise to the context's diagnostic sink.

use strum::{Display, EnumString, IntoStaticStr};

/// One warning category. The string form matches Perl's category names,
/// including the `experimental::` pseudo-namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum WarningCategory {
    Uninitialized,
    Numeric,
    Void,
    Redundant,
    Recursion,
    Once,
    Misc,
    Syntax,
    Ambiguous,
    Deprecated,
    Closure,
    Overflow,
    Portable,
    Pack,
    Unpack,
    Regexp,
    Substr,
    Io,
    Closed,
    Unopened,
    #[strum(serialize = "experimental::class")]
    ExperimentalClass,
    #[strum(serialize = "experimental::declared_refs")]
    ExperimentalDeclaredRefs,
    #[strum(serialize = "experimental::signatures")]
    ExperimentalSignatures,
    #[strum(serialize = "experimental::try")]
    ExperimentalTry,
}

impl WarningCategory {
    /// The mask bit for this category.
    #[must_use]
    pub const fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

/// Mask with every category enabled (`use warnings`).
pub const ALL_WARNINGS: u64 = u64::MAX;

/// Mask with every category disabled (the default, and `no warnings`).
pub const NO_WARNINGS: u64 = 0;

/// Applies `use warnings LIST` / `no warnings LIST` to a mask. An empty list
/// means all categories. Unknown category names are reported by the caller.
#[must_use]
pub fn adjust_mask(mask: u64, enable: bool, categories: &[WarningCategory]) -> u64 {
    if categories.is_empty() {
        return if enable { ALL_WARNINGS } else { NO_WARNINGS };
    }
    let mut mask = mask;
    for cat in categories {
        if enable {
            mask |= cat.bit();
        } else {
            mask &= !cat.bit();
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn category_names_round_trip() {
        assert_eq!(WarningCategory::Uninitialized.to_string(), "uninitialized");
        assert_eq!(WarningCategory::ExperimentalClass.to_string(), "experimental::class");
        assert_eq!(WarningCategory::from_str("numeric").unwrap(), WarningCategory::Numeric);
        assert_eq!(
            WarningCategory::from_str("experimental::declared_refs").unwrap(),
            WarningCategory::ExperimentalDeclaredRefs,
        );
        assert!(WarningCategory::from_str("nonsense").is_err());
    }

    #[test]
    fn adjust_mask_toggles_bits() {
        let m = adjust_mask(NO_WARNINGS, true, &[WarningCategory::Numeric]);
        assert_ne!(m & WarningCategory::Numeric.bit(), 0);
        assert_eq!(m & WarningCategory::Void.bit(), 0);
        let m = adjust_mask(m, false, &[WarningCategory::Numeric]);
        assert_eq!(m, NO_WARNINGS);
        assert_eq!(adjust_mask(m, true, &[]), ALL_WARNINGS);
    }
}
