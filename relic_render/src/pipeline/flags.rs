//! Per-surface polygon flags and the pipeline-variant index derivation.
//!
//! The flag word arrives from the scene layer on every draw. The precedence
//! rules in [`PolyFlags::normalize`] are correctness-critical: an occlude bit
//! missing on an opaque surface or a masked bit surviving on a translucent
//! one produces plausible-looking but wrong blend/depth combinations.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolyFlags: u32 {
        /// Alpha-tested surface (binary transparency).
        const MASKED      = 1 << 0;
        /// Additive-style translucency.
        const TRANSLUCENT = 1 << 1;
        /// Multiplies against the framebuffer.
        const MODULATED   = 1 << 2;
        /// Premultiplied highlight blend.
        const HIGHLIGHTED = 1 << 3;
        /// Depth-only surface; color writes disabled.
        const INVISIBLE   = 1 << 4;
        /// Writes depth as well as testing it.
        const OCCLUDE     = 1 << 5;
        /// Point sampling instead of bilinear filtering.
        const NO_SMOOTH   = 1 << 6;
        /// Clamp texture addressing instead of wrapping.
        const CLAMP_UV    = 1 << 7;
    }
}

/// The 2-bit blend sub-index of a pipeline variant.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendKind {
    Opaque = 0,
    Translucent = 1,
    Modulated = 2,
    Highlighted = 3,
}

impl From<u32> for BlendKind {
    fn from(bits: u32) -> Self {
        match bits & 3 {
            1 => BlendKind::Translucent,
            2 => BlendKind::Modulated,
            3 => BlendKind::Highlighted,
            _ => BlendKind::Opaque,
        }
    }
}

/// Number of pipeline variants per render-target configuration.
pub const VARIANT_COUNT: usize = 32;

impl PolyFlags {
    /// Applies the blend/depth precedence rules.
    ///
    /// Opaque-ish surfaces (neither translucent nor modulated) always write
    /// depth; translucent surfaces never alpha-test. Idempotent.
    pub fn normalize(self) -> PolyFlags {
        let mut flags = self;
        if !flags.intersects(PolyFlags::TRANSLUCENT | PolyFlags::MODULATED) {
            flags |= PolyFlags::OCCLUDE;
        }
        if flags.contains(PolyFlags::TRANSLUCENT) {
            flags -= PolyFlags::MASKED;
        }
        flags
    }

    /// Blend mode of this surface. Translucent wins over modulated wins over
    /// highlighted when the scene layer sets several blend bits at once.
    pub fn blend_kind(self) -> BlendKind {
        if self.contains(PolyFlags::TRANSLUCENT) {
            BlendKind::Translucent
        } else if self.contains(PolyFlags::MODULATED) {
            BlendKind::Modulated
        } else if self.contains(PolyFlags::HIGHLIGHTED) {
            BlendKind::Highlighted
        } else {
            BlendKind::Opaque
        }
    }

    /// Maps normalized flags onto the fixed variant table index.
    ///
    /// Layout: bits 0-1 blend kind, bit 2 masked, bit 3 invisible,
    /// bit 4 occlude. Callers must normalize first; the table builder
    /// enumerates raw indices, the lookup path goes through
    /// [`variant_index`].
    pub fn variant_bits(self) -> usize {
        let mut index = self.blend_kind() as usize;
        if self.contains(PolyFlags::MASKED) {
            index |= 1 << 2;
        }
        if self.contains(PolyFlags::INVISIBLE) {
            index |= 1 << 3;
        }
        if self.contains(PolyFlags::OCCLUDE) {
            index |= 1 << 4;
        }
        index
    }
}

/// Normalizes and indexes in one step; this is the hot-path entry.
#[inline]
pub fn variant_index(flags: PolyFlags) -> usize {
    flags.normalize().variant_bits()
}

/// Reconstructs the flag set a raw table index stands for. Used by the table
/// builder to enumerate all variants eagerly.
pub fn flags_for_index(index: usize) -> PolyFlags {
    debug_assert!(index < VARIANT_COUNT);

    let mut flags = match BlendKind::from(index as u32) {
        BlendKind::Opaque => PolyFlags::empty(),
        BlendKind::Translucent => PolyFlags::TRANSLUCENT,
        BlendKind::Modulated => PolyFlags::MODULATED,
        BlendKind::Highlighted => PolyFlags::HIGHLIGHTED,
    };
    if index & (1 << 2) != 0 {
        flags |= PolyFlags::MASKED;
    }
    if index & (1 << 3) != 0 {
        flags |= PolyFlags::INVISIBLE;
    }
    if index & (1 << 4) != 0 {
        flags |= PolyFlags::OCCLUDE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_surfaces_are_forced_to_occlude() {
        let normalized = PolyFlags::empty().normalize();
        assert!(normalized.contains(PolyFlags::OCCLUDE));

        let highlighted = PolyFlags::HIGHLIGHTED.normalize();
        assert!(highlighted.contains(PolyFlags::OCCLUDE));
    }

    #[test]
    fn translucent_clears_masked() {
        let flags = (PolyFlags::TRANSLUCENT | PolyFlags::MASKED).normalize();
        assert!(!flags.contains(PolyFlags::MASKED));
        assert!(flags.contains(PolyFlags::TRANSLUCENT));
    }

    #[test]
    fn translucent_and_modulated_keep_their_depth_behavior() {
        // Neither blend mode forces occlude on.
        assert!(!PolyFlags::TRANSLUCENT.normalize().contains(PolyFlags::OCCLUDE));
        assert!(!PolyFlags::MODULATED.normalize().contains(PolyFlags::OCCLUDE));
        // But an explicit occlude survives.
        let flags = (PolyFlags::TRANSLUCENT | PolyFlags::OCCLUDE).normalize();
        assert!(flags.contains(PolyFlags::OCCLUDE));
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in 0u32..256 {
            let flags = PolyFlags::from_bits_truncate(raw);
            let once = flags.normalize();
            assert_eq!(once, once.normalize(), "flags {flags:?}");
        }
    }

    #[test]
    fn masked_translucent_and_plain_translucent_share_a_variant() {
        let a = variant_index(PolyFlags::TRANSLUCENT | PolyFlags::MASKED);
        let b = variant_index(PolyFlags::TRANSLUCENT);
        assert_eq!(a, b);
    }

    #[test]
    fn variant_indices_stay_in_table_bounds() {
        for raw in 0u32..256 {
            let flags = PolyFlags::from_bits_truncate(raw);
            assert!(variant_index(flags) < VARIANT_COUNT);
        }
    }

    #[test]
    fn index_round_trips_through_flags_for_index() {
        for index in 0..VARIANT_COUNT {
            assert_eq!(flags_for_index(index).variant_bits(), index);
        }
    }

    #[test]
    fn blend_precedence_translucent_over_modulated() {
        let both = PolyFlags::TRANSLUCENT | PolyFlags::MODULATED;
        assert_eq!(both.blend_kind(), BlendKind::Translucent);

        let mod_high = PolyFlags::MODULATED | PolyFlags::HIGHLIGHTED;
        assert_eq!(mod_high.blend_kind(), BlendKind::Modulated);
    }
}
