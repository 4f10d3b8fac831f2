//! PS2 alpha blending mapped onto fixed-function hardware blending.
//!
//! The GS blends with `(A - B) * C + D` where A, B and D pick between source
//! color, destination color and zero, and C picks source alpha, destination
//! alpha or the fixed `AFIX` value. [`HW_BLEND_MAP`] holds, for each of the 81
//! combinations, the closest native equation plus flags telling the draw
//! builder what extra work the shader has to do.

use bitflags::bitflags;

use crate::hal::{BlendFactor, BlendOp};

/// Blend factors in the order the blend table and pipeline selectors use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HwBlendFactor {
    SrcColor,
    InvSrcColor,
    DstColor,
    InvDstColor,
    Src1Color,
    InvSrc1Color,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    Src1Alpha,
    InvSrc1Alpha,
    ConstColor,
    InvConstColor,
    ConstOne,
    ConstZero,
}

impl HwBlendFactor {
    pub fn to_native(self) -> BlendFactor {
        match self {
            HwBlendFactor::SrcColor => BlendFactor::SrcColor,
            HwBlendFactor::InvSrcColor => BlendFactor::InvSrcColor,
            HwBlendFactor::DstColor => BlendFactor::DstColor,
            HwBlendFactor::InvDstColor => BlendFactor::InvDstColor,
            HwBlendFactor::Src1Color => BlendFactor::Src1Color,
            HwBlendFactor::InvSrc1Color => BlendFactor::InvSrc1Color,
            HwBlendFactor::SrcAlpha => BlendFactor::SrcAlpha,
            HwBlendFactor::InvSrcAlpha => BlendFactor::InvSrcAlpha,
            HwBlendFactor::DstAlpha => BlendFactor::DstAlpha,
            HwBlendFactor::InvDstAlpha => BlendFactor::InvDstAlpha,
            HwBlendFactor::Src1Alpha => BlendFactor::Src1Alpha,
            HwBlendFactor::InvSrc1Alpha => BlendFactor::InvSrc1Alpha,
            HwBlendFactor::ConstColor => BlendFactor::Constant,
            HwBlendFactor::InvConstColor => BlendFactor::InvConstant,
            HwBlendFactor::ConstOne => BlendFactor::One,
            HwBlendFactor::ConstZero => BlendFactor::Zero,
        }
    }

    /// Single-source stand-in for backends without dual-source blending.
    pub fn without_dual_source(self) -> HwBlendFactor {
        REPLACE_DUAL_SRC_BLEND_MAP[self as usize]
    }

    pub fn is_dual_source(self) -> bool {
        matches!(
            self,
            HwBlendFactor::Src1Color
                | HwBlendFactor::InvSrc1Color
                | HwBlendFactor::Src1Alpha
                | HwBlendFactor::InvSrc1Alpha
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HwBlendOp {
    Add,
    Subtract,
    RevSubtract,
    /// Only used by the primitive-ID pre-pass.
    Min,
}

impl HwBlendOp {
    pub fn to_native(self) -> BlendOp {
        match self {
            HwBlendOp::Add => BlendOp::Add,
            HwBlendOp::Subtract => BlendOp::Subtract,
            HwBlendOp::RevSubtract => BlendOp::RevSubtract,
            HwBlendOp::Min => BlendOp::Min,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HwBlendFlags: u16 {
        /// Output is Cd; blending can be skipped entirely.
        const CD = 1 << 0;
        /// Cs*(1 + F) style equations the hardware clamps; needs shader help.
        const HW_CLR1 = 1 << 1;
        const HW_CLR2 = 1 << 2;
        const HW_CLR3 = 1 << 3;
        /// Equation can be folded into the shader with a mix.
        const MIX1 = 1 << 4;
        const MIX2 = 1 << 5;
        const MIX3 = 1 << 6;
        /// Cs*F + Cd, accumulation blending.
        const ACCU = 1 << 7;
        /// No destination read; blending can be done without recursion.
        const NO_REC = 1 << 8;
        /// Factor may exceed one and needs the alpha-max path.
        const A_MAX = 1 << 9;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HwBlend {
    pub flags: HwBlendFlags,
    pub op: HwBlendOp,
    pub src: HwBlendFactor,
    pub dst: HwBlendFactor,
}

const fn hw(flags: HwBlendFlags, op: HwBlendOp, src: HwBlendFactor, dst: HwBlendFactor) -> HwBlend {
    HwBlend {
        flags,
        op,
        src,
        dst,
    }
}

pub const REPLACE_DUAL_SRC_BLEND_MAP: [HwBlendFactor; 16] = {
    use HwBlendFactor::*;
    [
        SrcColor,
        InvSrcColor,
        DstColor,
        InvDstColor,
        SrcColor,
        InvSrcColor,
        SrcAlpha,
        InvSrcAlpha,
        DstAlpha,
        InvDstAlpha,
        SrcAlpha,
        InvSrcAlpha,
        ConstColor,
        InvConstColor,
        ConstOne,
        ConstZero,
    ]
};

/// Indexed by `A*27 + B*9 + C*3 + D`, see [`hw_blend`].
pub const HW_BLEND_MAP: [HwBlend; 81] = {
    use HwBlendFactor::*;
    use HwBlendFlags as F;
    use HwBlendOp::{Add, RevSubtract as RevSub, Subtract as Sub};
    [
        // A=0 B=0
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        // A=0 B=1
        hw(F::A_MAX.union(F::MIX2), Sub, ConstOne, Src1Alpha),
        hw(F::MIX1, Add, Src1Alpha, InvSrc1Alpha),
        hw(F::MIX1, Sub, Src1Alpha, Src1Alpha),
        hw(F::A_MAX, Sub, ConstOne, DstAlpha),
        hw(F::empty(), Add, DstAlpha, InvDstAlpha),
        hw(F::empty(), Sub, DstAlpha, DstAlpha),
        hw(F::A_MAX.union(F::MIX2), Sub, ConstOne, ConstColor),
        hw(F::MIX1, Add, ConstColor, InvConstColor),
        hw(F::MIX1, Sub, ConstColor, ConstColor),
        // A=0 B=2
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::ACCU, Add, Src1Alpha, ConstOne),
        hw(F::NO_REC, Add, Src1Alpha, ConstZero),
        hw(F::A_MAX, Add, ConstOne, ConstZero),
        hw(F::HW_CLR3, Add, DstAlpha, ConstOne),
        hw(F::HW_CLR3, Add, DstAlpha, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::ACCU, Add, ConstColor, ConstOne),
        hw(F::NO_REC, Add, ConstColor, ConstZero),
        // A=1 B=0
        hw(F::MIX3, Add, InvSrc1Alpha, Src1Alpha),
        hw(F::A_MAX.union(F::MIX1), RevSub, Src1Alpha, ConstOne),
        hw(F::MIX1, RevSub, Src1Alpha, Src1Alpha),
        hw(F::empty(), Add, InvDstAlpha, DstAlpha),
        hw(F::A_MAX, RevSub, DstAlpha, ConstOne),
        hw(F::empty(), RevSub, DstAlpha, DstAlpha),
        hw(F::MIX3, Add, InvConstColor, ConstColor),
        hw(F::A_MAX.union(F::MIX1), RevSub, ConstColor, ConstOne),
        hw(F::MIX1, RevSub, ConstColor, ConstColor),
        // A=1 B=1
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        // A=1 B=2
        hw(F::empty(), Add, ConstOne, Src1Alpha),
        hw(F::HW_CLR1, Add, DstColor, Src1Alpha),
        hw(F::HW_CLR2, Add, DstColor, Src1Alpha),
        hw(F::empty(), Add, ConstOne, DstAlpha),
        hw(F::HW_CLR1, Add, DstColor, DstAlpha),
        hw(F::empty(), Add, ConstZero, DstAlpha),
        hw(F::empty(), Add, ConstOne, ConstColor),
        hw(F::HW_CLR1, Add, DstColor, ConstColor),
        hw(F::HW_CLR2, Add, DstColor, ConstColor),
        // A=2 B=0
        hw(F::NO_REC, Add, InvSrc1Alpha, ConstZero),
        hw(F::ACCU, RevSub, Src1Alpha, ConstOne),
        hw(F::NO_REC, RevSub, Src1Alpha, ConstZero),
        hw(F::empty(), Add, InvDstAlpha, ConstZero),
        hw(F::HW_CLR3, RevSub, DstAlpha, ConstOne),
        hw(F::empty(), RevSub, DstAlpha, ConstZero),
        hw(F::NO_REC, Add, InvConstColor, ConstZero),
        hw(F::ACCU, RevSub, ConstColor, ConstOne),
        hw(F::NO_REC, RevSub, ConstColor, ConstZero),
        // A=2 B=1
        hw(F::empty(), Sub, ConstOne, Src1Alpha),
        hw(F::empty(), Add, ConstZero, InvSrc1Alpha),
        hw(F::empty(), Sub, ConstZero, Src1Alpha),
        hw(F::empty(), Sub, ConstOne, DstAlpha),
        hw(F::empty(), Add, ConstZero, InvDstAlpha),
        hw(F::empty(), Sub, ConstOne, DstAlpha),
        hw(F::empty(), Sub, ConstOne, ConstColor),
        hw(F::empty(), Add, ConstZero, InvConstColor),
        hw(F::empty(), Sub, ConstOne, ConstColor),
        // A=2 B=2
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
        hw(F::NO_REC, Add, ConstOne, ConstZero),
        hw(F::CD, Add, ConstZero, ConstOne),
        hw(F::NO_REC, Add, ConstZero, ConstZero),
    ]
};

/// Looks up the hardware equation for the GS `ALPHA` register fields.
pub fn hw_blend(a: u8, b: u8, c: u8, d: u8) -> HwBlend {
    assert!(a < 3 && b < 3 && c < 3 && d < 3, "blend selector out of range");
    HW_BLEND_MAP[usize::from(a) * 27 + usize::from(b) * 9 + usize::from(c) * 3 + usize::from(d)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_alpha_blend() {
        // (Cs - Cd) * As + Cd
        let blend = hw_blend(0, 1, 0, 1);
        assert_eq!(blend.op, HwBlendOp::Add);
        assert_eq!(blend.src, HwBlendFactor::Src1Alpha);
        assert_eq!(blend.dst, HwBlendFactor::InvSrc1Alpha);
        assert_eq!(blend.flags, HwBlendFlags::MIX1);
    }

    #[test]
    fn degenerate_equations_keep_destination() {
        for (a, b) in [(0, 0), (1, 1), (2, 2)] {
            for c in 0..3 {
                assert_eq!(hw_blend(a, b, c, 1).flags, HwBlendFlags::CD);
            }
        }
    }

    #[test]
    fn dual_source_replacement_is_single_source() {
        for factor in REPLACE_DUAL_SRC_BLEND_MAP {
            assert!(!factor.is_dual_source());
        }
        assert_eq!(HwBlendFactor::Src1Alpha.without_dual_source(), HwBlendFactor::SrcAlpha);
        assert_eq!(HwBlendFactor::InvSrc1Color.without_dual_source(), HwBlendFactor::InvSrcColor);
        assert_eq!(HwBlendFactor::DstAlpha.without_dual_source(), HwBlendFactor::DstAlpha);
    }

    #[test]
    fn const_color_maps_to_blend_factor() {
        assert_eq!(HwBlendFactor::ConstColor.to_native(), BlendFactor::Constant);
        assert_eq!(HwBlendOp::Min.to_native(), BlendOp::Min);
    }
}
