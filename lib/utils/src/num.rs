//! Numeric helpers shared across the workspace.

/// Alignment arithmetic for unsigned offsets.
pub trait AlignableTo: Copy {
    /// Round `self` up to the next multiple of `align`.
    ///
    /// `align` must be a power of two.
    fn align_up(self, align: Self) -> Self;
}

impl AlignableTo for usize {
    #[inline(always)]
    fn align_up(self, align: usize) -> usize {
        (self + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_boundary() {
        assert_eq!(0usize.align_up(4), 0);
        assert_eq!(1usize.align_up(4), 4);
        assert_eq!(4usize.align_up(4), 4);
        assert_eq!(5usize.align_up(4), 8);
    }
}
