use super::layout::PAGE_ORDER;

#[inline]
#[allow(non_snake_case)]
pub const fn ALIGN_UP(val: usize, order: usize) -> usize {
    let o = (1usize << order) - 1;
    // & !o: clearing the low `order` bits
    (val + o) & !o
}

#[inline]
#[allow(non_snake_case)]
pub const fn ALIGN_DOWN(val: usize, order: usize) -> usize {
    val & !((1usize << order) - 1)
}

#[inline]
#[allow(non_snake_case)]
pub const fn PG_ROUND_DOWN(val: usize) -> usize {
    ALIGN_DOWN(val, PAGE_ORDER)
}

#[inline]
#[allow(non_snake_case)]
pub const fn PG_ROUND_UP(val: usize) -> usize {
    ALIGN_UP(val, PAGE_ORDER)
}

/// number of pages needed to hold `bytes`
#[inline]
#[allow(non_snake_case)]
pub const fn N_PAGES(bytes: usize) -> usize {
    PG_ROUND_UP(bytes) >> PAGE_ORDER
}

// --------------- Arithmetic Properties --------------

#[macro_export]
macro_rules! impl_address_arithmetics {
    ($struct_name: ident) => {
        impl $struct_name {
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }
            pub fn is_page_aligned(&self) -> bool {
                self.0 % $crate::mm::layout::PAGE_SIZE == 0
            }
            pub fn align_down(self) -> Self {
                Self($crate::mm::arithmetics::PG_ROUND_DOWN(self.0))
            }
            pub fn align_up(self) -> Self {
                Self($crate::mm::arithmetics::PG_ROUND_UP(self.0))
            }
            pub fn page_offset(&self) -> usize {
                self.0 % $crate::mm::layout::PAGE_SIZE
            }
            pub const fn as_usize(&self) -> usize {
                self.0
            }
        }

        impl core::ops::Add<usize> for $struct_name {
            type Output = Self;
            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl core::ops::Sub<usize> for $struct_name {
            type Output = Self;
            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl core::ops::Sub for $struct_name {
            type Output = usize;
            fn sub(self, rhs: Self) -> usize {
                self.0 - rhs.0
            }
        }

        impl core::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#x})", stringify!($struct_name), self.0)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::layout::PAGE_SIZE;

    #[test]
    fn rounding() {
        assert_eq!(PG_ROUND_UP(1), PAGE_SIZE);
        assert_eq!(PG_ROUND_UP(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(PG_ROUND_DOWN(PAGE_SIZE + 17), PAGE_SIZE);
        assert_eq!(N_PAGES(0), 0);
        assert_eq!(N_PAGES(PAGE_SIZE * 2 + 1), 3);
    }
}
