/// Everything after the header is laid out in multiples of this many bytes
pub const ALIGNMENT: usize = size_of::<u32>();

pub fn align_int(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

pub fn padding_for(len: usize) -> usize {
    align_int(len) - len
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Widening casts that cannot fail on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}
