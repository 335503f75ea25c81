/// Little-endian integer that can be moved to and from guest memory.
pub trait LeScalar: Copy + Eq + Send + 'static {
    const SIZE: usize;

    /// Build a value from the first `SIZE` bytes of `bytes`.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Store the value into the first `SIZE` bytes of `out`.
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_le_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LeScalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(buf)
                }

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_scalar!(u8, u16, u32, u64, u128);
