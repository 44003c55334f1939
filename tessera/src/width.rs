//! Variable-width encoding of header fields.

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

/// Number of bytes used to store a header field.
///
/// Every field of a chunk header is stored little endian
/// in the smallest width that fits the value at the time
/// the width was chosen. The `Void` width stores nothing
/// and can only represent zero.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Width
{
    Void,
    U8,
    U16,
    U24,
    U32,
    U40,
    U48,
    U64,
}

/// Returned when a value does not fit in the width of its field.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("Value {value} does not fit in a {width:?} field")]
pub struct EncodingError
{
    /// The value that was to be stored.
    pub value: u64,

    /// The width of the field.
    pub width: Width,
}

impl Width
{
    /// All widths, from narrowest to widest.
    pub const ALL: [Width; 8] = [
        Width::Void, Width::U8, Width::U16, Width::U24,
        Width::U32, Width::U40, Width::U48, Width::U64,
    ];

    /// The number of bytes the field occupies.
    pub const fn bytes(self) -> u64
    {
        match self {
            Width::Void => 0,
            Width::U8   => 1,
            Width::U16  => 2,
            Width::U24  => 3,
            Width::U32  => 4,
            Width::U40  => 5,
            Width::U48  => 6,
            Width::U64  => 8,
        }
    }

    /// The largest value the field can hold.
    pub const fn max_value(self) -> u64
    {
        match self {
            Width::U64 => u64::MAX,
            _          => (1u64 << (8 * self.bytes())) - 1,
        }
    }

    /// Whether `value` can be stored in a field of this width.
    pub const fn fits(self, value: u64) -> bool
    {
        value <= self.max_value()
    }

    /// The narrowest width that can store `value`.
    pub fn fitting(value: u64) -> Self
    {
        Self::ALL.into_iter()
            .find(|width| width.fits(value))
            .unwrap_or(Width::U64)
    }

    /// The next wider width, if any.
    pub fn wider(self) -> Option<Self>
    {
        Self::ALL.into_iter().find(|width| *width > self)
    }

    /// The three-bit code stored in the flags byte.
    pub const fn code(self) -> u8
    {
        self as u8
    }

    /// Inverse of [`code`][`Self::code`].
    ///
    /// Only the lowest three bits are considered,
    /// so every byte decodes to some width.
    pub const fn from_code(code: u8) -> Self
    {
        match code & 0b111 {
            0 => Width::Void,
            1 => Width::U8,
            2 => Width::U16,
            3 => Width::U24,
            4 => Width::U32,
            5 => Width::U40,
            6 => Width::U48,
            _ => Width::U64,
        }
    }

    /// Append `value` to `buf` using this width.
    pub fn encode<E>(self, value: u64, buf: &mut E) -> Result<(), EncodingError>
        where E: Extend<u8>
    {
        if !self.fits(value) {
            return Err(EncodingError{value, width: self});
        }
        let len = self.bytes() as usize;
        buf.extend(value.to_le_bytes().into_iter().take(len));
        Ok(())
    }

    /// Read a value of this width from the front of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`bytes`][`Self::bytes`].
    pub fn decode(self, buf: &[u8]) -> u64
    {
        let len = self.bytes() as usize;
        let mut le = [0; 8];
        le[.. len].copy_from_slice(&buf[.. len]);
        u64::from_le_bytes(le)
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, proptest::proptest};

    #[test]
    fn void_only_holds_zero()
    {
        assert!(Width::Void.fits(0));
        assert!(!Width::Void.fits(1));
        assert_eq!(Width::fitting(0), Width::Void);

        let mut buf = Vec::new();
        Width::Void.encode(0, &mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(Width::Void.decode(&buf), 0);
    }

    #[test]
    fn fitting_picks_boundaries()
    {
        assert_eq!(Width::fitting(255), Width::U8);
        assert_eq!(Width::fitting(256), Width::U16);
        assert_eq!(Width::fitting(1 << 24), Width::U32);
        assert_eq!(Width::fitting(1 << 48), Width::U64);
        assert_eq!(Width::fitting(u64::MAX), Width::U64);
    }

    #[test]
    fn codes_are_three_bits()
    {
        for width in Width::ALL {
            assert!(width.code() < 8);
            assert_eq!(Width::from_code(width.code()), width);
        }
        assert_eq!(Width::U64.wider(), None);
        assert_eq!(Width::Void.wider(), Some(Width::U8));
    }

    #[test]
    fn encode_rejects_overflow()
    {
        let mut buf = Vec::new();
        let err = Width::U16.encode(70_000, &mut buf).unwrap_err();
        assert_eq!(err, EncodingError{value: 70_000, width: Width::U16});
        assert!(buf.is_empty());
    }

    proptest!
    {
        #[test]
        fn fitting_width_is_narrowest(value: u64)
        {
            let width = Width::fitting(value);
            assert!(width.fits(value));
            if let Some(narrower) =
                Width::ALL.into_iter().rev().find(|w| *w < width)
            {
                assert!(!narrower.fits(value));
            }

            let mut buf = Vec::new();
            width.encode(value, &mut buf).unwrap();
            assert_eq!(buf.len() as u64, width.bytes());
            assert_eq!(width.decode(&buf), value);
        }
    }
}
