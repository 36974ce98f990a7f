macro_rules! impl_base {
    ($type:ty) => {
        impl ::std::fmt::Debug for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }
    };
}

fn impl_base_fmt<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

/// A hexadecimal representation of a value.
///
/// Used as a `tracing` field formatter and for byte dumps of emitted code.
///
/// # Examples
///
/// ```
/// # use kinject_core::Hex;
/// assert_eq!(format!("{}", Hex(42u16)), "0x002a");
/// assert_eq!(format!("{}", Hex(&[0x48u8, 0xB8][..])), "48 b8");
/// ```
pub struct Hex<T>(pub T);

impl_base!(u8);
impl_base!(u16);
impl_base!(u32);
impl_base!(u64);
impl_base!(usize);

impl ::std::fmt::Display for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }

            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl ::std::fmt::Debug for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "[{self}]")
    }
}
