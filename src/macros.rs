//! Convenience macros for working with KNX addresses.

/// Creates a [`GroupAddress`](crate::addressing::GroupAddress) from 3-level notation.
///
/// # Syntax
///
/// ```text
/// ga!(main/middle/sub)
/// ```
///
/// # Examples
///
/// ```no_run
/// use knx_gateway::ga;
///
/// let lights = ga!(1/2/3);
/// let scene = ga!(0/0/1);
/// ```
///
/// Components are validated at compile time:
///
/// ```compile_fail
/// let addr = ga!(32/0/0); // main group > 31
/// ```
#[macro_export]
macro_rules! ga {
    ($main:literal / $middle:literal / $sub:literal) => {{
        // Compile-time validation
        const _: () = {
            if $main > 31 {
                panic!("Main group must be 0-31");
            }
            if $middle > 7 {
                panic!("Middle group must be 0-7");
            }
            if $sub > 255 {
                panic!("Sub group must be 0-255");
            }
        };
        $crate::addressing::GroupAddress::from(
            (($main as u16 & 0x1F) << 11) | (($middle as u16 & 0x07) << 8) | ($sub as u16 & 0xFF),
        )
    }};
}

/// Creates an [`IndividualAddress`](crate::addressing::IndividualAddress)
/// from its area, line and device components.
///
/// Comma-separated because `1.1.42` does not survive Rust tokenization.
///
/// # Examples
///
/// ```no_run
/// use knx_gateway::ia;
///
/// let device = ia!(1, 1, 42);
/// ```
#[macro_export]
macro_rules! ia {
    ($area:literal, $line:literal, $device:literal) => {{
        // Compile-time validation
        const _: () = {
            if $area > 15 {
                panic!("Area must be 0-15");
            }
            if $line > 15 {
                panic!("Line must be 0-15");
            }
            if $device > 255 {
                panic!("Device must be 0-255");
            }
        };
        $crate::addressing::IndividualAddress::from(
            (($area as u16 & 0x0F) << 12) | (($line as u16 & 0x0F) << 8) | ($device as u16 & 0xFF),
        )
    }};
}

#[cfg(test)]
mod tests {
    use crate::addressing::{GroupAddress, IndividualAddress};

    #[test]
    fn test_ga_macro() {
        let addr = ga!(1 / 2 / 3);
        assert_eq!(addr, GroupAddress::new(1, 2, 3).unwrap());
        assert_eq!(addr.raw(), 0x0A03);
    }

    #[test]
    fn test_ia_macro() {
        let addr = ia!(1, 1, 42);
        assert_eq!(addr, IndividualAddress::new(1, 1, 42).unwrap());
        assert_eq!(addr.raw(), 0x112A);
    }
}
