//! Register access API
//!
//! Re-exports the `ral-registers` macros, and adds [`fields!`] for declaring
//! register fields the way those macros expect them: a module per register,
//! a module per field with its `offset` and `mask`, and `R` / `W` / `RW`
//! modules for named values.

pub use ral_registers::{modify_reg, read_reg, write_reg, RWRegister};

/// Declare the fields of one register
///
/// ```ignore
/// pub mod DADDR {
///     fields!(u32;
///         ADD: 0, 7;
///         EF: 7, 1;
///     );
/// }
/// ```
///
/// Named values follow the width, like `STAT: 4, 2, [NAK = 2, VALID = 3];`.
macro_rules! fields {
    ($ty:ty; $($name:ident: $offset:expr, $width:expr $(, [$($value:ident = $bits:expr),* $(,)?])?;)*) => {
        $(
            #[allow(non_snake_case, non_upper_case_globals, dead_code)]
            pub mod $name {
                pub const offset: $ty = $offset;
                pub const mask: $ty = ((1 << $width) - 1) << offset;
                pub mod R {}
                pub mod W {}
                pub mod RW {
                    $($(pub const $value: $ty = $bits;)*)?
                }
            }
        )*
    };
}
