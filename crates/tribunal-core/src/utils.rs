//! Helpers shared by the analysis layers.

pub mod allowance;
pub mod attributes;
pub mod lexical;

#[doc(inline)]
pub use allowance::{check_allow_with_reason, parse_allow_directive, AllowCheck, AllowDirective};
#[doc(inline)]
pub use attributes::{has_cfg_test, has_test_attr};
#[doc(inline)]
pub use lexical::{Language, LexClass, LexMap};
