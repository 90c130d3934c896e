//! Attribute inspection for Rust test-region detection.

use syn::Attribute;

const TEST_ATTRS: [&str; 4] = ["test", "tokio::test", "async_std::test", "rstest"];

/// Checks if attributes mark a test function (`#[test]`, `#[tokio::test]`, ...).
#[must_use]
pub fn has_test_attr(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        let path = attr
            .path()
            .segments
            .iter()
            .map(|seg| seg.ident.to_string())
            .collect::<Vec<_>>()
            .join("::");
        TEST_ATTRS.contains(&path.as_str())
    })
}

/// Checks if attributes contain a `#[cfg(test)]` attribute.
#[must_use]
pub fn has_cfg_test(attrs: &[Attribute]) -> bool {
    attrs.iter().filter(|attr| attr.path().is_ident("cfg")).any(|attr| {
        let attr_str = quote::quote!(#attr).to_string().replace(' ', "");
        attr_str.contains("(test)") || attr_str.contains("(test,") || attr_str.contains(",test)")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_has_test_attr() {
        let attrs: Vec<Attribute> = vec![parse_quote!(#[test])];
        assert!(has_test_attr(&attrs));

        let attrs: Vec<Attribute> = vec![parse_quote!(#[tokio::test])];
        assert!(has_test_attr(&attrs));

        let attrs: Vec<Attribute> = vec![parse_quote!(#[inline])];
        assert!(!has_test_attr(&attrs));
    }

    #[test]
    fn test_has_cfg_test() {
        let attrs: Vec<Attribute> = vec![parse_quote!(#[cfg(test)])];
        assert!(has_cfg_test(&attrs));

        let attrs: Vec<Attribute> = vec![parse_quote!(#[cfg(all(test, feature = "x"))])];
        assert!(has_cfg_test(&attrs));

        let attrs: Vec<Attribute> = vec![parse_quote!(#[cfg(feature = "testing")])];
        assert!(!has_cfg_test(&attrs));
    }
}
